//! Worker restarts, resumption and the restart budget.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use donation_bridge::bridge::protocol::{
    CommandBody, DoneSummary, Fragment, InitContext, LogLevel, LogRecord, Payload, PayloadKind,
    RenderPage,
};
use donation_bridge::collab::FlowReport;
use donation_bridge::{
    FileStore, FlowError, FlowState, InProcessSpawner, MemoryStore, ResumePolicy, Script,
    ScriptContext, SessionId, SessionStore, WorkerConfig, WorkerError,
};
use serde_json::{Value, json};

type Inits = Arc<Mutex<Vec<InitContext>>>;

fn store_data(id: &str, data: Value) -> CommandBody {
    CommandBody::StoreData(Fragment::new(id, data))
}

fn done() -> CommandBody {
    CommandBody::Done(DoneSummary::default())
}

/// First worker stores f1 and f2 then dies; the replacement re-sends f2 with a
/// different body, adds f3 and finishes.
fn crash_after_two_fragments(inits: Inits) -> InProcessSpawner {
    InProcessSpawner::new(move |mut ep| {
        let inits = inits.clone();
        async move {
            let init = expect_init(&mut ep).await?;
            inits.lock().unwrap().push(init.clone());

            if init.generation == 0 {
                send_command(&mut ep, 1, store_data("f1", json!("one"))).await?;
                expect_response(&mut ep).await?;
                send_command(&mut ep, 2, store_data("f2", json!("two"))).await?;
                expect_response(&mut ep).await?;
                // Exit without `done`: the host sees a crash.
                return Ok(());
            }

            let mut sequence = init.next_sequence;
            for (id, data) in [("f2", json!("two, again")), ("f3", json!("three"))] {
                send_command(&mut ep, sequence, store_data(id, data)).await?;
                expect_response(&mut ep).await?;
                sequence += 1;
            }
            send_command(&mut ep, sequence, done()).await?;
            wait_for_shutdown(&mut ep).await
        }
    })
}

#[tokio::test]
async fn restart_resumes_with_acknowledged_fragments() {
    let inits: Inits = Arc::default();
    let mut h = start(crash_after_two_fragments(inits.clone()), test_config());

    let outcome = h.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(outcome.restarts, 1);
    assert_eq!(h.spawner.spawn_count(), 2);

    let inits = inits.lock().unwrap().clone();
    assert_eq!(inits.len(), 2);
    assert!(inits[0].resume.is_none());
    assert_eq!(inits[0].next_sequence, 1);

    let resumed = &inits[1];
    assert_eq!(resumed.generation, 1);
    assert_eq!(resumed.next_sequence, 3);
    let resume = resumed.resume.as_ref().unwrap();
    assert_eq!(
        resume.fragments,
        vec![
            Fragment::new("f1", json!("one")),
            Fragment::new("f2", json!("two")),
        ]
    );
    assert_eq!(resume.last_acknowledged, Some(2));
    assert_eq!(resume.restarts, 1);

    // First write wins for the replayed fragment.
    assert_eq!(
        h.sink.submitted()[0].fragments,
        vec![
            Fragment::new("f1", json!("one")),
            Fragment::new("f2", json!("two")),
            Fragment::new("f3", json!("three")),
        ]
    );

    let restarting: Vec<_> = h
        .drain_reports()
        .into_iter()
        .filter_map(|r| match r {
            FlowReport::Restarting { attempt, cause, .. } => Some((attempt, cause)),
            _ => None,
        })
        .collect();
    assert_eq!(restarting, vec![(1, "worker_crashed".to_string())]);
}

#[tokio::test]
async fn last_fragment_policy_limits_resume_context() {
    let inits: Inits = Arc::default();
    let config = test_config().with_resume_policy(ResumePolicy::LastFragment);
    let mut h = start(crash_after_two_fragments(inits.clone()), config);

    assert!(h.outcome().await.is_completed());
    let inits = inits.lock().unwrap().clone();
    let resume = inits[1].resume.as_ref().unwrap();
    assert_eq!(resume.fragments, vec![Fragment::new("f2", json!("two"))]);
    // The store itself still holds everything.
    assert_eq!(h.sink.submitted()[0].fragments.len(), 3);
}

#[tokio::test]
async fn no_resume_policy_still_marks_restart() {
    let inits: Inits = Arc::default();
    let config = test_config().with_resume_policy(ResumePolicy::None);
    let mut h = start(crash_after_two_fragments(inits.clone()), config);

    assert!(h.outcome().await.is_completed());
    let inits = inits.lock().unwrap().clone();
    let resume = inits[1].resume.as_ref().unwrap();
    assert!(resume.fragments.is_empty());
    assert_eq!(resume.restarts, 1);
}

#[tokio::test]
async fn three_crashes_exhaust_default_budget() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        Ok::<_, WorkerError>(())
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(outcome.restarts, 2);
    assert_eq!(h.spawner.spawn_count(), 3);
    match outcome.error {
        Some(FlowError::RestartBudgetExhausted {
            max_restarts,
            cause,
        }) => {
            assert_eq!(max_restarts, 2);
            assert!(matches!(*cause, FlowError::WorkerCrashed { .. }), "{cause}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(h.sink.attempts(), 0);

    let reports = h.drain_reports();
    let attempts: Vec<u32> = reports
        .iter()
        .filter_map(|r| match r {
            FlowReport::Restarting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(matches!(
        reports.last(),
        Some(FlowReport::Terminal { code: Some(code), .. }) if code == "restart_budget_exhausted"
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_startup_fails_after_budget() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        wait_for_shutdown(&mut ep).await
    });
    let config = test_config().with_startup_timeout(Duration::from_secs(1));

    let mut h = start(spawner, config);
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(h.spawner.spawn_count(), 3);
    let err = outcome.error.unwrap();
    assert_eq!(err.code(), "restart_budget_exhausted");
    assert_eq!(err.root_cause(), &FlowError::WorkerStartupTimeout);
}

#[tokio::test(start_paused = true)]
async fn silent_worker_is_replaced() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        let init = expect_init(&mut ep).await?;
        if init.generation == 0 {
            send_command(
                &mut ep,
                1,
                CommandBody::Log(LogRecord {
                    level: LogLevel::Debug,
                    message: "loading".to_string(),
                }),
            )
            .await?;
            expect_response(&mut ep).await?;
            // No heartbeats, no commands.
            return wait_for_shutdown(&mut ep).await;
        }
        send_command(&mut ep, init.next_sequence, done()).await?;
        wait_for_shutdown(&mut ep).await
    });
    let config = test_config().with_quiet_period(Duration::from_secs(3));

    let mut h = start(spawner, config);
    let outcome = h.outcome().await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(outcome.restarts, 1);
    assert!(h.drain_reports().iter().any(|r| matches!(
        r,
        FlowReport::Restarting { cause, .. } if cause == "worker_unresponsive"
    )));
}

struct PatientScript;

#[async_trait]
impl Script for PatientScript {
    async fn run(&mut self, ctx: &mut ScriptContext) -> Result<Option<Value>, WorkerError> {
        ctx.render(json!({"title": "Take your time"}), vec![PayloadKind::True])
            .await?;
        Ok(None)
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_a_waiting_worker_alive() {
    let spawner = InProcessSpawner::for_script(
        || PatientScript,
        WorkerConfig::default().with_heartbeat_interval(Duration::from_secs(1)),
    );
    let config = test_config().with_quiet_period(Duration::from_secs(3));

    let mut h = start(spawner, config);
    h.next_directive().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.link.state(), FlowState::AwaitingUserResponse);

    h.link.respond(1, Payload::True).await.unwrap();
    let outcome = h.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(outcome.restarts, 0);
}

#[tokio::test]
async fn host_retry_replaces_worker() {
    let mut h = start(
        InProcessSpawner::for_script(|| PatientScript, quiet_worker()),
        test_config(),
    );
    assert_eq!(h.next_directive().await.sequence, 1);

    h.link.retry().await.unwrap();
    match h.next_report().await {
        FlowReport::Restarting { attempt, cause, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(cause, "retry_requested");
        }
        other => panic!("unexpected report {other:?}"),
    }

    // The replacement continues numbering after the last accepted Command.
    let directive = h.next_directive().await;
    assert_eq!(directive.sequence, 2);
    h.link.respond(2, Payload::True).await.unwrap();

    let outcome = h.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(outcome.restarts, 1);
    assert_eq!(h.spawner.spawn_count(), 2);
}

#[tokio::test]
async fn durable_log_survives_host_restart() {
    let dir = tempfile::tempdir().unwrap();
    let session_id = SessionId::new();

    let inits: Inits = Arc::default();
    let spawner = |inits: Inits| {
        InProcessSpawner::new(move |mut ep| {
            let inits = inits.clone();
            async move {
                let init = expect_init(&mut ep).await?;
                inits.lock().unwrap().push(init.clone());
                let resumed = init.resume.as_ref().is_some_and(|r| r.has_fragment("f1"));
                let mut sequence = init.next_sequence;
                if !resumed {
                    send_command(&mut ep, sequence, store_data("f1", json!(1))).await?;
                    expect_response(&mut ep).await?;
                    sequence += 1;
                    // Park on a page the participant never answers.
                    send_command(
                        &mut ep,
                        sequence,
                        CommandBody::Render(RenderPage {
                            page: json!({}),
                            accepts: vec![],
                        }),
                    )
                    .await?;
                    return wait_for_shutdown(&mut ep).await;
                }
                send_command(&mut ep, sequence, store_data("f2", json!(2))).await?;
                expect_response(&mut ep).await?;
                send_command(&mut ep, sequence + 1, done()).await?;
                wait_for_shutdown(&mut ep).await
            }
        })
    };

    let mut first = start_full(
        spawner(inits.clone()),
        test_config(),
        RecordingSink::default(),
        Arc::new(FileStore::new(dir.path())),
        Some(session_id),
    );
    first.next_directive().await;
    first.abort().await;

    let mut second = start_full(
        spawner(inits.clone()),
        test_config(),
        RecordingSink::default(),
        Arc::new(FileStore::new(dir.path())),
        Some(session_id),
    );
    let outcome = second.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");

    let inits = inits.lock().unwrap().clone();
    assert_eq!(inits.len(), 2);
    let resume = inits[1].resume.as_ref().unwrap();
    assert_eq!(resume.fragments, vec![Fragment::new("f1", json!(1))]);
    assert_eq!(inits[1].generation, 0);

    assert_eq!(
        second.sink.submitted()[0].fragments,
        vec![Fragment::new("f1", json!(1)), Fragment::new("f2", json!(2))]
    );
}

#[tokio::test]
async fn sealed_session_is_never_submitted_twice() {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let session_id = SessionId::new();
    let only_done = || {
        InProcessSpawner::new(|mut ep| async move {
            let init = expect_init(&mut ep).await?;
            send_command(&mut ep, init.next_sequence, store_data("f1", json!(1))).await?;
            expect_response(&mut ep).await?;
            send_command(&mut ep, init.next_sequence + 1, done()).await?;
            wait_for_shutdown(&mut ep).await
        })
    };

    let mut first = start_full(
        only_done(),
        test_config(),
        RecordingSink::default(),
        store.clone(),
        Some(session_id),
    );
    assert!(first.outcome().await.is_completed());
    assert_eq!(first.sink.attempts(), 1);
    assert!(store.is_sealed(session_id).await.unwrap());

    let mut second = start_full(
        only_done(),
        test_config(),
        RecordingSink::default(),
        store.clone(),
        Some(session_id),
    );
    let outcome = second.outcome().await;
    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(outcome.code(), Some("session_sealed"));
    assert_eq!(outcome.fragments, 1);
    assert_eq!(second.spawner.spawn_count(), 0);
    assert_eq!(second.sink.attempts(), 0);
    assert!(matches!(
        second.drain_reports().last(),
        Some(FlowReport::Terminal { code: Some(code), .. }) if code == "session_sealed"
    ));
}
