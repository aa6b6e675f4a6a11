//! End-to-end flows against in-process workers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use donation_bridge::bridge::protocol::{
    CommandBody, DataRequest, DoneSummary, Fragment, HostFrame, LogLevel, LogRecord, Payload,
    PayloadKind, ProtocolError, RawCommand, RenderPage, Response, ResponseStatus, WorkerFrame,
};
use donation_bridge::collab::{
    DirectiveBody, FlowReport, PresentError, Presenter, RenderDirective, ScriptPackage,
};
use donation_bridge::{
    BridgeConfig, FlowController, FlowError, FlowSetup, FlowState, InProcessSpawner, MemoryStore,
    ProtocolViolation, Script, ScriptContext, SessionLink, WorkerError,
};
use serde_json::{Value, json};

struct ConsentScript;

#[async_trait]
impl Script for ConsentScript {
    async fn run(&mut self, ctx: &mut ScriptContext) -> Result<Option<Value>, WorkerError> {
        let answer = ctx
            .render(
                json!({"title": "Consent"}),
                vec![PayloadKind::True, PayloadKind::False],
            )
            .await?;
        if answer != Payload::True {
            return Err(WorkerError::script("declined", "participant declined"));
        }
        ctx.store("F1", json!({"visits": 12})).await?;
        Ok(Some(json!({"pages": 1})))
    }
}

fn consent_spawner() -> InProcessSpawner {
    InProcessSpawner::for_script(|| ConsentScript, quiet_worker())
}

struct AgeScript;

#[async_trait]
impl Script for AgeScript {
    async fn run(&mut self, ctx: &mut ScriptContext) -> Result<Option<Value>, WorkerError> {
        let schema = json!({
            "type": "object",
            "properties": {"age": {"type": "integer", "minimum": 0}},
            "required": ["age"]
        });
        let answer = ctx.request_data(json!({"field": "age"}), Some(schema)).await?;
        let Payload::Json { value } = answer else {
            return Err(WorkerError::script("bad_answer", "expected json"));
        };
        ctx.log(LogLevel::Info, "age received").await?;
        ctx.store("age", value).await?;
        Ok(None)
    }
}

fn render(page: Value) -> CommandBody {
    CommandBody::Render(RenderPage {
        page,
        accepts: vec![],
    })
}

fn store_data(id: &str, data: Value) -> CommandBody {
    CommandBody::StoreData(Fragment::new(id, data))
}

fn done() -> CommandBody {
    CommandBody::Done(DoneSummary::default())
}

fn violation(outcome_error: Option<FlowError>) -> ProtocolViolation {
    match outcome_error {
        Some(FlowError::ProtocolViolation(v)) => v,
        other => panic!("expected a protocol violation, got {other:?}"),
    }
}

#[tokio::test]
async fn consent_flow_completes_with_stored_fragment() {
    let mut h = start(consent_spawner(), test_config());
    let id = h.link.id();

    let directive = h.next_directive().await;
    assert_eq!(directive.session_id, id);
    assert_eq!(directive.sequence, 1);
    assert_eq!(
        directive.body,
        DirectiveBody::Render {
            page: json!({"title": "Consent"}),
            accepts: vec![PayloadKind::True, PayloadKind::False],
        }
    );
    assert_eq!(h.link.state(), FlowState::AwaitingUserResponse);

    h.link.respond(1, Payload::True).await.unwrap();
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Completed);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.fragments, 1);
    assert_eq!(outcome.restarts, 0);

    let submitted = h.sink.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].session_id, id);
    assert_eq!(submitted[0].study_id, "study-1");
    assert_eq!(
        submitted[0].fragments,
        vec![Fragment::new("F1", json!({"visits": 12}))]
    );
    assert_eq!(submitted[0].summary, Some(json!({"pages": 1})));

    assert!(h.store.is_sealed(id).await.unwrap());
    assert_eq!(h.link.state(), FlowState::Completed);
    assert!(matches!(
        h.drain_reports().last(),
        Some(FlowReport::Terminal {
            state: FlowState::Completed,
            code: None,
            ..
        })
    ));
}

#[tokio::test]
async fn every_command_gets_exactly_one_response() {
    let received: Arc<Mutex<Vec<Response>>> = Arc::default();
    let spawner = {
        let received = received.clone();
        InProcessSpawner::new(move |mut ep| {
            let received = received.clone();
            async move {
                expect_init(&mut ep).await?;
                let bodies = [
                    render(json!({"step": 1})),
                    store_data("a", json!(1)),
                    CommandBody::Log(LogRecord {
                        level: LogLevel::Warn,
                        message: "halfway".to_string(),
                    }),
                ];
                for (sequence, body) in (1..).zip(bodies) {
                    send_command(&mut ep, sequence, body).await?;
                    let response = expect_response(&mut ep).await?;
                    received.lock().unwrap().push(response);
                }
                send_command(&mut ep, 4, done()).await?;

                // Anything after `done` other than shutdown is a stray response.
                while let Ok(frame) = ep.recv().await {
                    match frame {
                        HostFrame::Response(response) => received.lock().unwrap().push(response),
                        HostFrame::Shutdown => break,
                        HostFrame::Init { .. } => {}
                    }
                }
                Ok::<_, WorkerError>(())
            }
        })
    };

    let mut h = start(spawner, test_config());
    h.next_directive().await;
    h.link.respond(1, Payload::string("next")).await.unwrap();
    let outcome = h.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");

    let received = received.lock().unwrap().clone();
    assert_eq!(
        received,
        vec![
            Response::ok(1, Payload::string("next")),
            Response::ack(2),
            Response::ack(3),
        ]
    );
}

#[tokio::test]
async fn command_while_request_pending_fails_session() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        send_command(&mut ep, 1, render(json!({}))).await?;
        send_command(&mut ep, 2, store_data("sneaky", json!(true))).await?;
        wait_for_shutdown(&mut ep).await
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(
        violation(outcome.error),
        ProtocolViolation::ConcurrentRequest { pending: 1, got: 2 }
    );
    assert!(h.store.snapshot(h.link.id()).await.unwrap().is_empty());
    assert_eq!(h.sink.attempts(), 0);
}

#[tokio::test]
async fn out_of_order_sequence_fails_session() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        send_command(&mut ep, 1, store_data("a", json!(1))).await?;
        expect_response(&mut ep).await?;
        send_command(&mut ep, 3, store_data("b", json!(2))).await?;
        send_command(&mut ep, 4, done()).await?;
        wait_for_shutdown(&mut ep).await
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(
        violation(outcome.error),
        ProtocolViolation::OutOfOrder {
            expected: 2,
            got: 3
        }
    );
    assert_eq!(h.sink.attempts(), 0);
    assert!(h.store.is_sealed(h.link.id()).await.unwrap());
}

#[tokio::test]
async fn duplicate_sequence_fails_session() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        send_command(&mut ep, 1, store_data("a", json!(1))).await?;
        expect_response(&mut ep).await?;
        send_command(&mut ep, 1, store_data("a", json!(1))).await?;
        wait_for_shutdown(&mut ep).await
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(outcome.code(), Some("protocol_violation"));
    assert_eq!(
        violation(outcome.error),
        ProtocolViolation::DuplicateSequence { sequence: 1 }
    );
}

#[tokio::test]
async fn unknown_command_kind_fails_session() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        ep.send(WorkerFrame::Command(RawCommand {
            sequence: 1,
            kind: "delete-everything".to_string(),
            payload: json!({}),
        }))
        .await?;
        wait_for_shutdown(&mut ep).await
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(
        violation(outcome.error),
        ProtocolViolation::Command(ProtocolError::UnsupportedCommand {
            kind: "delete-everything".to_string()
        })
    );
    assert!(matches!(
        h.drain_reports().last(),
        Some(FlowReport::Terminal { state: FlowState::Failed, code: Some(code), .. })
            if code == "protocol_violation"
    ));
}

#[tokio::test]
async fn invalid_request_schema_fails_session() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        send_command(
            &mut ep,
            1,
            CommandBody::RequestData(DataRequest {
                descriptor: json!("age"),
                schema: Some(json!({"type": 12})),
            }),
        )
        .await?;
        wait_for_shutdown(&mut ep).await
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;
    assert!(matches!(
        violation(outcome.error),
        ProtocolViolation::InvalidSchema { sequence: 1, .. }
    ));
}

#[tokio::test]
async fn cancel_while_awaiting_user_tears_worker_down() {
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let spawner = {
        let seen = seen.clone();
        InProcessSpawner::new(move |mut ep| {
            let seen = seen.clone();
            async move {
                expect_init(&mut ep).await?;
                send_command(&mut ep, 1, render(json!({"title": "Upload"}))).await?;
                loop {
                    let note = match ep.recv().await {
                        Ok(HostFrame::Response(r)) if r.status == ResponseStatus::Cancelled => {
                            "cancelled"
                        }
                        Ok(HostFrame::Response(_)) => "response",
                        Ok(HostFrame::Shutdown) => "shutdown",
                        Ok(HostFrame::Init { .. }) => "init",
                        Err(_) => "closed",
                    };
                    seen.lock().unwrap().push(note);
                    if note == "shutdown" || note == "closed" {
                        return Ok::<_, WorkerError>(());
                    }
                }
            }
        })
    };

    let mut h = start(spawner, test_config());
    h.next_directive().await;
    h.link.cancel();
    let outcome = h.outcome().await;

    assert_eq!(outcome.state, FlowState::Cancelled);
    assert_eq!(outcome.error, Some(FlowError::UserCancelled));
    assert_eq!(h.sink.attempts(), 0);
    assert_eq!(*seen.lock().unwrap(), vec!["cancelled", "shutdown"]);
    // The session log is discarded.
    assert!(h.store.snapshot(h.link.id()).await.is_err());
    assert!(matches!(
        h.drain_reports().last(),
        Some(FlowReport::Terminal { state: FlowState::Cancelled, code: Some(code), .. })
            if code == "user_cancelled"
    ));
}

#[tokio::test]
async fn invalid_responses_are_reported_and_request_stays_pending() {
    let mut h = start(consent_spawner(), test_config());
    h.next_directive().await;

    h.link.respond(1, Payload::string("maybe")).await.unwrap();
    match h.next_report().await {
        FlowReport::InvalidResponse {
            sequence, reason, ..
        } => {
            assert_eq!(sequence, 1);
            assert_eq!(reason, "payload kind string is not one of [true, false]");
        }
        other => panic!("unexpected report {other:?}"),
    }

    h.link.respond(7, Payload::True).await.unwrap();
    assert!(matches!(
        h.next_report().await,
        FlowReport::InvalidResponse { sequence: 7, .. }
    ));
    assert_eq!(h.link.state(), FlowState::AwaitingUserResponse);

    h.link.respond(1, Payload::True).await.unwrap();
    assert!(h.outcome().await.is_completed());
}

#[tokio::test]
async fn request_data_answers_are_validated_against_schema() {
    let mut h = start(
        InProcessSpawner::for_script(|| AgeScript, quiet_worker()),
        test_config(),
    );

    let directive = h.next_directive().await;
    assert!(matches!(
        directive.body,
        DirectiveBody::RequestData { schema: Some(_), .. }
    ));

    h.link
        .respond(1, Payload::json(json!({"age": "old"})))
        .await
        .unwrap();
    assert!(matches!(
        h.next_report().await,
        FlowReport::InvalidResponse { sequence: 1, .. }
    ));

    h.link
        .respond(1, Payload::json(json!({"age": 40})))
        .await
        .unwrap();
    let outcome = h.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(
        h.sink.submitted()[0].fragments,
        vec![Fragment::new("age", json!({"age": 40}))]
    );
}

#[tokio::test]
async fn script_error_fails_without_submitting() {
    let mut h = start(consent_spawner(), test_config());
    h.next_directive().await;
    h.link.respond(1, Payload::False).await.unwrap();

    let outcome = h.outcome().await;
    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(
        outcome.error,
        Some(FlowError::Script {
            code: "declined".to_string(),
            message: "participant declined".to_string(),
        })
    );
    assert_eq!(h.sink.attempts(), 0);
    assert!(h.store.is_sealed(h.link.id()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let config = test_config().with_user_response_timeout(Duration::from_secs(5));
    let mut h = start(consent_spawner(), config);
    h.next_directive().await;

    let outcome = h.outcome().await;
    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(
        outcome.error,
        Some(FlowError::UserResponseTimeout { sequence: 1 })
    );
}

#[tokio::test]
async fn submission_is_retried_until_the_sink_accepts() {
    let mut h = start_with_sink(consent_spawner(), test_config(), RecordingSink::failing(2));
    h.next_directive().await;
    h.link.respond(1, Payload::True).await.unwrap();

    let outcome = h.outcome().await;
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(h.sink.attempts(), 3);
    assert_eq!(h.sink.submitted().len(), 1);
}

#[tokio::test]
async fn exhausted_submission_fails_and_seals() {
    let config = test_config().with_submit_retries(1);
    let mut h = start_with_sink(consent_spawner(), config, RecordingSink::failing(10));
    h.next_directive().await;
    h.link.respond(1, Payload::True).await.unwrap();

    let outcome = h.outcome().await;
    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(
        outcome.error,
        Some(FlowError::SubmissionFailed {
            attempts: 2,
            reason: "storage offline".to_string(),
        })
    );
    assert_eq!(outcome.fragments, 1);
    assert!(h.store.is_sealed(h.link.id()).await.unwrap());
}

#[tokio::test]
async fn free_form_log_and_bare_summary_complete() {
    let spawner = InProcessSpawner::new(|mut ep| async move {
        expect_init(&mut ep).await?;
        ep.send(WorkerFrame::Command(RawCommand {
            sequence: 1,
            kind: "log".to_string(),
            payload: json!("free-form diagnostic"),
        }))
        .await?;
        expect_response(&mut ep).await?;
        send_command(&mut ep, 2, CommandBody::StoreData(Fragment::new("F1", json!(1)))).await?;
        expect_response(&mut ep).await?;
        ep.send(WorkerFrame::Command(RawCommand {
            sequence: 3,
            kind: "done".to_string(),
            payload: json!("all good"),
        }))
        .await?;
        wait_for_shutdown(&mut ep).await
    });

    let mut h = start(spawner, test_config());
    let outcome = h.outcome().await;

    assert!(outcome.is_completed(), "{outcome:?}");
    let submitted = h.sink.submitted();
    assert_eq!(submitted[0].summary, Some(json!("all good")));
    assert_eq!(submitted[0].fragments, vec![Fragment::new("F1", json!(1))]);
}

/// Presenter that never finishes showing a page.
#[derive(Default)]
struct StuckPresenter {
    reports: Mutex<Vec<FlowReport>>,
}

#[async_trait]
impl Presenter for StuckPresenter {
    async fn present(&self, _directive: RenderDirective) -> Result<(), PresentError> {
        std::future::pending().await
    }

    async fn report(&self, report: FlowReport) {
        self.reports.lock().unwrap().push(report);
    }
}

fn start_stuck(
    config: BridgeConfig,
) -> (
    SessionLink,
    Arc<StuckPresenter>,
    Arc<RecordingSink>,
    tokio::task::JoinHandle<donation_bridge::SessionOutcome>,
) {
    let presenter = Arc::new(StuckPresenter::default());
    let sink = Arc::new(RecordingSink::default());
    let setup = FlowSetup::new(
        ScriptPackage::new("study-1", "in-process"),
        Arc::new(consent_spawner()),
        Arc::new(MemoryStore::new()),
        presenter.clone(),
        sink.clone(),
    )
    .with_config(config);
    let (controller, link) = FlowController::new(setup);
    (link, presenter, sink, tokio::spawn(controller.run()))
}

#[tokio::test(start_paused = true)]
async fn stuck_presenter_fails_after_present_timeout() {
    let config = test_config().with_present_timeout(Duration::from_secs(2));
    let (_link, presenter, sink, task) = start_stuck(config);

    let outcome = task.await.unwrap();
    assert_eq!(outcome.state, FlowState::Failed);
    assert_eq!(outcome.code(), Some("presenter_failed"));
    assert_eq!(sink.attempts(), 0);
    assert!(matches!(
        presenter.reports.lock().unwrap().last(),
        Some(FlowReport::Terminal { code: Some(code), .. }) if code == "presenter_failed"
    ));
}

#[tokio::test]
async fn cancel_interrupts_a_stuck_presenter() {
    let config = test_config().with_present_timeout(Duration::from_secs(3600));
    let (link, _presenter, sink, task) = start_stuck(config);

    link.wait_for(|state| state == FlowState::AwaitingUserResponse)
        .await;
    link.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("cancel was not honoured while presenting")
        .unwrap();
    assert_eq!(outcome.state, FlowState::Cancelled);
    assert_eq!(outcome.code(), Some("user_cancelled"));
    assert_eq!(sink.attempts(), 0);
}
