#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use donation_bridge::bridge::channel::WorkerEndpoint;
use donation_bridge::bridge::protocol::{Command, CommandBody, HostFrame, InitContext, Response, WorkerFrame};
use donation_bridge::collab::{
    ChannelPresenter, DonationPayload, FlowReport, PresenterEvent, RenderDirective, ScriptPackage,
    SubmissionError, SubmissionSink,
};
use donation_bridge::{
    BridgeConfig, FlowController, FlowSetup, InProcessSpawner, MemoryStore, SessionId, SessionLink,
    SessionOutcome, SessionStore, WorkerConfig, WorkerError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Records every payload; fails the first `failures` attempts.
#[derive(Default)]
pub struct RecordingSink {
    pub payloads: Mutex<Vec<DonationPayload>>,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingSink {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<DonationPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubmissionSink for RecordingSink {
    async fn submit(&self, payload: &DonationPayload) -> Result<(), SubmissionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SubmissionError("storage offline".to_string()));
        }
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

pub struct Harness {
    pub link: SessionLink,
    pub events: UnboundedReceiver<PresenterEvent>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<dyn SessionStore>,
    pub spawner: Arc<InProcessSpawner>,
    task: JoinHandle<SessionOutcome>,
}

impl Harness {
    pub async fn outcome(&mut self) -> SessionOutcome {
        (&mut self.task).await.unwrap()
    }

    /// Drop the flow mid-session, as if the host process died.
    pub async fn abort(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    pub async fn next_directive(&mut self) -> RenderDirective {
        loop {
            match self.events.recv().await.expect("presenter closed") {
                PresenterEvent::Directive(directive) => return directive,
                PresenterEvent::Report(_) => continue,
            }
        }
    }

    pub async fn next_report(&mut self) -> FlowReport {
        loop {
            match self.events.recv().await.expect("presenter closed") {
                PresenterEvent::Report(report) => return report,
                PresenterEvent::Directive(_) => continue,
            }
        }
    }

    /// Every report emitted so far, without waiting.
    pub fn drain_reports(&mut self) -> Vec<FlowReport> {
        let mut reports = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let PresenterEvent::Report(report) = event {
                reports.push(report);
            }
        }
        reports
    }
}

/// Short grace and backoff so teardown does not dominate test time.
pub fn test_config() -> BridgeConfig {
    BridgeConfig::default()
        .with_shutdown_grace(Duration::from_millis(200))
        .with_restart_backoff(Duration::from_millis(10))
        .with_submit_backoff(Duration::from_millis(10))
}

/// Workers without heartbeats, so only Commands reset the watchdog.
pub fn quiet_worker() -> WorkerConfig {
    WorkerConfig::default().with_heartbeat_interval(Duration::ZERO)
}

pub fn start(spawner: InProcessSpawner, config: BridgeConfig) -> Harness {
    start_with_sink(spawner, config, RecordingSink::default())
}

pub fn start_with_sink(spawner: InProcessSpawner, config: BridgeConfig, sink: RecordingSink) -> Harness {
    start_full(spawner, config, sink, Arc::new(MemoryStore::new()), None)
}

pub fn start_full(
    spawner: InProcessSpawner,
    config: BridgeConfig,
    sink: RecordingSink,
    store: Arc<dyn SessionStore>,
    session_id: Option<SessionId>,
) -> Harness {
    let spawner = Arc::new(spawner);
    let sink = Arc::new(sink);
    let (presenter, events) = ChannelPresenter::new();

    let mut setup = FlowSetup::new(
        ScriptPackage::new("study-1", "in-process"),
        spawner.clone(),
        store.clone(),
        Arc::new(presenter),
        sink.clone(),
    )
    .with_config(config);
    if let Some(id) = session_id {
        setup = setup.with_session_id(id);
    }
    let (controller, link) = FlowController::new(setup);
    let task = tokio::spawn(controller.run());

    Harness {
        link,
        events,
        sink,
        store,
        spawner,
        task,
    }
}

/// Read the `init` frame a raw worker receives first.
pub async fn expect_init(endpoint: &mut WorkerEndpoint) -> Result<InitContext, WorkerError> {
    match endpoint.recv().await? {
        HostFrame::Init { context } => Ok(context),
        _ => Err(WorkerError::MissingInit("not init")),
    }
}

pub async fn send_command(
    endpoint: &mut WorkerEndpoint,
    sequence: u64,
    body: CommandBody,
) -> Result<(), WorkerError> {
    let raw = Command::new(sequence, body).encode()?;
    endpoint.send(WorkerFrame::Command(raw)).await?;
    Ok(())
}

pub async fn expect_response(endpoint: &mut WorkerEndpoint) -> Result<Response, WorkerError> {
    match endpoint.recv().await? {
        HostFrame::Response(response) => Ok(response),
        HostFrame::Shutdown => Err(WorkerError::Shutdown),
        HostFrame::Init { .. } => Err(WorkerError::MissingInit("repeated init")),
    }
}

/// Keep reading until the host shuts the worker down or hangs up.
pub async fn wait_for_shutdown(endpoint: &mut WorkerEndpoint) -> Result<(), WorkerError> {
    while let Ok(frame) = endpoint.recv().await {
        if matches!(frame, HostFrame::Shutdown) {
            break;
        }
    }
    Ok(())
}
