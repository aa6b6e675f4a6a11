//! The flow controller: one session's state machine.
//!
//! A single `select!` loop owns the worker handle, the pending request and the
//! session bookkeeping. Worker events, host input, deadlines and cancellation
//! all arrive there, so nothing on the hot path needs a lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    Command, CommandBody, CommandKind, InitContext, LogLevel, LogRecord, Payload, PayloadKind,
    Response, ResumeContext, SessionId,
};
use crate::collab::{
    DirectiveBody, DonationPayload, FlowReport, Presenter, RenderDirective, ScriptPackage,
    SubmissionSink,
};
use crate::config::{BridgeConfig, ResumePolicy};
use crate::error::{FlowError, ProtocolViolation};
use crate::session::{FlowState, HostInput, Session, SessionLink, SessionOutcome, UserResponse};
use crate::store::{AppendOutcome, SessionStore};
use crate::version::BRIDGE_VERSION;
use crate::worker_host::{InvalidFrame, WorkerEvent, WorkerHandle, WorkerSpawner, WorkerSupervisor};

const INPUT_BUFFER: usize = 16;

/// Far-future stand-in for deadlines that would overflow `Instant`.
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Everything a flow needs to run one session.
pub struct FlowSetup {
    pub config: Arc<BridgeConfig>,
    pub script: ScriptPackage,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub store: Arc<dyn SessionStore>,
    pub presenter: Arc<dyn Presenter>,
    pub sink: Arc<dyn SubmissionSink>,
    /// Reuse an existing session id, e.g. to resume a durable log.
    pub session_id: Option<SessionId>,
}

impl FlowSetup {
    pub fn new(
        script: ScriptPackage,
        spawner: Arc<dyn WorkerSpawner>,
        store: Arc<dyn SessionStore>,
        presenter: Arc<dyn Presenter>,
        sink: Arc<dyn SubmissionSink>,
    ) -> Self {
        Self {
            config: Arc::new(BridgeConfig::default()),
            script,
            spawner,
            store,
            presenter,
            sink,
            session_id: None,
        }
    }

    pub fn with_config(mut self, config: impl Into<Arc<BridgeConfig>>) -> Self {
        self.config = config.into();
        self
    }

    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }
}

/// What a participant response must look like to satisfy a pending request.
struct Expectation {
    kind: CommandKind,
    accepts: Vec<PayloadKind>,
    schema: Option<jsonschema::Validator>,
}

impl Expectation {
    fn check(&self, payload: &Payload) -> Result<(), String> {
        if let Some(validator) = &self.schema {
            let Payload::Json { value } = payload else {
                return Err(format!(
                    "expected a json payload, got {}",
                    payload.kind().as_str()
                ));
            };
            let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
            if errors.is_empty() {
                return Ok(());
            }
            return Err(format!("schema validation failed: {}", errors.join("; ")));
        }

        let kind = payload.kind();
        if self.accepts.is_empty() {
            if self.kind == CommandKind::RequestData && kind == PayloadKind::Void {
                return Err("request-data needs a payload".to_string());
            }
            return Ok(());
        }
        if self.accepts.contains(&kind) {
            Ok(())
        } else {
            let accepted: Vec<&str> = self.accepts.iter().map(PayloadKind::as_str).collect();
            Err(format!(
                "payload kind {} is not one of [{}]",
                kind.as_str(),
                accepted.join(", ")
            ))
        }
    }
}

/// The single interactive Command currently waiting for the participant.
struct PendingRequest {
    sequence: u64,
    issued_at: Instant,
    deadline: Instant,
    expectation: Expectation,
}

/// Sequence rule: strictly `last + 1`; anything at or below `last` is a replay.
fn check_sequence(last: u64, sequence: u64) -> Result<(), ProtocolViolation> {
    if sequence > 0 && sequence <= last {
        return Err(ProtocolViolation::DuplicateSequence { sequence });
    }
    if sequence != last + 1 {
        return Err(ProtocolViolation::OutOfOrder {
            expected: last + 1,
            got: sequence,
        });
    }
    Ok(())
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FOREVER)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn emit_script_log(session_id: SessionId, sequence: u64, record: &LogRecord) {
    let message = record.message.as_str();
    match record.level {
        LogLevel::Trace => {
            tracing::trace!(target: "donation_bridge::script", %session_id, sequence, "{message}")
        }
        LogLevel::Debug => {
            tracing::debug!(target: "donation_bridge::script", %session_id, sequence, "{message}")
        }
        LogLevel::Info => {
            tracing::info!(target: "donation_bridge::script", %session_id, sequence, "{message}")
        }
        LogLevel::Warn => {
            tracing::warn!(target: "donation_bridge::script", %session_id, sequence, "{message}")
        }
        LogLevel::Error => {
            tracing::error!(target: "donation_bridge::script", %session_id, sequence, "{message}")
        }
    }
}

enum LoopEvent {
    Cancelled,
    Input(Option<HostInput>),
    Worker(WorkerEvent),
    Deadline,
}

/// What the loop does after handling one event.
enum Step {
    Continue,
    Restart(FlowError),
    Finalize(Option<Value>),
    Cancel,
    Fail(FlowError),
}

/// Why a restart or submission gave up.
enum Stop {
    Cancel,
    Fail(FlowError),
}

/// Drives one session from `Idle` to a terminal state.
pub struct FlowController {
    config: Arc<BridgeConfig>,
    session: Session,
    script: ScriptPackage,
    supervisor: WorkerSupervisor,
    store: Arc<dyn SessionStore>,
    presenter: Arc<dyn Presenter>,
    sink: Arc<dyn SubmissionSink>,
    inputs: mpsc::Receiver<HostInput>,
    inputs_open: bool,
    cancel: CancellationToken,
    state_tx: watch::Sender<FlowState>,
    pending: Option<PendingRequest>,
    startup_deadline: Option<Instant>,
}

impl FlowController {
    pub fn new(setup: FlowSetup) -> (Self, SessionLink) {
        let FlowSetup {
            config,
            script,
            spawner,
            store,
            presenter,
            sink,
            session_id,
        } = setup;

        let id = session_id.unwrap_or_default();
        let (input_tx, inputs) = mpsc::channel(INPUT_BUFFER);
        let (state_tx, state_rx) = watch::channel(FlowState::Idle);
        let cancel = CancellationToken::new();
        let link = SessionLink::new(id, input_tx, cancel.clone(), state_rx);

        let controller = Self {
            session: Session::new(id, script.study_id.clone()),
            supervisor: WorkerSupervisor::new(spawner, Arc::clone(&config)),
            config,
            script,
            store,
            presenter,
            sink,
            inputs,
            inputs_open: true,
            cancel,
            state_tx,
            pending: None,
            startup_deadline: None,
        };
        (controller, link)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> SessionOutcome {
        let session_id = self.session.id;
        tracing::info!(
            %session_id,
            study_id = %self.session.study_id,
            "Session starting"
        );

        if let Err(e) = self.store.open(session_id, &self.session.study_id).await {
            return self.fail(None, e.into()).await;
        }
        match self.store.is_sealed(session_id).await {
            Ok(false) => {}
            Ok(true) => return self.fail(None, FlowError::SessionSealed).await,
            Err(e) => return self.fail(None, e.into()).await,
        }

        let mut worker = match self.start_worker().await {
            Ok(worker) => worker,
            Err(cause) if cause.is_recoverable() => match self.restart(None, cause).await {
                Ok(worker) => worker,
                Err(stop) => return self.stop(stop).await,
            },
            Err(e) => return self.fail(None, e).await,
        };

        loop {
            match self.step(&mut worker).await {
                Step::Continue => {}
                Step::Restart(cause) => match self.restart(Some(worker), cause).await {
                    Ok(replacement) => worker = replacement,
                    Err(stop) => return self.stop(stop).await,
                },
                Step::Finalize(summary) => return self.finalize(worker, summary).await,
                Step::Cancel => return self.cancelled(Some(worker)).await,
                Step::Fail(e) => return self.fail(Some(worker), e).await,
            }
        }
    }

    fn transition(&mut self, next: FlowState) {
        if self.session.state == next {
            return;
        }
        tracing::debug!(
            session_id = %self.session.id,
            from = %self.session.state,
            to = %next,
            "Flow state change"
        );
        self.session.state = next;
        self.state_tx.send_replace(next);
    }

    async fn report(&self, report: FlowReport) {
        if tokio::time::timeout(self.config.present_timeout, self.presenter.report(report))
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.session.id, "Presenter report timed out");
        }
    }

    async fn init_context(&self) -> Result<InitContext, FlowError> {
        let stored = self.store.snapshot(self.session.id).await?;
        let resuming = self.session.generation > 0 || !stored.is_empty();

        let fragments = match self.config.resume_policy {
            ResumePolicy::Full => stored,
            ResumePolicy::LastFragment => stored.into_iter().last().into_iter().collect(),
            ResumePolicy::None => Vec::new(),
        };

        Ok(InitContext {
            session_id: self.session.id,
            study_id: self.session.study_id.clone(),
            locale: self
                .script
                .locale
                .clone()
                .unwrap_or_else(|| self.config.locale.clone()),
            host_version: BRIDGE_VERSION.to_string(),
            generation: self.session.generation,
            next_sequence: self.session.next_sequence(),
            resume: resuming.then(|| ResumeContext {
                fragments,
                last_acknowledged: self.session.last_acknowledged,
                restarts: self.session.restarts,
            }),
        })
    }

    async fn start_worker(&mut self) -> Result<WorkerHandle, FlowError> {
        self.transition(FlowState::Starting);
        let context = self.init_context().await?;
        let resumed = context.resume.as_ref().map_or(0, |r| r.fragments.len());

        let worker = self
            .supervisor
            .spawn(&self.script, context)
            .await
            .map_err(|e| FlowError::WorkerCrashed {
                reason: format!("spawn failed: {e}"),
            })?;

        tracing::debug!(
            session_id = %self.session.id,
            worker_id = %worker.id(),
            generation = worker.generation(),
            resumed_fragments = resumed,
            "Waiting for first command"
        );
        self.startup_deadline = Some(deadline_after(self.config.startup_timeout));
        Ok(worker)
    }

    /// Replace the worker, spending restart budget until a spawn succeeds.
    async fn restart(
        &mut self,
        old: Option<WorkerHandle>,
        cause: FlowError,
    ) -> Result<WorkerHandle, Stop> {
        if let Some(mut old) = old {
            self.supervisor.terminate(&mut old).await;
        }
        if let Some(pending) = self.pending.take() {
            tracing::debug!(
                session_id = %self.session.id,
                sequence = pending.sequence,
                "Discarding pending request of replaced worker"
            );
        }
        self.startup_deadline = None;

        let session_id = self.session.id;
        let max_restarts = self.config.max_restarts;
        let mut cause = cause;
        loop {
            if self.session.restarts >= max_restarts {
                tracing::error!(
                    %session_id,
                    max_restarts,
                    cause = %cause,
                    "Restart budget exhausted"
                );
                return Err(Stop::Fail(FlowError::RestartBudgetExhausted {
                    max_restarts,
                    cause: Box::new(cause),
                }));
            }

            self.session.restarts += 1;
            self.session.generation += 1;
            let attempt = self.session.restarts;
            tracing::warn!(
                %session_id,
                attempt,
                code = cause.code(),
                cause = %cause,
                "Restarting worker"
            );
            self.transition(FlowState::Restarting);
            self.report(FlowReport::Restarting {
                session_id,
                attempt,
                cause: cause.code().to_string(),
            })
            .await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancel),
                _ = tokio::time::sleep(self.config.restart_backoff) => {}
            }

            match self.start_worker().await {
                Ok(worker) => return Ok(worker),
                Err(e) if e.is_recoverable() => cause = e,
                Err(e) => return Err(Stop::Fail(e)),
            }
        }
    }

    async fn step(&mut self, worker: &mut WorkerHandle) -> Step {
        let deadline = match self.session.state {
            FlowState::Starting => self.startup_deadline,
            FlowState::AwaitingUserResponse => self.pending.as_ref().map(|p| p.deadline),
            _ => None,
        };

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => LoopEvent::Cancelled,
            event = worker.next_event() => LoopEvent::Worker(event),
            input = self.inputs.recv(), if self.inputs_open => LoopEvent::Input(input),
            _ = sleep_until_deadline(deadline) => LoopEvent::Deadline,
        };

        match event {
            LoopEvent::Cancelled => Step::Cancel,
            LoopEvent::Worker(event) => self.on_worker_event(worker, event).await,
            LoopEvent::Input(Some(HostInput::Respond(response))) => {
                self.on_user_response(worker, response).await
            }
            LoopEvent::Input(Some(HostInput::Retry)) => {
                tracing::info!(session_id = %self.session.id, "Host requested a retry");
                Step::Restart(FlowError::RetryRequested)
            }
            LoopEvent::Input(None) => {
                tracing::debug!(session_id = %self.session.id, "Host input closed");
                self.inputs_open = false;
                Step::Continue
            }
            LoopEvent::Deadline => self.on_deadline(),
        }
    }

    fn on_deadline(&mut self) -> Step {
        match self.session.state {
            FlowState::Starting => {
                tracing::warn!(
                    session_id = %self.session.id,
                    timeout = ?self.config.startup_timeout,
                    "Worker sent no command before the startup deadline"
                );
                Step::Restart(FlowError::WorkerStartupTimeout)
            }
            FlowState::AwaitingUserResponse => match &self.pending {
                Some(pending) => Step::Fail(FlowError::UserResponseTimeout {
                    sequence: pending.sequence,
                }),
                None => Step::Continue,
            },
            _ => Step::Continue,
        }
    }

    async fn on_worker_event(&mut self, worker: &mut WorkerHandle, event: WorkerEvent) -> Step {
        match event {
            WorkerEvent::Command(command) => self.on_command(worker, command).await,
            WorkerEvent::Invalid(InvalidFrame::Protocol(e)) => {
                Step::Fail(ProtocolViolation::Command(e).into())
            }
            WorkerEvent::Invalid(InvalidFrame::Channel(e)) => {
                Step::Fail(ProtocolViolation::Frame(e).into())
            }
            WorkerEvent::Unresponsive { silent_for } => {
                tracing::warn!(
                    session_id = %self.session.id,
                    worker_id = %worker.id(),
                    ?silent_for,
                    "Worker unresponsive"
                );
                Step::Restart(FlowError::WorkerUnresponsive)
            }
            WorkerEvent::Closed => {
                let reason = worker
                    .exit_status()
                    .unwrap_or_else(|| "channel closed".to_string());
                Step::Restart(FlowError::WorkerCrashed { reason })
            }
        }
    }

    async fn on_command(&mut self, worker: &mut WorkerHandle, command: Command) -> Step {
        let session_id = self.session.id;
        let sequence = command.sequence;
        let kind = command.kind();

        if let Some(pending) = &self.pending {
            return Step::Fail(
                ProtocolViolation::ConcurrentRequest {
                    pending: pending.sequence,
                    got: sequence,
                }
                .into(),
            );
        }
        if let Err(violation) = check_sequence(self.session.last_sequence, sequence) {
            return Step::Fail(violation.into());
        }

        self.session.last_sequence = sequence;
        if self.session.state == FlowState::Starting {
            self.startup_deadline = None;
            self.transition(FlowState::Running);
        }
        tracing::debug!(%session_id, sequence, %kind, "Command accepted");

        match command.body {
            CommandBody::Render(render) => {
                let expectation = Expectation {
                    kind,
                    accepts: render.accepts.clone(),
                    schema: None,
                };
                let body = DirectiveBody::Render {
                    page: render.page,
                    accepts: render.accepts,
                };
                self.await_user(sequence, expectation, body).await
            }
            CommandBody::RequestData(request) => {
                let schema = match request.schema.as_ref().map(jsonschema::validator_for).transpose()
                {
                    Ok(schema) => schema,
                    Err(e) => {
                        return Step::Fail(
                            ProtocolViolation::InvalidSchema {
                                sequence,
                                reason: e.to_string(),
                            }
                            .into(),
                        );
                    }
                };
                let expectation = Expectation {
                    kind,
                    accepts: Vec::new(),
                    schema,
                };
                let body = DirectiveBody::RequestData {
                    descriptor: request.descriptor,
                    schema: request.schema,
                };
                self.await_user(sequence, expectation, body).await
            }
            CommandBody::StoreData(fragment) => {
                let fragment_id = fragment.id.clone();
                match self.store.append(session_id, fragment).await {
                    Ok(AppendOutcome::Appended) => {
                        tracing::debug!(%session_id, sequence, %fragment_id, "Fragment stored");
                    }
                    Ok(AppendOutcome::Duplicate) => {
                        tracing::debug!(
                            %session_id,
                            sequence,
                            %fragment_id,
                            "Fragment already stored, acknowledging replay"
                        );
                    }
                    Err(e) => return Step::Fail(e.into()),
                }
                self.acknowledge(worker, sequence).await
            }
            CommandBody::Log(record) => {
                emit_script_log(session_id, sequence, &record);
                self.acknowledge(worker, sequence).await
            }
            CommandBody::Done(done) => Step::Finalize(done.summary),
            CommandBody::Error(failure) => Step::Fail(FlowError::Script {
                code: failure.code,
                message: failure.message,
            }),
        }
    }

    async fn await_user(
        &mut self,
        sequence: u64,
        expectation: Expectation,
        body: DirectiveBody,
    ) -> Step {
        self.pending = Some(PendingRequest {
            sequence,
            issued_at: Instant::now(),
            deadline: deadline_after(self.config.user_response_timeout),
            expectation,
        });
        self.transition(FlowState::AwaitingUserResponse);

        let directive = RenderDirective {
            session_id: self.session.id,
            sequence,
            body,
        };
        let timeout = self.config.present_timeout;
        let presented = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Cancel,
            presented = tokio::time::timeout(timeout, self.presenter.present(directive)) => presented,
        };
        match presented {
            Ok(Ok(())) => Step::Continue,
            Ok(Err(e)) => Step::Fail(FlowError::Presenter(e.0)),
            Err(_) => Step::Fail(FlowError::Presenter(format!(
                "present timed out after {timeout:?}"
            ))),
        }
    }

    async fn acknowledge(&mut self, worker: &mut WorkerHandle, sequence: u64) -> Step {
        match self.deliver(worker, Response::ack(sequence)).await {
            Ok(()) => {
                self.session.last_acknowledged = Some(sequence);
                Step::Continue
            }
            Err(cause) => Step::Restart(cause),
        }
    }

    /// Send a Response, treating a stuck pipe like a silent worker.
    async fn deliver(&self, worker: &mut WorkerHandle, response: Response) -> Result<(), FlowError> {
        let sequence = response.sequence;
        match tokio::time::timeout(self.config.quiet_period, worker.send_response(response)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FlowError::WorkerCrashed {
                reason: format!("response {sequence} not delivered: {e}"),
            }),
            Err(_) => Err(FlowError::WorkerUnresponsive),
        }
    }

    async fn reject_response(&self, sequence: u64, reason: String) {
        tracing::warn!(
            session_id = %self.session.id,
            sequence,
            %reason,
            "Rejected participant response"
        );
        self.report(FlowReport::InvalidResponse {
            session_id: self.session.id,
            sequence,
            reason,
        })
        .await;
    }

    async fn on_user_response(&mut self, worker: &mut WorkerHandle, response: UserResponse) -> Step {
        let UserResponse { sequence, payload } = response;

        let verdict = match &self.pending {
            None => Err("no request is awaiting a response".to_string()),
            Some(pending) if pending.sequence != sequence => {
                Err(format!("request {} is pending", pending.sequence))
            }
            Some(pending) => pending.expectation.check(&payload),
        };
        if let Err(reason) = verdict {
            self.reject_response(sequence, reason).await;
            return Step::Continue;
        }

        if let Err(cause) = self.deliver(worker, Response::ok(sequence, payload)).await {
            return Step::Restart(cause);
        }
        if let Some(pending) = self.pending.take() {
            tracing::info!(
                session_id = %self.session.id,
                sequence,
                elapsed = ?pending.issued_at.elapsed(),
                "Participant responded"
            );
        }
        self.session.last_acknowledged = Some(sequence);
        self.transition(FlowState::Running);
        Step::Continue
    }

    /// Submit with bounded retries. Returns the number of attempts used.
    async fn submit(&self, payload: &DonationPayload) -> Result<u32, Stop> {
        let session_id = self.session.id;
        let max_attempts = self.config.submit_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let timeout = self.config.submit_timeout;
            let reason = match tokio::time::timeout(timeout, self.sink.submit(payload)).await {
                Ok(Ok(())) => return Ok(attempt),
                Ok(Err(e)) => e.0,
                Err(_) => format!("timed out after {timeout:?}"),
            };

            if attempt >= max_attempts {
                return Err(Stop::Fail(FlowError::SubmissionFailed {
                    attempts: attempt,
                    reason,
                }));
            }
            let backoff = self.config.submit_backoff_for(attempt);
            tracing::warn!(%session_id, attempt, ?backoff, %reason, "Submission failed, retrying");

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancel),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn finalize(mut self, mut worker: WorkerHandle, summary: Option<Value>) -> SessionOutcome {
        let session_id = self.session.id;
        self.transition(FlowState::Finalizing);
        self.supervisor.terminate(&mut worker).await;
        drop(worker);

        let fragments = match self.store.snapshot(session_id).await {
            Ok(fragments) => fragments,
            Err(e) => return self.fail(None, e.into()).await,
        };
        let payload = DonationPayload {
            session_id,
            study_id: self.session.study_id.clone(),
            fragments,
            summary,
            finalized_at: Utc::now(),
        };

        match self.submit(&payload).await {
            Ok(attempts) => {
                if let Err(e) = self.store.seal(session_id).await {
                    tracing::warn!(%session_id, error = %e, "Failed to seal submitted session");
                }
                tracing::info!(
                    %session_id,
                    fragments = payload.fragments.len(),
                    attempts,
                    restarts = self.session.restarts,
                    "Donation submitted"
                );
                self.transition(FlowState::Completed);
                self.report(FlowReport::Terminal {
                    session_id,
                    state: FlowState::Completed,
                    code: None,
                    message: None,
                })
                .await;
                self.outcome(None, payload.fragments.len())
            }
            Err(stop) => self.stop(stop).await,
        }
    }

    async fn stop(self, stop: Stop) -> SessionOutcome {
        match stop {
            Stop::Cancel => self.cancelled(None).await,
            Stop::Fail(e) => self.fail(None, e).await,
        }
    }

    async fn cancelled(mut self, worker: Option<WorkerHandle>) -> SessionOutcome {
        let session_id = self.session.id;
        tracing::info!(%session_id, state = %self.session.state, "Session cancelled");

        let pending = self.pending.take();
        if let Some(mut worker) = worker {
            if let Some(pending) = pending {
                let notice = worker.send_response(Response::cancelled(pending.sequence));
                match tokio::time::timeout(self.config.shutdown_grace, notice).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(%session_id, error = %e, "Cancel notice not delivered")
                    }
                    Err(_) => tracing::debug!(%session_id, "Cancel notice timed out"),
                }
            }
            self.supervisor.terminate(&mut worker).await;
        }

        if let Err(e) = self.store.discard(session_id).await {
            tracing::warn!(%session_id, error = %e, "Failed to discard session log");
        }

        self.transition(FlowState::Cancelled);
        let err = FlowError::UserCancelled;
        self.report(FlowReport::Terminal {
            session_id,
            state: FlowState::Cancelled,
            code: Some(err.code().to_string()),
            message: None,
        })
        .await;
        self.outcome(Some(err), 0)
    }

    async fn fail(mut self, worker: Option<WorkerHandle>, err: FlowError) -> SessionOutcome {
        let session_id = self.session.id;
        tracing::error!(
            %session_id,
            state = %self.session.state,
            code = err.code(),
            error = %err,
            "Session failed"
        );

        self.pending = None;
        if let Some(mut worker) = worker {
            self.supervisor.terminate(&mut worker).await;
        }
        if let Err(e) = self.store.seal(session_id).await {
            tracing::warn!(%session_id, error = %e, "Failed to seal session log");
        }
        let fragments = self
            .store
            .snapshot(session_id)
            .await
            .map_or(0, |fragments| fragments.len());

        self.transition(FlowState::Failed);
        self.report(FlowReport::Terminal {
            session_id,
            state: FlowState::Failed,
            code: Some(err.code().to_string()),
            message: Some(err.to_string()),
        })
        .await;
        self.outcome(Some(err), fragments)
    }

    fn outcome(&self, error: Option<FlowError>, fragments: usize) -> SessionOutcome {
        SessionOutcome {
            session_id: self.session.id,
            state: self.session.state,
            error,
            fragments,
            restarts: self.session.restarts,
        }
    }
}
