//! Worker side of the bridge protocol.
//!
//! Study logic implements [`Script`] and talks to the host through a
//! [`ScriptContext`]. [`run_worker`] drives one script over any endpoint;
//! [`run_stdio_worker`] binds it to stdin/stdout for a worker subprocess.
//!
//! Every Command waits for its Response before the next one is sent, so the
//! script never has more than one request outstanding. A heartbeat task keeps
//! the host's watchdog fed while the script is busy or waiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::channel::{ChannelError, ChannelReceiver, ChannelSender, Endpoint, WorkerEndpoint};
use crate::bridge::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::config::parse_secs;
use crate::bridge::protocol::{
    Command, CommandBody, DataRequest, DoneSummary, Fragment, HostFrame, InitContext, LogLevel,
    LogRecord, Payload, PayloadKind, ProtocolError, RenderPage, ResponseStatus, ResumeContext,
    ScriptFailure, SessionId, WorkerFrame,
};

type SharedWriter = Arc<Mutex<ChannelSender<WorkerFrame>>>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("expected init frame, got {0}")]
    MissingInit(&'static str),

    #[error("host requested shutdown")]
    Shutdown,

    #[error("request {sequence} was cancelled by the host")]
    Cancelled { sequence: u64 },

    #[error("response for sequence {got} while waiting for {expected}")]
    MismatchedResponse { expected: u64, got: u64 },

    /// Failure raised by the script itself; reported to the host as an `error` Command.
    #[error("{code}: {message}")]
    Script { code: String, message: String },
}

impl WorkerError {
    pub fn script(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the host ended the conversation (as opposed to a failure).
    pub fn is_host_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Cancelled { .. })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    pub max_payload_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            max_payload_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `BRIDGE_HEARTBEAT_INTERVAL` (seconds) and
    /// `BRIDGE_MAX_PAYLOAD_BYTES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(interval) = std::env::var("BRIDGE_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|raw| parse_secs("BRIDGE_HEARTBEAT_INTERVAL", &raw))
        {
            config.heartbeat_interval = interval;
        }
        if let Some(n) = std::env::var("BRIDGE_MAX_PAYLOAD_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.max_payload_bytes = n;
        }
        config
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Study logic run inside a worker.
///
/// Returning `Ok(summary)` finishes the flow with `done`; returning
/// [`WorkerError::Script`] finishes it with `error`.
#[async_trait]
pub trait Script: Send {
    async fn run(&mut self, ctx: &mut ScriptContext) -> Result<Option<Value>, WorkerError>;
}

/// The script's view of the host.
pub struct ScriptContext {
    init: InitContext,
    next_sequence: u64,
    writer: SharedWriter,
    reader: ChannelReceiver<HostFrame>,
}

impl ScriptContext {
    pub fn init(&self) -> &InitContext {
        &self.init
    }

    pub fn session_id(&self) -> SessionId {
        self.init.session_id
    }

    pub fn resume(&self) -> Option<&ResumeContext> {
        self.init.resume.as_ref()
    }

    /// Whether a fragment with this id survived from an earlier worker.
    pub fn already_stored(&self, id: &str) -> bool {
        self.resume().is_some_and(|r| r.has_fragment(id))
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Show a page and wait for the participant's answer.
    pub async fn render(
        &mut self,
        page: Value,
        accepts: Vec<PayloadKind>,
    ) -> Result<Payload, WorkerError> {
        self.call(CommandBody::Render(RenderPage { page, accepts }))
            .await
    }

    /// Ask the participant for data, optionally constrained by a JSON Schema.
    pub async fn request_data(
        &mut self,
        descriptor: Value,
        schema: Option<Value>,
    ) -> Result<Payload, WorkerError> {
        self.call(CommandBody::RequestData(DataRequest { descriptor, schema }))
            .await
    }

    /// Persist a fragment in the host's session store.
    pub async fn store(&mut self, id: impl Into<String>, data: Value) -> Result<(), WorkerError> {
        self.call(CommandBody::StoreData(Fragment::new(id, data)))
            .await
            .map(|_| ())
    }

    pub async fn log(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<(), WorkerError> {
        self.call(CommandBody::Log(LogRecord {
            level,
            message: message.into(),
        }))
        .await
        .map(|_| ())
    }

    async fn call(&mut self, body: CommandBody) -> Result<Payload, WorkerError> {
        let sequence = self.emit(body).await?;
        loop {
            match self.reader.recv().await? {
                HostFrame::Response(resp) if resp.sequence == sequence => {
                    return match resp.status {
                        ResponseStatus::Ok => Ok(resp.payload),
                        ResponseStatus::Cancelled => Err(WorkerError::Cancelled { sequence }),
                    };
                }
                HostFrame::Response(resp) => {
                    return Err(WorkerError::MismatchedResponse {
                        expected: sequence,
                        got: resp.sequence,
                    });
                }
                HostFrame::Shutdown => return Err(WorkerError::Shutdown),
                HostFrame::Init { .. } => {
                    tracing::warn!(sequence, "Ignoring repeated init frame");
                }
            }
        }
    }

    async fn emit(&mut self, body: CommandBody) -> Result<u64, WorkerError> {
        let sequence = self.next_sequence;
        let raw = Command::new(sequence, body).encode()?;
        tracing::trace!(sequence, kind = %raw.kind, "Sending command");
        self.writer
            .lock()
            .await
            .send(WorkerFrame::Command(raw))
            .await?;
        self.next_sequence += 1;
        Ok(sequence)
    }
}

/// Run a script to completion over `endpoint`.
///
/// Returns `Ok(())` when the script finished (with `done` or `error`) or the
/// host ended the session.
pub async fn run_worker<S: Script + ?Sized>(
    script: &mut S,
    endpoint: WorkerEndpoint,
    config: WorkerConfig,
) -> Result<(), WorkerError> {
    let (writer, mut reader) = endpoint.split();

    let init = match reader.recv().await? {
        HostFrame::Init { context } => context,
        HostFrame::Shutdown => {
            tracing::debug!("Shutdown before init");
            return Ok(());
        }
        HostFrame::Response(_) => return Err(WorkerError::MissingInit("response")),
    };
    tracing::info!(
        session_id = %init.session_id,
        generation = init.generation,
        next_sequence = init.next_sequence,
        resumed = init.resume.is_some(),
        "Worker initialised"
    );

    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let heartbeat = spawn_heartbeat(Arc::clone(&writer), config.heartbeat_interval);

    let mut ctx = ScriptContext {
        next_sequence: init.next_sequence,
        init,
        writer: Arc::clone(&writer),
        reader,
    };

    let outcome = match script.run(&mut ctx).await {
        Ok(summary) => ctx
            .emit(CommandBody::Done(DoneSummary { summary }))
            .await
            .map(|_| ()),
        Err(WorkerError::Script { code, message }) => {
            tracing::info!(%code, %message, "Script reported failure");
            ctx.emit(CommandBody::Error(ScriptFailure { code, message }))
                .await
                .map(|_| ())
        }
        Err(e) if e.is_host_shutdown() => {
            tracing::debug!(reason = %e, "Host ended the session");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            if let Err(send_err) = ctx
                .emit(CommandBody::Error(ScriptFailure {
                    code: "worker_error".to_string(),
                    message: e.to_string(),
                }))
                .await
            {
                tracing::debug!(error = %send_err, "Could not report worker failure to host");
            }
            Err(e)
        }
    };

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    writer.lock().await.close().await;
    outcome
}

/// Run a script as a worker subprocess speaking the protocol on stdin/stdout.
pub async fn run_stdio_worker<S: Script + ?Sized>(
    script: &mut S,
    config: WorkerConfig,
) -> Result<(), WorkerError> {
    let endpoint = Endpoint::from_io(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.max_payload_bytes,
    );
    run_worker(script, endpoint, config).await
}

fn spawn_heartbeat(writer: SharedWriter, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if writer.lock().await.send(WorkerFrame::Heartbeat).await.is_err() {
                tracing::trace!("Heartbeat stopped, channel closed");
                break;
            }
        }
    }))
}
