//! Worker lifecycle: spawn, watch, terminate.
//!
//! Exactly one worker runs per session. The supervisor hands the flow
//! controller an owned [`WorkerHandle`]; dropping or replacing that handle
//! aborts its background tasks, so events from a dead worker can never reach
//! the controller.
//!
//! Per worker, two tasks run next to the controller:
//! - a **reader** that decodes frames, stamps last activity and forwards
//!   Commands as [`WorkerEvent`]s
//! - a **watchdog** that reports [`WorkerEvent::Unresponsive`] once nothing
//!   (Command or heartbeat) arrived for the quiet period

use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::{
    ChannelError, ChannelReceiver, ChannelSender, Endpoint, HostEndpoint, WorkerEndpoint, duplex,
};
use crate::bridge::protocol::{
    Command, HostFrame, InitContext, ProtocolError, Response, WorkerFrame, WorkerId,
};
use crate::collab::ScriptPackage;
use crate::config::BridgeConfig;
use crate::health::{HealthCell, WorkerHealth};
use crate::worker::{Script, WorkerConfig, WorkerError, run_worker};

/// Worker events buffered between the reader task and the controller.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker spawn timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker did not accept init: {0}")]
    Init(ChannelError),

    #[error("missing worker stdio pipe: {0}")]
    MissingPipe(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSpawnConfig {
    pub max_payload_bytes: usize,
}

/// A freshly started worker: its channel plus a way to control it.
pub struct SpawnedWorker {
    pub endpoint: HostEndpoint,
    pub process: Box<dyn WorkerProcess>,
}

/// Control over the thing executing a worker (child process, tokio task).
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit description if the worker has already exited.
    fn try_exited(&mut self) -> Option<String>;

    /// Wait for the worker to exit and describe how it ended.
    async fn wait(&mut self) -> String;

    /// Ask politely (SIGTERM). Best effort.
    fn terminate(&mut self);

    /// Stop it for good.
    async fn kill(&mut self);
}

/// Trait for spawning workers (allows test injection).
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        script: &ScriptPackage,
        config: &WorkerSpawnConfig,
    ) -> Result<SpawnedWorker, SpawnError>;
}

/// Launches the script package's program as a child process speaking the
/// protocol on stdin/stdout. Stderr is inherited.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        script: &ScriptPackage,
        config: &WorkerSpawnConfig,
    ) -> Result<SpawnedWorker, SpawnError> {
        let mut cmd = ProcessCommand::new(&script.program);
        cmd.args(&script.args)
            .envs(script.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("BRIDGE_MAX_PAYLOAD_BYTES", config.max_payload_bytes.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &script.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;

        tracing::debug!(
            program = %script.program.display(),
            pid = ?child.id(),
            "Spawned worker process"
        );

        Ok(SpawnedWorker {
            endpoint: Endpoint::from_io(stdout, stdin, config.max_payload_bytes),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown exit: {e}")),
        }
    }

    async fn wait(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown exit: {e}"),
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id()
            && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        {
            tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Failed to kill worker process");
        }
    }
}

type WorkerMain = Arc<dyn Fn(WorkerEndpoint) -> BoxFuture<'static, Result<(), WorkerError>> + Send + Sync>;

/// Runs workers as tokio tasks over an in-memory duplex.
///
/// Used to run Rust scripts inside the host process and to drive the flow
/// controller in tests.
pub struct InProcessSpawner {
    main: WorkerMain,
    spawned: AtomicU32,
}

impl InProcessSpawner {
    /// Each spawn runs `main` with the worker end of a fresh channel.
    pub fn new<F, Fut>(main: F) -> Self
    where
        F: Fn(WorkerEndpoint) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        Self {
            main: Arc::new(move |endpoint| main(endpoint).boxed()),
            spawned: AtomicU32::new(0),
        }
    }

    /// Each spawn builds a fresh script from `factory` and runs it with [`run_worker`].
    pub fn for_script<F, S>(factory: F, config: WorkerConfig) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Script + 'static,
    {
        Self::new(move |endpoint| {
            let mut script = factory();
            let config = config.clone();
            async move { run_worker(&mut script, endpoint, config).await }
        })
    }

    /// How many workers have been spawned so far.
    pub fn spawn_count(&self) -> u32 {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(
        &self,
        script: &ScriptPackage,
        config: &WorkerSpawnConfig,
    ) -> Result<SpawnedWorker, SpawnError> {
        let (host, worker) = duplex(config.max_payload_bytes);
        let n = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        let main = Arc::clone(&self.main);
        tracing::debug!(study_id = %script.study_id, spawn = n, "Starting in-process worker");

        let task = tokio::spawn(async move { main(worker).await });
        Ok(SpawnedWorker {
            endpoint: host,
            process: Box::new(TaskProcess { task, exit: None }),
        })
    }
}

struct TaskProcess {
    task: JoinHandle<Result<(), WorkerError>>,
    /// Cached once observed; a JoinHandle must not be polled after completion.
    exit: Option<String>,
}

fn describe_task_exit(result: Result<Result<(), WorkerError>, tokio::task::JoinError>) -> String {
    match result {
        Ok(Ok(())) => "worker task finished".to_string(),
        Ok(Err(e)) => format!("worker task failed: {e}"),
        Err(e) if e.is_cancelled() => "worker task aborted".to_string(),
        Err(e) => format!("worker task panicked: {e}"),
    }
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn try_exited(&mut self) -> Option<String> {
        if self.exit.is_none()
            && self.task.is_finished()
            && let Some(result) = (&mut self.task).now_or_never()
        {
            self.exit = Some(describe_task_exit(result));
        }
        self.exit.clone()
    }

    async fn wait(&mut self) -> String {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = describe_task_exit((&mut self.task).await);
        self.exit = Some(exit.clone());
        exit
    }

    fn terminate(&mut self) {
        // Tasks have no polite signal; the shutdown frame is the polite request.
    }

    async fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        self.task.abort();
        self.exit = Some(describe_task_exit((&mut self.task).await));
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What the reader and watchdog tasks report to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Command(Command),
    /// A frame that could not be turned into a Command.
    Invalid(InvalidFrame),
    /// Nothing arrived for the quiet period.
    Unresponsive { silent_for: Duration },
    /// Channel closed; the worker is gone.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvalidFrame {
    Channel(ChannelError),
    Protocol(ProtocolError),
}

/// Last time anything arrived from the worker.
#[derive(Debug)]
struct Activity(Mutex<Instant>);

impl Activity {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Owned token for one live worker.
pub struct WorkerHandle {
    id: WorkerId,
    generation: u32,
    sender: ChannelSender<HostFrame>,
    events: mpsc::Receiver<WorkerEvent>,
    process: Box<dyn WorkerProcess>,
    activity: Arc<Activity>,
    health: Arc<HealthCell>,
    quiet_period: Duration,
    tasks: Vec<JoinHandle<()>>,
    terminated: bool,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub async fn send_response(&mut self, response: Response) -> Result<(), ChannelError> {
        if self.terminated {
            return Err(ChannelError::Closed);
        }
        self.sender.send(HostFrame::Response(response)).await
    }

    /// Next event from the worker. Once both tasks have stopped this keeps
    /// returning [`WorkerEvent::Closed`].
    pub async fn next_event(&mut self) -> WorkerEvent {
        self.events.recv().await.unwrap_or(WorkerEvent::Closed)
    }

    /// How the worker exited, if it has.
    pub fn exit_status(&mut self) -> Option<String> {
        self.process.try_exited()
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Spawns, terminates and health-checks workers.
pub struct WorkerSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    config: Arc<BridgeConfig>,
}

impl WorkerSupervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: Arc<BridgeConfig>) -> Self {
        Self { spawner, config }
    }

    /// Start a worker and hand it its initial context.
    ///
    /// Spawning plus delivery of the `init` frame is bounded by `spawn_timeout`.
    pub async fn spawn(
        &self,
        script: &ScriptPackage,
        context: InitContext,
    ) -> Result<WorkerHandle, SpawnError> {
        let spawn_timeout = self.config.spawn_timeout;
        let generation = context.generation;
        let session_id = context.session_id;
        let spawn_config = WorkerSpawnConfig {
            max_payload_bytes: self.config.max_payload_bytes,
        };

        let SpawnedWorker {
            endpoint,
            mut process,
        } = self.spawner.spawn(script, &spawn_config)?;
        let (mut sender, receiver) = endpoint.split();

        match tokio::time::timeout(spawn_timeout, sender.send(HostFrame::Init { context })).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                process.kill().await;
                return Err(SpawnError::Init(e));
            }
            Err(_) => {
                process.kill().await;
                return Err(SpawnError::Timeout(spawn_timeout));
            }
        }

        let id = WorkerId::new();
        let activity = Arc::new(Activity::new());
        let health = Arc::new(HealthCell::default());
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let reader_done = CancellationToken::new();

        let reader = tokio::spawn(read_frames(
            receiver,
            tx.clone(),
            Arc::clone(&activity),
            Arc::clone(&health),
            reader_done.clone(),
        ));
        let watchdog = tokio::spawn(watch_activity(
            tx,
            Arc::clone(&activity),
            Arc::clone(&health),
            self.config.quiet_period,
            reader_done,
        ));

        tracing::info!(
            %session_id,
            worker_id = %id,
            generation,
            pid = ?process.pid(),
            "Worker started"
        );

        Ok(WorkerHandle {
            id,
            generation,
            sender,
            events,
            process,
            activity,
            health,
            quiet_period: self.config.quiet_period,
            tasks: vec![reader, watchdog],
            terminated: false,
        })
    }

    /// Stop a worker. Idempotent and infallible.
    ///
    /// Sends `shutdown` and waits `shutdown_grace`; then signals (SIGTERM) and
    /// waits again; then kills.
    pub async fn terminate(&self, handle: &mut WorkerHandle) {
        if handle.terminated {
            return;
        }
        handle.terminated = true;
        let grace = self.config.shutdown_grace;

        if let Ok(Err(e)) = tokio::time::timeout(grace, handle.sender.send(HostFrame::Shutdown)).await {
            tracing::trace!(worker_id = %handle.id, error = %e, "Shutdown frame not delivered");
        }
        let _ = tokio::time::timeout(grace, handle.sender.close()).await;

        let exit = match tokio::time::timeout(grace, handle.process.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(worker_id = %handle.id, "Worker ignored shutdown, signalling");
                handle.process.terminate();
                match tokio::time::timeout(grace, handle.process.wait()).await {
                    Ok(exit) => exit,
                    Err(_) => {
                        tracing::warn!(worker_id = %handle.id, "Worker ignored signal, killing");
                        handle.process.kill().await;
                        "killed".to_string()
                    }
                }
            }
        };

        handle.abort_tasks();
        handle.health.set(WorkerHealth::Crashed);
        tracing::debug!(worker_id = %handle.id, generation = handle.generation, %exit, "Worker terminated");
    }

    pub fn health_check(&self, handle: &mut WorkerHandle) -> WorkerHealth {
        if handle.terminated {
            return WorkerHealth::Crashed;
        }
        if handle.process.try_exited().is_some() {
            handle.health.set(WorkerHealth::Crashed);
        } else if handle.activity.last().elapsed() >= handle.quiet_period {
            handle.health.set(WorkerHealth::Unresponsive);
        }
        handle.health.get()
    }
}

async fn read_frames(
    mut receiver: ChannelReceiver<WorkerFrame>,
    tx: mpsc::Sender<WorkerEvent>,
    activity: Arc<Activity>,
    health: Arc<HealthCell>,
    done: CancellationToken,
) {
    let _done = done.drop_guard();
    while let Some(frame) = receiver.next().await {
        activity.touch();
        health.set(WorkerHealth::Alive);
        let event = match frame {
            Ok(WorkerFrame::Heartbeat) => continue,
            Ok(WorkerFrame::Command(raw)) => match Command::decode(raw) {
                Ok(cmd) => WorkerEvent::Command(cmd),
                Err(e) => WorkerEvent::Invalid(InvalidFrame::Protocol(e)),
            },
            Err(e) => WorkerEvent::Invalid(InvalidFrame::Channel(e)),
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
    health.set(WorkerHealth::Crashed);
    let _ = tx.send(WorkerEvent::Closed).await;
}

async fn watch_activity(
    tx: mpsc::Sender<WorkerEvent>,
    activity: Arc<Activity>,
    health: Arc<HealthCell>,
    quiet_period: Duration,
    reader_done: CancellationToken,
) {
    loop {
        let last = activity.last();
        // A quiet period past the end of the clock never fires.
        let Some(deadline) = last.checked_add(quiet_period) else {
            reader_done.cancelled().await;
            return;
        };
        tokio::select! {
            _ = reader_done.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if activity.last() == last {
            health.set(WorkerHealth::Unresponsive);
            let _ = tx
                .send(WorkerEvent::Unresponsive {
                    silent_for: last.elapsed(),
                })
                .await;
            return;
        }
    }
}
