//! Session registry.
//!
//! - Lock-free concurrent access via DashMap
//! - Each session runs its flow controller on its own tokio task
//! - Terminal sessions remove themselves

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::bridge::protocol::{Payload, SessionId};
use crate::collab::{Presenter, ResolveError, ScriptResolver, SubmissionSink};
use crate::config::BridgeConfig;
use crate::flow::{FlowController, FlowSetup};
use crate::session::{FlowState, SessionClosed, SessionLink, SessionOutcome};
use crate::store::{SessionStore, StoreError};
use crate::worker_host::WorkerSpawner;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("session {0} is already running")]
    AlreadyActive(SessionId),

    #[error("session {0} is sealed and cannot be resumed")]
    Sealed(SessionId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Starts sessions and keeps track of the ones still running.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionLink>,
    config: Arc<BridgeConfig>,
    resolver: Arc<dyn ScriptResolver>,
    spawner: Arc<dyn WorkerSpawner>,
    store: Arc<dyn SessionStore>,
    presenter: Arc<dyn Presenter>,
    sink: Arc<dyn SubmissionSink>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<BridgeConfig>,
        resolver: Arc<dyn ScriptResolver>,
        spawner: Arc<dyn WorkerSpawner>,
        store: Arc<dyn SessionStore>,
        presenter: Arc<dyn Presenter>,
        sink: Arc<dyn SubmissionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            config,
            resolver,
            spawner,
            store,
            presenter,
            sink,
        })
    }

    /// Start a fresh session for `study_id`.
    pub async fn start(self: &Arc<Self>, study_id: &str) -> Result<SessionHandle, StartError> {
        self.launch(study_id, None).await
    }

    /// Start a session that continues the stored log of `session_id`.
    ///
    /// Sessions that already reached a terminal state are rejected.
    pub async fn resume(
        self: &Arc<Self>,
        study_id: &str,
        session_id: SessionId,
    ) -> Result<SessionHandle, StartError> {
        if self.sessions.contains_key(&session_id) {
            return Err(StartError::AlreadyActive(session_id));
        }
        self.store.open(session_id, study_id).await?;
        if self.store.is_sealed(session_id).await? {
            return Err(StartError::Sealed(session_id));
        }
        self.launch(study_id, Some(session_id)).await
    }

    async fn launch(
        self: &Arc<Self>,
        study_id: &str,
        session_id: Option<SessionId>,
    ) -> Result<SessionHandle, StartError> {
        if let Some(id) = session_id
            && self.sessions.contains_key(&id)
        {
            return Err(StartError::AlreadyActive(id));
        }

        let package = self.resolver.resolve(study_id).await?;
        let mut setup = FlowSetup::new(
            package,
            Arc::clone(&self.spawner),
            Arc::clone(&self.store),
            Arc::clone(&self.presenter),
            Arc::clone(&self.sink),
        )
        .with_config(Arc::clone(&self.config));
        if let Some(id) = session_id {
            setup = setup.with_session_id(id);
        }

        let (controller, link) = FlowController::new(setup);
        let id = link.id();
        match self.sessions.entry(id) {
            Entry::Occupied(_) => return Err(StartError::AlreadyActive(id)),
            Entry::Vacant(slot) => {
                slot.insert(link.clone());
            }
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let outcome = controller.run().await;
            if let Some(registry) = registry.upgrade() {
                registry.sessions.remove(&outcome.session_id);
            }
            tracing::info!(
                session_id = %outcome.session_id,
                state = %outcome.state,
                code = outcome.code(),
                "Session finished"
            );
            outcome
        });

        tracing::debug!(session_id = %id, %study_id, "Session registered");
        Ok(SessionHandle { link, task })
    }

    pub fn get(&self, id: SessionId) -> Option<SessionLink> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Cancel a running session. Returns false if it is unknown or already done.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}

/// Handle to one running session.
pub struct SessionHandle {
    link: SessionLink,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.link.id()
    }

    pub fn link(&self) -> &SessionLink {
        &self.link
    }

    pub async fn respond(&self, sequence: u64, payload: Payload) -> Result<(), SessionClosed> {
        self.link.respond(sequence, payload).await
    }

    pub async fn retry(&self) -> Result<(), SessionClosed> {
        self.link.retry().await
    }

    pub fn cancel(&self) {
        self.link.cancel();
    }

    pub fn state(&self) -> FlowState {
        self.link.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.link.subscribe()
    }

    /// Guard that cancels this session when dropped.
    pub fn guard(&self) -> SessionGuard {
        SessionGuard::new(self.link.clone())
    }

    /// Wait for the session to finish.
    pub async fn wait(self) -> Result<SessionOutcome, JoinError> {
        self.task.await
    }
}

/// Cancels its session on drop unless disarmed.
///
/// Hold one for as long as the participant is connected; dropping it (for
/// example when the UI goes away) tears the session down.
pub struct SessionGuard {
    link: Option<SessionLink>,
}

impl SessionGuard {
    pub fn new(link: SessionLink) -> Self {
        Self { link: Some(link) }
    }

    pub fn disarm(&mut self) {
        self.link = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(ref link) = self.link {
            tracing::debug!(session_id = %link.id(), "Session guard dropped, cancelling");
            link.cancel();
        }
    }
}
