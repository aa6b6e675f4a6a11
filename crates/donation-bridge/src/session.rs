//! Session state and the host-facing link into a running flow.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
pub use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Payload, SessionId};
use crate::error::FlowError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Idle,
    Starting,
    Running,
    AwaitingUserResponse,
    Restarting,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::AwaitingUserResponse => "awaiting_user_response",
            Self::Restarting => "restarting",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session bookkeeping. Owned and mutated only by the flow controller.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub study_id: String,
    pub state: FlowState,
    /// Highest Command sequence accepted so far (0 before the first).
    pub last_sequence: u64,
    /// Sequence of the last Command that received a Response.
    pub last_acknowledged: Option<u64>,
    pub restarts: u32,
    pub generation: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new(id: SessionId, study_id: impl Into<String>) -> Self {
        Self {
            id,
            study_id: study_id.into(),
            state: FlowState::Idle,
            last_sequence: 0,
            last_acknowledged: None,
            restarts: 0,
            generation: 0,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.last_sequence + 1
    }
}

/// The participant's answer to one interactive Command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    pub sequence: u64,
    pub payload: Payload,
}

/// Input from the host side into a running flow.
#[derive(Debug, Clone, PartialEq)]
pub enum HostInput {
    Respond(UserResponse),
    /// Discard the current worker and start a replacement.
    Retry,
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub state: FlowState,
    pub error: Option<FlowError>,
    pub fragments: usize,
    pub restarts: u32,
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == FlowState::Completed
    }

    pub fn code(&self) -> Option<&'static str> {
        self.error.as_ref().map(FlowError::code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session {0} is no longer accepting input")]
pub struct SessionClosed(pub SessionId);

/// Cloneable connection to a running flow: input, cancellation and state.
#[derive(Debug, Clone)]
pub struct SessionLink {
    id: SessionId,
    inputs: mpsc::Sender<HostInput>,
    cancel: CancellationToken,
    state: watch::Receiver<FlowState>,
}

impl SessionLink {
    pub(crate) fn new(
        id: SessionId,
        inputs: mpsc::Sender<HostInput>,
        cancel: CancellationToken,
        state: watch::Receiver<FlowState>,
    ) -> Self {
        Self {
            id,
            inputs,
            cancel,
            state,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Deliver the participant's answer for `sequence`.
    pub async fn respond(&self, sequence: u64, payload: Payload) -> Result<(), SessionClosed> {
        self.inputs
            .send(HostInput::Respond(UserResponse { sequence, payload }))
            .await
            .map_err(|_| SessionClosed(self.id))
    }

    /// Ask for the worker to be replaced (counts against the restart budget).
    pub async fn retry(&self) -> Result<(), SessionClosed> {
        self.inputs
            .send(HostInput::Retry)
            .await
            .map_err(|_| SessionClosed(self.id))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.clone()
    }

    /// Wait until the flow reaches a state matching `pred`.
    ///
    /// Returns the last observed state if the flow ends first.
    pub async fn wait_for(&self, pred: impl Fn(FlowState) -> bool) -> FlowState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| pred(*s)).await.map(|s| *s);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }
}
