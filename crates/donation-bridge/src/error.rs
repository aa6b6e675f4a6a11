//! Session-level errors with stable codes.

use crate::bridge::channel::ChannelError;
use crate::bridge::protocol::ProtocolError;
use crate::store::StoreError;

/// How the worker broke the protocol contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("duplicate command sequence {sequence}")]
    DuplicateSequence { sequence: u64 },

    #[error("out-of-order command sequence: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("command {got} issued while request {pending} is still pending")]
    ConcurrentRequest { pending: u64, got: u64 },

    #[error("invalid schema in request-data {sequence}: {reason}")]
    InvalidSchema { sequence: u64, reason: String },

    #[error(transparent)]
    Command(#[from] ProtocolError),

    #[error("unreadable frame: {0}")]
    Frame(#[from] ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("worker sent no command within the startup timeout")]
    WorkerStartupTimeout,

    #[error("worker went silent for longer than the quiet period")]
    WorkerUnresponsive,

    #[error("worker crashed: {reason}")]
    WorkerCrashed { reason: String },

    #[error("host requested a worker restart")]
    RetryRequested,

    #[error("restart budget of {max_restarts} exhausted, last cause: {cause}")]
    RestartBudgetExhausted {
        max_restarts: u32,
        cause: Box<FlowError>,
    },

    #[error("submission failed after {attempts} attempts: {reason}")]
    SubmissionFailed { attempts: u32, reason: String },

    #[error("cancelled by the participant")]
    UserCancelled,

    #[error("script reported {code}: {message}")]
    Script { code: String, message: String },

    #[error("no response to request {sequence} before the deadline")]
    UserResponseTimeout { sequence: u64 },

    #[error("presenter failed: {0}")]
    Presenter(String),

    #[error("session store failed: {0}")]
    Store(#[from] StoreError),

    /// The session's log was sealed by an earlier run; it is never submitted again.
    #[error("session is sealed and cannot run again")]
    SessionSealed,
}

impl FlowError {
    /// Stable identifier reported to the presenter and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::ProtocolViolation(_) => "protocol_violation",
            FlowError::WorkerStartupTimeout => "worker_startup_timeout",
            FlowError::WorkerUnresponsive => "worker_unresponsive",
            FlowError::WorkerCrashed { .. } => "worker_crashed",
            FlowError::RetryRequested => "retry_requested",
            FlowError::RestartBudgetExhausted { .. } => "restart_budget_exhausted",
            FlowError::SubmissionFailed { .. } => "submission_failed",
            FlowError::UserCancelled => "user_cancelled",
            FlowError::Script { .. } => "script_error",
            FlowError::UserResponseTimeout { .. } => "user_response_timeout",
            FlowError::Presenter(_) => "presenter_failed",
            FlowError::Store(_) => "store_failed",
            FlowError::SessionSealed => "session_sealed",
        }
    }

    /// Whether this cause is handled by restarting the worker.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::WorkerStartupTimeout
                | FlowError::WorkerUnresponsive
                | FlowError::WorkerCrashed { .. }
                | FlowError::RetryRequested
        )
    }

    /// The error that actually ended the session, looking through an exhausted budget.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::RestartBudgetExhausted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
