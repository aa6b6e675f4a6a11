//! donation-bridge: runs a per-study data-donation script in an isolated
//! worker and drives its flow from the host side.

mod health;
mod version;

pub mod bridge;
pub mod collab;
pub mod config;
pub mod error;
pub mod flow;
pub mod registry;
pub mod session;
pub mod store;
pub mod worker;
pub mod worker_host;

pub use bridge::protocol::{Fragment, Payload, PayloadKind, SessionId};
pub use collab::{
    ChannelPresenter, DirectorySink, DonationPayload, Presenter, ScriptPackage, ScriptResolver,
    StaticResolver, SubmissionSink,
};
pub use config::{BridgeConfig, ResumePolicy, parse_secs};
pub use error::{FlowError, ProtocolViolation};
pub use flow::{FlowController, FlowSetup};
pub use health::WorkerHealth;
pub use registry::{SessionGuard, SessionHandle, SessionRegistry, StartError};
pub use session::{CancellationToken, FlowState, SessionLink, SessionOutcome};
pub use store::{FileStore, MemoryStore, SessionStore};
pub use version::{BRIDGE_VERSION, VersionInfo};
pub use worker::{Script, ScriptContext, WorkerConfig, WorkerError, run_stdio_worker, run_worker};
pub use worker_host::{InProcessSpawner, ProcessSpawner, WorkerSupervisor};
