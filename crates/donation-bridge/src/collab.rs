//! Collaborators outside the bridge: the UI presenter, the submission sink and
//! the script resolver.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::protocol::{Fragment, PayloadKind, SessionId};
use crate::session::FlowState;

/// What the presenter should show for one interactive Command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderDirective {
    pub session_id: SessionId,
    /// Sequence the participant's answer must carry.
    pub sequence: u64,
    #[serde(flatten)]
    pub body: DirectiveBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DirectiveBody {
    Render {
        page: Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        accepts: Vec<PayloadKind>,
    },
    RequestData {
        descriptor: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
}

/// Out-of-band notices for the presenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowReport {
    /// The worker is being replaced; any page on screen is stale.
    Restarting {
        session_id: SessionId,
        attempt: u32,
        cause: String,
    },
    /// A participant response was rejected. The request (if any) stays pending.
    InvalidResponse {
        session_id: SessionId,
        sequence: u64,
        reason: String,
    },
    Terminal {
        session_id: SessionId,
        state: FlowState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("presenter error: {0}")]
pub struct PresentError(pub String);

/// UI collaborator. Participant answers come back through the session link.
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, directive: RenderDirective) -> Result<(), PresentError>;

    async fn report(&self, report: FlowReport);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenterEvent {
    Directive(RenderDirective),
    Report(FlowReport),
}

/// Presenter that forwards everything into a channel for an external UI loop.
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<PresenterEvent>,
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Presenter for ChannelPresenter {
    async fn present(&self, directive: RenderDirective) -> Result<(), PresentError> {
        self.tx
            .send(PresenterEvent::Directive(directive))
            .map_err(|_| PresentError("presenter channel closed".to_string()))
    }

    async fn report(&self, report: FlowReport) {
        if self.tx.send(PresenterEvent::Report(report)).is_err() {
            tracing::debug!("Presenter channel closed, dropping report");
        }
    }
}

/// Final package handed to the sink. `session_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationPayload {
    pub session_id: SessionId,
    pub study_id: String,
    pub fragments: Vec<Fragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    pub finalized_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("submission error: {0}")]
pub struct SubmissionError(pub String);

#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn submit(&self, payload: &DonationPayload) -> Result<(), SubmissionError>;
}

/// Writes each donation to `<dir>/<session_id>.json`.
///
/// The file is written to a temporary name and renamed into place, so a
/// resubmission of the same session replaces the previous file whole.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session: SessionId) -> PathBuf {
        self.dir.join(format!("{session}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SubmissionSink for DirectorySink {
    async fn submit(&self, payload: &DonationPayload) -> Result<(), SubmissionError> {
        let io_err = |e: std::io::Error| SubmissionError(e.to_string());

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let body = serde_json::to_vec_pretty(payload).map_err(|e| SubmissionError(e.to_string()))?;

        let target = self.path_for(payload.session_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", payload.session_id));
        tokio::fs::write(&tmp, &body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &target).await.map_err(io_err)?;

        tracing::info!(
            session_id = %payload.session_id,
            path = %target.display(),
            fragments = payload.fragments.len(),
            "Donation written"
        );
        Ok(())
    }
}

/// How to launch the worker for one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPackage {
    pub study_id: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl ScriptPackage {
    pub fn new(study_id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            study_id: study_id.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            locale: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown study '{0}'")]
    UnknownStudy(String),

    #[error("failed to resolve script for '{study_id}': {reason}")]
    Failed { study_id: String, reason: String },
}

#[async_trait]
pub trait ScriptResolver: Send + Sync {
    async fn resolve(&self, study_id: &str) -> Result<ScriptPackage, ResolveError>;
}

/// Resolver for a single, fixed package.
pub struct StaticResolver {
    package: ScriptPackage,
}

impl StaticResolver {
    pub fn new(package: ScriptPackage) -> Self {
        Self { package }
    }
}

#[async_trait]
impl ScriptResolver for StaticResolver {
    async fn resolve(&self, study_id: &str) -> Result<ScriptPackage, ResolveError> {
        if study_id == self.package.study_id {
            Ok(self.package.clone())
        } else {
            Err(ResolveError::UnknownStudy(study_id.to_string()))
        }
    }
}
