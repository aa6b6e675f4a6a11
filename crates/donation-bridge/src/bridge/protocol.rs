//! Wire protocol types for host-worker communication.
//!
//! One duplex channel per worker:
//! - **Worker → host**: numbered Commands plus liveness heartbeats
//! - **Host → worker**: the initial context, one Response per acknowledged Command, shutdown
//!
//! Commands are decoded in two stages. The frame layer only knows the envelope
//! (`sequence`, `kind`, raw `payload`); [`Command::decode`] then maps the kind
//! onto the fixed vocabulary so that an unknown kind or a bad payload becomes a
//! typed [`ProtocolError`] instead of a framing failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a donation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one worker incarnation. A restart always gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames sent by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Command(RawCommand),
    /// Liveness signal. Resets the watchdog but never counts as a Command.
    Heartbeat,
}

/// Command envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    pub sequence: u64,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Frames sent by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Must be the first frame a worker receives.
    Init { context: InitContext },
    Response(Response),
    Shutdown,
}

/// Everything a (re)started worker needs to pick up the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitContext {
    pub session_id: SessionId,
    pub study_id: String,
    pub locale: String,
    pub host_version: String,
    /// 0 for the first worker of a session, incremented on every restart.
    pub generation: u32,
    /// Sequence number the worker must use for its first Command.
    pub next_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeContext>,
}

/// Prior session state handed to a replacement worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeContext {
    pub fragments: Vec<Fragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_acknowledged: Option<u64>,
    pub restarts: u32,
}

impl ResumeContext {
    pub fn has_fragment(&self, id: &str) -> bool {
        self.fragments.iter().any(|f| f.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub sequence: u64,
    pub status: ResponseStatus,
    #[serde(default)]
    pub payload: Payload,
}

impl Response {
    pub fn ok(sequence: u64, payload: Payload) -> Self {
        Self {
            sequence,
            status: ResponseStatus::Ok,
            payload,
        }
    }

    /// Acknowledgement for a non-interactive Command.
    pub fn ack(sequence: u64) -> Self {
        Self::ok(sequence, Payload::Void)
    }

    pub fn cancelled(sequence: u64) -> Self {
        Self {
            sequence,
            status: ResponseStatus::Cancelled,
            payload: Payload::Void,
        }
    }
}

/// Value produced by the participant for an interactive Command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Void,
    True,
    False,
    String {
        value: String,
    },
    Json {
        value: Value,
    },
    /// Reference to a participant-selected file. `path` is opaque to the bridge.
    File {
        name: String,
        path: String,
    },
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Void => PayloadKind::Void,
            Payload::True => PayloadKind::True,
            Payload::False => PayloadKind::False,
            Payload::String { .. } => PayloadKind::String,
            Payload::Json { .. } => PayloadKind::Json,
            Payload::File { .. } => PayloadKind::File,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Payload::String {
            value: value.into(),
        }
    }

    pub fn json(value: Value) -> Self {
        Payload::Json { value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Void,
    True,
    False,
    String,
    Json,
    File,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Void => "void",
            PayloadKind::True => "true",
            PayloadKind::False => "false",
            PayloadKind::String => "string",
            PayloadKind::Json => "json",
            PayloadKind::File => "file",
        }
    }
}

/// The fixed Command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Render,
    RequestData,
    StoreData,
    Log,
    Done,
    Error,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Render => "render",
            CommandKind::RequestData => "request-data",
            CommandKind::StoreData => "store-data",
            CommandKind::Log => "log",
            CommandKind::Done => "done",
            CommandKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "render" => Some(CommandKind::Render),
            "request-data" => Some(CommandKind::RequestData),
            "store-data" => Some(CommandKind::StoreData),
            "log" => Some(CommandKind::Log),
            "done" => Some(CommandKind::Done),
            "error" => Some(CommandKind::Error),
            _ => None,
        }
    }

    /// Commands that wait for the participant.
    pub fn is_interactive(&self) -> bool {
        matches!(self, CommandKind::Render | CommandKind::RequestData)
    }

    /// Commands that end the script.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandKind::Done | CommandKind::Error)
    }

    /// Commands the host answers with a Response.
    pub fn expects_response(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPage {
    pub page: Value,
    /// Payload kinds the page can produce. Empty means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepts: Vec<PayloadKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub descriptor: Value,
    /// JSON Schema the returned `json` payload must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// A unit of collected data, keyed by a script-chosen id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(alias = "key")]
    pub id: String,
    pub data: Value,
}

impl Fragment {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    /// Logs are free-form: a `{level?, message}` object keeps its level, a
    /// string is the message, anything else is logged as its JSON text.
    fn from_payload(payload: Value) -> Self {
        match payload {
            Value::Null => Self {
                level: LogLevel::Info,
                message: String::new(),
            },
            Value::String(message) => Self {
                level: LogLevel::Info,
                message,
            },
            other => LogRecord::deserialize(&other).unwrap_or_else(|_| Self {
                level: LogLevel::Info,
                message: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
}

impl DoneSummary {
    /// `{summary: x}` carries `x`; `null` and `{}` carry nothing; any other
    /// payload is the summary itself.
    fn from_payload(payload: Value) -> Self {
        let summary = match payload {
            Value::Null => None,
            Value::Object(mut map)
                if map.is_empty() || (map.len() == 1 && map.contains_key("summary")) =>
            {
                map.remove("summary").filter(|v| !v.is_null())
            }
            other => Some(other),
        };
        Self { summary }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandBody {
    Render(RenderPage),
    RequestData(DataRequest),
    StoreData(Fragment),
    Log(LogRecord),
    Done(DoneSummary),
    Error(ScriptFailure),
}

impl CommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandBody::Render(_) => CommandKind::Render,
            CommandBody::RequestData(_) => CommandKind::RequestData,
            CommandBody::StoreData(_) => CommandKind::StoreData,
            CommandBody::Log(_) => CommandKind::Log,
            CommandBody::Done(_) => CommandKind::Done,
            CommandBody::Error(_) => CommandKind::Error,
        }
    }
}

/// A decoded Command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sequence: u64,
    pub body: CommandBody,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported command kind '{kind}'")]
    UnsupportedCommand { kind: String },

    #[error("malformed '{kind}' payload: {reason}")]
    MalformedPayload { kind: String, reason: String },
}

impl Command {
    pub fn new(sequence: u64, body: CommandBody) -> Self {
        Self { sequence, body }
    }

    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    /// Map a wire envelope onto the fixed vocabulary.
    pub fn decode(raw: RawCommand) -> Result<Self, ProtocolError> {
        let Some(kind) = CommandKind::parse(&raw.kind) else {
            return Err(ProtocolError::UnsupportedCommand { kind: raw.kind });
        };

        let payload = raw.payload;

        let body = match kind {
            CommandKind::Render => CommandBody::Render(parse_payload(kind, payload)?),
            CommandKind::RequestData => CommandBody::RequestData(parse_payload(kind, payload)?),
            CommandKind::StoreData => {
                let fragment: Fragment = parse_payload(kind, payload)?;
                if fragment.id.is_empty() {
                    return Err(ProtocolError::MalformedPayload {
                        kind: kind.as_str().to_string(),
                        reason: "fragment id must not be empty".to_string(),
                    });
                }
                CommandBody::StoreData(fragment)
            }
            CommandKind::Log => CommandBody::Log(LogRecord::from_payload(payload)),
            CommandKind::Done => CommandBody::Done(DoneSummary::from_payload(payload)),
            CommandKind::Error => CommandBody::Error(parse_payload(kind, payload)?),
        };

        Ok(Self {
            sequence: raw.sequence,
            body,
        })
    }

    /// Build the wire envelope for this Command.
    pub fn encode(&self) -> Result<RawCommand, ProtocolError> {
        let kind = self.kind();
        let payload = match &self.body {
            CommandBody::Render(p) => serde_json::to_value(p),
            CommandBody::RequestData(p) => serde_json::to_value(p),
            CommandBody::StoreData(p) => serde_json::to_value(p),
            CommandBody::Log(p) => serde_json::to_value(p),
            CommandBody::Done(p) => serde_json::to_value(p),
            CommandBody::Error(p) => serde_json::to_value(p),
        }
        .map_err(|e| ProtocolError::MalformedPayload {
            kind: kind.as_str().to_string(),
            reason: e.to_string(),
        })?;

        Ok(RawCommand {
            sequence: self.sequence,
            kind: kind.as_str().to_string(),
            payload,
        })
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    kind: CommandKind,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::MalformedPayload {
        kind: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}
