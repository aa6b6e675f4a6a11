//! Line-oriented presenter loop.
//!
//! Directives and reports go to stdout as one JSON object per line. Answers
//! come back on stdin, one per line, in any of these shapes:
//!
//! - `{"sequence": 3, "payload": {"type": "true"}}` answers a specific request
//! - `{"type": "file", "name": "...", "path": "..."}` answers the latest request
//! - `true`, `false`, `"text"` or `null` are shorthands for the matching payload
//! - any other JSON value is sent as a `json` payload
//!
//! End of input cancels the session.

use anyhow::{Context, anyhow};
use donation_bridge::collab::{FlowReport, PresenterEvent};
use donation_bridge::session::UserResponse;
use donation_bridge::{Payload, SessionLink};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

pub async fn run(
    mut events: UnboundedReceiver<PresenterEvent>,
    link: SessionLink,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut latest: Option<u64> = None;
    let mut input_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let (line, terminal) = match &event {
                    PresenterEvent::Directive(directive) => {
                        latest = Some(directive.sequence);
                        (serde_json::to_string(directive)?, false)
                    }
                    PresenterEvent::Report(report) => (
                        serde_json::to_string(report)?,
                        matches!(report, FlowReport::Terminal { .. }),
                    ),
                };
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
                if terminal {
                    break;
                }
            }
            line = lines.next_line(), if input_open => {
                match line.context("reading stdin")? {
                    None => {
                        input_open = false;
                        tracing::info!(session_id = %link.id(), "Console input closed, cancelling session");
                        link.cancel();
                    }
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match parse_answer(&line, latest) {
                        Ok(answer) => {
                            if link.respond(answer.sequence, answer.payload).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable answer"),
                    },
                }
            }
        }
    }
    Ok(())
}

/// Turn one input line into a response for the session.
pub fn parse_answer(line: &str, latest: Option<u64>) -> anyhow::Result<UserResponse> {
    let value: Value = serde_json::from_str(line.trim()).context("answer is not JSON")?;

    if let Value::Object(map) = &value
        && map.contains_key("sequence")
        && map.contains_key("payload")
    {
        return serde_json::from_value(value).context("malformed addressed answer");
    }

    let sequence = latest.ok_or_else(|| anyhow!("no request is waiting for an answer"))?;
    let payload = match value {
        Value::Null => Payload::Void,
        Value::Bool(true) => Payload::True,
        Value::Bool(false) => Payload::False,
        Value::String(s) => Payload::string(s),
        Value::Object(ref map) if map.contains_key("type") => {
            serde_json::from_value(value).context("malformed payload")?
        }
        other => Payload::json(other),
    };
    Ok(UserResponse { sequence, payload })
}
