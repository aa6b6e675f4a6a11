//! Built-in demo study.
//!
//! Ask for a data export until one can be read (or the participant gives up),
//! show what was extracted, and donate either the extraction or a status record.
//! Every path ends with `done`: declining is a valid outcome of a study, not a
//! script failure.

use async_trait::async_trait;
use donation_bridge::bridge::protocol::LogLevel;
use donation_bridge::{Payload, PayloadKind, Script, ScriptContext, WorkerError};
use serde_json::{Value, json};

/// Fragment id of the single donation record.
const DONATION_KEY: &str = "demo-export";

pub struct DemoScript;

enum Selection {
    Extracted(Value),
    Empty,
    Unreadable(String),
}

impl DemoScript {
    async fn inspect(answer: Payload) -> Selection {
        match answer {
            Payload::File { name, path } => match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() == 0 => Selection::Empty,
                Ok(meta) => Selection::Extracted(json!({ "name": name, "bytes": meta.len() })),
                Err(e) => Selection::Unreadable(format!("{name}: {e}")),
            },
            Payload::String { value } if value.trim().is_empty() => Selection::Empty,
            Payload::String { value } => Selection::Extracted(json!({ "entered": value })),
            Payload::Json { value } => Selection::Extracted(json!({ "entered": value })),
            other => Selection::Unreadable(format!(
                "cannot extract from a {} answer",
                other.kind().as_str()
            )),
        }
    }

    async fn finish(
        ctx: &mut ScriptContext,
        record: Value,
        status: &str,
    ) -> Result<Option<Value>, WorkerError> {
        ctx.store(DONATION_KEY, record).await?;
        Ok(Some(json!({ "status": status })))
    }
}

#[async_trait]
impl Script for DemoScript {
    async fn run(&mut self, ctx: &mut ScriptContext) -> Result<Option<Value>, WorkerError> {
        if ctx.already_stored(DONATION_KEY) {
            ctx.log(LogLevel::Info, "donation already stored").await?;
            return Ok(Some(json!({ "status": "resumed" })));
        }
        let locale = ctx.init().locale.clone();

        let extraction = loop {
            let answer = ctx
                .request_data(
                    json!({
                        "prompt": "Select your data export",
                        "accept": ["file", "json", "string"],
                        "locale": locale,
                    }),
                    None,
                )
                .await?;

            match Self::inspect(answer).await {
                Selection::Extracted(data) => break Some(data),
                Selection::Empty => {
                    ctx.log(LogLevel::Info, "selection holds no data").await?;
                    ctx.store(DONATION_KEY, json!({ "status": "no-data" })).await?;
                    ctx.render(
                        json!({
                            "title": "No data found",
                            "body": "Your export does not contain any data for this study.",
                            "ok": "End",
                        }),
                        Vec::new(),
                    )
                    .await?;
                    return Ok(Some(json!({ "status": "no-data" })));
                }
                Selection::Unreadable(reason) => {
                    ctx.log(LogLevel::Warn, format!("cannot process selection: {reason}"))
                        .await?;
                    let retry = ctx
                        .render(
                            json!({
                                "title": "We cannot process your file",
                                "ok": "Try again",
                                "cancel": "Continue",
                            }),
                            vec![PayloadKind::True, PayloadKind::False],
                        )
                        .await?;
                    if retry == Payload::True {
                        continue;
                    }
                    break None;
                }
            }
        };

        let Some(extraction) = extraction else {
            ctx.log(LogLevel::Info, "participant continued without a readable file")
                .await?;
            return Self::finish(ctx, json!({ "status": "unreadable-file" }), "unreadable-file")
                .await;
        };

        ctx.log(LogLevel::Info, "extraction ready for review").await?;
        let consent = ctx
            .render(
                json!({ "title": "Review your donation", "extraction": extraction }),
                vec![PayloadKind::True, PayloadKind::Json, PayloadKind::False],
            )
            .await?;
        match consent {
            Payload::False => {
                Self::finish(ctx, json!({ "status": "donation declined" }), "declined").await
            }
            // An edited selection replaces the extraction.
            Payload::Json { value } => Self::finish(ctx, value, "donated").await,
            _ => Self::finish(ctx, extraction, "donated").await,
        }
    }
}
