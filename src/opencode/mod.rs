//! OpenCode session server backend
//!
//! Drives sessions on an OpenCode-compatible HTTP server. Events arrive on
//! `GET /event` as server-sent events shaped `{"type", "properties"}`.

use crate::a2a::stream::SseDecoder;
use crate::session::{
    HistoryMessage, Part, PermissionReply, PromptPart, PromptRequest, SessionBackend,
    SessionError, SessionEvent, ToolState,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenCodeClient {
    client: Client,
    base_url: String,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(res: Response, what: &str) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    anyhow::bail!("OpenCode {} failed ({}): {}", what, status, body.trim())
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Decode one `{"type", "properties"}` event
pub fn decode_event(event: &Value) -> SessionEvent {
    let props = event.get("properties").unwrap_or(&Value::Null);
    match str_field(event, "type").unwrap_or_default() {
        "message.part.updated" => {
            let part = props.get("part").unwrap_or(&Value::Null);
            match str_field(part, "sessionID") {
                Some(session_id) => SessionEvent::PartUpdated {
                    session_id: session_id.to_string(),
                    part: decode_part(part),
                },
                None => SessionEvent::Unknown,
            }
        }
        "session.idle" => match str_field(props, "sessionID") {
            Some(session_id) => SessionEvent::Idle {
                session_id: session_id.to_string(),
            },
            None => SessionEvent::Unknown,
        },
        "session.error" => {
            let error = props.get("error").unwrap_or(&Value::Null);
            SessionEvent::Error {
                session_id: str_field(props, "sessionID").map(str::to_string),
                error: SessionError {
                    name: str_field(error, "name").unwrap_or("UnknownError").to_string(),
                    message: error
                        .get("data")
                        .and_then(|d| str_field(d, "message"))
                        .or_else(|| str_field(error, "message"))
                        .map(str::to_string),
                },
            }
        }
        "permission.updated" | "permission.asked" => {
            match (str_field(props, "sessionID"), str_field(props, "id")) {
                (Some(session_id), Some(id)) => SessionEvent::PermissionRequested {
                    session_id: session_id.to_string(),
                    permission_id: id.to_string(),
                    tool: str_field(props, "permission")
                        .or_else(|| str_field(props, "type"))
                        .or_else(|| str_field(props, "tool"))
                        .unwrap_or_default()
                        .to_string(),
                },
                _ => SessionEvent::Unknown,
            }
        }
        _ => SessionEvent::Unknown,
    }
}

pub fn decode_part(part: &Value) -> Part {
    match str_field(part, "type") {
        Some("text") => Part::Text {
            text: str_field(part, "text").unwrap_or_default().to_string(),
        },
        Some("tool") => {
            let state = match part.get("state").and_then(|s| str_field(s, "status")) {
                Some("completed") => ToolState::Completed,
                Some("error") => ToolState::Error,
                Some("running") => ToolState::Running,
                _ => ToolState::Pending,
            };
            Part::Tool {
                id: str_field(part, "id").unwrap_or_default().to_string(),
                tool: str_field(part, "tool").unwrap_or_default().to_string(),
                state,
            }
        }
        _ => Part::Other,
    }
}

fn prompt_body(request: &PromptRequest) -> Value {
    let parts: Vec<Value> = request
        .parts
        .iter()
        .map(|part| match part {
            PromptPart::Text { text } => json!({ "type": "text", "text": text }),
            PromptPart::File { path } => json!({
                "type": "file",
                "mime": "text/plain",
                "filename": path,
                "url": format!("file://{}", path),
            }),
        })
        .collect();

    let mut body = json!({ "parts": parts });
    if let Some(ref model) = request.model {
        body["model"] = json!(model);
    }
    if let Some(ref agent) = request.agent {
        body["agent"] = json!(agent);
    }
    body
}

#[async_trait]
impl SessionBackend for OpenCodeClient {
    async fn create_session(&self, title: &str, directory: Option<&str>) -> Result<String> {
        let mut req = self
            .client
            .post(self.url("/session"))
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "title": title }));
        if let Some(dir) = directory {
            req = req.query(&[("directory", dir)]);
        }

        let res = req.send().await.context("OpenCode server unreachable")?;
        let session: Value = check(res, "create session").await?.json().await?;
        str_field(&session, "id")
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("OpenCode session response has no id"))
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, SessionEvent>> {
        let res = self
            .client
            .get(self.url("/event"))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("OpenCode event feed unreachable")?;
        let res = check(res, "event subscribe").await?;

        let state = (
            Box::pin(res.bytes_stream()),
            SseDecoder::default(),
            VecDeque::new(),
        );
        let events = futures::stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (body, decoder, pending)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        for frame in decoder.push(&chunk) {
                            match serde_json::from_str::<Value>(&frame.data) {
                                Ok(value) => pending.push_back(decode_event(&value)),
                                Err(e) => tracing::debug!(error = %e, "Skipping non-JSON event"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "OpenCode event feed failed");
                        return None;
                    }
                    None => return None,
                }
            }
        });
        Ok(events.boxed())
    }

    async fn prompt(&self, session_id: &str, request: &PromptRequest) -> Result<()> {
        let res = self
            .client
            .post(self.url(&format!(
                "/session/{}/prompt_async",
                urlencoding::encode(session_id)
            )))
            .timeout(REQUEST_TIMEOUT)
            .json(&prompt_body(request))
            .send()
            .await?;
        check(res, "prompt").await?;
        Ok(())
    }

    async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<()> {
        let res = self
            .client
            .post(self.url(&format!(
                "/session/{}/permissions/{}",
                urlencoding::encode(session_id),
                urlencoding::encode(permission_id)
            )))
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "response": reply.as_str() }))
            .send()
            .await?;
        check(res, "permission reply").await?;
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<HistoryMessage>> {
        let res = self
            .client
            .get(self.url(&format!(
                "/session/{}/message",
                urlencoding::encode(session_id)
            )))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let items: Vec<Value> = check(res, "message history").await?.json().await?;

        Ok(items
            .iter()
            .map(|item| HistoryMessage {
                role: item
                    .get("info")
                    .and_then(|i| str_field(i, "role"))
                    .unwrap_or_default()
                    .to_string(),
                parts: item
                    .get("parts")
                    .and_then(Value::as_array)
                    .map(|parts| parts.iter().map(decode_part).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }
}
