//! Session backend seam
//!
//! A backend owns the isolated execution sessions the executor drives. The
//! executor only sees these decoded events, never the wire format.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A model reference in provider/model form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// Parse `provider/model`. A bare model name has no provider and is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptPart {
    Text { text: String },
    File { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub model: Option<ModelRef>,
    pub agent: Option<String>,
    pub parts: Vec<PromptPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Pending,
    Running,
    Completed,
    Error,
}

/// Content of an updated message part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text {
        text: String,
    },
    Tool {
        id: String,
        tool: String,
        state: ToolState,
    },
    Other,
}

/// Structured error payload carried by a session error event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub name: String,
    pub message: Option<String>,
}

impl SessionError {
    /// The message when present, otherwise the symbolic name
    pub fn describe(&self) -> String {
        match self.message.as_deref().map(str::trim) {
            Some(msg) if !msg.is_empty() => msg.to_string(),
            _ => self.name.clone(),
        }
    }
}

/// Decoded session event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PartUpdated {
        session_id: String,
        part: Part,
    },
    PermissionRequested {
        session_id: String,
        permission_id: String,
        tool: String,
    },
    Error {
        session_id: Option<String>,
        error: SessionError,
    },
    Idle {
        session_id: String,
    },
    Unknown,
}

/// One-shot answer to a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Once,
    Reject,
}

impl PermissionReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Reject => "reject",
        }
    }
}

/// A message from session history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub parts: Vec<Part>,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create a session and return its id
    async fn create_session(&self, title: &str, directory: Option<&str>) -> Result<String>;

    /// Subscribe to the event feed. Call before prompting so no event is missed.
    async fn subscribe(&self) -> Result<BoxStream<'static, SessionEvent>>;

    async fn prompt(&self, session_id: &str, request: &PromptRequest) -> Result<()>;

    async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<()>;

    /// Message history, oldest first
    async fn messages(&self, session_id: &str) -> Result<Vec<HistoryMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_requires_provider() {
        assert_eq!(
            ModelRef::parse("anthropic/claude-sonnet-4"),
            Some(ModelRef {
                provider_id: "anthropic".into(),
                model_id: "claude-sonnet-4".into()
            })
        );
        // Only the first slash separates the provider
        assert_eq!(
            ModelRef::parse("openrouter/meta/llama").map(|m| m.model_id),
            Some("meta/llama".to_string())
        );
        assert_eq!(ModelRef::parse("gpt-4o"), None);
    }

    #[test]
    fn error_description_falls_back_to_name() {
        let named = SessionError {
            name: "ProviderAuthError".into(),
            message: None,
        };
        assert_eq!(named.describe(), "ProviderAuthError");
        let with_message = SessionError {
            name: "APIError".into(),
            message: Some("rate limited".into()),
        };
        assert_eq!(with_message.describe(), "rate limited");
    }
}
