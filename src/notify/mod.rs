//! Notification fan-out
//!
//! Lifecycle events go to every configured channel in parallel. A failing
//! channel is logged and swallowed so it never affects the others or the
//! caller.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

const CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    WorkerStarted,
    WorkerStopped,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    Error,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerStarted => "worker_started",
            Self::WorkerStopped => "worker_stopped",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::Error => "error",
        }
    }

    /// Accent color used in email summaries
    pub fn color(&self) -> &'static str {
        match self {
            Self::WorkerStarted => "#2563eb",
            Self::WorkerStopped => "#6b7280",
            Self::TaskStarted => "#7c3aed",
            Self::TaskCompleted => "#16a34a",
            Self::TaskFailed => "#dc2626",
            Self::Error => "#ea580c",
        }
    }
}

/// One fire-and-forget lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl NotificationEvent {
    pub fn new(kind: NotificationType, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Line posted to the broker's live activity feed
    pub fn monitor_line(&self) -> String {
        format!(
            "[{}] {}\n\n{}",
            self.kind.as_str().to_uppercase(),
            self.title,
            self.message
        )
    }

    /// Color-coded HTML summary with a metadata table
    pub fn render_html(&self) -> String {
        let rows: String = self
            .metadata
            .iter()
            .map(|(k, v)| {
                format!(
                    "<tr><td style=\"padding:4px 12px 4px 0;color:#6b7280\">{}</td><td style=\"padding:4px 0\">{}</td></tr>",
                    html_escape::encode_text(k),
                    html_escape::encode_text(v)
                )
            })
            .collect();
        let table = if rows.is_empty() {
            String::new()
        } else {
            format!("<table style=\"border-collapse:collapse;margin-top:16px\">{}</table>", rows)
        };

        format!(
            "<div style=\"font-family:sans-serif\">\
             <div style=\"border-left:4px solid {color};padding:8px 16px\">\
             <p style=\"margin:0;color:{color};font-size:12px;font-weight:bold\">{kind}</p>\
             <h2 style=\"margin:4px 0\">{title}</h2>\
             <p style=\"white-space:pre-wrap\">{message}</p>\
             {table}</div></div>",
            color = self.kind.color(),
            kind = self.kind.as_str().to_uppercase(),
            title = html_escape::encode_text(&self.title),
            message = html_escape::encode_text(&self.message),
            table = table,
        )
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{channel} request failed: {source}")]
    Http {
        channel: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{channel} returned {status}: {body}")]
    Status {
        channel: &'static str,
        status: u16,
        body: String,
    },
}

/// A single delivery target
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

async fn post_json(
    channel: &'static str,
    req: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<(), NotifyError> {
    let res = req
        .timeout(CHANNEL_TIMEOUT)
        .json(body)
        .send()
        .await
        .map_err(|source| NotifyError::Http { channel, source })?;
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    let body = res.text().await.unwrap_or_default();
    Err(NotifyError::Status {
        channel,
        status: status.as_u16(),
        body,
    })
}

/// Posts into the broker's live activity feed
pub struct MonitorChannel {
    client: Client,
    server: String,
    token: Option<String>,
    worker_id: String,
}

impl MonitorChannel {
    pub fn new(server: &str, token: Option<String>, worker_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            server: server.trim_end_matches('/').to_string(),
            token,
            worker_id: worker_id.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for MonitorChannel {
    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let mut req = self
            .client
            .post(format!("{}/v1/monitor/intervene", self.server));
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let body = json!({
            "message": event.monitor_line(),
            "worker_id": self.worker_id,
        });
        post_json(self.name(), req, &body).await
    }
}

/// Posts the event as JSON to an arbitrary webhook
pub struct PushChannel {
    client: Client,
    url: String,
}

impl PushChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = json!({
            "type": event.kind,
            "title": event.title,
            "message": event.message,
            "metadata": event.metadata,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        post_json(self.name(), self.client.post(&self.url), &body).await
    }
}

/// Transactional email through a SendGrid-compatible API
pub struct EmailChannel {
    client: Client,
    endpoint: String,
    api_key: String,
    to: String,
    from: String,
}

impl EmailChannel {
    pub fn new(
        api_key: impl Into<String>,
        to: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: SENDGRID_ENDPOINT.to_string(),
            api_key: api_key.into(),
            to: to.into(),
            from: from.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = json!({
            "personalizations": [{ "to": [{ "email": self.to }] }],
            "from": { "email": self.from },
            "subject": format!("[CodeTether] {}", event.title),
            "content": [{ "type": "text/html", "value": event.render_html() }],
        });
        let req = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key);
        post_json(self.name(), req, &body).await
    }
}

/// Resolved channel settings; each channel is optional
#[derive(Clone, Default)]
pub struct NotificationConfig {
    pub monitor: Option<MonitorTarget>,
    pub push_url: Option<String>,
    pub email: Option<EmailTarget>,
}

#[derive(Clone)]
pub struct MonitorTarget {
    pub server: String,
    pub token: Option<String>,
    pub worker_id: String,
}

#[derive(Clone)]
pub struct EmailTarget {
    pub api_key: String,
    pub to: String,
    pub from: String,
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for EmailTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailTarget")
            .field("api_key", &"<REDACTED>")
            .field("to", &self.to)
            .field("from", &self.from)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Fans events out to its channels
#[derive(Clone, Default)]
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if let Some(ref m) = config.monitor {
            channels.push(Arc::new(MonitorChannel::new(
                &m.server,
                m.token.clone(),
                m.worker_id.clone(),
            )));
        }
        if let Some(ref url) = config.push_url {
            channels.push(Arc::new(PushChannel::new(url.clone())));
        }
        if let Some(ref e) = config.email {
            let mut email = EmailChannel::new(e.api_key.clone(), e.to.clone(), e.from.clone());
            if let Some(ref endpoint) = e.endpoint {
                email = email.with_endpoint(endpoint.clone());
            }
            channels.push(Arc::new(email));
        }
        Self { channels }
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver to every channel concurrently. Never fails.
    pub async fn send(&self, event: &NotificationEvent) {
        let deliveries = self.channels.iter().map(|channel| async move {
            match channel.deliver(event).await {
                Ok(()) => tracing::debug!(
                    channel = channel.name(),
                    kind = event.kind.as_str(),
                    "Notification delivered"
                ),
                Err(e) => tracing::warn!(
                    channel = channel.name(),
                    kind = event.kind.as_str(),
                    error = %e,
                    "Notification delivery failed"
                ),
            }
        });
        join_all(deliveries).await;
    }
}

/// One-shot fan-out for callers without a long-lived notifier
pub async fn send(config: &NotificationConfig, event: &NotificationEvent) {
    Notifier::from_config(config).send(event).await
}
