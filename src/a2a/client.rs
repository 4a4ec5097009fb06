//! Broker client - every HTTP call the worker makes against the broker

use super::types::*;
use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Value, json};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker client bound to one worker identity
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    identity: WorkerIdentity,
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>, identity: WorkerIdentity) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            identity,
        }
    }

    /// Set authentication token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn apply_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn short(&self, req: RequestBuilder) -> RequestBuilder {
        self.apply_auth(req)
            .timeout(REQUEST_TIMEOUT)
            .header("X-Worker-ID", &self.identity.worker_id)
    }

    /// `PUT /v1/worker/codebases`
    pub async fn register(&self) -> Result<()> {
        let res = self
            .short(self.client.put(format!("{}/v1/worker/codebases", self.base_url)))
            .json(&json!({
                "codebases": self.identity.codebases,
                "worker_id": self.identity.worker_id,
                "agent_name": self.identity.name,
            }))
            .send()
            .await
            .context("Failed to reach broker for registration")?;
        ensure_success(res, "register").await?;
        Ok(())
    }

    /// `GET /v1/opencode/tasks?status=pending`
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        let res = self
            .short(
                self.client
                    .get(format!("{}/v1/opencode/tasks?status=pending", self.base_url)),
            )
            .send()
            .await?;
        let data: Value = ensure_success(res, "pending tasks").await?.json().await?;

        let items = data
            .get("tasks")
            .and_then(Value::as_array)
            .or_else(|| data.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().filter_map(Task::from_payload).collect())
    }

    /// `GET /v1/worker/tasks/stream` - returns the open streaming response
    pub async fn open_stream(&self) -> Result<Response> {
        let url = format!(
            "{}/v1/worker/tasks/stream?agent_name={}&worker_id={}",
            self.base_url,
            urlencoding::encode(&self.identity.name),
            urlencoding::encode(&self.identity.worker_id)
        );

        let req = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream")
            .header("X-Worker-ID", &self.identity.worker_id)
            .header("X-Agent-Name", &self.identity.name)
            .header("X-Codebases", self.identity.codebases.join(","));

        let res = self.apply_auth(req).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("Failed to connect: {}", res.status());
        }
        Ok(res)
    }

    /// `POST /v1/worker/tasks/claim`
    pub async fn claim(&self, task_id: &str) -> Result<ClaimOutcome> {
        let res = self
            .short(self.client.post(format!("{}/v1/worker/tasks/claim", self.base_url)))
            .json(&json!({
                "task_id": task_id,
                "worker_id": self.identity.worker_id,
            }))
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            return Ok(ClaimOutcome::Claimed);
        }
        let reason = res.text().await.unwrap_or_default();
        Ok(ClaimOutcome::Rejected {
            status: status.as_u16(),
            reason,
        })
    }

    /// `PUT /v1/opencode/tasks/{id}/status`
    pub async fn update_status(&self, task_id: &str, update: &StatusUpdate) -> Result<()> {
        let res = self
            .short(self.client.put(format!(
                "{}/v1/opencode/tasks/{}/status",
                self.base_url,
                urlencoding::encode(task_id)
            )))
            .json(update)
            .send()
            .await?;
        ensure_success(res, "status update").await?;
        Ok(())
    }

    /// `POST /v1/opencode/sessions/{id}/sync`
    pub async fn sync_session(&self, session_id: &str, task_id: &str, status: &str) -> Result<()> {
        let res = self
            .short(self.client.post(format!(
                "{}/v1/opencode/sessions/{}/sync",
                self.base_url,
                urlencoding::encode(session_id)
            )))
            .json(&json!({
                "task_id": task_id,
                "status": status,
                "worker_id": self.identity.worker_id,
            }))
            .send()
            .await?;
        ensure_success(res, "session sync").await?;
        Ok(())
    }

    /// `POST /v1/worker/tasks/release`
    pub async fn release(&self, task_id: &str, status: TaskStatus, result: &str) -> Result<()> {
        let res = self
            .short(self.client.post(format!("{}/v1/worker/tasks/release", self.base_url)))
            .json(&json!({
                "task_id": task_id,
                "status": status,
                "result": result,
            }))
            .send()
            .await?;
        ensure_success(res, "release").await?;
        Ok(())
    }
}

async fn ensure_success(res: Response, what: &str) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    anyhow::bail!("Broker {} failed ({}): {}", what, status, body.trim())
}
