//! Broker wire types
//!
//! The worker only ever holds an advisory copy of a task; the broker owns it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A task as offered by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,

    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, alias = "codebaseId")]
    pub codebase_id: Option<String>,

    #[serde(default)]
    pub priority: Option<i64>,

    #[serde(default)]
    pub status: Option<String>,

    /// Free-form metadata (model, agent, files, prd_path, directory)
    #[serde(default)]
    pub metadata: Value,
}

impl Task {
    /// Decode a task from an offer payload, either `{"task": {..}}` or the
    /// task object itself. Returns `None` when no usable id is present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let inner = payload
            .get("task")
            .filter(|t| t.is_object())
            .unwrap_or(payload);
        let task: Task = serde_json::from_value(inner.clone()).ok()?;
        if task.id.trim().is_empty() {
            return None;
        }
        Some(task)
    }

    /// Text sent to the agent: prompt, then description, then title
    pub fn prompt_text(&self) -> &str {
        [self.prompt.as_deref(), self.description.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .unwrap_or(&self.title)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Attached file paths from `metadata.files`
    pub fn attached_files(&self) -> Vec<String> {
        self.metadata
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Treat an explicit `null` the same as a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Worker identity, regenerated on every process start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub name: String,
    pub codebases: Vec<String>,
}

impl WorkerIdentity {
    pub fn generate(name: impl Into<String>, codebases: Vec<String>) -> Self {
        Self {
            worker_id: generate_worker_id(),
            name: name.into(),
            codebases,
        }
    }
}

fn generate_worker_id() -> String {
    format!(
        "wrk_{}_{:x}",
        chrono::Utc::now().timestamp(),
        rand::random::<u64>()
    )
}

/// Result of a claim request. Rejection is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Rejected { status: u16, reason: String },
}

/// Final status reported on release and session sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What the worker is doing while a task is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    CreatingSession,
    Executing,
    ToolExecution,
}

/// Best-effort progress report body for `PUT /v1/opencode/tasks/{id}/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub metadata: Value,
    pub worker_id: String,
}

impl StatusUpdate {
    pub fn working(worker_id: &str, activity: Activity, tool_count: Option<usize>) -> Self {
        let mut metadata = serde_json::json!({ "activity": activity });
        if let Some(count) = tool_count {
            metadata["tool_count"] = count.into();
        }
        Self {
            status: TaskStatus::Working,
            metadata,
            worker_id: worker_id.to_string(),
        }
    }
}
