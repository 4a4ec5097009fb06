//! Task executor
//!
//! Runs one broker task inside its own session and reports the outcome.
//! Tasks that carry a `prd_path` run a Ralph loop instead.

mod backend;

pub use backend::*;

use crate::a2a::Task;
use crate::config::{AutoApprovePolicy, Config};
use crate::ralph::{ProcessAgent, RalphLoop, RalphStatus};
use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Final outcome of one task execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failed(session_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Progress notices surfaced while a task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionProgress {
    SessionCreated { session_id: String },
    Executing,
    ToolCompleted { tool: String, count: usize },
}

#[derive(Default)]
struct SessionOutcome {
    last_output: Option<String>,
    error: Option<String>,
    idle: bool,
}

async fn report(progress: &Option<mpsc::Sender<ExecutionProgress>>, notice: ExecutionProgress) {
    if let Some(tx) = progress {
        let _ = tx.send(notice).await;
    }
}

pub struct TaskExecutor {
    backend: Arc<dyn SessionBackend>,
    config: Arc<Config>,
    policy: AutoApprovePolicy,
}

impl TaskExecutor {
    pub fn new(backend: Arc<dyn SessionBackend>, config: Arc<Config>) -> Self {
        let policy = config.worker.auto_approve;
        Self {
            backend,
            config,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: AutoApprovePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Execute a task.
    ///
    /// `Err` means no session could be created; every later failure comes
    /// back as an unsuccessful [`ExecutionResult`].
    pub async fn execute(
        &self,
        task: &Task,
        progress: Option<mpsc::Sender<ExecutionProgress>>,
    ) -> Result<ExecutionResult> {
        if let Some(prd_path) = task.metadata_str("prd_path") {
            return Ok(self.execute_prd(task, prd_path, &progress).await);
        }

        let session_id = self
            .backend
            .create_session(&task.title, task.metadata_str("directory"))
            .await
            .with_context(|| format!("Failed to create session for task {}", task.id))?;
        info!(task_id = %task.id, session_id = %session_id, "Session created");
        report(
            &progress,
            ExecutionProgress::SessionCreated {
                session_id: session_id.clone(),
            },
        )
        .await;

        let mut events = match self.backend.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                return Ok(ExecutionResult::failed(
                    Some(session_id),
                    format!("Failed to subscribe to session events: {e:#}"),
                ));
            }
        };

        let request = self.build_request(task);
        if let Err(e) = self.backend.prompt(&session_id, &request).await {
            return Ok(ExecutionResult::failed(
                Some(session_id),
                format!("Failed to send prompt: {e:#}"),
            ));
        }
        report(&progress, ExecutionProgress::Executing).await;

        let outcome = self.follow(&session_id, &mut events, &progress).await;
        drop(events);

        if let Some(error) = outcome.error {
            warn!(task_id = %task.id, session_id = %session_id, error = %error, "Session error");
            return Ok(ExecutionResult {
                success: false,
                session_id: Some(session_id),
                output: outcome.last_output,
                error: Some(error),
            });
        }
        if !outcome.idle {
            return Ok(ExecutionResult {
                success: false,
                session_id: Some(session_id),
                output: outcome.last_output,
                error: Some("Session event stream ended before the session went idle".to_string()),
            });
        }

        let output = match outcome.last_output.filter(|o| !o.trim().is_empty()) {
            Some(output) => output,
            None => self.last_assistant_text(&session_id).await.unwrap_or_default(),
        };

        Ok(ExecutionResult {
            success: true,
            session_id: Some(session_id),
            output: Some(output),
            error: None,
        })
    }

    /// Consume session events until the session goes idle
    async fn follow(
        &self,
        session_id: &str,
        events: &mut BoxStream<'static, SessionEvent>,
        progress: &Option<mpsc::Sender<ExecutionProgress>>,
    ) -> SessionOutcome {
        let mut outcome = SessionOutcome::default();
        let mut finished_tools = HashSet::new();

        while let Some(event) = events.next().await {
            match event {
                SessionEvent::PartUpdated { session_id: sid, part } if sid == session_id => {
                    match part {
                        Part::Text { text } => outcome.last_output = Some(text),
                        Part::Tool {
                            id,
                            tool,
                            state: ToolState::Completed,
                        } => {
                            if finished_tools.insert(id) {
                                debug!(session_id, tool = %tool, "Tool completed");
                                report(
                                    progress,
                                    ExecutionProgress::ToolCompleted {
                                        tool,
                                        count: finished_tools.len(),
                                    },
                                )
                                .await;
                            }
                        }
                        _ => {}
                    }
                }
                SessionEvent::PermissionRequested {
                    session_id: sid,
                    permission_id,
                    tool,
                } if sid == session_id => {
                    let reply = if self.policy.allows(&tool) {
                        PermissionReply::Once
                    } else {
                        PermissionReply::Reject
                    };
                    info!(
                        session_id,
                        tool = %tool,
                        policy = self.policy.as_str(),
                        reply = reply.as_str(),
                        "Answering permission prompt"
                    );
                    if let Err(e) = self
                        .backend
                        .reply_permission(session_id, &permission_id, reply)
                        .await
                    {
                        warn!(session_id, error = %e, "Failed to answer permission prompt");
                    }
                }
                SessionEvent::Error {
                    session_id: sid,
                    error,
                } => match sid.as_deref() {
                    Some(s) if s == session_id => outcome.error = Some(error.describe()),
                    // The feed is shared by every session on the server
                    None => debug!(
                        session_id,
                        error = %error.describe(),
                        "Ignoring unscoped session error"
                    ),
                    Some(_) => {}
                },
                SessionEvent::Idle { session_id: sid } if sid == session_id => {
                    outcome.idle = true;
                    break;
                }
                _ => {}
            }
        }
        outcome
    }

    fn build_request(&self, task: &Task) -> PromptRequest {
        let agent = task.metadata_str("agent");
        let model = self
            .config
            .resolve_model(task.metadata_str("model"), agent)
            .and_then(|m| {
                let parsed = ModelRef::parse(&m);
                if parsed.is_none() {
                    warn!(task_id = %task.id, model = %m, "Ignoring model without provider prefix");
                }
                parsed
            });

        let mut parts = vec![PromptPart::Text {
            text: task.prompt_text().to_string(),
        }];
        parts.extend(
            task.attached_files()
                .into_iter()
                .map(|path| PromptPart::File { path }),
        );

        PromptRequest {
            model,
            agent: agent.map(str::to_string),
            parts,
        }
    }

    /// Most recent assistant text part in the session history
    async fn last_assistant_text(&self, session_id: &str) -> Option<String> {
        let messages = match self.backend.messages(session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to load session history");
                return None;
            }
        };
        messages
            .iter()
            .rev()
            .filter(|m| m.role == "assistant")
            .find_map(|m| {
                m.parts.iter().rev().find_map(|p| match p {
                    Part::Text { text } if !text.trim().is_empty() => Some(text.clone()),
                    _ => None,
                })
            })
    }

    async fn execute_prd(
        &self,
        task: &Task,
        prd_path: &str,
        progress: &Option<mpsc::Sender<ExecutionProgress>>,
    ) -> ExecutionResult {
        let mut path = PathBuf::from(prd_path);
        if path.is_relative() {
            if let Some(dir) = task.metadata_str("directory") {
                path = PathBuf::from(dir).join(path);
            }
        }

        let mut ralph_config = self.config.ralph.clone();
        if let Some(max) = task.metadata.get("max_iterations").and_then(Value::as_u64) {
            ralph_config.max_iterations = max as usize;
        }
        let agent = Arc::new(ProcessAgent::from_config(&ralph_config));

        info!(task_id = %task.id, prd = %path.display(), "Running PRD task");
        let mut ralph = match RalphLoop::new(path, ralph_config, agent).await {
            Ok(ralph) => ralph,
            Err(e) => return ExecutionResult::failed(None, format!("Failed to load PRD: {e:#}")),
        };
        report(progress, ExecutionProgress::Executing).await;

        match ralph.run().await {
            Ok(state) => {
                let summary = ralph.status_markdown();
                if state.status == RalphStatus::Completed {
                    ExecutionResult {
                        success: true,
                        session_id: None,
                        output: Some(summary),
                        error: None,
                    }
                } else {
                    ExecutionResult {
                        success: false,
                        session_id: None,
                        output: Some(summary),
                        error: Some(format!(
                            "Ralph finished {}: {}/{} stories passed",
                            state.status.as_str(),
                            state.prd.passed_count(),
                            state.prd.user_stories.len()
                        )),
                    }
                }
            }
            Err(e) => ExecutionResult::failed(None, format!("Ralph loop failed: {e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct ScriptedBackend {
        events: Vec<SessionEvent>,
        history: Vec<HistoryMessage>,
        fail_create: bool,
        prompts: Mutex<Vec<PromptRequest>>,
        replies: Mutex<Vec<(String, PermissionReply)>>,
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        async fn create_session(&self, _title: &str, _dir: Option<&str>) -> Result<String> {
            if self.fail_create {
                anyhow::bail!("session server unavailable");
            }
            Ok("ses_1".to_string())
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, SessionEvent>> {
            Ok(futures::stream::iter(self.events.clone()).boxed())
        }

        async fn prompt(&self, _session_id: &str, request: &PromptRequest) -> Result<()> {
            self.prompts.lock().push(request.clone());
            Ok(())
        }

        async fn reply_permission(
            &self,
            _session_id: &str,
            permission_id: &str,
            reply: PermissionReply,
        ) -> Result<()> {
            self.replies.lock().push((permission_id.to_string(), reply));
            Ok(())
        }

        async fn messages(&self, _session_id: &str) -> Result<Vec<HistoryMessage>> {
            Ok(self.history.clone())
        }
    }

    fn text(session: &str, text: &str) -> SessionEvent {
        SessionEvent::PartUpdated {
            session_id: session.into(),
            part: Part::Text { text: text.into() },
        }
    }

    fn tool_done(id: &str, tool: &str) -> SessionEvent {
        SessionEvent::PartUpdated {
            session_id: "ses_1".into(),
            part: Part::Tool {
                id: id.into(),
                tool: tool.into(),
                state: ToolState::Completed,
            },
        }
    }

    fn idle() -> SessionEvent {
        SessionEvent::Idle {
            session_id: "ses_1".into(),
        }
    }

    fn task(metadata: Value) -> Task {
        Task::from_payload(&json!({
            "id": "T1",
            "title": "Fix bug",
            "prompt": "Fix the bug",
            "metadata": metadata,
        }))
        .unwrap()
    }

    fn executor(backend: Arc<ScriptedBackend>, config: Config) -> TaskExecutor {
        TaskExecutor::new(backend, Arc::new(config))
    }

    #[tokio::test]
    async fn last_text_update_wins_and_tools_are_counted() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![
                text("ses_1", "Working"),
                tool_done("p1", "read"),
                tool_done("p1", "read"),
                text("other", "not ours"),
                tool_done("p2", "edit"),
                text("ses_1", "Done: fixed"),
                idle(),
                text("ses_1", "after idle"),
            ],
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(16);

        let result = executor(backend, Config::default())
            .execute(&task(json!({})), Some(tx))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.session_id.as_deref(), Some("ses_1"));
        assert_eq!(result.output.as_deref(), Some("Done: fixed"));

        let mut notices = Vec::new();
        while let Some(n) = rx.recv().await {
            notices.push(n);
        }
        assert_eq!(
            notices,
            vec![
                ExecutionProgress::SessionCreated {
                    session_id: "ses_1".into()
                },
                ExecutionProgress::Executing,
                ExecutionProgress::ToolCompleted {
                    tool: "read".into(),
                    count: 1
                },
                ExecutionProgress::ToolCompleted {
                    tool: "edit".into(),
                    count: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn session_error_fails_with_name_fallback() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![
                text("ses_1", "partial"),
                SessionEvent::Error {
                    session_id: Some("ses_1".into()),
                    error: SessionError {
                        name: "ProviderAuthError".into(),
                        message: None,
                    },
                },
                idle(),
            ],
            ..Default::default()
        });

        let result = executor(backend, Config::default())
            .execute(&task(json!({})), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("ProviderAuthError"));
    }

    #[tokio::test]
    async fn unscoped_and_foreign_errors_do_not_fail_the_task() {
        let unscoped = SessionEvent::Error {
            session_id: None,
            error: SessionError {
                name: "ProviderAuthError".into(),
                message: Some("another session's key expired".into()),
            },
        };
        let foreign = SessionEvent::Error {
            session_id: Some("ses_other".into()),
            error: SessionError {
                name: "APIError".into(),
                message: None,
            },
        };
        let backend = Arc::new(ScriptedBackend {
            events: vec![unscoped, foreign, text("ses_1", "done"), idle()],
            ..Default::default()
        });

        let result = executor(backend, Config::default())
            .execute(&task(json!({})), None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.error, None);
        assert_eq!(result.output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn stream_end_without_idle_is_a_failure() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![text("ses_1", "partial")],
            ..Default::default()
        });
        let result = executor(backend, Config::default())
            .execute(&task(json!({})), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.output.as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn history_fallback_uses_latest_assistant_text() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![idle()],
            history: vec![
                HistoryMessage {
                    role: "assistant".into(),
                    parts: vec![Part::Text { text: "old".into() }],
                },
                HistoryMessage {
                    role: "assistant".into(),
                    parts: vec![
                        Part::Text { text: "newest".into() },
                        Part::Other,
                    ],
                },
                HistoryMessage {
                    role: "user".into(),
                    parts: vec![Part::Text { text: "thanks".into() }],
                },
            ],
            ..Default::default()
        });
        let result = executor(backend, Config::default())
            .execute(&task(json!({})), None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("newest"));
    }

    #[tokio::test]
    async fn safe_policy_answers_each_prompt_once() {
        let ask = |id: &str, tool: &str| SessionEvent::PermissionRequested {
            session_id: "ses_1".into(),
            permission_id: id.into(),
            tool: tool.into(),
        };
        let backend = Arc::new(ScriptedBackend {
            events: vec![ask("perm1", "read"), ask("perm2", "bash"), ask("perm3", "read"), idle()],
            ..Default::default()
        });
        executor(backend.clone(), Config::default())
            .execute(&task(json!({})), None)
            .await
            .unwrap();

        assert_eq!(
            *backend.replies.lock(),
            vec![
                ("perm1".to_string(), PermissionReply::Once),
                ("perm2".to_string(), PermissionReply::Reject),
                ("perm3".to_string(), PermissionReply::Once),
            ]
        );
    }

    #[tokio::test]
    async fn none_policy_rejects_everything() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![
                SessionEvent::PermissionRequested {
                    session_id: "ses_1".into(),
                    permission_id: "perm1".into(),
                    tool: "read".into(),
                },
                idle(),
            ],
            ..Default::default()
        });
        executor(backend.clone(), Config::default())
            .with_policy(AutoApprovePolicy::None)
            .execute(&task(json!({})), None)
            .await
            .unwrap();
        assert_eq!(backend.replies.lock()[0].1, PermissionReply::Reject);
    }

    #[tokio::test]
    async fn request_carries_resolved_model_and_files() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![idle()],
            ..Default::default()
        });
        let mut config = Config {
            default_model: Some("openai/gpt-4o".into()),
            ..Default::default()
        };
        config.agents.insert(
            "build".into(),
            crate::config::AgentConfig {
                model: Some("anthropic/claude-sonnet".into()),
                description: None,
            },
        );

        executor(backend.clone(), config)
            .execute(
                &task(json!({"agent": "build", "files": ["src/main.rs"]})),
                None,
            )
            .await
            .unwrap();

        let prompts = backend.prompts.lock();
        let request = &prompts[0];
        assert_eq!(request.model.as_ref().map(|m| m.provider_id.as_str()), Some("anthropic"));
        assert_eq!(request.agent.as_deref(), Some("build"));
        assert_eq!(
            request.parts,
            vec![
                PromptPart::Text {
                    text: "Fix the bug".into()
                },
                PromptPart::File {
                    path: "src/main.rs".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn session_creation_failure_is_an_error() {
        let backend = Arc::new(ScriptedBackend {
            fail_create: true,
            ..Default::default()
        });
        let err = executor(backend, Config::default())
            .execute(&task(json!({})), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("T1"));
    }

    #[tokio::test]
    async fn missing_prd_is_a_failed_result() {
        let backend = Arc::new(ScriptedBackend::default());
        let result = executor(backend, Config::default())
            .execute(&task(json!({"prd_path": "/nonexistent/prd.json"})), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Failed to load PRD"));
    }
}
