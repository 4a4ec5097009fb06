//! Coding agent subprocess
//!
//! Each iteration runs the agent as a fresh process so no context leaks
//! between stories. The prompt goes in on stdin; stdout and stderr are
//! collected for marker and learnings extraction.

use super::types::RalphConfig;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How an agent run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTermination {
    Exited { success: bool },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub output: String,
    pub termination: AgentTermination,
}

/// Runs one isolated agent invocation
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        working_dir: &Path,
        cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<AgentOutput>;
}

/// Agent backed by a shell command
pub struct ProcessAgent {
    command: String,
    timeout: Duration,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn from_config(config: &RalphConfig) -> Self {
        Self::new(
            config.agent_command.clone(),
            Duration::from_secs(config.agent_timeout_secs),
        )
    }
}

#[async_trait]
impl AgentRunner for ProcessAgent {
    async fn run(
        &self,
        prompt: &str,
        working_dir: &Path,
        mut cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<AgentOutput> {
        debug!(command = %self.command, dir = %working_dir.display(), "Spawning agent");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn agent '{}': {}", self.command, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "Agent closed stdin before reading the full prompt");
                }
            });
        }

        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let termination = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait()) => match res {
                Ok(status) => AgentTermination::Exited { success: status?.success() },
                Err(_) => AgentTermination::TimedOut,
            },
            _ = cancelled(&mut cancel) => AgentTermination::Cancelled,
        };

        if !matches!(termination, AgentTermination::Exited { .. }) {
            warn!(?termination, "Killing agent process");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill agent process");
            }
        }

        // Grandchildren can keep the pipes open after a kill
        let grace = match termination {
            AgentTermination::Exited { .. } => Duration::MAX,
            _ => Duration::from_secs(2),
        };
        let stdout = collect(stdout, grace).await;
        let stderr = collect(stderr, grace).await;
        let output = if stderr.trim().is_empty() {
            stdout
        } else {
            format!("{}\n{}", stdout, stderr)
        };

        Ok(AgentOutput {
            output,
            termination,
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: tokio::task::JoinHandle<String>, grace: Duration) -> String {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

/// Resolves once the flag flips to true; never resolves if the sender is gone
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
