//! A2A Worker - connects to the broker to process tasks

use super::client::BrokerClient;
use super::registry::ProcessingSet;
use super::stream::{SseDecoder, StreamEvent};
use super::types::*;
use crate::notify::{NotificationEvent, NotificationType, Notifier};
use crate::session::{ExecutionProgress, TaskExecutor};
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Reconnect timing
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Wait after a clean stream close, before re-polling and reconnecting
    pub reconnect_delay: Duration,
    /// Wait after a failed connection attempt
    pub retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// The long-running worker
pub struct Worker {
    broker: BrokerClient,
    executor: Arc<TaskExecutor>,
    notifier: Notifier,
    processing: ProcessingSet,
    options: WorkerOptions,
    connected: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(broker: BrokerClient, executor: Arc<TaskExecutor>, notifier: Notifier) -> Self {
        Self {
            broker,
            executor,
            notifier,
            processing: ProcessingSet::new(),
            options: WorkerOptions::default(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn identity(&self) -> &WorkerIdentity {
        self.broker.identity()
    }

    pub fn processing(&self) -> &ProcessingSet {
        &self.processing
    }

    /// Whether the offer stream is currently open
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    /// Register, backfill, then consume the offer stream forever
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let identity = self.identity().clone();
        tracing::info!(
            worker_id = %identity.worker_id,
            "Starting worker: {}",
            identity.name
        );
        tracing::info!("Server: {}", self.broker.base_url());
        tracing::info!("Codebases: {:?}", identity.codebases);

        match self.broker.register().await {
            Ok(()) => tracing::info!("Worker registered successfully"),
            Err(e) => tracing::warn!(error = %e, "Failed to register worker"),
        }

        self.notifier
            .send(
                &NotificationEvent::new(
                    NotificationType::WorkerStarted,
                    format!("Worker {} started", identity.name),
                    format!("Serving codebases: {}", identity.codebases.join(", ")),
                )
                .with_meta("worker_id", &identity.worker_id),
            )
            .await;

        self.backfill().await;

        loop {
            match self.consume_stream().await {
                Ok(()) => {
                    tracing::warn!("Stream ended, reconnecting...");
                    tokio::time::sleep(self.options.reconnect_delay).await;
                    self.backfill().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stream error, retrying...");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        }
    }

    /// Poll pending tasks once and dispatch any not already in flight
    async fn backfill(self: &Arc<Self>) {
        tracing::info!("Checking for pending tasks...");
        match self.broker.pending_tasks().await {
            Ok(tasks) => {
                tracing::info!("Found {} pending task(s)", tasks.len());
                for task in tasks {
                    self.dispatch(task);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to fetch pending tasks"),
        }
    }

    /// Read the offer stream until it closes
    async fn consume_stream(self: &Arc<Self>) -> Result<()> {
        let res = self.broker.open_stream().await?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to task stream");

        let mut body = res.bytes_stream();
        let mut decoder = SseDecoder::default();
        let result: Result<()> = loop {
            let chunk = match body.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            };
            for frame in decoder.push(&chunk) {
                match StreamEvent::decode(&frame) {
                    Some(StreamEvent::TaskOffer(task)) => self.dispatch(task),
                    Some(StreamEvent::Connected { worker_id }) => {
                        tracing::debug!(?worker_id, "Stream acknowledged")
                    }
                    Some(StreamEvent::Heartbeat) => tracing::trace!("Heartbeat"),
                    Some(StreamEvent::Unknown { event }) => {
                        tracing::debug!(event = %event, "Ignoring stream event")
                    }
                    None => tracing::warn!(
                        event = ?frame.event,
                        "Dropping malformed stream event"
                    ),
                }
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        result
    }

    /// Start handling a task unless it is already in flight. Never blocks.
    fn dispatch(self: &Arc<Self>, task: Task) {
        let Some(guard) = self.processing.try_begin(&task.id) else {
            tracing::debug!(task_id = %task.id, "Task already in flight, ignoring offer");
            return;
        };

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let task_id = task.id.clone();
            if let Err(e) = worker.handle_task(task).await {
                tracing::error!(task_id = %task_id, error = %e, "Task handling failed");
            }
        });
    }

    /// Claim, execute, release, notify
    async fn handle_task(&self, task: Task) -> Result<()> {
        tracing::info!(task_id = %task.id, "Handling task: {}", task.title);

        match self.broker.claim(&task.id).await? {
            ClaimOutcome::Claimed => tracing::info!(task_id = %task.id, "Claimed task"),
            ClaimOutcome::Rejected { status, reason } => {
                tracing::info!(task_id = %task.id, status, reason = %reason, "Claim rejected");
                return Ok(());
            }
        }

        self.notify_task(&task, NotificationType::TaskStarted, "Task started", None)
            .await;
        self.report_status(&task.id, Activity::CreatingSession, None)
            .await;

        let (tx, rx) = mpsc::channel(32);
        let forwarder = tokio::spawn(forward_progress(self.broker.clone(), task.id.clone(), rx));

        let executed = self.executor.execute(&task, Some(tx)).await;
        if let Err(e) = forwarder.await {
            tracing::debug!(error = %e, "Progress forwarder ended abnormally");
        }

        let result = match executed {
            Ok(result) => result,
            Err(e) => {
                // No session means nothing ran; the task is abandoned locally
                tracing::error!(task_id = %task.id, error = %e, "Failed to start task");
                self.notify_task(
                    &task,
                    NotificationType::TaskFailed,
                    "Task failed",
                    Some(format!("{e:#}")),
                )
                .await;
                return Ok(());
            }
        };

        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        if let Some(ref session_id) = result.session_id {
            if let Err(e) = self
                .broker
                .sync_session(session_id, &task.id, status.as_str())
                .await
            {
                tracing::warn!(task_id = %task.id, error = %e, "Session sync failed");
            }
        }

        let text = if result.success {
            result.output.clone().unwrap_or_default()
        } else {
            result
                .error
                .clone()
                .unwrap_or_else(|| "Task failed".to_string())
        };
        if let Err(e) = self.broker.release(&task.id, status, &text).await {
            tracing::warn!(task_id = %task.id, error = %e, "Release failed");
        }

        if result.success {
            tracing::info!(task_id = %task.id, "Task completed");
            self.notify_task(&task, NotificationType::TaskCompleted, "Task completed", result.output)
                .await;
        } else {
            tracing::warn!(task_id = %task.id, error = %text, "Task failed");
            self.notify_task(&task, NotificationType::TaskFailed, "Task failed", Some(text))
                .await;
        }
        Ok(())
    }

    async fn report_status(&self, task_id: &str, activity: Activity, tool_count: Option<usize>) {
        let update = StatusUpdate::working(&self.identity().worker_id, activity, tool_count);
        if let Err(e) = self.broker.update_status(task_id, &update).await {
            tracing::debug!(task_id, error = %e, "Status update failed");
        }
    }

    async fn notify_task(
        &self,
        task: &Task,
        kind: NotificationType,
        verb: &str,
        detail: Option<String>,
    ) {
        let title = if task.title.is_empty() {
            format!("{}: {}", verb, task.id)
        } else {
            format!("{}: {}", verb, task.title)
        };
        let event = NotificationEvent::new(kind, title, detail.unwrap_or_default())
            .with_meta("task_id", &task.id)
            .with_meta("worker", &self.identity().name)
            .with_meta("worker_id", &self.identity().worker_id);
        self.notifier.send(&event).await;
    }

    /// Emit `worker_stopped`; called on process shutdown
    pub async fn announce_stopped(&self) {
        let identity = self.identity();
        self.notifier
            .send(
                &NotificationEvent::new(
                    NotificationType::WorkerStopped,
                    format!("Worker {} stopped", identity.name),
                    format!("{} task(s) were in flight", self.processing.len()),
                )
                .with_meta("worker_id", &identity.worker_id),
            )
            .await;
    }
}

/// Turn executor progress into best-effort broker reports
async fn forward_progress(
    broker: BrokerClient,
    task_id: String,
    mut rx: mpsc::Receiver<ExecutionProgress>,
) {
    let worker_id = broker.identity().worker_id.clone();
    while let Some(notice) = rx.recv().await {
        let outcome = match notice {
            ExecutionProgress::SessionCreated { session_id } => broker
                .sync_session(&session_id, &task_id, "running")
                .await,
            ExecutionProgress::Executing => {
                broker
                    .update_status(
                        &task_id,
                        &StatusUpdate::working(&worker_id, Activity::Executing, None),
                    )
                    .await
            }
            ExecutionProgress::ToolCompleted { tool, count } => {
                tracing::debug!(task_id = %task_id, tool = %tool, count, "Tool completed");
                broker
                    .update_status(
                        &task_id,
                        &StatusUpdate::working(&worker_id, Activity::ToolExecution, Some(count)),
                    )
                    .await
            }
        };
        if let Err(e) = outcome {
            tracing::debug!(task_id = %task_id, error = %e, "Progress report failed");
        }
    }
}
