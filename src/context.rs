//! Tool context: what a running tool can see and report through.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::logs::{LogLevel, LogStream, LogStreamKind};
use crate::store::TaskStore;
use crate::task::{Progress, Task, TaskPatch, TaskState, transition};
use crate::tools::ToolError;

/// Context handed to a tool by its runner.
pub struct ToolContext {
    task_id: Uuid,
    worker_id: String,
    attempt: u32,
    output_dir: PathBuf,
    store: Arc<dyn TaskStore>,
    logs: Arc<LogStream>,
    /// Flips to true when the heartbeat loop finds the lease gone.
    lease_lost: watch::Receiver<bool>,
}

impl ToolContext {
    pub fn new(
        task: &Task,
        worker_id: &str,
        output_root: &Path,
        store: Arc<dyn TaskStore>,
        logs: Arc<LogStream>,
        lease_lost: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id: task.task_id,
            worker_id: worker_id.to_string(),
            attempt: task.attempt,
            output_dir: output_root.join(task.task_id.to_string()),
            store,
            logs,
            lease_lost,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Directory reserved for this task's output files. Not created eagerly.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Append a stdout line to the task log.
    pub async fn log(&self, level: LogLevel, message: &str) {
        self.write(LogStreamKind::Stdout, level, message).await;
    }

    /// Append a stderr line to the task log.
    pub async fn log_stderr(&self, message: &str) {
        self.write(LogStreamKind::Stderr, LogLevel::Error, message).await;
    }

    async fn write(&self, stream: LogStreamKind, level: LogLevel, message: &str) {
        if let Err(e) = self.logs.append(self.task_id, stream, level, message).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "Dropped tool log line");
        }
    }

    /// Publish a progress snapshot. Ignored once the lease is gone.
    pub async fn progress(&self, progress: Progress) {
        match self
            .store
            .record_progress(self.task_id, &self.worker_id, &progress, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task_id = %self.task_id, "Progress dropped, task no longer owned")
            }
            Err(e) => tracing::warn!(task_id = %self.task_id, error = %e, "Failed to record progress"),
        }
    }

    /// True once the heartbeat loop observed the lease being taken away.
    pub fn lease_lost(&self) -> bool {
        *self.lease_lost.borrow()
    }

    /// Cheap read of the cancellation flag.
    pub async fn cancel_requested(&self) -> bool {
        matches!(
            self.store.get_task(self.task_id).await,
            Ok(Some(task)) if task.cancel_requested
        )
    }

    /// Cooperative checkpoint. Returns `Err(ToolError::Cancelled)` after
    /// acknowledging a pending cancellation, `Err(ToolError::LeaseLost)` if
    /// this runner no longer owns the task, otherwise `Ok(())`.
    pub async fn checkpoint(&self) -> Result<(), ToolError> {
        if self.lease_lost() {
            return Err(ToolError::LeaseLost);
        }

        let task = match self.store.get_task(self.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return Err(ToolError::LeaseLost),
            Err(e) => {
                // Store hiccup: keep working, the next checkpoint rereads.
                tracing::warn!(task_id = %self.task_id, error = %e, "Checkpoint read failed");
                return Ok(());
            }
        };
        if task.worker_id.as_deref() != Some(self.worker_id.as_str()) {
            return Err(ToolError::LeaseLost);
        }

        match task.state {
            TaskState::Running => Ok(()),
            TaskState::Cancelling => Err(ToolError::Cancelled),
            TaskState::CancelRequested => {
                let actor = format!("runner:{}", self.worker_id);
                match transition(
                    self.store.as_ref(),
                    &task,
                    TaskPatch::to(TaskState::Cancelling),
                    &actor,
                    Some("cancellation acknowledged"),
                )
                .await
                {
                    Ok(_) => {
                        self.logs
                            .system(self.task_id, LogLevel::Warn, "Cancellation acknowledged")
                            .await;
                        Err(ToolError::Cancelled)
                    }
                    // Someone else moved the task first (watchdog, completion).
                    Err(e) if e.is_conflict() => Err(ToolError::LeaseLost),
                    Err(e) => {
                        tracing::warn!(task_id = %self.task_id, error = %e, "Failed to acknowledge cancel");
                        Err(ToolError::Cancelled)
                    }
                }
            }
            _ => Err(ToolError::LeaseLost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::task::{NewTask, ResourceRequest};

    async fn running_task(store: &Arc<dyn TaskStore>, worker: &str) -> Task {
        let task = Task::queued(
            NewTask {
                tool_name: "sleep".into(),
                inputs: serde_json::json!({}),
                caller_scope: "anon".into(),
                resources: ResourceRequest::default(),
                max_runtime_s: 60,
                priority: 0,
                ttl_s: 60,
                idempotency_key: None,
                max_attempts: 1,
                tags: vec![],
            },
            Utc::now(),
        );
        store.create_task(&task, 10).await.unwrap();
        let t = store
            .update_task(task.task_id, TaskState::Queued, TaskPatch::scheduled(worker, Utc::now()))
            .await
            .unwrap();
        store
            .update_task(t.task_id, TaskState::Scheduled, TaskPatch::started(&t, Utc::now()))
            .await
            .unwrap()
    }

    async fn context_for(worker: &str) -> (ToolContext, Arc<dyn TaskStore>, Task, watch::Sender<bool>) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let logs = Arc::new(LogStream::new(Arc::clone(&store)));
        let task = running_task(&store, worker).await;
        let (tx, rx) = watch::channel(false);
        let ctx = ToolContext::new(&task, worker, Path::new("/tmp/out"), Arc::clone(&store), logs, rx);
        (ctx, store, task, tx)
    }

    #[tokio::test]
    async fn checkpoint_passes_while_running() {
        let (ctx, _store, task, _tx) = context_for("w-1").await;
        assert!(ctx.checkpoint().await.is_ok());
        assert_eq!(ctx.output_dir(), Path::new("/tmp/out").join(task.task_id.to_string()));
    }

    #[tokio::test]
    async fn checkpoint_acknowledges_cancel() {
        let (ctx, store, task, _tx) = context_for("w-1").await;
        store
            .update_task(task.task_id, TaskState::Running, TaskPatch::cancel_requested(None))
            .await
            .unwrap();

        assert!(ctx.cancel_requested().await);
        assert!(matches!(ctx.checkpoint().await, Err(ToolError::Cancelled)));
        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Cancelling);
        // Repeated checkpoints keep reporting cancellation.
        assert!(matches!(ctx.checkpoint().await, Err(ToolError::Cancelled)));
    }

    #[tokio::test]
    async fn checkpoint_reports_lost_lease() {
        let (ctx, _store, _task, tx) = context_for("w-1").await;
        tx.send(true).unwrap();
        assert!(matches!(ctx.checkpoint().await, Err(ToolError::LeaseLost)));
    }
}
