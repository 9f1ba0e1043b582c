//! Task Runner: executes one leased task to a terminal report.
//!
//! A runner confirms its lease (`scheduled → running`), keeps a heartbeat
//! loop alive while the tool runs, registers output artifacts, then commits
//! the terminal state with the same compare-and-swap every other writer
//! uses. If the record moved on without it (watchdog, cancel, requeue) the
//! late report is dropped.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{self, ArtifactRegistry};
use crate::context::ToolContext;
use crate::logs::{LogLevel, LogStream};
use crate::store::TaskStore;
use crate::task::{Task, TaskFailure, TaskPatch, TaskState, transition};
use crate::tools::{ToolError, ToolOutput, ToolRegistry};
use crate::worker::pool::WorkerPool;
use crate::worker::retry::{RetryPolicy, should_requeue};

/// Conflict retries for the terminal write before giving up.
const COMMIT_ATTEMPTS: usize = 3;

/// Everything a runner needs, shared by all runners.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Arc<dyn TaskStore>,
    pub pool: Arc<WorkerPool>,
    pub tools: Arc<ToolRegistry>,
    pub logs: Arc<LogStream>,
    pub artifacts: Arc<ArtifactRegistry>,
    pub retry: Arc<dyn RetryPolicy>,
    pub heartbeat_interval: Duration,
    pub artifact_dir: PathBuf,
}

/// Aborts the wrapped task when dropped, so an aborted runner takes its
/// heartbeat loop and tool future down with it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executes a single task on a single worker.
pub struct TaskRunner {
    deps: RunnerDeps,
    task: Task,
    worker_id: String,
    actor: String,
}

impl TaskRunner {
    pub fn new(deps: RunnerDeps, task: Task, worker_id: &str) -> Self {
        Self {
            deps,
            task,
            actor: format!("runner:{worker_id}"),
            worker_id: worker_id.to_string(),
        }
    }

    /// Run on a background task. The worker lease is released when the
    /// runner finishes, whatever the outcome.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let task_id = self.task.task_id;
            let pool = Arc::clone(&self.deps.pool);
            let worker_id = self.worker_id.clone();

            self.run().await;
            pool.release_task(&worker_id, task_id).await;
        })
    }

    async fn run(self) {
        let task_id = self.task.task_id;
        let store = self.deps.store.as_ref();

        // Lease confirmation.
        let running = match transition(
            store,
            &self.task,
            TaskPatch::started(&self.task, Utc::now()),
            &self.actor,
            Some("execution started"),
        )
        .await
        {
            Ok(task) => task,
            Err(e) if e.is_conflict() => {
                debug!(task_id = %task_id, worker_id = %self.worker_id, "Lease gone before start");
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to start task");
                return;
            }
        };

        info!(
            task_id = %task_id,
            tool = %running.tool_name,
            worker_id = %self.worker_id,
            attempt = running.attempt,
            "Task started"
        );
        self.deps
            .logs
            .system(
                task_id,
                LogLevel::Info,
                &format!(
                    "Attempt {} of {} started on {}",
                    running.attempt, running.max_attempts, self.worker_id
                ),
            )
            .await;

        let outcome = self.execute(&running).await;

        let outcome = match outcome {
            Ok(output) => {
                self.register_artifacts(&output).await;
                Ok(output)
            }
            Err(ToolError::LeaseLost) => {
                warn!(task_id = %task_id, worker_id = %self.worker_id, "Lease lost, dropping report");
                return;
            }
            Err(e) => Err(e),
        };

        self.commit(outcome).await;
    }

    /// Run the tool with a heartbeat loop alongside it.
    async fn execute(&self, running: &Task) -> Result<ToolOutput, ToolError> {
        let Some(tool) = self.deps.tools.get(&running.tool_name).await else {
            return Err(ToolError::ExecutionFailed(format!(
                "unknown tool '{}'",
                running.tool_name
            )));
        };

        let (lease_tx, lease_rx) = watch::channel(false);
        let _heartbeat = AbortOnDrop(tokio::spawn(heartbeat_loop(
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.pool),
            running.task_id,
            self.worker_id.clone(),
            self.deps.heartbeat_interval,
            lease_tx,
        )));

        let ctx = ToolContext::new(
            running,
            &self.worker_id,
            &self.deps.artifact_dir,
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.logs),
            lease_rx.clone(),
        );
        let params = running.inputs.clone();
        let mut tool_task = AbortOnDrop(tokio::spawn(async move {
            tool.execute(params, &ctx).await
        }));

        tokio::select! {
            joined = &mut tool_task.0 => match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(ToolError::ExecutionFailed("tool panicked".to_string())),
                Err(e) => Err(ToolError::ExecutionFailed(e.to_string())),
            },
            _ = wait_lease_lost(lease_rx) => Err(ToolError::LeaseLost),
        }
    }

    /// Register every explicit and discovered output file before the terminal write.
    async fn register_artifacts(&self, output: &ToolOutput) {
        let task_id = self.task.task_id;
        let paths: BTreeSet<PathBuf> = output
            .artifacts
            .iter()
            .cloned()
            .chain(artifacts::discover_paths(&output.result))
            .collect();

        for path in paths {
            match self
                .deps
                .artifacts
                .register_file(task_id, &self.worker_id, &path)
                .await
            {
                Ok(artifact) => {
                    self.deps
                        .logs
                        .system(
                            task_id,
                            LogLevel::Info,
                            &format!("Registered artifact {} ({} bytes)", artifact.name, artifact.size_bytes),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(task_id = %task_id, path = %path.display(), error = %e, "Artifact not registered");
                    self.deps
                        .logs
                        .system(
                            task_id,
                            LogLevel::Warn,
                            &format!("Artifact {} not registered: {e}", path.display()),
                        )
                        .await;
                }
            }
        }
    }

    /// Write the terminal (or requeue) state, rereading on conflict.
    async fn commit(&self, outcome: Result<ToolOutput, ToolError>) {
        let task_id = self.task.task_id;
        let store = self.deps.store.as_ref();

        for _ in 0..COMMIT_ATTEMPTS {
            let current = match store.get_task(task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to reread task before commit");
                    continue;
                }
            };

            if current.worker_id.as_deref() != Some(self.worker_id.as_str())
                || current.attempt != self.task.attempt
                || !current.state.is_executing()
            {
                warn!(
                    task_id = %task_id,
                    worker_id = %self.worker_id,
                    state = %current.state,
                    "Task no longer owned, dropping late report"
                );
                return;
            }

            let (patch, reason) = self.decide(&current, &outcome);
            let patch = patch.at_version_of(&current);
            let to = patch.state;
            match transition(store, &current, patch, &self.actor, Some(&reason)).await {
                Ok(done) => {
                    info!(task_id = %task_id, state = %done.state, attempt = done.attempt, "Task finished");
                    self.deps
                        .logs
                        .system(task_id, LogLevel::Info, &format!("Task {to}: {reason}"))
                        .await;
                    return;
                }
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task_id, "Terminal write raced, rereading");
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to record task outcome");
                    return;
                }
            }
        }

        warn!(task_id = %task_id, "Gave up recording task outcome after repeated conflicts");
    }

    /// Map the current record and the tool outcome onto the next patch.
    fn decide(&self, current: &Task, outcome: &Result<ToolOutput, ToolError>) -> (TaskPatch, String) {
        let now = Utc::now();
        let cancel_message = || {
            current
                .cancel_reason
                .clone()
                .unwrap_or_else(|| "cancelled by request".to_string())
        };

        match (current.state, outcome) {
            // Cancellation acknowledged: teardown is confirmed by returning.
            (TaskState::Cancelling, _) => (
                TaskPatch::finished(current, TaskState::Cancelled, TaskFailure::cancelled(cancel_message()), now),
                "teardown confirmed".to_string(),
            ),
            (_, Ok(output)) => (
                TaskPatch::succeeded(current, output.result.clone(), output.metrics.clone(), now),
                "tool returned".to_string(),
            ),
            (TaskState::CancelRequested, Err(ToolError::Cancelled)) => (
                TaskPatch::finished(current, TaskState::Cancelled, TaskFailure::cancelled(cancel_message()), now),
                "tool stopped on cancel".to_string(),
            ),
            (TaskState::CancelRequested, Err(e)) => (
                TaskPatch::finished(current, TaskState::Failed, failure_for(e), now),
                "tool failed during cancel".to_string(),
            ),
            (_, Err(e)) => {
                let failure = failure_for(e);
                if should_requeue(
                    self.deps.retry.as_ref(),
                    &failure,
                    current.attempt,
                    current.max_attempts,
                ) {
                    (TaskPatch::requeued(current, now), format!("retrying after {}: {}", failure.kind, failure.message))
                } else {
                    (
                        TaskPatch::finished(current, TaskState::Failed, failure, now),
                        "tool failed".to_string(),
                    )
                }
            }
        }
    }
}

/// Structured failure for a tool error. The tool's message is kept verbatim.
fn failure_for(error: &ToolError) -> TaskFailure {
    match error {
        ToolError::Cancelled => {
            TaskFailure::tool_error("tool reported cancellation without a cancel request", false)
        }
        e => TaskFailure::tool_error(e.to_string(), e.is_retryable()),
    }
}

/// Record liveness every `interval` until the lease disappears.
async fn heartbeat_loop(
    store: Arc<dyn TaskStore>,
    pool: Arc<WorkerPool>,
    task_id: Uuid,
    worker_id: String,
    interval: Duration,
    lease_lost: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The start transition already stamped heartbeat_at.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let now = Utc::now();
        match store.record_heartbeat(task_id, &worker_id, now).await {
            Ok(true) => pool.touch(&worker_id, now).await,
            Ok(false) => {
                debug!(task_id = %task_id, worker_id = %worker_id, "Heartbeat rejected, lease lost");
                let _ = lease_lost.send(true);
                return;
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Heartbeat write failed"),
        }
    }
}

async fn wait_lease_lost(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|lost| *lost).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::task::{FailureKind, NewTask, ResourceRequest};
    use crate::tools::Tool;
    use crate::tools::builtin::EchoTool;
    use crate::worker::retry::{RetryableErrors, WorkerLostOnly};

    struct FlakyTool;

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "Fails with a transient error"
        }

        async fn execute(&self, _: serde_json::Value, _: &ToolContext) -> Result<ToolOutput, ToolError> {
            Err(ToolError::Transient("resource busy".into()))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }

        fn description(&self) -> &str {
            "Panics"
        }

        async fn execute(&self, _: serde_json::Value, _: &ToolContext) -> Result<ToolOutput, ToolError> {
            panic!("boom")
        }
    }

    async fn deps(retry: Arc<dyn RetryPolicy>) -> (RunnerDeps, tempfile::TempDir) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(EchoTool)).await;
        tools.register(Arc::new(FlakyTool)).await;
        tools.register(Arc::new(PanicTool)).await;
        let dir = tempfile::tempdir().unwrap();
        let deps = RunnerDeps {
            logs: Arc::new(LogStream::new(Arc::clone(&store))),
            artifacts: Arc::new(ArtifactRegistry::new(Arc::clone(&store), None)),
            pool: Arc::new(WorkerPool::new(Arc::new(Notify::new()))),
            store,
            tools,
            retry,
            heartbeat_interval: Duration::from_millis(50),
            artifact_dir: dir.path().to_path_buf(),
        };
        (deps, dir)
    }

    async fn scheduled(deps: &RunnerDeps, tool: &str, max_attempts: u32) -> (Task, String) {
        deps.pool.register("default", 1).await;
        let task = Task::queued(
            NewTask {
                tool_name: tool.into(),
                inputs: serde_json::json!({"message": "hi"}),
                caller_scope: "anon".into(),
                resources: ResourceRequest::default(),
                max_runtime_s: 60,
                priority: 0,
                ttl_s: 60,
                idempotency_key: None,
                max_attempts,
                tags: vec![],
            },
            Utc::now(),
        );
        deps.store.create_task(&task, 10).await.unwrap();
        let worker = deps.pool.lease("default").await.unwrap();
        let task = deps
            .store
            .update_task(task.task_id, TaskState::Queued, TaskPatch::scheduled(&worker, Utc::now()))
            .await
            .unwrap();
        deps.pool.bind(&worker, task.task_id).await;
        (task, worker)
    }

    #[tokio::test]
    async fn success_releases_worker() {
        let (deps, _dir) = deps(Arc::new(WorkerLostOnly)).await;
        let (task, worker) = scheduled(&deps, "echo", 1).await;

        TaskRunner::new(deps.clone(), task.clone(), &worker).spawn().await.unwrap();

        let done = deps.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.result.unwrap()["message"], "hi");
        assert!(done.worker_id.is_none());
        assert_eq!(deps.pool.idle_count("default").await, 1);

        let lines = deps.store.read_logs(task.task_id, 0, 10).await.unwrap();
        assert!(lines.iter().any(|l| l.message.starts_with("Attempt 1 of 1")));
    }

    #[tokio::test]
    async fn transient_failure_requeues_under_retry_policy() {
        let (deps, _dir) = deps(Arc::new(RetryableErrors)).await;
        let (task, worker) = scheduled(&deps, "flaky", 2).await;

        TaskRunner::new(deps.clone(), task.clone(), &worker).spawn().await.unwrap();
        let after = deps.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(after.state, TaskState::Queued);
        assert_eq!(after.attempt, 2);
    }

    #[tokio::test]
    async fn tool_error_is_final_by_default() {
        let (deps, _dir) = deps(Arc::new(WorkerLostOnly)).await;
        let (task, worker) = scheduled(&deps, "flaky", 3).await;

        TaskRunner::new(deps.clone(), task.clone(), &worker).spawn().await.unwrap();
        let after = deps.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(after.state, TaskState::Failed);
        let error = after.error.unwrap();
        assert_eq!(error.kind, FailureKind::ToolError);
        assert!(error.retryable);
        assert!(error.message.contains("resource busy"));
    }

    #[tokio::test]
    async fn panic_becomes_tool_error() {
        let (deps, _dir) = deps(Arc::new(WorkerLostOnly)).await;
        let (task, worker) = scheduled(&deps, "panic", 1).await;

        TaskRunner::new(deps.clone(), task.clone(), &worker).spawn().await.unwrap();
        let after = deps.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(after.state, TaskState::Failed);
        assert_eq!(after.error.unwrap().message, "Execution failed: tool panicked");
    }

    #[tokio::test]
    async fn cancelled_before_start_is_not_run() {
        let (deps, _dir) = deps(Arc::new(WorkerLostOnly)).await;
        let (task, worker) = scheduled(&deps, "echo", 1).await;
        deps.store
            .update_task(
                task.task_id,
                TaskState::Scheduled,
                TaskPatch::cancelled_before_start(&task, None, Utc::now()),
            )
            .await
            .unwrap();

        TaskRunner::new(deps.clone(), task.clone(), &worker).spawn().await.unwrap();
        let after = deps.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(after.state, TaskState::Cancelled);
        assert!(after.started_at.is_none());
        assert_eq!(deps.pool.idle_count("default").await, 1);
    }

    #[tokio::test]
    async fn completion_during_cancel_request_wins() {
        let (deps, _dir) = deps(Arc::new(WorkerLostOnly)).await;
        let (task, worker) = scheduled(&deps, "echo", 1).await;
        let runner = TaskRunner::new(deps.clone(), task.clone(), &worker);

        let mut current = task.clone();
        current.state = TaskState::CancelRequested;
        let (patch, _) = runner.decide(&current, &Ok(ToolOutput::success(serde_json::json!(1))));
        assert_eq!(patch.state, TaskState::Succeeded);

        current.state = TaskState::Cancelling;
        let (patch, _) = runner.decide(&current, &Ok(ToolOutput::success(serde_json::json!(1))));
        assert_eq!(patch.state, TaskState::Cancelled);
        assert_eq!(patch.error.unwrap().kind, FailureKind::Cancelled);
    }
}
