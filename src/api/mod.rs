//! Control API: the operation set an outer transport exposes.
//!
//! Pure orchestration over the store, log stream, artifact registry and
//! worker pool. Reads never wait on execution; `submit_task` waits only on
//! the admission insert.

pub mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::artifacts::ArtifactRegistry;
use crate::config::EngineConfig;
use crate::error::ControlError;
use crate::logs::{self, LogLevel, LogStream};
use crate::store::TaskStore;
use crate::task::transition::creation_event;
use crate::task::{CreateOutcome, NewTask, Task, TaskEvent, TaskFilter, TaskPatch, TaskState, transition};
use crate::tools::{ToolDescriptor, ToolRegistry};
use crate::worker::{WorkerPool, WorkerState};

pub use types::*;

/// CAS retries for a cancel racing other writers.
const CANCEL_ATTEMPTS: usize = 3;

const ACTOR: &str = "api";

pub struct ControlApi {
    store: Arc<dyn TaskStore>,
    tools: Arc<ToolRegistry>,
    pool: Arc<WorkerPool>,
    logs: Arc<LogStream>,
    artifacts: Arc<ArtifactRegistry>,
    config: Arc<EngineConfig>,
    /// Wakes the scheduler after a submission.
    wake: Arc<Notify>,
}

impl ControlApi {
    pub fn new(
        store: Arc<dyn TaskStore>,
        tools: Arc<ToolRegistry>,
        pool: Arc<WorkerPool>,
        logs: Arc<LogStream>,
        artifacts: Arc<ArtifactRegistry>,
        config: Arc<EngineConfig>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            tools,
            pool,
            logs,
            artifacts,
            config,
            wake,
        }
    }

    /// Submit a task on behalf of `caller_scope`.
    ///
    /// A repeated `(caller_scope, tool_name, idempotency_key)` returns the
    /// original task instead of creating a new one.
    pub async fn submit_task(
        &self,
        caller_scope: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, ControlError> {
        let new = self.validate(caller_scope, request).await?;
        let queue = new.resources.resource_class.clone();
        let limit = self.config.queue_limit(&queue);
        let task = Task::queued(new, Utc::now());

        match self.store.create_task(&task, limit).await? {
            CreateOutcome::Created(task) => {
                if let Err(e) = self.store.append_event(&creation_event(&task, ACTOR)).await {
                    tracing::warn!(task_id = %task.task_id, error = %e, "Failed to record creation event");
                }
                let position = self.store.queue_position(&task).await?;
                info!(
                    task_id = %task.task_id,
                    tool = %task.tool_name,
                    queue = %queue,
                    priority = task.priority,
                    position,
                    "Task submitted"
                );
                self.wake.notify_one();
                Ok(self.submit_response(task, position, false))
            }
            CreateOutcome::Existing(task) => {
                debug!(task_id = %task.task_id, "Idempotent resubmission");
                let position = if task.state == TaskState::Queued {
                    self.store.queue_position(&task).await?
                } else {
                    0
                };
                Ok(self.submit_response(task, position, true))
            }
            CreateOutcome::QueueFull { depth, limit } => {
                info!(queue = %queue, depth, limit, "Submission rejected, queue full");
                Err(ControlError::QueueFull { queue, depth, limit })
            }
        }
    }

    async fn validate(&self, caller_scope: &str, request: SubmitRequest) -> Result<NewTask, ControlError> {
        let tool_name = request.tool_name.trim().to_string();
        if tool_name.is_empty() {
            return Err(ControlError::InvalidRequest("tool_name is required".into()));
        }
        if !self.tools.has(&tool_name).await {
            return Err(ControlError::UnknownTool { name: tool_name });
        }

        let mut resources = request.resources;
        resources.resource_class = resources.resource_class.trim().to_string();
        if resources.resource_class.is_empty() {
            return Err(ControlError::InvalidRequest("resource_class must not be empty".into()));
        }

        let max_runtime_s = resources
            .max_runtime_s
            .unwrap_or(self.config.default_max_runtime.as_secs());
        if max_runtime_s == 0 {
            return Err(ControlError::InvalidRequest("max_runtime_s must be positive".into()));
        }
        resources.max_runtime_s = Some(max_runtime_s);

        let max_attempts = request.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(ControlError::InvalidRequest("max_attempts must be at least 1".into()));
        }

        let inputs = match request.inputs {
            serde_json::Value::Null => serde_json::json!({}),
            inputs => inputs,
        };

        // Tags are a set.
        let tags: Vec<String> = request
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(NewTask {
            tool_name,
            inputs,
            caller_scope: caller_scope.to_string(),
            resources,
            max_runtime_s,
            priority: request.priority,
            ttl_s: request.ttl_s.unwrap_or(self.config.default_ttl.as_secs()),
            idempotency_key: request
                .idempotency_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            max_attempts,
            tags,
        })
    }

    fn submit_response(&self, task: Task, position: u64, deduplicated: bool) -> SubmitResponse {
        SubmitResponse {
            task_id: task.task_id,
            state: task.state,
            queue: task.resource_class,
            position,
            submitted_at: task.submitted_at,
            poll_after_ms: self.config.poll_interval_ms,
            deduplicated,
        }
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ControlError> {
        let task = self.load(task_id).await?;
        Ok(TaskStatus::from_task(task, self.config.poll_interval_ms))
    }

    pub async fn tail_task_logs(
        &self,
        task_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<LogTail, ControlError> {
        let task = self.load(task_id).await?;
        let after = logs::parse_cursor(cursor).ok_or_else(|| {
            ControlError::InvalidRequest(format!("invalid log cursor '{}'", cursor.unwrap_or_default()))
        })?;

        let page = self.logs.tail(task.task_id, after, limit).await?;
        Ok(LogTail {
            lines: page.lines.into_iter().map(LogLineView::from).collect(),
            next_cursor: page.next_cursor.to_string(),
            truncated: page.truncated,
        })
    }

    pub async fn list_tasks(&self, request: ListRequest) -> Result<TaskList, ControlError> {
        let cursor = match request.cursor.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                Uuid::parse_str(raw)
                    .map_err(|_| ControlError::InvalidRequest(format!("invalid list cursor '{raw}'")))?,
            ),
        };
        let limit = request
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        let filter = TaskFilter {
            states: request.states,
            tool_name: request.tool_name,
            tags_any: request.tags_any,
            submitted_after: request.submitted_after,
            caller_scope: request.caller,
        };
        let page = self.store.list_tasks(&filter, cursor, limit).await?;
        Ok(TaskList {
            tasks: page.tasks.into_iter().map(TaskSummary::from).collect(),
            next_cursor: page.next_cursor.map(|id| id.to_string()),
        })
    }

    /// Request cancellation. Returns immediately; a running task reaches
    /// `cancelled` once its runner acknowledges at a checkpoint.
    pub async fn cancel_task(
        &self,
        task_id: &str,
        reason: Option<&str>,
    ) -> Result<CancelResponse, ControlError> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty()).map(str::to_string);

        for _ in 0..CANCEL_ATTEMPTS {
            let task = self.load(task_id).await?;
            let patch = match task.state {
                s if s.is_terminal() => return Ok(acknowledged(&task)),
                TaskState::CancelRequested | TaskState::Cancelling => return Ok(acknowledged(&task)),
                TaskState::Queued | TaskState::Scheduled => {
                    TaskPatch::cancelled_before_start(&task, reason.clone(), Utc::now())
                }
                _ => TaskPatch::cancel_requested(reason.clone()),
            };

            match transition(self.store.as_ref(), &task, patch, ACTOR, reason.as_deref()).await {
                Ok(updated) => {
                    info!(task_id = %updated.task_id, state = %updated.state, "Cancellation requested");
                    self.logs
                        .system(updated.task_id, LogLevel::Warn, "Cancellation requested")
                        .await;
                    if updated.state.is_terminal()
                        && let Some(worker_id) = task.worker_id.as_deref()
                    {
                        // Scheduled but not started: the runner never ran, free its slot now.
                        self.pool.release_task(worker_id, task.task_id).await;
                    }
                    return Ok(acknowledged(&updated));
                }
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task.task_id, "Cancel raced another writer, rereading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControlError::Conflict {
            task_id: task_id.to_string(),
        })
    }

    pub async fn get_task_result(&self, task_id: &str) -> Result<TaskResult, ControlError> {
        let task = self.load(task_id).await?;
        if !task.state.is_terminal() {
            return Err(ControlError::NotReady {
                task_id: task.task_id.to_string(),
                state: task.state.to_string(),
            });
        }

        let artifacts = self
            .artifacts
            .list(task.task_id)
            .await?
            .into_iter()
            .map(|a| ArtifactView {
                download_url: self.artifacts.download_url(&a),
                artifact_id: a.artifact_id,
                name: a.name,
                kind: a.kind,
                size_bytes: a.size_bytes,
                checksum: a.checksum,
                expires_at: task.expires_at,
            })
            .collect();

        Ok(TaskResult {
            task_id: task.task_id,
            state: task.state,
            result: task.result,
            artifacts,
            error: task.error,
            metrics: task.metrics,
            completed_at: task.completed_at,
        })
    }

    /// Transition history, oldest first.
    pub async fn list_task_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, ControlError> {
        let task = self.load(task_id).await?;
        Ok(self.store.list_events(task.task_id).await?)
    }

    pub async fn engine_stats(&self) -> Result<EngineStats, ControlError> {
        let workers = self.pool.snapshot().await;
        let mut classes: BTreeSet<String> = workers.iter().map(|w| w.resource_class.clone()).collect();
        classes.extend(self.config.pools.iter().map(|p| p.resource_class.clone()));

        let mut queues = Vec::with_capacity(classes.len());
        for class in classes {
            let mut stats = QueueStats {
                queued: self.store.queue_depth(&class).await?,
                queue_limit: self.config.queue_limit(&class),
                resource_class: class,
                ..Default::default()
            };
            for worker in workers.iter().filter(|w| w.resource_class == stats.resource_class) {
                match worker.state {
                    WorkerState::Idle => stats.idle += 1,
                    WorkerState::Leased => stats.leased += 1,
                    WorkerState::Draining => stats.draining += 1,
                }
            }
            queues.push(stats);
        }
        Ok(EngineStats { queues })
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.descriptors().await
    }

    /// Look up a task by its external id. Malformed ids are simply unknown.
    async fn load(&self, task_id: &str) -> Result<Task, ControlError> {
        let not_found = || ControlError::NotFound {
            task_id: task_id.to_string(),
        };
        let id = Uuid::parse_str(task_id.trim()).map_err(|_| not_found())?;
        self.store.get_task(id).await?.ok_or_else(not_found)
    }
}

fn acknowledged(task: &Task) -> CancelResponse {
    CancelResponse {
        task_id: task.task_id,
        state: task.state,
        acknowledged: true,
    }
}
