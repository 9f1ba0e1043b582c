//! `TaskStore` trait: the single source of truth for task records, events,
//! log lines and artifact metadata.
//!
//! Every state change goes through `update_task`, a compare-and-swap on the
//! task's `state` column. Writers that lose the race get
//! `DatabaseError::Conflict` and must reread.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::artifacts::Artifact;
use crate::error::DatabaseError;
use crate::logs::{LogLevel, LogLine, LogStreamKind};
use crate::task::{CreateOutcome, Progress, Task, TaskEvent, TaskFilter, TaskPage, TaskPatch, TaskState};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Apply pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a queued task unless its resource class already holds
    /// `queue_limit` queued tasks or an idempotency match exists.
    async fn create_task(&self, task: &Task, queue_limit: u64)
    -> Result<CreateOutcome, DatabaseError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Compare-and-swap: apply `patch` only if the stored state equals `expected`.
    async fn update_task(
        &self,
        task_id: Uuid,
        expected: TaskState,
        patch: TaskPatch,
    ) -> Result<Task, DatabaseError>;

    async fn find_by_idempotency_key(
        &self,
        caller_scope: &str,
        tool_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Newest-first page of tasks matching `filter`, strictly older than `cursor`.
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        cursor: Option<Uuid>,
        limit: usize,
    ) -> Result<TaskPage, DatabaseError>;

    /// Unexpired queued tasks of a class in dispatch order
    /// (priority desc, submitted_at asc, task_id asc).
    async fn queued_candidates(
        &self,
        resource_class: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Number of queued tasks in a class.
    async fn queue_depth(&self, resource_class: &str) -> Result<u64, DatabaseError>;

    /// Number of queued tasks dispatched before `task`.
    async fn queue_position(&self, task: &Task) -> Result<u64, DatabaseError>;

    async fn tasks_in_states(&self, states: &[TaskState]) -> Result<Vec<Task>, DatabaseError>;

    /// Record liveness for an executing task owned by `worker_id`.
    /// Returns false when the worker no longer owns an executing task.
    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Replace the progress snapshot; same ownership guard as heartbeats.
    async fn record_progress(
        &self,
        task_id: Uuid,
        worker_id: &str,
        progress: &Progress,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Delete terminal tasks past `expires_at` with their events, logs and
    /// artifacts. Returns the number of tasks removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, event: &TaskEvent) -> Result<(), DatabaseError>;

    /// Events of a task in transition order.
    async fn list_events(&self, task_id: Uuid) -> Result<Vec<TaskEvent>, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    /// Append a line with the next per-task sequence number.
    async fn append_log(
        &self,
        task_id: Uuid,
        stream: LogStreamKind,
        level: LogLevel,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<LogLine, DatabaseError>;

    /// Lines with `seq > after_seq`, ascending.
    async fn read_logs(
        &self,
        task_id: Uuid,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>, DatabaseError>;

    // ── Artifacts ───────────────────────────────────────────────────

    /// Insert artifact metadata, or return the existing row for the same
    /// `(task_id, name)`.
    async fn insert_artifact(&self, artifact: &Artifact) -> Result<Artifact, DatabaseError>;

    async fn list_artifacts(&self, task_id: Uuid) -> Result<Vec<Artifact>, DatabaseError>;

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>, DatabaseError>;
}
