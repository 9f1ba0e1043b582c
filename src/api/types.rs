//! Request and response shapes of the control operations.
//!
//! Field names are the canonical ones an outer transport exposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::ArtifactKind;
use crate::logs::{LogLevel, LogLine, LogStreamKind};
use crate::task::{Progress, ResourceRequest, Task, TaskFailure, TaskState};

/// Default page size for `list_tasks`.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Largest page `list_tasks` returns.
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tool_name: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub ttl_s: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub state: TaskState,
    /// Resource class the task was queued in.
    pub queue: String,
    /// Queued tasks ahead of this one (0 = next).
    pub position: u64,
    pub submitted_at: DateTime<Utc>,
    pub poll_after_ms: u64,
    /// True when an idempotency match was returned instead of a new task.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub state: TaskState,
    pub tool_name: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i64,
    pub queue: String,
    pub worker_id: Option<String>,
    pub tags: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Suggested delay before polling again; absent once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_after_ms: Option<u64>,
}

impl TaskStatus {
    pub fn from_task(task: Task, poll_interval_ms: u64) -> Self {
        let status_message = match task.state {
            TaskState::Failed => Some("Task failed".to_string()),
            TaskState::Cancelled => Some("Task cancelled".to_string()),
            _ => task.progress.as_ref().and_then(|p| p.message.clone()),
        };
        let poll_after_ms = task.state.is_active().then_some(poll_interval_ms);

        Self {
            task_id: task.task_id,
            state: task.state,
            tool_name: task.tool_name,
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            priority: task.priority,
            queue: task.resource_class,
            worker_id: task.worker_id,
            tags: task.tags,
            submitted_at: task.submitted_at,
            scheduled_at: task.scheduled_at,
            started_at: task.started_at,
            heartbeat_at: task.heartbeat_at,
            completed_at: task.completed_at,
            expires_at: task.expires_at,
            timeout_at: task.timeout_at,
            progress: task.progress,
            cancel_requested: task.cancel_requested,
            status_message,
            poll_after_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLineView {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub stream: LogStreamKind,
    pub level: LogLevel,
    pub message: String,
}

impl From<LogLine> for LogLineView {
    fn from(line: LogLine) -> Self {
        Self {
            seq: line.seq,
            ts: line.ts,
            stream: line.stream,
            level: line.level,
            message: line.message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    pub lines: Vec<LogLineView>,
    /// Opaque cursor to pass back for the next page.
    pub next_cursor: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub states: Vec<TaskState>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tags_any: Vec<String>,
    #[serde(default)]
    pub submitted_after: Option<DateTime<Utc>>,
    /// Restrict to one caller scope.
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub tool_name: String,
    pub state: TaskState,
    pub priority: i64,
    pub queue: String,
    pub attempt: u32,
    pub tags: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            tool_name: task.tool_name,
            state: task.state,
            priority: task.priority,
            queue: task.resource_class,
            attempt: task.attempt,
            tags: task.tags,
            submitted_at: task.submitted_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskList {
    pub tasks: Vec<TaskSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub state: TaskState,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactView {
    pub artifact_id: String,
    pub name: String,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    pub checksum: String,
    pub download_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub artifacts: Vec<ArtifactView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-class worker and queue counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub resource_class: String,
    pub idle: usize,
    pub leased: usize,
    pub draining: usize,
    pub queued: u64,
    pub queue_limit: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub queues: Vec<QueueStats>,
}
