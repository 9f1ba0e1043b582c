//! Task records and the patches applied to them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::state::TaskState;

/// Failure category recorded on a terminal task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Heartbeats stopped; the worker is presumed gone.
    WorkerLost,
    /// Hard runtime budget exceeded.
    Timeout,
    /// The tool itself failed.
    ToolError,
    Cancelled,
    Expired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerLost => "worker_lost",
            Self::Timeout => "timeout",
            Self::ToolError => "tool_error",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error payload of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn worker_lost(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerLost, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message, false)
    }

    pub fn tool_error(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(FailureKind::ToolError, message, retryable)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message, false)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Expired, message, false)
    }
}

/// Structured progress reported by a running tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    pub fn step(step: u64, total_steps: u64) -> Self {
        let percent = if total_steps == 0 {
            None
        } else {
            Some((step as f64 / total_steps as f64 * 100.0).min(100.0))
        };
        Self {
            step: Some(step),
            total_steps: Some(total_steps),
            percent,
            ..Default::default()
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Resources requested by a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default = "default_resource_class")]
    pub resource_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

fn default_resource_class() -> String {
    "default".to_string()
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            resource_class: default_resource_class(),
            max_runtime_s: None,
            cpu: None,
            memory_mb: None,
        }
    }
}

/// Validated submission, ready to become a task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tool_name: String,
    pub inputs: serde_json::Value,
    pub caller_scope: String,
    pub resources: ResourceRequest,
    pub max_runtime_s: u64,
    pub priority: i64,
    pub ttl_s: u64,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
    pub tags: Vec<String>,
}

/// One submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub tool_name: String,
    pub inputs: serde_json::Value,
    /// Caller identity that scopes idempotency keys.
    pub caller_scope: String,
    pub resource_class: String,
    pub resources: ResourceRequest,
    pub max_runtime_s: u64,
    pub priority: i64,
    pub ttl_s: u64,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
    pub tags: Vec<String>,

    pub state: TaskState,
    /// 1-based attempt counter, never decreases.
    pub attempt: u32,
    pub worker_id: Option<String>,
    /// Monotonic: once set it is never cleared.
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub timeout_at: Option<DateTime<Utc>>,

    pub submitted_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub metrics: Option<serde_json::Value>,
    pub progress: Option<Progress>,

    /// Bumped by every compare-and-swap; orders the event history.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a freshly queued task. Queued tasks expire `ttl_s` after submission.
    pub fn queued(new: NewTask, now: DateTime<Utc>) -> Self {
        let resource_class = new.resources.resource_class.clone();
        Self {
            task_id: Uuid::now_v7(),
            expires_at: Some(now + secs(new.ttl_s)),
            tool_name: new.tool_name,
            inputs: new.inputs,
            caller_scope: new.caller_scope,
            resource_class,
            resources: new.resources,
            max_runtime_s: new.max_runtime_s,
            priority: new.priority,
            ttl_s: new.ttl_s,
            idempotency_key: new.idempotency_key,
            max_attempts: new.max_attempts.max(1),
            tags: new.tags,
            state: TaskState::Queued,
            attempt: 1,
            worker_id: None,
            cancel_requested: false,
            cancel_reason: None,
            timeout_at: None,
            submitted_at: now,
            scheduled_at: None,
            started_at: None,
            heartbeat_at: None,
            completed_at: None,
            result: None,
            error: None,
            metrics: None,
            progress: None,
            version: 1,
            updated_at: now,
        }
    }

    /// Deadline for the current attempt, counted from `started`.
    pub fn runtime_deadline(&self, started: DateTime<Utc>) -> DateTime<Utc> {
        started + secs(self.max_runtime_s)
    }

    /// Retention deadline for a task completing at `completed`.
    pub fn retention_deadline(&self, completed: DateTime<Utc>) -> DateTime<Utc> {
        completed + secs(self.ttl_s)
    }

    /// Last sign of life: the heartbeat, else the start time.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_at.or(self.started_at)
    }

    /// True once attempts are exhausted.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Longest budget or TTL honoured (about a century); keeps date arithmetic in range.
const MAX_SECS: u64 = 100 * 365 * 86_400;

fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(MAX_SECS) as i64)
}

/// Append-only audit record of a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    /// None for the creation event.
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub actor: String,
    pub reason: Option<String>,
    /// Task version produced by this transition.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Filter for task listings. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub states: Vec<TaskState>,
    pub tool_name: Option<String>,
    pub tags_any: Vec<String>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub caller_scope: Option<String>,
}

/// A page of tasks, newest first.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Task id to pass as the cursor for the next page.
    pub next_cursor: Option<Uuid>,
}

/// Result of an admission-controlled insert.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Task),
    /// An idempotency match already existed.
    Existing(Task),
    QueueFull { depth: u64, limit: u64 },
}

/// Fields written by one compare-and-swap. `None` leaves a column untouched;
/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone)]
pub struct TaskPatch {
    pub state: TaskState,
    pub worker_id: Option<Option<String>>,
    pub attempt: Option<u32>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub heartbeat_at: Option<Option<DateTime<Utc>>>,
    pub timeout_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub metrics: Option<serde_json::Value>,
    pub progress: Option<Option<Progress>>,
    /// When set, the write also requires the stored `version` to match.
    pub expected_version: Option<u64>,
}

impl TaskPatch {
    /// A bare state change.
    pub fn to(state: TaskState) -> Self {
        Self {
            state,
            worker_id: None,
            attempt: None,
            cancel_requested: false,
            cancel_reason: None,
            scheduled_at: None,
            started_at: None,
            heartbeat_at: None,
            timeout_at: None,
            completed_at: None,
            expires_at: None,
            result: None,
            error: None,
            metrics: None,
            progress: None,
            expected_version: None,
        }
    }

    /// Only apply over the exact record revision `task` was read at.
    pub fn at_version_of(mut self, task: &Task) -> Self {
        self.expected_version = Some(task.version);
        self
    }

    /// `queued → scheduled`, binding the worker.
    pub fn scheduled(worker_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: Some(Some(worker_id.to_string())),
            scheduled_at: Some(Some(now)),
            ..Self::to(TaskState::Scheduled)
        }
    }

    /// `scheduled → running`, arming the runtime deadline.
    pub fn started(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(Some(now)),
            heartbeat_at: Some(Some(now)),
            timeout_at: Some(Some(task.runtime_deadline(now))),
            ..Self::to(TaskState::Running)
        }
    }

    /// Terminal success.
    pub fn succeeded(
        task: &Task,
        result: serde_json::Value,
        metrics: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            result: Some(result),
            metrics,
            completed_at: Some(now),
            expires_at: Some(task.retention_deadline(now)),
            ..Self::to(TaskState::Succeeded)
        }
    }

    /// Terminal non-success state carrying an error payload.
    pub fn finished(task: &Task, state: TaskState, failure: TaskFailure, now: DateTime<Utc>) -> Self {
        Self {
            error: Some(failure),
            completed_at: Some(now),
            expires_at: Some(task.retention_deadline(now)),
            ..Self::to(state)
        }
    }

    /// Back to `queued`, dropping lease bookkeeping. A started attempt counts.
    /// Back to `queued`. The scheduling window restarts from `now`, since
    /// the previous one was spent on an attempt that did get scheduled.
    pub fn requeued(task: &Task, now: DateTime<Utc>) -> Self {
        let attempt = match task.state {
            TaskState::Running => Some(task.attempt + 1),
            _ => None,
        };
        Self {
            attempt,
            expires_at: Some(now + secs(task.ttl_s)),
            scheduled_at: Some(None),
            started_at: Some(None),
            heartbeat_at: Some(None),
            timeout_at: Some(None),
            progress: Some(None),
            ..Self::to(TaskState::Queued)
        }
    }

    /// `running → cancel_requested`.
    pub fn cancel_requested(reason: Option<String>) -> Self {
        Self {
            cancel_requested: true,
            cancel_reason: reason,
            ..Self::to(TaskState::CancelRequested)
        }
    }

    /// Immediate cancellation of a task that never started.
    pub fn cancelled_before_start(task: &Task, reason: Option<String>, now: DateTime<Utc>) -> Self {
        let message = reason
            .clone()
            .unwrap_or_else(|| "cancelled before start".to_string());
        Self {
            cancel_requested: true,
            cancel_reason: reason,
            ..Self::finished(task, TaskState::Cancelled, TaskFailure::cancelled(message), now)
        }
    }
}
