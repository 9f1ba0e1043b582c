//! Task state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker slot.
    Queued,
    /// Bound to a worker, runner not yet confirmed.
    Scheduled,
    /// Runner is executing the tool.
    Running,
    /// Caller asked for cancellation, runner has not acknowledged yet.
    CancelRequested,
    /// Runner acknowledged cancellation and is tearing down.
    Cancelling,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    /// TTL elapsed while still queued.
    Expired,
}

impl TaskState {
    pub const ALL: [TaskState; 10] = [
        Self::Queued,
        Self::Scheduled,
        Self::Running,
        Self::CancelRequested,
        Self::Cancelling,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
        Self::Expired,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Scheduled) | (Queued, Cancelled) | (Queued, Expired) |
            // From Scheduled (lease lost before the runner confirmed)
            (Scheduled, Running) | (Scheduled, Cancelled) | (Scheduled, Queued) |
            // From Running
            (Running, Succeeded) | (Running, Failed) | (Running, TimedOut) |
            (Running, Queued) | (Running, CancelRequested) |
            // From CancelRequested (completion can still win the race)
            (CancelRequested, Cancelling) | (CancelRequested, Cancelled) |
            (CancelRequested, Succeeded) | (CancelRequested, Failed) |
            // From Cancelling
            (Cancelling, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled | Self::Expired
        )
    }

    /// Check if the task is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// States in which a worker holds the task's lease.
    pub fn holds_lease(&self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Running | Self::CancelRequested | Self::Cancelling
        )
    }

    /// States in which a runner is executing and must keep heartbeating.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::CancelRequested | Self::Cancelling
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Terminal states as a list.
    pub fn terminal() -> Vec<TaskState> {
        Self::ALL.into_iter().filter(|s| s.is_terminal()).collect()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}
