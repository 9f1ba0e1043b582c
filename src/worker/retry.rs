//! Retry policy: which failures send a task back to the queue.

use crate::config::EngineConfig;
use crate::task::{FailureKind, TaskFailure};

/// Decides whether a failure category is worth another attempt.
pub trait RetryPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn retry_on(&self, failure: &TaskFailure) -> bool;
}

/// Retry only when the worker disappeared mid-run. Tool errors and timeouts
/// are final.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerLostOnly;

impl RetryPolicy for WorkerLostOnly {
    fn name(&self) -> &'static str {
        "worker_lost_only"
    }

    fn retry_on(&self, failure: &TaskFailure) -> bool {
        failure.kind == FailureKind::WorkerLost
    }
}

/// Also retry tool errors the tool itself flagged as retryable.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryableErrors;

impl RetryPolicy for RetryableErrors {
    fn name(&self) -> &'static str {
        "retryable_errors"
    }

    fn retry_on(&self, failure: &TaskFailure) -> bool {
        match failure.kind {
            FailureKind::WorkerLost => true,
            FailureKind::ToolError => failure.retryable,
            _ => false,
        }
    }
}

/// A failed attempt goes back to the queue only while attempts remain.
pub fn should_requeue(
    policy: &dyn RetryPolicy,
    failure: &TaskFailure,
    attempt: u32,
    max_attempts: u32,
) -> bool {
    attempt < max_attempts && policy.retry_on(failure)
}

/// Policy selected by `TASK_ENGINE_RETRY_TOOL_ERRORS`.
pub fn policy_from_config(config: &EngineConfig) -> Box<dyn RetryPolicy> {
    if config.retry_tool_errors {
        Box::new(RetryableErrors)
    } else {
        Box::new(WorkerLostOnly)
    }
}
