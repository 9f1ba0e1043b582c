//! The `Tool` trait: an opaque callable a task executes.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::context::ToolContext;

/// Failure reported by a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// A failure the tool expects to succeed on another attempt.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Raised at a checkpoint once cancellation was acknowledged.
    #[error("Cancelled")]
    Cancelled,

    /// The runner no longer owns the task; any further report is dropped.
    #[error("Lease lost")]
    LeaseLost,
}

impl ToolError {
    /// Whether the tool marked this failure as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Successful tool output.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Structured result stored on the task.
    pub result: serde_json::Value,
    /// Free-form numeric summary.
    pub metrics: Option<serde_json::Value>,
    /// Files to register as artifacts, in addition to paths found in `result`.
    pub artifacts: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted inputs.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Run the tool. Long-running tools should call `ctx.checkpoint()`
    /// between steps so cancellation is observed.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{name}' parameter")))
}
