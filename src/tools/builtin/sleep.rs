//! Sleep tool: a cooperative long-running task for exercising the engine.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::logs::LogLevel;
use crate::task::Progress;
use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// Upper bound on a single sleep run.
const MAX_SECONDS: f64 = 24.0 * 3600.0;

#[derive(Debug, Default)]
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for `seconds`, split into `steps`, reporting progress and \
         honouring cancellation between steps."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "seconds": { "type": "number", "description": "Total sleep time" },
                "steps": { "type": "integer", "description": "Number of checkpoints (default 10)" }
            },
            "required": ["seconds"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let seconds = params
            .get("seconds")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'seconds' parameter".into()))?;
        if !(0.0..=MAX_SECONDS).contains(&seconds) {
            return Err(ToolError::InvalidParameters(format!(
                "'seconds' must be between 0 and {MAX_SECONDS}"
            )));
        }
        let steps = params
            .get("steps")
            .and_then(|v| v.as_u64())
            .unwrap_or(10)
            .max(1);
        let per_step = Duration::from_secs_f64(seconds / steps as f64);

        for step in 1..=steps {
            ctx.checkpoint().await?;
            tokio::time::sleep(per_step).await;
            ctx.progress(Progress::step(step, steps).with_phase("sleeping"))
                .await;
            ctx.log(LogLevel::Debug, &format!("step {step}/{steps}")).await;
        }

        Ok(ToolOutput::success(serde_json::json!({ "slept_seconds": seconds }))
            .with_metrics(serde_json::json!({ "steps": steps })))
    }
}
