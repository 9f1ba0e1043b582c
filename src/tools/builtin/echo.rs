//! Echo tool: returns its inputs unchanged.

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::logs::LogLevel;
use crate::tools::tool::{Tool, ToolError, ToolOutput};

#[derive(Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the inputs as the task result."
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        ctx.log(LogLevel::Info, "echoing inputs").await;
        Ok(ToolOutput::success(params))
    }
}
