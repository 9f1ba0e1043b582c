//! Write-text tool: writes a file into the task's output directory.
//!
//! The written path is returned in the result, so the runner registers it
//! as an artifact before the task is marked succeeded.

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::logs::LogLevel;
use crate::tools::tool::{Tool, ToolError, ToolOutput, require_str};

/// Maximum content size accepted (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct WriteTextTool;

#[async_trait]
impl Tool for WriteTextTool {
    fn name(&self) -> &str {
        "write_text"
    }

    fn description(&self) -> &str {
        "Write `content` to a file called `name` in the task output directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "File name, no directories" },
                "content": { "type": "string" }
            },
            "required": ["name", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = require_str(&params, "name")?;
        let content = require_str(&params, "content")?;

        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ToolError::InvalidParameters(format!(
                "'name' must be a plain file name, got {name:?}"
            )));
        }
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "content too large ({} bytes, max {MAX_WRITE_SIZE})",
                content.len()
            )));
        }

        ctx.checkpoint().await?;

        let dir = ctx.output_dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ToolError::Transient(format!("cannot create output dir: {e}")))?;
        let path = dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::Transient(format!("write failed: {e}")))?;

        ctx.log(LogLevel::Info, &format!("wrote {} bytes to {}", content.len(), path.display()))
            .await;

        Ok(ToolOutput::success(serde_json::json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
        }))
        .with_artifact(path))
    }
}
