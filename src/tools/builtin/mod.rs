//! Built-in tools for operating the engine without domain tools.

use std::sync::Arc;

use crate::tools::ToolRegistry;

pub mod echo;
pub mod sleep;
pub mod write_text;

pub use echo::EchoTool;
pub use sleep::SleepTool;
pub use write_text::WriteTextTool;

/// Register every built-in tool.
pub fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register_sync(Arc::new(EchoTool));
    registry.register_sync(Arc::new(SleepTool));
    registry.register_sync(Arc::new(WriteTextTool));
}
