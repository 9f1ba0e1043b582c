//! Tool abstraction: the opaque callables tasks execute.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{ToolDescriptor, ToolRegistry};
pub use tool::*;
