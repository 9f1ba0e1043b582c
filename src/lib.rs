//! Task Engine: durable asynchronous task execution.
//!
//! Callers submit work through [`api::ControlApi`], disconnect, and come back
//! for status, logs and results. Every state change is a compare-and-swap
//! on the durable store, so scheduler, runners and watchdog can race freely.

pub mod api;
pub mod artifacts;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logs;
pub mod store;
pub mod task;
pub mod tools;
pub mod worker;

pub use engine::Engine;
pub use error::{Error, Result};
