//! Execution side of the engine: worker slots, dispatch, task runners and
//! the periodic reconciliation loops.

pub mod pool;
pub mod retention;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod watchdog;

pub use pool::{WorkerInfo, WorkerPool, WorkerState};
pub use retention::{RetentionReport, RetentionSweeper};
pub use retry::{RetryPolicy, RetryableErrors, WorkerLostOnly};
pub use runner::{RunnerDeps, TaskRunner};
pub use scheduler::Scheduler;
pub use watchdog::{SweepReport, Watchdog};
