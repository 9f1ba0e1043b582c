//! Task records, their state machine, and guarded transitions.

pub mod model;
pub mod state;
pub mod transition;

pub use model::{
    CreateOutcome, FailureKind, NewTask, Progress, ResourceRequest, Task, TaskEvent, TaskFailure,
    TaskFilter, TaskPage, TaskPatch,
};
pub use state::TaskState;
pub use transition::transition;
