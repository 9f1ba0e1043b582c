//! Error types for the task engine.

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored state did not match the state the writer expected.
    #[error("Task {task_id} is {actual}, expected {expected}")]
    Conflict {
        task_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },
}

impl DatabaseError {
    /// True for a lost compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors surfaced across the control API.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Queue {queue} is full ({depth}/{limit} queued)")]
    QueueFull { queue: String, depth: u64, limit: u64 },

    #[error("Task {task_id} not found")]
    NotFound { task_id: String },

    #[error("Conflicting update on task {task_id}, reread and retry")]
    Conflict { task_id: String },

    #[error("Task {task_id} is {state}, result not ready")]
    NotReady { task_id: String, state: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Internal error: {0}")]
    Database(#[from] DatabaseError),
}

impl ControlError {
    /// Canonical error kind for the outer transport.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::NotReady { .. } => "not_ready",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownTool { .. } => "unknown_tool",
            Self::Database(DatabaseError::Conflict { .. }) => "conflict",
            Self::Database(_) => "internal",
        }
    }
}

/// Artifact registration errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to read artifact {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Artifact path has no file name: {0}")]
    InvalidName(PathBuf),

    #[error("Task {task_id} is not leased by worker {worker_id}")]
    NotOwner { task_id: Uuid, worker_id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_error_kinds() {
        let full = ControlError::QueueFull {
            queue: "gpu".into(),
            depth: 4,
            limit: 4,
        };
        assert_eq!(full.kind(), "queue_full");
        assert_eq!(
            ControlError::NotFound {
                task_id: "x".into()
            }
            .kind(),
            "not_found"
        );

        let cas = ControlError::from(DatabaseError::Conflict {
            task_id: Uuid::nil(),
            expected: "queued".into(),
            actual: "running".into(),
        });
        assert_eq!(cas.kind(), "conflict");
        assert_eq!(
            ControlError::from(DatabaseError::Query("boom".into())).kind(),
            "internal"
        );
    }
}
