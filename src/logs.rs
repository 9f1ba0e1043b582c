//! Per-task log stream with cursor-based tailing.
//!
//! Lines are append-only and numbered 1..N per task by the store, so a
//! reader that follows `next_cursor` sees every line exactly once even while
//! the task is still writing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::TaskStore;

/// Largest page a single tail call returns.
pub const MAX_TAIL_LIMIT: usize = 1000;

/// Page size when the caller does not ask for one.
pub const DEFAULT_TAIL_LIMIT: usize = 200;

/// Which stream a line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
    /// Lines written by the engine itself (start, retry, cancel notes).
    System,
}

impl LogStreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One persisted log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub task_id: Uuid,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub stream: LogStreamKind,
    pub level: LogLevel,
    pub message: String,
}

/// Result of one tail call.
#[derive(Debug, Clone)]
pub struct LogPage {
    pub lines: Vec<LogLine>,
    /// Sequence number to resume after.
    pub next_cursor: u64,
    /// More lines exist past this page.
    pub truncated: bool,
}

/// Append and tail task log lines.
pub struct LogStream {
    store: Arc<dyn TaskStore>,
}

impl LogStream {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Append a line; the store assigns the next sequence number atomically.
    pub async fn append(
        &self,
        task_id: Uuid,
        stream: LogStreamKind,
        level: LogLevel,
        message: &str,
    ) -> Result<LogLine, DatabaseError> {
        self.store
            .append_log(task_id, stream, level, message, Utc::now())
            .await
    }

    /// Engine-authored line on the system stream.
    pub async fn system(&self, task_id: Uuid, level: LogLevel, message: &str) {
        if let Err(e) = self.append(task_id, LogStreamKind::System, level, message).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to append system log line");
        }
    }

    /// Lines with `seq > after`, at most `limit` of them.
    pub async fn tail(
        &self,
        task_id: Uuid,
        after: u64,
        limit: usize,
    ) -> Result<LogPage, DatabaseError> {
        let limit = clamp_limit(limit);
        let mut lines = self.store.read_logs(task_id, after, limit + 1).await?;

        let truncated = lines.len() > limit;
        lines.truncate(limit);
        let next_cursor = lines.last().map(|l| l.seq).unwrap_or(after);

        Ok(LogPage {
            lines,
            next_cursor,
            truncated,
        })
    }
}

fn clamp_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_TAIL_LIMIT,
        n => n.min(MAX_TAIL_LIMIT),
    }
}

/// Parse a caller-supplied cursor. Absent means "from the beginning".
pub fn parse_cursor(cursor: Option<&str>) -> Option<u64> {
    match cursor.map(str::trim) {
        None | Some("") => Some(0),
        Some(raw) => raw.parse::<u64>().ok(),
    }
}
