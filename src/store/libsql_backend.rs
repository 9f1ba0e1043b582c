//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Every state change is one
//! `UPDATE ... WHERE task_id = ? AND state = ?` statement, so the
//! compare-and-swap is atomic at the SQLite level. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z`) so text comparison in SQL orders
//! them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{Artifact, ArtifactKind};
use crate::error::DatabaseError;
use crate::logs::{LogLevel, LogLine, LogStreamKind};
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::task::{
    CreateOutcome, Progress, Task, TaskEvent, TaskFilter, TaskPage, TaskPatch, TaskState,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a query expected to yield task rows.
    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(op, error = %e, "Skipping unreadable task row"),
            }
        }
        Ok(tasks)
    }

    /// Run a single-value `COUNT(*)` style query.
    async fn query_count(
        &self,
        op: &str,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(row_err)?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(ts(dt)),
        None => Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_json<T: Serialize>(value: Option<&T>) -> Result<Value, DatabaseError> {
    match value {
        Some(v) => Ok(Value::Text(to_json(v)?)),
        None => Ok(Value::Null),
    }
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn from_opt_json<T: DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    raw.map(|r| from_json(column, &r)).transpose()
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

fn parse_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::Serialization(format!("task_id {raw:?}: {e}")))
}

fn parse_state(raw: &str) -> Result<TaskState, DatabaseError> {
    raw.parse::<TaskState>().map_err(DatabaseError::Serialization)
}

/// Integer parameter, saturating at the SQLite range.
fn int(n: u64) -> Value {
    Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

/// `?, ?, ?` with `n` placeholders.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn state_values(states: &[TaskState]) -> Vec<Value> {
    states
        .iter()
        .map(|s| Value::Text(s.as_str().to_string()))
        .collect()
}

const TASK_COLUMNS: &str = "task_id, tool_name, inputs, caller_scope, resource_class, resources, max_runtime_s, priority, ttl_s, idempotency_key, max_attempts, tags, state, attempt, worker_id, cancel_requested, cancel_reason, timeout_at, submitted_at, scheduled_at, started_at, heartbeat_at, completed_at, expires_at, result, error, metrics, progress, version, updated_at";

const TASK_COLUMN_COUNT: usize = 30;

const EVENT_COLUMNS: &str = "task_id, from_state, to_state, actor, reason, version, created_at";

const LOG_COLUMNS: &str = "task_id, seq, ts, stream, level, message";

const ARTIFACT_COLUMNS: &str =
    "artifact_id, task_id, name, kind, size_bytes, checksum, location, created_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let task_id: String = row.get(0).map_err(row_err)?;
    let inputs: String = row.get(2).map_err(row_err)?;
    let resources: String = row.get(5).map_err(row_err)?;
    let tags: String = row.get(11).map_err(row_err)?;
    let state: String = row.get(12).map_err(row_err)?;
    let submitted_at: String = row.get(18).map_err(row_err)?;
    let updated_at: String = row.get(29).map_err(row_err)?;
    let max_runtime_s: i64 = row.get(6).map_err(row_err)?;
    let ttl_s: i64 = row.get(8).map_err(row_err)?;
    let max_attempts: i64 = row.get(10).map_err(row_err)?;
    let attempt: i64 = row.get(13).map_err(row_err)?;
    let cancel_requested: i64 = row.get(15).map_err(row_err)?;
    let version: i64 = row.get(28).map_err(row_err)?;

    Ok(Task {
        task_id: parse_uuid(&task_id)?,
        tool_name: row.get(1).map_err(row_err)?,
        inputs: from_json("inputs", &inputs)?,
        caller_scope: row.get(3).map_err(row_err)?,
        resource_class: row.get(4).map_err(row_err)?,
        resources: from_json("resources", &resources)?,
        max_runtime_s: max_runtime_s.max(0) as u64,
        priority: row.get(7).map_err(row_err)?,
        ttl_s: ttl_s.max(0) as u64,
        idempotency_key: row.get(9).ok(),
        max_attempts: max_attempts.clamp(1, u32::MAX as i64) as u32,
        tags: from_json("tags", &tags)?,
        state: parse_state(&state)?,
        attempt: attempt.clamp(1, u32::MAX as i64) as u32,
        worker_id: row.get(14).ok(),
        cancel_requested: cancel_requested != 0,
        cancel_reason: row.get(16).ok(),
        timeout_at: parse_optional_datetime(&row.get(17).ok())?,
        submitted_at: parse_datetime(&submitted_at)?,
        scheduled_at: parse_optional_datetime(&row.get(19).ok())?,
        started_at: parse_optional_datetime(&row.get(20).ok())?,
        heartbeat_at: parse_optional_datetime(&row.get(21).ok())?,
        completed_at: parse_optional_datetime(&row.get(22).ok())?,
        expires_at: parse_optional_datetime(&row.get(23).ok())?,
        result: from_opt_json("result", row.get(24).ok())?,
        error: from_opt_json("error", row.get(25).ok())?,
        metrics: from_opt_json("metrics", row.get(26).ok())?,
        progress: from_opt_json("progress", row.get(27).ok())?,
        version: version.max(0) as u64,
        updated_at: parse_datetime(&updated_at)?,
    })
}

/// Values for a full task insert, in TASK_COLUMNS order.
fn task_values(task: &Task) -> Result<Vec<Value>, DatabaseError> {
    Ok(vec![
        Value::Text(task.task_id.to_string()),
        Value::Text(task.tool_name.clone()),
        Value::Text(to_json(&task.inputs)?),
        Value::Text(task.caller_scope.clone()),
        Value::Text(task.resource_class.clone()),
        Value::Text(to_json(&task.resources)?),
        int(task.max_runtime_s),
        Value::Integer(task.priority),
        int(task.ttl_s),
        opt_text(task.idempotency_key.as_deref()),
        int(task.max_attempts as u64),
        Value::Text(to_json(&task.tags)?),
        Value::Text(task.state.as_str().to_string()),
        int(task.attempt as u64),
        opt_text(task.worker_id.as_deref()),
        Value::Integer(task.cancel_requested as i64),
        opt_text(task.cancel_reason.as_deref()),
        opt_ts(task.timeout_at.as_ref()),
        Value::Text(ts(&task.submitted_at)),
        opt_ts(task.scheduled_at.as_ref()),
        opt_ts(task.started_at.as_ref()),
        opt_ts(task.heartbeat_at.as_ref()),
        opt_ts(task.completed_at.as_ref()),
        opt_ts(task.expires_at.as_ref()),
        opt_json(task.result.as_ref())?,
        opt_json(task.error.as_ref())?,
        opt_json(task.metrics.as_ref())?,
        opt_json(task.progress.as_ref())?,
        int(task.version),
        Value::Text(ts(&task.updated_at)),
    ])
}

/// SET clause and values for a patch.
fn patch_assignments(
    patch: &TaskPatch,
    now: &DateTime<Utc>,
) -> Result<(Vec<&'static str>, Vec<Value>), DatabaseError> {
    let mut sets = vec!["state = ?", "updated_at = ?", "version = version + 1"];
    let mut values = vec![
        Value::Text(patch.state.as_str().to_string()),
        Value::Text(ts(now)),
    ];

    // worker_id is set exactly while a lease is held.
    if !patch.state.holds_lease() {
        sets.push("worker_id = NULL");
    } else if let Some(worker) = &patch.worker_id {
        sets.push("worker_id = ?");
        values.push(opt_text(worker.as_deref()));
    }
    if let Some(attempt) = patch.attempt {
        sets.push("attempt = MAX(attempt, ?)");
        values.push(int(attempt as u64));
    }
    if patch.cancel_requested {
        sets.push("cancel_requested = 1");
    }
    if let Some(reason) = &patch.cancel_reason {
        sets.push("cancel_reason = COALESCE(cancel_reason, ?)");
        values.push(Value::Text(reason.clone()));
    }

    let optional_times = [
        ("scheduled_at = ?", &patch.scheduled_at),
        ("started_at = ?", &patch.started_at),
        ("heartbeat_at = ?", &patch.heartbeat_at),
        ("timeout_at = ?", &patch.timeout_at),
    ];
    for (set, value) in optional_times {
        if let Some(value) = value {
            sets.push(set);
            values.push(opt_ts(value.as_ref()));
        }
    }
    if let Some(at) = &patch.completed_at {
        sets.push("completed_at = ?");
        values.push(Value::Text(ts(at)));
    }
    if let Some(at) = &patch.expires_at {
        sets.push("expires_at = ?");
        values.push(Value::Text(ts(at)));
    }
    if let Some(result) = &patch.result {
        sets.push("result = ?");
        values.push(Value::Text(to_json(result)?));
    }
    if let Some(error) = &patch.error {
        sets.push("error = ?");
        values.push(Value::Text(to_json(error)?));
    }
    if let Some(metrics) = &patch.metrics {
        sets.push("metrics = ?");
        values.push(Value::Text(to_json(metrics)?));
    }
    if let Some(progress) = &patch.progress {
        sets.push("progress = ?");
        values.push(opt_json(progress.as_ref())?);
    }

    Ok((sets, values))
}

fn row_to_event(row: &libsql::Row) -> Result<TaskEvent, DatabaseError> {
    let task_id: String = row.get(0).map_err(row_err)?;
    let from_state: Option<String> = row.get(1).ok();
    let to_state: String = row.get(2).map_err(row_err)?;
    let version: i64 = row.get(5).map_err(row_err)?;
    let created_at: String = row.get(6).map_err(row_err)?;

    Ok(TaskEvent {
        task_id: parse_uuid(&task_id)?,
        from_state: from_state.as_deref().map(parse_state).transpose()?,
        to_state: parse_state(&to_state)?,
        actor: row.get(3).map_err(row_err)?,
        reason: row.get(4).ok(),
        version: version.max(0) as u64,
        timestamp: parse_datetime(&created_at)?,
    })
}

fn row_to_log(row: &libsql::Row) -> Result<LogLine, DatabaseError> {
    let task_id: String = row.get(0).map_err(row_err)?;
    let seq: i64 = row.get(1).map_err(row_err)?;
    let at: String = row.get(2).map_err(row_err)?;
    let stream: String = row.get(3).map_err(row_err)?;
    let level: String = row.get(4).map_err(row_err)?;

    Ok(LogLine {
        task_id: parse_uuid(&task_id)?,
        seq: seq.max(0) as u64,
        ts: parse_datetime(&at)?,
        stream: LogStreamKind::parse(&stream).unwrap_or(LogStreamKind::System),
        level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
        message: row.get(5).map_err(row_err)?,
    })
}

fn row_to_artifact(row: &libsql::Row) -> Result<Artifact, DatabaseError> {
    let task_id: String = row.get(1).map_err(row_err)?;
    let kind: String = row.get(3).map_err(row_err)?;
    let size: i64 = row.get(4).map_err(row_err)?;
    let created_at: String = row.get(7).map_err(row_err)?;

    Ok(Artifact {
        artifact_id: row.get(0).map_err(row_err)?,
        task_id: parse_uuid(&task_id)?,
        name: row.get(2).map_err(row_err)?,
        kind: ArtifactKind::parse(&kind),
        size_bytes: size.max(0) as u64,
        checksum: row.get(5).map_err(row_err)?,
        location: row.get(6).ok(),
        created_at: parse_datetime(&created_at)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        task: &Task,
        queue_limit: u64,
    ) -> Result<CreateOutcome, DatabaseError> {
        if let Some(key) = &task.idempotency_key
            && let Some(existing) = self
                .find_by_idempotency_key(&task.caller_scope, &task.tool_name, key)
                .await?
        {
            return Ok(CreateOutcome::Existing(existing));
        }

        // Admission check and insert in one statement; the partial unique
        // index turns a concurrent duplicate into an ignored insert.
        let mut values = task_values(task)?;
        values.push(Value::Text(task.resource_class.clone()));
        values.push(int(queue_limit));
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS}) SELECT {} \
                     WHERE (SELECT COUNT(*) FROM tasks WHERE resource_class = ? AND state = 'queued') < ?",
                    placeholders(TASK_COLUMN_COUNT)
                ),
                Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        if inserted == 1 {
            debug!(task_id = %task.task_id, queue = %task.resource_class, "Task inserted into DB");
            return Ok(CreateOutcome::Created(task.clone()));
        }

        if let Some(key) = &task.idempotency_key
            && let Some(existing) = self
                .find_by_idempotency_key(&task.caller_scope, &task.tool_name, key)
                .await?
        {
            return Ok(CreateOutcome::Existing(existing));
        }

        let depth = self.queue_depth(&task.resource_class).await?;
        Ok(CreateOutcome::QueueFull {
            depth,
            limit: queue_limit,
        })
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn update_task(
        &self,
        task_id: Uuid,
        expected: TaskState,
        patch: TaskPatch,
    ) -> Result<Task, DatabaseError> {
        if !expected.can_transition_to(patch.state) {
            return Err(DatabaseError::InvalidTransition {
                task_id,
                from: expected.to_string(),
                to: patch.state.to_string(),
            });
        }
        if patch.state.is_terminal() && patch.result.is_some() == patch.error.is_some() {
            return Err(DatabaseError::Constraint(format!(
                "terminal state {} needs exactly one of result or error",
                patch.state
            )));
        }

        let now = Utc::now();
        let (sets, mut values) = patch_assignments(&patch, &now)?;
        values.push(Value::Text(task_id.to_string()));
        values.push(Value::Text(expected.as_str().to_string()));
        let mut guard = "task_id = ? AND state = ?".to_string();
        if let Some(version) = patch.expected_version {
            guard.push_str(" AND version = ?");
            values.push(Value::Integer(version as i64));
        }
        let sql = format!(
            "UPDATE tasks SET {} WHERE {guard} RETURNING {TASK_COLUMNS}",
            sets.join(", ")
        );

        let updated = {
            let mut rows = self
                .conn()
                .query(&sql, Params::Positional(values))
                .await
                .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;
            let first = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;
            let updated = first.map(|row| row_to_task(&row)).transpose()?;
            while let Ok(Some(_)) = rows.next().await {}
            updated
        };

        if let Some(task) = updated {
            return Ok(task);
        }

        match self.get_task(task_id).await? {
            Some(current) => Err(DatabaseError::Conflict {
                task_id,
                expected: expected.to_string(),
                actual: current.state.to_string(),
            }),
            None => Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            }),
        }
    }

    async fn find_by_idempotency_key(
        &self,
        caller_scope: &str,
        tool_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                "find_by_idempotency_key",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE caller_scope = ? AND tool_name = ? AND idempotency_key = ? LIMIT 1"
                ),
                vec![
                    Value::Text(caller_scope.to_string()),
                    Value::Text(tool_name.to_string()),
                    Value::Text(idempotency_key.to_string()),
                ],
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        cursor: Option<Uuid>,
        limit: usize,
    ) -> Result<TaskPage, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.states.is_empty() {
            clauses.push(format!("state IN ({})", placeholders(filter.states.len())));
            values.extend(state_values(&filter.states));
        }
        if let Some(tool) = &filter.tool_name {
            clauses.push("tool_name = ?".to_string());
            values.push(Value::Text(tool.clone()));
        }
        if let Some(scope) = &filter.caller_scope {
            clauses.push("caller_scope = ?".to_string());
            values.push(Value::Text(scope.clone()));
        }
        if let Some(after) = &filter.submitted_after {
            clauses.push("submitted_at > ?".to_string());
            values.push(Value::Text(ts(after)));
        }
        if !filter.tags_any.is_empty() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(tasks.tags) WHERE json_each.value IN ({}))",
                placeholders(filter.tags_any.len())
            ));
            values.extend(filter.tags_any.iter().map(|t| Value::Text(t.clone())));
        }
        if let Some(cursor) = cursor {
            clauses.push("task_id < ?".to_string());
            values.push(Value::Text(cursor.to_string()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(int(limit as u64 + 1));

        let mut tasks = self
            .query_tasks(
                "list_tasks",
                &format!("SELECT {TASK_COLUMNS} FROM tasks {where_sql} ORDER BY task_id DESC LIMIT ?"),
                values,
            )
            .await?;

        let has_more = tasks.len() > limit;
        tasks.truncate(limit);
        let next_cursor = if has_more {
            tasks.last().map(|t| t.task_id)
        } else {
            None
        };
        Ok(TaskPage { tasks, next_cursor })
    }

    async fn queued_candidates(
        &self,
        resource_class: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "queued_candidates",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE resource_class = ? AND state = 'queued' \
                 AND (expires_at IS NULL OR expires_at > ?) \
                 ORDER BY priority DESC, submitted_at ASC, task_id ASC LIMIT ?"
            ),
            vec![
                Value::Text(resource_class.to_string()),
                Value::Text(ts(&now)),
                int(limit as u64),
            ],
        )
        .await
    }

    async fn queue_depth(&self, resource_class: &str) -> Result<u64, DatabaseError> {
        self.query_count(
            "queue_depth",
            "SELECT COUNT(*) FROM tasks WHERE resource_class = ? AND state = 'queued'",
            vec![Value::Text(resource_class.to_string())],
        )
        .await
    }

    async fn queue_position(&self, task: &Task) -> Result<u64, DatabaseError> {
        self.query_count(
            "queue_position",
            "SELECT COUNT(*) FROM tasks \
             WHERE resource_class = ?1 AND state = 'queued' AND task_id <> ?2 \
             AND (priority > ?3 OR (priority = ?3 AND (submitted_at < ?4 \
                  OR (submitted_at = ?4 AND task_id < ?2))))",
            vec![
                Value::Text(task.resource_class.clone()),
                Value::Text(task.task_id.to_string()),
                Value::Integer(task.priority),
                Value::Text(ts(&task.submitted_at)),
            ],
        )
        .await
    }

    async fn tasks_in_states(&self, states: &[TaskState]) -> Result<Vec<Task>, DatabaseError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        self.query_tasks(
            "tasks_in_states",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE state IN ({}) ORDER BY task_id",
                placeholders(states.len())
            ),
            state_values(states),
        )
        .await
    }

    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE tasks SET heartbeat_at = ?1, updated_at = ?1 \
                 WHERE task_id = ?2 AND worker_id = ?3 \
                 AND state IN ('running', 'cancel_requested', 'cancelling')",
                params![ts(&at), task_id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_heartbeat: {e}")))?;
        Ok(n == 1)
    }

    async fn record_progress(
        &self,
        task_id: Uuid,
        worker_id: &str,
        progress: &Progress,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE tasks SET progress = ?1, updated_at = ?2 \
                 WHERE task_id = ?3 AND worker_id = ?4 \
                 AND state IN ('running', 'cancel_requested', 'cancelling')",
                params![to_json(progress)?, ts(&at), task_id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_progress: {e}")))?;
        Ok(n == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let terminal = TaskState::terminal()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let purgeable = format!(
            "SELECT task_id FROM tasks WHERE state IN ({terminal}) \
             AND expires_at IS NOT NULL AND expires_at < ?1"
        );
        let stamp = ts(&now);

        // Children first so a crash mid-sweep never orphans rows.
        for table in ["task_logs", "task_events", "artifacts"] {
            self.conn()
                .execute(
                    &format!("DELETE FROM {table} WHERE task_id IN ({purgeable})"),
                    params![stamp.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("purge_expired {table}: {e}")))?;
        }
        let purged = self
            .conn()
            .execute(
                &format!("DELETE FROM tasks WHERE task_id IN ({purgeable})"),
                params![stamp],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired tasks: {e}")))?;

        if purged > 0 {
            debug!(purged, "Purged expired tasks");
        }
        Ok(purged)
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, event: &TaskEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO task_events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    event.task_id.to_string(),
                    opt_text(event.from_state.map(|s| s.as_str())),
                    event.to_state.as_str(),
                    event.actor.clone(),
                    opt_text(event.reason.as_deref()),
                    int(event.version),
                    ts(&event.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;
        Ok(())
    }

    async fn list_events(&self, task_id: Uuid) -> Result<Vec<TaskEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM task_events WHERE task_id = ?1 ORDER BY version, id"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_events: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(
        &self,
        task_id: Uuid,
        stream: LogStreamKind,
        level: LogLevel,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<LogLine, DatabaseError> {
        let seq = {
            let mut rows = self
                .conn()
                .query(
                    "INSERT INTO task_logs (task_id, seq, ts, stream, level, message) \
                     SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3, ?4, ?5 \
                     FROM task_logs WHERE task_id = ?1 \
                     RETURNING seq",
                    params![task_id.to_string(), ts(&at), stream.as_str(), level.as_str(), message],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
            let row = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?
                .ok_or_else(|| DatabaseError::Query("append_log: no sequence returned".into()))?;
            let seq: i64 = row.get(0).map_err(row_err)?;
            while let Ok(Some(_)) = rows.next().await {}
            seq
        };

        Ok(LogLine {
            task_id,
            seq: seq.max(0) as u64,
            ts: at,
            stream,
            level,
            message: message.to_string(),
        })
    }

    async fn read_logs(
        &self,
        task_id: Uuid,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ?1 AND seq > ?2 \
                     ORDER BY seq LIMIT ?3"
                ),
                params![task_id.to_string(), int(after_seq), int(limit as u64)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("read_logs: {e}")))?;

        // A skipped row would open a gap in the sequence, so fail instead.
        let mut lines = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read_logs: {e}")))?
        {
            lines.push(row_to_log(&row)?);
        }
        Ok(lines)
    }

    // ── Artifacts ───────────────────────────────────────────────────

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<Artifact, DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO artifacts ({ARTIFACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    artifact.artifact_id.clone(),
                    artifact.task_id.to_string(),
                    artifact.name.clone(),
                    artifact.kind.as_str(),
                    int(artifact.size_bytes),
                    artifact.checksum.clone(),
                    opt_text(artifact.location.as_deref()),
                    ts(&artifact.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_artifact: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE task_id = ?1 AND name = ?2"),
                params![artifact.task_id.to_string(), artifact.name.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_artifact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_artifact(&row),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "artifact".to_string(),
                id: artifact.artifact_id.clone(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("insert_artifact: {e}"))),
        }
    }

    async fn list_artifacts(&self, task_id: Uuid) -> Result<Vec<Artifact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE task_id = ?1 ORDER BY created_at, name"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_artifacts: {e}")))?;

        let mut artifacts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_artifacts: {e}")))?
        {
            artifacts.push(row_to_artifact(&row)?);
        }
        Ok(artifacts)
    }

    async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE artifact_id = ?1"),
                params![artifact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_artifact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_artifact(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_artifact: {e}"))),
        }
    }
}
