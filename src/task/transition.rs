//! Compare-and-swap transitions with an audit trail.

use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::task::model::{Task, TaskEvent, TaskPatch};

/// Apply `patch` to `task` if the stored state still equals `task.state`,
/// then record the transition event.
///
/// Returns the updated task. A lost race surfaces as `DatabaseError::Conflict`;
/// callers reread and decide whether to retry or abandon.
pub async fn transition(
    store: &dyn TaskStore,
    task: &Task,
    patch: TaskPatch,
    actor: &str,
    reason: Option<&str>,
) -> Result<Task, DatabaseError> {
    let from = task.state;
    let to = patch.state;
    let updated = store.update_task(task.task_id, from, patch).await?;

    let event = TaskEvent {
        task_id: updated.task_id,
        from_state: Some(from),
        to_state: updated.state,
        actor: actor.to_string(),
        reason: reason.map(str::to_string),
        version: updated.version,
        timestamp: updated.updated_at,
    };
    if let Err(e) = store.append_event(&event).await {
        warn!(task_id = %task.task_id, error = %e, "Failed to record transition event");
    }

    debug!(
        task_id = %task.task_id,
        from = %from,
        to = %to,
        actor,
        "Task transitioned"
    );
    Ok(updated)
}

/// Event recorded when a task row is created.
pub fn creation_event(task: &Task, actor: &str) -> TaskEvent {
    TaskEvent {
        task_id: task.task_id,
        from_state: None,
        to_state: task.state,
        actor: actor.to_string(),
        reason: None,
        version: task.version,
        timestamp: task.submitted_at,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::task::model::{NewTask, ResourceRequest};
    use crate::task::state::TaskState;

    async fn queued_task(store: &LibSqlBackend) -> Task {
        let task = Task::queued(
            NewTask {
                tool_name: "echo".into(),
                inputs: serde_json::json!({}),
                caller_scope: "anon".into(),
                resources: ResourceRequest::default(),
                max_runtime_s: 60,
                priority: 0,
                ttl_s: 60,
                idempotency_key: None,
                max_attempts: 1,
                tags: vec![],
            },
            Utc::now(),
        );
        store.create_task(&task, 10).await.unwrap();
        task
    }

    #[tokio::test]
    async fn transition_records_event() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let task = queued_task(&store).await;

        let scheduled = transition(
            &store,
            &task,
            TaskPatch::scheduled("w-1", Utc::now()),
            "scheduler",
            None,
        )
        .await
        .unwrap();
        assert_eq!(scheduled.state, TaskState::Scheduled);
        assert_eq!(scheduled.version, 2);

        let events = store.list_events(task.task_id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.from_state, Some(TaskState::Queued));
        assert_eq!(last.to_state, TaskState::Scheduled);
        assert_eq!(last.actor, "scheduler");
        assert_eq!(last.version, 2);
    }

    #[tokio::test]
    async fn stale_expected_state_conflicts() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let task = queued_task(&store).await;

        transition(&store, &task, TaskPatch::scheduled("w-1", Utc::now()), "scheduler", None)
            .await
            .unwrap();

        // Second writer still holds the queued snapshot.
        let err = transition(&store, &task, TaskPatch::scheduled("w-2", Utc::now()), "scheduler", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.worker_id.as_deref(), Some("w-1"));
    }
}
