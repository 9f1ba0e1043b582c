//! End-to-end flows through the control API, scheduler, runners and watchdog.
//!
//! Background loops are not started; tests drive `Scheduler::run_once` and
//! `Watchdog::sweep_at` directly so time is under their control.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use task_engine::Engine;
use task_engine::api::{ControlApi, ListRequest, SubmitRequest, TaskStatus};
use task_engine::config::{EngineConfig, PoolConfig};
use task_engine::context::ToolContext;
use task_engine::logs::LogLevel;
use task_engine::store::{LibSqlBackend, TaskStore};
use task_engine::task::{FailureKind, ResourceRequest, Task, TaskPatch, TaskState};
use task_engine::tools::builtin::register_builtin_tools;
use task_engine::tools::{Tool, ToolError, ToolOutput, ToolRegistry};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes `lines` stdout lines, then succeeds.
struct ChattyTool;

#[async_trait]
impl Tool for ChattyTool {
    fn name(&self) -> &str {
        "chatty"
    }

    fn description(&self) -> &str {
        "Writes a fixed number of log lines"
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let lines = params.get("lines").and_then(|v| v.as_u64()).unwrap_or(10);
        for i in 1..=lines {
            ctx.log(LogLevel::Info, &format!("line {i}")).await;
        }
        Ok(ToolOutput::success(serde_json::json!({ "lines": lines })))
    }
}

fn config(dir: &tempfile::TempDir, workers: usize, queue_limit: u64) -> EngineConfig {
    EngineConfig {
        db_path: dir.path().join("tasks.db"),
        artifact_dir: dir.path().join("artifacts"),
        pools: vec![PoolConfig {
            resource_class: "default".into(),
            workers,
            queue_limit,
        }],
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_grace: Duration::from_secs(30),
        ..Default::default()
    }
}

fn tools() -> Arc<ToolRegistry> {
    let tools = Arc::new(ToolRegistry::new());
    register_builtin_tools(&tools);
    tools.register_sync(Arc::new(ChattyTool));
    tools
}

async fn memory_engine(dir: &tempfile::TempDir, workers: usize, queue_limit: u64) -> Engine {
    let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    Engine::with_store(config(dir, workers, queue_limit), store, tools())
        .await
        .unwrap()
}

fn request(tool: &str, inputs: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        tool_name: tool.into(),
        inputs,
        ..Default::default()
    }
}

fn long_sleep() -> SubmitRequest {
    request("sleep", serde_json::json!({ "seconds": 60, "steps": 600 }))
}

async fn wait_for<F>(api: &ControlApi, task_id: &str, done: F) -> TaskStatus
where
    F: Fn(&TaskStatus) -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let status = api.get_task_status(task_id).await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not reach the expected state in time")
}

async fn wait_terminal(api: &ControlApi, task_id: &str) -> TaskStatus {
    wait_for(api, task_id, |s| s.state.is_terminal()).await
}

/// Put a queued task on a worker that will never report, started at `started`.
async fn start_on_ghost(store: &Arc<dyn TaskStore>, task_id: &str, worker: &str, started: DateTime<Utc>) -> Task {
    let id = task_id.parse().unwrap();
    let queued = store.get_task(id).await.unwrap().unwrap();
    let scheduled = store
        .update_task(id, TaskState::Queued, TaskPatch::scheduled(worker, started))
        .await
        .unwrap();
    assert_eq!(queued.state, TaskState::Queued);
    store
        .update_task(id, TaskState::Scheduled, TaskPatch::started(&scheduled, started))
        .await
        .unwrap()
}

/// Every recorded transition follows a legal edge from the previous state.
async fn assert_valid_history(api: &ControlApi, task_id: &str) {
    let events = api.list_task_events(task_id).await.unwrap();
    assert!(!events.is_empty());
    assert_eq!(events[0].from_state, None);
    assert_eq!(events[0].to_state, TaskState::Queued);

    for pair in events.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        assert_eq!(next.from_state, Some(prev.to_state), "gap in history of {task_id}");
        assert!(
            prev.to_state.can_transition_to(next.to_state),
            "illegal edge {} -> {}",
            prev.to_state,
            next.to_state
        );
        assert!(next.version > prev.version);
    }
}

#[tokio::test]
async fn higher_priority_runs_first_despite_later_submission() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 1, 16).await;
    let api = engine.api();

    let low = api
        .submit_task("alice", SubmitRequest { priority: 5, ..long_sleep() })
        .await
        .unwrap();
    let high = api
        .submit_task("alice", SubmitRequest { priority: 9, ..long_sleep() })
        .await
        .unwrap();
    assert_eq!(high.position, 0);

    assert_eq!(engine.scheduler().run_once().await.unwrap(), 1);

    let high = api.get_task_status(&high.task_id.to_string()).await.unwrap();
    let low = api.get_task_status(&low.task_id.to_string()).await.unwrap();
    assert!(high.state.holds_lease());
    assert_eq!(low.state, TaskState::Queued);

    engine.shutdown().await;
}

#[tokio::test]
async fn idempotent_submission_creates_one_task() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 1, 16).await;
    let api = engine.api();

    let req = SubmitRequest {
        idempotency_key: Some("relax-42".into()),
        ..request("echo", serde_json::json!({"n": 1}))
    };
    let first = api.submit_task("alice", req.clone()).await.unwrap();
    let second = api.submit_task("alice", req).await.unwrap();

    assert_eq!(first.task_id, second.task_id);
    let all = api.list_tasks(ListRequest::default()).await.unwrap();
    assert_eq!(all.tasks.len(), 1);
}

#[tokio::test]
async fn admission_control_rejects_full_queue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 0, 2).await;
    let api = engine.api();

    api.submit_task("alice", request("echo", serde_json::json!({}))).await.unwrap();
    api.submit_task("alice", request("echo", serde_json::json!({}))).await.unwrap();
    let err = api
        .submit_task("alice", request("echo", serde_json::json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "queue_full");

    // Other classes have their own budget.
    let gpu = SubmitRequest {
        resources: ResourceRequest {
            resource_class: "gpu".into(),
            ..Default::default()
        },
        ..request("echo", serde_json::json!({}))
    };
    api.submit_task("alice", gpu).await.unwrap();
}

#[tokio::test]
async fn overrun_task_times_out_regardless_of_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 0, 16).await;
    let api = engine.api();

    let mut req = request("sleep", serde_json::json!({"seconds": 1}));
    req.resources.max_runtime_s = Some(5);
    req.max_attempts = Some(3);
    let submitted = api.submit_task("alice", req).await.unwrap();
    let id = submitted.task_id.to_string();

    let start = Utc::now();
    start_on_ghost(&engine.store(), &id, "ghost-0", start).await;

    let report = engine
        .watchdog()
        .sweep_at(start + chrono::Duration::seconds(6))
        .await
        .unwrap();
    assert_eq!(report.timed_out, 1);

    let status = api.get_task_status(&id).await.unwrap();
    assert_eq!(status.state, TaskState::TimedOut);
    assert!(status.worker_id.is_none());
    let result = api.get_task_result(&id).await.unwrap();
    assert_eq!(result.error.unwrap().kind, FailureKind::Timeout);
    assert!(result.result.is_none());
    assert_valid_history(&api, &id).await;
}

#[tokio::test]
async fn lost_worker_requeues_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 0, 16).await;
    let api = engine.api();

    let mut req = long_sleep();
    req.max_attempts = Some(2);
    let id = api.submit_task("alice", req).await.unwrap().task_id.to_string();

    let start = Utc::now();
    start_on_ghost(&engine.store(), &id, "ghost-0", start).await;
    let report = engine
        .watchdog()
        .sweep_at(start + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);

    let status = api.get_task_status(&id).await.unwrap();
    assert_eq!(status.state, TaskState::Queued);
    assert_eq!(status.attempt, 2);
    assert!(status.worker_id.is_none());

    let restart = start + chrono::Duration::seconds(40);
    start_on_ghost(&engine.store(), &id, "ghost-1", restart).await;
    let report = engine
        .watchdog()
        .sweep_at(restart + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let result = api.get_task_result(&id).await.unwrap();
    assert_eq!(result.state, TaskState::Failed);
    assert_eq!(result.error.unwrap().kind, FailureKind::WorkerLost);
    assert_valid_history(&api, &id).await;
}

#[tokio::test]
async fn running_task_cancels_at_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 1, 16).await;
    let api = engine.api();

    let id = api.submit_task("alice", long_sleep()).await.unwrap().task_id.to_string();
    engine.scheduler().run_once().await.unwrap();
    wait_for(&api, &id, |s| s.state == TaskState::Running).await;

    let cancel = api.cancel_task(&id, Some("no longer needed")).await.unwrap();
    assert!(cancel.acknowledged);
    assert_eq!(cancel.state, TaskState::CancelRequested);

    let done = wait_terminal(&api, &id).await;
    assert_eq!(done.state, TaskState::Cancelled);
    assert!(done.cancel_requested);

    let result = api.get_task_result(&id).await.unwrap();
    assert_eq!(result.error.unwrap().message, "no longer needed");
    assert_valid_history(&api, &id).await;

    // The worker is released right after the terminal write.
    tokio::time::timeout(TEST_TIMEOUT, async {
        while api.engine_stats().await.unwrap().queues[0].idle != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker was not released");
}

#[tokio::test]
async fn cancel_racing_completion_resolves_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 4, 64).await;
    let api = engine.api();

    let mut ids = Vec::new();
    for i in 0..8 {
        let req = request("sleep", serde_json::json!({"seconds": 0.02 * i as f64, "steps": 2}));
        ids.push(api.submit_task("alice", req).await.unwrap().task_id.to_string());
    }

    for round in 0..4 {
        engine.scheduler().run_once().await.unwrap();
        for id in ids.iter().skip(round * 2).take(2) {
            api.cancel_task(id, None).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    for id in &ids {
        let status = wait_terminal(&api, id).await;
        assert!(
            matches!(
                status.state,
                TaskState::Cancelled | TaskState::Succeeded | TaskState::Failed
            ),
            "unexpected terminal state {}",
            status.state
        );
        assert_valid_history(&api, id).await;

        let result = api.get_task_result(id).await.unwrap();
        assert!(result.result.is_some() != result.error.is_some());
    }
}

#[tokio::test]
async fn log_pages_are_gap_free() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 1, 16).await;
    let api = engine.api();

    let id = api
        .submit_task("alice", request("chatty", serde_json::json!({"lines": 40})))
        .await
        .unwrap()
        .task_id
        .to_string();
    engine.scheduler().run_once().await.unwrap();
    wait_terminal(&api, &id).await;

    let mut seqs = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = api.tail_task_logs(&id, cursor.as_deref(), 7).await.unwrap();
        assert!(page.lines.len() <= 7);
        seqs.extend(page.lines.iter().map(|l| l.seq));
        cursor = Some(page.next_cursor.clone());
        if !page.truncated {
            break;
        }
    }

    let total = seqs.len() as u64;
    assert!(total >= 40);
    assert_eq!(seqs, (1..=total).collect::<Vec<u64>>());
}

#[tokio::test]
async fn artifacts_are_resolvable_with_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(&dir, 1, 16).await;
    let api = engine.api();

    let id = api
        .submit_task(
            "alice",
            request("write_text", serde_json::json!({"name": "energies.csv", "content": "e\n-1.50\n"})),
        )
        .await
        .unwrap()
        .task_id
        .to_string();
    engine.scheduler().run_once().await.unwrap();
    let status = wait_terminal(&api, &id).await;
    assert_eq!(status.state, TaskState::Succeeded);

    let result = api.get_task_result(&id).await.unwrap();
    assert_eq!(result.artifacts.len(), 1);
    let artifact = &result.artifacts[0];
    assert_eq!(artifact.name, "energies.csv");
    assert_eq!(artifact.size_bytes, 8);
    assert!(artifact.checksum.starts_with("sha256:"));
    assert_eq!(
        artifact.download_url,
        format!("/artifacts/{}/energies.csv", artifact.artifact_id)
    );
    assert_eq!(artifact.expires_at, status.expires_at);
}

#[tokio::test]
async fn tasks_survive_restart_and_orphans_are_recovered() {
    let dir = tempfile::tempdir().unwrap();

    let (done_id, orphan_id) = {
        let engine = Engine::open(config(&dir, 1, 16), tools()).await.unwrap();
        let api = engine.api();

        let done = api
            .submit_task("alice", request("echo", serde_json::json!({"keep": true})))
            .await
            .unwrap()
            .task_id
            .to_string();
        engine.scheduler().run_once().await.unwrap();
        wait_terminal(&api, &done).await;

        let orphan = api.submit_task("alice", long_sleep()).await.unwrap().task_id.to_string();
        engine.scheduler().run_once().await.unwrap();
        wait_for(&api, &orphan, |s| s.state == TaskState::Running).await;

        engine.shutdown().await;
        (done, orphan)
    };

    let engine = Engine::open(config(&dir, 1, 16), tools()).await.unwrap();
    let api = engine.api();

    let result = api.get_task_result(&done_id).await.unwrap();
    assert_eq!(result.state, TaskState::Succeeded);
    assert_eq!(result.result.unwrap()["keep"], true);

    // The previous process's runner is gone; its heartbeat goes stale.
    let orphan = api.get_task_status(&orphan_id).await.unwrap();
    assert_eq!(orphan.state, TaskState::Running);
    let report = engine
        .watchdog()
        .sweep_at(Utc::now() + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);

    let orphan = api.get_task_status(&orphan_id).await.unwrap();
    assert_eq!(orphan.state, TaskState::Queued);
    assert_eq!(orphan.attempt, 2);
    assert_valid_history(&api, &orphan_id).await;
}
