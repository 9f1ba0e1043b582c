//! Watchdog: forces resolution of tasks whose runner overran or vanished.
//!
//! Every action is a compare-and-swap against the state the sweep read, so
//! a runner that reports concurrently either lands first (and the watchdog
//! write is rejected) or loses (and its late report is dropped).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::logs::{LogLevel, LogStream};
use crate::store::TaskStore;
use crate::task::{Task, TaskFailure, TaskPatch, TaskState, transition};
use crate::worker::pool::WorkerPool;
use crate::worker::retry::{RetryPolicy, should_requeue};

const ACTOR: &str = "watchdog";

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: usize,
    /// Lost workers whose task went back to the queue.
    pub requeued: usize,
    /// Lost workers whose task ran out of attempts.
    pub failed: usize,
    /// Cancellations forced to completion.
    pub cancelled: usize,
    /// Scheduled tasks whose runner never confirmed the lease.
    pub unscheduled: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Watchdog {
    store: Arc<dyn TaskStore>,
    pool: Arc<WorkerPool>,
    logs: Arc<LogStream>,
    retry: Arc<dyn RetryPolicy>,
    heartbeat_grace: chrono::Duration,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn TaskStore>,
        pool: Arc<WorkerPool>,
        logs: Arc<LogStream>,
        retry: Arc<dyn RetryPolicy>,
        heartbeat_grace: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            logs,
            retry,
            heartbeat_grace: chrono::Duration::from_std(heartbeat_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    /// Sweep with the wall clock.
    pub async fn sweep(&self) -> Result<SweepReport, DatabaseError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let mut report = SweepReport::default();
        let watched = self
            .store
            .tasks_in_states(&[
                TaskState::Scheduled,
                TaskState::Running,
                TaskState::CancelRequested,
                TaskState::Cancelling,
            ])
            .await?;

        for task in watched {
            let result = match task.state {
                TaskState::Running => self.check_running(&task, now, &mut report).await,
                TaskState::CancelRequested | TaskState::Cancelling => {
                    self.check_cancelling(&task, now, &mut report).await
                }
                TaskState::Scheduled => self.check_scheduled(&task, now, &mut report).await,
                _ => Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task.task_id, "Task moved during sweep, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if !report.is_empty() {
            info!(?report, "Watchdog sweep");
        }
        Ok(report)
    }

    fn is_stale(&self, task: &Task, now: DateTime<Utc>) -> bool {
        task.last_seen()
            .is_some_and(|seen| now - seen > self.heartbeat_grace)
    }

    fn overran(task: &Task, now: DateTime<Utc>) -> bool {
        task.timeout_at.is_some_and(|deadline| now > deadline)
    }

    async fn check_running(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), DatabaseError> {
        // Timeout wins over staleness and ignores remaining attempts.
        if Self::overran(task, now) {
            let failure = TaskFailure::timeout(format!(
                "exceeded max runtime of {}s",
                task.max_runtime_s
            ));
            let message = failure.message.clone();
            transition(
                self.store.as_ref(),
                task,
                TaskPatch::finished(task, TaskState::TimedOut, failure, now),
                ACTOR,
                Some(&message),
            )
            .await?;
            warn!(task_id = %task.task_id, worker_id = ?task.worker_id, "Task timed out");
            self.logs
                .system(task.task_id, LogLevel::Error, &format!("Timed out: {message}"))
                .await;
            self.recycle(task).await;
            report.timed_out += 1;
            return Ok(());
        }

        if !self.is_stale(task, now) {
            return Ok(());
        }

        let failure = TaskFailure::worker_lost(format!(
            "no heartbeat from {} within {}s",
            task.worker_id.as_deref().unwrap_or("unknown worker"),
            self.heartbeat_grace.num_seconds()
        ));
        if should_requeue(self.retry.as_ref(), &failure, task.attempt, task.max_attempts) {
            transition(
                self.store.as_ref(),
                task,
                TaskPatch::requeued(task, now),
                ACTOR,
                Some(&failure.message),
            )
            .await?;
            warn!(task_id = %task.task_id, attempt = task.attempt, "Worker lost, task requeued");
            self.logs
                .system(
                    task.task_id,
                    LogLevel::Warn,
                    &format!("Worker lost on attempt {}, requeued", task.attempt),
                )
                .await;
            report.requeued += 1;
        } else {
            let message = failure.message.clone();
            transition(
                self.store.as_ref(),
                task,
                TaskPatch::finished(task, TaskState::Failed, failure, now),
                ACTOR,
                Some(&message),
            )
            .await?;
            warn!(task_id = %task.task_id, attempt = task.attempt, "Worker lost, attempts exhausted");
            self.logs
                .system(task.task_id, LogLevel::Error, &format!("Worker lost: {message}"))
                .await;
            report.failed += 1;
        }
        self.recycle(task).await;
        Ok(())
    }

    /// A cancelling runner that overran or went silent is cancelled outright.
    async fn check_cancelling(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), DatabaseError> {
        if !Self::overran(task, now) && !self.is_stale(task, now) {
            return Ok(());
        }

        let reason = task
            .cancel_reason
            .clone()
            .unwrap_or_else(|| "cancelled by request".to_string());
        transition(
            self.store.as_ref(),
            task,
            TaskPatch::finished(task, TaskState::Cancelled, TaskFailure::cancelled(reason), now),
            ACTOR,
            Some("runner did not confirm teardown"),
        )
        .await?;
        warn!(task_id = %task.task_id, "Cancellation forced");
        self.logs
            .system(task.task_id, LogLevel::Warn, "Cancellation forced by watchdog")
            .await;
        self.recycle(task).await;
        report.cancelled += 1;
        Ok(())
    }

    /// A scheduled task whose runner never started goes back to the queue.
    async fn check_scheduled(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), DatabaseError> {
        let stuck = task
            .scheduled_at
            .is_some_and(|at| now - at > self.heartbeat_grace);
        if !stuck {
            return Ok(());
        }

        transition(
            self.store.as_ref(),
            task,
            TaskPatch::requeued(task, now),
            ACTOR,
            Some("lease never confirmed"),
        )
        .await?;
        warn!(task_id = %task.task_id, worker_id = ?task.worker_id, "Unconfirmed lease, task requeued");
        self.recycle(task).await;
        report.unscheduled += 1;
        Ok(())
    }

    async fn recycle(&self, task: &Task) {
        if let Some(worker_id) = task.worker_id.as_deref() {
            self.pool.recycle(worker_id, task.task_id).await;
        }
    }
}

/// Spawn the periodic watchdog sweep.
pub fn spawn_watchdog_loop(
    watchdog: Arc<Watchdog>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Watchdog loop started (interval: {}s)", interval.as_secs_f64());
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = watchdog.sweep().await {
                warn!(error = %e, "Watchdog sweep failed");
            }
        }
        info!("Watchdog loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::task::{FailureKind, NewTask, ResourceRequest};
    use crate::worker::retention::RetentionSweeper;
    use crate::worker::retry::WorkerLostOnly;

    async fn watchdog() -> Watchdog {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Watchdog::new(
            Arc::clone(&store),
            Arc::new(WorkerPool::new(Arc::new(Notify::new()))),
            Arc::new(LogStream::new(Arc::clone(&store))),
            Arc::new(WorkerLostOnly),
            Duration::from_secs(30),
        )
    }

    /// A task some absent worker started at `started`.
    async fn running(w: &Watchdog, max_runtime_s: u64, max_attempts: u32, started: DateTime<Utc>) -> Task {
        running_with_ttl(w, max_runtime_s, max_attempts, 3600, started).await
    }

    async fn running_with_ttl(
        w: &Watchdog,
        max_runtime_s: u64,
        max_attempts: u32,
        ttl_s: u64,
        started: DateTime<Utc>,
    ) -> Task {
        let task = Task::queued(
            NewTask {
                tool_name: "sleep".into(),
                inputs: serde_json::json!({}),
                caller_scope: "anon".into(),
                resources: ResourceRequest::default(),
                max_runtime_s,
                priority: 0,
                ttl_s,
                idempotency_key: None,
                max_attempts,
                tags: vec![],
            },
            started,
        );
        w.store.create_task(&task, 10).await.unwrap();
        let task = w
            .store
            .update_task(task.task_id, TaskState::Queued, TaskPatch::scheduled("ghost-0", started))
            .await
            .unwrap();
        w.store
            .update_task(task.task_id, TaskState::Scheduled, TaskPatch::started(&task, started))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn overrun_times_out_regardless_of_attempts() {
        let w = watchdog().await;
        let start = Utc::now();
        let task = running(&w, 5, 3, start).await;

        let quiet = w.sweep_at(start + chrono::Duration::seconds(4)).await.unwrap();
        assert!(quiet.is_empty());

        let report = w.sweep_at(start + chrono::Duration::seconds(6)).await.unwrap();
        assert_eq!(report.timed_out, 1);
        let task = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::TimedOut);
        assert_eq!(task.error.unwrap().kind, FailureKind::Timeout);
        assert!(task.worker_id.is_none());
    }

    #[tokio::test]
    async fn stale_heartbeat_requeues_then_fails() {
        let w = watchdog().await;
        let start = Utc::now();
        let task = running(&w, 3600, 2, start).await;

        let report = w.sweep_at(start + chrono::Duration::seconds(31)).await.unwrap();
        assert_eq!(report.requeued, 1);
        let requeued = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(requeued.state, TaskState::Queued);
        assert_eq!(requeued.attempt, 2);

        // Second crash on the final attempt.
        let again = w
            .store
            .update_task(task.task_id, TaskState::Queued, TaskPatch::scheduled("ghost-1", start))
            .await
            .unwrap();
        w.store
            .update_task(task.task_id, TaskState::Scheduled, TaskPatch::started(&again, start))
            .await
            .unwrap();
        let report = w.sweep_at(start + chrono::Duration::seconds(31)).await.unwrap();
        assert_eq!(report.failed, 1);
        let failed = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error.unwrap().kind, FailureKind::WorkerLost);
    }

    #[tokio::test]
    async fn requeued_retry_outlives_the_original_ttl() {
        let w = watchdog().await;
        let start = Utc::now();
        let task = running_with_ttl(&w, 3600, 2, 20, start).await;

        let crash = start + chrono::Duration::seconds(31);
        let report = w.sweep_at(crash).await.unwrap();
        assert_eq!(report.requeued, 1);
        let requeued = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(requeued.expires_at, Some(crash + chrono::Duration::seconds(20)));

        let candidates = w.store.queued_candidates("default", crash, 1).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].task_id, task.task_id);

        let retention = RetentionSweeper::new(Arc::clone(&w.store));
        let swept = retention.sweep_at(crash).await.unwrap();
        assert_eq!(swept.expired, 0);
        let still = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(still.state, TaskState::Queued);
        assert_eq!(still.attempt, 2);
    }

    #[tokio::test]
    async fn stuck_cancel_is_forced() {
        let w = watchdog().await;
        let start = Utc::now();
        let task = running(&w, 3600, 1, start).await;
        w.store
            .update_task(task.task_id, TaskState::Running, TaskPatch::cancel_requested(Some("stop".into())))
            .await
            .unwrap();

        let report = w.sweep_at(start + chrono::Duration::seconds(31)).await.unwrap();
        assert_eq!(report.cancelled, 1);
        let task = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.error.unwrap().message, "stop");
    }

    #[tokio::test]
    async fn unconfirmed_lease_returns_to_queue() {
        let w = watchdog().await;
        let start = Utc::now();
        let task = Task::queued(
            NewTask {
                tool_name: "sleep".into(),
                inputs: serde_json::json!({}),
                caller_scope: "anon".into(),
                resources: ResourceRequest::default(),
                max_runtime_s: 60,
                priority: 0,
                ttl_s: 3600,
                idempotency_key: None,
                max_attempts: 1,
                tags: vec![],
            },
            start,
        );
        w.store.create_task(&task, 10).await.unwrap();
        w.store
            .update_task(task.task_id, TaskState::Queued, TaskPatch::scheduled("ghost-0", start))
            .await
            .unwrap();

        let report = w.sweep_at(start + chrono::Duration::seconds(31)).await.unwrap();
        assert_eq!(report.unscheduled, 1);
        let task = w.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.attempt, 1);
        assert!(task.worker_id.is_none());
    }
}
