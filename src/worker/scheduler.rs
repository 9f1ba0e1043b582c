//! Scheduler: matches queued tasks to idle workers of the same class.
//!
//! Each pass walks the classes that have idle workers and hands out tasks
//! in dispatch order (priority desc, then FIFO, then task id). Assignment
//! is the `queued → scheduled` compare-and-swap; a task that loses the race
//! is simply left for whoever won it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::task::{TaskPatch, transition};
use crate::worker::runner::{RunnerDeps, TaskRunner};

/// Dispatch loop state.
pub struct Scheduler {
    deps: RunnerDeps,
    /// Notified on submission and whenever a worker goes idle.
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(deps: RunnerDeps, wake: Arc<Notify>) -> Self {
        Self { deps, wake }
    }

    /// One scheduling pass. Returns the number of tasks assigned.
    pub async fn run_once(&self) -> Result<usize, DatabaseError> {
        let mut assigned = 0;

        for class in self.deps.pool.classes_with_idle().await {
            let idle = self.deps.pool.idle_count(&class).await;
            if idle == 0 {
                continue;
            }

            let candidates = self
                .deps
                .store
                .queued_candidates(&class, Utc::now(), idle)
                .await?;

            for task in candidates {
                let Some(worker_id) = self.deps.pool.lease(&class).await else {
                    break;
                };

                let scheduled = match transition(
                    self.deps.store.as_ref(),
                    &task,
                    TaskPatch::scheduled(&worker_id, Utc::now()),
                    "scheduler",
                    Some(&format!("assigned to {worker_id}")),
                )
                .await
                {
                    Ok(task) => task,
                    Err(e) => {
                        self.deps.pool.release(&worker_id).await;
                        if e.is_conflict() {
                            debug!(task_id = %task.task_id, "Task taken by another writer");
                            continue;
                        }
                        return Err(e);
                    }
                };

                if !self.deps.pool.bind(&worker_id, scheduled.task_id).await {
                    // Slot is no longer leasable; the watchdog returns the task to the queue.
                    warn!(task_id = %scheduled.task_id, worker_id = %worker_id, "Worker refused binding");
                    continue;
                }

                debug!(
                    task_id = %scheduled.task_id,
                    worker_id = %worker_id,
                    priority = scheduled.priority,
                    "Task scheduled"
                );
                let task_id = scheduled.task_id;
                let handle = TaskRunner::new(self.deps.clone(), scheduled, &worker_id).spawn();
                self.deps
                    .pool
                    .attach(&worker_id, task_id, handle.abort_handle())
                    .await;
                assigned += 1;
            }
        }

        Ok(assigned)
    }
}

/// Spawn the dispatch loop. Runs on every wake-up and at least every `interval`.
pub fn spawn_scheduler_loop(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Scheduler loop started (interval: {}ms)", interval.as_millis());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = scheduler.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match scheduler.run_once().await {
                Ok(0) => {}
                Ok(n) => debug!(assigned = n, "Scheduling pass complete"),
                Err(e) => warn!(error = %e, "Scheduling pass failed"),
            }
        }
        info!("Scheduler loop stopped");
    })
}
