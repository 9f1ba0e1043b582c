//! Worker pool manager: fixed worker slots partitioned by resource class.
//!
//! A slot grants at most one lease at a time. The slot's own state guards
//! that, so a scheduling bug cannot bind two tasks to one worker even if the
//! task records disagree. Slots are process-local and re-register as idle
//! on every start.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// State of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Leased,
    /// Finishing its current lease; takes no new ones.
    Draining,
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub resource_class: String,
    pub state: WorkerState,
    pub current_task_id: Option<Uuid>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

struct WorkerSlot {
    info: WorkerInfo,
    runner: Option<AbortHandle>,
}

/// Tracks worker slots and their leases.
pub struct WorkerPool {
    slots: Mutex<BTreeMap<String, WorkerSlot>>,
    /// Woken whenever a slot becomes idle.
    wake: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(wake: Arc<Notify>) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            wake,
        }
    }

    /// Register `count` idle workers for a class. Ids are `{class}-{n}`.
    pub async fn register(&self, resource_class: &str, count: usize) -> Vec<String> {
        let mut slots = self.slots.lock().await;
        let existing = slots
            .values()
            .filter(|s| s.info.resource_class == resource_class)
            .count();

        let ids: Vec<String> = (existing..existing + count)
            .map(|n| format!("{resource_class}-{n}"))
            .collect();
        for id in &ids {
            slots.insert(
                id.clone(),
                WorkerSlot {
                    info: WorkerInfo {
                        worker_id: id.clone(),
                        resource_class: resource_class.to_string(),
                        state: WorkerState::Idle,
                        current_task_id: None,
                        last_heartbeat: None,
                    },
                    runner: None,
                },
            );
        }
        drop(slots);

        tracing::info!(resource_class, count, "Workers registered");
        self.wake.notify_one();
        ids
    }

    /// Lease an idle worker of `resource_class`.
    pub async fn lease(&self, resource_class: &str) -> Option<String> {
        let mut slots = self.slots.lock().await;
        let slot = slots.values_mut().find(|s| {
            s.info.resource_class == resource_class && s.info.state == WorkerState::Idle
        })?;
        slot.info.state = WorkerState::Leased;
        Some(slot.info.worker_id.clone())
    }

    /// Bind a leased worker to the task it was assigned.
    /// Returns false if the worker is not leased or already bound.
    pub async fn bind(&self, worker_id: &str, task_id: Uuid) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(worker_id) {
            Some(slot)
                if slot.info.state != WorkerState::Idle && slot.info.current_task_id.is_none() =>
            {
                slot.info.current_task_id = Some(task_id);
                slot.info.last_heartbeat = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Remember the runner executing on a worker so it can be recycled.
    pub async fn attach(&self, worker_id: &str, task_id: Uuid, runner: AbortHandle) {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(worker_id) {
            Some(slot) if slot.info.current_task_id == Some(task_id) => slot.runner = Some(runner),
            // The runner already finished and released the slot.
            _ => {}
        }
    }

    /// Release a lease unconditionally (e.g. after a lost assignment race).
    pub async fn release(&self, worker_id: &str) {
        self.release_where(worker_id, |_| true).await;
    }

    /// Release only if the worker is still bound to `task_id`.
    pub async fn release_task(&self, worker_id: &str, task_id: Uuid) -> bool {
        self.release_where(worker_id, |slot| slot.info.current_task_id == Some(task_id))
            .await
    }

    async fn release_where<F>(&self, worker_id: &str, guard: F) -> bool
    where
        F: FnOnce(&WorkerSlot) -> bool,
    {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(worker_id) else {
            return false;
        };
        if slot.info.state == WorkerState::Idle || !guard(slot) {
            return false;
        }

        slot.info.current_task_id = None;
        slot.runner = None;
        if slot.info.state == WorkerState::Leased {
            slot.info.state = WorkerState::Idle;
        }
        drop(slots);

        self.wake.notify_one();
        true
    }

    /// Forcibly end the lease for `task_id`: abort its runner and return the
    /// slot to idle. No-op if the worker moved on to another task.
    pub async fn recycle(&self, worker_id: &str, task_id: Uuid) -> bool {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(worker_id) else {
            return false;
        };
        if slot.info.current_task_id != Some(task_id) {
            return false;
        }
        if let Some(runner) = slot.runner.take() {
            runner.abort();
        }
        drop(slots);

        tracing::warn!(worker_id, task_id = %task_id, "Worker recycled");
        self.release_task(worker_id, task_id).await
    }

    /// Record a heartbeat from the runner on `worker_id`.
    pub async fn touch(&self, worker_id: &str, at: DateTime<Utc>) {
        if let Some(slot) = self.slots.lock().await.get_mut(worker_id) {
            slot.info.last_heartbeat = Some(at);
        }
    }

    /// Stop handing out leases. Leased workers finish their current task.
    pub async fn drain_all(&self) {
        for slot in self.slots.lock().await.values_mut() {
            slot.info.state = WorkerState::Draining;
        }
    }

    /// Abort every attached runner (shutdown).
    pub async fn abort_all(&self) {
        for slot in self.slots.lock().await.values_mut() {
            if let Some(runner) = slot.runner.take() {
                runner.abort();
            }
        }
    }

    pub async fn idle_count(&self, resource_class: &str) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|s| s.info.resource_class == resource_class && s.info.state == WorkerState::Idle)
            .count()
    }

    /// Resource classes that currently have at least one idle worker.
    pub async fn classes_with_idle(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .slots
            .lock()
            .await
            .values()
            .filter(|s| s.info.state == WorkerState::Idle)
            .map(|s| s.info.resource_class.clone())
            .collect();
        classes.sort();
        classes.dedup();
        classes
    }

    /// All registered resource classes.
    pub async fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .slots
            .lock()
            .await
            .values()
            .map(|s| s.info.resource_class.clone())
            .collect();
        classes.sort();
        classes.dedup();
        classes
    }

    pub async fn snapshot(&self) -> Vec<WorkerInfo> {
        self.slots
            .lock()
            .await
            .values()
            .map(|s| s.info.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> WorkerPool {
        WorkerPool::new(Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn one_lease_per_worker() {
        let pool = pool();
        pool.register("gpu", 1).await;

        let worker = pool.lease("gpu").await.unwrap();
        assert_eq!(worker, "gpu-0");
        assert!(pool.lease("gpu").await.is_none());
        assert!(pool.lease("cpu").await.is_none());

        let task = Uuid::now_v7();
        assert!(pool.bind(&worker, task).await);
        assert!(!pool.bind(&worker, Uuid::now_v7()).await);

        assert!(pool.release_task(&worker, task).await);
        assert_eq!(pool.idle_count("gpu").await, 1);
    }

    #[tokio::test]
    async fn stale_release_is_ignored() {
        let pool = pool();
        pool.register("cpu", 1).await;
        let worker = pool.lease("cpu").await.unwrap();
        let current = Uuid::now_v7();
        pool.bind(&worker, current).await;

        assert!(!pool.release_task(&worker, Uuid::now_v7()).await);
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].state, WorkerState::Leased);
        assert_eq!(snapshot[0].current_task_id, Some(current));
    }

    #[tokio::test]
    async fn recycle_aborts_runner_and_frees_slot() {
        let pool = pool();
        pool.register("cpu", 1).await;
        let worker = pool.lease("cpu").await.unwrap();
        let task = Uuid::now_v7();
        pool.bind(&worker, task).await;

        let runner = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        pool.attach(&worker, task, runner.abort_handle()).await;

        assert!(pool.recycle(&worker, task).await);
        assert!(runner.await.unwrap_err().is_cancelled());
        assert_eq!(pool.idle_count("cpu").await, 1);
    }

    #[tokio::test]
    async fn draining_workers_take_no_leases() {
        let pool = pool();
        pool.register("cpu", 2).await;
        let worker = pool.lease("cpu").await.unwrap();
        let task = Uuid::now_v7();
        pool.bind(&worker, task).await;

        pool.drain_all().await;
        assert!(pool.lease("cpu").await.is_none());
        pool.release_task(&worker, task).await;
        assert_eq!(pool.idle_count("cpu").await, 0);
    }

    #[tokio::test]
    async fn register_appends_ids() {
        let pool = pool();
        pool.register("cpu", 2).await;
        let more = pool.register("cpu", 1).await;
        assert_eq!(more, vec!["cpu-2".to_string()]);
        assert_eq!(pool.classes().await, vec!["cpu".to_string()]);
    }
}
