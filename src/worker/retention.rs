//! Retention sweep: expires stale queued tasks and purges finished ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::task::{TaskFailure, TaskPatch, TaskState, transition};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Queued tasks whose TTL elapsed before they were scheduled.
    pub expired: usize,
    /// Terminal tasks removed with their events, logs and artifacts.
    pub purged: u64,
}

pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RetentionReport, DatabaseError> {
        let mut report = RetentionReport::default();

        for task in self.store.tasks_in_states(&[TaskState::Queued]).await? {
            let Some(deadline) = task.expires_at else {
                continue;
            };
            if now <= deadline {
                continue;
            }

            let failure = TaskFailure::expired(format!(
                "not scheduled within ttl of {}s",
                task.ttl_s
            ));
            match transition(
                self.store.as_ref(),
                &task,
                TaskPatch::finished(&task, TaskState::Expired, failure, now),
                "retention",
                Some("ttl elapsed while queued"),
            )
            .await
            {
                Ok(_) => report.expired += 1,
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task.task_id, "Queued task moved before expiry");
                }
                Err(e) => return Err(e),
            }
        }

        report.purged = self.store.purge_expired(now).await?;

        if report.expired > 0 || report.purged > 0 {
            info!(expired = report.expired, purged = report.purged, "Retention sweep");
        }
        Ok(report)
    }
}

/// Spawn the periodic retention sweep.
pub fn spawn_retention_loop(
    sweeper: Arc<RetentionSweeper>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Retention loop started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = sweeper.sweep_at(Utc::now()).await {
                warn!(error = %e, "Retention sweep failed");
            }
        }
        info!("Retention loop stopped");
    })
}
