//! Engine: wires the store, pool, runners and background loops together.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::ControlApi;
use crate::artifacts::ArtifactRegistry;
use crate::config::EngineConfig;
use crate::error::{ConfigError, Error};
use crate::logs::LogStream;
use crate::store::{LibSqlBackend, TaskStore};
use crate::tools::ToolRegistry;
use crate::worker::retention::{self, RetentionSweeper};
use crate::worker::retry::{RetryPolicy, policy_from_config};
use crate::worker::runner::RunnerDeps;
use crate::worker::scheduler::{self, Scheduler};
use crate::worker::watchdog::{self, Watchdog};
use crate::worker::WorkerPool;

/// One control plane: a store, a worker pool and the loops reconciling them.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn TaskStore>,
    tools: Arc<ToolRegistry>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    watchdog: Arc<Watchdog>,
    retention: Arc<RetentionSweeper>,
    api: Arc<ControlApi>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the on-disk store named by the config.
    pub async fn open(config: EngineConfig, tools: Arc<ToolRegistry>) -> Result<Self, Error> {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
        Self::with_store(config, store, tools).await
    }

    /// Build an engine over an existing store. Workers are registered idle;
    /// nothing runs until `start`.
    pub async fn with_store(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Self, Error> {
        config.validate()?;
        store.init_schema().await?;
        std::fs::create_dir_all(&config.artifact_dir).map_err(ConfigError::Io)?;

        let config = Arc::new(config);
        let wake = Arc::new(Notify::new());
        let pool = Arc::new(WorkerPool::new(Arc::clone(&wake)));
        for p in &config.pools {
            pool.register(&p.resource_class, p.workers).await;
        }

        let logs = Arc::new(LogStream::new(Arc::clone(&store)));
        let artifacts = Arc::new(ArtifactRegistry::new(
            Arc::clone(&store),
            config.artifact_base_url.clone(),
        ));
        let retry: Arc<dyn RetryPolicy> = Arc::from(policy_from_config(&config));

        let deps = RunnerDeps {
            store: Arc::clone(&store),
            pool: Arc::clone(&pool),
            tools: Arc::clone(&tools),
            logs: Arc::clone(&logs),
            artifacts: Arc::clone(&artifacts),
            retry: Arc::clone(&retry),
            heartbeat_interval: config.heartbeat_interval,
            artifact_dir: config.artifact_dir.clone(),
        };
        let scheduler = Arc::new(Scheduler::new(deps, Arc::clone(&wake)));
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&logs),
            retry,
            config.heartbeat_grace,
        ));
        let retention = Arc::new(RetentionSweeper::new(Arc::clone(&store)));
        let api = Arc::new(ControlApi::new(
            Arc::clone(&store),
            Arc::clone(&tools),
            Arc::clone(&pool),
            logs,
            artifacts,
            Arc::clone(&config),
            wake,
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            store,
            tools,
            pool,
            scheduler,
            watchdog,
            retention,
            api,
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the scheduler, watchdog and retention loops.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        handles.push(scheduler::spawn_scheduler_loop(
            Arc::clone(&self.scheduler),
            self.config.scheduler_interval,
            self.shutdown.subscribe(),
        ));
        handles.push(watchdog::spawn_watchdog_loop(
            Arc::clone(&self.watchdog),
            self.config.watchdog_interval,
            self.shutdown.subscribe(),
        ));
        handles.push(retention::spawn_retention_loop(
            Arc::clone(&self.retention),
            self.config.retention_interval,
            self.shutdown.subscribe(),
        ));
        info!(pools = self.config.pools.len(), "Engine started");
    }

    /// Stop the loops and abort in-flight runners. Interrupted tasks are
    /// recovered by the watchdog of the next process.
    pub async fn shutdown(&self) {
        self.pool.drain_all().await;
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        futures::future::join_all(handles).await;

        self.pool.abort_all().await;
        info!("Engine stopped");
    }

    pub fn api(&self) -> Arc<ControlApi> {
        Arc::clone(&self.api)
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        Arc::clone(&self.watchdog)
    }

    pub fn retention(&self) -> Arc<RetentionSweeper> {
        Arc::clone(&self.retention)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
