//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Worker pool partition for one resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Resource class (queue) name.
    pub resource_class: String,
    /// Number of worker slots registered at startup.
    pub workers: usize,
    /// Maximum number of queued tasks admitted for this class.
    pub queue_limit: u64,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Root directory handed to tools for output files, one subdirectory per task.
    pub artifact_dir: PathBuf,
    /// Worker pools by resource class.
    pub pools: Vec<PoolConfig>,
    /// Queue limit for resource classes without a configured pool.
    pub default_queue_limit: u64,
    /// Runtime budget when a submission does not set `max_runtime_s`.
    pub default_max_runtime: Duration,
    /// How often a runner records a heartbeat.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a worker is considered lost.
    pub heartbeat_grace: Duration,
    /// Scheduler fallback polling interval (it is also woken on submit and release).
    pub scheduler_interval: Duration,
    /// Watchdog sweep interval.
    pub watchdog_interval: Duration,
    /// Retention sweep interval.
    pub retention_interval: Duration,
    /// TTL when a submission does not set one.
    pub default_ttl: Duration,
    /// Attempts allowed when a submission does not set `max_attempts`.
    pub default_max_attempts: u32,
    /// Poll hint returned to callers.
    pub poll_interval_ms: u64,
    /// Also requeue tool errors the tool marked retryable.
    pub retry_tool_errors: bool,
    /// Public prefix for artifact download URLs.
    pub artifact_base_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/task-engine.db"),
            artifact_dir: PathBuf::from("./data/artifacts"),
            pools: vec![PoolConfig {
                resource_class: "default".to_string(),
                workers: 4,
                queue_limit: 256,
            }],
            default_queue_limit: 256,
            default_max_runtime: Duration::from_secs(3600), // 1 hour
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_grace: Duration::from_secs(30),
            scheduler_interval: Duration::from_millis(500),
            watchdog_interval: Duration::from_secs(5),
            retention_interval: Duration::from_secs(60),
            default_ttl: Duration::from_secs(86_400), // 1 day
            default_max_attempts: 3,
            poll_interval_ms: 1000,
            retry_tool_errors: false,
            artifact_base_url: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from `TASK_ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("TASK_ENGINE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("TASK_ENGINE_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }
        if let Some(limit) = parse_key(&lookup, "TASK_ENGINE_DEFAULT_QUEUE_LIMIT")? {
            config.default_queue_limit = limit;
        }
        if let Some(pools) = lookup("TASK_ENGINE_POOLS") {
            config.pools = parse_pools(&pools, config.default_queue_limit)?;
        }
        if let Some(secs) = parse_key(&lookup, "TASK_ENGINE_MAX_RUNTIME_SECS")? {
            config.default_max_runtime = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_key(&lookup, "TASK_ENGINE_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_key(&lookup, "TASK_ENGINE_HEARTBEAT_GRACE_SECS")? {
            config.heartbeat_grace = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_key(&lookup, "TASK_ENGINE_SCHEDULER_INTERVAL_MS")? {
            config.scheduler_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_key(&lookup, "TASK_ENGINE_WATCHDOG_INTERVAL_SECS")? {
            config.watchdog_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_key(&lookup, "TASK_ENGINE_RETENTION_INTERVAL_SECS")? {
            config.retention_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_key(&lookup, "TASK_ENGINE_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_key(&lookup, "TASK_ENGINE_MAX_ATTEMPTS")? {
            config.default_max_attempts = attempts;
        }
        if let Some(ms) = parse_key(&lookup, "TASK_ENGINE_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = ms;
        }
        if let Some(flag) = parse_key(&lookup, "TASK_ENGINE_RETRY_TOOL_ERRORS")? {
            config.retry_tool_errors = flag;
        }
        config.artifact_base_url = lookup("ARTIFACT_BASE_URL")
            .or_else(|| lookup("PUBLIC_BASE_URL"))
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Reject timings the background loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("TASK_ENGINE_HEARTBEAT_SECS", self.heartbeat_interval),
            ("TASK_ENGINE_SCHEDULER_INTERVAL_MS", self.scheduler_interval),
            ("TASK_ENGINE_WATCHDOG_INTERVAL_SECS", self.watchdog_interval),
            ("TASK_ENGINE_RETENTION_INTERVAL_SECS", self.retention_interval),
        ];
        for (key, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "interval must be greater than zero".to_string(),
                });
            }
        }

        if self.heartbeat_interval >= self.heartbeat_grace {
            return Err(ConfigError::InvalidValue {
                key: "TASK_ENGINE_HEARTBEAT_SECS".to_string(),
                message: "heartbeat interval must be shorter than the grace period".to_string(),
            });
        }
        Ok(())
    }

    /// Admission limit for a resource class.
    pub fn queue_limit(&self, resource_class: &str) -> u64 {
        self.pools
            .iter()
            .find(|p| p.resource_class == resource_class)
            .map(|p| p.queue_limit)
            .unwrap_or(self.default_queue_limit)
    }
}

fn parse_key<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

/// Parse `class:workers[:queue_limit]` entries separated by commas.
fn parse_pools(raw: &str, default_limit: u64) -> Result<Vec<PoolConfig>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "TASK_ENGINE_POOLS".to_string(),
        message,
    };

    let mut pools: Vec<PoolConfig> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let (class, workers, limit) = match parts.as_slice() {
            [class, workers] => (*class, *workers, None),
            [class, workers, limit] => (*class, *workers, Some(*limit)),
            _ => return Err(invalid(format!("expected class:workers[:limit], got {entry:?}"))),
        };
        if class.is_empty() {
            return Err(invalid(format!("empty resource class in {entry:?}")));
        }
        if pools.iter().any(|p| p.resource_class == class) {
            return Err(invalid(format!("duplicate resource class {class:?}")));
        }
        let workers = workers
            .parse::<usize>()
            .map_err(|e| invalid(format!("{entry:?}: {e}")))?;
        let queue_limit = match limit {
            Some(l) => l.parse::<u64>().map_err(|e| invalid(format!("{entry:?}: {e}")))?,
            None => default_limit,
        };
        pools.push(PoolConfig {
            resource_class: class.to_string(),
            workers,
            queue_limit,
        });
    }

    if pools.is_empty() {
        return Err(invalid("no pools configured".to_string()));
    }
    Ok(pools)
}
