//! Configuration.
//!
//! Settings live in a flat string key/value [`ConfigSnapshot`] (dotted keys
//! such as `worker.poll_interval_ms`). Typed configs are built from a
//! snapshot with `from_snapshot`, falling back to defaults for absent keys and
//! failing with [`QueueError::InvalidConfig`] for values that do not parse.
//!
//! Environment variables map onto keys by stripping a prefix, lowercasing and
//! turning `__` into `.`:
//!
//! ```bash
//! export KENNEL__WORKER__POLL_INTERVAL_MS=250   # worker.poll_interval_ms
//! export KENNEL__QUEUE__KEY_PREFIX=billing      # queue.key_prefix
//! ```
//!
//! `JOBS_DRIVER`, `JOBS_REDIS_URL` and `JOB_DEFAULT_TIMEOUT_SECONDS` are also
//! understood so existing deployments keep working.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::backend::{memory::MemoryBackend, QueueBackend};
use crate::{QueueError, QueueResult, WorkerId};

/// Default environment prefix
pub const ENV_PREFIX: &str = "KENNEL__";

const LEGACY_ENV: [(&str, &str); 3] = [
    ("JOBS_DRIVER", "jobs.driver"),
    ("JOBS_REDIS_URL", "jobs.redis_url"),
    ("JOB_DEFAULT_TIMEOUT_SECONDS", "worker.handler_timeout_seconds"),
];

/// Flat string key/value settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    map: HashMap<String, String>,
}

impl ConfigSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            map: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Read the process environment. Prefixed variables win over legacy names.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(std::env::vars(), prefix)
    }

    /// Same as [`ConfigSnapshot::from_env`] over an explicit variable list
    pub fn from_vars<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut legacy = HashMap::new();
        let mut map = HashMap::new();

        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                // KENNEL__WORKER__CONCURRENCY -> worker.concurrency
                map.insert(stripped.to_lowercase().replace("__", "."), value);
            } else if let Some((_, dotted)) = LEGACY_ENV.iter().find(|(name, _)| *name == key) {
                legacy.insert(dotted.to_string(), value);
            }
        }

        for (key, value) in legacy {
            map.entry(key).or_insert(value);
        }
        Self { map }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    /// Parse a value, `None` when absent
    pub fn parse<T>(&self, key: &str) -> QueueResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| QueueError::InvalidConfig(format!("{key}={raw}: {e}")))
            })
            .transpose()
    }

    /// Duration expressed in (possibly fractional) seconds
    pub fn get_seconds(&self, key: &str) -> QueueResult<Option<Duration>> {
        self.parse::<f64>(key)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| QueueError::InvalidConfig(format!("{key}={secs}: {e}")))
            })
            .transpose()
    }

    /// Duration expressed in milliseconds
    pub fn get_millis(&self, key: &str) -> QueueResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

/// Which store backs the queue
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Driver {
    #[default]
    Memory,
    Redis { url: String },
}

/// Queue-wide defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub default_backoff_seconds: u64,
    /// Lease length used when a caller does not pick one
    pub visibility_timeout: Duration,
    /// Namespace for backend keys
    pub key_prefix: String,
    pub driver: Driver,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            default_backoff_seconds: 60,
            visibility_timeout: Duration::from_secs(60),
            key_prefix: "jobs".to_string(),
            driver: Driver::Memory,
        }
    }
}

impl QueueConfig {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> QueueResult<Self> {
        let defaults = Self::default();

        let driver = match snapshot.get("jobs.driver").map(|d| d.trim().to_lowercase()) {
            None => Driver::Memory,
            Some(d) if d == "memory" => Driver::Memory,
            Some(d) if d == "redis" => Driver::Redis {
                url: snapshot
                    .get_string("jobs.redis_url")
                    .unwrap_or_else(|| "redis://127.0.0.1:6379/0".to_string()),
            },
            Some(other) => {
                return Err(QueueError::InvalidConfig(format!("unknown jobs.driver `{other}`")));
            }
        };

        let config = Self {
            default_max_attempts: snapshot
                .parse("queue.default_max_attempts")?
                .unwrap_or(defaults.default_max_attempts),
            default_backoff_seconds: snapshot
                .parse("queue.default_backoff_seconds")?
                .unwrap_or(defaults.default_backoff_seconds),
            visibility_timeout: snapshot
                .get_seconds("queue.visibility_timeout_seconds")?
                .unwrap_or(defaults.visibility_timeout),
            key_prefix: snapshot
                .get_string("queue.key_prefix")
                .unwrap_or(defaults.key_prefix),
            driver,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.default_max_attempts == 0 {
            return Err(QueueError::InvalidConfig("queue.default_max_attempts must be at least 1".into()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::InvalidConfig("queue.visibility_timeout_seconds must be positive".into()));
        }
        Ok(())
    }
}

/// Worker loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    /// Jobs processed at once
    pub concurrency: usize,
    /// Abort a handler that runs longer than this and count it as a retryable failure
    pub handler_timeout: Option<Duration>,
    /// Renew the lease this often while a handler runs
    pub heartbeat_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(),
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(60),
            concurrency: 1,
            handler_timeout: None,
            heartbeat_interval: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> QueueResult<Self> {
        let defaults = Self::default();
        let config = Self {
            worker_id: snapshot
                .get_string("worker.id")
                .map(WorkerId::from)
                .unwrap_or(defaults.worker_id),
            poll_interval: snapshot
                .get_millis("worker.poll_interval_ms")?
                .unwrap_or(defaults.poll_interval),
            visibility_timeout: snapshot
                .get_seconds("worker.visibility_timeout_seconds")?
                .unwrap_or(defaults.visibility_timeout),
            concurrency: snapshot
                .parse("worker.concurrency")?
                .unwrap_or(defaults.concurrency),
            handler_timeout: snapshot
                .get_seconds("worker.handler_timeout_seconds")?
                .filter(|d| !d.is_zero()),
            heartbeat_interval: snapshot
                .get_seconds("worker.heartbeat_interval_seconds")?
                .filter(|d| !d.is_zero()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = Some(handler_timeout);
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = Some(heartbeat_interval);
        self
    }

    /// Reject settings that would break lease ownership
    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig("worker.concurrency must be at least 1".into()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::InvalidConfig("worker.visibility_timeout_seconds must be positive".into()));
        }
        if let Some(heartbeat) = self.heartbeat_interval {
            if heartbeat >= self.visibility_timeout {
                return Err(QueueError::InvalidConfig(format!(
                    "heartbeat interval {heartbeat:?} must be shorter than the visibility timeout {:?}",
                    self.visibility_timeout
                )));
            }
        } else if let Some(timeout) = self.handler_timeout {
            if timeout >= self.visibility_timeout {
                warn!(
                    ?timeout,
                    visibility_timeout = ?self.visibility_timeout,
                    "Handler timeout is not shorter than the visibility timeout; jobs may run twice"
                );
            }
        }
        Ok(())
    }
}

/// Scheduler loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> QueueResult<Self> {
        Ok(Self {
            poll_interval: snapshot
                .get_millis("scheduler.poll_interval_ms")?
                .unwrap_or_else(|| Self::default().poll_interval),
        })
    }
}

/// Build the backend named by `config.driver`
pub async fn backend_from_config(config: &QueueConfig) -> QueueResult<Arc<dyn QueueBackend>> {
    match &config.driver {
        Driver::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "redis")]
        Driver::Redis { url } => {
            let backend = crate::backend::redis::RedisBackend::connect(url, config.key_prefix.clone()).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "redis"))]
        Driver::Redis { .. } => Err(QueueError::InvalidConfig(
            "jobs.driver=redis requires the `redis` feature".into(),
        )),
    }
}
