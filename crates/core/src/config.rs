//! Configuration surface of the dispatch layer.
//!
//! Durations are whole seconds at every boundary (JSON and environment).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::HandlerId;
use crate::retry::RetryPolicy;

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "SYNCWARDEN_CONFIG";

const ENV_PREFIX: &str = "SYNCWARDEN_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What a duplicate submission does while one is already outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Discard the duplicate.
    Drop,
    /// Discard the duplicate but run one replacement after the outstanding
    /// execution finishes.
    #[default]
    RescheduleOnce,
}

/// Where a handler reads domain state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataConsistency {
    /// Primary / most current source.
    #[default]
    Strong,
    /// A replica that may lag.
    Delayed,
}

/// One bounded scheduler (one dispatch worker per workload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cluster-wide lease name; one active instance per name.
    pub name: String,
    /// Handler the scheduler dispatches sub-jobs to.
    pub handler: HandlerId,
    /// In-flight ceiling.
    pub max_capacity: usize,
    /// Per-source pull size.
    pub db_retrieve_batch_size: usize,
    #[serde(with = "serde_secs", rename = "run_time_secs")]
    pub run_time: Duration,
    #[serde(with = "serde_secs", rename = "lease_timeout_secs")]
    pub lease_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(name: impl Into<String>, handler: HandlerId) -> Self {
        Self {
            name: name.into(),
            handler,
            max_capacity: 10,
            db_retrieve_batch_size: 1000,
            run_time: Duration::from_secs(3600),
            lease_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_max_capacity(mut self, max: usize) -> Self {
        self.max_capacity = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.db_retrieve_batch_size = size;
        self
    }

    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn lease_key(&self) -> String {
        format!("scheduler:{}", self.name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(format!("scheduler {}: {msg}", self.name)));

        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("scheduler name must not be empty".into()));
        }
        if self.max_capacity == 0 {
            return invalid("max_capacity must be positive");
        }
        if self.db_retrieve_batch_size == 0 {
            return invalid("db_retrieve_batch_size must be positive");
        }
        if self.run_time.as_secs() == 0 {
            return invalid("run_time must be at least one second");
        }
        if self.lease_timeout.as_secs() == 0 {
            return invalid("lease_timeout must be at least one second");
        }
        if self.lease_timeout < self.run_time {
            return invalid("lease_timeout must not be shorter than run_time");
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let scope = format!(
            "{ENV_PREFIX}SCHEDULER_{}_",
            self.name.to_ascii_uppercase().replace(['-', '.', ':'], "_")
        );

        if let Some(v) = env_parse::<usize, _>(lookup, &format!("{scope}MAX_CAPACITY"))? {
            self.max_capacity = v;
        }
        if let Some(v) = env_parse::<usize, _>(lookup, &format!("{scope}DB_RETRIEVE_BATCH_SIZE"))? {
            self.db_retrieve_batch_size = v;
        }
        if let Some(v) = env_parse::<u64, _>(lookup, &format!("{scope}RUN_TIME_SECS"))? {
            self.run_time = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64, _>(lookup, &format!("{scope}LEASE_TIMEOUT_SECS"))? {
            self.lease_timeout = Duration::from_secs(v);
        }
        Ok(())
    }
}

/// Per-handler-type execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Age after which a claim is audited by the reconciler.
    #[serde(with = "serde_secs", rename = "staleness_threshold_secs")]
    pub staleness_threshold: Duration,
    pub dedup_policy: DedupPolicy,
    pub data_consistency: DataConsistency,
    /// TTL of the per-resource lease and of dedup markers.
    #[serde(with = "serde_secs", rename = "lease_timeout_secs")]
    pub lease_timeout: Duration,
    /// Orphan detections before a claim is marked failed instead of reset.
    pub max_orphan_strikes: u32,
    pub retry: RetryPolicy,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(3600),
            dedup_policy: DedupPolicy::RescheduleOnce,
            data_consistency: DataConsistency::Strong,
            lease_timeout: Duration::from_secs(3600),
            max_orphan_strikes: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl HandlerConfig {
    pub fn validate(&self, handler: &HandlerId) -> Result<(), ConfigError> {
        if self.staleness_threshold.as_secs() == 0 {
            return Err(ConfigError::Invalid(format!(
                "handler {handler}: staleness_threshold must be at least one second"
            )));
        }
        if self.lease_timeout.as_secs() == 0 {
            return Err(ConfigError::Invalid(format!(
                "handler {handler}: lease_timeout must be at least one second"
            )));
        }
        if self.max_orphan_strikes == 0 {
            return Err(ConfigError::Invalid(format!(
                "handler {handler}: max_orphan_strikes must be positive"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Claims examined per handler per sweep.
    pub batch_size: usize,
    #[serde(with = "serde_secs", rename = "lease_timeout_secs")]
    pub lease_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            lease_timeout: Duration::from_secs(600),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncwardenConfig {
    pub schedulers: Vec<SchedulerConfig>,
    pub reconciler: ReconcilerConfig,
    pub handlers: BTreeMap<HandlerId, HandlerConfig>,
}

impl SyncwardenConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from the process environment: the file named by
    /// `SYNCWARDEN_CONFIG` (defaults when unset), then scalar overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => Self::default(),
        };

        for scheduler in &mut config.schedulers {
            scheduler.apply_env(&lookup)?;
        }
        if let Some(v) = env_parse::<usize, _>(&lookup, &format!("{ENV_PREFIX}RECONCILE_BATCH_SIZE"))? {
            config.reconciler.batch_size = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::HashSet::new();
        for scheduler in &self.schedulers {
            scheduler.validate()?;
            if !names.insert(scheduler.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate scheduler name: {}",
                    scheduler.name
                )));
            }
        }
        if self.reconciler.batch_size == 0 {
            return Err(ConfigError::Invalid("reconciler batch_size must be positive".into()));
        }
        for (handler, config) in &self.handlers {
            config.validate(handler)?;
        }
        Ok(())
    }

    /// Settings for `handler`, falling back to defaults.
    pub fn handler(&self, handler: &HandlerId) -> HandlerConfig {
        self.handlers.get(handler).cloned().unwrap_or_default()
    }
}

fn env_parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value,
        }),
    }
}

/// (De)serialize a `Duration` as whole seconds.
pub mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
