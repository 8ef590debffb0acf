//! Engine configuration.
//!
//! Everything has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! query_page_size = 100
//! poll_interval_secs = 60
//! error_backoff_ms = 1000
//! quarantine = "until_restart"
//!
//! [store_retry]
//! max_attempts = 5
//! base_delay_ms = 200
//! multiplier = 2.0
//! max_delay_ms = 10000
//!
//! [tasks."notify.email.send.v1"]
//! max_batch_count = 2
//! max_tasks_per_batch = 20
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::impls::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-type dispatcher limits, supplied at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherOptions {
    /// Maximum number of batches of this type running at once.
    pub max_batch_count: usize,
    pub max_tasks_per_batch: usize,
    /// The handler deletes its own tasks; the coordinator must not.
    pub handles_deletion: bool,
}

impl DispatcherOptions {
    pub fn new(max_batch_count: usize, max_tasks_per_batch: usize) -> Self {
        Self {
            max_batch_count,
            max_tasks_per_batch,
            handles_deletion: false,
        }
    }

    pub fn handles_deletion(mut self, handles_deletion: bool) -> Self {
        self.handles_deletion = handles_deletion;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_count == 0 {
            return Err(ConfigError::Invalid("max_batch_count must be >= 1".into()));
        }
        if self.max_tasks_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "max_tasks_per_batch must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

/// What happens to a task type after one of its batches faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuarantinePolicy {
    /// Disabled until the process restarts or an explicit re-enable.
    #[default]
    UntilRestart,
    /// Re-enabled automatically once the cooldown has elapsed.
    Cooldown { cooldown_secs: u64 },
}

impl QuarantinePolicy {
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            QuarantinePolicy::UntilRestart => None,
            QuarantinePolicy::Cooldown { cooldown_secs } => {
                Some(Duration::from_secs(*cooldown_secs))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for StoreRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl StoreRetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum tasks fetched by one refill query.
    pub query_page_size: usize,
    /// Safety-net refill interval; picks up tasks whose `wait_until` passed
    /// without anyone calling `notify()`. 0 disables it.
    pub poll_interval_secs: u64,
    /// Pause after a store call failed even after retries.
    pub error_backoff_ms: u64,
    pub quarantine: QuarantinePolicy,
    pub store_retry: StoreRetrySettings,
    /// Per-type overrides of the options given at registration.
    pub tasks: BTreeMap<String, DispatcherOptions>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_page_size: 100,
            poll_interval_secs: 60,
            error_backoff_ms: 1000,
            quarantine: QuarantinePolicy::default(),
            store_retry: StoreRetrySettings::default(),
            tasks: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query_page_size == 0 {
            return Err(ConfigError::Invalid("query_page_size must be >= 1".into()));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store_retry.max_attempts must be >= 1".into(),
            ));
        }
        if !(self.store_retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "store_retry.multiplier must be >= 1.0".into(),
            ));
        }
        for (task_type, options) in &self.tasks {
            options
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("tasks.{task_type}: {e}")))?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}
