//! Configuration management for quotagate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix for environment variable overrides, e.g. `QUOTAGATE__STORE__URL`.
const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for quotagate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Synchronization tuning applied to every gate
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the gate rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL of the shared counter store
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Use an in-process store instead of redis
    #[serde(default)]
    pub memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            memory: false,
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Per-gate synchronization tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tokens granted locally per successful synchronization
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Minimum time between two synchronization attempts, in microseconds
    #[serde(default = "default_min_sync_interval")]
    pub min_sync_interval_us: u64,

    /// Registration attempts when recovering a missing script
    #[serde(default = "default_registration_retries")]
    pub registration_retries: u32,

    /// Pause between registration attempts, in milliseconds
    #[serde(default = "default_registration_backoff")]
    pub registration_backoff_ms: u64,
}

impl SyncConfig {
    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_micros(self.min_sync_interval_us)
    }

    pub fn registration_backoff(&self) -> Duration {
        Duration::from_millis(self.registration_backoff_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_sync_interval_us: default_min_sync_interval(),
            registration_retries: default_registration_retries(),
            registration_backoff_ms: default_registration_backoff(),
        }
    }
}

fn default_batch_size() -> i64 {
    10
}

fn default_min_sync_interval() -> u64 {
    100
}

fn default_registration_retries() -> u32 {
    3
}

fn default_registration_backoff() -> u64 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotagateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: QuotagateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::QuotaError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by environment
    /// variables prefixed with `QUOTAGATE__`.
    pub fn load(path: Option<&str>) -> crate::error::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
