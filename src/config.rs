//! Engine configuration.
//!
//! Configuration is plain data loaded from TOML, with a couple of
//! environment overrides for quick tuning:
//!
//! ```toml
//! num_workers = 8
//! poll_interval_ms = 50
//! default_block_volume = 1000000
//! cache_memory_limit = 2147483648
//! ```

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::num_workers`].
pub const ENV_WORKERS: &str = "ROIFLOW_WORKERS";

/// Environment variable overriding [`EngineConfig::poll_interval_ms`].
pub const ENV_POLL_INTERVAL: &str = "ROIFLOW_POLL_INTERVAL_MS";

/// Settings for a graph and its scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; 0 runs every request on the waiting thread.
    pub num_workers: usize,
    /// How often an outer blocking wait wakes up while waiting.
    pub poll_interval_ms: u64,
    /// Target tile volume for caches without an explicit block shape.
    pub default_block_volume: usize,
    /// Byte budget for each cache; unlimited when absent.
    pub cache_memory_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            poll_interval_ms: 100,
            default_block_volume: 1_000_000,
            cache_memory_limit: None,
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Apply `ROIFLOW_WORKERS` and `ROIFLOW_POLL_INTERVAL_MS` if set.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_WORKERS) {
            self.num_workers = parse_value(ENV_WORKERS, &value)?;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL) {
            self.poll_interval_ms = parse_value(ENV_POLL_INTERVAL, &value)?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval_ms".to_string(),
                value: "0".to_string(),
            });
        }
        if self.default_block_volume == 0 {
            return Err(ConfigError::InvalidValue {
                key: "default_block_volume".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(self)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn with_default_block_volume(mut self, volume: usize) -> Self {
        self.default_block_volume = volume.max(1);
        self
    }

    pub fn with_cache_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.cache_memory_limit = limit;
        self
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
