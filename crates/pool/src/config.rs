use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Worker pool configuration, typically parsed from TOML.
///
/// ```toml
/// pool_size = 4
/// retry_interval_ms = 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker slots. Unset = available parallelism.
    #[serde(default)]
    pub pool_size: Option<usize>,
    /// Polling interval used when a run finds the pool fully occupied.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

fn default_retry_interval() -> u64 {
    50
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl PoolConfig {
    /// Config with an explicit slot count and default retry interval.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size: Some(pool_size),
            ..Self::default()
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults with environment overrides applied, for running without a file.
    pub fn from_env() -> Result<Self, PoolError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolve the slot count (unset means available parallelism).
    pub fn resolved_pool_size(&self) -> usize {
        match self.pool_size {
            Some(size) => size,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Apply environment variable overrides.
    ///
    /// - `PIPEPOOL_POOL_SIZE` → `pool_size`
    /// - `PIPEPOOL_RETRY_INTERVAL_MS` → `retry_interval_ms`
    ///
    /// Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PIPEPOOL_POOL_SIZE") {
            if let Ok(size) = v.parse::<usize>() {
                self.pool_size = Some(size);
            }
        }
        if let Ok(v) = std::env::var("PIPEPOOL_RETRY_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.retry_interval_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.retry_interval_ms == 0 {
            return Err(PoolError::Config(
                "retry_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
