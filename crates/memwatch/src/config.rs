//! Watchdog configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default critical threshold (50 MB)
pub const DEFAULT_CRITICAL_BYTES: i64 = 50 * 1024 * 1024;

/// Default sampling period
pub const DEFAULT_INTERVAL_MILLIS: u64 = 1000;

/// Settings for a [`MemoryWatchdog`](crate::MemoryWatchdog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Critical threshold in bytes; warnings start at half of it
    #[serde(alias = "criticalBytes")]
    pub critical_bytes: i64,

    /// Sampling period in milliseconds
    #[serde(alias = "intervalMillis")]
    pub interval_millis: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            critical_bytes: DEFAULT_CRITICAL_BYTES,
            interval_millis: DEFAULT_INTERVAL_MILLIS,
        }
    }
}

impl WatchdogConfig {
    /// Default interval with the given threshold.
    pub fn with_critical_bytes(critical_bytes: i64) -> Self {
        Self {
            critical_bytes,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.critical_bytes <= 0 {
            return Err(ConfigError::NonPositiveThreshold(self.critical_bytes));
        }
        if self.interval_millis == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("critical threshold must be positive, got {0}")]
    NonPositiveThreshold(i64),

    #[error("sampling interval must be at least 1 ms")]
    ZeroInterval,

    #[error("invalid watchdog config: {0}")]
    Parse(#[from] serde_json::Error),
}
