//! Engine settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(doc)]
use crate::pipeline::RunConfig;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default time a correlated call waits for its response, in milliseconds.
pub const DEFAULT_CORRELATOR_MAX_WAIT_MS: u64 = 5_000;

/// Default number of queued requests a subsystem inbox holds.
pub const DEFAULT_DB_INBOX_CAPACITY: usize = 256;

/// Default number of completion reports retained per cluster.
pub const DEFAULT_STATS_HISTORY: usize = 32;

/// Default scaling loop period, in milliseconds.
pub const DEFAULT_SCALE_INTERVAL_MS: u64 = 1_000;

/// Default capacity of each stage queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Host-wide settings, read from the environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    pub correlator_max_wait_ms: u64,
    pub db_inbox_capacity: usize,
    pub stats_history: usize,
    /// Scaling period used by [`RunConfig::from_settings`]
    pub default_scale_interval_ms: u64,
    /// Queue capacity used by [`RunConfig::from_settings`]
    pub default_channel_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            correlator_max_wait_ms: DEFAULT_CORRELATOR_MAX_WAIT_MS,
            db_inbox_capacity: DEFAULT_DB_INBOX_CAPACITY,
            stats_history: DEFAULT_STATS_HISTORY,
            default_scale_interval_ms: DEFAULT_SCALE_INTERVAL_MS,
            default_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineSettings {
    /// Load settings from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let settings = Self {
            correlator_max_wait_ms: env_or(
                "PIPEHOST_CORRELATOR_MAX_WAIT_MS",
                DEFAULT_CORRELATOR_MAX_WAIT_MS,
            ),
            db_inbox_capacity: env_or("PIPEHOST_DB_INBOX_CAPACITY", DEFAULT_DB_INBOX_CAPACITY),
            stats_history: env_or("PIPEHOST_STATS_HISTORY", DEFAULT_STATS_HISTORY),
            default_scale_interval_ms: env_or(
                "PIPEHOST_DEFAULT_SCALE_INTERVAL_MS",
                DEFAULT_SCALE_INTERVAL_MS,
            ),
            default_channel_capacity: env_or(
                "PIPEHOST_DEFAULT_CHANNEL_CAPACITY",
                DEFAULT_CHANNEL_CAPACITY,
            ),
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.correlator_max_wait_ms == 0 {
            anyhow::bail!("Correlator max wait must be greater than 0");
        }

        if self.db_inbox_capacity == 0 {
            anyhow::bail!("Database inbox capacity must be greater than 0");
        }

        if self.stats_history == 0 {
            anyhow::bail!("Stats history must keep at least one report");
        }

        if self.default_scale_interval_ms == 0 {
            anyhow::bail!("Scale interval must be greater than 0");
        }

        if self.default_channel_capacity == 0 {
            anyhow::bail!("Channel capacity must be greater than 0");
        }

        Ok(())
    }

    pub fn correlator_max_wait(&self) -> Duration {
        Duration::from_millis(self.correlator_max_wait_ms)
    }
}

/// Unparseable values fall back to the default
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
