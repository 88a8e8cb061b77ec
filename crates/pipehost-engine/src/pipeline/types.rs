//! Core value types for pipeline runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{EngineSettings, DEFAULT_CHANNEL_CAPACITY, DEFAULT_SCALE_INTERVAL_MS};
use crate::error::ProvisionError;
use crate::pipeline::state::LifecycleState;

/// Pipeline payload
pub type Item = serde_json::Value;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

/// How a cluster is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Runs once per explicit provision request
    #[default]
    Batch,
    /// Runs continuously while mounted, at most one live supervisor
    Stream,
}

/// What happens to a cluster after one of its runs crashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnCrash {
    /// Keep the cluster mounted
    #[default]
    Ignore,
    /// Unmount the cluster until it is mounted again
    Unmount,
}

/// Congestion tuning for one backpressure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Depth above which the channel reports congestion
    pub threshold: usize,
    /// Worker multiplier applied to the consuming stage on congestion
    pub growth_factor: u32,
    /// Bound of the underlying queue
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_scale_interval_ms() -> u64 {
    DEFAULT_SCALE_INTERVAL_MS
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            threshold: 128,
            growth_factor: 2,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Tunables for one cluster's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub identifier: String,
    #[serde(default)]
    pub on_crash: OnCrash,
    #[serde(default)]
    pub mode: RunMode,
    pub start_with_transform: u32,
    pub start_with_load: u32,
    /// Extract -> Transform queue
    #[serde(default)]
    pub et_channel: ChannelConfig,
    /// Transform -> Load queue
    #[serde(default)]
    pub tl_channel: ChannelConfig,
    #[serde(default)]
    pub max_transform_workers: Option<u32>,
    #[serde(default)]
    pub max_load_workers: Option<u32>,
    #[serde(default = "default_scale_interval_ms")]
    pub scale_interval_ms: u64,
}

impl RunConfig {
    /// Batch config with one worker per stage and default channel tuning
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            on_crash: OnCrash::default(),
            mode: RunMode::Batch,
            start_with_transform: 1,
            start_with_load: 1,
            et_channel: ChannelConfig::default(),
            tl_channel: ChannelConfig::default(),
            max_transform_workers: None,
            max_load_workers: None,
            scale_interval_ms: DEFAULT_SCALE_INTERVAL_MS,
        }
    }

    /// Like [`RunConfig::new`], with the host's scaling period and queue capacity
    pub fn from_settings(identifier: impl Into<String>, settings: &EngineSettings) -> Self {
        let mut config = Self::new(identifier);
        config.scale_interval_ms = settings.default_scale_interval_ms;
        config.et_channel.capacity = settings.default_channel_capacity;
        config.tl_channel.capacity = settings.default_channel_capacity;
        config
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_on_crash(mut self, on_crash: OnCrash) -> Self {
        self.on_crash = on_crash;
        self
    }

    pub fn with_workers(mut self, transform: u32, load: u32) -> Self {
        self.start_with_transform = transform;
        self.start_with_load = load;
        self
    }

    pub fn with_et_channel(mut self, channel: ChannelConfig) -> Self {
        self.et_channel = channel;
        self
    }

    pub fn with_tl_channel(mut self, channel: ChannelConfig) -> Self {
        self.tl_channel = channel;
        self
    }

    pub fn with_scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn is_stream(&self) -> bool {
        self.mode == RunMode::Stream
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let invalid = |msg: String| Err(ProvisionError::InvalidConfig(msg));

        if self.identifier.trim().is_empty() {
            return invalid("identifier cannot be empty".to_string());
        }
        if self.start_with_transform == 0 || self.start_with_load == 0 {
            return invalid(format!(
                "'{}' must start with at least one transform and one load worker",
                self.identifier
            ));
        }
        for (name, channel) in [("et", &self.et_channel), ("tl", &self.tl_channel)] {
            if channel.threshold == 0 {
                return invalid(format!("{name} threshold must be greater than 0"));
            }
            if channel.growth_factor == 0 {
                return invalid(format!("{name} growth factor must be at least 1"));
            }
            if channel.capacity == 0 {
                return invalid(format!("{name} capacity must be greater than 0"));
            }
        }
        if self.scale_interval_ms == 0 {
            return invalid("scale interval must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub extract_workers: u64,
    pub transform_workers: u64,
    pub load_workers: u64,
    /// Congestion breaches observed on the Extract -> Transform queue
    pub et_breaches: u64,
    /// Congestion breaches observed on the Transform -> Load queue
    pub tl_breaches: u64,
    pub items_extracted: u64,
    /// Rejected by verification or by a transform returning `None`
    pub items_filtered: u64,
    /// Discarded by a worker after a user-code fault
    pub items_dropped: u64,
    pub load_received: u64,
    pub items_loaded: u64,
}

impl Statistics {
    pub fn workers(&self, stage: Stage) -> u64 {
        match stage {
            Stage::Extract => self.extract_workers,
            Stage::Transform => self.transform_workers,
            Stage::Load => self.load_workers,
        }
    }
}

/// Produced by a supervisor once its pipeline has drained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub supervisor_id: u32,
    pub module: String,
    pub cluster: String,
    pub metadata: serde_json::Value,
    pub config: RunConfig,
    pub statistics: Statistics,
    pub state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub crashed: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_defaults_validate() {
        let config = RunConfig::new("wordcount");
        assert!(config.validate().is_ok());
        assert!(!config.is_stream());
        assert_eq!(config.scale_interval(), Duration::from_millis(DEFAULT_SCALE_INTERVAL_MS));
    }

    #[test]
    fn test_run_config_from_settings() {
        let settings = EngineSettings {
            default_scale_interval_ms: 250,
            default_channel_capacity: 8,
            ..EngineSettings::default()
        };
        let config = RunConfig::from_settings("events", &settings);
        assert_eq!(config.scale_interval(), Duration::from_millis(250));
        assert_eq!(config.et_channel.capacity, 8);
        assert_eq!(config.tl_channel.capacity, 8);
        assert_eq!(config.et_channel.threshold, ChannelConfig::default().threshold);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_config_rejects_zero_growth_factor() {
        let config = RunConfig::new("x").with_et_channel(ChannelConfig {
            threshold: 4,
            growth_factor: 0,
            capacity: 16,
        });
        assert!(matches!(config.validate(), Err(ProvisionError::InvalidConfig(_))));
    }

    #[test]
    fn test_run_config_rejects_zero_workers() {
        let config = RunConfig::new("x").with_workers(0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_config_deserializes_with_defaults() {
        let config: RunConfig = serde_json::from_value(serde_json::json!({
            "identifier": "events",
            "mode": "stream",
            "start_with_transform": 2,
            "start_with_load": 3,
            "et_channel": { "threshold": 10, "growth_factor": 3 }
        }))
        .unwrap();

        assert!(config.is_stream());
        assert_eq!(config.on_crash, OnCrash::Ignore);
        assert_eq!(config.et_channel.capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.tl_channel, ChannelConfig::default());
        assert_eq!(config.scale_interval_ms, DEFAULT_SCALE_INTERVAL_MS);
    }
}
