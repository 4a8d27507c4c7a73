//! Layered runtime configuration: defaults, overlaid by an optional TOML
//! file, overlaid by `SUPERVISOR_*` environment variables. Last-wins per
//! field, mirroring the codebase's existing `dotenv` + `toml` configuration
//! convention.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::event_writer::{BATCH_SIZE, CHANNEL_CAPACITY, FLUSH_INTERVAL, FLUSH_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Partial overlay deserialized from a TOML file; every field optional so a
/// file can override just the fields it cares about.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    event_writer_capacity: Option<usize>,
    event_writer_batch_size: Option<usize>,
    event_writer_flush_interval_ms: Option<u64>,
    event_writer_flush_timeout_secs: Option<u64>,
    baseline_timer_period_secs: Option<u64>,
    denial_semaphore_capacity: Option<usize>,
    denial_log_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub event_writer_capacity: usize,
    pub event_writer_batch_size: usize,
    pub event_writer_flush_interval: Duration,
    pub event_writer_flush_timeout: Duration,
    pub baseline_timer_period: Duration,
    pub denial_semaphore_capacity: usize,
    pub denial_log_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            event_writer_capacity: CHANNEL_CAPACITY,
            event_writer_batch_size: BATCH_SIZE,
            event_writer_flush_interval: FLUSH_INTERVAL,
            event_writer_flush_timeout: FLUSH_TIMEOUT,
            baseline_timer_period: crate::baseline_timer::TICK_PERIOD,
            denial_semaphore_capacity: crate::supervisor::DENIAL_SEMAPHORE_CAPACITY,
            denial_log_timeout: crate::supervisor::DENIAL_LOG_TIMEOUT,
        }
    }
}

impl SupervisorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let overlay: ConfigOverlay = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = SupervisorConfig::default();
        config.apply_overlay(overlay);
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_usize("SUPERVISOR_EVENT_WRITER_CAPACITY") {
            self.event_writer_capacity = v;
        }
        if let Some(v) = env_usize("SUPERVISOR_EVENT_WRITER_BATCH_SIZE") {
            self.event_writer_batch_size = v;
        }
        if let Some(v) = env_u64("SUPERVISOR_EVENT_WRITER_FLUSH_INTERVAL_MS") {
            self.event_writer_flush_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("SUPERVISOR_EVENT_WRITER_FLUSH_TIMEOUT_SECS") {
            self.event_writer_flush_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("SUPERVISOR_BASELINE_TIMER_PERIOD_SECS") {
            self.baseline_timer_period = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("SUPERVISOR_DENIAL_SEMAPHORE_CAPACITY") {
            self.denial_semaphore_capacity = v;
        }
        if let Some(v) = env_u64("SUPERVISOR_DENIAL_LOG_TIMEOUT_SECS") {
            self.denial_log_timeout = Duration::from_secs(v);
        }
        self
    }

    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        if let Some(v) = overlay.event_writer_capacity {
            self.event_writer_capacity = v;
        }
        if let Some(v) = overlay.event_writer_batch_size {
            self.event_writer_batch_size = v;
        }
        if let Some(v) = overlay.event_writer_flush_interval_ms {
            self.event_writer_flush_interval = Duration::from_millis(v);
        }
        if let Some(v) = overlay.event_writer_flush_timeout_secs {
            self.event_writer_flush_timeout = Duration::from_secs(v);
        }
        if let Some(v) = overlay.baseline_timer_period_secs {
            self.baseline_timer_period = Duration::from_secs(v);
        }
        if let Some(v) = overlay.denial_semaphore_capacity {
            self.denial_semaphore_capacity = v;
        }
        if let Some(v) = overlay.denial_log_timeout_secs {
            self.denial_log_timeout = Duration::from_secs(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_writer_capacity == 0 {
            return Err(ConfigError::Invalid("event_writer_capacity must be > 0"));
        }
        if self.event_writer_batch_size == 0 {
            return Err(ConfigError::Invalid("event_writer_batch_size must be > 0"));
        }
        if self.denial_semaphore_capacity == 0 {
            return Err(ConfigError::Invalid("denial_semaphore_capacity must be > 0"));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
