//! Tunables for the coordination core, loaded from TOML.
//!
//! Every section defaults independently, so a file only needs to name the
//! values it overrides. A missing file is not an error.

use chrono::Duration;
use fs_err as fs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".workout-sync/coordinator.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub channel: ChannelConfig,
    pub breaker: BreakerConfig,
    pub guard: GuardConfig,
    pub arbitration: ArbitrationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long an immediate message waits for a reply before it counts as
    /// a failure.
    pub reply_timeout_ms: u64,
    /// Minimum spacing between two context replications.
    pub context_min_interval_ms: u64,
    /// Baseline spacing of steady-state metric pushes.
    pub metrics_interval_ms: u64,
    /// Spacing of the low-frequency tracking-status heartbeat.
    pub tracking_status_interval_ms: u64,
    /// First delay before a failed control command is retried.
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 750,
            context_min_interval_ms: 1_000,
            metrics_interval_ms: 2_000,
            tracking_status_interval_ms: 15_000,
            retry_delay_ms: 1_000,
            retry_max_delay_ms: 8_000,
            retry_max_attempts: 3,
        }
    }
}

impl ChannelConfig {
    pub fn reply_timeout(&self) -> Duration {
        millis(self.reply_timeout_ms)
    }

    pub fn context_min_interval(&self) -> Duration {
        millis(self.context_min_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        millis(self.metrics_interval_ms)
    }

    pub fn tracking_status_interval(&self) -> Duration {
        millis(self.tracking_status_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        millis(self.retry_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        millis(self.retry_max_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub window_ms: u64,
    /// How many identical envelopes inside the window are processed before
    /// the rest are suppressed.
    pub max_repeats: u32,
    pub capacity: usize,
    /// How far a peer command may predate the last local transition and
    /// still apply. Absorbs clock skew between the devices.
    pub stale_tolerance_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_000,
            max_repeats: 1,
            capacity: 32,
            stale_tolerance_ms: 250,
        }
    }
}

impl GuardConfig {
    pub fn window(&self) -> Duration {
        millis(self.window_ms)
    }

    pub fn stale_tolerance(&self) -> Duration {
        millis(self.stale_tolerance_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Delay before an improved location signal is trusted.
    pub stabilization_secs: u64,
    /// Horizontal accuracy at or below which a fix counts as good.
    pub good_accuracy_meters: f64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            stabilization_secs: 5,
            good_accuracy_meters: 20.0,
        }
    }
}

impl ArbitrationConfig {
    pub fn stabilization(&self) -> Duration {
        Duration::seconds(self.stabilization_secs as i64)
    }
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(value as i64)
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(CoreError::HomeDirNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<CoordinatorConfig> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    load_config_from(&path)
}

fn load_config_from(path: &Path) -> Result<CoordinatorConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CoordinatorConfig::default())
        }
        Err(err) => {
            return Err(CoreError::Io {
                context: "Failed to read coordinator config".to_string(),
                source: err,
            })
        }
    };

    toml::from_str::<CoordinatorConfig>(&content).map_err(|err| CoreError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
