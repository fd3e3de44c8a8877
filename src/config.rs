//! Application configuration.
//!
//! Loaded from an optional YAML file with environment-variable overrides.
//! Every field has a serde default so a missing config file yields a
//! fully usable development setup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded schedule for async-poll providers.
///
/// Defaults follow the provider budget: 8 attempts with delays growing
/// from 1.5s toward 15s, roughly 60s in total. Exhaustion is a hard
/// timeout, never a silent partial result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_poll_first_delay_ms")]
    pub first_delay_ms: u64,
    #[serde(default = "default_poll_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_poll_growth")]
    pub growth: f64,
}

fn default_poll_attempts() -> u32 {
    8
}
fn default_poll_first_delay_ms() -> u64 {
    1_500
}
fn default_poll_max_delay_ms() -> u64 {
    15_000
}
fn default_poll_growth() -> f64 {
    1.6
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_poll_attempts(),
            first_delay_ms: default_poll_first_delay_ms(),
            max_delay_ms: default_poll_max_delay_ms(),
            growth: default_poll_growth(),
        }
    }
}

impl PollConfig {
    /// Delay before poll attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = (self.first_delay_ms as f64 * self.growth.powi(attempt as i32))
            .min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Watchdog thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    /// A job sitting in a transient provider-facing state longer than this
    /// is flagged as stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_stuck_after_secs() -> u64 {
    300
}
fn default_scan_interval_secs() -> u64 {
    30
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stuck_after_secs: default_stuck_after_secs(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and local artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Path to the model catalog YAML; empty means built-in catalog only.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Fallback generations-per-rolling-hour cap when no tier policy is
    /// wired in.
    #[serde(default = "default_rate_cap")]
    pub default_rate_cap: u32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}
fn default_rate_cap() -> u32 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            catalog_path: None,
            poll: PollConfig::default(),
            watchdog: WatchdogConfig::default(),
            default_rate_cap: default_rate_cap(),
        }
    }
}

impl Config {
    /// Load from `path` if it exists, then apply env overrides.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&raw)?
            }
            _ => Self::default(),
        };

        if let Ok(dir) = std::env::var("MEDIAFORGE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("MEDIAFORGE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(cap) = std::env::var("MEDIAFORGE_RATE_CAP") {
            if let Ok(cap) = cap.parse() {
                config.default_rate_cap = cap;
            }
        }

        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mediaforge.db")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}
