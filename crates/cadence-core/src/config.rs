//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};
use crate::time::TimeSpan;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
            .join("config.toml")
    }

    /// Reject values the scheduler or timer would refuse at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_idle_wait_ms == 0 {
            return Err(CadenceError::Config("scheduler.max_idle_wait_ms must be > 0".into()));
        }
        if self.scheduler.default_max_concurrent == 0 {
            return Err(CadenceError::Config(
                "scheduler.default_max_concurrent must be >= 1".into(),
            ));
        }
        if self.timer.interval_ms == 0 || self.timer.interval_ms > i32::MAX as u64 {
            return Err(CadenceError::Config(format!(
                "timer.interval_ms must be within 1..={}",
                i32::MAX
            )));
        }
        if self.timer.count == Some(0) {
            return Err(CadenceError::Config("timer.count must be >= 1 when set".into()));
        }
        if self.timer.channel_capacity == 0 {
            return Err(CadenceError::Config("timer.channel_capacity must be >= 1".into()));
        }
        Ok(())
    }
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on a single wait before the loop re-reads the clock.
    #[serde(default = "default_max_idle_wait_ms")]
    pub max_idle_wait_ms: u64,
    /// Concurrency limit applied by hosts that build tasks from config.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,
    /// Wait-queue limit applied by hosts that build tasks from config.
    #[serde(default)]
    pub default_max_enqueued: usize,
}

fn default_max_idle_wait_ms() -> u64 { 1_000 }
fn default_max_concurrent() -> usize { 1 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_idle_wait_ms: default_max_idle_wait_ms(),
            default_max_concurrent: default_max_concurrent(),
            default_max_enqueued: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn max_idle_wait(&self) -> TimeSpan {
        TimeSpan::from_millis(self.max_idle_wait_ms.min(i64::MAX as u64) as i64)
    }
}

/// Periodic timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Stop after this many ticks (None = unbounded).
    #[serde(default)]
    pub count: Option<u64>,
    /// Busy-wait instead of sleeping when this close to the deadline.
    #[serde(default = "default_spin_wait_us")]
    pub spin_wait_us: u64,
    /// Ticks buffered per subscriber before a slow one starts skipping.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_interval_ms() -> u64 { 1_000 }
fn default_spin_wait_us() -> u64 { 500 }
fn default_channel_capacity() -> usize { 64 }

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            count: None,
            spin_wait_us: default_spin_wait_us(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl TimerConfig {
    pub fn interval(&self) -> TimeSpan {
        TimeSpan::from_millis(self.interval_ms.min(i64::MAX as u64) as i64)
    }

    pub fn spin_wait(&self) -> TimeSpan {
        TimeSpan::from_micros(self.spin_wait_us.min(i64::MAX as u64) as i64)
    }
}

/// Logging configuration for hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String { "cadence=info,cadence_scheduler=info".into() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}
