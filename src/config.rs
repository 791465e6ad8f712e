//! Engine configuration using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_ENGINE_`, nested keys separated by `__`
//!
//! ```text
//! DAQ_ENGINE_SCHEDULER__STEP_INTERVAL=250ms
//! DAQ_ENGINE_RETRY__MAX_ATTEMPTS=5
//! DAQ_ENGINE_LOG__FILTER=debug
//! ```
//!
//! Durations use `humantime` notation (`"100ms"`, `"1s"`, `"10min"`).
//!
//! # Example
//!
//! ```no_run
//! use daq_engine::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("engine.toml")?;
//! println!("step interval: {:?}", config.scheduler.step_interval);
//! # Ok::<(), daq_engine::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::logging::LogSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Iteration cadence and lifecycle settings
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Default adapter retry policy
    #[serde(default)]
    pub retry: RetrySettings,
    /// Logging setup
    #[serde(default)]
    pub log: LogSettings,
}

/// Scheduler settings handed over by the experiment loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Minimum time between the starts of consecutive iterations
    #[serde(default = "default_step_interval", with = "humantime_serde")]
    pub step_interval: Duration,
    /// How often sinks are asked to flush
    #[serde(default = "default_save_interval", with = "humantime_serde")]
    pub save_interval: Duration,
    /// Minimum spacing of live-state updates
    #[serde(default = "default_plot_interval", with = "humantime_serde")]
    pub plot_interval: Duration,
    /// How often sinks are asked to start a new segment
    #[serde(default, with = "humantime_serde")]
    pub split_interval: Option<Duration>,
    /// Experiment time after which the run terminates
    #[serde(default, with = "humantime_serde")]
    pub end: Option<Duration>,
    /// Run the asynchronous variant
    #[serde(default, rename = "async")]
    pub async_mode: bool,
    /// Size of the worker pool used for each fan-out step
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Treat an exhausted channel on any commit as fatal
    #[serde(default)]
    pub fatal_errors: bool,
    /// Terminate once every routine has gone inert
    #[serde(default = "default_true")]
    pub end_with_routines: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            step_interval: default_step_interval(),
            save_interval: default_save_interval(),
            plot_interval: default_plot_interval(),
            split_interval: None,
            end: None,
            async_mode: false,
            workers: default_workers(),
            fatal_errors: false,
            end_with_routines: true,
        }
    }
}

/// Adapter retry defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_reconnects: default_max_reconnects(),
            timeout: default_timeout(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            max_reconnects: settings.max_reconnects,
            timeout: settings.timeout,
            reconnect_delay: settings.reconnect_delay,
        }
    }
}

fn default_step_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_save_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_plot_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_workers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_reconnects() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(100)
}

impl EngineConfig {
    /// Load from a TOML file with environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> AppResult<Self> {
        let config: EngineConfig = Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_ENGINE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let config: EngineConfig = Self::figment().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
    }

    /// Reject settings that parse but cannot drive a run.
    pub fn validate(&self) -> AppResult<()> {
        if self.scheduler.step_interval.is_zero() {
            return Err(DaqError::Configuration(
                "scheduler.step_interval must be positive".to_string(),
            ));
        }
        if self.scheduler.workers == 0 {
            return Err(DaqError::Configuration(
                "scheduler.workers must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DaqError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.timeout.is_zero() {
            return Err(DaqError::Configuration(
                "retry.timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }
}

/// Converts a time string into seconds.
///
/// Bare numbers are seconds; `inf` means forever; anything else is read as a
/// humantime duration, e.g. `"10 minutes"` or `"1h 30m"`.
pub fn parse_time(text: &str) -> AppResult<f64> {
    let trimmed = text.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_nan() {
            return Err(DaqError::Configuration(format!("invalid time '{}'", text)));
        }
        return Ok(seconds);
    }

    // humantime wants "10minutes" rather than "10 minutes"
    let mut compact = String::with_capacity(trimmed.len());
    let mut previous_digit = false;
    for c in trimmed.chars() {
        if c.is_whitespace() && previous_digit {
            continue;
        }
        previous_digit = c.is_ascii_digit();
        compact.push(c);
    }

    humantime::parse_duration(&compact)
        .map(|d| d.as_secs_f64())
        .map_err(|e| DaqError::Configuration(format!("invalid time '{}': {}", text, e)))
}
