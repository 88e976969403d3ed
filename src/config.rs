//! Configuration for the orchestration core using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/isp_core.toml` by default)
//! 2. environment variables prefixed with `ISP_CORE_`, nested keys separated
//!    by `__` (e.g. `ISP_CORE_WATCHDOG__TIMEOUT_MS=500`)
//!
//! Every section has defaults, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use isp_core::config::CoreConfig;
//!
//! let config = CoreConfig::load()?;
//! println!("watchdog: {:?}", config.watchdog.timeout());
//! # Ok::<(), isp_core::IspError>(())
//! ```

use crate::error::{IspError, IspResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/isp_core.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ISP_CORE_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Stuck-frame watchdog
    pub watchdog: WatchdogConfig,
    /// Frame queue sizing
    pub queue: QueueConfig,
    /// Lock behaviour
    pub lock: LockConfig,
    /// Bracketed exposure
    pub aeb: AebConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Watchdog configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Expiry after the last config-lock, in milliseconds
    #[serde(default = "default_watchdog_timeout")]
    pub timeout_ms: u64,
    /// Consecutive stuck detections before a force-restart is requested
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
}

/// Frame queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Preallocated frame records per queue
    #[serde(default = "default_frames_per_queue")]
    pub frames_per_queue: usize,
    /// WAIT_DONE depth above which the oldest frame is dropped
    #[serde(default = "default_max_wait_done")]
    pub max_wait_done: usize,
    /// Size of the per-instance metadata buffer, in bytes
    #[serde(default = "default_meta_buffer_size")]
    pub meta_buffer_size: usize,
}

/// Lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Bound on interrupt-context lock acquisition, in microseconds
    #[serde(default = "default_irq_acquire_timeout")]
    pub irq_acquire_timeout_us: u64,
}

/// Bracketed exposure configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AebConfig {
    /// Whether sensor HDR mode updates are honoured
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_name() -> String {
    "isp-core".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_watchdog_timeout() -> u64 {
    2000
}

fn default_max_consecutive_timeouts() -> u32 {
    3
}

fn default_frames_per_queue() -> usize {
    16
}

fn default_max_wait_done() -> usize {
    3
}

fn default_meta_buffer_size() -> usize {
    4096
}

fn default_irq_acquire_timeout() -> u64 {
    500
}

fn default_enabled() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_watchdog_timeout(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frames_per_queue: default_frames_per_queue(),
            max_wait_done: default_max_wait_done(),
            meta_buffer_size: default_meta_buffer_size(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            irq_acquire_timeout_us: default_irq_acquire_timeout(),
        }
    }
}

impl Default for AebConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

impl WatchdogConfig {
    /// Expiry as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl LockConfig {
    /// Interrupt acquire bound as a `Duration`.
    pub fn irq_acquire_timeout(&self) -> Duration {
        Duration::from_micros(self.irq_acquire_timeout_us)
    }
}

impl CoreConfig {
    /// Load from the default file and the environment, then validate.
    pub fn load() -> IspResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> IspResult<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(CoreConfig::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extract from an arbitrary figment, then validate.
    pub fn from_figment(figment: Figment) -> IspResult<Self> {
        let config: CoreConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> IspResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(IspError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(IspError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.watchdog.timeout_ms == 0 {
            return Err(IspError::Configuration(
                "watchdog.timeout_ms must be greater than 0".into(),
            ));
        }
        if self.watchdog.max_consecutive_timeouts == 0 {
            return Err(IspError::Configuration(
                "watchdog.max_consecutive_timeouts must be at least 1".into(),
            ));
        }

        if self.queue.frames_per_queue < 2 || self.queue.frames_per_queue > u16::MAX as usize {
            return Err(IspError::Configuration(format!(
                "queue.frames_per_queue must be between 2 and {}, got {}",
                u16::MAX,
                self.queue.frames_per_queue
            )));
        }
        if self.queue.max_wait_done == 0 || self.queue.max_wait_done >= self.queue.frames_per_queue {
            return Err(IspError::Configuration(format!(
                "queue.max_wait_done must be between 1 and frames_per_queue - 1, got {}",
                self.queue.max_wait_done
            )));
        }

        if self.lock.irq_acquire_timeout_us == 0 {
            return Err(IspError::Configuration(
                "lock.irq_acquire_timeout_us must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> IspResult<String> {
        toml::to_string_pretty(self).map_err(|e| IspError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.watchdog.timeout(), Duration::from_secs(2));
        assert_eq!(config.queue.frames_per_queue, 16);
        assert_eq!(config.queue.max_wait_done, 3);
        assert_eq!(config.lock.irq_acquire_timeout(), Duration::from_micros(500));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let figment = Figment::from(Serialized::defaults(CoreConfig::default())).merge(Toml::string(
            r#"
            [watchdog]
            timeout_ms = 250
            "#,
        ));
        let config = CoreConfig::from_figment(figment).unwrap();
        assert_eq!(config.watchdog.timeout_ms, 250);
        assert_eq!(config.watchdog.max_consecutive_timeouts, 3);
        assert_eq!(config.application.name, "isp-core");
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = CoreConfig::default();
        config.application.log_level = "verbose".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn wait_done_limit_must_fit_queue() {
        let mut config = CoreConfig::default();
        config.queue.max_wait_done = 16;
        assert!(config.validate().is_err());
        config.queue.max_wait_done = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn renders_as_toml() {
        let text = CoreConfig::default().to_toml_string().unwrap();
        assert!(text.contains("[watchdog]"));
        assert!(text.contains("timeout_ms = 2000"));
    }
}
