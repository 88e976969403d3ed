//! Structured logging setup.
//!
//! The core itself only emits `tracing` events (fields `slot`, `instance`,
//! `fcount`, `outcome`); this module installs a `tracing-subscriber` for
//! binaries and integration tests that want to see them.
//!
//! `RUST_LOG` always wins over the configured level.
//!
//! # Example
//! ```no_run
//! use isp_core::{config::CoreConfig, logging};
//!
//! let config = CoreConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(instance = 0, "stream opened");
//! # Ok::<(), isp_core::IspError>(())
//! ```

use crate::config::CoreConfig;
use crate::error::{IspError, IspResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    Pretty,
    /// Single-line, no colours
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = IspError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(IspError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options with `level` and defaults otherwise
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options derived from the core configuration
    pub fn from_core_config(config: &CoreConfig) -> IspResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colours
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install a subscriber configured from `config.application`
pub fn init_from_config(config: &CoreConfig) -> IspResult<()> {
    init(LoggingConfig::from_core_config(config)?)
}

/// Install a subscriber.
///
/// Idempotent: if a global subscriber is already set (tests, embedding
/// applications) this returns `Ok(())`.
pub fn init(config: LoggingConfig) -> IspResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(base.pretty().with_ansi(config.with_ansi).with_filter(filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(base.compact().with_ansi(false).with_filter(filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(base.json().with_filter(filter))
            .try_init(),
    };
    tolerate_existing(result)
}

fn tolerate_existing(result: Result<(), TryInitError>) -> IspResult<()> {
    match result {
        Ok(()) => Ok(()),
        // either the global dispatcher or the `log` bridge is already installed
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(IspError::Configuration(format!(
            "Failed to initialize logging: {}",
            e
        ))),
    }
}

/// Parse a level name (case-insensitive)
pub fn parse_log_level(level: &str) -> IspResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(IspError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn derives_from_core_config() {
        let mut core = CoreConfig::default();
        core.application.log_level = "debug".into();
        core.application.log_format = "json".into();
        let config = LoggingConfig::from_core_config(&core).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn builder_overrides() {
        let config = LoggingConfig::new(Level::ERROR)
            .with_format(OutputFormat::Compact)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.format, OutputFormat::Compact);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }
}
