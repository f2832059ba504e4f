//! Tracing Infrastructure
//!
//! Structured, async-aware logging for the `eproc-daq` binary, built on
//! `tracing-subscriber`:
//! - Pretty, compact and JSON output
//! - `RUST_LOG` overrides the configured level
//! - Safe to call more than once (tests, embedding)
//!
//! # Example
//! ```no_run
//! use eproc_daq::{config::EprocConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EprocConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! info!(run_uid = "abc", "Acquisition started");
//! # Ok(())
//! # }
//! ```

use crate::config::EprocConfig;
use daq_core::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    #[default]
    Pretty,
    /// Compact format without colors (for long runs in a terminal multiplexer)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Subscriber settings resolved from [`EprocConfig`]
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Log span NEW/CLOSE events, useful to time engine operations
    pub with_span_events: bool,
    /// Only honored by the Pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    pub fn from_config(config: &EprocConfig) -> AppResult<Self> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?)
            .with_format(config.application.log_format))
    }

    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_ansi: true,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()))
    }
}

/// Initialize tracing from the application configuration
pub fn init_from_config(config: &EprocConfig) -> AppResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without touching anything when a subscriber is already set.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let filter = config.filter();
    let base = fmt::layer().with_span_events(span_events).with_target(true);

    let layer = match config.format {
        OutputFormat::Pretty => base
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
        OutputFormat::Json => base.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("tracing subscriber: {}", e)))
}

fn parse_log_level(level: &str) -> AppResult<Level> {
    level.parse::<Level>().map_err(|_| {
        DaqError::Configuration(format!(
            "unknown log level '{}', expected trace, debug, info, warn or error",
            level
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_tracing_config_from_config() {
        let mut config = EprocConfig::default();
        config.application.log_level = "debug".to_string();
        config.application.log_format = OutputFormat::Compact;

        let tracing_config = TracingConfig::from_config(&config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Compact);
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_span_events(false)
            .with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }

    #[test]
    fn test_default_is_pretty_info() {
        let config = TracingConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, OutputFormat::Pretty);
        assert!(!config.with_span_events);
    }
}
