//! Tracing setup for applications built on labctl.
//!
//! The library only emits `tracing` events; it never installs a subscriber.
//! Applications call [`init`] (or [`init_from_config`]) once at startup.
//! `RUST_LOG` takes precedence over the configured level.
//!
//! ```no_run
//! use labctl::{config::LabConfig, logging};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = LabConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("bench ready");
//! # Ok(())
//! # }
//! ```

use crate::config::LabConfig;
use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored; for development.
    #[default]
    Pretty,
    /// Single-line.
    Compact,
    /// One JSON object per event, for log aggregation.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// ANSI colors (Pretty only).
    pub with_ansi: bool,
    /// Source file and line of each event.
    pub with_file_and_line: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_ansi: true,
            with_file_and_line: false,
        }
    }
}

impl TracingConfig {
    /// Config at `level` with defaults otherwise.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level from `[application] log_level`.
    pub fn from_lab_config(config: &LabConfig) -> Result<Self> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Set output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Include source locations.
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }
}

/// Install the global subscriber described by the lab configuration.
pub fn init_from_config(config: &LabConfig) -> Result<()> {
    init(&TracingConfig::from_lab_config(config)?)
}

/// Install the global subscriber.
///
/// Calling it again after a subscriber is installed is not an error, so
/// tests and embedding applications may both call it.
pub fn init(config: &TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.with_ansi)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(anyhow!("failed to initialize tracing: {e}")),
    }
}

/// Parse a configured level name (case-insensitive).
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow!(
            "invalid log level '{level}', expected one of: trace, debug, info, warn, error"
        )),
    }
}
