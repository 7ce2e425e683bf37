//! Tracing setup and log throttling.
//!
//! [`init`] installs a `tracing-subscriber` registry with an [`EnvFilter`]
//! (`RUST_LOG` wins over the configured level) and one of three output
//! formats. It is idempotent, so tests and embedding applications may call
//! it freely.
//!
//! [`LogThrottle`] keeps per-condition counters for recoverable drops and
//! says when a log line is due: on the first occurrence and then every
//! `log_every`-th, so a persistently bad link cannot flood the log.
//!
//! # Example
//! ```no_run
//! use daq_core::config::AcquisitionConfig;
//! use daq_core::observability;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcquisitionConfig::load_from("acquire.toml")?;
//! observability::init_from_config(&config)?;
//! tracing::info!(sensors = config.sensors.len(), "Configuration loaded");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::{AcquisitionConfig, LogFormat};
use crate::error::{AppResult, DaqError};

/// Default interval for [`LogThrottle`].
pub const DEFAULT_LOG_EVERY: u64 = 100;

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    /// Source locations on each record.
    pub with_file_and_line: bool,
    /// Reader threads are named after their sensor, so this is on by default.
    pub with_thread_names: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Defaults at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the `[application]` section.
    pub fn from_config(config: &AcquisitionConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Emit span open and close events.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Colored output (Pretty only).
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the `[application]` section.
pub fn init_from_config(config: &AcquisitionConfig) -> AppResult<()> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
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

    let layer = match config.format {
        LogFormat::Pretty => base
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => base
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Already initialized: expected in tests and when embedded.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

/// Occurrence counter that rate-limits its log line.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    count: u64,
    log_every: u64,
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_EVERY)
    }
}

impl LogThrottle {
    /// Log every `log_every`-th occurrence; 0 counts as 1.
    #[must_use]
    pub fn new(log_every: u64) -> Self {
        Self {
            count: 0,
            log_every: log_every.max(1),
        }
    }

    /// Count one occurrence; `true` when this one should be logged.
    pub fn hit(&mut self) -> bool {
        self.count += 1;
        (self.count - 1) % self.log_every == 0
    }

    /// Occurrences so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}
