//! Log output for the station.
//!
//! A single `tracing-subscriber` fmt layer writes every event. `RUST_LOG`
//! takes precedence when set; otherwise the station's
//! `application.log_level` is the default directive. The session task runs
//! inside a `session` span carrying the session id, so each line can be
//! attributed to the session that produced it.
//!
//! # Example
//! ```no_run
//! use station_ctl::config::StationConfig;
//! use station_ctl::logging::{self, LogSettings, OutputFormat};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = StationConfig::load()?;
//! logging::init(&LogSettings::for_station(&config, OutputFormat::Json)?)?;
//! tracing::info!(station = %config.application.name, "Station started");
//! # Ok(())
//! # }
//! ```

use crate::config::StationConfig;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Log line layout, chosen on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Multi-line and colored, for an operator at the console
    Pretty,
    /// One plain line per event
    #[default]
    Compact,
    /// Newline-delimited JSON for log collection
    Json,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level '{0}' (expected trace, debug, info, warn or error)")]
    InvalidLevel(String),

    #[error("failed to install the log subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// What the station logs, and in which layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: OutputFormat,
    /// Source file and line on every event
    pub source_location: bool,
}

impl LogSettings {
    /// The station's configured level in the given layout.
    ///
    /// Compact output omits source locations to keep one event per short line.
    pub fn for_station(config: &StationConfig, format: OutputFormat) -> Result<Self, LoggingError> {
        let raw = &config.application.log_level;
        let level = raw
            .parse::<Level>()
            .map_err(|_| LoggingError::InvalidLevel(raw.clone()))?;
        Ok(Self {
            level,
            format,
            source_location: format != OutputFormat::Compact,
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::from_level(self.level).to_string()))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let located = self.source_location;
        match self.format {
            OutputFormat::Pretty => fmt::layer()
                .pretty()
                .with_file(located)
                .with_line_number(located)
                .boxed(),
            OutputFormat::Compact => fmt::layer()
                .compact()
                .with_ansi(false)
                .with_file(located)
                .with_line_number(located)
                .boxed(),
            OutputFormat::Json => fmt::layer()
                .json()
                .with_file(located)
                .with_line_number(located)
                .boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber is already installed, as under a
/// test harness or an embedding application.
pub fn init(settings: &LogSettings) -> Result<bool, LoggingError> {
    if tracing::dispatcher::has_been_set() {
        return Ok(false);
    }
    match tracing_subscriber::registry()
        .with(settings.layer().with_filter(settings.filter()))
        .try_init()
    {
        Ok(()) => Ok(true),
        // Lost a race with another installer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(false),
        Err(err) => Err(err.into()),
    }
}
