//! Structured logging initialisation.

use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;

use crate::core::config::Config;
use crate::core::error::GuardError;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured `LOG_LEVEL` expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// `LOG_FILE` could not be opened for appending.
    #[error("cannot open log file: {0}")]
    LogFile(io::Error),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

impl From<TelemetryError> for GuardError {
    fn from(err: TelemetryError) -> Self {
        GuardError::Config(err.to_string())
    }
}

/// Installs the global subscriber on first use. Later calls are no-ops.
pub fn initialise(config: &Config) -> Result<(), TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| ())
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let subscriber: Box<dyn Subscriber + Send + Sync> = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(TelemetryError::LogFile)?;
            Box::new(
                fmt::Subscriber::builder()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(Mutex::new(file))
                    .finish(),
            )
        }
        None => Box::new(
            fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                // Colour only on interactive terminals; hooks and watchers pipe stderr.
                .with_ansi(io::stderr().is_terminal())
                .with_timer(UtcTime::rfc_3339())
                .with_writer(io::stderr)
                .compact()
                .finish(),
        ),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
