//! Tracing subscriber setup.

use crate::config::{LogConfig, LogFormat};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Failure to set up logging.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// `LOG_LEVEL` is not a valid filter directive.
    #[error("Invalid log filter: {0}")]
    Filter(#[from] ParseError),

    /// A global subscriber is already installed.
    #[error("Failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Spans are included in
/// every line, so `correlation_id` and `message_id` fields of the router's
/// spans show up on handler and client logs too.
///
/// # Errors
///
/// Returns [`TelemetryError`] if the filter directive is invalid or a global
/// subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let (json, pretty) = match config.format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()?;
    Ok(())
}
