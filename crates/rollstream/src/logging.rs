//! Process-wide log setup.

use tracing_subscriber::EnvFilter;

use crate::{LogConfig, RollstreamError};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// [`LogConfig::default_filter`].
///
/// # Errors
/// [`RollstreamError::Logging`] if the filter does not parse or a global
/// subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<(), RollstreamError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_filter)
            .map_err(|e| RollstreamError::Logging(e.to_string()))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .try_init()
        .map_err(|e| RollstreamError::Logging(e.to_string()))
}
