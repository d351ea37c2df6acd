use tracing_subscriber::EnvFilter;

use crate::error::HavenError;

/// Install the global tracing subscriber using the configured level as
/// the default filter. `RUST_LOG` takes precedence when set.
pub fn init_logging(level: &str) -> Result<(), HavenError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| HavenError::Internal(format!("invalid log filter '{level}': {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| HavenError::Internal(format!("failed to install tracing subscriber: {e}")))
}
