use tracing_subscriber::EnvFilter;

use crate::config::LegerConfig;
use crate::error::{LegerError, Result};

/// Install the global tracing subscriber. Reads `LEGER_LOG` for filter
/// directives, falling back to the configured default level.
pub fn init(config: &LegerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env("LEGER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LegerError::Other(format!("telemetry initialization error: {err}")))
}
