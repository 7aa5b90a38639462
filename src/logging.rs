//! Tracing initialization.

use crate::error::{EngineError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber with the given filter
/// directive (e.g. `"flowkv=debug,info"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| EngineError::InvalidArgument(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| EngineError::InvalidArgument("logging already initialized".into()))
}
