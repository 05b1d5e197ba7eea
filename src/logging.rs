//! Tracing setup shared by both binaries

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Result, SyncError};

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(level: &str) -> String {
    format!(
        "dirsync={level},sync_server={level},sync_client={level}",
        level = level
    )
}

/// Install the global subscriber (logs to stderr).
///
/// `RUST_LOG` wins over the configured level. Calling this twice is
/// harmless; the second call keeps the first subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter(&config.level)).map_err(|e| {
            SyncError::config(format!("invalid log level {:?}: {}", config.level, e))
        })?,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}
