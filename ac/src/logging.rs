//! Tracing subscriber setup

use std::fs::{self, OpenOptions};
use std::str::FromStr;

use eyre::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise the configured level applies. Output
/// goes to the configured log file (appended, no ANSI) or stderr. Calling this
/// again after a subscriber is installed is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let installed = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("Failed to open log file")?;
            tracing_subscriber::fmt()
                .with_writer(log_file)
                .with_ansi(false)
                .with_env_filter(filter)
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init()
            .is_ok(),
    };

    if installed {
        info!("Logging initialized (level: {})", config.level);
    }
    Ok(())
}

/// Filter from `RUST_LOG`, falling back to the configured level
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level = tracing::Level::from_str(&config.level)
        .map_err(|e| eyre::eyre!("Invalid log level '{}': {}", config.level, e))?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string())))
}
