//! Operational tracing on stderr.
//!
//! This is separate from the forensic record: it carries the launcher's own
//! debug output and is filtered by `logging.level` or `RUST_LOG`.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::config::{AppConfig, LogFormat};

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(#[source] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber on first call; later calls are no-ops.
pub fn initialise(config: &AppConfig, verbose: bool) -> Result<(), TelemetryError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }
    install_subscriber(config, verbose)?;
    let _ = TELEMETRY_GUARD.set(());
    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level.
pub fn filter_directive(config: &AppConfig, verbose: bool) -> String {
    if let Ok(directive) = std::env::var(EnvFilter::DEFAULT_ENV)
        && !directive.trim().is_empty()
    {
        return directive;
    }
    if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    }
}

fn install_subscriber(config: &AppConfig, verbose: bool) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(filter_directive(config, verbose))
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal() && config.logging.color);

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.logging.format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
