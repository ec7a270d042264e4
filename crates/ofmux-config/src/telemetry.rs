//! Structured telemetry initialisation for controller processes.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Subscriber;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::defaults::DEFAULT_LOG_FILTER;
use crate::logging::{debug_enabled, LogFormat};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Options controlling subscriber installation.
#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Output format for log lines.
    pub format: LogFormat,
    /// Filter expression; defaults to `info`, or `debug` under `ZOFDEBUG`.
    pub filter: Option<String>,
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Configures the global tracing subscriber when invoked for the first time.
///
/// Repeated calls are idempotent: the first invocation installs the global
/// subscriber, later invocations return without touching global state. The
/// default filter honours `ZOFDEBUG` by elevating to `debug`.
pub fn init(options: &TelemetryOptions) -> Result<(), TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(options))
        .map(|_| ())
}

fn default_filter() -> &'static str {
    if debug_enabled() {
        "debug"
    } else {
        DEFAULT_LOG_FILTER
    }
}

fn install_subscriber(options: &TelemetryOptions) -> Result<(), TelemetryError> {
    let expression = options
        .filter
        .clone()
        .unwrap_or_else(|| default_filter().to_string());
    let filter =
        EnvFilter::try_new(&expression).map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());

    let subscriber: Box<dyn Subscriber + Send + Sync> = match options.format {
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder.compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
