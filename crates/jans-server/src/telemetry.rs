//! Log subscriber setup with a reloadable filter.

use std::fmt::Debug;

use jans_core::{LogFormat, LoggingConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{ServerError, ServerResult};

/// Changes the active log filter.
pub trait LogLevelControl: Send + Sync + Debug {
    /// Replaces the filter with `directives`.
    fn set_level(&self, directives: &str) -> ServerResult<()>;
}

/// Handle to the filter installed by [`init`].
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle").finish_non_exhaustive()
    }
}

impl LogLevelControl for LogHandle {
    fn set_level(&self, directives: &str) -> ServerResult<()> {
        let filter = parse_filter(directives)?;
        self.handle
            .reload(filter)
            .map_err(|e| ServerError::Telemetry(e.to_string()))?;
        tracing::info!(level = directives, "log filter changed");
        Ok(())
    }
}

/// Parses `EnvFilter` directives.
pub fn parse_filter(directives: &str) -> ServerResult<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| ServerError::Telemetry(format!("invalid log filter '{directives}': {e}")))
}

/// Installs the global subscriber.
///
/// `RUST_LOG`, when set, wins over the configured level at startup. Later
/// reloads always apply the configured level. The format is fixed for the
/// life of the process.
pub fn init(config: &LoggingConfig, format: Option<LogFormat>) -> ServerResult<LogHandle> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => parse_filter(&directives)?,
        _ => parse_filter(&config.level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    let (json, text) = match format.unwrap_or(config.format) {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Text => (None, Some(fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| ServerError::Telemetry(e.to_string()))?;

    Ok(LogHandle { handle })
}
