//! Command-line and environment configuration.
//!
//! Everything tunable at runtime lives in the TOML snapshot; the command line
//! only says where to find it and how to start.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use jans_core::LogFormat;

/// Log format override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable text.
    Text,
    /// One JSON object per line.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// Janssen authentication engine.
#[derive(Debug, Clone, Parser)]
#[command(name = "jans-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// Configuration file.
    #[arg(short, long, env = "JANS_CONFIG", default_value = "jans.toml")]
    pub config: PathBuf,

    /// Log format (overrides config).
    #[arg(long, value_enum, env = "JANS_LOG_FORMAT")]
    pub log_format: Option<LogFormatArg>,

    /// Seconds between configuration file checks. Zero disables polling.
    #[arg(long, env = "JANS_WATCH_INTERVAL", default_value_t = 5)]
    pub watch_interval: u64,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub check: bool,
}

impl ServerArgs {
    /// Parses arguments after loading `.env` if present.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::parse()
    }

    /// Polling period of the configuration watcher.
    #[must_use]
    pub fn watch_interval(&self) -> Option<Duration> {
        (self.watch_interval > 0).then(|| Duration::from_secs(self.watch_interval))
    }
}
