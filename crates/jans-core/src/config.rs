//! Ambient configuration sections shared by every component.
//!
//! The component-specific sections (directory, lockout, scripts, cache) live
//! next to the components; the full snapshot is assembled in `jans-reload`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
///
/// `level` is an `EnvFilter` directive string such as `info` or
/// `info,jans_ldap=debug`. It may change on reload; the format may not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directives.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Validates the section.
    pub fn validate(&self) -> Result<()> {
        if self.level.trim().is_empty() {
            return Err(Error::config("logging.level cannot be empty"));
        }
        Ok(())
    }
}

/// Metric reporting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the periodic reporter writes aggregated metrics to the log.
    pub report_enabled: bool,
    /// Reporter period in seconds.
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_enabled: false,
            report_interval_secs: 60,
        }
    }
}

impl MetricsConfig {
    /// Returns the reporter period.
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Validates the section.
    pub fn validate(&self) -> Result<()> {
        if self.report_enabled && self.report_interval_secs == 0 {
            return Err(Error::config("metrics.report_interval_secs must be positive"));
        }
        Ok(())
    }
}
