//! Reload error types.

use std::fmt::Display;

use jans_core::ErrorKind;
use thiserror::Error;

/// Reload errors.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The snapshot failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configuration file is not valid TOML for a snapshot.
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listener rejected an event.
    #[error("listener '{listener}' failed to apply reload: {reason}")]
    Apply {
        /// Listener name.
        listener: String,
        /// Failure reported by the listener.
        reason: String,
    },

    /// The coordinator has been shut down.
    #[error("reload coordinator is shut down")]
    Closed,

    /// The coordinator was created outside an async runtime.
    #[error("reload coordinator requires a Tokio runtime")]
    NoRuntime,
}

impl ReloadError {
    /// Creates a validation error for a snapshot section.
    #[must_use]
    pub fn invalid(section: &str, err: impl Display) -> Self {
        Self::Invalid(format!("{section}: {err}"))
    }

    /// Creates a listener failure.
    #[must_use]
    pub fn apply(listener: impl Into<String>, reason: impl Display) -> Self {
        Self::Apply {
            listener: listener.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) | Self::Parse(_) => ErrorKind::Configuration,
            Self::Apply { .. } => ErrorKind::ReloadApplyFailure,
            Self::Io(_) | Self::Closed | Self::NoRuntime => ErrorKind::Internal,
        }
    }
}

/// Result type for reload operations.
pub type ReloadResult<T> = Result<T, ReloadError>;
