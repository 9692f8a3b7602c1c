//! Error handling for the authentication engine.
//!
//! Each component crate owns its own error enum. [`ErrorKind`] is the shared
//! taxonomy those errors map onto, so callers can branch on the category of a
//! failure without depending on every component crate.
//!
//! Error messages must not expose credentials or directory internals.

use std::fmt;

use thiserror::Error;

/// Result type alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Category of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No connection became free within the acquire timeout.
    PoolExhausted,
    /// Every candidate backend endpoint failed or is degraded.
    BackendUnavailable,
    /// A script module failed to compile or initialize.
    ScriptLoadFailure,
    /// A script module failed while handling an invocation.
    ScriptInvocationFailure,
    /// The principal is temporarily locked out.
    LockedAccount,
    /// A component rejected a new configuration snapshot.
    ReloadApplyFailure,
    /// Invalid configuration.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns the stable name used in logs and metric tags.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::BackendUnavailable => "backend_unavailable",
            Self::ScriptLoadFailure => "script_load_failure",
            Self::ScriptInvocationFailure => "script_invocation_failure",
            Self::LockedAccount => "locked_account",
            Self::ReloadApplyFailure => "reload_apply_failure",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Returns whether a caller may retry the operation later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::BackendUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),

    /// I/O error while reading configuration or other local resources.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Validation(_) => ErrorKind::Configuration,
            Self::Io(_) | Self::Internal => ErrorKind::Internal,
        }
    }
}
