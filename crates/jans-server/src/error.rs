//! Engine error types.

use jans_auth::AuthError;
use jans_cache::CacheError;
use jans_core::ErrorKind;
use jans_ldap::LdapError;
use jans_reload::ReloadError;
use jans_script::ScriptError;
use thiserror::Error;

/// Errors raised while assembling or running the engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded or applied.
    #[error(transparent)]
    Reload(#[from] ReloadError),

    /// Directory pools could not be built.
    #[error(transparent)]
    Ldap(#[from] LdapError),

    /// Script runtime error.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Attempt ledger error.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Cache error.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The log subscriber could not be installed or changed.
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl ServerError {
    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Reload(e) => e.kind(),
            Self::Ldap(e) => e.kind(),
            Self::Script(e) => e.kind(),
            Self::Auth(e) => e.kind(),
            Self::Cache(e) => e.kind(),
            Self::Telemetry(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for engine operations.
pub type ServerResult<T> = Result<T, ServerError>;
