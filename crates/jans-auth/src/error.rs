//! Authentication error types.

use std::fmt;

use jans_core::ErrorKind;

/// Attempt protection errors.
#[derive(Debug)]
pub enum AuthError {
    /// Principal is locked (temporary).
    LockedAccount {
        /// Locked principal.
        principal: String,
        /// When the lockout expires.
        until: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Lockout policy failed validation.
    InvalidPolicy(String),
    /// Internal error.
    Internal(String),
}

impl AuthError {
    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::LockedAccount { .. } => ErrorKind::LockedAccount,
            Self::InvalidPolicy(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockedAccount { principal, until } => {
                if let Some(time) = until {
                    write!(f, "account '{principal}' is locked until {time}")
                } else {
                    write!(f, "account '{principal}' is locked")
                }
            }
            Self::InvalidPolicy(msg) => write!(f, "invalid lockout policy: {msg}"),
            Self::Internal(msg) => write!(f, "internal authentication error: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;
