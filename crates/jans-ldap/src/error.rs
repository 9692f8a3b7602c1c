//! Directory error types.
//!
//! ## Security Note
//!
//! Error messages must not leak sensitive information like
//! passwords, bind credentials, or internal directory structure.

use jans_core::ErrorKind;
use thiserror::Error;

/// Directory errors.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Invalid configuration.
    #[error("LDAP configuration error: {0}")]
    Configuration(String),

    /// Connection URL must use LDAPS.
    #[error("Security error: Only LDAPS is supported. URL must start with 'ldaps://'. STARTTLS and plain LDAP are not allowed.")]
    InsecureProtocol,

    /// Connection failed or was lost.
    #[error("LDAP connection failed: {0}")]
    Connection(String),

    /// TLS/SSL error.
    #[error("LDAP TLS error: {0}")]
    Tls(String),

    /// Service bind was rejected.
    #[error("LDAP bind failed: {0}")]
    Bind(String),

    /// The server answered with result code 49.
    #[error("LDAP invalid credentials")]
    InvalidCredentials,

    /// Search operation failed.
    #[error("LDAP search failed: {0}")]
    Search(String),

    /// Timeout error.
    #[error("LDAP operation timed out")]
    Timeout,

    /// No lease became free within the acquire timeout.
    #[error("connection pool '{0}' exhausted")]
    PoolExhausted(String),

    /// Every candidate endpoint failed or is cooling down.
    #[error("directory backend unavailable for pool '{pool}': {reason}")]
    BackendUnavailable {
        /// Pool name.
        pool: String,
        /// Last failure observed.
        reason: String,
    },

    /// The pool has been shut down.
    #[error("connection pool '{0}' is closed")]
    PoolClosed(String),

    /// No pool with this name or role is configured.
    #[error("unknown connection pool '{0}'")]
    UnknownPool(String),

    /// Protocol error from the server.
    #[error("LDAP protocol error: {0}")]
    Protocol(String),

    /// Internal error.
    #[error("Internal LDAP error: {0}")]
    Internal(String),
}

impl LdapError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a TLS error.
    #[must_use]
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Creates a backend unavailable error.
    #[must_use]
    pub fn unavailable(pool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    /// Network-level failure worth one retry on another endpoint.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }

    /// Checks if this is a connection-related error.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Tls(_)
                | Self::Timeout
                | Self::PoolExhausted(_)
                | Self::BackendUnavailable { .. }
        )
    }

    /// Checks if this is a security-related error.
    #[must_use]
    pub const fn is_security_error(&self) -> bool {
        matches!(
            self,
            Self::InsecureProtocol | Self::Tls(_) | Self::Bind(_) | Self::InvalidCredentials
        )
    }

    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted(_) => ErrorKind::PoolExhausted,
            Self::Configuration(_) | Self::InsecureProtocol | Self::UnknownPool(_) => {
                ErrorKind::Configuration
            }
            Self::Internal(_) => ErrorKind::Internal,
            Self::Connection(_)
            | Self::Tls(_)
            | Self::Bind(_)
            | Self::InvalidCredentials
            | Self::Search(_)
            | Self::Timeout
            | Self::BackendUnavailable { .. }
            | Self::PoolClosed(_)
            | Self::Protocol(_) => ErrorKind::BackendUnavailable,
        }
    }
}

impl From<ldap3::LdapError> for LdapError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } if result.rc == 49 => Self::InvalidCredentials,
            ldap3::LdapError::LdapResult { result } => {
                Self::Protocol(format!("result code {}: {}", result.rc, result.text))
            }
            ldap3::LdapError::Timeout { .. } => Self::Timeout,
            ldap3::LdapError::Io { .. }
            | ldap3::LdapError::EndOfStream
            | ldap3::LdapError::OpSend { .. }
            | ldap3::LdapError::ResultRecv { .. } => Self::Connection(err.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Result type for directory operations.
pub type LdapResult<T> = Result<T, LdapError>;
