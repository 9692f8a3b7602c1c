//! Cache error types.

use thiserror::Error;

/// Cache operation errors.
///
/// Lookups never fail; only typed writes and configuration can.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Serialization/deserialization error.
    #[error("cache serialization error: {0}")]
    Serialization(String),
    /// Invalid cache configuration.
    #[error("cache configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> jans_core::ErrorKind {
        match self {
            Self::Serialization(_) => jans_core::ErrorKind::Internal,
            Self::Configuration(_) => jans_core::ErrorKind::Configuration,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
