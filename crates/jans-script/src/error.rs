//! Script runtime error types.

use jans_core::ErrorKind;
use jans_ldap::LdapError;
use thiserror::Error;

/// Script runtime errors.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// No factory is registered for the descriptor's engine.
    #[error("no script engine registered for '{0}'")]
    UnknownEngine(String),

    /// A native module name is not registered.
    #[error("unknown native module '{0}'")]
    UnknownModule(String),

    /// The source failed to compile.
    #[error("script compilation failed: {0}")]
    Compile(String),

    /// The initialization hook failed or rejected its properties.
    #[error("script initialization failed: {0}")]
    Initialization(String),

    /// The initialization hook did not finish in time.
    #[error("script initialization timed out")]
    InitTimeout,

    /// The module reports an API version the runtime does not speak.
    #[error("unsupported script API version {0}")]
    UnsupportedApiVersion(u32),

    /// The module raised an error while handling an invocation.
    #[error("script invocation failed: {0}")]
    Invocation(String),

    /// The invocation did not finish in time.
    #[error("script invocation timed out")]
    InvocationTimeout,

    /// A backend the module depends on is unavailable.
    #[error("backend unavailable: {0}")]
    Backend(String),

    /// No script with this key is loaded.
    #[error("unknown script '{0}'")]
    UnknownScript(String),

    /// Invalid descriptor or runtime settings.
    #[error("script configuration error: {0}")]
    Configuration(String),
}

impl ScriptError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates an invocation error.
    #[must_use]
    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    /// Returns whether the failure comes from an unavailable backend and may
    /// succeed on a later attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Returns whether this error was raised while loading a module.
    #[must_use]
    pub const fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::UnknownEngine(_)
                | Self::UnknownModule(_)
                | Self::Compile(_)
                | Self::Initialization(_)
                | Self::InitTimeout
                | Self::UnsupportedApiVersion(_)
        )
    }

    /// Returns the taxonomy category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownEngine(_)
            | Self::UnknownModule(_)
            | Self::Compile(_)
            | Self::Initialization(_)
            | Self::InitTimeout
            | Self::UnsupportedApiVersion(_) => ErrorKind::ScriptLoadFailure,
            Self::Invocation(_) | Self::InvocationTimeout => ErrorKind::ScriptInvocationFailure,
            Self::Backend(_) => ErrorKind::BackendUnavailable,
            Self::UnknownScript(_) | Self::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

impl From<LdapError> for ScriptError {
    fn from(err: LdapError) -> Self {
        if err.is_transient() || err.kind().is_retryable() {
            Self::Backend(err.to_string())
        } else {
            Self::Invocation(err.to_string())
        }
    }
}

impl From<Box<rhai::EvalAltResult>> for ScriptError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        Self::Invocation(err.to_string())
    }
}

/// Result type for script operations.
pub type ScriptResult<T> = Result<T, ScriptError>;
