//! Script descriptors, lifecycle states and dispatch results.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ScriptError, ScriptResult};

/// Extension point a script plugs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    /// Interactive user authentication.
    PersonAuthentication,
    /// Generic request interception.
    Interception,
    /// Identifier generation.
    IdGenerator,
    /// Consent screens.
    ConsentGathering,
    /// Token claim adjustments.
    UpdateToken,
    /// Token introspection responses.
    Introspection,
    /// Dynamic client registration.
    ClientRegistration,
    /// Dynamic scope claims.
    DynamicScope,
    /// Resource owner password credentials grant.
    ResourceOwnerPasswordCredentials,
    /// Logout handling.
    EndSession,
    /// Persistence hooks.
    PersistenceExtension,
}

impl ScriptType {
    /// Every script type.
    pub const ALL: [Self; 11] = [
        Self::PersonAuthentication,
        Self::Interception,
        Self::IdGenerator,
        Self::ConsentGathering,
        Self::UpdateToken,
        Self::Introspection,
        Self::ClientRegistration,
        Self::DynamicScope,
        Self::ResourceOwnerPasswordCredentials,
        Self::EndSession,
        Self::PersistenceExtension,
    ];

    /// Returns the kebab-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PersonAuthentication => "person-authentication",
            Self::Interception => "interception",
            Self::IdGenerator => "id-generator",
            Self::ConsentGathering => "consent-gathering",
            Self::UpdateToken => "update-token",
            Self::Introspection => "introspection",
            Self::ClientRegistration => "client-registration",
            Self::DynamicScope => "dynamic-scope",
            Self::ResourceOwnerPasswordCredentials => "resource-owner-password-credentials",
            Self::EndSession => "end-session",
            Self::PersistenceExtension => "persistence-extension",
        }
    }

    /// Failures of modules of this type deny the request instead of being
    /// skipped.
    #[must_use]
    pub const fn is_authentication_critical(&self) -> bool {
        matches!(
            self,
            Self::PersonAuthentication | Self::ResourceOwnerPasswordCredentials | Self::Introspection
        )
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScriptType {
    type Err = ScriptError;

    fn from_str(s: &str) -> ScriptResult<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ScriptError::config(format!("unknown script type '{s}'")))
    }
}

/// Identity of a script: its type and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptKey {
    /// Extension point.
    pub script_type: ScriptType,
    /// Script name, unique within its type.
    pub name: String,
}

impl ScriptKey {
    /// Creates a key.
    #[must_use]
    pub fn new(script_type: ScriptType, name: impl Into<String>) -> Self {
        Self {
            script_type,
            name: name.into(),
        }
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.script_type, self.name)
    }
}

/// Where the module comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSource {
    /// Engine that builds the module (`rhai` or `native`).
    pub engine: String,
    /// Script text, or the registered name of a native module.
    pub code: String,
}

impl ScriptSource {
    /// A Rhai script.
    #[must_use]
    pub fn rhai(code: impl Into<String>) -> Self {
        Self {
            engine: crate::rhai_module::ENGINE.to_string(),
            code: code.into(),
        }
    }

    /// A registered native module.
    #[must_use]
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            engine: crate::native::ENGINE.to_string(),
            code: name.into(),
        }
    }
}

/// Configuration of one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    /// Script name.
    pub name: String,
    /// Extension point.
    pub script_type: ScriptType,
    /// Execution level. Lower levels run first.
    #[serde(default)]
    pub level: i32,
    /// Configuration properties handed to the initialization hook.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Disabled scripts are never dispatched to.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Module source.
    pub source: ScriptSource,
}

const fn default_enabled() -> bool {
    true
}

impl ScriptDescriptor {
    /// Creates an enabled descriptor at level 0.
    #[must_use]
    pub fn new(name: impl Into<String>, script_type: ScriptType, source: ScriptSource) -> Self {
        Self {
            name: name.into(),
            script_type,
            level: 0,
            properties: BTreeMap::new(),
            enabled: true,
            source,
        }
    }

    /// Sets the execution level.
    #[must_use]
    pub const fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Adds a configuration property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Enables or disables the script.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns the key of this script.
    #[must_use]
    pub fn key(&self) -> ScriptKey {
        ScriptKey::new(self.script_type, self.name.clone())
    }

    /// Validates the descriptor.
    pub fn validate(&self) -> ScriptResult<()> {
        if self.name.trim().is_empty() {
            return Err(ScriptError::config("script name cannot be empty"));
        }
        if self.source.engine.trim().is_empty() {
            return Err(ScriptError::config(format!(
                "script '{}' has no engine",
                self.name
            )));
        }
        if self.source.code.trim().is_empty() {
            return Err(ScriptError::config(format!(
                "script '{}' has no source",
                self.name
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    /// Not loaded.
    Unloaded,
    /// First revision is being built.
    Loading,
    /// A revision is serving invocations.
    Active,
    /// A new revision is being built while the previous one serves.
    Reloading,
    /// The latest load failed. A previous revision may still serve.
    Failed,
    /// Disabled by configuration.
    Disabled,
}

/// Observable status of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStatus {
    /// Script name.
    pub name: String,
    /// Extension point.
    pub script_type: ScriptType,
    /// Lifecycle state.
    pub state: ScriptState,
    /// Revision currently serving invocations.
    pub active_revision: Option<u64>,
    /// Revision of the latest load attempt.
    pub latest_revision: u64,
    /// Error of the latest failed load.
    pub last_error: Option<String>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Result of a stopping module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopResult {
    /// Whether the request is allowed.
    pub allow: bool,
    /// Reason reported to the caller.
    pub reason: Option<String>,
}

impl StopResult {
    /// An allowing stop.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    /// A denying stop.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }
}

/// Signal a module returns from an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSignal {
    /// No opinion. The next module runs.
    Continue,
    /// Approves. The next module still runs.
    Success,
    /// Ends the chain with a final result.
    Stop(StopResult),
}

/// Aggregated outcome of a dispatch chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The chain approved the request.
    Allow,
    /// A module denied the request, or failed on an authentication-critical
    /// hook.
    Deny {
        /// Denying script.
        script: String,
        /// Reason.
        reason: String,
    },
    /// A module could not reach a backend it depends on.
    Unavailable {
        /// Affected script.
        script: String,
        /// Reason.
        reason: String,
    },
    /// No module approved or denied.
    NoDecision,
}

impl Decision {
    /// Returns whether the request is allowed.
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What happened when one module ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOutcome {
    /// The module returned a signal.
    Signal(ScriptSignal),
    /// The module failed. The failure was contained.
    Failed(String),
}

/// One step of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Script name.
    pub script: String,
    /// Revision that ran.
    pub revision: u64,
    /// Outcome.
    pub outcome: TraceOutcome,
    /// Time spent in the module.
    pub elapsed: Duration,
}

/// Result of [`crate::ScriptRuntime::invoke`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Aggregated decision.
    pub decision: Decision,
    /// Modules that ran, in order.
    pub trace: Vec<TraceEntry>,
}

impl Invocation {
    /// Revisions that served this invocation, by script name.
    #[must_use]
    pub fn revisions(&self) -> Vec<(&str, u64)> {
        self.trace
            .iter()
            .map(|entry| (entry.script.as_str(), entry.revision))
            .collect()
    }
}
