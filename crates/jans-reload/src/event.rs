//! Reload kinds and events.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::snapshot::ConfigSnapshot;

/// Category of configuration change. Each kind has its own ordered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadKind {
    /// Directory pools.
    LdapConfig,
    /// Lockout policy, runtime limits and metrics reporting.
    AppConfig,
    /// Log filter.
    Logger,
    /// Script descriptors.
    Script,
    /// Cache settings.
    Cache,
}

impl ReloadKind {
    /// Every kind.
    pub const ALL: [Self; 5] = [
        Self::LdapConfig,
        Self::AppConfig,
        Self::Logger,
        Self::Script,
        Self::Cache,
    ];

    /// Returns the stable name used in logs and metric tags.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LdapConfig => "ldap_config",
            Self::AppConfig => "app_config",
            Self::Logger => "logger",
            Self::Script => "script",
            Self::Cache => "cache",
        }
    }
}

impl fmt::Display for ReloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published configuration change.
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// What changed.
    pub kind: ReloadKind,
    /// Global publication order. Strictly increasing within a kind.
    pub sequence: u64,
    /// The complete snapshot the change belongs to.
    pub snapshot: Arc<ConfigSnapshot>,
}
