//! Immutable configuration snapshot.
//!
//! ```toml
//! [lockout]
//! max_failures = 5
//!
//! [[directory.pools]]
//! name = "general"
//! primary = true
//! endpoints = [{ url = "ldaps://ldap1.example.org:636", priority = 1 }]
//! bind = { bind_dn = "cn=directory manager", bind_credential = "secret" }
//!
//! [[scripts]]
//! name = "basic"
//! script_type = "person-authentication"
//! source = { engine = "native", code = "directory-bind" }
//! ```

use std::collections::HashSet;
use std::path::Path;

use jans_auth::LockoutPolicy;
use jans_cache::CacheSettings;
use jans_core::{LoggingConfig, MetricsConfig};
use jans_ldap::DirectoryConfig;
use jans_script::{RuntimeSettings, ScriptDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::{ReloadError, ReloadResult};

/// The complete engine configuration at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    /// Directory pools.
    pub directory: DirectoryConfig,
    /// Attempt protection.
    pub lockout: LockoutPolicy,
    /// Script descriptors.
    pub scripts: Vec<ScriptDescriptor>,
    /// Script runtime limits.
    pub runtime: RuntimeSettings,
    /// Local cache.
    pub cache: CacheSettings,
    /// Log output.
    pub logging: LoggingConfig,
    /// Metric reporting.
    pub metrics: MetricsConfig,
}

impl ConfigSnapshot {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> ReloadResult<Self> {
        let snapshot: Self = toml::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Reads, parses and validates a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> ReloadResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&text)
    }

    /// Validates every section.
    pub fn validate(&self) -> ReloadResult<()> {
        self.directory
            .validate()
            .map_err(|e| ReloadError::invalid("directory", e))?;
        self.lockout
            .validate()
            .map_err(|e| ReloadError::invalid("lockout", e))?;
        self.runtime
            .validate()
            .map_err(|e| ReloadError::invalid("runtime", e))?;
        self.cache
            .validate()
            .map_err(|e| ReloadError::invalid("cache", e))?;
        self.logging
            .validate()
            .map_err(|e| ReloadError::invalid("logging", e))?;
        self.metrics
            .validate()
            .map_err(|e| ReloadError::invalid("metrics", e))?;

        let mut keys = HashSet::new();
        for script in &self.scripts {
            script
                .validate()
                .map_err(|e| ReloadError::invalid("scripts", e))?;
            if !keys.insert(script.key()) {
                return Err(ReloadError::invalid(
                    "scripts",
                    format!("duplicate script '{}'", script.key()),
                ));
            }
        }
        Ok(())
    }

    /// Returns a script descriptor by key.
    #[must_use]
    pub fn script(&self, key: &jans_script::ScriptKey) -> Option<&ScriptDescriptor> {
        self.scripts.iter().find(|s| s.key() == *key)
    }
}
