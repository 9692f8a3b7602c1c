//! Reload listeners that apply snapshot sections to live components.

use std::sync::Arc;

use async_trait::async_trait;
use jans_auth::AttemptLedger;
use jans_cache::LocalCacheProvider;
use jans_ldap::DirectoryPools;
use jans_reload::{ReloadError, ReloadEvent, ReloadListener, ReloadResult};
use jans_script::ScriptRuntime;

use crate::telemetry::LogLevelControl;

/// Applies `[directory]` to the pools.
#[derive(Debug)]
pub struct DirectoryReloadListener {
    pools: Arc<DirectoryPools>,
}

impl DirectoryReloadListener {
    /// Creates the listener.
    #[must_use]
    pub const fn new(pools: Arc<DirectoryPools>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl ReloadListener for DirectoryReloadListener {
    fn name(&self) -> &str {
        "directory"
    }

    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
        self.pools
            .reconfigure(&event.snapshot.directory)
            .await
            .map_err(|e| ReloadError::apply(self.name(), e))?;
        let opened = self.pools.warm_up().await;
        tracing::debug!(opened, "directory pools warmed after reload");
        Ok(())
    }
}

/// Applies `[lockout]` and `[runtime]`.
///
/// Both sections are validated before either is installed.
#[derive(Debug)]
pub struct AppConfigReloadListener {
    ledger: Arc<AttemptLedger>,
    runtime: ScriptRuntime,
}

impl AppConfigReloadListener {
    /// Creates the listener.
    #[must_use]
    pub const fn new(ledger: Arc<AttemptLedger>, runtime: ScriptRuntime) -> Self {
        Self { ledger, runtime }
    }
}

#[async_trait]
impl ReloadListener for AppConfigReloadListener {
    fn name(&self) -> &str {
        "app-config"
    }

    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
        let snapshot = &event.snapshot;
        snapshot
            .lockout
            .validate()
            .map_err(|e| ReloadError::apply(self.name(), e))?;
        snapshot
            .runtime
            .validate()
            .map_err(|e| ReloadError::apply(self.name(), e))?;

        self.ledger
            .update_policy(snapshot.lockout.clone())
            .map_err(|e| ReloadError::apply(self.name(), e))?;
        self.runtime
            .update_settings(snapshot.runtime.clone())
            .map_err(|e| ReloadError::apply(self.name(), e))?;
        Ok(())
    }
}

/// Applies `[[scripts]]` to the runtime.
#[derive(Debug)]
pub struct ScriptReloadListener {
    runtime: ScriptRuntime,
}

impl ScriptReloadListener {
    /// Creates the listener.
    #[must_use]
    pub const fn new(runtime: ScriptRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ReloadListener for ScriptReloadListener {
    fn name(&self) -> &str {
        "scripts"
    }

    /// Scripts that fail keep their previous revision; the others are applied
    /// regardless.
    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
        let failures = self.runtime.apply_descriptors(&event.snapshot.scripts).await;
        if failures.is_empty() {
            return Ok(());
        }
        let summary = failures
            .iter()
            .map(|(key, err)| format!("{key}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ReloadError::apply(self.name(), summary))
    }
}

/// Applies `[cache]` to the local cache.
#[derive(Debug)]
pub struct CacheReloadListener {
    cache: Arc<LocalCacheProvider>,
}

impl CacheReloadListener {
    /// Creates the listener.
    #[must_use]
    pub const fn new(cache: Arc<LocalCacheProvider>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ReloadListener for CacheReloadListener {
    fn name(&self) -> &str {
        "cache"
    }

    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
        self.cache
            .reconfigure(event.snapshot.cache.clone())
            .map_err(|e| ReloadError::apply(self.name(), e))
    }
}

/// Applies `[logging].level` to the log filter.
#[derive(Debug)]
pub struct LoggerReloadListener {
    control: Arc<dyn LogLevelControl>,
}

impl LoggerReloadListener {
    /// Creates the listener.
    #[must_use]
    pub fn new(control: Arc<dyn LogLevelControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl ReloadListener for LoggerReloadListener {
    fn name(&self) -> &str {
        "logger"
    }

    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
        self.control
            .set_level(&event.snapshot.logging.level)
            .map_err(|e| ReloadError::apply(self.name(), e))
    }
}
