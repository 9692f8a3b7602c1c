//! Engine assembly and lifecycle.
//!
//! Startup order: cache, directory pools, attempt ledger, script runtime,
//! initial scripts, pool warm-up, reload coordinator and listeners, then the
//! background workers.

use std::path::Path;
use std::sync::Arc;

use jans_auth::AttemptLedger;
use jans_cache::{CacheProvider, LocalCacheProvider};
use jans_core::{AuditEvent, AuditEventType, MetricsRegistry, MetricsSink};
use jans_ldap::{DirectoryConnector, DirectoryPools, Ldap3Connector, PoolServices, PoolStatus};
use jans_reload::{ConfigSnapshot, ListenerStatus, ReloadCoordinator, ReloadKind};
use jans_script::{
    FactoryRegistry, NativeScriptFactory, ScriptRuntime, ScriptServices, ScriptStatus,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ServerResult;
use crate::listeners::{
    AppConfigReloadListener, CacheReloadListener, DirectoryReloadListener, LoggerReloadListener,
    ScriptReloadListener,
};
use crate::modules::register_builtin;
use crate::service::AuthenticationService;
use crate::tasks::{self, WorkerContext};
use crate::telemetry::LogLevelControl;

/// Configures and starts an [`Engine`].
#[derive(Debug)]
pub struct EngineBuilder {
    snapshot: ConfigSnapshot,
    connector: Option<Arc<dyn DirectoryConnector>>,
    metrics: Option<Arc<MetricsRegistry>>,
    log_control: Option<Arc<dyn LogLevelControl>>,
    native: Arc<NativeScriptFactory>,
    background: bool,
}

impl EngineBuilder {
    /// Starts from `snapshot`.
    #[must_use]
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            snapshot,
            connector: None,
            metrics: None,
            log_control: None,
            native: Arc::new(NativeScriptFactory::new()),
            background: true,
        }
    }

    /// Uses `connector` instead of the ldap3 connector.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn DirectoryConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Uses a shared metrics registry.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Applies `[logging].level` changes through `control`.
    #[must_use]
    pub fn log_control(mut self, control: Arc<dyn LogLevelControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Native modules available to descriptors, in addition to the built-in
    /// ones.
    #[must_use]
    pub fn native_modules(mut self, factory: Arc<NativeScriptFactory>) -> Self {
        self.native = factory;
        self
    }

    /// Whether to run the periodic workers. On by default.
    #[must_use]
    pub const fn background_tasks(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    /// Builds every component and starts the engine.
    ///
    /// Scripts that fail to load are reported and left `Failed`; they do not
    /// abort startup.
    pub async fn start(self) -> ServerResult<Engine> {
        let snapshot = self.snapshot;
        snapshot.validate()?;
        let metrics = self.metrics.unwrap_or_default();
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let cache = Arc::new(LocalCacheProvider::new(snapshot.cache.clone()));
        let shared_cache: Arc<dyn CacheProvider> = cache.clone();

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(Ldap3Connector::new()));
        let pools = Arc::new(DirectoryPools::new(
            &snapshot.directory,
            connector,
            PoolServices::default()
                .with_metrics(Arc::clone(&sink))
                .with_cache(Arc::clone(&shared_cache)),
        )?);

        let ledger = Arc::new(
            AttemptLedger::new(snapshot.lockout.clone())?.with_metrics(Arc::clone(&sink)),
        );

        let services = ScriptServices::default()
            .with_cache(shared_cache)
            .with_directory(Arc::clone(&pools))
            .with_metrics(Arc::clone(&sink));
        register_builtin(&self.native);
        let runtime = ScriptRuntime::new(
            Arc::new(FactoryRegistry::standard(self.native)),
            services,
            snapshot.runtime.clone(),
        )?;

        for (key, err) in runtime.apply_descriptors(&snapshot.scripts).await {
            tracing::error!(script = %key, error = %err, "script failed to load at startup");
        }
        let opened = pools.warm_up().await;

        let coordinator = ReloadCoordinator::new(snapshot, Arc::clone(&sink))?;
        coordinator.subscribe(
            ReloadKind::LdapConfig,
            Arc::new(DirectoryReloadListener::new(Arc::clone(&pools))),
        );
        coordinator.subscribe(
            ReloadKind::AppConfig,
            Arc::new(AppConfigReloadListener::new(
                Arc::clone(&ledger),
                runtime.clone(),
            )),
        );
        coordinator.subscribe(
            ReloadKind::Script,
            Arc::new(ScriptReloadListener::new(runtime.clone())),
        );
        coordinator.subscribe(
            ReloadKind::Cache,
            Arc::new(CacheReloadListener::new(Arc::clone(&cache))),
        );
        if let Some(control) = self.log_control {
            coordinator.subscribe(ReloadKind::Logger, Arc::new(LoggerReloadListener::new(control)));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = if self.background {
            tasks::spawn_all(
                &WorkerContext {
                    coordinator: coordinator.clone(),
                    pools: Arc::clone(&pools),
                    ledger: Arc::clone(&ledger),
                    cache: Arc::clone(&cache),
                    metrics: Arc::clone(&metrics),
                },
                &shutdown_rx,
            )
        } else {
            Vec::new()
        };

        let auth = AuthenticationService::new(Arc::clone(&ledger), runtime.clone(), sink);

        AuditEvent::builder(AuditEventType::ApplicationInitialized)
            .success()
            .detail("pools", pools.names().len().to_string())
            .detail("connections", opened.to_string())
            .detail("scripts", runtime.statuses().len().to_string())
            .emit();
        tracing::info!(
            pools = pools.names().len(),
            connections = opened,
            "engine started"
        );

        Ok(Engine {
            coordinator,
            pools,
            ledger,
            runtime,
            cache,
            metrics,
            auth,
            shutdown,
            workers: Mutex::new(workers),
        })
    }
}

/// Point-in-time view of the running engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Version of the current configuration snapshot.
    pub config_version: u64,
    /// Pool status by name.
    pub pools: Vec<PoolStatus>,
    /// Script status by type and name.
    pub scripts: Vec<ScriptStatus>,
    /// Reload delivery statistics.
    pub listeners: Vec<ListenerStatus>,
}

/// A running authentication engine.
#[derive(Debug)]
pub struct Engine {
    coordinator: ReloadCoordinator,
    pools: Arc<DirectoryPools>,
    ledger: Arc<AttemptLedger>,
    runtime: ScriptRuntime,
    cache: Arc<LocalCacheProvider>,
    metrics: Arc<MetricsRegistry>,
    auth: AuthenticationService,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder(snapshot: ConfigSnapshot) -> EngineBuilder {
        EngineBuilder::new(snapshot)
    }

    /// Login front door.
    #[must_use]
    pub const fn authentication(&self) -> &AuthenticationService {
        &self.auth
    }

    /// Reload coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &ReloadCoordinator {
        &self.coordinator
    }

    /// Directory pools.
    #[must_use]
    pub const fn pools(&self) -> &Arc<DirectoryPools> {
        &self.pools
    }

    /// Attempt ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<AttemptLedger> {
        &self.ledger
    }

    /// Script runtime.
    #[must_use]
    pub const fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    /// Local cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<LocalCacheProvider> {
        &self.cache
    }

    /// Aggregated metrics.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.coordinator.current()
    }

    /// Swaps in `snapshot` and publishes the changed sections.
    pub fn reconfigure(&self, snapshot: ConfigSnapshot) -> ServerResult<Vec<(ReloadKind, u64)>> {
        Ok(self.coordinator.reconfigure_all(snapshot)?)
    }

    /// Loads `path` and reconfigures from it.
    pub async fn reload_from(&self, path: impl AsRef<Path>) -> ServerResult<Vec<(ReloadKind, u64)>> {
        let snapshot = ConfigSnapshot::load(path).await?;
        self.reconfigure(snapshot)
    }

    /// Status of every component.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            config_version: self.coordinator.version(),
            pools: self.pools.status(),
            scripts: self.runtime.statuses(),
            listeners: self.coordinator.listener_statuses(),
        }
    }

    /// Stops the workers, drains pending reloads, unloads scripts and closes
    /// the pools.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "background worker ended abnormally");
            }
        }
        self.coordinator.shutdown().await;
        self.runtime.unload_all().await;
        self.pools.close_all().await;
        tracing::info!("engine stopped");
    }
}
