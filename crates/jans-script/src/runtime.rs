//! Revisioned script runtime.
//!
//! Each script key owns a slot holding its Active revision. Loads for one key
//! are serialized; a successful load swaps the slot's revision and rebuilds
//! the dispatch chain of its type. Invocations clone the chain `Arc` once, so
//! a request sees one revision of every module from start to finish. A
//! revision is destroyed when the last chain referencing it is dropped.
//!
//! Rhai modules run on the calling task and are bounded by the operation
//! limit. Native modules are bounded by the invocation timeout.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use jans_core::metrics::names;
use jans_core::{AuditEvent, AuditEventType, SnapshotHandle};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::{ExternalScriptContext, ScriptServices};
use crate::error::{ScriptError, ScriptResult};
use crate::module::{ScriptModule, CURRENT_API_VERSION};
use crate::registry::FactoryRegistry;
use crate::types::{
    Decision, Invocation, ScriptDescriptor, ScriptKey, ScriptSignal, ScriptState, ScriptStatus,
    ScriptType, TraceEntry, TraceOutcome,
};

/// Limits applied to modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Budget of one module call.
    pub invocation_timeout_ms: u64,
    /// Budget of the initialization hook.
    pub init_timeout_ms: u64,
    /// Rhai operation limit per call. Applies to revisions built afterwards.
    pub max_operations: u64,
    /// Rhai call-depth limit.
    pub max_call_levels: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: 2_000,
            init_timeout_ms: 10_000,
            max_operations: 500_000,
            max_call_levels: 32,
        }
    }
}

impl RuntimeSettings {
    /// Invocation budget.
    #[must_use]
    pub const fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    /// Initialization budget.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Validates the settings.
    pub fn validate(&self) -> ScriptResult<()> {
        if self.invocation_timeout_ms == 0 {
            return Err(ScriptError::config("invocation_timeout_ms must be positive"));
        }
        if self.init_timeout_ms == 0 {
            return Err(ScriptError::config("init_timeout_ms must be positive"));
        }
        if self.max_operations == 0 {
            return Err(ScriptError::config("max_operations must be positive"));
        }
        if self.max_call_levels == 0 {
            return Err(ScriptError::config("max_call_levels must be positive"));
        }
        Ok(())
    }
}

/// One initialized revision of a script.
pub struct LoadedModule {
    key: ScriptKey,
    revision: u64,
    level: i32,
    module: Box<dyn ScriptModule>,
}

impl LoadedModule {
    /// Script key.
    #[must_use]
    pub const fn key(&self) -> &ScriptKey {
        &self.key
    }

    /// Revision number.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        let module = &self.module;
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| module.destroy())) {
            tracing::error!(
                script = %self.key,
                revision = self.revision,
                error = %panic_message(&*panic),
                "Script destroy hook panicked"
            );
        }
        tracing::debug!(script = %self.key, revision = self.revision, "Script revision retired");
    }
}

type Chain = Arc<Vec<Arc<LoadedModule>>>;

#[derive(Debug)]
struct SlotState {
    descriptor: ScriptDescriptor,
    state: ScriptState,
    active: Option<Arc<LoadedModule>>,
    latest_revision: u64,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl SlotState {
    fn status(&self) -> ScriptStatus {
        ScriptStatus {
            name: self.descriptor.name.clone(),
            script_type: self.descriptor.script_type,
            state: self.state,
            active_revision: self.active.as_ref().map(|m| m.revision),
            latest_revision: self.latest_revision,
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }

    fn set_state(&mut self, state: ScriptState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug)]
struct Slot {
    load_lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(descriptor: ScriptDescriptor) -> Self {
        Self {
            load_lock: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(SlotState {
                descriptor,
                state: ScriptState::Unloaded,
                active: None,
                latest_revision: 0,
                last_error: None,
                updated_at: Utc::now(),
            }),
        }
    }
}

#[derive(Debug)]
struct RuntimeInner {
    factories: Arc<FactoryRegistry>,
    services: ScriptServices,
    settings: SnapshotHandle<RuntimeSettings>,
    slots: DashMap<ScriptKey, Arc<Slot>>,
    chains: RwLock<HashMap<ScriptType, Chain>>,
    next_revision: AtomicU64,
}

/// Loads, reloads and dispatches to script modules.
#[derive(Debug, Clone)]
pub struct ScriptRuntime {
    inner: Arc<RuntimeInner>,
}

impl ScriptRuntime {
    /// Creates a runtime without scripts.
    pub fn new(
        factories: Arc<FactoryRegistry>,
        services: ScriptServices,
        settings: RuntimeSettings,
    ) -> ScriptResult<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                factories,
                services,
                settings: SnapshotHandle::new(settings),
                slots: DashMap::new(),
                chains: RwLock::new(HashMap::new()),
                next_revision: AtomicU64::new(0),
            }),
        })
    }

    /// Side channels handed to modules.
    #[must_use]
    pub fn services(&self) -> &ScriptServices {
        &self.inner.services
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> Arc<RuntimeSettings> {
        self.inner.settings.load()
    }

    /// Replaces the settings. Timeouts apply to the next call; Rhai limits
    /// apply to revisions built afterwards.
    pub fn update_settings(&self, settings: RuntimeSettings) -> ScriptResult<()> {
        settings.validate()?;
        self.inner.settings.swap(Arc::new(settings));
        Ok(())
    }

    /// Builds and activates a revision of `descriptor`.
    ///
    /// On failure the script moves to [`ScriptState::Failed`] and its previous
    /// Active revision, if any, keeps serving. A disabled descriptor retires
    /// the Active revision.
    pub async fn load(&self, descriptor: ScriptDescriptor) -> ScriptResult<ScriptStatus> {
        descriptor.validate()?;
        let key = descriptor.key();
        let (slot, _guard) = self.lock_slot(&key, &descriptor).await;

        if !descriptor.enabled {
            return Ok(self.disable(&slot, descriptor));
        }

        let revision = self.inner.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut st = slot.state.lock();
            let next = if st.active.is_some() {
                ScriptState::Reloading
            } else {
                ScriptState::Loading
            };
            st.descriptor = descriptor.clone();
            st.latest_revision = revision;
            st.set_state(next);
        }

        let settings = self.inner.settings.load();
        let tags = [("script", key.name.as_str()), ("type", key.script_type.as_str())];
        match self.build(&descriptor, &settings).await {
            Ok(module) => {
                let loaded = Arc::new(LoadedModule {
                    key: key.clone(),
                    revision,
                    level: descriptor.level,
                    module,
                });
                let (status, previous) = {
                    let mut st = slot.state.lock();
                    let previous = st.active.replace(loaded);
                    st.last_error = None;
                    st.set_state(ScriptState::Active);
                    (st.status(), previous)
                };
                self.rebuild_chain(key.script_type);
                drop(previous);

                tracing::info!(script = %key, revision, "Script revision activated");
                self.inner.services.metrics.increment(names::SCRIPT_LOADED, &tags);
                AuditEvent::builder(AuditEventType::ScriptActivated)
                    .success()
                    .detail("script", key.to_string())
                    .detail("revision", revision.to_string())
                    .emit();
                Ok(status)
            }
            Err(err) => {
                let serving = {
                    let mut st = slot.state.lock();
                    st.last_error = Some(err.to_string());
                    st.set_state(ScriptState::Failed);
                    st.active.as_ref().map(|m| m.revision)
                };
                tracing::warn!(
                    script = %key,
                    revision,
                    serving = ?serving,
                    error = %err,
                    "Script load failed"
                );
                self.inner.services.metrics.increment(names::SCRIPT_LOAD_FAILED, &tags);
                AuditEvent::builder(AuditEventType::ScriptLoadFailed)
                    .failure(err.to_string())
                    .detail("script", key.to_string())
                    .detail("revision", revision.to_string())
                    .emit();
                Err(err)
            }
        }
    }

    /// Loads a new revision while invocations keep using the current one.
    pub async fn reload(&self, descriptor: ScriptDescriptor) -> ScriptResult<ScriptStatus> {
        self.load(descriptor).await
    }

    /// Runs [`Self::reload`] on a background task.
    pub fn spawn_reload(
        &self,
        descriptor: ScriptDescriptor,
    ) -> JoinHandle<ScriptResult<ScriptStatus>> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.reload(descriptor).await })
    }

    /// Removes a script. Its revision is destroyed once in-flight invocations
    /// finish. Returns whether the script was known.
    pub async fn unload(&self, script_type: ScriptType, name: &str) -> bool {
        let key = ScriptKey::new(script_type, name);
        let Some(slot) = self.inner.slots.get(&key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let _guard = Arc::clone(&slot.load_lock).lock_owned().await;
        let removed = self
            .inner
            .slots
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot))
            .is_some();
        if !removed {
            return false;
        }
        let previous = {
            let mut st = slot.state.lock();
            st.set_state(ScriptState::Unloaded);
            st.active.take()
        };
        self.rebuild_chain(script_type);
        if let Some(previous) = previous {
            tracing::info!(script = %key, revision = previous.revision, "Script unloaded");
            AuditEvent::builder(AuditEventType::ScriptDeactivated)
                .success()
                .detail("script", key.to_string())
                .detail("reason", "removed")
                .emit();
        }
        true
    }

    /// Unloads every script.
    pub async fn unload_all(&self) {
        let keys: Vec<ScriptKey> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.unload(key.script_type, &key.name).await;
        }
    }

    /// Brings the runtime in line with `descriptors`: loads new and changed
    /// scripts, retries failed ones and unloads the ones no longer listed.
    ///
    /// Returns the scripts that failed to load.
    pub async fn apply_descriptors(
        &self,
        descriptors: &[ScriptDescriptor],
    ) -> Vec<(ScriptKey, ScriptError)> {
        let wanted: HashSet<ScriptKey> = descriptors.iter().map(ScriptDescriptor::key).collect();
        let removed: Vec<ScriptKey> = self
            .inner
            .slots
            .iter()
            .filter(|e| !wanted.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in removed {
            self.unload(key.script_type, &key.name).await;
        }

        let changed: Vec<ScriptDescriptor> = descriptors
            .iter()
            .filter(|d| self.needs_load(d))
            .cloned()
            .collect();
        let results = futures::future::join_all(changed.into_iter().map(|d| async move {
            let key = d.key();
            (key, self.load(d).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(key, result)| result.err().map(|err| (key, err)))
            .collect()
    }

    /// Dispatches `method` to the Active modules of `script_type` in
    /// ascending `(level, name)` order.
    ///
    /// Module failures never escape: they are logged with the module identity
    /// and either skipped or, for authentication-critical types, turned into
    /// a denial. Backend errors and timeouts on those types are reported as
    /// unavailable instead.
    pub async fn invoke(
        &self,
        script_type: ScriptType,
        method: &str,
        ctx: &mut ExternalScriptContext,
    ) -> Invocation {
        let chain = self.chain(script_type);
        let settings = self.inner.settings.load();
        let critical = script_type.is_authentication_critical();
        let mut trace = Vec::with_capacity(chain.len());
        let mut approved = false;
        let mut decision = None;

        for module in chain.iter() {
            ctx.set_current(Some((module.key.clone(), module.revision)));
            let started = Instant::now();
            let call = AssertUnwindSafe(module.module.invoke(method, ctx)).catch_unwind();
            let result = match tokio::time::timeout(settings.invocation_timeout(), call).await {
                Err(_) => Err(ScriptError::InvocationTimeout),
                Ok(Err(panic)) => Err(ScriptError::invocation(format!(
                    "panicked: {}",
                    panic_message(&*panic)
                ))),
                Ok(Ok(result)) => result,
            };
            let elapsed = started.elapsed();
            let tags = [("script", module.key.name.as_str()), ("type", script_type.as_str())];
            self.inner
                .services
                .metrics
                .timing(names::SCRIPT_INVOCATION, elapsed, &tags);

            match result {
                Ok(signal) => {
                    trace.push(TraceEntry {
                        script: module.key.name.clone(),
                        revision: module.revision,
                        outcome: TraceOutcome::Signal(signal.clone()),
                        elapsed,
                    });
                    match signal {
                        ScriptSignal::Continue => {}
                        ScriptSignal::Success => approved = true,
                        ScriptSignal::Stop(stop) => {
                            decision = Some(if stop.allow {
                                Decision::Allow
                            } else {
                                Decision::Deny {
                                    script: module.key.name.clone(),
                                    reason: stop.reason.unwrap_or_else(|| "denied".to_string()),
                                }
                            });
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        script = %module.key,
                        revision = module.revision,
                        method,
                        correlation_id = %ctx.correlation_id(),
                        error = %err,
                        "Script invocation failed"
                    );
                    self.inner
                        .services
                        .metrics
                        .increment(names::SCRIPT_INVOCATION_FAILED, &tags);
                    trace.push(TraceEntry {
                        script: module.key.name.clone(),
                        revision: module.revision,
                        outcome: TraceOutcome::Failed(err.to_string()),
                        elapsed,
                    });
                    if critical {
                        let retryable =
                            err.is_transient() || matches!(err, ScriptError::InvocationTimeout);
                        decision = Some(if retryable {
                            Decision::Unavailable {
                                script: module.key.name.clone(),
                                reason: err.to_string(),
                            }
                        } else {
                            Decision::Deny {
                                script: module.key.name.clone(),
                                reason: "script failure".to_string(),
                            }
                        });
                        break;
                    }
                }
            }
        }
        ctx.set_current(None);

        let decision = decision.unwrap_or(if approved {
            Decision::Allow
        } else {
            Decision::NoDecision
        });
        Invocation { decision, trace }
    }

    /// Status of one script.
    #[must_use]
    pub fn status(&self, script_type: ScriptType, name: &str) -> Option<ScriptStatus> {
        self.inner
            .slots
            .get(&ScriptKey::new(script_type, name))
            .map(|slot| slot.state.lock().status())
    }

    /// Status of every script, sorted by key.
    #[must_use]
    pub fn statuses(&self) -> Vec<ScriptStatus> {
        let mut statuses: Vec<ScriptStatus> = self
            .inner
            .slots
            .iter()
            .map(|slot| slot.state.lock().status())
            .collect();
        statuses.sort_by(|a, b| (a.script_type, &a.name).cmp(&(b.script_type, &b.name)));
        statuses
    }

    /// Active `(name, revision)` pairs of a type in dispatch order.
    #[must_use]
    pub fn active_chain(&self, script_type: ScriptType) -> Vec<(String, u64)> {
        self.chain(script_type)
            .iter()
            .map(|m| (m.key.name.clone(), m.revision))
            .collect()
    }

    fn chain(&self, script_type: ScriptType) -> Chain {
        self.inner
            .chains
            .read()
            .get(&script_type)
            .cloned()
            .unwrap_or_default()
    }

    fn needs_load(&self, descriptor: &ScriptDescriptor) -> bool {
        self.inner
            .slots
            .get(&descriptor.key())
            .map_or(true, |slot| {
                let st = slot.state.lock();
                st.state == ScriptState::Failed || st.descriptor != *descriptor
            })
    }

    async fn lock_slot(
        &self,
        key: &ScriptKey,
        descriptor: &ScriptDescriptor,
    ) -> (Arc<Slot>, OwnedMutexGuard<()>) {
        loop {
            let slot = Arc::clone(
                self.inner
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Slot::new(descriptor.clone())))
                    .value(),
            );
            let guard = Arc::clone(&slot.load_lock).lock_owned().await;
            let current = self
                .inner
                .slots
                .get(key)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));
            if current {
                return (slot, guard);
            }
        }
    }

    async fn build(
        &self,
        descriptor: &ScriptDescriptor,
        settings: &RuntimeSettings,
    ) -> ScriptResult<Box<dyn ScriptModule>> {
        let factory = self.inner.factories.get(&descriptor.source.engine)?;
        let mut module = std::panic::catch_unwind(AssertUnwindSafe(|| {
            factory.create(descriptor, settings, &self.inner.services)
        }))
        .map_err(|panic| {
            ScriptError::Initialization(format!("panicked: {}", panic_message(&*panic)))
        })??;

        let init = AssertUnwindSafe(module.initialize(&descriptor.properties)).catch_unwind();
        match tokio::time::timeout(settings.init_timeout(), init).await {
            Err(_) => return Err(ScriptError::InitTimeout),
            Ok(Err(panic)) => {
                return Err(ScriptError::Initialization(format!(
                    "panicked: {}",
                    panic_message(&*panic)
                )))
            }
            Ok(Ok(result)) => result?,
        }

        let version = module.api_version();
        if version == 0 || version > CURRENT_API_VERSION {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| module.destroy())) {
                tracing::error!(
                    script = %descriptor.key(),
                    error = %panic_message(&*panic),
                    "Script destroy hook panicked"
                );
            }
            return Err(ScriptError::UnsupportedApiVersion(version));
        }
        Ok(module)
    }

    fn disable(&self, slot: &Slot, descriptor: ScriptDescriptor) -> ScriptStatus {
        let key = descriptor.key();
        let (status, previous) = {
            let mut st = slot.state.lock();
            st.descriptor = descriptor;
            st.last_error = None;
            st.set_state(ScriptState::Disabled);
            let previous = st.active.take();
            (st.status(), previous)
        };
        self.rebuild_chain(key.script_type);
        if let Some(previous) = previous {
            tracing::info!(script = %key, revision = previous.revision, "Script disabled");
            AuditEvent::builder(AuditEventType::ScriptDeactivated)
                .success()
                .detail("script", key.to_string())
                .detail("reason", "disabled")
                .emit();
        }
        status
    }

    fn rebuild_chain(&self, script_type: ScriptType) {
        let mut chains = self.inner.chains.write();
        let mut modules: Vec<Arc<LoadedModule>> = self
            .inner
            .slots
            .iter()
            .filter(|e| e.key().script_type == script_type)
            .filter_map(|e| e.value().state.lock().active.clone())
            .collect();
        modules.sort_by(|a, b| (a.level, &a.key.name).cmp(&(b.level, &b.key.name)));
        if modules.is_empty() {
            chains.remove(&script_type);
        } else {
            chains.insert(script_type, Arc::new(modules));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
