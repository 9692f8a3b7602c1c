//! Connection pool for one named directory backend.
//!
//! Outstanding leases are capped by a semaphore holding `max_size` permits.
//! Idle connections sit in a queue and carry the bind epoch and endpoint they
//! were opened with, so a reconfiguration can retire them without touching
//! connections that are currently lent out.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jans_cache::CacheProvider;
use jans_core::metrics::names;
use jans_core::{MetricsSink, NoopMetrics};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::{ConnectionPoolDescriptor, EndpointConfig, PoolRole, SearchScope};
use crate::connection::{DirectoryConnection, DirectoryConnector, DirectoryEntry};
use crate::error::{LdapError, LdapResult};
use crate::health::{health_cache_key, EndpointStatus, EndpointStatusEvent, HealthTable};

/// Collaborators shared by the pools of one registry.
#[derive(Debug, Clone)]
pub struct PoolServices {
    /// Metrics sink.
    pub metrics: Arc<dyn MetricsSink>,
    /// Endpoint health is mirrored here when set.
    pub cache: Option<Arc<dyn CacheProvider>>,
    /// Endpoint status change channel.
    pub events: broadcast::Sender<EndpointStatusEvent>,
}

impl Default for PoolServices {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            metrics: Arc::new(NoopMetrics),
            cache: None,
            events,
        }
    }
}

impl PoolServices {
    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the health cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool name.
    pub name: String,
    /// Backend role.
    pub role: PoolRole,
    /// Primary for its role.
    pub primary: bool,
    /// Idle connections.
    pub idle: usize,
    /// Outstanding leases.
    pub leased: usize,
    /// Configured minimum.
    pub min_size: usize,
    /// Configured maximum.
    pub max_size: usize,
    /// Configuration generation, incremented on every reconfigure.
    pub generation: u64,
    /// Whether the pool was closed.
    pub closed: bool,
    /// Endpoint health in priority order.
    pub endpoints: Vec<EndpointStatus>,
}

/// Outcome of one [`ConnectionPool::check_health`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Failing endpoints that were probed.
    pub probed_endpoints: usize,
    /// Endpoints that recovered.
    pub recovered: usize,
    /// Idle connections validated.
    pub idle_checked: usize,
    /// Idle connections closed as stale or broken.
    pub idle_discarded: usize,
    /// Connections opened to reach `min_size`.
    pub opened: usize,
}

struct PoolSettings {
    descriptor: ConnectionPoolDescriptor,
    ordered: Vec<EndpointConfig>,
    generation: u64,
    bind_epoch: u64,
}

impl PoolSettings {
    fn new(descriptor: ConnectionPoolDescriptor, generation: u64, bind_epoch: u64) -> Self {
        let ordered = descriptor.ordered_endpoints();
        Self {
            descriptor,
            ordered,
            generation,
            bind_epoch,
        }
    }
}

#[derive(Debug)]
struct IdleConnection {
    conn: Box<dyn DirectoryConnection>,
    endpoint: String,
    bind_epoch: u64,
    generation: u64,
}

#[derive(Debug, Default)]
struct ReplacementState {
    pending: bool,
    last: Option<Instant>,
}

struct PoolInner {
    name: String,
    connector: Arc<dyn DirectoryConnector>,
    services: PoolServices,
    settings: RwLock<Arc<PoolSettings>>,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    permit_debt: AtomicUsize,
    leased: AtomicUsize,
    next_lease_id: AtomicU64,
    health: HealthTable,
    closed: AtomicBool,
    replacement: Mutex<ReplacementState>,
}

/// A named pool of service-bound directory connections.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("leased", &self.inner.leased.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates a pool. No connection is opened until the first acquire or
    /// health check.
    pub fn new(
        descriptor: ConnectionPoolDescriptor,
        connector: Arc<dyn DirectoryConnector>,
        services: PoolServices,
    ) -> LdapResult<Self> {
        descriptor.validate()?;
        let max_size = descriptor.max_size;
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: descriptor.name.clone(),
                connector,
                services,
                settings: RwLock::new(Arc::new(PoolSettings::new(descriptor, 1, 1))),
                idle: Mutex::new(VecDeque::new()),
                permits: Arc::new(Semaphore::new(max_size)),
                permit_debt: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
                next_lease_id: AtomicU64::new(1),
                health: HealthTable::default(),
                closed: AtomicBool::new(false),
                replacement: Mutex::new(ReplacementState::default()),
            }),
        })
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current descriptor.
    #[must_use]
    pub fn descriptor(&self) -> ConnectionPoolDescriptor {
        self.inner.settings().descriptor.clone()
    }

    /// Subscribes to endpoint status changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointStatusEvent> {
        self.inner.services.events.subscribe()
    }

    /// Leases a connection, waiting up to the descriptor's acquire timeout.
    pub async fn acquire(&self) -> LdapResult<PooledConnection> {
        let timeout = self.inner.settings().descriptor.acquire_timeout();
        self.acquire_timeout(timeout).await
    }

    /// Leases a connection, waiting up to `timeout` for a free lease.
    ///
    /// A zero timeout fails fast. Timing out or dropping the future leaves the
    /// pool unchanged.
    ///
    /// # Errors
    ///
    /// - [`LdapError::PoolExhausted`] when no lease frees up in time
    /// - [`LdapError::BackendUnavailable`] when no endpoint accepts a connection
    /// - [`LdapError::PoolClosed`] after [`close`](Self::close)
    pub async fn acquire_timeout(&self, timeout: Duration) -> LdapResult<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(LdapError::PoolClosed(inner.name.clone()));
        }
        let tags = [("pool", inner.name.as_str())];
        let started = Instant::now();

        let permit = if timeout.is_zero() {
            match Arc::clone(&inner.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => {
                    return Err(LdapError::PoolClosed(inner.name.clone()))
                }
                Err(TryAcquireError::NoPermits) => {
                    inner.services.metrics.increment(names::POOL_EXHAUSTED, &tags);
                    return Err(LdapError::PoolExhausted(inner.name.clone()));
                }
            }
        } else {
            match tokio::time::timeout(timeout, Arc::clone(&inner.permits).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(LdapError::PoolClosed(inner.name.clone())),
                Err(_) => {
                    tracing::debug!(pool = %inner.name, ?timeout, "acquire timed out");
                    inner.services.metrics.increment(names::POOL_EXHAUSTED, &tags);
                    return Err(LdapError::PoolExhausted(inner.name.clone()));
                }
            }
        };
        inner
            .services
            .metrics
            .timing(names::POOL_ACQUIRE_WAIT, started.elapsed(), &tags);

        let settings = inner.settings();
        loop {
            let candidate = inner.idle.lock().pop_back();
            let Some(mut idle) = candidate else { break };
            if inner.is_reusable(&settings, idle.bind_epoch, &idle.endpoint) {
                inner.services.metrics.increment(names::POOL_ACQUIRED, &tags);
                return Ok(inner.lease(idle, permit));
            }
            tracing::debug!(pool = %inner.name, endpoint = %idle.endpoint, "closing stale idle connection");
            idle.conn.close().await;
            inner
                .services
                .metrics
                .increment(names::POOL_CONNECTION_DISCARDED, &tags);
        }

        match inner.open(&settings).await {
            Ok(opened) => {
                inner.services.metrics.increment(names::POOL_ACQUIRED, &tags);
                Ok(inner.lease(opened, permit))
            }
            Err(err) => {
                inner.return_permit(permit);
                Err(err)
            }
        }
    }

    /// Returns a lease to the pool.
    ///
    /// Healthy connections are recycled unless their endpoint or credentials
    /// were reconfigured away. Unhealthy ones are closed and a replacement is
    /// opened in the background when the pool is below `min_size`.
    pub async fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy).await;
    }

    /// Applies a new descriptor.
    ///
    /// Idle connections that no longer match are closed right away; leased
    /// ones are retired when released.
    pub async fn reconfigure(&self, descriptor: ConnectionPoolDescriptor) -> LdapResult<()> {
        let inner = &self.inner;
        descriptor.validate()?;
        if descriptor.name != inner.name {
            return Err(LdapError::config(format!(
                "descriptor '{}' cannot reconfigure pool '{}'",
                descriptor.name, inner.name
            )));
        }

        let (old_max, new_settings) = {
            let mut guard = inner.settings.write();
            let old = Arc::clone(&guard);
            let bind_epoch = if old.descriptor.bind == descriptor.bind {
                old.bind_epoch
            } else {
                old.bind_epoch + 1
            };
            let next = Arc::new(PoolSettings::new(descriptor, old.generation + 1, bind_epoch));
            *guard = Arc::clone(&next);
            (old.descriptor.max_size, next)
        };

        inner.resize(old_max, new_settings.descriptor.max_size);
        inner.health.retain(&new_settings.ordered);

        let stale: Vec<IdleConnection> = {
            let mut idle = inner.idle.lock();
            let (keep, stale): (VecDeque<_>, VecDeque<_>) = idle.drain(..).partition(|c| {
                inner.is_reusable(&new_settings, c.bind_epoch, &c.endpoint)
            });
            *idle = keep;
            stale.into()
        };
        let retired = stale.len();
        for mut conn in stale {
            conn.conn.close().await;
        }

        tracing::info!(
            pool = %inner.name,
            generation = new_settings.generation,
            max_size = new_settings.descriptor.max_size,
            endpoints = new_settings.ordered.len(),
            retired,
            "connection pool reconfigured"
        );
        Ok(())
    }

    /// Probes failing endpoints, validates idle connections and tops the pool
    /// up to `min_size`.
    pub async fn check_health(&self) -> HealthReport {
        let inner = &self.inner;
        let mut report = HealthReport::default();
        if inner.closed.load(Ordering::Acquire) {
            return report;
        }
        let settings = inner.settings();
        let timeout = settings.descriptor.connect_timeout();

        for url in inner.health.failing() {
            let Some(endpoint) = settings.ordered.iter().find(|e| e.url == url) else {
                continue;
            };
            report.probed_endpoints += 1;
            let probe = async {
                let mut conn = inner
                    .connector
                    .connect(endpoint, &settings.descriptor.bind, timeout)
                    .await?;
                let result = conn.probe().await;
                conn.close().await;
                result
            };
            match probe.await {
                Ok(()) => {
                    if inner.on_success(&settings, &url) {
                        report.recovered += 1;
                    }
                }
                Err(err) if err.is_transient() => inner.on_transient_failure(&settings, &url, &err),
                Err(err) => {
                    tracing::debug!(pool = %inner.name, endpoint = %url, error = %err, "health probe rejected");
                }
            }
        }

        let drained: Vec<IdleConnection> = inner.idle.lock().drain(..).collect();
        let mut kept = Vec::with_capacity(drained.len());
        for mut idle in drained {
            report.idle_checked += 1;
            if !inner.is_reusable(&settings, idle.bind_epoch, &idle.endpoint) {
                idle.conn.close().await;
                report.idle_discarded += 1;
                continue;
            }
            match idle.conn.probe().await {
                Ok(()) => kept.push(idle),
                Err(err) => {
                    if err.is_transient() {
                        inner.on_transient_failure(&settings, &idle.endpoint, &err);
                    }
                    idle.conn.close().await;
                    report.idle_discarded += 1;
                }
            }
        }
        if report.idle_discarded > 0 {
            inner.services.metrics.emit(
                names::POOL_CONNECTION_DISCARDED,
                report.idle_discarded as f64,
                &[("pool", inner.name.as_str())],
            );
        }
        inner.idle.lock().extend(kept);

        report.opened = self.fill_to_min().await;
        tracing::debug!(pool = %inner.name, ?report, "health check finished");
        report
    }

    /// Opens connections until `idle + leased >= min_size`.
    ///
    /// Stops at the first failure and returns how many were opened.
    pub async fn fill_to_min(&self) -> usize {
        let inner = &self.inner;
        let mut opened = 0;
        loop {
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            let settings = inner.settings();
            if inner.open_connections() >= settings.descriptor.min_size {
                break;
            }
            match inner.open(&settings).await {
                Ok(conn) => {
                    inner.idle.lock().push_back(conn);
                    opened += 1;
                }
                Err(err) => {
                    tracing::warn!(pool = %inner.name, error = %err, "could not reach min_size");
                    break;
                }
            }
        }
        opened
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let settings = inner.settings();
        PoolStatus {
            name: inner.name.clone(),
            role: settings.descriptor.role,
            primary: settings.descriptor.primary,
            idle: inner.idle.lock().len(),
            leased: inner.leased.load(Ordering::Acquire),
            min_size: settings.descriptor.min_size,
            max_size: settings.descriptor.max_size,
            generation: settings.generation,
            closed: inner.closed.load(Ordering::Acquire),
            endpoints: inner.health.status(&settings.ordered),
        }
    }

    /// Closes idle connections; later acquires fail with
    /// [`LdapError::PoolClosed`]. Outstanding leases are closed on release.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.permits.close();
        let drained: Vec<IdleConnection> = inner.idle.lock().drain(..).collect();
        for mut idle in drained {
            idle.conn.close().await;
        }
        tracing::info!(pool = %inner.name, "connection pool closed");
    }
}

impl PoolInner {
    fn settings(&self) -> Arc<PoolSettings> {
        Arc::clone(&self.settings.read())
    }

    fn open_connections(&self) -> usize {
        self.idle.lock().len() + self.leased.load(Ordering::Acquire)
    }

    fn is_reusable(&self, settings: &PoolSettings, bind_epoch: u64, endpoint: &str) -> bool {
        !self.closed.load(Ordering::Acquire)
            && bind_epoch == settings.bind_epoch
            && settings.descriptor.has_endpoint(endpoint)
            && !self.health.is_degraded(endpoint)
    }

    fn lease(self: &Arc<Self>, idle: IdleConnection, permit: OwnedSemaphorePermit) -> PooledConnection {
        self.leased.fetch_add(1, Ordering::AcqRel);
        PooledConnection {
            conn: Some(idle.conn),
            lease_id: self.next_lease_id.fetch_add(1, Ordering::Relaxed),
            endpoint: idle.endpoint,
            bind_epoch: idle.bind_epoch,
            generation: idle.generation,
            permit: Some(permit),
            pool: Arc::clone(self),
        }
    }

    /// Ends a lease's accounting. A permit owed to a shrunk pool is forgotten.
    fn finish_lease(&self, permit: Option<OwnedSemaphorePermit>) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        if let Some(permit) = permit {
            self.return_permit(permit);
        }
    }

    fn return_permit(&self, permit: OwnedSemaphorePermit) {
        let owed = self
            .permit_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| debt.checked_sub(1))
            .is_ok();
        if owed {
            permit.forget();
        }
    }

    fn resize(&self, old_max: usize, new_max: usize) {
        if new_max > old_max {
            let mut grow = new_max - old_max;
            while grow > 0
                && self
                    .permit_debt
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
                    .is_ok()
            {
                grow -= 1;
            }
            self.permits.add_permits(grow);
        } else if new_max < old_max {
            let shrink = old_max - new_max;
            let mut removed = 0;
            while removed < shrink {
                match self.permits.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        removed += 1;
                    }
                    Err(_) => break,
                }
            }
            self.permit_debt.fetch_add(shrink - removed, Ordering::AcqRel);
        }
    }

    /// Opens a connection on the best candidate with one retry on the next.
    async fn open(&self, settings: &PoolSettings) -> LdapResult<IdleConnection> {
        let tags = [("pool", self.name.as_str())];
        let candidates = self.health.candidates(&settings.ordered);
        if candidates.is_empty() {
            self.services.metrics.increment(names::BACKEND_UNAVAILABLE, &tags);
            return Err(LdapError::unavailable(
                &self.name,
                "every endpoint is cooling down",
            ));
        }

        let timeout = settings.descriptor.connect_timeout();
        let mut last_error = None;
        for endpoint in candidates.iter().take(2) {
            match self
                .connector
                .connect(endpoint, &settings.descriptor.bind, timeout)
                .await
            {
                Ok(conn) => {
                    self.on_success(settings, &endpoint.url);
                    self.services
                        .metrics
                        .increment(names::POOL_CONNECTION_OPENED, &tags);
                    tracing::debug!(pool = %self.name, endpoint = %endpoint.url, "connection opened");
                    return Ok(IdleConnection {
                        conn,
                        endpoint: endpoint.url.clone(),
                        bind_epoch: settings.bind_epoch,
                        generation: settings.generation,
                    });
                }
                Err(err) if err.is_transient() => {
                    self.on_transient_failure(settings, &endpoint.url, &err);
                    last_error = Some(err);
                }
                Err(err) => {
                    tracing::warn!(pool = %self.name, endpoint = %endpoint.url, error = %err, "connection rejected");
                    return Err(err);
                }
            }
        }

        self.services.metrics.increment(names::BACKEND_UNAVAILABLE, &tags);
        let reason = last_error.map_or_else(|| "no endpoint reachable".to_string(), |e| e.to_string());
        Err(LdapError::unavailable(&self.name, reason))
    }

    fn on_transient_failure(&self, settings: &PoolSettings, url: &str, err: &LdapError) {
        let cooldown = settings.descriptor.cooldown();
        let was_degraded = self.health.is_degraded(url);
        let reason = err.to_string();
        let degraded_until = self.health.mark_degraded(url, &reason, cooldown);
        self.mirror_health(url, false, Some(&reason), degraded_until, cooldown);
        if was_degraded {
            return;
        }
        tracing::warn!(
            pool = %self.name,
            endpoint = %url,
            error = %reason,
            cooldown_secs = cooldown.as_secs(),
            "directory endpoint degraded"
        );
        self.services.metrics.increment(
            names::ENDPOINT_DEGRADED,
            &[("pool", self.name.as_str()), ("endpoint", url)],
        );
        jans_core::AuditEvent::builder(jans_core::AuditEventType::EndpointDegraded)
            .failure(reason.clone())
            .detail("pool", self.name.clone())
            .detail("endpoint", url)
            .emit();
        let _ = self.services.events.send(EndpointStatusEvent {
            pool: self.name.clone(),
            url: url.to_string(),
            available: false,
            degraded_until,
            reason: Some(reason),
        });
    }

    /// Returns `true` when the endpoint recovered from a failure.
    fn on_success(&self, settings: &PoolSettings, url: &str) -> bool {
        if !self.health.mark_healthy(url) {
            return false;
        }
        tracing::info!(pool = %self.name, endpoint = %url, "directory endpoint recovered");
        self.services.metrics.increment(
            names::ENDPOINT_RECOVERED,
            &[("pool", self.name.as_str()), ("endpoint", url)],
        );
        jans_core::AuditEvent::builder(jans_core::AuditEventType::EndpointRecovered)
            .detail("pool", self.name.clone())
            .detail("endpoint", url)
            .emit();
        self.mirror_health(url, true, None, None, settings.descriptor.cooldown());
        let _ = self.services.events.send(EndpointStatusEvent {
            pool: self.name.clone(),
            url: url.to_string(),
            available: true,
            degraded_until: None,
            reason: None,
        });
        true
    }

    fn mirror_health(
        &self,
        url: &str,
        available: bool,
        reason: Option<&str>,
        degraded_until: Option<DateTime<Utc>>,
        ttl: Duration,
    ) {
        if let Some(cache) = &self.services.cache {
            cache.put(
                &health_cache_key(&self.name, url),
                serde_json::json!({
                    "available": available,
                    "reason": reason,
                    "degraded_until": degraded_until,
                }),
                Some(ttl),
            );
        }
    }

    fn schedule_replacement(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let settings = self.settings();
        if self.open_connections() >= settings.descriptor.min_size {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay = {
            let mut state = self.replacement.lock();
            if state.pending {
                return;
            }
            state.pending = true;
            let interval = settings.descriptor.replacement_interval();
            state.last.map_or(Duration::ZERO, |last| {
                (last + interval).saturating_duration_since(Instant::now())
            })
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.replace_one().await;
        });
    }

    async fn replace_one(&self) {
        let settings = self.settings();
        if !self.closed.load(Ordering::Acquire)
            && self.open_connections() < settings.descriptor.min_size
        {
            match self.open(&settings).await {
                Ok(conn) => {
                    tracing::debug!(pool = %self.name, endpoint = %conn.endpoint, "replacement connection opened");
                    self.idle.lock().push_back(conn);
                }
                Err(err) => {
                    tracing::debug!(pool = %self.name, error = %err, "replacement connection failed");
                }
            }
        }
        let mut state = self.replacement.lock();
        state.pending = false;
        state.last = Some(Instant::now());
    }
}

/// A leased connection, exclusively owned by one caller.
///
/// Return it with [`release`](Self::release). Dropping a lease without
/// releasing it discards the connection.
pub struct PooledConnection {
    conn: Option<Box<dyn DirectoryConnection>>,
    lease_id: u64,
    endpoint: String,
    bind_epoch: u64,
    generation: u64,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("lease_id", &self.lease_id)
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PooledConnection {
    /// Unique id of this lease within its pool.
    #[must_use]
    pub const fn lease_id(&self) -> u64 {
        self.lease_id
    }

    /// Endpoint the connection is open to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pool generation the connection was opened under.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Name of the owning pool.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    fn conn_mut(&mut self) -> LdapResult<&mut Box<dyn DirectoryConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| LdapError::Internal("lease already returned".to_string()))
    }

    /// Binds as `dn`. See [`DirectoryConnection::bind`].
    ///
    /// The connection should be discarded afterwards.
    pub async fn bind(&mut self, dn: &str, password: &str) -> LdapResult<bool> {
        self.conn_mut()?.bind(dn, password).await
    }

    /// Runs a search.
    pub async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[&str],
    ) -> LdapResult<Vec<DirectoryEntry>> {
        self.conn_mut()?.search(base, scope, filter, attributes).await
    }

    /// Root DSE probe.
    pub async fn probe(&mut self) -> LdapResult<()> {
        self.conn_mut()?.probe().await
    }

    /// Returns the connection to its pool.
    pub async fn release(mut self, healthy: bool) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let settings = pool.settings();
        let reusable = healthy && pool.is_reusable(&settings, self.bind_epoch, &self.endpoint);
        if reusable {
            pool.idle.lock().push_back(IdleConnection {
                conn,
                endpoint: std::mem::take(&mut self.endpoint),
                bind_epoch: self.bind_epoch,
                generation: self.generation,
            });
            pool.finish_lease(self.permit.take());
            return;
        }

        pool.finish_lease(self.permit.take());
        tracing::debug!(
            pool = %pool.name,
            endpoint = %self.endpoint,
            healthy,
            "connection discarded on release"
        );
        conn.close().await;
        pool.services.metrics.increment(
            names::POOL_CONNECTION_DISCARDED,
            &[("pool", pool.name.as_str())],
        );
        pool.schedule_replacement();
    }

    /// Closes the connection instead of recycling it.
    ///
    /// Use this when the connection state has changed (e.g., after user bind).
    pub async fn discard(self) {
        self.release(false).await;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        self.pool.finish_lease(self.permit.take());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { conn.close().await });
        }
        self.pool.schedule_replacement();
    }
}
