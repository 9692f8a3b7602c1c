//! Ordered reload delivery.
//!
//! Every [`ReloadKind`] has an unbounded queue drained by one worker task.
//! Sequence numbers come from a single counter and are assigned under the
//! kind's publish lock, so each queue is strictly ordered. The worker hands
//! each event to the kind's listeners in registration order; a listener
//! never sees a sequence that is not newer than the last one it observed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use jans_core::metrics::names;
use jans_core::{AuditEvent, AuditEventType, MetricsSink, SnapshotHandle};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::diff::changed_kinds;
use crate::error::{ReloadError, ReloadResult};
use crate::event::{ReloadEvent, ReloadKind};
use crate::listener::{ListenerStatus, ReloadListener};
use crate::snapshot::ConfigSnapshot;

#[derive(Debug)]
enum Message {
    Event(ReloadEvent),
    Flush(oneshot::Sender<()>),
}

struct Subscription {
    listener: Arc<dyn ReloadListener>,
    status: Mutex<ListenerStatus>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    fn new(kind: ReloadKind, listener: Arc<dyn ReloadListener>) -> Self {
        let status = ListenerStatus {
            name: listener.name().to_string(),
            kind,
            last_sequence: None,
            applied: 0,
            failed: 0,
            skipped: 0,
            last_error: None,
        };
        Self {
            listener,
            status: Mutex::new(status),
        }
    }

    fn is_newer(&self, sequence: u64) -> bool {
        let mut status = self.status.lock();
        if status.last_sequence.is_some_and(|last| sequence <= last) {
            status.skipped += 1;
            return false;
        }
        true
    }

    async fn deliver(&self, event: &ReloadEvent, metrics: &dyn MetricsSink) {
        let name = self.listener.name().to_string();
        if !self.is_newer(event.sequence) {
            tracing::debug!(
                listener = %name,
                kind = %event.kind,
                sequence = event.sequence,
                "Skipped stale reload event"
            );
            return;
        }

        let outcome = AssertUnwindSafe(self.listener.apply(event))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(format!("listener panicked: {}", panic_message(&*panic))),
        };

        {
            let mut status = self.status.lock();
            status.last_sequence = Some(event.sequence);
            match &error {
                None => {
                    status.applied += 1;
                    status.last_error = None;
                }
                Some(reason) => {
                    status.failed += 1;
                    status.last_error = Some(reason.clone());
                }
            }
        }

        let tags = [("listener", name.as_str()), ("kind", event.kind.as_str())];
        match error {
            None => {
                tracing::info!(
                    listener = %name,
                    kind = %event.kind,
                    sequence = event.sequence,
                    "Applied configuration reload"
                );
                metrics.increment(names::RELOAD_APPLIED, &tags);
                AuditEvent::builder(AuditEventType::ConfigurationReloaded)
                    .success()
                    .detail("listener", name.as_str())
                    .detail("kind", event.kind.as_str())
                    .detail("sequence", event.sequence.to_string())
                    .emit();
            }
            Some(reason) => {
                tracing::error!(
                    listener = %name,
                    kind = %event.kind,
                    sequence = event.sequence,
                    error = %reason,
                    "Configuration reload rejected, keeping previous configuration"
                );
                metrics.increment(names::RELOAD_FAILED, &tags);
                AuditEvent::builder(AuditEventType::ConfigurationReloadFailed)
                    .failure(reason)
                    .detail("listener", name.as_str())
                    .detail("kind", event.kind.as_str())
                    .detail("sequence", event.sequence.to_string())
                    .emit();
            }
        }
    }
}

type Subscribers = Arc<RwLock<Vec<Arc<Subscription>>>>;

#[derive(Debug)]
struct Queue {
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    subscribers: Subscribers,
    worker: Mutex<Option<JoinHandle<()>>>,
}

async fn run_worker(
    kind: ReloadKind,
    mut rx: mpsc::UnboundedReceiver<Message>,
    subscribers: Subscribers,
    metrics: Arc<dyn MetricsSink>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Flush(done) => {
                let _ = done.send(());
            }
            Message::Event(event) => {
                let current: Vec<Arc<Subscription>> = subscribers.read().clone();
                for subscription in current {
                    subscription.deliver(&event, metrics.as_ref()).await;
                }
            }
        }
    }
    tracing::debug!(kind = %kind, "Reload worker stopped");
}

#[derive(Debug)]
struct Inner {
    current: SnapshotHandle<ConfigSnapshot>,
    sequence: AtomicU64,
    queues: HashMap<ReloadKind, Queue>,
    reconfigure: Mutex<()>,
    metrics: Arc<dyn MetricsSink>,
}

/// Publishes configuration changes to subscribed components.
#[derive(Debug, Clone)]
pub struct ReloadCoordinator {
    inner: Arc<Inner>,
}

impl ReloadCoordinator {
    /// Creates a coordinator holding `initial` and starts one worker per kind.
    ///
    /// ## Errors
    ///
    /// Fails if `initial` is invalid or no Tokio runtime is running.
    pub fn new(initial: ConfigSnapshot, metrics: Arc<dyn MetricsSink>) -> ReloadResult<Self> {
        initial.validate()?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ReloadError::NoRuntime)?;

        let mut queues = HashMap::with_capacity(ReloadKind::ALL.len());
        for kind in ReloadKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
            let worker = handle.spawn(run_worker(
                kind,
                rx,
                Arc::clone(&subscribers),
                Arc::clone(&metrics),
            ));
            queues.insert(
                kind,
                Queue {
                    sender: Mutex::new(Some(tx)),
                    subscribers,
                    worker: Mutex::new(Some(worker)),
                },
            );
        }

        Ok(Self {
            inner: Arc::new(Inner {
                current: SnapshotHandle::new(initial),
                sequence: AtomicU64::new(0),
                queues,
                reconfigure: Mutex::new(()),
                metrics,
            }),
        })
    }

    fn queue(&self, kind: ReloadKind) -> ReloadResult<&Queue> {
        self.inner.queues.get(&kind).ok_or(ReloadError::Closed)
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner.current.load()
    }

    /// Version of the current snapshot. Starts at 0 and grows by one for
    /// every accepted `reconfigure_all`.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.current.version()
    }

    /// Registers a listener for `kind`. Listeners of a kind are called in
    /// registration order.
    pub fn subscribe(&self, kind: ReloadKind, listener: Arc<dyn ReloadListener>) {
        if let Ok(queue) = self.queue(kind) {
            tracing::debug!(listener = listener.name(), kind = %kind, "Reload listener subscribed");
            queue
                .subscribers
                .write()
                .push(Arc::new(Subscription::new(kind, listener)));
        }
    }

    /// Enqueues an event for `kind` and returns its sequence number. Never
    /// waits for delivery.
    pub fn publish(&self, kind: ReloadKind, snapshot: Arc<ConfigSnapshot>) -> ReloadResult<u64> {
        let queue = self.queue(kind)?;
        let sender = queue.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(ReloadError::Closed);
        };
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        tx.send(Message::Event(ReloadEvent {
            kind,
            sequence,
            snapshot,
        }))
        .map_err(|_| ReloadError::Closed)?;
        drop(sender);

        tracing::debug!(kind = %kind, sequence, "Published reload event");
        self.inner
            .metrics
            .increment(names::RELOAD_PUBLISHED, &[("kind", kind.as_str())]);
        Ok(sequence)
    }

    /// Validates `snapshot`, makes it current and publishes one event per
    /// changed kind.
    ///
    /// Returns the published `(kind, sequence)` pairs. An invalid snapshot is
    /// rejected and the current one stays in place.
    pub fn reconfigure_all(&self, snapshot: ConfigSnapshot) -> ReloadResult<Vec<(ReloadKind, u64)>> {
        snapshot.validate()?;
        let _guard = self.inner.reconfigure.lock();
        let next = Arc::new(snapshot);
        let previous = self.inner.current.swap(Arc::clone(&next));
        let kinds = changed_kinds(&previous.value, &next);
        if kinds.is_empty() {
            tracing::debug!("Configuration unchanged");
            return Ok(Vec::new());
        }
        tracing::info!(
            version = previous.version + 1,
            kinds = ?kinds,
            "Configuration changed"
        );
        kinds
            .into_iter()
            .map(|kind| self.publish(kind, Arc::clone(&next)).map(|seq| (kind, seq)))
            .collect()
    }

    /// Waits until everything enqueued for `kind` so far has been delivered.
    pub async fn flush(&self, kind: ReloadKind) -> ReloadResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let queue = self.queue(kind)?;
            let sender = queue.sender.lock();
            let Some(sender) = sender.as_ref() else {
                return Err(ReloadError::Closed);
            };
            sender
                .send(Message::Flush(tx))
                .map_err(|_| ReloadError::Closed)?;
        }
        rx.await.map_err(|_| ReloadError::Closed)
    }

    /// Flushes every kind.
    pub async fn flush_all(&self) -> ReloadResult<()> {
        for kind in ReloadKind::ALL {
            self.flush(kind).await?;
        }
        Ok(())
    }

    /// Delivery statistics of every subscription, by kind then registration.
    #[must_use]
    pub fn listener_statuses(&self) -> Vec<ListenerStatus> {
        ReloadKind::ALL
            .into_iter()
            .filter_map(|kind| self.inner.queues.get(&kind))
            .flat_map(|queue| {
                queue
                    .subscribers
                    .read()
                    .iter()
                    .map(|s| s.status.lock().clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Stops accepting events, delivers what is queued and stops the workers.
    pub async fn shutdown(&self) {
        let mut workers = Vec::new();
        for queue in self.inner.queues.values() {
            queue.sender.lock().take();
            if let Some(worker) = queue.worker.lock().take() {
                workers.push(worker);
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Reload worker ended abnormally");
            }
        }
        tracing::info!("Reload coordinator stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use jans_core::{ErrorKind, MetricsRegistry, NoopMetrics};
    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        name: String,
        seen: Mutex<Vec<u64>>,
        fail_on_call: Option<usize>,
        panic_on_call: Option<usize>,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Self::default()
            }
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl ReloadListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.panic_on_call == Some(call) {
                panic!("listener exploded");
            }
            if self.fail_on_call == Some(call) {
                return Err(ReloadError::apply(&self.name, "rejected"));
            }
            self.seen.lock().push(event.sequence);
            Ok(())
        }
    }

    fn coordinator() -> ReloadCoordinator {
        ReloadCoordinator::new(ConfigSnapshot::default(), Arc::new(NoopMetrics)).unwrap()
    }

    fn snapshot() -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot::default())
    }

    #[tokio::test]
    async fn delivers_in_order_exactly_once() {
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::named("scripts"));
        coordinator.subscribe(ReloadKind::Script, recorder.clone());

        let mut published = Vec::new();
        for _ in 0..50 {
            published.push(coordinator.publish(ReloadKind::Script, snapshot()).unwrap());
        }
        coordinator.flush(ReloadKind::Script).await.unwrap();

        assert_eq!(recorder.seen(), published);
        let status = &coordinator.listener_statuses()[0];
        assert_eq!(status.applied, 50);
        assert_eq!(status.last_sequence, published.last().copied());
    }

    #[tokio::test]
    async fn concurrent_publishers_keep_each_kind_ordered() {
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::named("ldap"));
        coordinator.subscribe(ReloadKind::LdapConfig, recorder.clone());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    coordinator
                        .publish(ReloadKind::LdapConfig, snapshot())
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        coordinator.flush(ReloadKind::LdapConfig).await.unwrap();

        let seen = recorder.seen();
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn kinds_do_not_block_each_other() {
        let coordinator = coordinator();
        let gate = Arc::new(Notify::new());
        let blocked = Arc::new(Recorder {
            name: "slow-ldap".to_string(),
            gate: Some(gate.clone()),
            ..Recorder::default()
        });
        let scripts = Arc::new(Recorder::named("scripts"));
        coordinator.subscribe(ReloadKind::LdapConfig, blocked.clone());
        coordinator.subscribe(ReloadKind::Script, scripts.clone());

        coordinator.publish(ReloadKind::LdapConfig, snapshot()).unwrap();
        let seq = coordinator.publish(ReloadKind::Script, snapshot()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), coordinator.flush(ReloadKind::Script))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scripts.seen(), [seq]);
        assert!(blocked.seen().is_empty());

        gate.notify_one();
        coordinator.flush(ReloadKind::LdapConfig).await.unwrap();
        assert_eq!(blocked.seen().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_recorded_without_retry() {
        let metrics = Arc::new(MetricsRegistry::new());
        let coordinator =
            ReloadCoordinator::new(ConfigSnapshot::default(), metrics.clone()).unwrap();
        let failing = Arc::new(Recorder {
            name: "cache".to_string(),
            fail_on_call: Some(1),
            ..Recorder::default()
        });
        let other = Arc::new(Recorder::named("cache-mirror"));
        coordinator.subscribe(ReloadKind::Cache, failing.clone());
        coordinator.subscribe(ReloadKind::Cache, other.clone());

        let first = coordinator.publish(ReloadKind::Cache, snapshot()).unwrap();
        let second = coordinator.publish(ReloadKind::Cache, snapshot()).unwrap();
        coordinator.flush(ReloadKind::Cache).await.unwrap();

        assert_eq!(failing.seen(), [second]);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
        assert_eq!(other.seen(), [first, second]);

        let status = &coordinator.listener_statuses()[0];
        assert_eq!(status.name, "cache");
        assert_eq!(status.failed, 1);
        assert_eq!(status.applied, 1);
        assert_eq!(status.last_error, None);
        assert_eq!(metrics.count(names::RELOAD_FAILED), 1);
        assert_eq!(metrics.count(names::RELOAD_APPLIED), 3);
    }

    #[tokio::test]
    async fn panicking_listener_is_contained() {
        let coordinator = coordinator();
        let listener = Arc::new(Recorder {
            name: "logger".to_string(),
            panic_on_call: Some(1),
            ..Recorder::default()
        });
        coordinator.subscribe(ReloadKind::Logger, listener.clone());

        coordinator.publish(ReloadKind::Logger, snapshot()).unwrap();
        let second = coordinator.publish(ReloadKind::Logger, snapshot()).unwrap();
        coordinator.flush(ReloadKind::Logger).await.unwrap();

        assert_eq!(listener.seen(), [second]);
        let status = &coordinator.listener_statuses()[0];
        assert_eq!(status.failed, 1);
    }

    #[tokio::test]
    async fn stale_sequences_are_skipped() {
        let subscription = Subscription::new(
            ReloadKind::Script,
            Arc::new(Recorder::named("scripts")),
        );
        let event = |sequence| ReloadEvent {
            kind: ReloadKind::Script,
            sequence,
            snapshot: snapshot(),
        };
        subscription.deliver(&event(5), &NoopMetrics).await;
        subscription.deliver(&event(3), &NoopMetrics).await;
        subscription.deliver(&event(5), &NoopMetrics).await;
        subscription.deliver(&event(6), &NoopMetrics).await;

        let status = subscription.status.lock().clone();
        assert_eq!(status.applied, 2);
        assert_eq!(status.skipped, 2);
        assert_eq!(status.last_sequence, Some(6));
    }

    #[tokio::test]
    async fn reconfigure_publishes_changed_kinds_only() {
        let coordinator = coordinator();
        let app = Arc::new(Recorder::named("app"));
        let ldap = Arc::new(Recorder::named("ldap"));
        coordinator.subscribe(ReloadKind::AppConfig, app.clone());
        coordinator.subscribe(ReloadKind::LdapConfig, ldap.clone());

        let mut next = ConfigSnapshot::default();
        next.lockout.max_failures = 3;
        let published = coordinator.reconfigure_all(next.clone()).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, ReloadKind::AppConfig);
        assert_eq!(coordinator.version(), 1);

        assert!(coordinator.reconfigure_all(next).unwrap().is_empty());
        coordinator.flush_all().await.unwrap();
        assert_eq!(app.seen().len(), 1);
        assert!(ldap.seen().is_empty());
        assert_eq!(coordinator.current().lockout.max_failures, 3);
    }

    #[tokio::test]
    async fn invalid_snapshot_is_rejected() {
        let coordinator = coordinator();
        let mut bad = ConfigSnapshot::default();
        bad.lockout.max_failures = 0;
        let err = coordinator.reconfigure_all(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(coordinator.version(), 0);
        assert_eq!(coordinator.current().lockout.max_failures, 5);
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes() {
        let coordinator = coordinator();
        let recorder = Arc::new(Recorder::named("scripts"));
        coordinator.subscribe(ReloadKind::Script, recorder.clone());
        coordinator.publish(ReloadKind::Script, snapshot()).unwrap();
        coordinator.publish(ReloadKind::Script, snapshot()).unwrap();

        coordinator.shutdown().await;
        assert_eq!(recorder.seen().len(), 2);
        assert!(matches!(
            coordinator.publish(ReloadKind::Script, snapshot()),
            Err(ReloadError::Closed)
        ));
        assert!(coordinator.flush(ReloadKind::Script).await.is_err());
    }

    #[test]
    fn requires_a_runtime() {
        let err = ReloadCoordinator::new(ConfigSnapshot::default(), Arc::new(NoopMetrics))
            .unwrap_err();
        assert!(matches!(err, ReloadError::NoRuntime));
    }
}
