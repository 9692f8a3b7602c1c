//! Periodic background workers.
//!
//! Every worker re-reads its period from the current snapshot before each
//! sleep, so interval changes take effect without a restart.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jans_auth::AttemptLedger;
use jans_cache::LocalCacheProvider;
use jans_core::metrics::names;
use jans_core::{MetricsRegistry, MetricsSink};
use jans_ldap::DirectoryPools;
use jans_reload::ReloadCoordinator;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Period of the directory health sweep. Each pool is probed only when its
/// own interval elapsed.
pub const HEALTH_TICK: Duration = Duration::from_secs(1);

const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Runs `work` every `period()` until `shutdown` flips or its sender drops.
pub fn spawn_periodic<P, F, Fut>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    period: P,
    work: F,
) -> JoinHandle<()>
where
    P: Fn() -> Duration + Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        tracing::debug!(worker = name, "background worker started");
        while !*shutdown.borrow() {
            let delay = period().max(MIN_PERIOD);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(delay) => work().await,
            }
        }
        tracing::debug!(worker = name, "background worker stopped");
    })
}

/// Components the workers operate on.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Configuration source for periods.
    pub coordinator: ReloadCoordinator,
    /// Directory pools.
    pub pools: Arc<DirectoryPools>,
    /// Attempt ledger.
    pub ledger: Arc<AttemptLedger>,
    /// Local cache.
    pub cache: Arc<LocalCacheProvider>,
    /// Aggregated metrics.
    pub metrics: Arc<MetricsRegistry>,
}

/// Spawns the health, purge, cache cleaner and metric reporter workers.
pub fn spawn_all(ctx: &WorkerContext, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let health = {
        let pools = Arc::clone(&ctx.pools);
        spawn_periodic("directory-health", shutdown.clone(), || HEALTH_TICK, move || {
            let pools = Arc::clone(&pools);
            async move {
                let checked = pools.check_health_due().await;
                if checked > 0 {
                    tracing::trace!(checked, "directory health checked");
                }
            }
        })
    };

    let purge = {
        let coordinator = ctx.coordinator.clone();
        let ledger = Arc::clone(&ctx.ledger);
        spawn_periodic(
            "attempt-purge",
            shutdown.clone(),
            move || coordinator.current().lockout.purge_interval(),
            move || {
                ledger.purge_expired();
                async {}
            },
        )
    };

    let cleaner = {
        let coordinator = ctx.coordinator.clone();
        let cache = Arc::clone(&ctx.cache);
        let metrics = Arc::clone(&ctx.metrics);
        spawn_periodic(
            "cache-cleaner",
            shutdown.clone(),
            move || coordinator.current().cache.cleaner_interval(),
            move || {
                let evicted = cache.purge_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "expired cache entries removed");
                    metrics.emit(names::CACHE_EVICTED, evicted as f64, &[]);
                }
                async {}
            },
        )
    };

    let reporter = {
        let period_source = ctx.coordinator.clone();
        let coordinator = ctx.coordinator.clone();
        let metrics = Arc::clone(&ctx.metrics);
        spawn_periodic(
            "metric-reporter",
            shutdown.clone(),
            move || period_source.current().metrics.report_interval(),
            move || {
                if coordinator.current().metrics.report_enabled {
                    report(&metrics);
                }
                async {}
            },
        )
    };

    vec![health, purge, cleaner, reporter]
}

/// Writes every aggregated series to the log.
pub fn report(metrics: &MetricsRegistry) -> usize {
    let samples = metrics.snapshot();
    for sample in &samples {
        let tags = sample
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            target: "jans::metrics",
            metric = %sample.name,
            tags = %tags,
            count = sample.count,
            sum = sample.sum,
            last = sample.last,
            "metric"
        );
    }
    samples.len()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_worker_runs_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic(
            "test",
            rx,
            || Duration::from_secs(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn period_is_reread_each_cycle() {
        let (tx, rx) = watch::channel(false);
        let period = Arc::new(parking_lot::Mutex::new(Duration::from_secs(10)));
        let runs = Arc::new(AtomicUsize::new(0));
        let (p, counter) = (Arc::clone(&period), Arc::clone(&runs));
        let handle = spawn_periodic("test", rx, move || *p.lock(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        *period.lock() = Duration::from_secs(1);
        // The sleep already in progress still uses the old period.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(runs.load(Ordering::SeqCst) >= 3);

        drop(tx);
        handle.await.unwrap();
    }

    #[test]
    fn report_counts_series() {
        let metrics = MetricsRegistry::new();
        metrics.increment(names::AUTH_FAILURE, &[]);
        metrics.increment(names::POOL_ACQUIRED, &[("pool", "auth")]);
        assert_eq!(report(&metrics), 2);
    }
}
