//! Metrics facade.
//!
//! Components report counters and timers through [`MetricsSink`]. Emission is
//! fire-and-forget: implementations must never block or fail the caller.
//!
//! ```ignore
//! use jans_core::metrics::{names, MetricsSink};
//!
//! sink.increment(names::POOL_EXHAUSTED, &[("pool", "auth")]);
//! sink.timing(names::SCRIPT_INVOCATION, elapsed, &[("script", "basic")]);
//! ```

use std::fmt::Debug;
use std::time::Duration;

use dashmap::DashMap;

/// Metric names emitted by the engine.
pub mod names {
    /// A lease was handed out.
    pub const POOL_ACQUIRED: &str = "directory.pool.acquired";
    /// An acquire timed out waiting for a free lease.
    pub const POOL_EXHAUSTED: &str = "directory.pool.exhausted";
    /// Time spent waiting in `acquire`.
    pub const POOL_ACQUIRE_WAIT: &str = "directory.pool.acquire_wait_ms";
    /// A new backend connection was opened.
    pub const POOL_CONNECTION_OPENED: &str = "directory.pool.connection_opened";
    /// A connection was closed instead of being recycled.
    pub const POOL_CONNECTION_DISCARDED: &str = "directory.pool.connection_discarded";
    /// An endpoint was marked degraded.
    pub const ENDPOINT_DEGRADED: &str = "directory.endpoint.degraded";
    /// A degraded endpoint recovered.
    pub const ENDPOINT_RECOVERED: &str = "directory.endpoint.recovered";
    /// Every candidate endpoint failed.
    pub const BACKEND_UNAVAILABLE: &str = "directory.backend_unavailable";

    /// A failed authentication attempt was recorded.
    pub const AUTH_FAILURE: &str = "auth.attempt.failure";
    /// A principal was locked out.
    pub const AUTH_LOCKOUT: &str = "auth.attempt.lockout";
    /// A request was rejected because the principal is locked.
    pub const AUTH_LOCKED_REJECT: &str = "auth.attempt.locked_reject";
    /// A request was refused because enough attempts were already in flight.
    pub const AUTH_THROTTLED: &str = "auth.attempt.throttled";
    /// Ledger records removed by the purge task.
    pub const AUTH_RECORDS_PURGED: &str = "auth.attempt.purged";

    /// A script revision became active.
    pub const SCRIPT_LOADED: &str = "script.loaded";
    /// A script revision failed to load.
    pub const SCRIPT_LOAD_FAILED: &str = "script.load_failed";
    /// Script invocation latency.
    pub const SCRIPT_INVOCATION: &str = "script.invocation_ms";
    /// A script invocation failed and was contained.
    pub const SCRIPT_INVOCATION_FAILED: &str = "script.invocation_failed";

    /// A reload event was published.
    pub const RELOAD_PUBLISHED: &str = "reload.published";
    /// A listener applied a reload event.
    pub const RELOAD_APPLIED: &str = "reload.applied";
    /// A listener rejected a reload event.
    pub const RELOAD_FAILED: &str = "reload.failed";

    /// Cache entries removed by the cleaner.
    pub const CACHE_EVICTED: &str = "cache.evicted";
}

/// Sink for counters and timers.
pub trait MetricsSink: Send + Sync + Debug {
    /// Emits a value for the named metric.
    fn emit(&self, name: &str, value: f64, tags: &[(&str, &str)]);

    /// Increments a counter by one.
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.emit(name, 1.0, tags);
    }

    /// Emits a duration in milliseconds.
    fn timing(&self, name: &str, elapsed: Duration, tags: &[(&str, &str)]) {
        self.emit(name, elapsed.as_secs_f64() * 1000.0, tags);
    }
}

/// Metrics sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn emit(&self, _name: &str, _value: f64, _tags: &[(&str, &str)]) {}
}

/// Metrics sink that writes every sample as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMetrics;

impl MetricsSink for LoggingMetrics {
    fn emit(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        tracing::debug!(target: "jans::metrics", metric = name, value, tags = ?tags);
    }
}

/// Aggregated view of one metric series.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,
    /// Sorted tag pairs identifying the series.
    pub tags: Vec<(String, String)>,
    /// Number of emitted values.
    pub count: u64,
    /// Sum of emitted values.
    pub sum: f64,
    /// Last emitted value.
    pub last: f64,
}

#[derive(Debug, Clone, Default)]
struct Aggregate {
    count: u64,
    sum: f64,
    last: f64,
}

/// In-memory aggregating metrics sink.
///
/// Series are keyed by name and sorted tags. Used by the periodic reporter
/// and by tests that assert on emitted metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    series: DashMap<(String, Vec<(String, String)>), Aggregate>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of values emitted for `name` across all tag sets.
    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        self.series
            .iter()
            .filter(|entry| entry.key().0 == name)
            .map(|entry| entry.value().count)
            .sum()
    }

    /// Returns the sum of values emitted for `name` across all tag sets.
    #[must_use]
    pub fn sum(&self, name: &str) -> f64 {
        self.series
            .iter()
            .filter(|entry| entry.key().0 == name)
            .map(|entry| entry.value().sum)
            .sum()
    }

    /// Returns every series, sorted by name then tags.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .series
            .iter()
            .map(|entry| {
                let (name, tags) = entry.key().clone();
                let agg = entry.value();
                MetricSample {
                    name,
                    tags,
                    count: agg.count,
                    sum: agg.sum,
                    last: agg.last,
                }
            })
            .collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        samples
    }

    /// Removes every series.
    pub fn reset(&self) {
        self.series.clear();
    }
}

impl MetricsSink for MetricsRegistry {
    fn emit(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let mut owned: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        owned.sort();

        let mut agg = self.series.entry((name.to_string(), owned)).or_default();
        agg.count += 1;
        agg.sum += value;
        agg.last = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_aggregates_by_series() {
        let registry = MetricsRegistry::new();
        registry.increment(names::POOL_ACQUIRED, &[("pool", "auth")]);
        registry.increment(names::POOL_ACQUIRED, &[("pool", "auth")]);
        registry.increment(names::POOL_ACQUIRED, &[("pool", "general")]);
        registry.emit(names::POOL_ACQUIRE_WAIT, 4.0, &[]);
        registry.emit(names::POOL_ACQUIRE_WAIT, 6.0, &[]);

        assert_eq!(registry.count(names::POOL_ACQUIRED), 3);
        assert_eq!(registry.count(names::POOL_EXHAUSTED), 0);
        assert!((registry.sum(names::POOL_ACQUIRE_WAIT) - 10.0).abs() < f64::EPSILON);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        let auth = snapshot
            .iter()
            .find(|s| s.name == names::POOL_ACQUIRED && s.tags == vec![("pool".into(), "auth".into())])
            .unwrap();
        assert_eq!(auth.count, 2);
    }

    #[test]
    fn tag_order_does_not_split_series() {
        let registry = MetricsRegistry::new();
        registry.increment("x", &[("a", "1"), ("b", "2")]);
        registry.increment("x", &[("b", "2"), ("a", "1")]);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn timing_is_reported_in_millis() {
        let registry = MetricsRegistry::new();
        registry.timing("t", Duration::from_millis(250), &[]);
        assert!((registry.sum("t") - 250.0).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_series() {
        let registry = MetricsRegistry::new();
        registry.increment("x", &[]);
        registry.reset();
        assert!(registry.snapshot().is_empty());
    }
}
