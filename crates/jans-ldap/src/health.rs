//! Endpoint health tracking.
//!
//! A failed endpoint is degraded for the pool's cooldown. It becomes a
//! candidate again when the cooldown elapses or a health probe succeeds.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::EndpointConfig;

/// Key under which endpoint health is mirrored into the cache.
#[must_use]
pub fn health_cache_key(pool: &str, url: &str) -> String {
    format!("directory:health:{pool}:{url}")
}

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// Endpoint URL.
    pub url: String,
    /// Configured priority.
    pub priority: u32,
    /// Whether the endpoint is currently a candidate.
    pub available: bool,
    /// End of the current cooldown.
    pub degraded_until: Option<DateTime<Utc>>,
    /// Transient failures since the last success.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
}

/// Broadcast when an endpoint becomes degraded or recovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatusEvent {
    /// Owning pool.
    pub pool: String,
    /// Endpoint URL.
    pub url: String,
    /// `false` when the endpoint was just degraded.
    pub available: bool,
    /// End of the cooldown for degraded endpoints.
    pub degraded_until: Option<DateTime<Utc>>,
    /// Failure that degraded the endpoint.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct EndpointState {
    degraded_until: Option<Instant>,
    degraded_until_wall: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl EndpointState {
    fn is_degraded(&self, now: Instant) -> bool {
        self.degraded_until.is_some_and(|until| now < until)
    }
}

/// Health state of every endpoint of one pool.
#[derive(Debug, Default)]
pub(crate) struct HealthTable {
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl HealthTable {
    /// Non-degraded endpoints, in the given (priority) order.
    pub(crate) fn candidates(&self, ordered: &[EndpointConfig]) -> Vec<EndpointConfig> {
        let now = Instant::now();
        let endpoints = self.endpoints.lock();
        ordered
            .iter()
            .filter(|e| !endpoints.get(&e.url).is_some_and(|s| s.is_degraded(now)))
            .cloned()
            .collect()
    }

    pub(crate) fn is_degraded(&self, url: &str) -> bool {
        let now = Instant::now();
        self.endpoints
            .lock()
            .get(url)
            .is_some_and(|s| s.is_degraded(now))
    }

    /// Endpoints with a recorded failure, including ones whose cooldown
    /// already elapsed but which have not succeeded since.
    pub(crate) fn failing(&self) -> Vec<String> {
        self.endpoints
            .lock()
            .iter()
            .filter(|(_, s)| s.degraded_until.is_some())
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Records a transient failure; returns the wall-clock end of the cooldown.
    pub(crate) fn mark_degraded(
        &self,
        url: &str,
        error: &str,
        cooldown: Duration,
    ) -> Option<DateTime<Utc>> {
        let wall = chrono::Duration::from_std(cooldown)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let mut endpoints = self.endpoints.lock();
        let state = endpoints.entry(url.to_string()).or_default();
        state.degraded_until = Some(Instant::now() + jans_core::time::bounded(cooldown));
        state.degraded_until_wall = wall;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());
        wall
    }

    /// Records a success; returns `true` if the endpoint was failing before.
    pub(crate) fn mark_healthy(&self, url: &str) -> bool {
        let mut endpoints = self.endpoints.lock();
        match endpoints.get_mut(url) {
            Some(state) if state.degraded_until.is_some() => {
                *state = EndpointState::default();
                true
            }
            _ => false,
        }
    }

    /// Forgets endpoints that are no longer configured.
    pub(crate) fn retain(&self, configured: &[EndpointConfig]) {
        self.endpoints
            .lock()
            .retain(|url, _| configured.iter().any(|e| &e.url == url));
    }

    pub(crate) fn status(&self, ordered: &[EndpointConfig]) -> Vec<EndpointStatus> {
        let now = Instant::now();
        let endpoints = self.endpoints.lock();
        ordered
            .iter()
            .map(|endpoint| {
                let state = endpoints.get(&endpoint.url).cloned().unwrap_or_default();
                let degraded = state.is_degraded(now);
                EndpointStatus {
                    url: endpoint.url.clone(),
                    priority: endpoint.priority,
                    available: !degraded,
                    degraded_until: if degraded {
                        state.degraded_until_wall
                    } else {
                        None
                    },
                    consecutive_failures: state.consecutive_failures,
                    last_error: state.last_error,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<EndpointConfig> {
        vec![
            EndpointConfig::new("ldaps://a:636", 1),
            EndpointConfig::new("ldaps://b:636", 2),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_endpoint_skipped_until_cooldown_elapses() {
        let table = HealthTable::default();
        let ordered = endpoints();

        table.mark_degraded("ldaps://a:636", "connection refused", Duration::from_secs(30));
        let urls: Vec<_> = table.candidates(&ordered).into_iter().map(|e| e.url).collect();
        assert_eq!(urls, ["ldaps://b:636"]);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(table.candidates(&ordered).len(), 2);
        assert_eq!(table.failing(), ["ldaps://a:636"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_cooldown_keeps_endpoint_degraded() {
        let table = HealthTable::default();
        table.mark_degraded("ldaps://a:636", "refused", Duration::MAX);
        table.mark_degraded("ldaps://b:636", "refused", Duration::from_secs(u64::MAX));

        tokio::time::advance(Duration::from_secs(365 * 86_400)).await;
        assert!(table.is_degraded("ldaps://a:636"));
        assert!(table.candidates(&endpoints()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_state() {
        let table = HealthTable::default();
        table.mark_degraded("ldaps://a:636", "timeout", Duration::from_secs(30));
        table.mark_degraded("ldaps://a:636", "timeout", Duration::from_secs(30));

        let status = table.status(&endpoints());
        assert!(!status[0].available);
        assert_eq!(status[0].consecutive_failures, 2);
        assert!(status[0].degraded_until.is_some());

        assert!(table.mark_healthy("ldaps://a:636"));
        assert!(!table.mark_healthy("ldaps://a:636"));
        assert!(!table.is_degraded("ldaps://a:636"));
        assert!(table.failing().is_empty());
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(
            health_cache_key("auth", "ldaps://a:636"),
            "directory:health:auth:ldaps://a:636"
        );
    }
}
