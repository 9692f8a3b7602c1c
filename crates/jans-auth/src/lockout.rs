//! Attempt protection ledger.
//!
//! Failures are tracked per principal. Every mutation of one principal's
//! record happens under that principal's map entry lock, so concurrent
//! failures for the same principal are counted exactly. Duration math uses
//! the monotonic clock; reported times are wall-clock.
//!
//! Login paths go through [`AttemptLedger::admit`]. An admitted attempt holds
//! a reservation against the failure threshold until it reports its outcome,
//! so concurrent guesses never exceed the failures a principal has left.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jans_core::metrics::names;
use jans_core::{AuditEvent, AuditEventType, MetricsSink, NoopMetrics, SnapshotHandle};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::AuthResult;
use crate::policy::{EscalationPolicy, LockoutPolicy};

/// Public view of one principal's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    /// Principal identifier.
    pub principal: String,
    /// Failures inside the current window.
    pub failures_in_window: usize,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Active lockout expiry.
    pub locked_until: Option<DateTime<Utc>>,
    /// Lockouts inside the escalation period.
    pub lockouts_in_period: usize,
    /// Time of the most recent failure.
    pub last_failure: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    failures: VecDeque<Instant>,
    consecutive_failures: u32,
    locked_until: Option<(Instant, DateTime<Utc>)>,
    lockouts: VecDeque<Instant>,
    last_failure: Instant,
    last_failure_wall: DateTime<Utc>,
    pending: u32,
}

impl AttemptRecord {
    fn new(now: Instant) -> Self {
        Self {
            failures: VecDeque::new(),
            consecutive_failures: 0,
            locked_until: None,
            lockouts: VecDeque::new(),
            last_failure: now,
            last_failure_wall: Utc::now(),
            pending: 0,
        }
    }

    fn release(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Holds nothing worth keeping.
    fn is_idle(&self) -> bool {
        self.pending == 0
            && self.failures.is_empty()
            && self.lockouts.is_empty()
            && self.locked_until.is_none()
            && self.consecutive_failures == 0
    }

    fn active_lock(&self, now: Instant) -> Option<DateTime<Utc>> {
        self.locked_until
            .and_then(|(until, wall)| (now < until).then_some(wall))
    }

    fn prune(&mut self, now: Instant, policy: &LockoutPolicy) {
        let window = policy.failure_window();
        while self
            .failures
            .front()
            .is_some_and(|stamp| now.duration_since(*stamp) >= window)
        {
            self.failures.pop_front();
        }
        let period = policy.escalation_period();
        while self
            .lockouts
            .front()
            .is_some_and(|stamp| now.duration_since(*stamp) >= period)
        {
            self.lockouts.pop_front();
        }
        if self.locked_until.is_some_and(|(until, _)| now >= until) {
            self.locked_until = None;
        }
    }

    fn is_purgeable(&self, now: Instant, retention: Duration) -> bool {
        self.pending == 0
            && self.active_lock(now).is_none()
            && now.duration_since(self.last_failure) >= retention
    }
}

/// Why [`AttemptLedger::admit`] turned an attempt away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The principal is locked until the given time.
    Locked(DateTime<Utc>),
    /// Every failure the principal has left is already reserved by an
    /// attempt in flight.
    Saturated,
}

/// Reservation held by an admitted attempt.
///
/// Consumed by [`Self::fail`] or [`Self::succeed`]. Dropping it releases the
/// reservation without recording anything.
#[derive(Debug)]
#[must_use = "an attempt reports its outcome or releases its reservation"]
pub struct AttemptPermit<'a> {
    ledger: &'a AttemptLedger,
    principal: String,
    reserved: bool,
}

impl AttemptPermit<'_> {
    /// Records the attempt as failed. Returns the lock expiry if the
    /// principal is locked afterwards.
    pub fn fail(mut self) -> Option<DateTime<Utc>> {
        let reserved = std::mem::take(&mut self.reserved);
        self.ledger.apply_failure(&self.principal, reserved)
    }

    /// Records the attempt as successful.
    ///
    /// A lock set while this attempt was in flight wins: the lock is kept
    /// and its expiry returned.
    pub fn succeed(mut self) -> Result<(), DateTime<Utc>> {
        let reserved = std::mem::take(&mut self.reserved);
        self.ledger.apply_success(&self.principal, reserved, true)
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        if self.reserved {
            self.ledger.release(&self.principal);
        }
    }
}

fn wall_after(duration: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Ledger of recent authentication failures per principal.
#[derive(Debug)]
pub struct AttemptLedger {
    records: DashMap<String, AttemptRecord>,
    policy: SnapshotHandle<LockoutPolicy>,
    escalation: Option<Arc<dyn EscalationPolicy>>,
    metrics: Arc<dyn MetricsSink>,
}

impl AttemptLedger {
    /// Creates a ledger enforcing `policy`.
    pub fn new(policy: LockoutPolicy) -> AuthResult<Self> {
        policy.validate()?;
        Ok(Self {
            records: DashMap::new(),
            policy: SnapshotHandle::new(policy),
            escalation: None,
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replaces the configured escalation with a custom growth function.
    #[must_use]
    pub fn with_escalation(mut self, escalation: Arc<dyn EscalationPolicy>) -> Self {
        self.escalation = Some(escalation);
        self
    }

    /// Current policy.
    #[must_use]
    pub fn policy(&self) -> Arc<LockoutPolicy> {
        self.policy.load()
    }

    /// Swaps the policy. Existing records are evaluated under the new policy
    /// from their next update on.
    pub fn update_policy(&self, policy: LockoutPolicy) -> AuthResult<()> {
        policy.validate()?;
        tracing::info!(
            max_failures = policy.max_failures,
            failure_window_secs = policy.failure_window_secs,
            base_lockout_secs = policy.base_lockout_secs,
            "lockout policy updated"
        );
        self.policy.swap(Arc::new(policy));
        Ok(())
    }

    fn lockout_duration(&self, policy: &LockoutPolicy, occurrence: u32) -> Duration {
        match &self.escalation {
            Some(custom) => custom.lockout_duration(policy.base_lockout(), occurrence),
            None => policy
                .escalation
                .lockout_duration(policy.base_lockout(), occurrence),
        }
    }

    /// Admits an attempt for `principal`.
    ///
    /// Refused while the principal is locked, and while failures inside the
    /// window plus attempts in flight already reach the threshold.
    pub fn admit(&self, principal: &str) -> Result<AttemptPermit<'_>, Refusal> {
        let policy = self.policy.load();
        let mut permit = AttemptPermit {
            ledger: self,
            principal: principal.to_string(),
            reserved: false,
        };
        if !policy.enabled {
            return Ok(permit);
        }
        let now = Instant::now();

        let mut entry = self
            .records
            .entry(principal.to_string())
            .or_insert_with(|| AttemptRecord::new(now));
        let record = entry.value_mut();
        if let Some(until) = record.active_lock(now) {
            return Err(Refusal::Locked(until));
        }
        record.prune(now, &policy);
        let in_use = record.failures.len() + record.pending as usize;
        if in_use >= policy.max_failures as usize {
            return Err(Refusal::Saturated);
        }
        record.pending += 1;
        permit.reserved = true;
        Ok(permit)
    }

    fn release(&self, principal: &str) {
        let idle = match self.records.get_mut(principal) {
            Some(mut record) => {
                record.release();
                record.is_idle()
            }
            None => return,
        };
        if idle {
            self.records.remove_if(principal, |_, r| r.is_idle());
        }
    }

    /// Records a failed attempt.
    ///
    /// Returns the lock expiry if the principal is locked after this call:
    /// either the existing lock, or a new one when the failures inside the
    /// window reach the threshold.
    pub fn record_failure(&self, principal: &str) -> Option<DateTime<Utc>> {
        self.apply_failure(principal, false)
    }

    fn apply_failure(&self, principal: &str, reserved: bool) -> Option<DateTime<Utc>> {
        let policy = self.policy.load();
        if !policy.enabled {
            if reserved {
                self.release(principal);
            }
            return None;
        }
        let now = Instant::now();

        let mut entry = self
            .records
            .entry(principal.to_string())
            .or_insert_with(|| AttemptRecord::new(now));
        let record = entry.value_mut();
        if reserved {
            record.release();
        }
        record.last_failure = now;
        record.last_failure_wall = Utc::now();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);

        if let Some(until) = record.active_lock(now) {
            return Some(until);
        }

        record.prune(now, &policy);
        record.failures.push_back(now);
        let threshold = policy.max_failures as usize;
        while record.failures.len() > threshold {
            record.failures.pop_front();
        }

        if record.failures.len() < threshold {
            drop(entry);
            self.metrics.increment(names::AUTH_FAILURE, &[]);
            return None;
        }

        record.lockouts.push_back(now);
        let occurrence = u32::try_from(record.lockouts.len()).unwrap_or(u32::MAX);
        let duration = self.lockout_duration(&policy, occurrence);
        let until_wall = wall_after(duration);
        record.locked_until = Some((now + jans_core::time::bounded(duration), until_wall));
        let consecutive = record.consecutive_failures;
        drop(entry);

        self.metrics.increment(names::AUTH_FAILURE, &[]);
        self.metrics.increment(names::AUTH_LOCKOUT, &[]);
        tracing::warn!(
            principal,
            occurrence,
            lockout_secs = duration.as_secs(),
            consecutive,
            "principal locked out"
        );
        AuditEvent::builder(AuditEventType::AccountLocked)
            .failure("too many failed attempts")
            .principal(principal)
            .detail("occurrence", occurrence.to_string())
            .detail("locked_until", until_wall.to_rfc3339())
            .emit();
        Some(until_wall)
    }

    /// Records a successful attempt.
    ///
    /// Clears failures and any lock. Lockout history is kept for escalation
    /// until it leaves the escalation period.
    pub fn record_success(&self, principal: &str) {
        let _ = self.apply_success(principal, false, false);
    }

    fn apply_success(
        &self,
        principal: &str,
        reserved: bool,
        respect_lock: bool,
    ) -> Result<(), DateTime<Utc>> {
        let now = Instant::now();
        let idle = match self.records.get_mut(principal) {
            Some(mut record) => {
                if reserved {
                    record.release();
                }
                if respect_lock {
                    if let Some(until) = record.active_lock(now) {
                        return Err(until);
                    }
                }
                record.failures.clear();
                record.consecutive_failures = 0;
                record.locked_until = None;
                record.is_idle()
            }
            None => return Ok(()),
        };
        if idle {
            self.records.remove_if(principal, |_, r| r.is_idle());
        }
        Ok(())
    }

    /// Whether the principal is currently locked.
    #[must_use]
    pub fn is_locked(&self, principal: &str) -> bool {
        self.locked_until(principal).is_some()
    }

    /// Expiry of the principal's active lock.
    #[must_use]
    pub fn locked_until(&self, principal: &str) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        self.records
            .get(principal)
            .and_then(|record| record.active_lock(now))
    }

    /// Suggested response delay for the principal's next attempt.
    #[must_use]
    pub fn delay_hint(&self, principal: &str) -> Option<Duration> {
        let policy = self.policy.load();
        if !policy.enabled || policy.delay_ms == 0 {
            return None;
        }
        let consecutive = self.records.get(principal)?.consecutive_failures;
        (consecutive >= policy.delay_after_failures && consecutive > 0)
            .then(|| Duration::from_millis(policy.delay_ms))
    }

    /// Public view of a principal's record.
    #[must_use]
    pub fn snapshot(&self, principal: &str) -> Option<AttemptSnapshot> {
        let policy = self.policy.load();
        let now = Instant::now();
        let record = self.records.get(principal)?;
        let window = policy.failure_window();
        let period = policy.escalation_period();
        Some(AttemptSnapshot {
            principal: principal.to_string(),
            failures_in_window: record
                .failures
                .iter()
                .filter(|s| now.duration_since(**s) < window)
                .count(),
            consecutive_failures: record.consecutive_failures,
            locked_until: record.active_lock(now),
            lockouts_in_period: record
                .lockouts
                .iter()
                .filter(|s| now.duration_since(**s) < period)
                .count(),
            last_failure: record.last_failure_wall,
        })
    }

    /// Removes unlocked records with no failure inside the retention window.
    ///
    /// Keys are collected first and removed one by one with a re-check, so
    /// login-path calls only ever wait for a single entry.
    pub fn purge_expired(&self) -> usize {
        let retention = self.policy.load().retention();
        let now = Instant::now();
        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_purgeable(now, retention))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            if self
                .records
                .remove_if(&key, |_, record| record.is_purgeable(now, retention))
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "purged attempt records");
            self.metrics
                .emit(names::AUTH_RECORDS_PURGED, removed as f64, &[]);
        }
        removed
    }

    /// Number of tracked principals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no principal is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
