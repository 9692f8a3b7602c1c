//! Lockout policy and escalation.

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Computes the length of successive lockouts.
pub trait EscalationPolicy: Send + Sync + Debug {
    /// Duration of the `occurrence`-th lockout (1-based) within the rolling
    /// escalation period.
    ///
    /// Must be non-decreasing in `occurrence`.
    fn lockout_duration(&self, base: Duration, occurrence: u32) -> Duration;
}

/// Built-in escalation policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Escalation {
    /// Every lockout lasts the base duration.
    Fixed,
    /// Each lockout doubles the previous one, up to a cap.
    Doubling {
        /// Upper bound in seconds.
        max_lockout_secs: u64,
    },
    /// Each lockout adds a fixed step, up to a cap.
    Linear {
        /// Added per occurrence in seconds.
        step_secs: u64,
        /// Upper bound in seconds.
        max_lockout_secs: u64,
    },
}

impl Default for Escalation {
    fn default() -> Self {
        Self::Doubling {
            max_lockout_secs: 3_600,
        }
    }
}

impl Escalation {
    const fn cap(&self) -> Option<u64> {
        match self {
            Self::Fixed => None,
            Self::Doubling { max_lockout_secs } | Self::Linear { max_lockout_secs, .. } => {
                Some(*max_lockout_secs)
            }
        }
    }
}

impl EscalationPolicy for Escalation {
    fn lockout_duration(&self, base: Duration, occurrence: u32) -> Duration {
        let steps = occurrence.saturating_sub(1);
        let raw = match self {
            Self::Fixed => base,
            Self::Doubling { .. } => {
                let factor = 1u32.checked_shl(steps).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(Duration::MAX)
            }
            Self::Linear { step_secs, .. } => base.saturating_add(
                Duration::from_secs(*step_secs)
                    .checked_mul(steps)
                    .unwrap_or(Duration::MAX),
            ),
        };
        match self.cap() {
            Some(cap) => raw.min(Duration::from_secs(cap).max(base)),
            None => raw,
        }
    }
}

/// Lockout policy.
///
/// A principal is locked once `max_failures` failures fall inside
/// `failure_window_secs`. The K-th lockout inside `escalation_period_secs`
/// lasts `escalation.lockout_duration(base, K)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutPolicy {
    /// Whether failures are tracked at all.
    pub enabled: bool,
    /// Failures inside the window that trigger a lockout.
    pub max_failures: u32,
    /// Sliding failure window.
    pub failure_window_secs: u64,
    /// Duration of the first lockout.
    pub base_lockout_secs: u64,
    /// Growth of successive lockouts.
    pub escalation: Escalation,
    /// Rolling period over which lockouts escalate.
    pub escalation_period_secs: u64,
    /// Quiet period after which an unlocked record is purged.
    pub retention_secs: u64,
    /// Period of the background purge.
    pub purge_interval_secs: u64,
    /// Consecutive failures after which responses are delayed.
    pub delay_after_failures: u32,
    /// Suggested response delay. Zero disables delays.
    pub delay_ms: u64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            failure_window_secs: 60,
            base_lockout_secs: 30,
            escalation: Escalation::default(),
            escalation_period_secs: 86_400,
            retention_secs: 3_600,
            purge_interval_secs: 60,
            delay_after_failures: 3,
            delay_ms: 0,
        }
    }
}

impl LockoutPolicy {
    /// Failure window.
    #[must_use]
    pub const fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// First lockout duration.
    #[must_use]
    pub const fn base_lockout(&self) -> Duration {
        Duration::from_secs(self.base_lockout_secs)
    }

    /// Escalation period.
    #[must_use]
    pub const fn escalation_period(&self) -> Duration {
        Duration::from_secs(self.escalation_period_secs)
    }

    /// Record retention.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Purge period.
    #[must_use]
    pub const fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// Validates the policy.
    pub fn validate(&self) -> AuthResult<()> {
        if self.max_failures == 0 {
            return Err(AuthError::InvalidPolicy(
                "max_failures must be positive".to_string(),
            ));
        }
        if self.failure_window_secs == 0 {
            return Err(AuthError::InvalidPolicy(
                "failure_window_secs must be positive".to_string(),
            ));
        }
        if self.base_lockout_secs == 0 {
            return Err(AuthError::InvalidPolicy(
                "base_lockout_secs must be positive".to_string(),
            ));
        }
        if let Some(cap) = self.escalation.cap() {
            if cap < self.base_lockout_secs {
                return Err(AuthError::InvalidPolicy(
                    "max_lockout_secs cannot be below base_lockout_secs".to_string(),
                ));
            }
        }
        if self.purge_interval_secs == 0 {
            return Err(AuthError::InvalidPolicy(
                "purge_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
