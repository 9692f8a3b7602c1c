//! Password authentication: attempt protection around the script chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jans_auth::{AttemptLedger, AttemptPermit, Refusal};
use jans_core::metrics::names;
use jans_core::{AuditEvent, AuditEventType, MetricsSink};
use jans_script::{Decision, ExternalScriptContext, ScriptRuntime, ScriptType};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Hook invoked on person authentication scripts.
pub const AUTHENTICATE_METHOD: &str = "authenticate";

/// One login attempt.
#[derive(Clone, Default)]
pub struct AuthenticationRequest {
    /// Login name.
    pub principal: String,
    /// Presented password.
    pub credential: String,
    /// Extra request attributes visible to scripts.
    pub attributes: BTreeMap<String, String>,
    /// Correlation id; a fresh one is generated when absent.
    pub correlation_id: Option<Uuid>,
}

impl std::fmt::Debug for AuthenticationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationRequest")
            .field("principal", &self.principal)
            .field("credential", &"<redacted>")
            .field("attributes", &self.attributes)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl AuthenticationRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(principal: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            credential: credential.into(),
            ..Self::default()
        }
    }

    /// Adds a request attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Result of a login attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationOutcome {
    /// Credentials accepted. Carries the values scripts reported.
    Allowed {
        /// Script result map.
        attributes: Map<String, Value>,
    },
    /// Credentials rejected.
    Denied {
        /// Reason given by the deciding script.
        reason: String,
    },
    /// The principal is locked, either already or by this failure.
    Locked {
        /// Lockout expiry.
        until: DateTime<Utc>,
    },
    /// Attempts already in flight for the principal could lock it; this one
    /// was not evaluated and does not count.
    Throttled,
    /// No decision could be made; the attempt does not count as a failure.
    Unavailable {
        /// What was unavailable.
        reason: String,
    },
}

impl AuthenticationOutcome {
    /// Whether the attempt succeeded.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Runs login attempts.
#[derive(Debug, Clone)]
pub struct AuthenticationService {
    ledger: Arc<AttemptLedger>,
    runtime: ScriptRuntime,
    metrics: Arc<dyn MetricsSink>,
}

impl AuthenticationService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        ledger: Arc<AttemptLedger>,
        runtime: ScriptRuntime,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            ledger,
            runtime,
            metrics,
        }
    }

    /// Attempt ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<AttemptLedger> {
        &self.ledger
    }

    /// Authenticates one request.
    ///
    /// Locked principals are rejected before any script runs, and so is a
    /// lock set while the scripts ran. Backend unavailability is never
    /// recorded as a failure.
    pub async fn authenticate(&self, request: AuthenticationRequest) -> AuthenticationOutcome {
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::now_v7);
        let principal = request.principal.trim().to_string();
        if principal.is_empty() {
            return AuthenticationOutcome::Denied {
                reason: "missing principal".to_string(),
            };
        }

        let permit = match self.ledger.admit(&principal) {
            Ok(permit) => permit,
            Err(Refusal::Locked(until)) => return self.locked(&principal, correlation_id, until),
            Err(Refusal::Saturated) => {
                self.metrics.increment(names::AUTH_THROTTLED, &[]);
                tracing::debug!(principal = %principal, "attempt refused, threshold reserved");
                AuditEvent::builder(AuditEventType::LoginError)
                    .failure("too many attempts in flight")
                    .principal(&principal)
                    .correlation(correlation_id)
                    .detail("outcome", "throttled")
                    .emit();
                return AuthenticationOutcome::Throttled;
            }
        };

        if let Some(delay) = self.ledger.delay_hint(&principal) {
            tracing::debug!(principal = %principal, delay_ms = delay.as_millis() as u64, "delaying response");
            tokio::time::sleep(delay).await;
        }

        let mut ctx = ExternalScriptContext::new(self.runtime.services().clone())
            .with_correlation(correlation_id)
            .with_principal(&principal)
            .with_credential(request.credential);
        for (key, value) in request.attributes {
            ctx = ctx.with_attribute(key, value);
        }

        let invocation = self
            .runtime
            .invoke(ScriptType::PersonAuthentication, AUTHENTICATE_METHOD, &mut ctx)
            .await;
        let scripts = invocation
            .revisions()
            .iter()
            .map(|(name, rev)| format!("{name}@{rev}"))
            .collect::<Vec<_>>()
            .join(",");

        match invocation.decision {
            Decision::Allow => {
                if let Err(until) = permit.succeed() {
                    return self.locked(&principal, correlation_id, until);
                }
                AuditEvent::builder(AuditEventType::Login)
                    .success()
                    .principal(&principal)
                    .correlation(correlation_id)
                    .detail("scripts", scripts)
                    .emit();
                AuthenticationOutcome::Allowed {
                    attributes: ctx.into_result(),
                }
            }
            Decision::Deny { script, reason } => self.reject(
                permit,
                &principal,
                correlation_id,
                &scripts,
                Some(&script),
                reason,
            ),
            Decision::NoDecision => self.reject(
                permit,
                &principal,
                correlation_id,
                &scripts,
                None,
                "no authentication script".to_string(),
            ),
            Decision::Unavailable { script, reason } => {
                drop(permit);
                AuditEvent::builder(AuditEventType::LoginError)
                    .failure(&reason)
                    .principal(&principal)
                    .correlation(correlation_id)
                    .detail("script", script)
                    .detail("outcome", "unavailable")
                    .emit();
                AuthenticationOutcome::Unavailable { reason }
            }
        }
    }

    fn locked(
        &self,
        principal: &str,
        correlation_id: Uuid,
        until: DateTime<Utc>,
    ) -> AuthenticationOutcome {
        self.metrics.increment(names::AUTH_LOCKED_REJECT, &[]);
        AuditEvent::builder(AuditEventType::LockedLoginRejected)
            .failure("account locked")
            .principal(principal)
            .correlation(correlation_id)
            .detail("until", until.to_rfc3339())
            .emit();
        AuthenticationOutcome::Locked { until }
    }

    fn reject(
        &self,
        permit: AttemptPermit<'_>,
        principal: &str,
        correlation_id: Uuid,
        scripts: &str,
        script: Option<&str>,
        reason: String,
    ) -> AuthenticationOutcome {
        let locked = permit.fail();
        AuditEvent::builder(AuditEventType::LoginError)
            .failure(&reason)
            .principal(principal)
            .correlation(correlation_id)
            .detail("script", script.unwrap_or("-"))
            .detail("scripts", scripts)
            .emit();
        match locked {
            Some(until) => AuthenticationOutcome::Locked { until },
            None => AuthenticationOutcome::Denied { reason },
        }
    }
}
