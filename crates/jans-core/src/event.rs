//! Security audit events.
//!
//! Authentication outcomes, lockouts, script lifecycle changes and
//! configuration reloads are recorded as structured [`AuditEvent`]s and written
//! to the `jans::audit` tracing target.
//!
//! All events include:
//! - Timestamp (ISO 8601)
//! - Event type
//! - Principal (when available)
//! - Outcome (success/failure)
//! - Additional details

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    // Authentication events
    /// Authentication succeeded.
    Login,
    /// Authentication was denied.
    LoginError,
    /// A principal was locked out after repeated failures.
    AccountLocked,
    /// A request was rejected because the principal is locked.
    LockedLoginRejected,

    // Script lifecycle events
    /// A script revision became active.
    ScriptActivated,
    /// A script revision failed to load.
    ScriptLoadFailed,
    /// A script was disabled or removed.
    ScriptDeactivated,

    // Directory events
    /// A directory endpoint was marked degraded.
    EndpointDegraded,
    /// A degraded directory endpoint recovered.
    EndpointRecovered,

    // Configuration events
    /// A component applied a new configuration snapshot.
    ConfigurationReloaded,
    /// A component rejected a new configuration snapshot.
    ConfigurationReloadFailed,
    /// The engine finished its startup sequence.
    ApplicationInitialized,
}

/// Outcome of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Failure,
}

/// A security event for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub id: Uuid,

    /// Timestamp of the event (ISO 8601).
    pub timestamp: DateTime<Utc>,

    /// Type of event.
    pub event_type: AuditEventType,

    /// Outcome of the event.
    pub outcome: EventOutcome,

    /// Principal associated with the event.
    pub principal: Option<String>,

    /// Correlation ID of the request that caused the event.
    pub correlation_id: Option<Uuid>,

    /// Error message (for failure events).
    pub error: Option<String>,

    /// Additional details as key-value pairs.
    pub details: Vec<(String, String)>,
}

impl AuditEvent {
    /// Creates a new event builder.
    #[must_use]
    pub const fn builder(event_type: AuditEventType) -> AuditEventBuilder {
        AuditEventBuilder::new(event_type)
    }

    /// Writes the event to the audit log target.
    pub fn emit(&self) {
        let details = format_details(&self.details);
        match self.outcome {
            EventOutcome::Success => tracing::info!(
                target: "jans::audit",
                event_id = %self.id,
                event_type = ?self.event_type,
                principal = self.principal.as_deref().unwrap_or("-"),
                correlation_id = ?self.correlation_id,
                details = %details,
                "audit"
            ),
            EventOutcome::Failure => tracing::warn!(
                target: "jans::audit",
                event_id = %self.id,
                event_type = ?self.event_type,
                principal = self.principal.as_deref().unwrap_or("-"),
                correlation_id = ?self.correlation_id,
                error = self.error.as_deref().unwrap_or("-"),
                details = %details,
                "audit"
            ),
        }
    }
}

fn format_details(details: &[(String, String)]) -> String {
    details
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builder for creating events.
pub struct AuditEventBuilder {
    event_type: AuditEventType,
    outcome: EventOutcome,
    principal: Option<String>,
    correlation_id: Option<Uuid>,
    error: Option<String>,
    details: Vec<(String, String)>,
}

impl AuditEventBuilder {
    /// Creates a new event builder.
    #[must_use]
    pub const fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            outcome: EventOutcome::Success,
            principal: None,
            correlation_id: None,
            error: None,
            details: Vec::new(),
        }
    }

    /// Sets the outcome to success.
    #[must_use]
    pub const fn success(mut self) -> Self {
        self.outcome = EventOutcome::Success;
        self
    }

    /// Sets the outcome to failure with an error message.
    #[must_use]
    pub fn failure(mut self, error: impl Into<String>) -> Self {
        self.outcome = EventOutcome::Failure;
        self.error = Some(error.into());
        self
    }

    /// Sets the principal.
    #[must_use]
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Sets the correlation ID.
    #[must_use]
    pub const fn correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Adds a detail key-value pair.
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.push((key.into(), value.into()));
        self
    }

    /// Builds the event.
    #[must_use]
    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            event_type: self.event_type,
            outcome: self.outcome,
            principal: self.principal,
            correlation_id: self.correlation_id,
            error: self.error,
            details: self.details,
        }
    }

    /// Builds and emits the event.
    pub fn emit(self) {
        self.build().emit();
    }
}
