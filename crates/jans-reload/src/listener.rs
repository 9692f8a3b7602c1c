//! Reload listeners.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ReloadResult;
use crate::event::{ReloadEvent, ReloadKind};

/// A component that applies configuration changes.
///
/// A failed `apply` leaves the component on its previous good
/// configuration. The event is not redelivered.
#[async_trait]
pub trait ReloadListener: Send + Sync {
    /// Name used in logs and statuses.
    fn name(&self) -> &str;

    /// Applies one event.
    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()>;
}

/// Delivery statistics of one listener subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStatus {
    /// Listener name.
    pub name: String,
    /// Subscribed kind.
    pub kind: ReloadKind,
    /// Newest sequence delivered, successfully or not.
    pub last_sequence: Option<u64>,
    /// Events applied.
    pub applied: u64,
    /// Events rejected.
    pub failed: u64,
    /// Events skipped as not newer than `last_sequence`.
    pub skipped: u64,
    /// Error of the latest rejected event.
    pub last_error: Option<String>,
}
