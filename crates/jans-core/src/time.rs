//! Duration helpers for deadlines built from configured values.

use std::time::Duration;

/// Longest span added to a monotonic instant. Roughly a century.
pub const MAX_SPAN: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Caps `duration` at [`MAX_SPAN`] so `now + duration` cannot overflow.
#[must_use]
pub fn bounded(duration: Duration) -> Duration {
    duration.min(MAX_SPAN)
}
