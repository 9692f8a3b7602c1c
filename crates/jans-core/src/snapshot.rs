//! Versioned immutable snapshots.
//!
//! Configuration is never mutated in place. A new value is built, wrapped in
//! an `Arc` and swapped into a [`SnapshotHandle`]; readers clone the `Arc` and
//! keep a consistent view for as long as they hold it.

use std::sync::Arc;

use parking_lot::RwLock;

/// An immutable value tagged with the version it was published under.
#[derive(Debug)]
pub struct Versioned<T> {
    /// Monotonically increasing version.
    pub version: u64,
    /// The value.
    pub value: Arc<T>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

/// Handle to the current version of an immutable value.
#[derive(Debug)]
pub struct SnapshotHandle<T> {
    current: RwLock<Versioned<T>>,
}

impl<T> SnapshotHandle<T> {
    /// Creates a handle holding `value` at version 0.
    pub fn new(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Creates a handle from an existing `Arc` at version 0.
    pub fn from_arc(value: Arc<T>) -> Self {
        Self {
            current: RwLock::new(Versioned { version: 0, value }),
        }
    }

    /// Returns the current value.
    #[must_use]
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read().value)
    }

    /// Returns the current value with its version.
    #[must_use]
    pub fn load_versioned(&self) -> Versioned<T> {
        self.current.read().clone()
    }

    /// Returns the current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Replaces the value, bumping the version. Returns the previous value.
    pub fn swap(&self, value: Arc<T>) -> Versioned<T> {
        let mut guard = self.current.write();
        let next = Versioned {
            version: guard.version + 1,
            value,
        };
        std::mem::replace(&mut *guard, next)
    }

    /// Replaces the value only if `version` is newer than the current one.
    ///
    /// Returns `false` and leaves the handle untouched for stale versions, so a
    /// component never regresses to an older snapshot.
    pub fn store_if_newer(&self, version: u64, value: Arc<T>) -> bool {
        let mut guard = self.current.write();
        if version <= guard.version {
            return false;
        }
        *guard = Versioned { version, value };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_bumps_version_and_returns_previous() {
        let handle = SnapshotHandle::new(1_u32);
        let previous = handle.swap(Arc::new(2));
        assert_eq!(*previous.value, 1);
        assert_eq!(previous.version, 0);
        assert_eq!(*handle.load(), 2);
        assert_eq!(handle.version(), 1);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let handle = SnapshotHandle::new(String::from("old"));
        let held = handle.load();
        handle.swap(Arc::new(String::from("new")));
        assert_eq!(held.as_str(), "old");
        assert_eq!(handle.load().as_str(), "new");
    }

    #[test]
    fn stale_versions_are_rejected() {
        let handle = SnapshotHandle::new(0_u32);
        assert!(handle.store_if_newer(5, Arc::new(5)));
        assert!(!handle.store_if_newer(3, Arc::new(3)));
        assert!(!handle.store_if_newer(5, Arc::new(6)));
        assert_eq!(*handle.load(), 5);
        assert_eq!(handle.load_versioned().version, 5);
    }
}
