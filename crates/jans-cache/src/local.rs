//! In-process cache provider.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{CacheError, CacheResult};
use crate::provider::CacheProvider;

/// Settings for [`LocalCacheProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL applied when `put` is called without one.
    pub default_ttl_secs: u64,
    /// Upper bound on stored entries.
    pub max_entries: usize,
    /// Period of the background expiry sweep.
    pub cleaner_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_entries: 10_000,
            cleaner_interval_secs: 60,
        }
    }
}

impl CacheSettings {
    /// Returns the default entry TTL.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Returns the cleaner period.
    #[must_use]
    pub const fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_interval_secs)
    }

    /// Validates the settings.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Configuration(
                "cache.max_entries must be positive".to_string(),
            ));
        }
        if self.default_ttl_secs == 0 {
            return Err(CacheError::Configuration(
                "cache.default_ttl_secs must be positive".to_string(),
            ));
        }
        if self.cleaner_interval_secs == 0 {
            return Err(CacheError::Configuration(
                "cache.cleaner_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    inserted_at: Instant,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// TTL cache held in process memory.
///
/// Expired entries are invisible to readers immediately and are physically
/// removed by [`purge_expired`](Self::purge_expired) or when the cache is full.
#[derive(Debug)]
pub struct LocalCacheProvider {
    entries: DashMap<String, Entry>,
    settings: RwLock<CacheSettings>,
}

impl Default for LocalCacheProvider {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}

impl LocalCacheProvider {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            settings: RwLock::new(settings),
        }
    }

    /// Returns the current settings.
    #[must_use]
    pub fn settings(&self) -> CacheSettings {
        self.settings.read().clone()
    }

    /// Applies new settings.
    ///
    /// Existing entries keep their expiry. Shrinking `max_entries` evicts the
    /// oldest entries until the cache fits.
    pub fn reconfigure(&self, settings: CacheSettings) -> CacheResult<()> {
        settings.validate()?;
        let max_entries = settings.max_entries;
        *self.settings.write() = settings;
        while self.entries.len() > max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
        tracing::debug!(max_entries, "cache settings applied");
        Ok(())
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());
        match oldest {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    fn make_room(&self, max_entries: usize) {
        if self.entries.len() < max_entries {
            return;
        }
        let purged = self.purge_expired();
        if purged > 0 {
            tracing::trace!(purged, "expired entries purged to make room");
        }
        while self.entries.len() >= max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
    }
}

impl CacheProvider for LocalCacheProvider {
    fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let (default_ttl, max_entries) = {
            let settings = self.settings.read();
            (settings.default_ttl(), settings.max_entries)
        };
        if !self.entries.contains_key(key) {
            self.make_room(max_entries);
        }
        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                inserted_at: now,
                expires_at: now + jans_core::time::bounded(ttl.unwrap_or(default_ttl)),
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}
