//! Cache provider traits.

use std::fmt::Debug;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::CacheResult;

/// Cache provider trait for key-value caching.
///
/// Implementations must be thread-safe and must not block beyond a short
/// critical section. Values are JSON so the trait stays object safe and can be
/// shared as `Arc<dyn CacheProvider>`.
pub trait CacheProvider: Send + Sync + Debug {
    /// Gets a value from the cache.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores a value with an optional TTL.
    ///
    /// If `ttl` is `None`, the provider's default TTL applies.
    fn put(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Deletes a value from the cache.
    ///
    /// Returns `true` if the key was present.
    fn delete(&self, key: &str) -> bool;

    /// Checks if a key exists in the cache.
    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// Typed helpers for any [`CacheProvider`].
pub trait CacheExt: CacheProvider {
    /// Gets and deserializes a value.
    ///
    /// A value that no longer deserializes into `T` is treated as a miss.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                tracing::debug!(key, error = %err, "cached value has unexpected shape");
                None
            }
        }
    }

    /// Serializes and stores a value.
    fn put_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let value = serde_json::to_value(value)?;
        self.put(key, value, ttl);
        Ok(())
    }
}

impl<C: CacheProvider + ?Sized> CacheExt for C {}
