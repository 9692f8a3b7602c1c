//! # jans-cache
//!
//! Cache facade for the Janssen authentication engine.
//!
//! The directory pool publishes endpoint health through the cache and scripts
//! use it for arbitrary lookup caching. A miss is never an error: lookups
//! return `None`.
//!
//! ## Providers
//!
//! - [`CacheProvider`] - Object-safe key/value operations on JSON values
//! - [`CacheExt`] - Typed helpers on top of any provider
//! - [`LocalCacheProvider`] - In-process TTL cache with bounded size
//!
//! ## Example
//!
//! ```ignore
//! use jans_cache::{CacheExt, LocalCacheProvider};
//! use std::time::Duration;
//!
//! let cache = LocalCacheProvider::default();
//! cache.put_as("user:alice", &profile, Some(Duration::from_secs(60)))?;
//! let cached: Option<Profile> = cache.get_as("user:alice");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod local;
pub mod provider;

pub use error::{CacheError, CacheResult};
pub use local::{CacheSettings, LocalCacheProvider};
pub use provider::{CacheExt, CacheProvider};
