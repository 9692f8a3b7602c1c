//! # jans-reload
//!
//! Configuration snapshots and reload delivery for the Janssen
//! authentication engine.
//!
//! A [`ConfigSnapshot`] is parsed from TOML, validated and swapped in as a
//! whole. The [`ReloadCoordinator`] compares it with the previous snapshot and
//! publishes one [`ReloadEvent`] per changed [`ReloadKind`]. Each kind is
//! delivered by its own worker, in order and exactly once per listener.
//!
//! ## Example
//!
//! ```ignore
//! use jans_reload::{ConfigSnapshot, ReloadCoordinator, ReloadKind};
//!
//! let coordinator = ReloadCoordinator::new(ConfigSnapshot::load("jans.toml").await?, metrics)?;
//! coordinator.subscribe(ReloadKind::LdapConfig, Arc::new(DirectoryReloadListener::new(pools)));
//! coordinator.reconfigure_all(ConfigSnapshot::load("jans.toml").await?)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod coordinator;
pub mod diff;
pub mod error;
pub mod event;
pub mod listener;
pub mod snapshot;

pub use coordinator::ReloadCoordinator;
pub use diff::changed_kinds;
pub use error::{ReloadError, ReloadResult};
pub use event::{ReloadEvent, ReloadKind};
pub use listener::{ListenerStatus, ReloadListener};
pub use snapshot::ConfigSnapshot;
