//! # jans-server
//!
//! Assembly of the Janssen authentication engine.
//!
//! This crate wires the components together:
//! - Directory pools, attempt ledger, script runtime and local cache
//! - Reload listeners that apply configuration sections to them
//! - Background workers for health checks, purges and metric reports
//! - The configuration file watcher and the password login front door
//!
//! ## Usage
//!
//! ```ignore
//! use jans_server::{Engine, AuthenticationRequest};
//!
//! let snapshot = jans_reload::ConfigSnapshot::load("jans.toml").await?;
//! let engine = Engine::builder(snapshot).start().await?;
//! let outcome = engine
//!     .authentication()
//!     .authenticate(AuthenticationRequest::new("alice", "secret"))
//!     .await;
//! engine.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod modules;
pub mod service;
pub mod tasks;
pub mod telemetry;
pub mod watcher;

pub use config::{LogFormatArg, ServerArgs};
pub use engine::{Engine, EngineBuilder, EngineStatus};
pub use error::{ServerError, ServerResult};
pub use modules::{DirectoryBindAuthenticator, DIRECTORY_BIND};
pub use service::{AuthenticationOutcome, AuthenticationRequest, AuthenticationService};
pub use telemetry::{LogHandle, LogLevelControl};
pub use watcher::ConfigWatcher;
