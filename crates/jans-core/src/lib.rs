//! # jans-core
//!
//! Core utilities shared by every crate of the Janssen authentication engine.
//!
//! This crate provides the foundational types used across the directory pool,
//! the attempt protection ledger, the script runtime and the reload
//! coordinator.
//!
//! ## Contents
//!
//! - [`ErrorKind`] - The engine-wide error taxonomy
//! - [`MetricsSink`] - Fire-and-forget metrics facade
//! - [`SnapshotHandle`] - Versioned, atomically swapped immutable values
//! - [`AuditEvent`] - Structured security events
//! - [`LoggingConfig`] / [`MetricsConfig`] - Ambient configuration sections
//! - [`time::bounded`] - Overflow-safe deadline spans

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod snapshot;
pub mod time;

pub use config::{LogFormat, LoggingConfig, MetricsConfig};
pub use error::{Error, ErrorKind, Result};
pub use event::{AuditEvent, AuditEventType, EventOutcome};
pub use metrics::{LoggingMetrics, MetricSample, MetricsRegistry, MetricsSink, NoopMetrics};
pub use snapshot::{SnapshotHandle, Versioned};
