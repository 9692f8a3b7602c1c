//! # jans-auth
//!
//! Authentication attempt protection for the Janssen authentication engine.
//!
//! The [`AttemptLedger`] tracks recent failures per principal and decides
//! when a principal is locked out. Successive lockouts inside a rolling
//! period grow according to a pluggable [`EscalationPolicy`].
//!
//! ## NIST 800-53 Rev5 Controls
//!
//! - AC-7: Unsuccessful Logon Attempts
//!
//! ## Example
//!
//! ```ignore
//! use jans_auth::{AttemptLedger, LockoutPolicy};
//!
//! let ledger = AttemptLedger::new(LockoutPolicy::default())?;
//! if let Some(until) = ledger.record_failure("alice") {
//!     tracing::info!(%until, "alice is locked");
//! }
//! ledger.record_success("alice");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod lockout;
pub mod policy;

pub use error::{AuthError, AuthResult};
pub use lockout::{AttemptLedger, AttemptPermit, AttemptSnapshot, Refusal};
pub use policy::{Escalation, EscalationPolicy, LockoutPolicy};
