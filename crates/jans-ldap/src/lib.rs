//! # jans-ldap
//!
//! Directory connectivity for the Janssen authentication engine.
//!
//! This crate owns named pools of service-bound LDAPS connections. Each pool
//! tries its endpoints in priority order, degrades failing endpoints for a
//! cooldown and recovers them through periodic health probes.
//!
//! ## Security
//!
//! **CRITICAL**: This crate ONLY supports LDAPS (LDAP over TLS).
//! - STARTTLS is NOT supported (vulnerable to downgrade attacks)
//! - Plain LDAP is NOT supported (transmits credentials in cleartext)
//!
//! ## Example
//!
//! ```ignore
//! use jans_ldap::{DirectoryPools, Ldap3Connector, PoolRole, PoolServices};
//!
//! let pools = DirectoryPools::new(&config, Arc::new(Ldap3Connector::new()), PoolServices::default())?;
//! let mut conn = pools.primary(PoolRole::General)?.acquire().await?;
//! let entries = conn.search("ou=people,o=jans", SearchScope::Subtree, "(uid=alice)", &["mail"]).await;
//! conn.release(entries.is_ok()).await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod pool;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    ldap_escape, BindCredentials, ConnectionPoolDescriptor, ConnectionPoolDescriptorBuilder,
    DirectoryConfig, EndpointConfig, PoolRole, SearchScope,
};
pub use connection::{DirectoryConnection, DirectoryConnector, DirectoryEntry, Ldap3Connector};
pub use error::{LdapError, LdapResult};
pub use health::{health_cache_key, EndpointStatus, EndpointStatusEvent};
pub use pool::{ConnectionPool, HealthReport, PoolServices, PoolStatus, PooledConnection};
pub use registry::DirectoryPools;
