//! Directory connections and the connector seam.
//!
//! ## Security Requirements
//!
//! All connections use LDAPS (TLS from connection start).
//! STARTTLS is NOT supported to prevent downgrade attacks.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, SearchEntry};
use serde::{Deserialize, Serialize};

use crate::config::{BindCredentials, EndpointConfig, SearchScope};
use crate::error::{LdapError, LdapResult};

/// Represents a directory entry with parsed attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Distinguished Name.
    pub dn: String,

    /// Attributes (all values are multi-valued).
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Adds an attribute value.
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Creates an entry from an ldap3 search result.
    #[must_use]
    pub fn from_search_entry(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attributes: entry.attrs,
        }
    }

    /// Gets a single-valued attribute.
    #[must_use]
    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// Gets a multi-valued attribute.
    #[must_use]
    pub fn get_attrs(&self, name: &str) -> Option<&Vec<String>> {
        self.attributes.get(name)
    }
}

/// An open, service-bound connection to one endpoint.
///
/// Implementations are used by one caller at a time; the pool guarantees a
/// connection is never lent twice.
#[async_trait]
pub trait DirectoryConnection: Send + Debug {
    /// Binds as `dn`.
    ///
    /// Returns `Ok(false)` when the server rejects the credentials. After a
    /// bind the connection is no longer authenticated as the service account
    /// and must be discarded instead of recycled.
    async fn bind(&mut self, dn: &str, password: &str) -> LdapResult<bool>;

    /// Runs a search.
    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[&str],
    ) -> LdapResult<Vec<DirectoryEntry>>;

    /// Lightweight liveness check (root DSE read).
    async fn probe(&mut self) -> LdapResult<()>;

    /// Closes the connection. Errors are ignored.
    async fn close(&mut self);
}

/// Opens service-bound connections to endpoints.
#[async_trait]
pub trait DirectoryConnector: Send + Sync + Debug {
    /// Opens a connection to `endpoint` and binds with `bind`.
    ///
    /// Network-level failures must be reported as transient errors
    /// ([`LdapError::is_transient`]); a rejected service bind must not.
    async fn connect(
        &self,
        endpoint: &EndpointConfig,
        bind: &BindCredentials,
        timeout: Duration,
    ) -> LdapResult<Box<dyn DirectoryConnection>>;
}

/// Production connector backed by `ldap3`.
#[derive(Debug, Clone)]
pub struct Ldap3Connector {
    validate_certificates: bool,
    operation_timeout: Duration,
}

impl Default for Ldap3Connector {
    fn default() -> Self {
        Self {
            validate_certificates: true,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl Ldap3Connector {
    /// Creates a connector that validates server certificates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to validate server certificates.
    /// Should always be true in production.
    #[must_use]
    pub const fn validate_certificates(mut self, validate: bool) -> Self {
        self.validate_certificates = validate;
        self
    }

    /// Timeout applied to every operation on opened connections.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

#[async_trait]
impl DirectoryConnector for Ldap3Connector {
    async fn connect(
        &self,
        endpoint: &EndpointConfig,
        bind: &BindCredentials,
        timeout: Duration,
    ) -> LdapResult<Box<dyn DirectoryConnection>> {
        crate::config::validate_ldaps_url(&endpoint.url)?;

        let settings = LdapConnSettings::new()
            .set_conn_timeout(timeout)
            .set_no_tls_verify(!self.validate_certificates);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &endpoint.url)
            .await
            .map_err(|e| match LdapError::from(e) {
                LdapError::Protocol(msg) => LdapError::Connection(msg),
                other => other,
            })?;

        let url = endpoint.url.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(endpoint = %url, "LDAP connection driver error: {}", e);
            }
        });

        // Bind with service account
        let result = ldap
            .with_timeout(timeout)
            .simple_bind(&bind.bind_dn, &bind.bind_credential)
            .await?;
        if let Err(e) = result.success() {
            let _ = ldap.unbind().await;
            return Err(match LdapError::from(e) {
                LdapError::InvalidCredentials => {
                    LdapError::Bind("service account rejected".to_string())
                }
                other => other,
            });
        }

        Ok(Box::new(Ldap3Connection {
            ldap,
            operation_timeout: self.operation_timeout,
        }))
    }
}

/// Connection opened by [`Ldap3Connector`].
struct Ldap3Connection {
    ldap: Ldap,
    operation_timeout: Duration,
}

impl Debug for Ldap3Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ldap3Connection")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DirectoryConnection for Ldap3Connection {
    async fn bind(&mut self, dn: &str, password: &str) -> LdapResult<bool> {
        // An empty password is an anonymous bind on most servers.
        if password.is_empty() {
            return Ok(false);
        }
        let result = self
            .ldap
            .with_timeout(self.operation_timeout)
            .simple_bind(dn, password)
            .await?;

        match result.success() {
            Ok(_) => Ok(true),
            Err(e) => match LdapError::from(e) {
                LdapError::InvalidCredentials => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[&str],
    ) -> LdapResult<Vec<DirectoryEntry>> {
        let (entries, _result) = self
            .ldap
            .with_timeout(self.operation_timeout)
            .search(base, scope.to_ldap3(), filter, attributes.to_vec())
            .await?
            .success()
            .map_err(|e| match LdapError::from(e) {
                LdapError::Protocol(msg) => LdapError::Search(msg),
                other => other,
            })?;

        Ok(entries
            .into_iter()
            .map(|entry| DirectoryEntry::from_search_entry(SearchEntry::construct(entry)))
            .collect())
    }

    async fn probe(&mut self) -> LdapResult<()> {
        self.ldap
            .with_timeout(self.operation_timeout)
            .search("", ldap3::Scope::Base, "(objectClass=*)", vec!["1.1"])
            .await?
            .success()?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.ldap.unbind().await;
    }
}
