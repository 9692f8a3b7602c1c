//! Directory pool configuration.
//!
//! ## Security Requirements
//!
//! **CRITICAL**: Only LDAPS (LDAP over TLS) is supported.
//!
//! - Endpoint URLs MUST start with `ldaps://`
//! - STARTTLS is NOT supported (vulnerable to downgrade attacks)
//! - Plain `ldap://` is NOT supported (credentials transmitted in cleartext)

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LdapError, LdapResult};

// ============================================================================
// Endpoints and credentials
// ============================================================================

/// One backend server of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Server URL (MUST be ldaps://).
    pub url: String,
    /// Lower value is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

const fn default_priority() -> u32 {
    1
}

impl EndpointConfig {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            priority,
        }
    }
}

/// Service account used to bind every pooled connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindCredentials {
    /// Bind DN for the service account.
    pub bind_dn: String,
    /// Bind credential (password).
    #[serde(skip_serializing, default)]
    pub bind_credential: String,
}

impl BindCredentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(bind_dn: impl Into<String>, bind_credential: impl Into<String>) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            bind_credential: bind_credential.into(),
        }
    }
}

impl fmt::Debug for BindCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindCredentials")
            .field("bind_dn", &self.bind_dn)
            .field("bind_credential", &"[REDACTED]")
            .finish()
    }
}

/// Logical backend role of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    /// Credential verification binds.
    Auth,
    /// Lookups and everything else.
    #[default]
    General,
}

impl PoolRole {
    /// Returns the configuration name of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::General => "general",
        }
    }
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LDAP search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchScope {
    /// Search only the base DN.
    Base,
    /// Search one level below the base DN.
    OneLevel,
    /// Search the entire subtree.
    #[default]
    Subtree,
}

impl SearchScope {
    /// Converts to ldap3 scope.
    #[must_use]
    pub const fn to_ldap3(&self) -> ldap3::Scope {
        match self {
            Self::Base => ldap3::Scope::Base,
            Self::OneLevel => ldap3::Scope::OneLevel,
            Self::Subtree => ldap3::Scope::Subtree,
        }
    }
}

// ============================================================================
// Pool descriptor
// ============================================================================

/// Configuration of one named connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoolDescriptor {
    /// Pool name, unique within the directory configuration.
    pub name: String,
    /// Backend role served by the pool.
    #[serde(default)]
    pub role: PoolRole,
    /// Whether this pool is the primary one for its role.
    #[serde(default)]
    pub primary: bool,
    /// Backend servers, tried in priority order.
    pub endpoints: Vec<EndpointConfig>,
    /// Service account credentials.
    pub bind: BindCredentials,
    /// Connections kept open by the health checker.
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    /// Maximum outstanding leases.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Default wait for a free lease. Zero fails fast.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Network timeout for opening and binding a connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Period of the background health check.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// How long a failed endpoint is skipped.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Minimum spacing between background replacement connections.
    #[serde(default = "default_replacement_interval_ms")]
    pub replacement_interval_ms: u64,
}

const fn default_min_size() -> usize {
    1
}
const fn default_max_size() -> usize {
    8
}
const fn default_acquire_timeout_ms() -> u64 {
    5_000
}
const fn default_connect_timeout_ms() -> u64 {
    3_000
}
const fn default_health_check_interval_secs() -> u64 {
    30
}
const fn default_cooldown_secs() -> u64 {
    30
}
const fn default_replacement_interval_ms() -> u64 {
    1_000
}

impl ConnectionPoolDescriptor {
    /// Creates a new descriptor builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ConnectionPoolDescriptorBuilder {
        ConnectionPoolDescriptorBuilder::new(name)
    }

    /// Default acquire timeout.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Health check period.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Endpoint cooldown.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Replacement spacing.
    #[must_use]
    pub const fn replacement_interval(&self) -> Duration {
        Duration::from_millis(self.replacement_interval_ms)
    }

    /// Endpoints ordered by priority, ties kept in declaration order.
    #[must_use]
    pub fn ordered_endpoints(&self) -> Vec<EndpointConfig> {
        let mut endpoints = self.endpoints.clone();
        endpoints.sort_by_key(|e| e.priority);
        endpoints
    }

    /// Whether `url` is one of the configured endpoints.
    #[must_use]
    pub fn has_endpoint(&self, url: &str) -> bool {
        self.endpoints.iter().any(|e| e.url == url)
    }

    /// Validates the descriptor.
    ///
    /// ## Security
    ///
    /// This method enforces LDAPS-only connections.
    pub fn validate(&self) -> LdapResult<()> {
        if self.name.trim().is_empty() {
            return Err(LdapError::config("pool name cannot be empty"));
        }
        if self.endpoints.is_empty() {
            return Err(LdapError::config(format!(
                "pool '{}' needs at least one endpoint",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            // CRITICAL: Enforce LDAPS-only
            validate_ldaps_url(&endpoint.url)?;
            if !seen.insert(endpoint.url.as_str()) {
                return Err(LdapError::config(format!(
                    "pool '{}' lists endpoint {} twice",
                    self.name, endpoint.url
                )));
            }
        }
        if self.bind.bind_dn.is_empty() {
            return Err(LdapError::config("bind_dn cannot be empty"));
        }
        if self.max_size == 0 {
            return Err(LdapError::config(format!(
                "pool '{}' max_size must be positive",
                self.name
            )));
        }
        if self.min_size > self.max_size {
            return Err(LdapError::config(format!(
                "pool '{}' min_size exceeds max_size",
                self.name
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(LdapError::config("connect_timeout_ms must be positive"));
        }
        if self.health_check_interval_secs == 0 {
            return Err(LdapError::config(
                "health_check_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Validates that a URL uses LDAPS.
///
/// ## Security
///
/// **CRITICAL**: Only `ldaps://` URLs are accepted.
/// - `ldap://` is rejected (cleartext credentials)
/// - STARTTLS is not supported (vulnerable to downgrade attacks)
pub fn validate_ldaps_url(url: &str) -> LdapResult<()> {
    let url_lower = url.to_lowercase();

    if !url_lower.starts_with("ldaps://") {
        return Err(LdapError::InsecureProtocol);
    }

    // "ldaps://" is 8 chars
    if url.len() <= 8 {
        return Err(LdapError::config("Invalid LDAPS URL: missing host"));
    }

    Ok(())
}

/// Escapes special characters in LDAP filter values.
#[must_use]
pub fn ldap_escape(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\5c"),
            '*' => result.push_str("\\2a"),
            '(' => result.push_str("\\28"),
            ')' => result.push_str("\\29"),
            '\0' => result.push_str("\\00"),
            _ => result.push(c),
        }
    }
    result
}

// ============================================================================
// Directory configuration
// ============================================================================

/// Every pool of the directory layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Pool descriptors.
    #[serde(default)]
    pub pools: Vec<ConnectionPoolDescriptor>,
}

impl DirectoryConfig {
    /// Creates a configuration from descriptors.
    #[must_use]
    pub const fn new(pools: Vec<ConnectionPoolDescriptor>) -> Self {
        Self { pools }
    }

    /// Validates every pool, name uniqueness and the primary rule.
    ///
    /// Each role that has pools must have exactly one primary pool.
    pub fn validate(&self) -> LdapResult<()> {
        let mut names = HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !names.insert(pool.name.as_str()) {
                return Err(LdapError::config(format!(
                    "duplicate pool name '{}'",
                    pool.name
                )));
            }
        }
        for role in [PoolRole::Auth, PoolRole::General] {
            let in_role = self.pools.iter().filter(|p| p.role == role).count();
            let primaries = self
                .pools
                .iter()
                .filter(|p| p.role == role && p.primary)
                .count();
            if in_role > 0 && primaries != 1 {
                return Err(LdapError::config(format!(
                    "role '{role}' needs exactly one primary pool, found {primaries}"
                )));
            }
        }
        Ok(())
    }

    /// Returns the primary pool descriptor for a role.
    #[must_use]
    pub fn primary_for(&self, role: PoolRole) -> Option<&ConnectionPoolDescriptor> {
        self.pools.iter().find(|p| p.role == role && p.primary)
    }

    /// Returns a pool descriptor by name.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&ConnectionPoolDescriptor> {
        self.pools.iter().find(|p| p.name == name)
    }
}

// ============================================================================
// Descriptor Builder
// ============================================================================

/// Builder for pool descriptors.
#[derive(Debug)]
pub struct ConnectionPoolDescriptorBuilder {
    name: String,
    role: PoolRole,
    primary: bool,
    endpoints: Vec<EndpointConfig>,
    bind: Option<BindCredentials>,
    min_size: usize,
    max_size: usize,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    health_check_interval: Duration,
    cooldown: Duration,
    replacement_interval: Duration,
}

impl ConnectionPoolDescriptorBuilder {
    /// Creates a new builder with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: PoolRole::General,
            primary: false,
            endpoints: Vec::new(),
            bind: None,
            min_size: default_min_size(),
            max_size: default_max_size(),
            acquire_timeout: Duration::from_millis(default_acquire_timeout_ms()),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            health_check_interval: Duration::from_secs(default_health_check_interval_secs()),
            cooldown: Duration::from_secs(default_cooldown_secs()),
            replacement_interval: Duration::from_millis(default_replacement_interval_ms()),
        }
    }

    /// Sets the role.
    #[must_use]
    pub const fn role(mut self, role: PoolRole) -> Self {
        self.role = role;
        self
    }

    /// Marks the pool as primary for its role.
    #[must_use]
    pub const fn primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Adds an endpoint.
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>, priority: u32) -> Self {
        self.endpoints.push(EndpointConfig::new(url, priority));
        self
    }

    /// Sets the service account.
    #[must_use]
    pub fn bind(mut self, dn: impl Into<String>, credential: impl Into<String>) -> Self {
        self.bind = Some(BindCredentials::new(dn, credential));
        self
    }

    /// Sets pool size bounds.
    #[must_use]
    pub const fn pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    /// Sets the default acquire timeout.
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the health check period.
    #[must_use]
    pub const fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the endpoint cooldown.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the replacement spacing.
    #[must_use]
    pub const fn replacement_interval(mut self, interval: Duration) -> Self {
        self.replacement_interval = interval;
        self
    }

    /// Builds and validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Credentials are missing
    /// - An endpoint URL does not use LDAPS
    /// - Size bounds are inconsistent
    pub fn build(self) -> LdapResult<ConnectionPoolDescriptor> {
        let descriptor = ConnectionPoolDescriptor {
            name: self.name,
            role: self.role,
            primary: self.primary,
            endpoints: self.endpoints,
            bind: self
                .bind
                .ok_or_else(|| LdapError::config("bind credentials are required"))?,
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout_ms: duration_millis(self.acquire_timeout),
            connect_timeout_ms: duration_millis(self.connect_timeout),
            health_check_interval_secs: self.health_check_interval.as_secs(),
            cooldown_secs: self.cooldown.as_secs(),
            replacement_interval_ms: duration_millis(self.replacement_interval),
        };

        descriptor.validate()?;

        Ok(descriptor)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
