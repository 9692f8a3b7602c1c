//! Scriptable in-memory connector for tests.
//!
//! Endpoints are reachable unless told otherwise. Users added with
//! [`MockConnector::add_user`] can be found by `(uid=...)` searches and bound
//! with their password.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{ldap_escape, BindCredentials, EndpointConfig, SearchScope};
use crate::connection::{DirectoryConnection, DirectoryConnector, DirectoryEntry};
use crate::error::{LdapError, LdapResult};

#[derive(Debug, Clone, Default)]
struct EndpointBehavior {
    unreachable: bool,
    bind_rejected: bool,
    probe_failing: bool,
    connects: usize,
}

#[derive(Debug, Clone)]
struct MockUser {
    entry: DirectoryEntry,
    password: String,
}

#[derive(Debug, Default)]
struct MockState {
    endpoints: Mutex<HashMap<String, EndpointBehavior>>,
    users: Mutex<Vec<MockUser>>,
    connect_delay: Mutex<Option<Duration>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-memory [`DirectoryConnector`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Creates a connector where every endpoint is reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes connection attempts to `url` fail with a connection error.
    pub fn set_reachable(&self, url: &str, reachable: bool) {
        self.state
            .endpoints
            .lock()
            .entry(url.to_string())
            .or_default()
            .unreachable = !reachable;
    }

    /// Makes the service bind on `url` fail.
    pub fn set_bind_rejected(&self, url: &str, rejected: bool) {
        self.state
            .endpoints
            .lock()
            .entry(url.to_string())
            .or_default()
            .bind_rejected = rejected;
    }

    /// Makes probes on connections to `url` fail.
    pub fn set_probe_failing(&self, url: &str, failing: bool) {
        self.state
            .endpoints
            .lock()
            .entry(url.to_string())
            .or_default()
            .probe_failing = failing;
    }

    /// Delays every connection attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Adds a user entry with `uid` and a password.
    pub fn add_user(&self, entry: DirectoryEntry, password: impl Into<String>) {
        self.state.users.lock().push(MockUser {
            entry,
            password: password.into(),
        });
    }

    /// Connection attempts made to `url`, failed ones included.
    #[must_use]
    pub fn connect_count(&self, url: &str) -> usize {
        self.state
            .endpoints
            .lock()
            .get(url)
            .map_or(0, |b| b.connects)
    }

    /// Connections successfully opened.
    #[must_use]
    pub fn opened_count(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Connections closed.
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.opened_count().saturating_sub(self.closed_count())
    }
}

#[async_trait]
impl DirectoryConnector for MockConnector {
    async fn connect(
        &self,
        endpoint: &EndpointConfig,
        bind: &BindCredentials,
        timeout: Duration,
    ) -> LdapResult<Box<dyn DirectoryConnection>> {
        let behavior = {
            let mut endpoints = self.state.endpoints.lock();
            let behavior = endpoints.entry(endpoint.url.clone()).or_default();
            behavior.connects += 1;
            behavior.clone()
        };
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(LdapError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }
        if behavior.unreachable {
            return Err(LdapError::connection(format!(
                "{} refused the connection",
                endpoint.url
            )));
        }
        if behavior.bind_rejected || bind.bind_dn.is_empty() {
            return Err(LdapError::Bind("service account rejected".to_string()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            url: endpoint.url.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    url: String,
    state: Arc<MockState>,
    closed: bool,
}

impl MockConnection {
    fn check_reachable(&self) -> LdapResult<EndpointBehavior> {
        let behavior = self
            .state
            .endpoints
            .lock()
            .get(&self.url)
            .cloned()
            .unwrap_or_default();
        if behavior.unreachable || self.closed {
            return Err(LdapError::connection("connection reset"));
        }
        Ok(behavior)
    }
}

#[async_trait]
impl DirectoryConnection for MockConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> LdapResult<bool> {
        self.check_reachable()?;
        if password.is_empty() {
            return Ok(false);
        }
        Ok(self
            .state
            .users
            .lock()
            .iter()
            .any(|u| u.entry.dn == dn && u.password == password))
    }

    async fn search(
        &mut self,
        base: &str,
        _scope: SearchScope,
        filter: &str,
        _attributes: &[&str],
    ) -> LdapResult<Vec<DirectoryEntry>> {
        self.check_reachable()?;
        let users = self.state.users.lock();
        Ok(users
            .iter()
            .filter(|u| u.entry.dn.ends_with(base))
            .filter(|u| {
                u.entry.get_attrs("uid").is_some_and(|uids| {
                    uids.iter()
                        .any(|uid| filter.contains(&format!("(uid={})", ldap_escape(uid))))
                })
            })
            .map(|u| u.entry.clone())
            .collect())
    }

    async fn probe(&mut self) -> LdapResult<()> {
        let behavior = self.check_reachable()?;
        if behavior.probe_failing {
            return Err(LdapError::connection("root DSE read failed"));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
