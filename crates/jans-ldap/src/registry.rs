//! Named pools and per-role primaries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::{DirectoryConfig, PoolRole};
use crate::connection::DirectoryConnector;
use crate::error::{LdapError, LdapResult};
use crate::health::EndpointStatusEvent;
use crate::pool::{ConnectionPool, PoolServices, PooledConnection, PoolStatus};

/// Pools by name and the primary pool name of each role, from one
/// configuration.
#[derive(Debug)]
struct Directory {
    pools: HashMap<String, ConnectionPool>,
    primaries: HashMap<PoolRole, String>,
}

impl Directory {
    fn new(config: &DirectoryConfig, pools: HashMap<String, ConnectionPool>) -> Self {
        let primaries = [PoolRole::Auth, PoolRole::General]
            .into_iter()
            .filter_map(|role| config.primary_for(role).map(|p| (role, p.name.clone())))
            .collect();
        Self { pools, primaries }
    }
}

/// Every configured connection pool, swapped as a whole on reconfigure.
#[derive(Debug)]
pub struct DirectoryPools {
    connector: Arc<dyn DirectoryConnector>,
    services: PoolServices,
    directory: RwLock<Arc<Directory>>,
    last_checked: Mutex<HashMap<String, Instant>>,
}

impl DirectoryPools {
    /// Builds pools for `config`. No connection is opened yet.
    pub fn new(
        config: &DirectoryConfig,
        connector: Arc<dyn DirectoryConnector>,
        services: PoolServices,
    ) -> LdapResult<Self> {
        config.validate()?;
        let mut pools = HashMap::with_capacity(config.pools.len());
        for descriptor in &config.pools {
            let pool =
                ConnectionPool::new(descriptor.clone(), Arc::clone(&connector), services.clone())?;
            pools.insert(descriptor.name.clone(), pool);
        }
        Ok(Self {
            connector,
            services,
            directory: RwLock::new(Arc::new(Directory::new(config, pools))),
            last_checked: Mutex::new(HashMap::new()),
        })
    }

    fn snapshot(&self) -> Arc<Directory> {
        Arc::clone(&self.directory.read())
    }

    /// Returns a pool by name.
    pub fn pool(&self, name: &str) -> LdapResult<ConnectionPool> {
        self.snapshot()
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| LdapError::UnknownPool(name.to_string()))
    }

    /// Returns the primary pool for a role.
    ///
    /// Resolved from the configuration that is current as a whole, so a
    /// reconfigure in progress never shows zero or two primaries.
    pub fn primary(&self, role: PoolRole) -> LdapResult<ConnectionPool> {
        let directory = self.snapshot();
        directory
            .primaries
            .get(&role)
            .and_then(|name| directory.pools.get(name))
            .cloned()
            .ok_or_else(|| LdapError::UnknownPool(role.to_string()))
    }

    /// Leases a connection from the named pool.
    pub async fn acquire(&self, name: &str) -> LdapResult<PooledConnection> {
        self.pool(name)?.acquire().await
    }

    /// Names of every pool, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribes to endpoint status changes of every pool.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointStatusEvent> {
        self.services.events.subscribe()
    }

    /// Applies a new directory configuration.
    ///
    /// Existing pools are reconfigured in place, new ones are created and
    /// removed ones are closed after the new map is visible. Primaries switch
    /// with the map. Nothing changes if validation fails.
    pub async fn reconfigure(&self, config: &DirectoryConfig) -> LdapResult<()> {
        config.validate()?;
        let current = self.snapshot();

        let mut next = HashMap::with_capacity(config.pools.len());
        for descriptor in &config.pools {
            let pool = match current.pools.get(&descriptor.name) {
                Some(existing) => {
                    if existing.descriptor() != *descriptor {
                        existing.reconfigure(descriptor.clone()).await?;
                    }
                    existing.clone()
                }
                None => {
                    tracing::info!(pool = %descriptor.name, "creating connection pool");
                    ConnectionPool::new(
                        descriptor.clone(),
                        Arc::clone(&self.connector),
                        self.services.clone(),
                    )?
                }
            };
            next.insert(descriptor.name.clone(), pool);
        }

        let removed: Vec<ConnectionPool> = current
            .pools
            .iter()
            .filter(|(name, _)| !next.contains_key(*name))
            .map(|(_, pool)| pool.clone())
            .collect();

        *self.directory.write() = Arc::new(Directory::new(config, next));

        for pool in removed {
            self.last_checked.lock().remove(pool.name());
            pool.close().await;
        }
        Ok(())
    }

    /// Opens connections up to every pool's `min_size`.
    pub async fn warm_up(&self) -> usize {
        let mut opened = 0;
        for pool in self.snapshot().pools.values() {
            opened += pool.fill_to_min().await;
        }
        opened
    }

    /// Runs the health check of every pool whose interval elapsed.
    ///
    /// Returns the number of pools checked.
    pub async fn check_health_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<ConnectionPool> = {
            let last_checked = self.last_checked.lock();
            self.snapshot()
                .pools
                .values()
                .filter(|pool| {
                    last_checked.get(pool.name()).map_or(true, |last| {
                        now.duration_since(*last) >= pool.descriptor().health_check_interval()
                    })
                })
                .cloned()
                .collect()
        };

        for pool in &due {
            pool.check_health().await;
            self.last_checked
                .lock()
                .insert(pool.name().to_string(), Instant::now());
        }
        due.len()
    }

    /// Status of every pool, sorted by name.
    #[must_use]
    pub fn status(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<PoolStatus> =
            self.snapshot().pools.values().map(ConnectionPool::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Closes every pool.
    pub async fn close_all(&self) {
        for pool in self.snapshot().pools.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionPoolDescriptor;
    use crate::testing::MockConnector;
    use std::time::Duration;

    fn descriptor(name: &str, role: PoolRole, primary: bool, url: &str) -> ConnectionPoolDescriptor {
        ConnectionPoolDescriptor::builder(name)
            .role(role)
            .primary(primary)
            .endpoint(url, 1)
            .bind("cn=directory manager", "secret")
            .pool_size(1, 4)
            .health_check_interval(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    fn config() -> DirectoryConfig {
        DirectoryConfig::new(vec![
            descriptor("auth", PoolRole::Auth, true, "ldaps://auth.example.com"),
            descriptor("general", PoolRole::General, true, "ldaps://a.example.com"),
        ])
    }

    fn registry(connector: &MockConnector) -> DirectoryPools {
        DirectoryPools::new(
            &config(),
            Arc::new(connector.clone()),
            PoolServices::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn lookup_by_name_and_role() {
        let connector = MockConnector::new();
        let pools = registry(&connector);

        assert_eq!(pools.primary(PoolRole::Auth).unwrap().name(), "auth");
        assert_eq!(pools.names(), ["auth", "general"]);
        assert!(matches!(
            pools.acquire("missing").await.unwrap_err(),
            LdapError::UnknownPool(_)
        ));

        let conn = pools.acquire("general").await.unwrap();
        assert_eq!(conn.endpoint(), "ldaps://a.example.com");
    }

    #[tokio::test]
    async fn reconfigure_adds_updates_and_removes() {
        let connector = MockConnector::new();
        let pools = registry(&connector);
        let removed = pools.pool("auth").unwrap();

        let next = DirectoryConfig::new(vec![
            descriptor("general", PoolRole::General, true, "ldaps://b.example.com"),
            descriptor("auth-2", PoolRole::Auth, true, "ldaps://auth2.example.com"),
        ]);
        pools.reconfigure(&next).await.unwrap();

        assert_eq!(pools.names(), ["auth-2", "general"]);
        assert!(removed.status().closed);
        assert_eq!(pools.pool("general").unwrap().status().generation, 2);
        let conn = pools.acquire("general").await.unwrap();
        assert_eq!(conn.endpoint(), "ldaps://b.example.com");
    }

    #[tokio::test]
    async fn invalid_reconfigure_changes_nothing() {
        let connector = MockConnector::new();
        let pools = registry(&connector);

        let invalid = DirectoryConfig::new(vec![
            descriptor("general", PoolRole::General, false, "ldaps://b.example.com"),
        ]);
        assert!(pools.reconfigure(&invalid).await.is_err());
        assert_eq!(pools.names(), ["auth", "general"]);
        assert_eq!(pools.pool("general").unwrap().status().generation, 1);
    }

    fn two_general(primary: &str) -> DirectoryConfig {
        DirectoryConfig::new(vec![
            descriptor("auth", PoolRole::Auth, true, "ldaps://auth.example.com"),
            descriptor("x", PoolRole::General, primary == "x", "ldaps://x.example.com"),
            descriptor("y", PoolRole::General, primary == "y", "ldaps://y.example.com"),
        ])
    }

    #[tokio::test]
    async fn primary_moves_with_the_configuration() {
        let connector = MockConnector::new();
        let pools = DirectoryPools::new(
            &two_general("x"),
            Arc::new(connector.clone()),
            PoolServices::default(),
        )
        .unwrap();
        assert_eq!(pools.primary(PoolRole::General).unwrap().name(), "x");

        // Halfway through an update x has already lost its flag while y has
        // not gained it yet; the current configuration still names x.
        let x = pools.pool("x").unwrap();
        let demoted = descriptor("x", PoolRole::General, false, "ldaps://x.example.com");
        x.reconfigure(demoted).await.unwrap();
        assert_eq!(pools.primary(PoolRole::General).unwrap().name(), "x");

        pools.reconfigure(&two_general("y")).await.unwrap();
        assert_eq!(pools.primary(PoolRole::General).unwrap().name(), "y");
        assert_eq!(pools.primary(PoolRole::Auth).unwrap().name(), "auth");
        assert!(!x.status().closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_always_see_one_primary() {
        let connector = MockConnector::new();
        let pools = Arc::new(
            DirectoryPools::new(
                &two_general("x"),
                Arc::new(connector.clone()),
                PoolServices::default(),
            )
            .unwrap(),
        );
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let (pools, done) = (Arc::clone(&pools), Arc::clone(&done));
            tokio::spawn(async move {
                let mut misses = 0;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    if pools.primary(PoolRole::General).is_err() {
                        misses += 1;
                    }
                    tokio::task::yield_now().await;
                }
                misses
            })
        };

        for round in 0..50 {
            let primary = if round % 2 == 0 { "y" } else { "x" };
            pools.reconfigure(&two_general(primary)).await.unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(reader.await.unwrap(), 0);
        assert_eq!(pools.primary(PoolRole::General).unwrap().name(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn health_checks_honor_interval() {
        let connector = MockConnector::new();
        let pools = registry(&connector);

        assert_eq!(pools.check_health_due().await, 2);
        assert_eq!(pools.status().iter().map(|s| s.idle).sum::<usize>(), 2);
        assert_eq!(pools.check_health_due().await, 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pools.check_health_due().await, 2);
    }
}
