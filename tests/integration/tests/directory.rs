//! Directory connection pool integration tests.

use std::sync::Arc;
use std::time::Duration;

use jans_core::metrics::names;
use jans_core::MetricsRegistry;
use jans_ldap::testing::MockConnector;
use jans_ldap::{
    ConnectionPoolDescriptor, DirectoryConfig, DirectoryPools, LdapError, PoolRole, PoolServices,
};

use crate::common::{TestEnv, DIRECTORY, LDAP_A, LDAP_B};

fn pools(
    connector: &MockConnector,
    max_size: usize,
    cooldown: Duration,
) -> anyhow::Result<(DirectoryPools, Arc<MetricsRegistry>)> {
    let descriptor = ConnectionPoolDescriptor::builder("general")
        .role(PoolRole::General)
        .primary(true)
        .endpoint(LDAP_A, 1)
        .endpoint(LDAP_B, 2)
        .bind("cn=directory manager,o=jans", "secret")
        .pool_size(0, max_size)
        .acquire_timeout(Duration::from_millis(100))
        .cooldown(cooldown)
        .build()?;
    let metrics = Arc::new(MetricsRegistry::new());
    let pools = DirectoryPools::new(
        &DirectoryConfig::new(vec![descriptor]),
        Arc::new(connector.clone()),
        PoolServices::default().with_metrics(metrics.clone()),
    )?;
    Ok((pools, metrics))
}

/// With A down, acquire lands on B and the caller sees no error.
#[tokio::test]
async fn test_failover_to_lower_priority_endpoint() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;
    env.connector.set_reachable(LDAP_A, false);

    let conn = env.engine.pools().acquire("general").await?;
    assert_eq!(conn.endpoint(), LDAP_B);
    conn.release(true).await;

    let status = env.engine.pools().status();
    let a = status[0]
        .endpoints
        .iter()
        .find(|e| e.url == LDAP_A)
        .expect("endpoint A is tracked");
    assert!(!a.available);
    assert_eq!(a.consecutive_failures, 1);
    assert!(env.metrics.count(names::ENDPOINT_DEGRADED) >= 1);

    env.stop().await;
    Ok(())
}

/// Outstanding leases never exceed the maximum; waiters time out with
/// `PoolExhausted` and are served once a lease comes back.
#[tokio::test]
async fn test_lease_cap_is_enforced() -> anyhow::Result<()> {
    let connector = MockConnector::new();
    let (pools, metrics) = pools(&connector, 2, Duration::from_secs(30))?;
    let pool = pools.pool("general")?;

    let first = pool.acquire().await?;
    let second = pool.acquire().await?;
    assert_eq!(pool.status().leased, 2);
    assert!(matches!(pool.acquire().await, Err(LdapError::PoolExhausted(_))));
    assert_eq!(metrics.count(names::POOL_EXHAUSTED), 1);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.release(true).await;
    let third = waiter.await??;
    assert_eq!(pool.status().leased, 2);

    third.release(true).await;
    second.release(true).await;
    assert_eq!(pool.status().leased, 0);
    assert!(connector.opened_count() <= 2);
    Ok(())
}

/// Many concurrent callers never hold more than the maximum at once.
#[tokio::test]
async fn test_concurrent_callers_share_bounded_leases() -> anyhow::Result<()> {
    let connector = MockConnector::new();
    let (pools, _) = pools(&connector, 3, Duration::from_secs(30))?;
    let pool = pools.pool("general")?;
    let peak = Arc::new(parking_lot::Mutex::new(0usize));

    let tasks: Vec<_> = (0..12)
        .map(|_| {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let conn = pool.acquire_timeout(Duration::from_secs(5)).await?;
                {
                    let mut peak = peak.lock();
                    *peak = (*peak).max(pool.status().leased);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                conn.release(true).await;
                Ok::<_, LdapError>(())
            })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result??;
    }

    assert!(*peak.lock() <= 3);
    assert_eq!(pool.status().leased, 0);
    Ok(())
}

/// A failed endpoint is skipped for its cooldown and tried again afterwards.
#[tokio::test(start_paused = true)]
async fn test_failed_endpoint_is_retried_after_cooldown() -> anyhow::Result<()> {
    let connector = MockConnector::new();
    let (pools, _) = pools(&connector, 4, Duration::from_secs(30))?;
    let pool = pools.pool("general")?;

    connector.set_reachable(LDAP_A, false);
    let conn = pool.acquire().await?;
    assert_eq!(conn.endpoint(), LDAP_B);
    conn.discard().await;
    assert_eq!(connector.connect_count(LDAP_A), 1);

    // A is back, but still cooling down.
    connector.set_reachable(LDAP_A, true);
    let conn = pool.acquire().await?;
    assert_eq!(conn.endpoint(), LDAP_B);
    conn.discard().await;
    assert_eq!(connector.connect_count(LDAP_A), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let conn = pool.acquire().await?;
    assert_eq!(conn.endpoint(), LDAP_A);
    conn.release(true).await;
    assert_eq!(connector.connect_count(LDAP_A), 2);
    Ok(())
}

/// With every endpoint down the caller gets `BackendUnavailable`.
#[tokio::test]
async fn test_all_endpoints_down_is_backend_unavailable() -> anyhow::Result<()> {
    let connector = MockConnector::new();
    let (pools, metrics) = pools(&connector, 2, Duration::from_secs(30))?;
    connector.set_reachable(LDAP_A, false);
    connector.set_reachable(LDAP_B, false);

    let err = pools.acquire("general").await.unwrap_err();
    assert_eq!(err.kind(), jans_core::ErrorKind::BackendUnavailable);
    assert!(metrics.count(names::BACKEND_UNAVAILABLE) >= 1);
    assert_eq!(pools.pool("general")?.status().leased, 0);
    Ok(())
}
