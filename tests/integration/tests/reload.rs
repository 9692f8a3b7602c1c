//! Configuration reload integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use jans_ldap::EndpointConfig;
use jans_reload::{ReloadError, ReloadEvent, ReloadKind, ReloadListener, ReloadResult};
use parking_lot::Mutex;

use crate::common::{TestEnv, DIRECTORY, LDAP_A};

const LDAP_C: &str = "ldaps://ldap-c.example.org:636";

/// Records every event it sees and rejects the ones `reject` picks.
struct Recorder {
    seen: Mutex<Vec<(u64, usize)>>,
    reject: fn(&ReloadEvent) -> bool,
}

impl Recorder {
    fn new(reject: fn(&ReloadEvent) -> bool) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            reject,
        })
    }

    fn seen(&self) -> Vec<(u64, usize)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ReloadListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn apply(&self, event: &ReloadEvent) -> ReloadResult<()> {
        self.seen
            .lock()
            .push((event.sequence, event.snapshot.cache.max_entries));
        if (self.reject)(event) {
            return Err(ReloadError::apply("recorder", "rejected on purpose"));
        }
        Ok(())
    }
}

/// Every event of a kind reaches each listener once, in publication order.
#[tokio::test]
async fn test_events_are_delivered_in_order_exactly_once() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;
    let recorder = Recorder::new(|_| false);
    let coordinator = env.engine.coordinator();
    coordinator.subscribe(ReloadKind::Cache, recorder.clone());

    let mut published = Vec::new();
    for max_entries in 1..=25 {
        let mut next = env.config();
        next.cache.max_entries = max_entries;
        published.push(coordinator.publish(ReloadKind::Cache, Arc::new(next))?);
    }
    coordinator.flush(ReloadKind::Cache).await?;

    let seen = recorder.seen();
    assert_eq!(seen.len(), 25);
    assert_eq!(seen.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(), published);
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(
        seen.iter().map(|(_, n)| *n).collect::<Vec<_>>(),
        (1..=25).collect::<Vec<_>>()
    );
    // The engine's own cache listener applied the last one.
    assert_eq!(env.engine.cache().settings().max_entries, 25);

    env.stop().await;
    Ok(())
}

/// Only the sections that differ are published.
#[tokio::test]
async fn test_reconfigure_publishes_changed_sections_only() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;

    let mut next = env.config();
    next.lockout.max_failures = 9;
    let published = env.engine.reconfigure(next.clone())?;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, ReloadKind::AppConfig);

    assert!(env.engine.reconfigure(next)?.is_empty());
    env.engine.coordinator().flush_all().await?;
    assert_eq!(env.engine.ledger().policy().max_failures, 9);
    assert_eq!(env.engine.status().config_version, 1);

    env.stop().await;
    Ok(())
}

/// An invalid snapshot never becomes current.
#[tokio::test]
async fn test_invalid_snapshot_is_rejected_whole() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;

    let mut next = env.config();
    next.lockout.max_failures = 7;
    next.directory.pools[0].endpoints.push(EndpointConfig::new("ldap://plain.example.org:389", 3));
    assert!(env.engine.reconfigure(next).is_err());

    assert_eq!(env.engine.status().config_version, 0);
    assert_ne!(env.engine.config().lockout.max_failures, 7);

    env.stop().await;
    Ok(())
}

/// A rejected event is not retried and later events still arrive.
#[tokio::test]
async fn test_failed_listener_is_not_retried() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;
    let recorder = Recorder::new(|event| event.snapshot.cache.max_entries == 13);
    env.engine
        .coordinator()
        .subscribe(ReloadKind::Cache, recorder.clone());

    for max_entries in [12, 13, 14] {
        let mut next = env.config();
        next.cache.max_entries = max_entries;
        env.reconfigure(next).await?;
    }

    assert_eq!(
        recorder.seen().iter().map(|(_, n)| *n).collect::<Vec<_>>(),
        vec![12, 13, 14]
    );
    let status = env
        .engine
        .coordinator()
        .listener_statuses()
        .into_iter()
        .find(|s| s.name == "recorder")
        .expect("recorder is subscribed");
    assert_eq!(status.applied, 2);
    assert_eq!(status.failed, 1);
    assert!(status
        .last_error
        .unwrap_or_default()
        .contains("rejected on purpose"));

    env.stop().await;
    Ok(())
}

/// A directory change swaps endpoints under live callers.
#[tokio::test]
async fn test_directory_reconfigure_swaps_endpoints() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;
    let conn = env.engine.pools().acquire("general").await?;
    assert_eq!(conn.endpoint(), LDAP_A);
    conn.release(true).await;

    let mut next = env.config();
    next.directory.pools[0].endpoints = vec![EndpointConfig::new(LDAP_C, 1)];
    env.reconfigure(next).await?;

    let conn = env.engine.pools().acquire("general").await?;
    assert_eq!(conn.endpoint(), LDAP_C);
    conn.release(true).await;
    assert_eq!(env.engine.pools().status()[0].idle, 1);

    env.stop().await;
    Ok(())
}

/// Without a log handle the logger kind has no listener, and a logging
/// change is still accepted.
#[tokio::test]
async fn test_logger_changes_without_log_control() -> anyhow::Result<()> {
    let env = TestEnv::start(DIRECTORY).await?;
    assert!(env
        .engine
        .coordinator()
        .listener_statuses()
        .iter()
        .all(|s| s.kind != ReloadKind::Logger));

    let mut next = env.config();
    next.logging.level = "debug".to_string();
    let published = env.engine.reconfigure(next)?;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, ReloadKind::Logger);
    env.engine.coordinator().flush_all().await?;

    env.stop().await;
    Ok(())
}

/// The shipped sample configuration parses and validates.
#[tokio::test]
async fn test_sample_configuration_is_valid() -> anyhow::Result<()> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/jans.example.toml");
    let snapshot = jans_reload::ConfigSnapshot::load(path).await?;
    assert_eq!(snapshot.directory.pools.len(), 2);
    assert_eq!(snapshot.scripts.len(), 2);
    assert!(!snapshot.scripts[1].enabled);
    Ok(())
}
