//! Common test utilities and fixtures.

use std::sync::Arc;

use jans_core::MetricsRegistry;
use jans_ldap::testing::MockConnector;
use jans_ldap::DirectoryEntry;
use jans_reload::ConfigSnapshot;
use jans_script::NativeScriptFactory;
use jans_server::Engine;

/// Directory with one general pool preferring `ldap-a` over `ldap-b`.
pub const DIRECTORY: &str = r#"
[[directory.pools]]
name = "general"
primary = true
min_size = 0
max_size = 4
acquire_timeout_ms = 200
cooldown_secs = 30
endpoints = [
    { url = "ldaps://ldap-a.example.org:636", priority = 1 },
    { url = "ldaps://ldap-b.example.org:636", priority = 2 },
]
bind = { bind_dn = "cn=directory manager,o=jans", bind_credential = "secret" }
"#;

/// Password login through the directory.
pub const DIRECTORY_BIND_SCRIPT: &str = r#"
[[scripts]]
name = "basic"
script_type = "person-authentication"
source = { engine = "native", code = "directory-bind" }
"#;

/// Endpoint URLs of [`DIRECTORY`].
pub const LDAP_A: &str = "ldaps://ldap-a.example.org:636";
/// Secondary endpoint of [`DIRECTORY`].
pub const LDAP_B: &str = "ldaps://ldap-b.example.org:636";

/// A running engine over an in-memory directory.
pub struct TestEnv {
    /// The engine.
    pub engine: Engine,
    /// Directory behind the pools.
    pub connector: MockConnector,
    /// Metrics emitted by every component.
    pub metrics: Arc<MetricsRegistry>,
}

impl TestEnv {
    /// Starts an engine from TOML with users alice and bob.
    pub async fn start(config: &str) -> anyhow::Result<Self> {
        Self::start_with(config, Arc::new(NativeScriptFactory::new())).await
    }

    /// Starts an engine with extra native modules.
    pub async fn start_with(
        config: &str,
        native: Arc<NativeScriptFactory>,
    ) -> anyhow::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("jans=debug,jans_ldap=debug,jans_script=debug,jans_reload=debug")
            .with_test_writer()
            .try_init();

        let connector = MockConnector::new();
        for (uid, password) in [("alice", "wonderland"), ("bob", "builder")] {
            connector.add_user(
                DirectoryEntry::new(format!("uid={uid},ou=people,o=jans"))
                    .with_attr("uid", uid)
                    .with_attr("mail", format!("{uid}@example.org")),
                password,
            );
        }

        let metrics = Arc::new(MetricsRegistry::new());
        let engine = Engine::builder(ConfigSnapshot::from_toml_str(config)?)
            .connector(Arc::new(connector.clone()))
            .metrics(Arc::clone(&metrics))
            .native_modules(native)
            .background_tasks(false)
            .start()
            .await?;

        Ok(Self {
            engine,
            connector,
            metrics,
        })
    }

    /// Current configuration, ready to be edited and reapplied.
    pub fn config(&self) -> ConfigSnapshot {
        (*self.engine.config()).clone()
    }

    /// Swaps in `snapshot` and waits until every listener has seen it.
    pub async fn reconfigure(&self, snapshot: ConfigSnapshot) -> anyhow::Result<()> {
        self.engine.reconfigure(snapshot)?;
        self.engine.coordinator().flush_all().await?;
        Ok(())
    }

    /// Stops the engine.
    pub async fn stop(self) {
        self.engine.shutdown().await;
    }
}
