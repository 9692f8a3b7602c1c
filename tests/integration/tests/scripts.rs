//! Script runtime integration tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jans_cache::CacheProvider;
use jans_script::{
    ExternalScriptContext, NativeScriptFactory, ScriptModule, ScriptResult, ScriptSignal,
    ScriptSource, ScriptState, ScriptType,
};
use jans_server::AuthenticationRequest;
use serde_json::json;

use crate::common::{TestEnv, DIRECTORY};

const GATE: &str = r#"
[[scripts]]
name = "gate"
script_type = "person-authentication"

[scripts.source]
engine = "rhai"
code = '''
fn authenticate(ctx) {
    if ctx.credential == "open-sesame" { "allow" } else { "deny" }
}
'''
"#;

const BROKEN_GATE: &str = r#"
fn init(props) { throw "boom"; }
fn authenticate(ctx) { "allow" }
"#;

const HIT_COUNTER: &str = r#"
[[scripts]]
name = "hits"
script_type = "interception"

[scripts.source]
engine = "rhai"
code = '''
fn intercept(ctx) {
    let n = cache_get("hits");
    if type_of(n) == "()" { n = 0; }
    cache_put("hits", n + 1);
    "continue"
}
'''
"#;

/// A failed reload leaves the previous revision serving.
#[tokio::test]
async fn test_failed_reload_keeps_previous_revision() -> anyhow::Result<()> {
    let env = TestEnv::start(&format!("{DIRECTORY}{GATE}")).await?;
    let before = env
        .engine
        .runtime()
        .status(ScriptType::PersonAuthentication, "gate")
        .and_then(|s| s.active_revision)
        .expect("gate is active");

    let mut next = env.config();
    next.scripts[0].source = ScriptSource::rhai(BROKEN_GATE);
    env.reconfigure(next).await?;

    let status = env
        .engine
        .runtime()
        .status(ScriptType::PersonAuthentication, "gate")
        .expect("gate is known");
    assert_eq!(status.state, ScriptState::Failed);
    assert_eq!(status.active_revision, Some(before));
    assert!(status.latest_revision > before);
    assert!(status.last_error.unwrap_or_default().contains("boom"));

    // The old revision still decides.
    let denied = env
        .engine
        .authentication()
        .authenticate(AuthenticationRequest::new("alice", "guess"))
        .await;
    assert!(!denied.is_allowed());
    let allowed = env
        .engine
        .authentication()
        .authenticate(AuthenticationRequest::new("alice", "open-sesame"))
        .await;
    assert!(allowed.is_allowed());

    env.stop().await;
    Ok(())
}

/// Scripts reach the shared cache and nothing else.
#[tokio::test]
async fn test_scripts_share_the_engine_cache() -> anyhow::Result<()> {
    let env = TestEnv::start(HIT_COUNTER).await?;
    let runtime = env.engine.runtime();

    for _ in 0..3 {
        let mut ctx = ExternalScriptContext::new(runtime.services().clone());
        runtime
            .invoke(ScriptType::Interception, "intercept", &mut ctx)
            .await;
    }
    assert_eq!(env.engine.cache().get("hits"), Some(json!(3)));

    env.stop().await;
    Ok(())
}

/// Disabling retires the Active revision; removal forgets the script.
#[tokio::test]
async fn test_disable_then_remove_script() -> anyhow::Result<()> {
    let env = TestEnv::start(HIT_COUNTER).await?;
    assert_eq!(env.engine.runtime().active_chain(ScriptType::Interception).len(), 1);

    let mut next = env.config();
    next.scripts[0].enabled = false;
    env.reconfigure(next.clone()).await?;
    let status = env
        .engine
        .runtime()
        .status(ScriptType::Interception, "hits")
        .expect("disabled script is still known");
    assert_eq!(status.state, ScriptState::Disabled);
    assert!(env.engine.runtime().active_chain(ScriptType::Interception).is_empty());

    next.scripts.clear();
    env.reconfigure(next).await?;
    assert!(env
        .engine
        .runtime()
        .status(ScriptType::Interception, "hits")
        .is_none());

    env.stop().await;
    Ok(())
}

#[derive(Debug)]
struct Tracked {
    destroyed: Arc<AtomicUsize>,
    greeting: String,
}

#[async_trait]
impl ScriptModule for Tracked {
    async fn initialize(&mut self, properties: &BTreeMap<String, String>) -> ScriptResult<()> {
        if let Some(greeting) = properties.get("greeting") {
            self.greeting.clone_from(greeting);
        }
        Ok(())
    }

    async fn invoke(
        &self,
        _method: &str,
        ctx: &mut ExternalScriptContext,
    ) -> ScriptResult<ScriptSignal> {
        ctx.set_result("greeting", self.greeting.clone());
        Ok(ScriptSignal::Success)
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A replaced revision is destroyed exactly once; the new one serves.
#[tokio::test]
async fn test_reload_destroys_replaced_revision() -> anyhow::Result<()> {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let native = Arc::new(NativeScriptFactory::new());
    {
        let destroyed = Arc::clone(&destroyed);
        native.register("tracked", move |_, _| {
            Box::new(Tracked {
                destroyed: Arc::clone(&destroyed),
                greeting: "hello".to_string(),
            })
        });
    }
    let config = r#"
[[scripts]]
name = "greeter"
script_type = "update-token"
source = { engine = "native", code = "tracked" }
"#;
    let env = TestEnv::start_with(config, native).await?;
    let runtime = env.engine.runtime().clone();

    let mut next = env.config();
    next.scripts[0] = next.scripts[0].clone().with_property("greeting", "bonjour");
    env.reconfigure(next).await?;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    let mut ctx = ExternalScriptContext::new(runtime.services().clone());
    let invocation = runtime
        .invoke(ScriptType::UpdateToken, "update", &mut ctx)
        .await;
    assert!(invocation.decision.is_allow());
    assert_eq!(ctx.into_result().get("greeting"), Some(&json!("bonjour")));

    env.stop().await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    Ok(())
}
