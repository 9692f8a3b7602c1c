//! Sandboxed Rhai script modules.
//!
//! Every revision gets its own [`Engine`] with operation, call-depth and size
//! limits and no module imports. Scripts see the host through a handful of
//! registered functions:
//!
//! - `log_info(msg)`, `log_warn(msg)`, `log_error(msg)`
//! - `cache_get(key)`, `cache_put(key, value)`, `cache_put(key, value, ttl_secs)`
//!
//! Hook functions take a single `ctx` map with `principal`, `credential`, `correlation_id`,
//! `script`, `attributes`, `result` and `properties`. The value they return
//! is read as a signal:
//!
//! - `()` or `"continue"`: no opinion
//! - `true` or `"success"`: approve and continue
//! - `false` or `"deny"`: stop and deny
//! - `"allow"`: stop and allow
//! - `#{ signal, reason, result }`: the named signal, with `result` merged
//!   into the request context
//!
//! The optional `init(properties)` and `destroy()` functions are the
//! lifecycle hooks. `init` returning `false` fails the load.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jans_cache::CacheProvider;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, ImmutableString, Scope, AST};
use serde_json::{Map, Value};

use crate::context::{ExternalScriptContext, ScriptServices};
use crate::error::{ScriptError, ScriptResult};
use crate::module::{ScriptFactory, ScriptModule, CURRENT_API_VERSION};
use crate::runtime::RuntimeSettings;
use crate::types::{ScriptDescriptor, ScriptSignal, StopResult};

/// Engine name of Rhai modules.
pub const ENGINE: &str = "rhai";

const MAX_STRING_SIZE: usize = 64 * 1024;
const MAX_COLLECTION_SIZE: usize = 10_000;

/// Factory for Rhai modules.
#[derive(Debug, Default)]
pub struct RhaiScriptFactory;

impl RhaiScriptFactory {
    /// Creates the factory.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ScriptFactory for RhaiScriptFactory {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn create(
        &self,
        descriptor: &ScriptDescriptor,
        settings: &RuntimeSettings,
        services: &ScriptServices,
    ) -> ScriptResult<Box<dyn ScriptModule>> {
        let name = descriptor.key().to_string();
        let engine = sandboxed_engine(&name, settings, &services.cache);
        let ast = engine
            .compile(&descriptor.source.code)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        Ok(Box::new(RhaiModule {
            name,
            engine,
            ast,
            properties: rhai::Map::new(),
            api_version: CURRENT_API_VERSION,
        }))
    }
}

fn sandboxed_engine(name: &str, settings: &RuntimeSettings, cache: &Arc<dyn CacheProvider>) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(settings.max_operations);
    engine.set_max_call_levels(settings.max_call_levels);
    engine.set_max_expr_depths(64, 32);
    engine.set_max_string_size(MAX_STRING_SIZE);
    engine.set_max_array_size(MAX_COLLECTION_SIZE);
    engine.set_max_map_size(MAX_COLLECTION_SIZE);
    engine.set_module_resolver(DummyModuleResolver::new());

    let script = name.to_string();
    engine.on_print(move |msg| tracing::info!(script = %script, "{msg}"));
    let script = name.to_string();
    engine.on_debug(move |msg, _source, pos| {
        tracing::debug!(script = %script, position = %pos, "{msg}");
    });

    let script = name.to_string();
    engine.register_fn("log_info", move |msg: ImmutableString| {
        tracing::info!(script = %script, "{msg}");
    });
    let script = name.to_string();
    engine.register_fn("log_warn", move |msg: ImmutableString| {
        tracing::warn!(script = %script, "{msg}");
    });
    let script = name.to_string();
    engine.register_fn("log_error", move |msg: ImmutableString| {
        tracing::error!(script = %script, "{msg}");
    });

    let c = Arc::clone(cache);
    engine.register_fn("cache_get", move |key: ImmutableString| -> Dynamic {
        c.get(&key)
            .and_then(|value| rhai::serde::to_dynamic(&value).ok())
            .unwrap_or(Dynamic::UNIT)
    });
    let c = Arc::clone(cache);
    engine.register_fn(
        "cache_put",
        move |key: ImmutableString, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let json: Value = rhai::serde::from_dynamic(&value)?;
            c.put(&key, json, None);
            Ok(())
        },
    );
    let c = Arc::clone(cache);
    engine.register_fn(
        "cache_put",
        move |key: ImmutableString, value: Dynamic, ttl_secs: i64| -> Result<(), Box<EvalAltResult>> {
            let json: Value = rhai::serde::from_dynamic(&value)?;
            let ttl = u64::try_from(ttl_secs)
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs);
            c.put(&key, json, ttl);
            Ok(())
        },
    );

    engine
}

struct RhaiModule {
    name: String,
    engine: Engine,
    ast: AST,
    properties: rhai::Map,
    api_version: u32,
}

impl fmt::Debug for RhaiModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiModule")
            .field("name", &self.name)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl RhaiModule {
    fn has_fn(&self, name: &str, arity: usize) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == name && f.params.len() == arity)
    }

    fn call(&self, name: &str, args: impl FuncArgs) -> Result<Dynamic, Box<EvalAltResult>> {
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, name, args)
    }

    fn context_map(&self, ctx: &ExternalScriptContext) -> ScriptResult<rhai::Map> {
        let mut attributes = rhai::Map::new();
        for (key, value) in ctx.attributes() {
            attributes.insert(key.as_str().into(), Dynamic::from(value.clone()));
        }

        let mut map = rhai::Map::new();
        map.insert(
            "principal".into(),
            ctx.principal()
                .map_or(Dynamic::UNIT, |p| Dynamic::from(p.to_string())),
        );
        map.insert(
            "credential".into(),
            ctx.credential()
                .map_or(Dynamic::UNIT, |c| Dynamic::from(c.to_string())),
        );
        map.insert(
            "correlation_id".into(),
            Dynamic::from(ctx.correlation_id().to_string()),
        );
        map.insert("script".into(), Dynamic::from(self.name.clone()));
        map.insert("attributes".into(), Dynamic::from_map(attributes));
        map.insert("result".into(), rhai::serde::to_dynamic(ctx.result())?);
        map.insert(
            "properties".into(),
            Dynamic::from_map(self.properties.clone()),
        );
        Ok(map)
    }
}

#[async_trait]
impl ScriptModule for RhaiModule {
    fn api_version(&self) -> u32 {
        self.api_version
    }

    async fn initialize(&mut self, properties: &BTreeMap<String, String>) -> ScriptResult<()> {
        self.properties = properties
            .iter()
            .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
            .collect();

        if self.has_fn("api_version", 0) {
            let version = self
                .call("api_version", ())
                .map_err(|e| ScriptError::Initialization(e.to_string()))?
                .as_int()
                .map_err(|t| ScriptError::Initialization(format!("api_version returned {t}")))?;
            self.api_version = u32::try_from(version)
                .map_err(|_| ScriptError::UnsupportedApiVersion(0))?;
        }

        if self.has_fn("init", 1) {
            let outcome = self
                .call("init", (Dynamic::from_map(self.properties.clone()),))
                .map_err(|e| ScriptError::Initialization(e.to_string()))?;
            if outcome.as_bool() == Ok(false) {
                return Err(ScriptError::Initialization("init returned false".to_string()));
            }
        }
        Ok(())
    }

    async fn invoke(
        &self,
        method: &str,
        ctx: &mut ExternalScriptContext,
    ) -> ScriptResult<ScriptSignal> {
        if !self.has_fn(method, 1) {
            tracing::trace!(script = %self.name, method, "Hook not implemented");
            return Ok(ScriptSignal::Continue);
        }
        let arg = Dynamic::from_map(self.context_map(ctx)?);
        let value = self.call(method, (arg,))?;
        read_signal(value, ctx)
    }

    fn destroy(&self) {
        if self.has_fn("destroy", 0) {
            if let Err(e) = self.call("destroy", ()) {
                tracing::warn!(script = %self.name, error = %e, "Script destroy hook failed");
            }
        }
    }
}

fn signal_from_word(word: &str, reason: Option<String>) -> ScriptResult<ScriptSignal> {
    match word {
        "continue" => Ok(ScriptSignal::Continue),
        "success" => Ok(ScriptSignal::Success),
        "allow" => Ok(ScriptSignal::Stop(StopResult {
            allow: true,
            reason,
        })),
        "deny" => Ok(ScriptSignal::Stop(StopResult {
            allow: false,
            reason: Some(reason.unwrap_or_else(|| "denied by script".to_string())),
        })),
        other => Err(ScriptError::invocation(format!(
            "unrecognized signal '{other}'"
        ))),
    }
}

fn read_signal(value: Dynamic, ctx: &mut ExternalScriptContext) -> ScriptResult<ScriptSignal> {
    if value.is_unit() {
        return Ok(ScriptSignal::Continue);
    }
    if let Ok(flag) = value.as_bool() {
        return Ok(if flag {
            ScriptSignal::Success
        } else {
            ScriptSignal::Stop(StopResult::deny("denied by script"))
        });
    }
    if value.is_string() {
        let word = value
            .into_string()
            .map_err(|t| ScriptError::invocation(format!("unexpected {t}")))?;
        return signal_from_word(&word, None);
    }
    if let Some(map) = value.try_cast::<rhai::Map>() {
        if let Some(result) = map.get("result") {
            if !result.is_unit() {
                let values: Map<String, Value> = rhai::serde::from_dynamic(result)?;
                ctx.merge_result(values);
            }
        }
        let reason = map
            .get("reason")
            .filter(|r| r.is_string())
            .map(ToString::to_string);
        let word = map
            .get("signal")
            .filter(|s| s.is_string())
            .map_or_else(|| "continue".to_string(), ToString::to_string);
        return signal_from_word(&word, reason);
    }
    Err(ScriptError::invocation(
        "hook returned an unsupported value".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use jans_cache::LocalCacheProvider;

    use super::*;
    use crate::types::{ScriptSource, ScriptType};

    fn build(code: &str, settings: &RuntimeSettings, services: &ScriptServices) -> ScriptResult<Box<dyn ScriptModule>> {
        let descriptor = ScriptDescriptor::new(
            "test",
            ScriptType::PersonAuthentication,
            ScriptSource::rhai(code),
        );
        RhaiScriptFactory::new().create(&descriptor, settings, services)
    }

    async fn run(code: &str, ctx: &mut ExternalScriptContext) -> ScriptResult<ScriptSignal> {
        let mut module = build(code, &RuntimeSettings::default(), ctx.services())?;
        module.initialize(&BTreeMap::new()).await?;
        module.invoke("authenticate", ctx).await
    }

    fn ctx() -> ExternalScriptContext {
        ExternalScriptContext::new(ScriptServices::default())
            .with_principal("alice")
            .with_attribute("acr", "basic")
    }

    #[tokio::test]
    async fn return_values_map_to_signals() {
        let cases = [
            ("fn authenticate(ctx) { }", ScriptSignal::Continue),
            ("fn authenticate(ctx) { true }", ScriptSignal::Success),
            (
                "fn authenticate(ctx) { false }",
                ScriptSignal::Stop(StopResult::deny("denied by script")),
            ),
            (r#"fn authenticate(ctx) { "allow" }"#, ScriptSignal::Stop(StopResult::allow())),
            (r#"fn authenticate(ctx) { "continue" }"#, ScriptSignal::Continue),
        ];
        for (code, expected) in cases {
            assert_eq!(run(code, &mut ctx()).await.unwrap(), expected, "{code}");
        }
    }

    #[tokio::test]
    async fn map_result_is_merged_into_context() {
        let mut ctx = ctx();
        let signal = run(
            r#"
            fn authenticate(ctx) {
                if ctx.attributes.acr != "basic" { return "deny"; }
                #{ signal: "success", result: #{ principal: ctx.principal, step: 2 } }
            }
            "#,
            &mut ctx,
        )
        .await
        .unwrap();
        assert_eq!(signal, ScriptSignal::Success);
        assert_eq!(ctx.result()["principal"], "alice");
        assert_eq!(ctx.result()["step"], 2);
    }

    #[tokio::test]
    async fn deny_map_carries_reason() {
        let signal = run(
            r#"fn authenticate(ctx) { #{ signal: "deny", reason: "outside office hours" } }"#,
            &mut ctx(),
        )
        .await
        .unwrap();
        assert_eq!(signal, ScriptSignal::Stop(StopResult::deny("outside office hours")));
    }

    #[tokio::test]
    async fn unknown_signal_is_an_error() {
        let err = run(r#"fn authenticate(ctx) { "maybe" }"#, &mut ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Invocation(_)));
    }

    #[tokio::test]
    async fn missing_hook_continues() {
        let signal = run("fn logout(ctx) { false }", &mut ctx()).await.unwrap();
        assert_eq!(signal, ScriptSignal::Continue);
    }

    #[tokio::test]
    async fn init_receives_properties() {
        let services = ScriptServices::default();
        let code = r#"
            fn init(props) { props.realm == "jans" }
            fn authenticate(ctx) { ctx.properties.realm == "jans" }
        "#;
        let mut module = build(code, &RuntimeSettings::default(), &services).unwrap();
        let mut props = BTreeMap::new();
        props.insert("realm".to_string(), "other".to_string());
        let err = module.initialize(&props).await.unwrap_err();
        assert!(matches!(err, ScriptError::Initialization(_)));

        props.insert("realm".to_string(), "jans".to_string());
        module.initialize(&props).await.unwrap();
        let mut ctx = ExternalScriptContext::new(services);
        assert_eq!(
            module.invoke("authenticate", &mut ctx).await.unwrap(),
            ScriptSignal::Success
        );
    }

    #[test]
    fn compile_errors_fail_creation() {
        let err = build("fn authenticate(ctx) {", &RuntimeSettings::default(), &ScriptServices::default())
            .unwrap_err();
        assert!(matches!(err, ScriptError::Compile(_)));
    }

    #[tokio::test]
    async fn runaway_scripts_hit_the_operation_limit() {
        let settings = RuntimeSettings {
            max_operations: 1_000,
            ..RuntimeSettings::default()
        };
        let services = ScriptServices::default();
        let mut module = build("fn authenticate(ctx) { loop { } }", &settings, &services).unwrap();
        module.initialize(&BTreeMap::new()).await.unwrap();
        let mut ctx = ExternalScriptContext::new(services);
        let err = module.invoke("authenticate", &mut ctx).await.unwrap_err();
        assert!(matches!(err, ScriptError::Invocation(_)));
    }

    #[tokio::test]
    async fn cache_functions_share_the_host_cache() {
        let cache = Arc::new(LocalCacheProvider::default());
        let services = ScriptServices::default().with_cache(cache.clone());
        let code = r#"
            fn authenticate(ctx) {
                let seen = cache_get("seen:" + ctx.principal);
                if seen == () {
                    cache_put("seen:" + ctx.principal, #{ count: 1 }, 60);
                    return "continue";
                }
                "success"
            }
        "#;
        let mut module = build(code, &RuntimeSettings::default(), &services).unwrap();
        module.initialize(&BTreeMap::new()).await.unwrap();

        let mut first = ExternalScriptContext::new(services.clone()).with_principal("bob");
        assert_eq!(
            module.invoke("authenticate", &mut first).await.unwrap(),
            ScriptSignal::Continue
        );
        assert_eq!(cache.get("seen:bob").unwrap()["count"], 1);

        let mut second = ExternalScriptContext::new(services).with_principal("bob");
        assert_eq!(
            module.invoke("authenticate", &mut second).await.unwrap(),
            ScriptSignal::Success
        );
    }

    #[tokio::test]
    async fn script_declared_api_version() {
        let services = ScriptServices::default();
        let mut module = build(
            "fn api_version() { 7 } fn authenticate(ctx) { }",
            &RuntimeSettings::default(),
            &services,
        )
        .unwrap();
        module.initialize(&BTreeMap::new()).await.unwrap();
        assert_eq!(module.api_version(), 7);
    }
}
