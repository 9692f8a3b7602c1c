//! Per-invocation context handed to script modules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use jans_cache::{CacheProvider, LocalCacheProvider};
use jans_core::{MetricsSink, NoopMetrics};
use jans_ldap::DirectoryPools;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::ScriptKey;

/// Shared side channels a module may use.
///
/// These are the only shared state a module can reach. The reload
/// coordinator and the runtime itself are deliberately absent.
#[derive(Debug, Clone)]
pub struct ScriptServices {
    /// Shared cache.
    pub cache: Arc<dyn CacheProvider>,
    /// Directory pools, when configured.
    pub directory: Option<Arc<DirectoryPools>>,
    /// Metrics sink.
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for ScriptServices {
    fn default() -> Self {
        Self {
            cache: Arc::new(LocalCacheProvider::default()),
            directory: None,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl ScriptServices {
    /// Uses the given cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = cache;
        self
    }

    /// Uses the given directory pools.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<DirectoryPools>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Uses the given metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Request-scoped context.
///
/// Request attributes are read-only; modules report back through the result
/// map. The credential never appears in `Debug` output.
#[derive(Clone)]
pub struct ExternalScriptContext {
    correlation_id: Uuid,
    principal: Option<String>,
    credential: Option<String>,
    attributes: BTreeMap<String, String>,
    result: Map<String, Value>,
    current: Option<(ScriptKey, u64)>,
    services: ScriptServices,
}

impl ExternalScriptContext {
    /// Creates an empty context with a fresh correlation id.
    #[must_use]
    pub fn new(services: ScriptServices) -> Self {
        Self {
            correlation_id: Uuid::now_v7(),
            principal: None,
            credential: None,
            attributes: BTreeMap::new(),
            result: Map::new(),
            current: None,
            services,
        }
    }

    /// Sets the principal.
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Sets the credential presented with the request.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Adds a request attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Uses the given correlation id.
    #[must_use]
    pub const fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Correlation id of the request.
    #[must_use]
    pub const fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Principal of the request.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Credential of the request.
    #[must_use]
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Returns a request attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// All request attributes.
    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Result values written by modules.
    #[must_use]
    pub const fn result(&self) -> &Map<String, Value> {
        &self.result
    }

    /// Writes a result value.
    pub fn set_result(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.result.insert(key.into(), value.into());
    }

    /// Merges a map of result values.
    pub fn merge_result(&mut self, values: Map<String, Value>) {
        self.result.extend(values);
    }

    /// Consumes the context and returns the result map.
    #[must_use]
    pub fn into_result(self) -> Map<String, Value> {
        self.result
    }

    /// Script currently running and its revision.
    #[must_use]
    pub fn current_script(&self) -> Option<(&ScriptKey, u64)> {
        self.current.as_ref().map(|(key, rev)| (key, *rev))
    }

    pub(crate) fn set_current(&mut self, key: Option<(ScriptKey, u64)>) {
        self.current = key;
    }

    /// Side channels.
    #[must_use]
    pub const fn services(&self) -> &ScriptServices {
        &self.services
    }
}

impl fmt::Debug for ExternalScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalScriptContext")
            .field("correlation_id", &self.correlation_id)
            .field("principal", &self.principal)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("attributes", &self.attributes)
            .field("result", &self.result)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
