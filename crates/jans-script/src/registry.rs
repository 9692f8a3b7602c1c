//! Registry of script factories by engine name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ScriptError, ScriptResult};
use crate::module::ScriptFactory;
use crate::native::NativeScriptFactory;
use crate::rhai_module::RhaiScriptFactory;

/// Maps engine names to the factories that build their modules.
#[derive(Debug, Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, Arc<dyn ScriptFactory>>,
}

impl FactoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Rhai engine and the given native modules.
    #[must_use]
    pub fn standard(native: Arc<NativeScriptFactory>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(RhaiScriptFactory::new()));
        registry.register(native);
        registry
    }

    /// Registers a factory, replacing any factory for the same engine.
    pub fn register(&self, factory: Arc<dyn ScriptFactory>) {
        let engine = factory.engine().to_string();
        if self.factories.insert(engine.clone(), factory).is_some() {
            tracing::debug!(engine = %engine, "Replaced script factory");
        }
    }

    /// Returns the factory for an engine.
    pub fn get(&self, engine: &str) -> ScriptResult<Arc<dyn ScriptFactory>> {
        self.factories
            .get(engine)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| ScriptError::UnknownEngine(engine.to_string()))
    }

    /// Checks if an engine is registered.
    #[must_use]
    pub fn has_engine(&self, engine: &str) -> bool {
        self.factories.contains_key(engine)
    }

    /// Lists registered engines, sorted.
    #[must_use]
    pub fn engines(&self) -> Vec<String> {
        let mut engines: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        engines.sort();
        engines
    }

    /// Validates that required engines are registered.
    ///
    /// ## Errors
    ///
    /// Returns an error naming the first missing engine.
    pub fn validate_required(&self, engines: &[&str]) -> ScriptResult<()> {
        for engine in engines {
            if !self.has_engine(engine) {
                return Err(ScriptError::UnknownEngine((*engine).to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let registry = FactoryRegistry::new();
        assert!(registry.engines().is_empty());
        assert!(!registry.has_engine("rhai"));
    }

    #[test]
    fn standard_registers_both_engines() {
        let registry = FactoryRegistry::standard(Arc::new(NativeScriptFactory::new()));
        assert_eq!(registry.engines(), ["native", "rhai"]);
        assert!(registry.validate_required(&["rhai", "native"]).is_ok());
    }

    #[test]
    fn missing_engine_is_reported() {
        let registry = FactoryRegistry::new();
        let err = registry.get("jython").unwrap_err();
        assert!(matches!(err, ScriptError::UnknownEngine(ref e) if e == "jython"));
        assert!(registry.validate_required(&["rhai"]).is_err());
    }
}
