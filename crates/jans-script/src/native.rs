//! Modules implemented in Rust and selected by name.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::context::ScriptServices;
use crate::error::{ScriptError, ScriptResult};
use crate::module::{ScriptFactory, ScriptModule};
use crate::runtime::RuntimeSettings;
use crate::types::ScriptDescriptor;

/// Engine name of native modules.
pub const ENGINE: &str = "native";

/// Builds a native module for a descriptor.
pub type NativeConstructor =
    Arc<dyn Fn(&ScriptDescriptor, &ScriptServices) -> Box<dyn ScriptModule> + Send + Sync>;

/// Factory for native modules. The descriptor's `code` names the module.
#[derive(Default)]
pub struct NativeScriptFactory {
    constructors: DashMap<String, NativeConstructor>,
}

impl fmt::Debug for NativeScriptFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeScriptFactory")
            .field("modules", &self.names())
            .finish()
    }
}

impl NativeScriptFactory {
    /// Creates a factory without modules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named module constructor.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&ScriptDescriptor, &ScriptServices) -> Box<dyn ScriptModule> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    /// Registered module names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl ScriptFactory for NativeScriptFactory {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn create(
        &self,
        descriptor: &ScriptDescriptor,
        _settings: &RuntimeSettings,
        services: &ScriptServices,
    ) -> ScriptResult<Box<dyn ScriptModule>> {
        let name = descriptor.source.code.trim();
        let constructor = self
            .constructors
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| ScriptError::UnknownModule(name.to_string()))?;
        Ok(constructor(descriptor, services))
    }
}
