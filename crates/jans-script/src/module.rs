//! Module capability traits.
//!
//! A [`ScriptModule`] is one loaded revision of a script. Modules are built by
//! the [`ScriptFactory`] registered for the descriptor's engine, initialized
//! once and then shared read-only by every in-flight invocation.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::context::{ExternalScriptContext, ScriptServices};
use crate::error::ScriptResult;
use crate::runtime::RuntimeSettings;
use crate::types::{ScriptDescriptor, ScriptSignal};

/// Highest module API version this runtime speaks.
pub const CURRENT_API_VERSION: u32 = 1;

/// A loaded script module.
#[async_trait]
pub trait ScriptModule: Send + Sync + Debug {
    /// API version the module was written against.
    fn api_version(&self) -> u32 {
        CURRENT_API_VERSION
    }

    /// Initialization hook, called once before the module serves.
    async fn initialize(&mut self, properties: &BTreeMap<String, String>) -> ScriptResult<()>;

    /// Handles one hook call.
    ///
    /// Modules may only mutate the request context.
    async fn invoke(&self, method: &str, ctx: &mut ExternalScriptContext)
        -> ScriptResult<ScriptSignal>;

    /// Cleanup hook, called once after the last invocation released this
    /// revision.
    fn destroy(&self) {}
}

/// Builds modules for one engine.
pub trait ScriptFactory: Send + Sync + Debug {
    /// Engine name matched against [`crate::ScriptSource::engine`].
    fn engine(&self) -> &str;

    /// Builds an uninitialized module.
    fn create(
        &self,
        descriptor: &ScriptDescriptor,
        settings: &RuntimeSettings,
        services: &ScriptServices,
    ) -> ScriptResult<Box<dyn ScriptModule>>;
}
