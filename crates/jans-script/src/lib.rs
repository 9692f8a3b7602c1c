//! # jans-script
//!
//! Hot-reloadable script extensions for the Janssen authentication engine.
//!
//! Scripts are described by [`ScriptDescriptor`]s and built into
//! [`ScriptModule`]s by the [`ScriptFactory`] registered for their engine.
//! The [`ScriptRuntime`] keeps one Active revision per script and dispatches
//! hook calls through an immutable chain per [`ScriptType`].
//!
//! ## Design
//!
//! - [`ScriptModule`] - Capability trait of one loaded revision
//! - [`ScriptFactory`] / [`FactoryRegistry`] - Engines by name
//! - [`RhaiScriptFactory`] - Sandboxed Rhai scripts
//! - [`NativeScriptFactory`] - Rust modules selected by name
//! - [`ExternalScriptContext`] - Request-scoped context with the sanctioned
//!   side channels

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod module;
pub mod native;
pub mod registry;
pub mod rhai_module;
pub mod runtime;
pub mod types;

pub use context::{ExternalScriptContext, ScriptServices};
pub use error::{ScriptError, ScriptResult};
pub use module::{ScriptFactory, ScriptModule, CURRENT_API_VERSION};
pub use native::{NativeConstructor, NativeScriptFactory};
pub use registry::FactoryRegistry;
pub use rhai_module::RhaiScriptFactory;
pub use runtime::{LoadedModule, RuntimeSettings, ScriptRuntime};
pub use types::{
    Decision, Invocation, ScriptDescriptor, ScriptKey, ScriptSignal, ScriptSource, ScriptState,
    ScriptStatus, ScriptType, StopResult, TraceEntry, TraceOutcome,
};
