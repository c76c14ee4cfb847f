//! Tether JS
//!
//! QuickJS embedding with host-tracked handles.
//!
//! Features:
//! - Engines, contexts and values exposed as plain handles
//! - Per-context value registry, released in bulk on dispose
//! - Re-entrant host callbacks, module resolution and promise rejection events
//! - Cross-thread termination and heap-limit recovery

mod bridge;
mod config;
mod context;
mod engine;
mod error;
mod exception;
mod registry;
mod scope;
mod script;
mod template;
mod value;

pub use bridge::{
    CallbackInfo, CallbackTable, HostError, HostFunction, HostRegistry, ModuleSource,
    PromiseRejection, RejectionEvent, RejectionObserver,
};
pub use config::{EngineConfig, MicrotaskPolicy};
pub use context::Context;
pub use engine::{ContextId, Engine, HeapStatistics};
pub use error::{EngineError, JsError, Result, TERMINATED_MESSAGE};
pub use registry::ValueId;
pub use script::UnboundScript;
pub use template::{FunctionTemplate, ObjectTemplate, TemplateEntry};
pub use value::{PromiseState, Value};

use std::sync::OnceLock;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static PROCESS: OnceLock<EngineConfig> = OnceLock::new();

/// Process-wide initialization with the default configuration.
///
/// Returns `true` on the call that performed it. Later calls do nothing.
pub fn initialize_process() -> bool {
    initialize_process_with(EngineConfig::default())
}

/// Process-wide initialization. `config` becomes the default for [`Engine::new`].
pub fn initialize_process_with(config: EngineConfig) -> bool {
    let mut first = false;
    PROCESS.get_or_init(|| {
        first = true;
        tracing::info!("Initializing tether-js {}", VERSION);
        config
    });
    first
}

/// The configuration installed by process initialization
pub fn process_config() -> EngineConfig {
    PROCESS.get().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_process_is_idempotent() {
        initialize_process();
        assert!(!initialize_process());
        assert!(!initialize_process_with(EngineConfig::default().with_heap_limit(1)));
        assert_ne!(process_config().heap_limit, Some(1));
    }
}
