//! Unbound Scripts
//!
//! Scripts compiled once against the engine and run in any of its contexts.
//! They belong to the bookkeeping context and are released with it.

use std::sync::Arc;

use crate::context::Context;
use crate::engine::{ContextId, Engine, EngineShared};
use crate::error::{EngineError, Result};
use crate::scope;
use crate::value::Value;

/// Stored form of a compiled script
pub(crate) struct UnboundScriptSlot {
    pub(crate) source: Arc<str>,
    pub(crate) origin: Arc<str>,
}

/// Handle to a script compiled independently of any context
#[derive(Clone)]
pub struct UnboundScript {
    shared: Arc<EngineShared>,
    index: usize,
}

impl UnboundScript {
    /// Check `source` for syntax errors and keep it for later runs.
    pub(crate) fn compile(engine: &Engine, source: &str, origin: &str) -> Result<Self> {
        let shared = engine.shared.clone();
        scope::enter(&shared, ContextId::BOOKKEEPING, |scope| {
            scope.check_syntax(source, origin)
        })?;

        let cell = shared.lock();
        let index = {
            let mut state = cell.state.borrow_mut();
            let slot = state.slot_mut(ContextId::BOOKKEEPING)?;
            slot.scripts.push(UnboundScriptSlot {
                source: Arc::from(source),
                origin: Arc::from(origin),
            });
            slot.scripts.len() - 1
        };
        drop(cell);
        tracing::trace!("Compiled unbound script {}", origin);

        Ok(Self { shared, index })
    }

    pub fn origin(&self) -> Result<String> {
        self.stored().map(|(_, origin)| origin.to_string())
    }

    /// Run the script in `context`.
    pub fn run(&self, context: &Context) -> Result<Value> {
        if !Arc::ptr_eq(&self.shared, context.shared()) {
            return Err(EngineError::ForeignEngine);
        }
        let (source, origin) = self.stored()?;
        context.run_script(&source, &origin)
    }

    fn stored(&self) -> Result<(Arc<str>, Arc<str>)> {
        let cell = self.shared.lock();
        let state = cell.state.borrow();
        let script = state
            .slot(ContextId::BOOKKEEPING)?
            .scripts
            .get(self.index)
            .ok_or(EngineError::Disposed)?;
        Ok((script.source.clone(), script.origin.clone()))
    }
}

impl std::fmt::Debug for UnboundScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnboundScript").field("index", &self.index).finish()
    }
}
