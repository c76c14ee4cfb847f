//! Execution Context
//!
//! One global scope bound to an [`Engine`]. The context owns the registry of
//! every value handed to the host and the unbound scripts compiled against it,
//! and releases both in one pass when disposed.

use std::sync::Arc;

use rquickjs::{Module, Object, Value as JsValue};

use crate::engine::{ContextId, Engine, EngineShared};
use crate::error::{EngineError, Result};
use crate::registry::{HandleRegistry, Registration};
use crate::scope::{self, Rooted};
use crate::script::UnboundScriptSlot;
use crate::template::ObjectTemplate;
use crate::value::Value;

/// Engine-side record of a live context
pub(crate) struct ContextSlot {
    pub(crate) native: Arc<rquickjs::Context>,
    pub(crate) host_ref: i64,
    pub(crate) values: HandleRegistry<Rooted>,
    pub(crate) scripts: Vec<UnboundScriptSlot>,
}

impl ContextSlot {
    pub(crate) fn new(native: Arc<rquickjs::Context>, host_ref: i64) -> Self {
        Self {
            native,
            host_ref,
            values: HandleRegistry::new(),
            scripts: Vec::new(),
        }
    }

    /// Release every tracked value and script, leaving only the native context.
    pub(crate) fn into_native(mut self) -> Arc<rquickjs::Context> {
        drop(self.values.drain());
        self.scripts.clear();
        self.native
    }
}

/// Handle to an execution context
#[derive(Clone)]
pub struct Context {
    shared: Arc<EngineShared>,
    id: ContextId,
}

impl Context {
    /// Create a context on `engine`, optionally seeding its global object from
    /// `template`. `host_ref` is passed back to the host with every callback
    /// that originates in this context.
    pub fn new(engine: &Engine, template: Option<&ObjectTemplate>, host_ref: i64) -> Result<Self> {
        let shared = engine.shared.clone();
        let id = {
            let cell = shared.lock();
            if cell.state.borrow().disposed {
                return Err(EngineError::Disposed);
            }
            if cell.depth.get() > 0 {
                return Err(EngineError::Reentrant("context creation"));
            }
            let native = rquickjs::Context::full(&shared.runtime)
                .map_err(|e| EngineError::Setup(e.to_string()))?;
            cell.state.borrow_mut().insert(native, host_ref)
        };
        tracing::debug!("Created context {} (host ref {})", id.get(), host_ref);

        let context = Self { shared, id };
        if let Some(template) = template {
            if let Err(err) = template.apply_to_global(&context) {
                context.dispose();
                return Err(err);
            }
        }
        Ok(context)
    }

    pub(crate) fn from_parts(shared: Arc<EngineShared>, id: ContextId) -> Self {
        Self { shared, id }
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn engine(&self) -> Engine {
        Engine {
            shared: self.shared.clone(),
        }
    }

    /// The integer reference installed at creation, or `None` once disposed.
    pub fn host_ref(&self) -> Option<i64> {
        let cell = self.shared.lock();
        let state = cell.state.borrow();
        state.slot(self.id).ok().map(|slot| slot.host_ref)
    }

    /// Number of values currently tracked. Zero once disposed.
    pub fn retained_count(&self) -> usize {
        let cell = self.shared.lock();
        let state = cell.state.borrow();
        state.slot(self.id).map(|slot| slot.values.len()).unwrap_or(0)
    }

    pub fn is_disposed(&self) -> bool {
        let cell = self.shared.lock();
        let state = cell.state.borrow();
        state.slot(self.id).is_err()
    }

    /// Release every tracked value and script, then the context itself.
    /// Disposing twice is a no-op. Handles into the context fail afterwards.
    pub fn dispose(&self) {
        let cell = self.shared.lock();
        let slot = cell.state.borrow_mut().remove(self.id);
        let Some(slot) = slot else {
            return;
        };
        tracing::debug!(
            "Disposing context {} ({} values retained)",
            self.id.get(),
            slot.values.len()
        );

        let native = slot.into_native();
        if cell.depth.get() > 0 {
            cell.state.borrow_mut().graveyard.push(native);
        } else {
            drop(native);
        }
    }

    /// Make `value` host-visible in this context.
    ///
    /// A handle already tracked here comes back unchanged. A handle from another
    /// context of the same engine is adopted under a fresh id.
    pub fn register(&self, value: &Value) -> Result<Value> {
        if !Arc::ptr_eq(&self.shared, value.shared()) {
            return Err(EngineError::ForeignEngine);
        }
        if value.context_id() == self.id {
            let cell = self.shared.lock();
            let mut state = cell.state.borrow_mut();
            let slot = state.slot_mut(self.id)?;
            if slot.values.contains(value.id()) {
                slot.values.register(Registration::Tracked(value.id()));
                return Ok(value.clone());
            }
            return Err(EngineError::Released(value.id().get()));
        }
        scope::enter(&self.shared, self.id, |scope| {
            let restored = scope.restore(value)?;
            scope.track(restored)
        })
    }

    /// The global object
    pub fn global(&self) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            scope.track(scope.ctx().globals().into_value())
        })
    }

    /// Evaluate a classic script. `origin` names the code in error locations.
    pub fn run_script(&self, source: &str, origin: &str) -> Result<Value> {
        tracing::trace!("Running script {}", origin);
        scope::enter(&self.shared, self.id, |scope| {
            let value = scope.eval_script(source, origin)?;
            scope.track(value)
        })
    }

    /// Evaluate an ES module named `name`. Imports are resolved through the
    /// host registry. Returns the module's evaluation promise.
    pub fn run_module(&self, source: &str, name: &str) -> Result<Value> {
        tracing::trace!("Running module {}", name);
        scope::enter(&self.shared, self.id, |scope| {
            let declared = scope.trap(Module::declare(scope.ctx().clone(), name, source))?;
            let (_module, promise) = scope.trap(declared.eval())?;
            scope.track(promise.into_value())
        })
    }

    pub fn parse_json(&self, text: &str) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            let value = scope.trap(scope.ctx().json_parse(text))?;
            scope.track(value)
        })
    }

    pub fn undefined(&self) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            scope.track(JsValue::new_undefined(scope.ctx().clone()))
        })
    }

    pub fn null(&self) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            scope.track(JsValue::new_null(scope.ctx().clone()))
        })
    }

    pub fn boolean(&self, value: bool) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            scope.track(JsValue::new_bool(scope.ctx().clone(), value))
        })
    }

    pub fn number(&self, value: f64) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            scope.track(JsValue::new_number(scope.ctx().clone(), value))
        })
    }

    pub fn string(&self, value: &str) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            let string = scope.trap(rquickjs::String::from_str(scope.ctx().clone(), value))?;
            scope.track(string.into_value())
        })
    }

    pub fn object(&self) -> Result<Value> {
        scope::enter(&self.shared, self.id, |scope| {
            let object = scope.trap(Object::new(scope.ctx().clone()))?;
            scope.track(object.into_value())
        })
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.id == other.id
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id.get()).finish()
    }
}
