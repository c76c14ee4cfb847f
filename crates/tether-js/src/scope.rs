//! Scoped Entry
//!
//! Every operation that touches the engine heap runs through [`enter`]: take the
//! engine lock, open the runtime scope, resolve the target context and trap any
//! exception before returning. A thread that is already inside the engine (a host
//! callback calling back into script) reuses the open scope instead of locking
//! the runtime a second time.

use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rquickjs::{Ctx, Persistent, Value as JsValue, qjs};

use crate::engine::{ContextId, EngineCell, EngineShared};
use crate::error::{EngineError, Result};
use crate::exception;
use crate::registry::Registration;
use crate::value::Value;

/// GC-rooted engine value owned by a context registry
#[derive(Clone)]
pub(crate) struct Rooted(Persistent<JsValue<'static>>);

// SAFETY: rooted values are created, restored and dropped only by the thread
// holding the engine lock.
unsafe impl Send for Rooted {}

impl Rooted {
    pub(crate) fn save<'js>(ctx: &Ctx<'js>, value: JsValue<'js>) -> Self {
        Self(Persistent::save(ctx, value))
    }

    pub(crate) fn restore<'js>(self, ctx: &Ctx<'js>) -> Result<JsValue<'js>> {
        self.0.restore(ctx).map_err(|_| EngineError::ForeignEngine)
    }
}

/// Resets the nesting depth when the outermost entry unwinds
struct Outermost<'a>(&'a EngineCell);

impl Drop for Outermost<'_> {
    fn drop(&mut self) {
        self.0.depth.set(0);
    }
}

/// Run `f` inside the engine with `context` entered.
pub(crate) fn enter<R, F>(shared: &Arc<EngineShared>, context: ContextId, f: F) -> Result<R>
where
    F: for<'js> FnOnce(&EntryScope<'js>) -> Result<R> + Send,
    R: Send,
{
    let cell = shared.lock();

    if cell.depth.get() > 0 {
        let raw = cell.state.borrow().slot(context)?.native.as_raw();
        // SAFETY: the runtime is already held by this thread further up the
        // stack and `raw` is a live context of that runtime.
        let ctx = unsafe { Ctx::from_raw(raw) };
        let scope = EntryScope::new(shared.clone(), context, ctx);
        return f(&scope);
    }

    // Only the Arc is cloned: every rquickjs::Context value frees the native
    // context once when dropped.
    let native = Arc::clone(&cell.state.borrow().slot(context)?.native);
    shared.terminating.store(false, Ordering::SeqCst);
    cell.depth.set(1);
    let outermost = Outermost(&cell);

    let result = native.with(|ctx| {
        let scope = EntryScope::new(shared.clone(), context, ctx);
        f(&scope)
    });
    drop(native);

    shared.settle(&cell);
    drop(outermost);
    result
}

/// An open entry into one context
pub(crate) struct EntryScope<'js> {
    shared: Arc<EngineShared>,
    context: ContextId,
    ctx: Ctx<'js>,
}

impl<'js> EntryScope<'js> {
    pub(crate) fn new(shared: Arc<EngineShared>, context: ContextId, ctx: Ctx<'js>) -> Self {
        Self {
            shared,
            context,
            ctx,
        }
    }

    pub(crate) fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Root `value` in the entered context and hand out a host handle for it.
    pub(crate) fn track(&self, value: JsValue<'js>) -> Result<Value> {
        let cell = self.shared.lock();
        let mut state = cell.state.borrow_mut();
        let slot = state.slot_mut(self.context)?;
        let id = slot
            .values
            .register(Registration::Fresh(Rooted::save(&self.ctx, value)));
        Ok(Value::from_parts(self.shared.clone(), self.context, id))
    }

    /// Dereference a host handle. Handles of any context of this engine work.
    pub(crate) fn restore(&self, value: &Value) -> Result<JsValue<'js>> {
        if !Arc::ptr_eq(&self.shared, value.shared()) {
            return Err(EngineError::ForeignEngine);
        }
        let rooted = {
            let cell = self.shared.lock();
            let state = cell.state.borrow();
            state
                .slot(value.context_id())?
                .values
                .get(value.id())
                .cloned()
                .ok_or(EngineError::Released(value.id().get()))?
        };
        rooted.restore(&self.ctx)
    }

    /// Translate a failed engine call, clearing the pending exception.
    pub(crate) fn trap<T>(&self, result: rquickjs::Result<T>) -> Result<T> {
        result.map_err(|err| exception::translate_error(&self.shared, &self.ctx, err))
    }

    /// Evaluate a classic script. `origin` is the resource name in stack frames.
    pub(crate) fn eval_script(&self, source: &str, origin: &str) -> Result<JsValue<'js>> {
        self.eval_global(source, origin, false)
    }

    /// Parse a classic script without running it.
    pub(crate) fn check_syntax(&self, source: &str, origin: &str) -> Result<()> {
        self.eval_global(source, origin, true).map(drop)
    }

    fn eval_global(&self, source: &str, origin: &str, compile_only: bool) -> Result<JsValue<'js>> {
        let source = c_string(source)?;
        let origin = c_string(origin)?;
        let flags = if compile_only {
            qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY
        } else {
            qjs::JS_EVAL_TYPE_GLOBAL
        };

        // SAFETY: both strings are NUL-terminated and outlive the call, and the
        // returned value is owned by the wrapper.
        let value = unsafe {
            let raw = qjs::JS_Eval(
                self.ctx.as_raw().as_ptr(),
                source.as_ptr(),
                source.as_bytes().len() as _,
                origin.as_ptr(),
                flags as _,
            );
            JsValue::from_raw(self.ctx.clone(), raw)
        };
        if value.is_exception() {
            return self.trap(Err(rquickjs::Error::Exception));
        }
        Ok(value)
    }
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text).map_err(|err| EngineError::Type {
        expected: "text without NUL bytes",
        found: format!("NUL byte at offset {}", err.nul_position()),
    })
}
