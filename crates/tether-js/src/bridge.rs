//! Callback Bridge
//!
//! The path from the engine back into the host: native function calls,
//! module resolution and promise rejection events. Each entry point recovers
//! the originating context from the native one, tracks the values it hands
//! over, and talks to the host only through integer references.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rquickjs::function::{Rest, This};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Exception, Function, Module, Runtime, Value as JsValue};
use thiserror::Error;

use crate::context::Context;
use crate::engine::EngineShared;
use crate::error::EngineError;
use crate::scope::EntryScope;
use crate::value::Value;

/// Arguments of a host function call
pub struct CallbackInfo {
    /// Context the call originated in
    pub context: Context,
    pub this: Value,
    pub args: Vec<Value>,
}

/// Module source handed back by the host resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    /// Canonical name, also used as the referrer of nested imports
    pub name: String,
    pub source: String,
}

/// Kind of promise rejection event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RejectionEvent {
    RejectWithNoHandler = 0,
    HandlerAddedAfterReject = 1,
    RejectAfterResolved = 2,
    ResolveAfterResolved = 3,
}

/// A promise rejection reported to the host
pub struct PromiseRejection {
    pub context: Context,
    pub event: RejectionEvent,
    pub promise: Value,
    pub value: Value,
}

/// Failure reported by a host callback
#[derive(Debug, Error)]
pub enum HostError {
    /// Throw this value into the calling script
    #[error("host threw {0:?}")]
    Throw(Value),

    /// Throw an `Error` with this message into the calling script
    #[error("{0}")]
    Message(String),
}

impl From<EngineError> for HostError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Js(js) => HostError::Message(js.message),
            other => HostError::Message(other.to_string()),
        }
    }
}

/// Host capability table consumed by the engine.
///
/// Every method may be called re-entrantly from inside a running script, on the
/// thread that holds the engine.
pub trait HostRegistry: Send + Sync {
    /// Invoke the host function registered under `callback_ref`.
    /// `Ok(None)` returns `undefined` to the script.
    fn invoke(
        &self,
        context_ref: i64,
        callback_ref: i64,
        info: &CallbackInfo,
    ) -> Result<Option<Value>, HostError>;

    /// Resolve `specifier` imported from `referrer`.
    fn resolve_module(
        &self,
        context_ref: i64,
        specifier: &str,
        referrer: &str,
    ) -> Result<ModuleSource, HostError> {
        let _ = (context_ref, referrer);
        Err(HostError::Message(format!("no module loader for '{specifier}'")))
    }

    /// Observe a promise rejection event. Fire and forget.
    fn promise_rejected(&self, context_ref: i64, host_handle: i64, rejection: PromiseRejection) {
        let _ = (context_ref, host_handle, rejection);
    }
}

/// Host function callable from script
pub type HostFunction = Arc<dyn Fn(&CallbackInfo) -> Result<Option<Value>, HostError> + Send + Sync>;

/// Observer of promise rejections
pub type RejectionObserver = Arc<dyn Fn(&PromiseRejection) + Send + Sync>;

#[derive(Default)]
struct TableInner {
    next_ref: i64,
    functions: HashMap<i64, HostFunction>,
    observers: HashMap<i64, RejectionObserver>,
    modules: HashMap<String, String>,
}

impl TableInner {
    fn next_ref(&mut self) -> i64 {
        self.next_ref += 1;
        self.next_ref
    }
}

/// Default [`HostRegistry`]: closures and module sources by reference.
#[derive(Default)]
pub struct CallbackTable {
    inner: RwLock<TableInner>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function and return its reference.
    pub fn register<F>(&self, function: F) -> i64
    where
        F: Fn(&CallbackInfo) -> Result<Option<Value>, HostError> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        let id = inner.next_ref();
        inner.functions.insert(id, Arc::new(function));
        id
    }

    pub fn unregister(&self, callback_ref: i64) -> bool {
        self.inner.write().functions.remove(&callback_ref).is_some()
    }

    /// Register a rejection observer and return its host handle.
    pub fn register_rejection_observer<F>(&self, observer: F) -> i64
    where
        F: Fn(&PromiseRejection) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        let id = inner.next_ref();
        inner.observers.insert(id, Arc::new(observer));
        id
    }

    /// Make `source` importable as `name`.
    pub fn add_module(&self, name: impl Into<String>, source: impl Into<String>) {
        self.inner.write().modules.insert(name.into(), source.into());
    }

    pub fn len(&self) -> usize {
        self.inner.read().functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HostRegistry for CallbackTable {
    fn invoke(
        &self,
        _context_ref: i64,
        callback_ref: i64,
        info: &CallbackInfo,
    ) -> Result<Option<Value>, HostError> {
        let function = self.inner.read().functions.get(&callback_ref).cloned();
        match function {
            Some(function) => function(info),
            None => Err(HostError::Message(format!(
                "unknown callback reference {callback_ref}"
            ))),
        }
    }

    fn resolve_module(
        &self,
        _context_ref: i64,
        specifier: &str,
        _referrer: &str,
    ) -> Result<ModuleSource, HostError> {
        let name = specifier.strip_prefix("./").unwrap_or(specifier);
        let inner = self.inner.read();
        inner
            .modules
            .get(name)
            .map(|source| ModuleSource {
                name: name.to_string(),
                source: source.clone(),
            })
            .ok_or_else(|| HostError::Message(format!("module '{name}' not found")))
    }

    fn promise_rejected(&self, _context_ref: i64, host_handle: i64, rejection: PromiseRejection) {
        let observer = self.inner.read().observers.get(&host_handle).cloned();
        if let Some(observer) = observer {
            observer(&rejection);
        }
    }
}

/// Raise an engine-side failure as a native exception.
fn throw<'js>(ctx: &Ctx<'js>, err: EngineError) -> rquickjs::Error {
    let message = match err {
        EngineError::Js(js) => js.message,
        other => other.to_string(),
    };
    Exception::throw_message(ctx, &message)
}

/// Native function that forwards calls to the host under `callback_ref`.
pub(crate) fn new_trampoline<'js>(
    ctx: &Ctx<'js>,
    shared: &Arc<EngineShared>,
    callback_ref: i64,
) -> rquickjs::Result<Function<'js>> {
    let shared = Arc::downgrade(shared);
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, this: This<JsValue<'js>>, args: Rest<JsValue<'js>>| {
            dispatch(&shared, ctx, callback_ref, this.0, args.0)
        },
    )
}

fn dispatch<'js>(
    shared: &Weak<EngineShared>,
    ctx: Ctx<'js>,
    callback_ref: i64,
    this: JsValue<'js>,
    args: Vec<JsValue<'js>>,
) -> rquickjs::Result<JsValue<'js>> {
    let Some(shared) = shared.upgrade() else {
        return Err(Exception::throw_internal(&ctx, "engine has been disposed"));
    };
    let Some((context, context_ref)) = shared.context_for(&ctx) else {
        return Err(Exception::throw_internal(&ctx, "calling context has been disposed"));
    };
    let Some(host) = shared.host() else {
        return Err(Exception::throw_internal(&ctx, "no host registry installed"));
    };

    let scope = EntryScope::new(shared.clone(), context, ctx.clone());
    let this = scope.track(this).map_err(|e| throw(&ctx, e))?;
    let args = args
        .into_iter()
        .map(|arg| scope.track(arg))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| throw(&ctx, e))?;
    let info = CallbackInfo {
        context: Context::from_parts(shared.clone(), context),
        this,
        args,
    };

    tracing::trace!("Invoking host callback {}", callback_ref);
    match host.invoke(context_ref, callback_ref, &info) {
        Ok(Some(result)) => scope.restore(&result).map_err(|e| throw(&ctx, e)),
        Ok(None) => Ok(JsValue::new_undefined(ctx)),
        Err(HostError::Throw(thrown)) => {
            let thrown = scope.restore(&thrown).map_err(|e| throw(&ctx, e))?;
            Err(ctx.throw(thrown))
        }
        Err(HostError::Message(message)) => {
            tracing::warn!("Host callback {} failed: {}", callback_ref, message);
            Err(Exception::throw_message(&ctx, &message))
        }
    }
}

/// Forward rejection events to the host observer set on the engine.
pub(crate) fn install_rejection_tracker(runtime: &Runtime, shared: Weak<EngineShared>) {
    let tracker: Box<dyn for<'a> Fn(Ctx<'a>, JsValue<'a>, JsValue<'a>, bool) + Send + 'static> =
        Box::new(move |ctx, promise, reason, is_handled| {
            notify_rejection(&shared, ctx, promise, reason, is_handled);
        });
    runtime.set_host_promise_rejection_tracker(Some(tracker));
}

fn notify_rejection<'js>(
    shared: &Weak<EngineShared>,
    ctx: Ctx<'js>,
    promise: JsValue<'js>,
    reason: JsValue<'js>,
    is_handled: bool,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let Some(host_handle) = *shared.rejection_handle.read() else {
        return;
    };
    let (Some(host), Some((context, context_ref))) = (shared.host(), shared.context_for(&ctx)) else {
        return;
    };

    let scope = EntryScope::new(shared.clone(), context, ctx);
    let tracked = scope
        .track(promise)
        .and_then(|promise| Ok((promise, scope.track(reason)?)));
    let (promise, value) = match tracked {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!("Dropping promise rejection event: {}", err);
            return;
        }
    };

    let event = if is_handled {
        RejectionEvent::HandlerAddedAfterReject
    } else {
        RejectionEvent::RejectWithNoHandler
    };
    host.promise_rejected(
        context_ref,
        host_handle,
        PromiseRejection {
            context: Context::from_parts(shared.clone(), context),
            event,
            promise,
            value,
        },
    );
}

/// Module resolver backed by [`HostRegistry::resolve_module`]
pub(crate) struct HostResolver {
    shared: Weak<EngineShared>,
}

impl HostResolver {
    pub(crate) fn new(shared: Weak<EngineShared>) -> Self {
        Self { shared }
    }
}

impl Resolver for HostResolver {
    fn resolve<'js>(&mut self, ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let import_error = |reason: &str| {
            Exception::throw_message(ctx, &format!("Error importing module '{name}': {reason}"))
        };
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| import_error("engine has been disposed"))?;
        let (_, context_ref) = shared
            .context_for(ctx)
            .ok_or_else(|| import_error("importing context has been disposed"))?;
        let host = shared
            .host()
            .ok_or_else(|| import_error("no host registry installed"))?;

        match host.resolve_module(context_ref, name, base) {
            Ok(module) => {
                shared.modules.lock().insert(module.name.clone(), module.source);
                Ok(module.name)
            }
            Err(err) => Err(import_error(&err.to_string())),
        }
    }
}

/// Declares modules from sources stashed by [`HostResolver`]
pub(crate) struct HostLoader {
    shared: Weak<EngineShared>,
}

impl HostLoader {
    pub(crate) fn new(shared: Weak<EngineShared>) -> Self {
        Self { shared }
    }
}

impl Loader for HostLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = self
            .shared
            .upgrade()
            .and_then(|shared| shared.modules.lock().remove(name));
        match source {
            Some(source) => Module::declare(ctx.clone(), name, source),
            None => Err(Exception::throw_message(
                ctx,
                &format!("Error importing module '{name}': source unavailable"),
            )),
        }
    }
}
