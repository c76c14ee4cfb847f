//! Engine
//!
//! One QuickJS runtime with its own heap, collector and lock domain. Every
//! context, value and script created against it is tracked in [`EngineState`]
//! so disposal can free the whole set deterministically.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use rquickjs::{Ctx, Runtime};
use serde::Serialize;

use crate::bridge::{self, HostLoader, HostRegistry, HostResolver};
use crate::config::{EngineConfig, MicrotaskPolicy};
use crate::context::{Context, ContextSlot};
use crate::error::{EngineError, Result};
use crate::script::UnboundScript;
use crate::template::{FunctionTemplate, ObjectTemplate};
use crate::value::Value;

/// Identifier of a context within its engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// The hidden context used when no explicit one is given.
    pub(crate) const BOOKKEEPING: ContextId = ContextId(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Mutable engine bookkeeping, only touched by the lock holder
pub(crate) struct EngineState {
    pub(crate) contexts: HashMap<ContextId, ContextSlot>,
    /// Native context address to wrapper id. Lookup only, never owning.
    pub(crate) by_raw: HashMap<usize, ContextId>,
    /// Native contexts disposed from inside a callback, freed at the outermost exit
    pub(crate) graveyard: Vec<Arc<rquickjs::Context>>,
    pub(crate) next_context: u64,
    pub(crate) disposed: bool,
}

impl EngineState {
    pub(crate) fn slot(&self, id: ContextId) -> Result<&ContextSlot> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        self.contexts.get(&id).ok_or(EngineError::ContextDisposed(id.get()))
    }

    pub(crate) fn slot_mut(&mut self, id: ContextId) -> Result<&mut ContextSlot> {
        if self.disposed {
            return Err(EngineError::Disposed);
        }
        self.contexts
            .get_mut(&id)
            .ok_or(EngineError::ContextDisposed(id.get()))
    }

    /// Bind a native context to a fresh wrapper id.
    pub(crate) fn insert(&mut self, native: rquickjs::Context, host_ref: i64) -> ContextId {
        let id = ContextId(self.next_context);
        self.next_context += 1;
        self.by_raw.insert(native.as_raw().as_ptr() as usize, id);
        self.contexts.insert(id, ContextSlot::new(Arc::new(native), host_ref));
        id
    }

    pub(crate) fn remove(&mut self, id: ContextId) -> Option<ContextSlot> {
        let slot = self.contexts.remove(&id)?;
        self.by_raw.remove(&(slot.native.as_raw().as_ptr() as usize));
        Some(slot)
    }
}

/// Lock-protected part of the engine
pub(crate) struct EngineCell {
    /// Nesting depth of scoped entries on the lock-holding thread
    pub(crate) depth: Cell<usize>,
    pub(crate) state: RefCell<EngineState>,
}

/// State shared by every handle of one engine
pub(crate) struct EngineShared {
    pub(crate) cell: ReentrantMutex<EngineCell>,
    pub(crate) terminating: Arc<AtomicBool>,
    pub(crate) host: RwLock<Option<Arc<dyn HostRegistry>>>,
    pub(crate) rejection_handle: RwLock<Option<i64>>,
    /// Sources handed over by the resolver, keyed by canonical module name
    pub(crate) modules: Mutex<HashMap<String, String>>,
    raise_pending: AtomicBool,
    ceiling_raised: AtomicBool,
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Runtime,
}

impl EngineShared {
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, EngineCell> {
        self.cell.lock()
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub(crate) fn request_termination(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    /// Heap ran out: stop the running script and lift the ceiling once it unwinds.
    pub(crate) fn near_heap_limit(&self) {
        self.request_termination();
        self.raise_pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn host(&self) -> Option<Arc<dyn HostRegistry>> {
        self.host.read().clone()
    }

    /// Recover the wrapper id and host reference of a native context.
    pub(crate) fn context_for(&self, ctx: &Ctx<'_>) -> Option<(ContextId, i64)> {
        let guard = self.lock();
        let state = guard.state.borrow();
        let id = *state.by_raw.get(&(ctx.as_raw().as_ptr() as usize))?;
        state.contexts.get(&id).map(|slot| (id, slot.host_ref))
    }

    /// Work deferred to the end of the outermost scoped entry. Runs with the
    /// depth still marked so callbacks fired by promise jobs nest correctly.
    pub(crate) fn settle(&self, cell: &EngineCell) {
        let disposed = cell.state.borrow().disposed;

        if !disposed && self.config.microtasks == MicrotaskPolicy::Auto {
            self.drain_jobs();
        }

        if self.raise_pending.swap(false, Ordering::SeqCst)
            && !self.ceiling_raised.swap(true, Ordering::SeqCst)
        {
            if let Some(limit) = self.config.heap_limit {
                let raised = limit.saturating_mul(2);
                tracing::warn!("Heap limit reached, raising ceiling to {} bytes", raised);
                self.runtime.set_memory_limit(raised);
            }
        }

        self.terminating.store(false, Ordering::SeqCst);

        let dead = mem::take(&mut cell.state.borrow_mut().graveyard);
        drop(dead);

        if disposed {
            self.teardown(cell);
        }
    }

    pub(crate) fn drain_jobs(&self) {
        while self.runtime.is_job_pending() && !self.is_terminating() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    tracing::warn!("Promise job threw an exception");
                    err.0.with(|ctx| {
                        ctx.catch();
                    });
                }
            }
        }
    }

    /// Release every context, bookkeeping last. Must run outside any scoped entry.
    pub(crate) fn teardown(&self, cell: &EngineCell) {
        let (mut slots, bookkeeping, dead) = {
            let mut state = cell.state.borrow_mut();
            state.disposed = true;
            state.by_raw.clear();
            let bookkeeping = state.contexts.remove(&ContextId::BOOKKEEPING);
            let slots: Vec<_> = state.contexts.drain().collect();
            (slots, bookkeeping, mem::take(&mut state.graveyard))
        };
        slots.sort_by_key(|(id, _)| *id);

        for (_, slot) in slots {
            drop(slot.into_native());
        }
        if let Some(slot) = bookkeeping {
            drop(slot.into_native());
        }
        drop(dead);
        self.modules.lock().clear();
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        let cell = self.cell.lock();
        let live = {
            let state = cell.state.borrow();
            !state.contexts.is_empty() || !state.graveyard.is_empty()
        };
        if live {
            self.teardown(&cell);
        }
    }
}

/// Snapshot of the engine heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatistics {
    pub total_heap_size: u64,
    pub heap_size_limit: u64,
    pub used_heap_size: u64,
    pub allocation_count: u64,
    pub object_count: u64,
    pub string_count: u64,
    pub function_count: u64,
    pub array_count: u64,
}

/// Handle to one embedded engine instance.
///
/// Cloning is cheap and every clone refers to the same heap. A clone can be sent
/// to another thread to call [`Engine::terminate_execution`] while a script runs.
#[derive(Clone)]
pub struct Engine {
    pub(crate) shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine with the process-wide default configuration
    pub fn new() -> Result<Self> {
        crate::initialize_process();
        Self::with_config(crate::process_config())
    }

    /// Create an engine with an explicit configuration
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        crate::initialize_process();
        tracing::info!("Creating JavaScript engine");

        let runtime = Runtime::new().map_err(|e| EngineError::Setup(e.to_string()))?;
        if let Some(limit) = config.heap_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let terminating = Arc::new(AtomicBool::new(false));
        let flag = terminating.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::SeqCst))));

        let bookkeeping =
            rquickjs::Context::full(&runtime).map_err(|e| EngineError::Setup(e.to_string()))?;
        let mut state = EngineState {
            contexts: HashMap::new(),
            by_raw: HashMap::new(),
            graveyard: Vec::new(),
            next_context: 0,
            disposed: false,
        };
        state.insert(bookkeeping, 0);

        let shared = Arc::new_cyclic(|weak| {
            runtime.set_loader(HostResolver::new(weak.clone()), HostLoader::new(weak.clone()));
            bridge::install_rejection_tracker(&runtime, weak.clone());
            EngineShared {
                cell: ReentrantMutex::new(EngineCell {
                    depth: Cell::new(0),
                    state: RefCell::new(state),
                }),
                terminating,
                host: RwLock::new(None),
                rejection_handle: RwLock::new(None),
                modules: Mutex::new(HashMap::new()),
                raise_pending: AtomicBool::new(false),
                ceiling_raised: AtomicBool::new(false),
                config,
                runtime,
            }
        });

        Ok(Self { shared })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Dispose every context and the bookkeeping context. Safe to call twice.
    /// When called from inside a callback the native teardown finishes as soon
    /// as the outermost operation returns.
    pub fn dispose(&self) {
        let cell = self.shared.lock();
        if cell.state.borrow().disposed {
            return;
        }
        tracing::debug!("Disposing JavaScript engine");
        if cell.depth.get() > 0 {
            cell.state.borrow_mut().disposed = true;
        } else {
            self.shared.teardown(&cell);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().state.borrow().disposed
    }

    /// Ask the running script to stop. Does not take the engine lock.
    ///
    /// A request made while nothing runs is discarded when the next outermost
    /// operation starts.
    pub fn terminate_execution(&self) {
        tracing::debug!("Termination requested");
        self.shared.request_termination();
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.shared.is_terminating()
    }

    /// Run queued promise jobs. A no-op when called from inside a callback.
    pub fn perform_microtask_checkpoint(&self) -> Result<()> {
        let cell = self.shared.lock();
        if cell.state.borrow().disposed {
            return Err(EngineError::Disposed);
        }
        if cell.depth.get() > 0 {
            return Ok(());
        }
        self.shared.terminating.store(false, Ordering::SeqCst);
        cell.depth.set(1);
        self.shared.drain_jobs();
        cell.depth.set(0);
        self.shared.terminating.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Current heap usage
    pub fn heap_statistics(&self) -> Result<HeapStatistics> {
        let cell = self.idle("heap statistics")?;
        let usage = self.shared.runtime.memory_usage();
        drop(cell);

        let count = |n: i64| n.max(0) as u64;
        Ok(HeapStatistics {
            total_heap_size: count(usage.malloc_size),
            heap_size_limit: count(usage.malloc_limit),
            used_heap_size: count(usage.memory_used_size),
            allocation_count: count(usage.malloc_count),
            object_count: count(usage.obj_count),
            string_count: count(usage.str_count),
            function_count: count(usage.js_func_count),
            array_count: count(usage.array_count),
        })
    }

    /// Force a full collection
    pub fn run_gc(&self) -> Result<()> {
        let _cell = self.idle("garbage collection")?;
        self.shared.runtime.run_gc();
        Ok(())
    }

    /// Install the host capability table used by callbacks, module
    /// resolution and rejection notifications.
    pub fn set_host(&self, host: Arc<dyn HostRegistry>) {
        *self.shared.host.write() = Some(host);
    }

    /// Forward promise rejection events to the host under `host_handle`.
    pub fn watch_promise_rejections(&self, host_handle: i64) {
        *self.shared.rejection_handle.write() = Some(host_handle);
    }

    pub fn unwatch_promise_rejections(&self) {
        *self.shared.rejection_handle.write() = None;
    }

    pub fn new_context(&self, template: Option<&ObjectTemplate>, host_ref: i64) -> Result<Context> {
        Context::new(self, template, host_ref)
    }

    pub fn new_function_template(&self, callback_ref: i64) -> FunctionTemplate {
        FunctionTemplate::new(self, callback_ref)
    }

    pub fn new_object_template(&self) -> ObjectTemplate {
        ObjectTemplate::new(self)
    }

    pub fn compile_unbound_script(&self, source: &str, origin: &str) -> Result<UnboundScript> {
        UnboundScript::compile(self, source, origin)
    }

    /// Values created in the bookkeeping context.
    pub fn undefined(&self) -> Result<Value> {
        self.bookkeeping().undefined()
    }

    pub fn null(&self) -> Result<Value> {
        self.bookkeeping().null()
    }

    pub fn boolean(&self, value: bool) -> Result<Value> {
        self.bookkeeping().boolean(value)
    }

    pub fn number(&self, value: f64) -> Result<Value> {
        self.bookkeeping().number(value)
    }

    pub fn string(&self, value: &str) -> Result<Value> {
        self.bookkeeping().string(value)
    }

    pub fn object(&self) -> Result<Value> {
        self.bookkeeping().object()
    }

    pub fn parse_json(&self, text: &str) -> Result<Value> {
        self.bookkeeping().parse_json(text)
    }

    /// Number of values retained by the bookkeeping context.
    pub fn bookkeeping_retained_count(&self) -> usize {
        self.bookkeeping().retained_count()
    }

    pub(crate) fn bookkeeping(&self) -> Context {
        Context::from_parts(self.shared.clone(), ContextId::BOOKKEEPING)
    }

    /// Lock the engine for a runtime-level call, refusing when nested.
    fn idle(&self, operation: &'static str) -> Result<ReentrantMutexGuard<'_, EngineCell>> {
        let cell = self.shared.lock();
        if cell.state.borrow().disposed {
            return Err(EngineError::Disposed);
        }
        if cell.depth.get() > 0 {
            return Err(EngineError::Reentrant(operation));
        }
        Ok(cell)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("terminating", &self.is_execution_terminating())
            .finish_non_exhaustive()
    }
}
