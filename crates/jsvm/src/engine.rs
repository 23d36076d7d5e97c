//! The engine handle owned by an execution context.
//!
//! An [`Engine`] wraps one QuickJS runtime together with the JavaScript
//! contexts created in it. It is `!Send`: it is created on the owning thread
//! when the execution context starts and dropped there when it stops. Jobs
//! receive `&Engine` as their proof of running on that thread.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rquickjs::{Context, Ctx, FromJs, Object, Persistent, Runtime};

use crate::config::{ContextSetup, EngineFactory};
use crate::context::ExecutionContext;
use crate::error::{JsError, misuse};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Key of an isolated payload in the engine's slot table.
pub(crate) type SlotKey = u64;

#[derive(Default)]
struct Slots {
    next: SlotKey,
    /// `None` marks a payload that is currently checked out.
    entries: HashMap<SlotKey, Option<Box<dyn Any>>>,
}

/// One engine instance pinned to its owning thread.
pub struct Engine {
    id: EngineId,
    owner: ExecutionContext,
    setup: Option<ContextSetup>,
    slots: RefCell<Slots>,
    contexts: RefCell<Vec<(Persistent<Object<'static>>, Context)>>,
    context: Context,
    runtime: Runtime,
}

impl Engine {
    pub(crate) fn new(owner: ExecutionContext, factory: &EngineFactory) -> rquickjs::Result<Self> {
        let runtime = Runtime::new()?;
        let options = &factory.options;
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = options.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        if let Some(threshold) = options.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let context = Context::full(&runtime)?;
        let engine = Self {
            id: EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed)),
            owner,
            setup: factory.setup.clone(),
            slots: RefCell::new(Slots::default()),
            contexts: RefCell::new(Vec::new()),
            context: context.clone(),
            runtime,
        };
        engine.register(context)?;

        tracing::debug!(engine = %engine.id, context = %engine.owner.id(), "Engine created");
        Ok(engine)
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    /// The execution context that owns this engine.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.owner
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The default JavaScript context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Run `f` inside the default JavaScript context.
    ///
    /// Must not be called from inside another `with` scope of this engine,
    /// which includes native callbacks invoked by JavaScript.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.context.with(f)
    }

    /// Evaluate a script in the default context.
    pub fn eval<T>(&self, source: &str) -> Result<T, JsError>
    where
        T: for<'js> FromJs<'js>,
    {
        self.with(|ctx| {
            ctx.eval::<T, _>(source).map_err(|err| {
                if matches!(err, rquickjs::Error::Exception) {
                    JsError::thrown(&ctx, ctx.catch())
                } else {
                    JsError::message(err.to_string())
                }
            })
        })
    }

    /// Create another JavaScript context in this engine.
    ///
    /// The factory's setup hook runs against it and it becomes visible to
    /// [`IsolationProxy::current_context`](crate::IsolationProxy::current_context).
    pub fn new_context(&self) -> rquickjs::Result<Context> {
        let context = Context::full(&self.runtime)?;
        self.register(context.clone())?;
        Ok(context)
    }

    fn register(&self, context: Context) -> rquickjs::Result<()> {
        let globals = context.with(|ctx| -> rquickjs::Result<_> {
            if let Some(setup) = &self.setup {
                setup(&ctx)?;
            }
            Ok(Persistent::save(&ctx, ctx.globals()))
        })?;
        self.contexts.borrow_mut().push((globals, context));
        Ok(())
    }

    /// Whether `ctx` belongs to this engine's runtime.
    pub fn owns(&self, ctx: &Ctx<'_>) -> bool {
        let Some((globals, _)) = self.contexts.borrow().first().cloned() else {
            return false;
        };
        globals.restore(ctx).is_ok()
    }

    /// The registered context whose global object is `ctx`'s.
    pub fn context_for(&self, ctx: &Ctx<'_>) -> Option<Context> {
        let current = ctx.globals();
        self.contexts
            .borrow()
            .iter()
            .find(|(globals, _)| {
                globals
                    .clone()
                    .restore(ctx)
                    .is_ok_and(|globals| *globals == *current)
            })
            .map(|(_, context)| context.clone())
    }

    /// Drain the engine's microtask queue. Returns the number of jobs run.
    pub fn run_pending_jobs(&self) -> usize {
        let mut executed = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(exception) => {
                    executed += 1;
                    let message = exception
                        .0
                        .with(|ctx| crate::error::describe(&ctx, ctx.catch()));
                    tracing::warn!(engine = %self.id, "Unhandled exception in pending job: {}", message);
                }
            }
        }
        executed
    }

    /// Force a garbage collection pass.
    pub fn gc(&self) {
        self.runtime.run_gc();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Slot table
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn insert_slot(&self, payload: Box<dyn Any>) -> SlotKey {
        let mut slots = self.slots.borrow_mut();
        let key = slots.next;
        slots.next += 1;
        slots.entries.insert(key, Some(payload));
        key
    }

    /// Take a payload out for exclusive use. `None` if it was already released.
    pub(crate) fn checkout_slot(&self, key: SlotKey) -> Option<Box<dyn Any>> {
        let checked_out = {
            let mut slots = self.slots.borrow_mut();
            match slots.entries.get_mut(&key) {
                Some(entry) => match entry.take() {
                    Some(payload) => return Some(payload),
                    None => true,
                },
                None => false,
            }
        };
        if checked_out {
            misuse("Isolated value accessed re-entrantly from its own isolation scope");
        }
        None
    }

    pub(crate) fn return_slot(&self, key: SlotKey, payload: Box<dyn Any>) {
        let leftover = {
            let mut slots = self.slots.borrow_mut();
            match slots.entries.get_mut(&key) {
                Some(entry) => {
                    *entry = Some(payload);
                    None
                }
                None => Some(payload),
            }
        };
        drop(leftover);
    }

    pub(crate) fn remove_slot(&self, key: SlotKey) {
        let removed = self.slots.borrow_mut().entries.remove(&key);
        drop(removed);
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.borrow().entries.len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Isolated payloads may hold engine values; release them while the
        // runtime is still alive.
        let slots = std::mem::take(self.slots.get_mut());
        drop(slots);
        self.contexts.get_mut().clear();
        tracing::debug!(engine = %self.id, "Engine destroyed");
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("owner", &self.owner.id())
            .finish_non_exhaustive()
    }
}
