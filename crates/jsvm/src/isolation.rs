//! Values pinned to the thread of the engine that produced them.
//!
//! An [`IsolationProxy<T>`] is a capability: it can only be created with an
//! `&Engine`, which only exists on the owning thread, and the payload it names
//! stays in that engine's slot table. The proxy itself is just a key, so it is
//! `Send + Sync` even when `T` is not, and the only ways to reach the payload
//! run on the owning thread.

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rquickjs::{Context, Ctx};

use crate::context::{ExecutionContext, JobHandle};
use crate::engine::{Engine, EngineId, SlotKey};
use crate::error::{ContextError, misuse};
use crate::registry;

struct Shared {
    context: ExecutionContext,
    engine: EngineId,
    key: SlotKey,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let key = self.key;
        // Nothing to release once the context has stopped: the engine took
        // its slot table down with it.
        let _ = self
            .context
            .try_enqueue(Box::new(move |engine: &Engine| engine.remove_slot(key)));
    }
}

/// A payload `T` that may only be accessed on its owning thread.
pub struct IsolationProxy<T> {
    shared: Arc<Shared>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: 'static> IsolationProxy<T> {
    /// Isolate `payload` in `engine`.
    pub fn new(engine: &Engine, payload: T) -> Self {
        let key = engine.insert_slot(Box::new(payload));
        Self {
            shared: Arc::new(Shared {
                context: engine.execution_context().clone(),
                engine: engine.id(),
                key,
            }),
            _payload: PhantomData,
        }
    }

    /// The context the payload is affine to.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.shared.context
    }

    pub fn engine_id(&self) -> EngineId {
        self.shared.engine
    }

    /// Run `f` with the payload on the owning thread.
    ///
    /// # Panics
    ///
    /// If the owning context is not running.
    pub fn with_isolation<F, R>(&self, f: F) -> JobHandle<R>
    where
        F: FnOnce(&mut T, &Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let proxy = self.clone();
        self.shared
            .context
            .with_engine(move |engine| proxy.with_isolation_in(engine, f))
    }

    /// Non-panicking variant of [`with_isolation`](Self::with_isolation).
    pub fn try_with_isolation<F, R>(&self, f: F) -> Result<JobHandle<R>, ContextError>
    where
        F: FnOnce(&mut T, &Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let proxy = self.clone();
        self.shared
            .context
            .try_with_engine(move |engine| proxy.with_isolation_in(engine, f))
    }

    /// Run `f` immediately when already on the owning thread.
    pub fn with_isolation_if_current<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut T, &Engine) -> R,
    {
        self.shared
            .context
            .with_engine_if_current(|engine| self.with_isolation_in(engine, f))
    }

    /// Run `f` with the payload, given the owning engine.
    ///
    /// # Panics
    ///
    /// If `engine` does not own this proxy, or if the payload is already in
    /// use further up the stack.
    pub fn with_isolation_in<F, R>(&self, engine: &Engine, f: F) -> R
    where
        F: FnOnce(&mut T, &Engine) -> R,
    {
        let key = self.shared.key;
        if engine.id() != self.shared.engine {
            misuse("IsolationProxy accessed through an engine that does not own it");
        }
        let Some(payload) = engine.checkout_slot(key) else {
            misuse("IsolationProxy payload was already released");
        };
        let mut payload = match payload.downcast::<T>() {
            Ok(payload) => payload,
            Err(other) => {
                engine.return_slot(key, other);
                misuse("IsolationProxy payload has an unexpected type");
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *payload, engine)));
        engine.return_slot(key, payload);
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl IsolationProxy<Context> {
    /// The JavaScript context a native callback is running in, isolated.
    ///
    /// Returns `None` unless the calling thread runs an execution context and
    /// `ctx` is one of the contexts its engine created.
    pub fn current_context(ctx: &Ctx<'_>) -> Option<Self> {
        let engine = registry::current_engine()?;
        let context = engine.context_for(ctx)?;
        Some(Self::new(&engine, context))
    }
}

impl<T> Clone for IsolationProxy<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for IsolationProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationProxy")
            .field("context", &self.shared.context.id())
            .field("engine", &self.shared.engine)
            .field("slot", &self.shared.key)
            .finish()
    }
}
