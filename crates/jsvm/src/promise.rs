//! Bridging JavaScript promises and host futures.
//!
//! A [`JsPromise<T>`] names a JavaScript promise whose fulfilment value
//! converts to `T`. It can be created on the owning thread from a host future
//! (or from a pair of [`Resolvers`]), awaited from any thread with
//! [`resolved_value`](JsPromise::resolved_value), and chained with host
//! closures that run as native promise handlers on the owning thread.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use rquickjs::function::This;
use rquickjs::{Context, Ctx, Exception, FromJs, Function, IntoJs, Object, Persistent, Undefined, Value};
use tokio::sync::oneshot;

use crate::context::{ExecutionContext, JobHandle};
use crate::engine::{Engine, EngineId};
use crate::error::{BridgeError, ContextError, JsError, misuse, new_error, panic_message};
use crate::isolation::IsolationProxy;
use crate::registry;

// ─────────────────────────────────────────────────────────────────────────────
// Engine helpers
// ─────────────────────────────────────────────────────────────────────────────

fn owning_engine(ctx: &Ctx<'_>, operation: &str) -> Rc<Engine> {
    match registry::current_engine() {
        Some(engine) if engine.owns(ctx) => engine,
        _ => misuse(&format!(
            "{operation} requires a running ExecutionContext whose engine owns the JavaScript context"
        )),
    }
}

fn promise_static<'js>(ctx: &Ctx<'js>, method: &str, value: Value<'js>) -> rquickjs::Result<Object<'js>> {
    let constructor: Object = ctx.globals().get("Promise")?;
    let method: Function = constructor.get(method)?;
    method.call((This(constructor), value))
}

fn attach<'js, A, B>(promise: &Object<'js>, on_resolved: A, on_rejected: B) -> rquickjs::Result<Object<'js>>
where
    A: IntoJs<'js>,
    B: IntoJs<'js>,
{
    let then: Function = promise.get("then")?;
    then.call((This(promise.clone()), on_resolved, on_rejected))
}

/// A one-shot native promise handler.
///
/// Errors returned by `f` and panics inside it become rejections of the
/// promise `then` returns.
fn handler<'js, U, F>(ctx: &Ctx<'js>, f: F) -> rquickjs::Result<Function<'js>>
where
    U: IntoJs<'js>,
    F: FnOnce(&Ctx<'js>, Value<'js>) -> Result<U, BridgeError> + 'js,
{
    let f = RefCell::new(Some(f));
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, value: Value<'js>| -> rquickjs::Result<Value<'js>> {
            let Some(f) = f.borrow_mut().take() else {
                return Err(Exception::throw_message(&ctx, "promise handler invoked twice"));
            };
            match panic::catch_unwind(AssertUnwindSafe(|| f(&ctx, value))) {
                Ok(Ok(output)) => output.into_js(&ctx),
                Ok(Err(err)) => Err(err.throw(&ctx)),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!("Promise handler panicked: {}", message);
                    Err(Exception::throw_message(
                        &ctx,
                        &format!("promise handler panicked: {message}"),
                    ))
                }
            }
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// JsPromise
// ─────────────────────────────────────────────────────────────────────────────

/// A JavaScript promise expected to fulfil with a `T`.
pub struct JsPromise<T> {
    promise: IsolationProxy<Persistent<Object<'static>>>,
    _value: PhantomData<fn() -> T>,
}

impl<T> JsPromise<T> {
    fn from_object<'js>(engine: &Engine, ctx: &Ctx<'js>, promise: Object<'js>) -> Self {
        Self {
            promise: IsolationProxy::new(engine, Persistent::save(ctx, promise)),
            _value: PhantomData,
        }
    }

    fn restore<'js>(&self, engine: &Engine, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        self.promise
            .with_isolation_in(engine, |promise, _| promise.clone().restore(ctx))
    }

    /// The execution context the promise is affine to.
    pub fn execution_context(&self) -> &ExecutionContext {
        self.promise.execution_context()
    }

    pub fn engine_id(&self) -> EngineId {
        self.promise.engine_id()
    }

    /// Create a promise settled by `body`, which runs on the host runtime.
    ///
    /// # Panics
    ///
    /// Unless called on a running execution context whose engine owns `ctx`.
    pub fn new<'js, F, Fut>(ctx: &Ctx<'js>, body: F) -> rquickjs::Result<Self>
    where
        F: FnOnce(Resolvers<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (promise, resolvers) = Self::with_resolvers(ctx)?;
        promise
            .execution_context()
            .spawn_host(body(resolvers))
            .map_err(|err| Exception::throw_message(ctx, &err.to_string()))?;
        Ok(promise)
    }

    /// Create a promise that settles with the outcome of `future`.
    ///
    /// # Panics
    ///
    /// Unless called on a running execution context whose engine owns `ctx`.
    pub fn from_async<'js, Fut, E>(ctx: &Ctx<'js>, future: Fut) -> rquickjs::Result<Self>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display,
        T: for<'a> IntoJs<'a> + Send + 'static,
    {
        Self::new(ctx, move |resolvers| async move {
            let outcome = future.await.map_err(|err| err.to_string());
            if let Err(err) = resolvers.finish(outcome).await {
                tracing::warn!("Failed to settle promise: {}", err);
            }
        })
    }

    /// Create a pending promise together with the functions that settle it.
    ///
    /// # Panics
    ///
    /// Unless called on a running execution context whose engine owns `ctx`.
    pub fn with_resolvers<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<(Self, Resolvers<T>)> {
        let engine = owning_engine(ctx, "JsPromise::with_resolvers");
        let (promise, resolve, reject) = ctx.promise()?;
        let promise = promise
            .into_value()
            .try_into_object()
            .map_err(|value| rquickjs::Error::new_from_js(value.type_name(), "promise"))?;

        let pending = Pending {
            context: engine
                .context_for(ctx)
                .unwrap_or_else(|| engine.context().clone()),
            resolve: Persistent::save(ctx, resolve),
            reject: Persistent::save(ctx, reject),
            settled: false,
        };
        let resolvers = Resolvers {
            pending: IsolationProxy::new(&engine, pending),
            _value: PhantomData,
        };
        Ok((Self::from_object(&engine, ctx, promise), resolvers))
    }

    /// A promise already fulfilled with `value`.
    pub fn resolve<'js>(ctx: &Ctx<'js>, value: T) -> rquickjs::Result<Self>
    where
        T: IntoJs<'js>,
    {
        let engine = owning_engine(ctx, "JsPromise::resolve");
        let value = value.into_js(ctx)?;
        let promise = promise_static(ctx, "resolve", value)?;
        Ok(Self::from_object(&engine, ctx, promise))
    }

    /// A promise already rejected with an `Error` carrying `message`.
    pub fn reject<'js>(ctx: &Ctx<'js>, message: impl fmt::Display) -> rquickjs::Result<Self> {
        let engine = owning_engine(ctx, "JsPromise::reject");
        let error = new_error(ctx, &message.to_string())?;
        let promise = promise_static(ctx, "reject", error)?;
        Ok(Self::from_object(&engine, ctx, promise))
    }

    /// Wrap an existing JavaScript promise.
    pub fn from_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Self, BridgeError> {
        let engine = owning_engine(ctx, "JsPromise::from_value");
        if !value.is_promise() {
            return Err(BridgeError::NotAPromise);
        }
        let promise = value
            .try_into_object()
            .map_err(|_| BridgeError::NotAPromise)?;
        Ok(Self::from_object(&engine, ctx, promise))
    }

    /// The promise as a value of `ctx`.
    ///
    /// Any context of the owning engine works; contexts of other engines get
    /// [`BridgeError::DifferentEngines`].
    pub fn to_value<'js>(&self, ctx: &Ctx<'js>) -> Result<Value<'js>, BridgeError> {
        let engine = registry::current_engine()
            .filter(|engine| engine.id() == self.engine_id() && engine.owns(ctx))
            .ok_or(BridgeError::DifferentEngines)?;
        self.restore(&engine, ctx)
            .map(Object::into_value)
            .map_err(|err| BridgeError::from_engine(ctx, err))
    }

    /// The owning engine, when called on the owning thread with one of its
    /// contexts.
    fn engine_in(&self, ctx: &Ctx<'_>) -> Result<Rc<Engine>, BridgeError> {
        let engine = registry::current_engine()
            .filter(|engine| engine.id() == self.engine_id())
            .unwrap_or_else(|| {
                misuse("JsPromise handlers must be attached on the thread of the execution context that owns the promise")
            });
        if !engine.owns(ctx) {
            return Err(BridgeError::DifferentEngines);
        }
        Ok(engine)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Awaiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait for the promise to settle and convert its value.
    ///
    /// Rejections surface as [`BridgeError::Js`].
    pub async fn resolved_value(&self) -> Result<T, BridgeError>
    where
        T: for<'js> FromJs<'js> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let promise = self.clone();
        self.execution_context()
            .try_with_engine(move |engine| {
                engine.with(|ctx| {
                    promise
                        .deliver(engine, &ctx, tx)
                        .map_err(|err| BridgeError::from_engine(&ctx, err))
                })
            })?
            .await??;
        rx.await
            .map_err(|_| BridgeError::from(ContextError::Stopped))?
    }

    fn deliver<'js>(
        &self,
        engine: &Engine,
        ctx: &Ctx<'js>,
        tx: oneshot::Sender<Result<T, BridgeError>>,
    ) -> rquickjs::Result<()>
    where
        T: FromJs<'js> + 'static,
    {
        let promise = self.restore(engine, ctx)?;
        let sender = Rc::new(RefCell::new(Some(tx)));

        let resolved = sender.clone();
        let on_resolved = Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: Value<'js>| {
            let outcome = T::from_js(&ctx, value).map_err(|err| BridgeError::from_engine(&ctx, err));
            if let Some(tx) = resolved.borrow_mut().take() {
                let _ = tx.send(outcome);
            }
        })?;
        let on_rejected = Function::new(ctx.clone(), move |ctx: Ctx<'js>, reason: Value<'js>| {
            if let Some(tx) = sender.borrow_mut().take() {
                let _ = tx.send(Err(JsError::thrown(&ctx, reason).into()));
            }
        })?;

        attach(&promise, on_resolved, on_rejected)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chaining on the owning thread
    // ─────────────────────────────────────────────────────────────────────────

    /// Map the fulfilment value with `on_resolved`.
    ///
    /// # Panics
    ///
    /// If called off the owning thread.
    pub fn then_in<'js, U, F>(&self, ctx: &Ctx<'js>, on_resolved: F) -> Result<JsPromise<U>, BridgeError>
    where
        T: FromJs<'js>,
        U: IntoJs<'js>,
        F: FnOnce(T) -> Result<U, BridgeError> + 'js,
    {
        let engine = self.engine_in(ctx)?;
        self.chain(&engine, ctx, |ctx| {
            let on_resolved = handler(ctx, move |ctx, value| {
                let value = T::from_js(ctx, value).map_err(|err| BridgeError::from_engine(ctx, err))?;
                on_resolved(value)
            })?;
            Ok((on_resolved.into_js(ctx)?, Undefined.into_js(ctx)?))
        })
    }

    /// Recover from a rejection with `on_rejected`.
    ///
    /// # Panics
    ///
    /// If called off the owning thread.
    pub fn catch_in<'js, F>(&self, ctx: &Ctx<'js>, on_rejected: F) -> Result<JsPromise<T>, BridgeError>
    where
        T: IntoJs<'js>,
        F: FnOnce(JsError) -> Result<T, BridgeError> + 'js,
    {
        let engine = self.engine_in(ctx)?;
        self.chain(&engine, ctx, |ctx| {
            let on_rejected = handler(ctx, move |ctx, reason| on_rejected(JsError::thrown(ctx, reason)))?;
            Ok((Undefined.into_js(ctx)?, on_rejected.into_js(ctx)?))
        })
    }

    /// Handle both outcomes at once.
    ///
    /// # Panics
    ///
    /// If called off the owning thread.
    pub fn then_or_else_in<'js, U, F, G>(
        &self,
        ctx: &Ctx<'js>,
        on_resolved: F,
        on_rejected: G,
    ) -> Result<JsPromise<U>, BridgeError>
    where
        T: FromJs<'js>,
        U: IntoJs<'js>,
        F: FnOnce(T) -> Result<U, BridgeError> + 'js,
        G: FnOnce(JsError) -> Result<U, BridgeError> + 'js,
    {
        let engine = self.engine_in(ctx)?;
        self.chain(&engine, ctx, |ctx| {
            let on_resolved = handler(ctx, move |ctx, value| {
                let value = T::from_js(ctx, value).map_err(|err| BridgeError::from_engine(ctx, err))?;
                on_resolved(value)
            })?;
            let on_rejected = handler(ctx, move |ctx, reason| on_rejected(JsError::thrown(ctx, reason)))?;
            Ok((on_resolved.into_js(ctx)?, on_rejected.into_js(ctx)?))
        })
    }

    fn chain<'js, U, H>(&self, engine: &Engine, ctx: &Ctx<'js>, handlers: H) -> Result<JsPromise<U>, BridgeError>
    where
        H: FnOnce(&Ctx<'js>) -> rquickjs::Result<(Value<'js>, Value<'js>)>,
    {
        let chained = (|| {
            let promise = self.restore(engine, ctx)?;
            let (on_resolved, on_rejected) = handlers(ctx)?;
            attach(&promise, on_resolved, on_rejected)
        })()
        .map_err(|err| BridgeError::from_engine(ctx, err))?;
        Ok(JsPromise::from_object(engine, ctx, chained))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chaining from any thread
    // ─────────────────────────────────────────────────────────────────────────

    /// [`then_in`](Self::then_in) from any thread.
    pub async fn then<U, F>(&self, on_resolved: F) -> Result<JsPromise<U>, BridgeError>
    where
        T: for<'js> FromJs<'js> + 'static,
        U: for<'js> IntoJs<'js> + 'static,
        F: FnOnce(T) -> Result<U, BridgeError> + Send + 'static,
    {
        let promise = self.clone();
        self.execution_context()
            .try_with_engine(move |engine| engine.with(|ctx| promise.then_in(&ctx, on_resolved)))?
            .await?
    }

    /// [`catch_in`](Self::catch_in) from any thread.
    pub async fn catch<F>(&self, on_rejected: F) -> Result<JsPromise<T>, BridgeError>
    where
        T: for<'js> IntoJs<'js> + 'static,
        F: FnOnce(JsError) -> Result<T, BridgeError> + Send + 'static,
    {
        let promise = self.clone();
        self.execution_context()
            .try_with_engine(move |engine| engine.with(|ctx| promise.catch_in(&ctx, on_rejected)))?
            .await?
    }

    /// [`then_or_else_in`](Self::then_or_else_in) from any thread.
    pub async fn then_or_else<U, F, G>(&self, on_resolved: F, on_rejected: G) -> Result<JsPromise<U>, BridgeError>
    where
        T: for<'js> FromJs<'js> + 'static,
        U: for<'js> IntoJs<'js> + 'static,
        F: FnOnce(T) -> Result<U, BridgeError> + Send + 'static,
        G: FnOnce(JsError) -> Result<U, BridgeError> + Send + 'static,
    {
        let promise = self.clone();
        self.execution_context()
            .try_with_engine(move |engine| {
                engine.with(|ctx| promise.then_or_else_in(&ctx, on_resolved, on_rejected))
            })?
            .await?
    }
}

impl<T> JsPromise<JsPromise<T>> {
    /// Drop one level of nesting. The engine already adopts promises returned
    /// from handlers, so this only changes the static type.
    pub fn flatten(self) -> JsPromise<T> {
        JsPromise {
            promise: self.promise,
            _value: PhantomData,
        }
    }
}

impl<T> Clone for JsPromise<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for JsPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsPromise")
            .field("promise", &self.promise)
            .finish()
    }
}

impl<'js, T> FromJs<'js> for JsPromise<T> {
    fn from_js(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        let type_name = value.type_name();
        let Some(engine) = registry::current_engine().filter(|engine| engine.owns(ctx)) else {
            return Err(rquickjs::Error::new_from_js_message(
                type_name,
                "JsPromise",
                "not running on an execution context",
            ));
        };
        if !value.is_promise() {
            return Err(rquickjs::Error::new_from_js(type_name, "JsPromise"));
        }
        let promise = value
            .try_into_object()
            .map_err(|_| rquickjs::Error::new_from_js(type_name, "JsPromise"))?;
        Ok(Self::from_object(&engine, ctx, promise))
    }
}

impl<'js, T> IntoJs<'js> for JsPromise<T> {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        self.to_value(ctx)
            .map_err(|err| rquickjs::Error::new_into_js_message("JsPromise", "promise", err.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolvers
// ─────────────────────────────────────────────────────────────────────────────

struct Pending {
    context: Context,
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
    settled: bool,
}

/// Outcome of a settle attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// This call settled the promise.
    Settled,
    /// The promise was settled earlier; this call had no effect.
    AlreadySettled,
}

/// The resolve and reject functions of a pending [`JsPromise`].
///
/// Only the first settle call takes effect; later ones are reported and
/// return [`Settlement::AlreadySettled`]. Every method queues its work on the
/// owning thread immediately, so the returned handles may be dropped.
pub struct Resolvers<T> {
    pending: IsolationProxy<Pending>,
    _value: PhantomData<fn(T)>,
}

impl<T> Resolvers<T> {
    pub fn execution_context(&self) -> &ExecutionContext {
        self.pending.execution_context()
    }

    /// Fulfil the promise with `value`.
    pub fn resolve(&self, value: T) -> SettleHandle
    where
        T: for<'js> IntoJs<'js> + Send + 'static,
    {
        self.settle(move |ctx, pending| {
            let value = value.into_js(ctx)?;
            pending.resolve.clone().restore(ctx)?.call((value,))
        })
    }

    /// Reject the promise with an `Error` carrying `message`.
    pub fn reject(&self, message: impl fmt::Display) -> SettleHandle {
        let message = message.to_string();
        self.settle(move |ctx, pending| {
            let error = new_error(ctx, &message)?;
            pending.reject.clone().restore(ctx)?.call((error,))
        })
    }

    /// Reject the promise with a JavaScript exception, rethrowing the original
    /// value when it came from the same engine.
    pub fn reject_error(&self, error: JsError) -> SettleHandle {
        self.settle(move |ctx, pending| {
            let error = error.to_js(ctx)?;
            pending.reject.clone().restore(ctx)?.call((error,))
        })
    }

    /// Settle the promise with `result`.
    pub fn finish<E>(&self, result: Result<T, E>) -> SettleHandle
    where
        T: for<'js> IntoJs<'js> + Send + 'static,
        E: fmt::Display,
    {
        match result {
            Ok(value) => self.resolve(value),
            Err(err) => self.reject(err),
        }
    }

    /// Fulfil the promise with a value built on the owning thread.
    pub fn resolve_with<F>(&self, f: F) -> SettleHandle
    where
        F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<Value<'js>> + Send + 'static,
    {
        self.settle(move |ctx, pending| {
            let value = f(ctx)?;
            pending.resolve.clone().restore(ctx)?.call((value,))
        })
    }

    /// Reject the promise with a value built on the owning thread.
    pub fn reject_with<F>(&self, f: F) -> SettleHandle
    where
        F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<Value<'js>> + Send + 'static,
    {
        self.settle(move |ctx, pending| {
            let reason = f(ctx)?;
            pending.reject.clone().restore(ctx)?.call((reason,))
        })
    }

    /// Run `f` in the JavaScript context the promise was created in.
    pub fn with_context<F, R>(&self, f: F) -> Result<JobHandle<R>, ContextError>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.pending
            .try_with_isolation(move |pending, _| pending.context.with(f))
    }

    fn settle<F>(&self, f: F) -> SettleHandle
    where
        F: for<'js> FnOnce(&Ctx<'js>, &Pending) -> rquickjs::Result<()> + Send + 'static,
    {
        let handle = self.pending.try_with_isolation(move |pending, _| {
            if pending.settled {
                tracing::warn!("Promise resolvers used after the promise was already settled");
                return Ok(Settlement::AlreadySettled);
            }
            pending.settled = true;
            let pending: &Pending = pending;
            pending.context.with(|ctx| match f(&ctx, pending) {
                Ok(()) => Ok(Settlement::Settled),
                Err(err) => {
                    // The promise is settled either way: a value that fails to
                    // reach the engine rejects it instead.
                    let err = BridgeError::from_engine(&ctx, err);
                    tracing::warn!("Failed to settle promise, rejecting it instead: {}", err);
                    new_error(&ctx, &err.to_string())
                        .and_then(|error| pending.reject.clone().restore(&ctx)?.call::<_, ()>((error,)))
                        .map_err(|reject_err| BridgeError::from_engine(&ctx, reject_err))?;
                    Err(err)
                }
            })
        });
        SettleHandle {
            state: match handle {
                Ok(handle) => SettleState::Queued(handle),
                Err(err) => SettleState::Failed(Some(err.into())),
            },
        }
    }
}

impl<T> Clone for Resolvers<T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Resolvers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolvers")
            .field("pending", &self.pending)
            .finish()
    }
}

enum SettleState {
    Queued(JobHandle<Result<Settlement, BridgeError>>),
    Failed(Option<BridgeError>),
}

/// Completion of a settle request made through [`Resolvers`].
pub struct SettleHandle {
    state: SettleState,
}

impl Future for SettleHandle {
    type Output = Result<Settlement, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            SettleState::Queued(handle) => Pin::new(handle)
                .poll(cx)
                .map(|outcome| outcome.map_err(BridgeError::from).and_then(|settled| settled)),
            SettleState::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| BridgeError::Context("settle handle polled after completion".to_string())))),
        }
    }
}

impl fmt::Debug for SettleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettleHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineFactory;
    use std::time::Duration;

    async fn running() -> ExecutionContext {
        ExecutionContext::start(EngineFactory::default()).await.unwrap()
    }

    /// Build something on the context's default JavaScript context.
    async fn on_engine<R, F>(context: &ExecutionContext, f: F) -> R
    where
        F: for<'js> FnOnce(&Engine, Ctx<'js>) -> R + Send + 'static,
        R: Send + 'static,
    {
        context
            .with_engine(move |engine| engine.with(|ctx| f(engine, ctx)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_from_concurrent_task() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| {
            JsPromise::<i32>::new(&ctx, |resolvers| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                resolvers.resolve(5).await.unwrap();
            })
            .unwrap()
        })
        .await;

        assert_eq!(promise.resolved_value().await.unwrap(), 5);
        context.stop();
    }

    #[tokio::test]
    async fn test_from_async_rejection() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| {
            JsPromise::<i32>::from_async(&ctx, async { Err::<i32, _>("nope") }).unwrap()
        })
        .await;

        match promise.resolved_value().await {
            Err(BridgeError::Js(err)) => {
                assert_eq!(err.text(), Some("nope"));
                assert!(err.value().is_some());
            }
            other => panic!("expected a JavaScript rejection, got {other:?}"),
        }
        context.stop();
    }

    #[tokio::test]
    async fn test_settles_exactly_once() {
        let context = running().await;
        let (promise, resolvers) = on_engine(&context, |_, ctx| {
            JsPromise::<i32>::with_resolvers(&ctx).unwrap()
        })
        .await;

        assert_eq!(resolvers.resolve(1).await.unwrap(), Settlement::Settled);
        assert_eq!(resolvers.resolve(2).await.unwrap(), Settlement::AlreadySettled);
        assert_eq!(resolvers.reject("late").await.unwrap(), Settlement::AlreadySettled);

        assert_eq!(promise.resolved_value().await.unwrap(), 1);
        context.stop();
    }

    #[tokio::test]
    async fn test_reject_then_resolve_keeps_rejection() {
        let context = running().await;
        let (promise, resolvers) = on_engine(&context, |_, ctx| {
            JsPromise::<i32>::with_resolvers(&ctx).unwrap()
        })
        .await;

        assert_eq!(resolvers.reject("first").await.unwrap(), Settlement::Settled);
        assert_eq!(resolvers.resolve(2).await.unwrap(), Settlement::AlreadySettled);

        let err = promise.resolved_value().await.unwrap_err();
        assert_eq!(err.to_string(), "first");
        context.stop();
    }

    struct Unconvertible;

    impl<'js> IntoJs<'js> for Unconvertible {
        fn into_js(self, _ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
            Err(rquickjs::Error::new_into_js("Unconvertible", "value"))
        }
    }

    impl<'js> FromJs<'js> for Unconvertible {
        fn from_js(_ctx: &Ctx<'js>, _value: Value<'js>) -> rquickjs::Result<Self> {
            Ok(Unconvertible)
        }
    }

    #[tokio::test]
    async fn test_unconvertible_resolution_rejects() {
        let context = running().await;
        let (promise, resolvers) = on_engine(&context, |_, ctx| {
            JsPromise::<Unconvertible>::with_resolvers(&ctx).unwrap()
        })
        .await;

        assert!(matches!(
            resolvers.resolve(Unconvertible).await,
            Err(BridgeError::Conversion(_))
        ));
        assert_eq!(resolvers.reject("late").await.unwrap(), Settlement::AlreadySettled);

        let outcome = tokio::time::timeout(Duration::from_secs(2), promise.resolved_value())
            .await
            .expect("promise never settled");
        assert!(matches!(outcome, Err(BridgeError::Js(_))));
        context.stop();
    }

    #[tokio::test]
    async fn test_resolve_with_engine_value() {
        let context = running().await;
        let (promise, resolvers) = on_engine(&context, |_, ctx| {
            JsPromise::<String>::with_resolvers(&ctx).unwrap()
        })
        .await;

        resolvers
            .resolve_with(|ctx| ctx.eval("['a', 'b'].join('-')"))
            .await
            .unwrap();
        assert_eq!(promise.resolved_value().await.unwrap(), "a-b");
        context.stop();
    }

    #[tokio::test]
    async fn test_then_maps_value() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| JsPromise::resolve(&ctx, 20_i32).unwrap()).await;

        let mapped = promise.then(|value: i32| Ok(value + 1)).await.unwrap();
        assert_eq!(mapped.resolved_value().await.unwrap(), 21);
        context.stop();
    }

    #[tokio::test]
    async fn test_catch_recovers() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| JsPromise::<i32>::reject(&ctx, "bad").unwrap()).await;

        let recovered = promise
            .catch(|err| Ok(err.text().map_or(0, |text| text.len() as i32)))
            .await
            .unwrap();
        assert_eq!(recovered.resolved_value().await.unwrap(), 3);
        context.stop();
    }

    #[tokio::test]
    async fn test_catch_passes_fulfilment_through() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| JsPromise::resolve(&ctx, 9_i32).unwrap()).await;

        let unchanged = promise.catch(|_| Ok(0)).await.unwrap();
        assert_eq!(unchanged.resolved_value().await.unwrap(), 9);
        context.stop();
    }

    #[tokio::test]
    async fn test_then_or_else() {
        let context = running().await;
        let ok = on_engine(&context, |_, ctx| JsPromise::resolve(&ctx, 2_i32).unwrap()).await;
        let failed = on_engine(&context, |_, ctx| JsPromise::<i32>::reject(&ctx, "x").unwrap()).await;

        let ok = ok
            .then_or_else(|value: i32| Ok(format!("ok {value}")), |_| Ok("failed".to_string()))
            .await
            .unwrap();
        let failed = failed
            .then_or_else(|value: i32| Ok(format!("ok {value}")), |_| Ok("failed".to_string()))
            .await
            .unwrap();

        assert_eq!(ok.resolved_value().await.unwrap(), "ok 2");
        assert_eq!(failed.resolved_value().await.unwrap(), "failed");
        context.stop();
    }

    #[tokio::test]
    async fn test_failing_transform_rejects() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| JsPromise::resolve(&ctx, 1_i32).unwrap()).await;

        let chained = promise
            .then(|_: i32| -> Result<i32, BridgeError> { Err(BridgeError::Conversion("no way".to_string())) })
            .await
            .unwrap();
        let err = chained.resolved_value().await.unwrap_err();
        assert!(matches!(err, BridgeError::Js(_)));
        assert!(err.to_string().contains("no way"));
        context.stop();
    }

    #[tokio::test]
    async fn test_panicking_transform_rejects() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| JsPromise::resolve(&ctx, 1_i32).unwrap()).await;

        let chained = promise
            .then(|_: i32| -> Result<i32, BridgeError> { panic!("kaboom") })
            .await
            .unwrap();
        let err = chained.resolved_value().await.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(context.is_running());
        context.stop();
    }

    #[tokio::test]
    async fn test_rethrown_js_error_keeps_value() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| {
            let value: Value = ctx.eval("Promise.reject(new RangeError('out of range'))").unwrap();
            JsPromise::<i32>::from_value(&ctx, value).unwrap()
        })
        .await;

        let chained = promise
            .catch(|err| -> Result<i32, BridgeError> { Err(err.into()) })
            .await
            .unwrap();
        let err = match chained.resolved_value().await {
            Err(BridgeError::Js(err)) => err,
            other => panic!("expected a JavaScript rejection, got {other:?}"),
        };
        assert_eq!(err.text(), Some("out of range"));

        let name = err
            .value()
            .unwrap()
            .with_isolation(|value, engine| {
                engine.with(|ctx| {
                    let value = value.clone().restore(&ctx).unwrap();
                    let object = value.try_into_object().unwrap();
                    object.get::<_, String>("name").unwrap()
                })
            })
            .await
            .unwrap();
        assert_eq!(name, "RangeError");
        context.stop();
    }

    #[tokio::test]
    async fn test_wraps_engine_promises() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| {
            let value: Value = ctx.eval("Promise.resolve(2).then((v) => v * 3)").unwrap();
            JsPromise::<i32>::from_value(&ctx, value).unwrap()
        })
        .await;

        assert_eq!(promise.resolved_value().await.unwrap(), 6);
        context.stop();
    }

    #[tokio::test]
    async fn test_non_promise_is_rejected() {
        let context = running().await;
        let result = on_engine(&context, |_, ctx| {
            let value: Value = ctx.eval("({ then: 5 })").unwrap();
            JsPromise::<i32>::from_value(&ctx, value).map(|_| ())
        })
        .await;

        assert!(matches!(result, Err(BridgeError::NotAPromise)));
        context.stop();
    }

    #[tokio::test]
    async fn test_different_engines() {
        let a = running().await;
        let b = running().await;
        let promise = on_engine(&a, |_, ctx| JsPromise::resolve(&ctx, 1_i32).unwrap()).await;

        let result = on_engine(&b, move |_, ctx| promise.to_value(&ctx).map(|_| ())).await;
        assert!(matches!(result, Err(BridgeError::DifferentEngines)));
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_other_context_of_same_engine() {
        let context = running().await;
        let value = context
            .with_engine(|engine| {
                let promise = engine.with(|ctx| JsPromise::resolve(&ctx, 11_i32).unwrap());
                let other = engine.new_context().unwrap();
                other.with(|ctx| {
                    ctx.globals()
                        .set("pending", promise.to_value(&ctx).unwrap())
                        .unwrap();
                    let chained: Value = ctx.eval("pending.then((v) => v + 1)").unwrap();
                    JsPromise::<i32>::from_value(&ctx, chained).unwrap()
                })
            })
            .await
            .unwrap();

        assert_eq!(value.resolved_value().await.unwrap(), 12);
        context.stop();
    }

    #[tokio::test]
    async fn test_promise_arguments_and_results() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| {
            let double = Function::new(ctx.clone(), |ctx: Ctx<'_>, input: JsPromise<i32>| {
                input
                    .then_in(&ctx, |value| Ok(value * 2))
                    .map_err(|err| err.throw(&ctx))
            })
            .unwrap();
            ctx.globals().set("double", double).unwrap();

            let value: Value = ctx.eval("double(Promise.resolve(4))").unwrap();
            JsPromise::<i32>::from_value(&ctx, value).unwrap()
        })
        .await;

        assert_eq!(promise.resolved_value().await.unwrap(), 8);
        context.stop();
    }

    #[tokio::test]
    async fn test_then_in_on_foreign_thread_is_misuse() {
        let a = running().await;
        let b = running().await;
        let promise = on_engine(&a, |_, ctx| JsPromise::resolve(&ctx, 1_i32).unwrap()).await;

        let result = b
            .with_engine(move |engine| {
                engine.with(|ctx| promise.then_in(&ctx, |value: i32| Ok(value)).map(|_| ()))
            })
            .await;
        assert!(matches!(result, Err(ContextError::Panicked(ref message)) if message.contains("must be attached")));
        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_resolved_value_after_stop() {
        let context = running().await;
        let promise = on_engine(&context, |_, ctx| JsPromise::resolve(&ctx, 1_i32).unwrap()).await;
        context.stop();

        assert!(matches!(
            promise.resolved_value().await,
            Err(BridgeError::Context(_))
        ));
    }

    #[tokio::test]
    async fn test_with_context() {
        let context = running().await;
        let (_promise, resolvers) = on_engine(&context, |_, ctx| {
            JsPromise::<i32>::with_resolvers(&ctx).unwrap()
        })
        .await;

        let sum = resolvers
            .with_context(|ctx| ctx.eval::<i32, _>("1 + 1").unwrap())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(sum, 2);
        context.stop();
    }

    #[test]
    #[should_panic(expected = "requires a running ExecutionContext")]
    fn test_construction_off_context_is_misuse() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let _ = JsPromise::<i32>::with_resolvers(&ctx);
        });
    }
}
