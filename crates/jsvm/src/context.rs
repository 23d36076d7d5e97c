//! Thread-affine execution contexts.
//!
//! An [`ExecutionContext`] owns one worker thread and the [`Engine`] created on
//! it. Every access to the engine goes through the context's job queue and
//! runs on that thread, one job at a time, in submission order.
//!
//! ```text
//!  any thread                         owning thread
//!  ──────────                         ─────────────
//!  with_engine(f) ──► job queue ──►   f(&engine)
//!        ▲                               │
//!        └────────── JobHandle ◄─────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::{Pin, pin};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use rquickjs::Context;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

use crate::config::EngineFactory;
use crate::engine::{Engine, EngineId};
use crate::error::{ContextError, misuse, panic_message};
use crate::isolation::IsolationProxy;
use crate::registry;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type Job = Box<dyn FnOnce(&Engine) + Send>;

/// Process-unique identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

/// Lifecycle of an execution context. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotRunning,
    Running,
    Stopped,
}

struct State {
    phase: Phase,
    /// Set once a thread has claimed the context in `run_blocking`.
    claimed: bool,
    jobs: VecDeque<Job>,
    owner: Option<ThreadId>,
    engine: Option<EngineId>,
    failure: Option<String>,
}

struct Inner {
    id: ContextId,
    factory: EngineFactory,
    state: Mutex<State>,
    /// Wakes the owning loop when jobs arrive or the context stops.
    wake: Condvar,
    /// Wakes blocking waiters in `spawn` when the phase changes.
    ready: Condvar,
    phase: watch::Sender<Phase>,
    host: Option<Handle>,
}

/// A handle to one thread-affine engine instance.
///
/// Cloning is cheap and every clone refers to the same context; equality is
/// identity. A context does nothing until [`run_blocking`](Self::run_blocking),
/// [`run`](Self::run), [`start`](Self::start) or [`spawn`](Self::spawn) puts a
/// thread behind it, and once stopped it can never run again.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl ExecutionContext {
    /// A context that will build a default engine.
    pub fn new() -> Self {
        Self::with_factory(EngineFactory::default())
    }

    /// A context that will build its engine with `factory`.
    pub fn with_factory(factory: EngineFactory) -> Self {
        let (phase, _) = watch::channel(Phase::NotRunning);
        Self {
            inner: Arc::new(Inner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                factory,
                state: Mutex::new(State {
                    phase: Phase::NotRunning,
                    claimed: false,
                    jobs: VecDeque::new(),
                    owner: None,
                    engine: None,
                    failure: None,
                }),
                wake: Condvar::new(),
                ready: Condvar::new(),
                phase,
                host: Handle::try_current().ok(),
            }),
        }
    }

    /// Create a context, start it on a new thread and wait until it runs.
    ///
    /// Dropping the future before it completes stops the context, so its
    /// thread exits instead of outliving the caller.
    pub async fn start(factory: EngineFactory) -> Result<Self, ContextError> {
        let context = Self::with_factory(factory);
        let starting = StopOnDrop::new(&context);
        let worker = context.clone();
        context.spawn_thread(move || worker.run_detached())?;
        context.wait_until_running().await?;
        starting.disarm();
        Ok(context)
    }

    /// Blocking variant of [`start`](Self::start) for synchronous callers.
    pub fn spawn(factory: EngineFactory) -> Result<Self, ContextError> {
        let context = Self::with_factory(factory);
        let worker = context.clone();
        context.spawn_thread(move || worker.run_detached())?;

        let mut state = context.inner.state.lock();
        while state.phase == Phase::NotRunning {
            context.inner.ready.wait(&mut state);
        }
        startup_outcome(&state)?;
        drop(state);
        Ok(context)
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Identity of the engine this context created, once it has run.
    pub fn engine_id(&self) -> Option<EngineId> {
        self.inner.state.lock().engine
    }

    /// The context running on the calling thread, if any.
    pub fn current() -> Option<Self> {
        registry::current_context()
    }

    /// Whether the calling thread is this context's running owner.
    pub fn is_current(&self) -> bool {
        registry::engine_for(self).is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Running
    // ─────────────────────────────────────────────────────────────────────────

    /// Run this context on the calling thread until [`stop`](Self::stop).
    ///
    /// The calling thread becomes the owner: the engine is created here and
    /// every job runs here. A context stopped before it ever ran returns
    /// [`ContextError::Cancelled`] without creating an engine.
    ///
    /// # Panics
    ///
    /// If the context is already running, or has already run and stopped.
    pub fn run_blocking(&self) -> Result<(), ContextError> {
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Stopped if !state.claimed => return Err(ContextError::Cancelled),
                Phase::Stopped => {
                    drop(state);
                    misuse("ExecutionContext has stopped and cannot be restarted")
                }
                Phase::Running => {
                    drop(state);
                    misuse("ExecutionContext is already running")
                }
                Phase::NotRunning if state.claimed => {
                    drop(state);
                    misuse("ExecutionContext is already starting on another thread")
                }
                Phase::NotRunning => state.claimed = true,
            }
        }

        let engine = match Engine::new(self.clone(), &self.inner.factory) {
            Ok(engine) => Rc::new(engine),
            Err(err) => {
                let message = err.to_string();
                tracing::error!(context = %self.id(), "Failed to create engine: {}", message);
                self.inner.state.lock().failure = Some(message.clone());
                self.stop();
                return Err(ContextError::Engine(message));
            }
        };

        {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Stopped {
                return Err(ContextError::Cancelled);
            }
            state.phase = Phase::Running;
            state.owner = Some(thread::current().id());
            state.engine = Some(engine.id());
        }
        self.inner.phase.send_replace(Phase::Running);
        self.inner.ready.notify_all();
        tracing::debug!(context = %self.id(), engine = %engine.id(), "Execution context running");

        let _registration = registry::enter(self.clone(), engine.clone());
        let _guard = LoopGuard { context: self };

        while let Some(job) = self.next_job() {
            job(&engine);
            engine.run_pending_jobs();
        }

        tracing::debug!(context = %self.id(), "Execution context loop exited");
        Ok(())
    }

    /// Run this context on a new dedicated thread.
    ///
    /// Completes when the context stops. Dropping the future stops the
    /// context.
    pub async fn run(&self) -> Result<(), ContextError> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops the context and returns
    /// [`ContextError::Cancelled`] as soon as `cancel` completes.
    ///
    /// If `cancel` is already complete on the first poll no thread is spawned.
    pub async fn run_until<C>(&self, cancel: C) -> Result<(), ContextError>
    where
        C: Future<Output = ()>,
    {
        let mut cancel = pin!(cancel);
        if futures::poll!(cancel.as_mut()).is_ready() {
            tracing::debug!(context = %self.id(), "Cancelled before start");
            self.stop();
            return Err(ContextError::Cancelled);
        }

        let _stop = StopOnDrop::new(self);
        let (done_tx, done_rx) = oneshot::channel();
        let worker = self.clone();
        self.spawn_thread(move || {
            let _ = done_tx.send(worker.run_blocking());
        })?;

        tokio::select! {
            result = done_rx => result.unwrap_or(Err(ContextError::Stopped)),
            _ = cancel.as_mut() => {
                tracing::debug!(context = %self.id(), "Cancelled");
                self.stop();
                Err(ContextError::Cancelled)
            }
        }
    }

    /// Wait until the context is running.
    ///
    /// Returns `Ok` once the engine exists, even if the context has stopped
    /// again since. Returns an error if it stopped without ever running.
    pub async fn wait_until_running(&self) -> Result<(), ContextError> {
        let mut phase = self.inner.phase.subscribe();
        phase
            .wait_for(|phase| *phase != Phase::NotRunning)
            .await
            .map_err(|_| ContextError::Stopped)?;
        startup_outcome(&self.inner.state.lock())
    }

    /// Stop the context. Idempotent and callable from any thread.
    ///
    /// Queued jobs are dropped and their handles resolve to
    /// [`ContextError::Stopped`]. The engine is destroyed on the owning thread
    /// once the job in progress, if any, returns.
    pub fn stop(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Stopped {
                return;
            }
            state.phase = Phase::Stopped;
            std::mem::take(&mut state.jobs)
        };
        self.inner.phase.send_replace(Phase::Stopped);
        self.inner.wake.notify_all();
        self.inner.ready.notify_all();
        tracing::debug!(context = %self.id(), dropped = dropped.len(), "Execution context stopped");
        drop(dropped);
    }

    fn run_detached(&self) {
        if let Err(err) = self.run_blocking() {
            tracing::warn!(context = %self.id(), "Execution context exited: {}", err);
        }
    }

    fn spawn_thread<F>(&self, body: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("{}-{}", self.inner.factory.thread_name, self.inner.id.0);
        thread::Builder::new().name(name).spawn(body)?;
        Ok(())
    }

    fn next_job(&self) -> Option<Job> {
        let mut state = self.inner.state.lock();
        loop {
            if state.phase == Phase::Stopped {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            self.inner.wake.wait(&mut state);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Engine access
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` with the engine on the owning thread.
    ///
    /// The job is queued immediately; the returned handle only delivers the
    /// result and dropping it does not cancel the job. A panic inside `f` is
    /// reported as [`ContextError::Panicked`].
    ///
    /// # Panics
    ///
    /// If the context is not running.
    pub fn with_engine<F, R>(&self, f: F) -> JobHandle<R>
    where
        F: FnOnce(&Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.try_with_engine(f) {
            Ok(handle) => handle,
            Err(ContextError::Stopped) => {
                misuse("ExecutionContext has been stopped; no further work can be scheduled")
            }
            Err(_) => misuse(
                "ExecutionContext is not running. Call `run`, `run_blocking`, `start` or `spawn` first. \
                 If it came from a ContextPool, make sure it has not been garbage collected.",
            ),
        }
    }

    /// Non-panicking variant of [`with_engine`](Self::with_engine).
    pub fn try_with_engine<F, R>(&self, f: F) -> Result<JobHandle<R>, ContextError>
    where
        F: FnOnce(&Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.id();
        let job: Job = Box::new(move |engine| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(engine))).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::warn!(context = %id, "Job panicked: {}", message);
                ContextError::Panicked(message)
            });
            let _ = tx.send(outcome);
        });
        self.try_enqueue(job).map_err(|(_, phase)| match phase {
            Phase::Stopped => ContextError::Stopped,
            _ => ContextError::NotRunning,
        })?;
        tracing::trace!(context = %id, "Job queued");
        Ok(JobHandle { rx })
    }

    /// Run `f` immediately if the calling thread is this context's running
    /// owner, otherwise return `None`.
    ///
    /// # Panics
    ///
    /// If the context has never run.
    pub fn with_engine_if_current<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&Engine) -> R,
    {
        let ran = self.inner.state.lock().engine.is_some();
        if !ran {
            misuse("ExecutionContext is not running. Call `run`, `run_blocking`, `start` or `spawn` first.");
        }
        let engine = registry::engine_for(self)?;
        Some(f(&engine))
    }

    /// A proxy isolating a new JavaScript context created in this engine.
    pub async fn context_proxy(&self) -> Result<IsolationProxy<Context>, ContextError> {
        self.with_engine(|engine| {
            engine
                .new_context()
                .map(|context| IsolationProxy::new(engine, context))
                .map_err(|err| ContextError::Engine(err.to_string()))
        })
        .await?
    }

    /// Synchronous [`context_proxy`](Self::context_proxy) for code already on
    /// the owning thread. `Ok(None)` when called from any other thread.
    pub fn context_proxy_if_current(&self) -> Result<Option<IsolationProxy<Context>>, ContextError> {
        self.with_engine_if_current(|engine| {
            engine
                .new_context()
                .map(|context| IsolationProxy::new(engine, context))
                .map_err(|err| ContextError::Engine(err.to_string()))
        })
        .transpose()
    }

    pub(crate) fn try_enqueue(&self, job: Job) -> Result<(), (Job, Phase)> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Running {
            let phase = state.phase;
            drop(state);
            return Err((job, phase));
        }
        state.jobs.push_back(job);
        drop(state);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Spawn host-side async work next to this context.
    pub(crate) fn spawn_host<F>(&self, future: F) -> Result<(), ContextError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self
            .inner
            .host
            .clone()
            .or_else(fallback_host)
            .ok_or_else(|| ContextError::Engine("no async runtime available".to_string()))?;
        handle.spawn(future);
        Ok(())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ExecutionContext {}

impl std::hash::Hash for ExecutionContext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("owner", &state.owner)
            .field("engine", &state.engine)
            .field("queued", &state.jobs.len())
            .finish()
    }
}

fn startup_outcome(state: &State) -> Result<(), ContextError> {
    if let Some(failure) = &state.failure {
        Err(ContextError::Engine(failure.clone()))
    } else if state.engine.is_some() {
        Ok(())
    } else {
        Err(ContextError::Cancelled)
    }
}

/// Host runtime used when a context was created outside of tokio.
fn fallback_host() -> Option<Handle> {
    static HOST: OnceLock<Option<tokio::runtime::Runtime>> = OnceLock::new();
    HOST.get_or_init(|| {
        match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("jsvm-host")
            .enable_all()
            .build()
        {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                tracing::error!("Failed to build host runtime: {}", err);
                None
            }
        }
    })
    .as_ref()
    .map(|runtime| runtime.handle().clone())
}

/// Marks the context stopped when its loop exits, including by unwinding.
struct LoopGuard<'a> {
    context: &'a ExecutionContext,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(context = %self.context.id(), "Execution context thread died; stopping");
        }
        self.context.stop();
        self.context.inner.state.lock().owner = None;
    }
}

struct StopOnDrop<'a> {
    context: Option<&'a ExecutionContext>,
}

impl<'a> StopOnDrop<'a> {
    fn new(context: &'a ExecutionContext) -> Self {
        Self {
            context: Some(context),
        }
    }

    fn disarm(mut self) {
        self.context = None;
    }
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context {
            context.stop();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job Handle
// ─────────────────────────────────────────────────────────────────────────────

/// The pending result of a job submitted with
/// [`ExecutionContext::with_engine`].
pub struct JobHandle<R> {
    rx: oneshot::Receiver<Result<R, ContextError>>,
}

impl<R> JobHandle<R> {
    /// Block the calling thread until the job finishes.
    ///
    /// Must not be called from async code or from the owning thread.
    pub fn blocking_wait(self) -> Result<R, ContextError> {
        self.rx.blocking_recv().unwrap_or(Err(ContextError::Stopped))
    }
}

impl<R> Future for JobHandle<R> {
    type Output = Result<R, ContextError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ContextError::Stopped)))
    }
}

impl<R> fmt::Debug for JobHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle").finish_non_exhaustive()
    }
}
