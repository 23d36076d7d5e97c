//! jsvm
//!
//! Thread-affine scheduling for an embedded JavaScript engine.
//!
//! QuickJS runtimes must only ever be touched by the thread that created
//! them. This crate pins every engine to a dedicated OS thread and gives the
//! rest of the program safe ways to reach it.
//!
//! # Architecture
//!
//! - [`ExecutionContext`] owns one worker thread and the engine created on it;
//!   work is submitted as jobs and runs FIFO on that thread
//! - [`IsolationProxy`] names an engine-bound value from any thread; the value
//!   itself never leaves the owning thread
//! - [`ContextPool`] hands out a bounded set of reference-counted contexts
//!   round-robin
//! - [`JsPromise`] bridges engine promises and host futures in both directions
//!
//! Using a context from the wrong thread, or before it runs, is a programming
//! error and panics with a diagnostic.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod function;
pub mod global;
pub mod isolation;
pub mod pool;
pub mod promise;
mod registry;

pub use config::{ConfigError, ContextSetup, EngineFactory, EngineOptions, PoolConfig};
pub use context::{ContextId, ExecutionContext, JobHandle, Phase};
pub use engine::{Engine, EngineId};
pub use error::{BridgeError, ContextError, JsError};
pub use function::{async_function, set_async_function};
pub use isolation::IsolationProxy;
pub use pool::{ContextLease, ContextPool, PoolStatus};
pub use promise::{JsPromise, Resolvers, SettleHandle, Settlement};
pub use registry::is_on_current_context;
