//! A process-wide execution context for callers that do not manage their own.
//!
//! The context is started on first use on a thread named `jsvm-global-<n>` and
//! lives outside of any [`ContextPool`](crate::ContextPool).

use std::sync::OnceLock;

use crate::config::EngineFactory;
use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::error::ContextError;

static GLOBAL: OnceLock<Result<ExecutionContext, String>> = OnceLock::new();

/// The global execution context, started on first call.
pub fn context() -> Result<&'static ExecutionContext, ContextError> {
    GLOBAL
        .get_or_init(|| {
            ExecutionContext::spawn(EngineFactory::default().thread_name("jsvm-global")).map_err(|err| {
                tracing::error!("Failed to start global execution context: {}", err);
                err.to_string()
            })
        })
        .as_ref()
        .map_err(|message| ContextError::Engine(message.clone()))
}

/// Run `f` with the global engine.
pub async fn run<F, R>(f: F) -> Result<R, ContextError>
where
    F: FnOnce(&Engine) -> R + Send + 'static,
    R: Send + 'static,
{
    context()?.try_with_engine(f)?.await
}
