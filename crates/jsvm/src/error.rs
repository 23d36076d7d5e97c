//! Error types for execution contexts and the promise bridge.

use std::fmt;

use rquickjs::{Coerced, Ctx, Exception, FromJs, IntoJs, Persistent, Value};

use crate::isolation::IsolationProxy;
use crate::registry;

/// Errors surfaced by [`ExecutionContext`](crate::ExecutionContext) operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Execution context was cancelled")]
    Cancelled,

    #[error("Execution context has stopped")]
    Stopped,

    #[error("Execution context is not running")]
    NotRunning,

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Errors surfaced while moving promises between the engine and the host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Js(#[from] JsError),

    #[error("Promise belongs to a different engine")]
    DifferentEngines,

    #[error("Value is not a promise")]
    NotAPromise,

    #[error("Type conversion error: {0}")]
    Conversion(String),

    #[error("Execution context error: {0}")]
    Context(String),
}

impl From<ContextError> for BridgeError {
    fn from(err: ContextError) -> Self {
        Self::Context(err.to_string())
    }
}

impl BridgeError {
    /// Classify an engine error raised while running on the owning thread.
    pub(crate) fn from_engine(ctx: &Ctx<'_>, err: rquickjs::Error) -> Self {
        if matches!(err, rquickjs::Error::Exception) {
            Self::Js(JsError::thrown(ctx, ctx.catch()))
        } else {
            Self::Conversion(err.to_string())
        }
    }

    /// Throw this error into the engine from inside a native callback.
    pub(crate) fn throw(self, ctx: &Ctx<'_>) -> rquickjs::Error {
        match self {
            Self::Js(err) => match err.to_js(ctx) {
                Ok(value) => ctx.throw(value),
                Err(err) => err,
            },
            other => Exception::throw_message(ctx, &other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JsError
// ─────────────────────────────────────────────────────────────────────────────

/// A JavaScript exception observed by the host.
///
/// When the exception was caught on the owning thread the thrown value is kept
/// behind an [`IsolationProxy`], so it can be inspected or rethrown later on the
/// same engine. The message is a plain-text rendering usable anywhere.
#[derive(Clone, thiserror::Error)]
#[error("{}", .message.as_deref().unwrap_or("JavaScript exception"))]
pub struct JsError {
    value: Option<IsolationProxy<Persistent<Value<'static>>>>,
    message: Option<String>,
}

impl JsError {
    /// An error carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            value: None,
            message: Some(message.into()),
        }
    }

    /// Capture a thrown value on the owning thread.
    pub fn thrown<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Self {
        let message = describe(ctx, value.clone());
        let value = registry::current_engine()
            .filter(|engine| engine.owns(ctx))
            .map(|engine| IsolationProxy::new(&engine, Persistent::save(ctx, value)));
        Self {
            value,
            message: Some(message),
        }
    }

    /// The plain-text description of the exception, if any.
    pub fn text(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The isolated thrown value, when it was captured on its owning thread.
    pub fn value(&self) -> Option<&IsolationProxy<Persistent<Value<'static>>>> {
        self.value.as_ref()
    }

    /// Turn this error back into a JavaScript value.
    ///
    /// The original thrown value is restored when `ctx` belongs to the engine
    /// that raised it; otherwise a fresh `Error` carrying the message is built.
    pub fn to_js<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        if let Some(proxy) = &self.value {
            if let Some(engine) = registry::current_engine()
                .filter(|engine| engine.id() == proxy.engine_id() && engine.owns(ctx))
            {
                return proxy.with_isolation_in(&engine, |value, _| value.clone().restore(ctx));
            }
        }
        new_error(ctx, self.message.as_deref().unwrap_or_default())
    }
}

impl fmt::Debug for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsError")
            .field("value", &self.value)
            .field("message", &self.message)
            .finish()
    }
}

/// A fresh `Error` object carrying `message`.
pub(crate) fn new_error<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Value<'js>> {
    Exception::from_message(ctx.clone(), message)?.into_js(ctx)
}

/// Render a caught value the way a console would.
pub(crate) fn describe<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> String {
    if let Ok(obj) = caught.clone().try_into_object() {
        if let Some(exception) = Exception::from_object(obj) {
            if let Some(message) = exception.message() {
                return message;
            }
        }
    }

    match Coerced::<String>::from_js(ctx, caught) {
        Ok(value) => value.0,
        Err(err) => format!("(failed to stringify exception: {err})"),
    }
}

/// Report an API misuse and abort the calling operation.
#[track_caller]
pub(crate) fn misuse(message: &str) -> ! {
    tracing::error!("{}", message);
    panic!("{}", message);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_error_display() {
        let err = JsError::message("boom");
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.text(), Some("boom"));
        assert!(err.value().is_none());

        let err = BridgeError::from(err);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_context_error_into_bridge_error() {
        let err = BridgeError::from(ContextError::Stopped);
        assert!(matches!(err, BridgeError::Context(_)));
        assert_eq!(err.to_string(), "Execution context error: Execution context has stopped");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("bad");
        assert_eq!(panic_message(payload.as_ref()), "bad");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("worse"));
        assert_eq!(panic_message(payload.as_ref()), "worse");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_describe_thrown_values() {
        let rt = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&rt).unwrap();
        context.with(|ctx| {
            let err: Value = ctx.eval("new TypeError('nope')").unwrap();
            assert_eq!(describe(&ctx, err), "nope");

            let plain: Value = ctx.eval("17").unwrap();
            assert_eq!(describe(&ctx, plain), "17");
        });
    }

    #[test]
    fn test_new_error_is_an_error_object() {
        let rt = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&rt).unwrap();
        context.with(|ctx| {
            let err = new_error(&ctx, "broken").unwrap();
            let check: rquickjs::Function = ctx.eval("(e) => e instanceof Error").unwrap();
            assert!(check.call::<_, bool>((err.clone(),)).unwrap());
            assert_eq!(describe(&ctx, err), "broken");

            let rebuilt = JsError::message("detached").to_js(&ctx).unwrap();
            assert_eq!(describe(&ctx, rebuilt), "detached");
        });
    }
}
