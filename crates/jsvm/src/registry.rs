//! Thread-local record of the execution context running on this thread.
//!
//! Jobs get their engine explicitly. The registry only exists for code the
//! engine calls back into (native functions, promise handlers) which has a
//! `Ctx` but no `&Engine`.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::Ctx;

use crate::context::ExecutionContext;
use crate::engine::Engine;

struct Registration {
    context: ExecutionContext,
    engine: Rc<Engine>,
}

thread_local! {
    static CURRENT: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

/// Clears the registration when the owning loop exits, including by unwinding.
pub(crate) struct RegistrationGuard {
    _private: (),
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let previous = CURRENT.with(|current| current.borrow_mut().take());
        drop(previous);
    }
}

/// Register `engine` as owned by `context` on the calling thread.
pub(crate) fn enter(context: ExecutionContext, engine: Rc<Engine>) -> RegistrationGuard {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(Registration { context, engine });
    });
    RegistrationGuard { _private: () }
}

/// The execution context running on this thread, if any.
pub(crate) fn current_context() -> Option<ExecutionContext> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|registration| registration.context.clone())
    })
}

/// The engine owned by this thread, if any.
pub(crate) fn current_engine() -> Option<Rc<Engine>> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|registration| registration.engine.clone())
    })
}

/// The engine owned by this thread if it belongs to `context`.
pub(crate) fn engine_for(context: &ExecutionContext) -> Option<Rc<Engine>> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|registration| registration.context == *context)
            .map(|registration| registration.engine.clone())
    })
}

/// Whether `ctx` belongs to the engine of the execution context running on
/// this thread.
pub fn is_on_current_context(ctx: &Ctx<'_>) -> bool {
    current_engine().is_some_and(|engine| engine.owns(ctx))
}
