//! Native functions backed by host async work.

use std::fmt;
use std::future::Future;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, FromJs, Function, IntoJs, Object};

use crate::promise::JsPromise;
use crate::registry;

/// Build a native function that runs `f` on the host runtime for every call
/// and hands the caller a promise of its result.
///
/// Every argument is converted to `A`. The function throws when invoked from a
/// context whose engine is not running on the calling thread.
pub fn async_function<'js, A, F, Fut, T, E>(ctx: &Ctx<'js>, f: F) -> rquickjs::Result<Function<'js>>
where
    A: FromJs<'js> + 'js,
    F: Fn(Vec<A>) -> Fut + 'js,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: for<'a> IntoJs<'a> + Send + 'static,
    E: fmt::Display,
{
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<A>| -> rquickjs::Result<JsPromise<T>> {
            if !registry::is_on_current_context(&ctx) {
                return Err(Exception::throw_message(
                    &ctx,
                    "async function called outside of its execution context",
                ));
            }
            JsPromise::from_async(&ctx, f(args.0))
        },
    )
}

/// Install an [`async_function`] as `object[name]`.
pub fn set_async_function<'js, A, F, Fut, T, E>(
    ctx: &Ctx<'js>,
    object: &Object<'js>,
    name: &str,
    f: F,
) -> rquickjs::Result<()>
where
    A: FromJs<'js> + 'js,
    F: Fn(Vec<A>) -> Fut + 'js,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: for<'a> IntoJs<'a> + Send + 'static,
    E: fmt::Display,
{
    let function = async_function(ctx, f)?;
    object.set(name, function)
}
