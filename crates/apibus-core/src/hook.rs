//! Request and response hooks.
//!
//! Hooks are the extension point for everything the framework deliberately
//! does not own: authentication, authorization, audit, schema checks.
//! Request hooks run before dispatch; the first one returning an error
//! aborts the request. Response hooks run on every response; an error from
//! one replaces the response with an error envelope.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ApiError, ApiResult};
use crate::response::Response;

/// Future type returned by hooks.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ApiResult<()>> + Send + 'a>>;

/// Intercepts a request before it is dispatched.
pub trait RequestHook: Send + Sync {
    /// Inspect or modify the context; an error aborts the request.
    fn run<'a>(&'a self, ctx: &'a Context) -> HookFuture<'a>;
}

/// Intercepts a response before it is written.
pub trait ResponseHook: Send + Sync {
    /// Inspect the response; an error replaces it with an error envelope.
    fn run<'a>(&'a self, resp: &'a Response) -> HookFuture<'a>;
}

struct RequestHookFn<F>(F);

impl<F> RequestHook for RequestHookFn<F>
where
    F: Fn(&Context) -> ApiResult<()> + Send + Sync,
{
    fn run<'a>(&'a self, ctx: &'a Context) -> HookFuture<'a> {
        let result = (self.0)(ctx);
        Box::pin(async move { result })
    }
}

/// Wrap a synchronous closure as a [`RequestHook`].
pub fn request_hook_fn<F>(f: F) -> Arc<dyn RequestHook>
where
    F: Fn(&Context) -> ApiResult<()> + Send + Sync + 'static,
{
    Arc::new(RequestHookFn(f))
}

struct ResponseHookFn<F>(F);

impl<F> ResponseHook for ResponseHookFn<F>
where
    F: Fn(&Response) -> ApiResult<()> + Send + Sync,
{
    fn run<'a>(&'a self, resp: &'a Response) -> HookFuture<'a> {
        let result = (self.0)(resp);
        Box::pin(async move { result })
    }
}

/// Wrap a synchronous closure as a [`ResponseHook`].
pub fn response_hook_fn<F>(f: F) -> Arc<dyn ResponseHook>
where
    F: Fn(&Response) -> ApiResult<()> + Send + Sync + 'static,
{
    Arc::new(ResponseHookFn(f))
}

/// Sample hook marking a request CSRF-validated when the middleware header
/// `Sec-Csrf-Token` carries the value `valid`.
///
/// Real deployments should replace this with proper token validation; it
/// exists so the validated flag has a reference producer.
pub struct CsrfHeaderHook;

impl RequestHook for CsrfHeaderHook {
    fn run<'a>(&'a self, ctx: &'a Context) -> HookFuture<'a> {
        if ctx.header("sec-csrf-token").as_deref() == Some("valid") {
            ctx.set_csrf_validated(true);
        }
        Box::pin(async { Ok(()) })
    }
}

/// Hook rejecting unvalidated `POST` requests with
/// `error_insecure_request`.
pub struct RequireCsrf;

impl RequestHook for RequireCsrf {
    fn run<'a>(&'a self, ctx: &'a Context) -> HookFuture<'a> {
        let result = if ctx.verb() == http::Method::POST && !ctx.csrf_validated() {
            Err(ApiError::insecure_request())
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }
}
