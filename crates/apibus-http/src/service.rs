//! The hyper `Service` entrypoint.
//!
//! Adapts one HTTP request/response pair to the pipeline: collect the body
//! under limits, construct a [`Context`] (usable for error-envelope
//! emission even when construction fails), run the engine, serve the
//! resulting envelope. The path is taken verbatim from the request URI;
//! callers strip any mount prefix before handing requests over.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::service::Service;
use tracing::{debug, warn};

use apibus_core::context::Context;
use apibus_core::engine::Engine;
use apibus_core::response::Response;

use crate::body::ApiResponseBody;
use crate::{limits, serve};

/// The HTTP front-end service.
#[derive(Clone)]
pub struct ApiService {
    engine: Engine,
}

impl ApiService {
    /// Create a service around a shared engine.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl Service<http::Request<Incoming>> for ApiService {
    type Response = http::Response<ApiResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<Incoming>) -> Self::Future {
        let engine = self.engine.clone();
        Box::pin(async move { Ok(handle_request(&engine, req).await) })
    }
}

/// Run one request through the full pipeline.
pub async fn handle_request<B>(
    engine: &Engine,
    req: http::Request<B>,
) -> http::Response<ApiResponseBody>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    debug!(method = %parts.method, uri = %parts.uri, "processing api request");

    match limits::collect_body(&parts, body).await {
        Ok(collected) => {
            let (ctx, parsed) = Context::from_http(parts, collected).await;
            let resp = match parsed {
                Ok(()) => engine.respond(&ctx).await,
                Err(e) => {
                    warn!(error = %e, request_id = %ctx.request_id(), "request parsing failed");
                    Response::from_error(&ctx, &e)
                }
            };
            serve::serve(engine, &ctx, resp).await
        }
        Err(e) => {
            // Body collection failed; the context still serves the error
            // envelope with standard headers.
            let (ctx, _) = Context::from_http(parts, None).await;
            warn!(error = %e, request_id = %ctx.request_id(), "request body rejected");
            let resp = Response::from_error(&ctx, &e);
            serve::serve(engine, &ctx, resp).await
        }
    }
}
