//! The engine: shared state and the response pipeline.
//!
//! One [`Engine`] is built at startup and handed to every transport
//! front-end. It owns the registry root, the hook lists, the special-path
//! table, the broadcast bus, and the connected-client maps. Hook lists are
//! read-mostly: registration takes the write lock, every request snapshots
//! under the read lock, so a hook registered before a request begins is
//! always observed by it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broadcast::{Bus, BusEvent};
use crate::context::Context;
use crate::dispatch::dispatch;
use crate::error::{ApiError, ApiResult};
use crate::hook::{RequestHook, ResponseHook};
use crate::registry::{action_fn, Action, ClassNode, Outcome, StaticClass};
use crate::response::{Payload, Response};
use crate::sink::RawSink;

struct EngineInner {
    root: Arc<dyn ClassNode>,
    request_hooks: RwLock<Vec<Arc<dyn RequestHook>>>,
    response_hooks: RwLock<Vec<Arc<dyn ResponseHook>>>,
    specials: RwLock<HashMap<String, Arc<dyn Action>>>,
    bus: Bus,
    ws_clients: DashMap<String, Context>,
    socket_clients: DashMap<Uuid, Arc<dyn RawSink>>,
}

/// Shared handle to the framework state. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            root: None,
            request_hooks: Vec::new(),
            response_hooks: Vec::new(),
            specials: HashMap::new(),
        }
    }

    /// The object-registry root the dispatcher walks.
    #[must_use]
    pub fn root(&self) -> Arc<dyn ClassNode> {
        Arc::clone(&self.inner.root)
    }

    /// Register a request hook. Safe to call while requests are running;
    /// in-flight requests keep the snapshot they started with.
    pub fn add_request_hook(&self, hook: Arc<dyn RequestHook>) {
        self.inner.request_hooks.write().push(hook);
    }

    /// Register a response hook.
    pub fn add_response_hook(&self, hook: Arc<dyn ResponseHook>) {
        self.inner.response_hooks.write().push(hook);
    }

    /// Register a `@`-path special handler.
    pub fn register_special(&self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.inner.specials.write().insert(name.into(), action);
    }

    /// Look up a special handler.
    #[must_use]
    pub fn special(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.inner.specials.read().get(name).map(Arc::clone)
    }

    /// The broadcast bus.
    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    // --- Connected-client maps ---

    /// Register a WebSocket peer under its connection request id.
    pub fn register_ws_client(&self, ctx: Context) {
        self.inner
            .ws_clients
            .insert(ctx.request_id().to_owned(), ctx);
    }

    /// Remove a WebSocket peer.
    pub fn release_ws_client(&self, request_id: &str) {
        self.inner.ws_clients.remove(request_id);
    }

    /// Number of connected WebSocket peers.
    #[must_use]
    pub fn ws_client_count(&self) -> usize {
        self.inner.ws_clients.len()
    }

    /// Register a stream-socket peer.
    pub fn register_socket_client(&self, id: Uuid, sink: Arc<dyn RawSink>) {
        self.inner.socket_clients.insert(id, sink);
    }

    /// Remove a stream-socket peer.
    pub fn release_socket_client(&self, id: Uuid) {
        self.inner.socket_clients.remove(&id);
    }

    /// Number of connected stream-socket peers.
    #[must_use]
    pub fn socket_client_count(&self) -> usize {
        self.inner.socket_clients.len()
    }

    // --- Broadcast publishers ---

    /// Send a payload to every WebSocket peer (topic `*`).
    pub fn broadcast_ws(&self, ctx: &Context, payload: Value) {
        self.send_ws(ctx, "*", payload);
    }

    /// Send a payload to WebSocket peers subscribed to a topic.
    pub fn send_ws(&self, ctx: &Context, topic: impl Into<String>, payload: Value) {
        let event = BusEvent::new(topic, payload, Some(ctx.request_id().to_owned()));
        let delivered = self.inner.bus.publish(event);
        debug!(origin = %ctx.request_id(), subscribers = delivered, "broadcast event published");
    }

    /// Send a pre-formed payload to every stream-socket peer. Each write
    /// runs in its own task so one slow peer cannot delay the rest.
    pub fn broadcast_json(&self, payload: &Value) {
        for entry in self.inner.socket_clients.iter() {
            let sink = Arc::clone(entry.value());
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.send_value(&payload).await {
                    debug!(error = %e, "dropping broadcast to stream-socket peer");
                }
            });
        }
    }

    // --- Pipeline ---

    /// Run the full response pipeline for a populated context.
    ///
    /// Panics in hooks or dispatch are captured into a 500 error envelope
    /// with the stack in the `debug` field.
    pub async fn respond(&self, ctx: &Context) -> Response {
        match std::panic::AssertUnwindSafe(self.run_pipeline(ctx))
            .catch_unwind()
            .await
        {
            Ok(resp) => resp,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let stack = std::backtrace::Backtrace::force_capture().to_string();
                error!(
                    event = "apibus:response:panic",
                    path = %ctx.path(),
                    request_id = %ctx.request_id(),
                    panic = %message,
                    "panic while producing response"
                );
                Response::from_panic(ctx, &message, stack)
            }
        }
    }

    async fn run_pipeline(&self, ctx: &Context) -> Response {
        let request_hooks: Vec<_> = self.inner.request_hooks.read().clone();
        for hook in request_hooks {
            if let Err(e) = hook.run(ctx).await {
                return self.finish(Response::from_error(ctx, &e)).await;
            }
        }

        match dispatch(self, ctx).await {
            Err(e) => self.finish(Response::from_error(ctx, &e)).await,
            Ok(Outcome::Response(mut resp)) => {
                resp.refresh_time();
                // Pass-through responses are not replaced by hook errors.
                if let Some(e) = self.run_response_hooks(&resp).await {
                    warn!(error = %e, "response hook failed on pass-through response");
                }
                resp
            }
            Ok(Outcome::Value(value)) => {
                self.finish(Response::success(ctx, Payload::Value(value))).await
            }
            Ok(Outcome::Object(object)) => {
                let encoded = object.encode(ctx);
                self.finish(Response::success(ctx, Payload::Value(encoded))).await
            }
        }
    }

    /// Run response hooks; a hook error replaces the response with a fresh
    /// error envelope, and hooks are not run again on the replacement.
    async fn finish(&self, resp: Response) -> Response {
        match self.run_response_hooks(&resp).await {
            None => resp,
            Some(e) => match resp.context() {
                Some(ctx) => Response::from_error(&ctx, &e),
                None => resp,
            },
        }
    }

    async fn run_response_hooks(&self, resp: &Response) -> Option<ApiError> {
        let hooks: Vec<_> = self.inner.response_hooks.read().clone();
        for hook in hooks {
            if let Err(e) = hook.run(resp).await {
                return Some(e);
            }
        }
        None
    }

    /// Emit a progress message through the context's sink, if one is
    /// attached. Progress never advances the main response.
    pub async fn progress(&self, ctx: &Context, data: Value) -> ApiResult<()> {
        let resp = Response::progress(ctx, data);
        if let Some(e) = self.run_response_hooks(&resp).await {
            warn!(error = %e, "response hook failed on progress message");
        }
        match ctx.sink() {
            Some(sink) => sink.send_response(&resp).await,
            None => Ok(()),
        }
    }
}

/// Extract a printable message from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    root: Option<Arc<dyn ClassNode>>,
    request_hooks: Vec<Arc<dyn RequestHook>>,
    response_hooks: Vec<Arc<dyn ResponseHook>>,
    specials: HashMap<String, Arc<dyn Action>>,
}

impl EngineBuilder {
    /// Set the object-registry root.
    #[must_use]
    pub fn root(mut self, root: Arc<dyn ClassNode>) -> Self {
        self.root = Some(root);
        self
    }

    /// Register a request hook.
    #[must_use]
    pub fn request_hook(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.request_hooks.push(hook);
        self
    }

    /// Register a response hook.
    #[must_use]
    pub fn response_hook(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.response_hooks.push(hook);
        self
    }

    /// Register a `@`-path special handler.
    #[must_use]
    pub fn special(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.specials.insert(name.into(), action);
        self
    }

    /// Finish the engine. The built-in specials `@ping` (health) and
    /// `@ws` (WebSocket upgrade) are registered unless overridden.
    #[must_use]
    pub fn build(self) -> Engine {
        let mut specials = self.specials;
        specials
            .entry("ping".to_owned())
            .or_insert_with(|| action_fn(|_ctx, _args| async move {
                Ok(Outcome::Value(json!({"ping": "pong"})))
            }));
        specials
            .entry("ws".to_owned())
            .or_insert_with(|| action_fn(|ctx, _args| async move {
                Ok(Outcome::Response(Response::upgrade(&ctx)))
            }));

        Engine {
            inner: Arc::new(EngineInner {
                root: self
                    .root
                    .unwrap_or_else(|| StaticClass::builder("").build()),
                request_hooks: RwLock::new(self.request_hooks),
                response_hooks: RwLock::new(self.response_hooks),
                specials: RwLock::new(specials),
                bus: Bus::new(),
                ws_clients: DashMap::new(),
                socket_clients: DashMap::new(),
            }),
        }
    }
}
