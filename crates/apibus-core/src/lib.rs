//! Transport-neutral request dispatch core.
//!
//! apibus exposes one object-tree API surface over several transports at
//! once: stateless HTTP, WebSocket, and local stream sockets. This crate
//! holds everything the transports share:
//!
//! - [`context::Context`]: per-request state, parameter parsing, object
//!   cache, event subscriptions, response sinks.
//! - [`registry`]: the adapter interface the dispatcher consumes from the
//!   external class tree.
//! - [`dispatch`]: path resolution and verb→action mapping.
//! - [`response::Response`]: the uniform envelope every request resolves
//!   to, regardless of transport or encoding.
//! - [`engine::Engine`]: hook chains, special paths, connected-client
//!   maps, and the response pipeline.
//! - [`broadcast`]: the ring-buffered event bus feeding long-lived peers.
//!
//! Transport front-ends live in `apibus-http`, `apibus-ws`, and
//! `apibus-socket`.

pub mod broadcast;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hook;
pub mod params;
pub mod registry;
pub mod response;
pub mod sink;

pub use broadcast::{Bus, BusEvent};
pub use context::{Context, Pagination, PreAttached, WeakContext};
pub use dispatch::dispatch;
pub use engine::{Engine, EngineBuilder};
pub use error::{ApiError, ApiErrorCode, ApiResult};
pub use hook::{
    request_hook_fn, response_hook_fn, CsrfHeaderHook, RequestHook, RequireCsrf, ResponseHook,
};
pub use params::MediaType;
pub use registry::{
    action_fn, typed_action, Action, ActionKind, ApiObject, ClassNode, Deletable, Object, Outcome,
    StaticClass, Updatable, ValueObject,
};
pub use response::{Payload, Response, ResponseKind};
pub use sink::{encoder_sink, Encoder, RawSink, ResponseSink};
