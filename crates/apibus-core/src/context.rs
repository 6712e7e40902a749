//! The per-request context.
//!
//! A [`Context`] accumulates everything one request needs: identity,
//! routing, parsed parameters, cached objects, response decoration, the
//! event-subscription set, and an optional sink for progress and streamed
//! results. Transports own the context for one request (HTTP) or one frame
//! (long-lived peers); the connection-scoped parent context additionally
//! owns the subscription set consulted by broadcast fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::params::{self, MediaType};
use crate::registry::Object;
use crate::sink::ResponseSink;

/// Objects attached by outer middleware before dispatch.
///
/// Placed into the request extensions; the context shallow-copies the map
/// at construction so the middleware's own copy cannot be mutated through
/// the request.
#[derive(Clone, Default)]
pub struct PreAttached {
    /// Objects keyed by type tag, retrievable via [`Context::object`].
    pub objects: HashMap<String, Object>,
    /// Adopt this request id instead of generating one.
    pub request_id: Option<String>,
    /// Pre-resolved user object.
    pub user: Option<Object>,
}

impl PreAttached {
    /// Attach one object under a type tag.
    #[must_use]
    pub fn with_object(mut self, tag: impl Into<String>, object: Object) -> Self {
        self.objects.insert(tag.into(), object);
        self
    }
}

/// One frame on a long-lived transport.
#[derive(Debug, Deserialize)]
struct FrameRequest {
    path: String,
    #[serde(default)]
    verb: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    query_id: Option<String>,
}

struct ContextInner {
    request_id: String,
    query_id: Option<String>,
    path: RwLock<String>,
    verb: RwLock<Method>,
    params: RwLock<Option<Value>>,
    query: Map<String, Value>,
    raw: AtomicBool,
    pretty: AtomicBool,
    accept: RwLock<Vec<String>>,
    extra: RwLock<Map<String, Value>>,
    cache: RwLock<Option<Duration>>,
    objects: RwLock<HashMap<String, Object>>,
    user: RwLock<Option<Object>>,
    csrf_validated: AtomicBool,
    show_protected: AtomicBool,
    sink: RwLock<Option<Arc<dyn ResponseSink>>>,
    listen: RwLock<Option<HashMap<String, bool>>>,
    parent: Option<Context>,
    start: Instant,
    cancel: CancellationToken,
    body: RwLock<Option<Bytes>>,
    headers: Option<HeaderMap>,
    uri: Option<Uri>,
    extensions: Mutex<http::Extensions>,
    input_json: OnceLock<Option<Bytes>>,
}

/// The per-request state carrier. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// A non-owning handle to a context, used by responses so the back-link
/// does not keep the request alive.
#[derive(Clone)]
pub struct WeakContext {
    inner: std::sync::Weak<ContextInner>,
}

impl WeakContext {
    /// Recover the context, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

/// Shared defaults for the various constructors.
struct ContextParts {
    request_id: Option<String>,
    query_id: Option<String>,
    path: String,
    verb: Method,
    query: Map<String, Value>,
    accept: Vec<String>,
    objects: HashMap<String, Object>,
    user: Option<Object>,
    parent: Option<Context>,
    headers: Option<HeaderMap>,
    uri: Option<Uri>,
    extensions: http::Extensions,
}

impl ContextParts {
    fn bare(path: &str, verb: Method) -> Self {
        Self {
            request_id: None,
            query_id: None,
            path: path.trim_start_matches('/').to_owned(),
            verb,
            query: Map::new(),
            accept: Vec::new(),
            objects: HashMap::new(),
            user: None,
            parent: None,
            headers: None,
            uri: None,
            extensions: http::Extensions::new(),
        }
    }

    fn build(self) -> Context {
        let cancel = self
            .parent
            .as_ref()
            .map_or_else(CancellationToken::new, |p| p.inner.cancel.child_token());
        let raw = self.query.contains_key("raw");
        let pretty = self.query.contains_key("pretty");
        Context {
            inner: Arc::new(ContextInner {
                request_id: self
                    .request_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                query_id: self.query_id,
                path: RwLock::new(self.path),
                verb: RwLock::new(self.verb),
                params: RwLock::new(None),
                query: self.query,
                raw: AtomicBool::new(raw),
                pretty: AtomicBool::new(pretty),
                accept: RwLock::new(self.accept),
                extra: RwLock::new(Map::new()),
                cache: RwLock::new(None),
                objects: RwLock::new(self.objects),
                user: RwLock::new(self.user),
                csrf_validated: AtomicBool::new(false),
                show_protected: AtomicBool::new(false),
                sink: RwLock::new(None),
                listen: RwLock::new(None),
                parent: self.parent,
                start: Instant::now(),
                cancel,
                body: RwLock::new(None),
                headers: self.headers,
                uri: self.uri,
                extensions: Mutex::new(self.extensions),
                input_json: OnceLock::new(),
            }),
        }
    }
}

impl Context {
    /// Create an empty context for the given path and verb.
    #[must_use]
    pub fn new(path: impl AsRef<str>, verb: Method) -> Self {
        ContextParts::bare(path.as_ref(), verb).build()
    }

    /// Create a child context inheriting the parent's attached objects.
    ///
    /// The object map is shallow-copied so later mutations of the child do
    /// not leak into the parent. Cancellation cascades from the parent.
    #[must_use]
    pub fn with_parent(parent: &Context, path: impl AsRef<str>, verb: Method) -> Self {
        let mut parts = ContextParts::bare(path.as_ref(), verb);
        parts.objects = parent.inner.objects.read().clone();
        parts.user = parent.inner.user.read().clone();
        parts.accept = parent.inner.accept.read().clone();
        parts.parent = Some(parent.clone());
        parts.build()
    }

    /// Build a context from collected HTTP request parts.
    ///
    /// The body must already have been collected under the media-type size
    /// limits. The context is usable for error-envelope emission even when
    /// parameter parsing fails, which is why the error is returned beside
    /// the context rather than instead of it.
    pub async fn from_http(
        parts: http::request::Parts,
        body: Option<Bytes>,
    ) -> (Self, ApiResult<()>) {
        let mut cp = ContextParts::bare(parts.uri.path(), parts.method.clone());
        cp.query = params::parse_php_query(parts.uri.query().unwrap_or(""));
        if let Some(accept) = parts.headers.get(http::header::ACCEPT) {
            if let Ok(value) = accept.to_str() {
                cp.accept = params::parse_accept(value);
            }
        }
        if let Some(pre) = parts.extensions.get::<PreAttached>() {
            cp.objects = pre.objects.clone();
            cp.user = pre.user.clone();
            cp.request_id = pre.request_id.clone().filter(|id| !id.is_empty());
        }
        cp.headers = Some(parts.headers);
        cp.uri = Some(parts.uri);
        cp.extensions = parts.extensions;
        let ctx = cp.build();

        let parsed = ctx.parse_input(body).await;
        (ctx, parsed)
    }

    /// Build a child context from one long-lived transport frame.
    ///
    /// The frame must decode to `{path, verb?, params, query_id?}` in the
    /// given encoding; the verb defaults to `GET`. As with HTTP
    /// construction, a context is returned even when decoding fails.
    pub fn child_from_frame(
        parent: &Context,
        data: &[u8],
        encoding: MediaType,
    ) -> (Self, ApiResult<()>) {
        let decoded: Result<FrameRequest, ApiError> = match encoding {
            MediaType::Json => serde_json::from_slice(data)
                .map_err(|e| ApiError::internal(format!("invalid request frame: {e}"))),
            MediaType::Cbor => ciborium::from_reader(data)
                .map_err(|e| ApiError::internal(format!("invalid request frame: {e}"))),
        };

        match decoded {
            Ok(frame) => {
                let verb = frame
                    .verb
                    .as_deref()
                    .and_then(|v| Method::from_bytes(v.as_bytes()).ok())
                    .unwrap_or(Method::GET);
                let mut cp = ContextParts::bare(&frame.path, verb);
                cp.objects = parent.inner.objects.read().clone();
                cp.user = parent.inner.user.read().clone();
                cp.accept = parent.inner.accept.read().clone();
                cp.query_id = frame.query_id;
                cp.parent = Some(parent.clone());
                let ctx = cp.build();
                *ctx.inner.params.write() = frame.params;
                (ctx, Ok(()))
            }
            Err(e) => (Self::with_parent(parent, "", Method::GET), Err(e)),
        }
    }

    /// Parse request parameters from the collected body, or from the query
    /// string for non-body verbs. Runs once; params are never reparsed.
    async fn parse_input(&self, body: Option<Bytes>) -> ApiResult<()> {
        if self.inner.params.read().is_some() {
            return Ok(());
        }

        let verb = self.verb();
        if matches!(verb, Method::POST | Method::PATCH | Method::PUT) {
            let Some(data) = body else {
                return Ok(());
            };
            if data.len() as u64 <= params::REPLAY_BODY_LIMIT {
                *self.inner.body.write() = Some(data.clone());
            }
            let content_type = self.header("content-type").unwrap_or_default();
            let parsed = params::parse_body(&content_type, data).await?;
            *self.inner.params.write() = parsed;
            return Ok(());
        }

        if let Some(Value::String(doc)) = self.inner.query.get("_") {
            let parsed: Value = serde_json::from_str(doc)
                .map_err(|e| ApiError::internal(format!("invalid embedded JSON in `_`: {e}")))?;
            *self.inner.params.write() = Some(parsed);
            return Ok(());
        }
        *self.inner.params.write() = Some(Value::Object(self.inner.query.clone()));
        Ok(())
    }

    /// A non-owning handle for response back-links.
    #[must_use]
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // --- Identity ---

    /// The unique request id (uuid, 36 characters).
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The client-provided query id, echoed verbatim in the envelope.
    #[must_use]
    pub fn query_id(&self) -> Option<&str> {
        self.inner.query_id.as_deref()
    }

    // --- Routing ---

    /// The request path, without a leading slash.
    #[must_use]
    pub fn path(&self) -> String {
        self.inner.path.read().clone()
    }

    /// Replace the request path.
    pub fn set_path(&self, path: impl AsRef<str>) {
        *self.inner.path.write() = path.as_ref().trim_start_matches('/').to_owned();
    }

    /// The request verb.
    #[must_use]
    pub fn verb(&self) -> Method {
        self.inner.verb.read().clone()
    }

    /// Replace the request verb.
    pub fn set_verb(&self, verb: Method) {
        *self.inner.verb.write() = verb;
    }

    // --- Parameters ---

    /// The full parameter value, if parameters were provided.
    #[must_use]
    pub fn params(&self) -> Option<Value> {
        self.inner.params.read().clone()
    }

    /// Replace the full parameter value.
    pub fn set_params(&self, params: Value) {
        *self.inner.params.write() = Some(params);
    }

    /// Set one named parameter, creating the parameter map if needed.
    pub fn set_param(&self, name: impl Into<String>, value: Value) {
        let mut guard = self.inner.params.write();
        match guard.as_mut().and_then(Value::as_object_mut) {
            Some(map) => {
                map.insert(name.into(), value);
            }
            None => {
                let mut map = Map::new();
                map.insert(name.into(), value);
                *guard = Some(Value::Object(map));
            }
        }
    }

    /// Look up a parameter by dot-separated path.
    #[must_use]
    pub fn get_param(&self, path: &str) -> Option<Value> {
        let guard = self.inner.params.read();
        params::get_path(guard.as_ref()?, path).cloned()
    }

    /// Typed parameter access through the permissive conversion primitive.
    #[must_use]
    pub fn param<T: serde::de::DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get_param(path).as_ref().and_then(params::convert)
    }

    /// Typed parameter access returning a default on absence or conversion
    /// failure.
    #[must_use]
    pub fn param_or<T: serde::de::DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.param(path).unwrap_or(default)
    }

    /// Look up a raw query-string argument.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<Value> {
        self.inner.query.get(key).cloned()
    }

    // --- Flags and negotiation ---

    /// Whether envelope wrapping is bypassed.
    #[must_use]
    pub fn raw(&self) -> bool {
        self.inner.raw.load(Ordering::Relaxed)
    }

    /// Set the raw flag.
    pub fn set_raw(&self, raw: bool) {
        self.inner.raw.store(raw, Ordering::Relaxed);
    }

    /// Whether structured-text output is indented.
    #[must_use]
    pub fn pretty(&self) -> bool {
        self.inner.pretty.load(Ordering::Relaxed)
    }

    /// The ordered list of accepted media types.
    #[must_use]
    pub fn accept(&self) -> Vec<String> {
        self.inner.accept.read().clone()
    }

    /// Replace the accept list (used after transport upgrades to pin the
    /// negotiated encoding).
    pub fn set_accept(&self, accept: Vec<String>) {
        *self.inner.accept.write() = accept;
    }

    /// The negotiated response encoding.
    #[must_use]
    pub fn media_type(&self) -> MediaType {
        params::select_media_type(&self.inner.accept.read())
    }

    // --- HTTP surface ---

    /// A copy of the full request header map, when the context came from
    /// HTTP.
    #[must_use]
    pub fn headers(&self) -> Option<HeaderMap> {
        self.inner.headers.clone()
    }

    /// Look up a request header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .headers
            .as_ref()?
            .get(name)?
            .to_str()
            .ok()
            .map(ToOwned::to_owned)
    }

    /// The request URI, when the context came from HTTP.
    #[must_use]
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Remove a typed value from the request extensions.
    pub fn take_extension<T: Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.extensions.lock().remove::<T>()
    }

    /// The buffered request body, when one was retained for replay.
    #[must_use]
    pub fn body(&self) -> Option<Bytes> {
        self.inner.body.read().clone()
    }

    /// The domain for this request: `Sec-Original-Host`, then `Host`, then
    /// `_default`, always with the port stripped.
    #[must_use]
    pub fn domain(&self) -> String {
        for header in ["sec-original-host", "host"] {
            if let Some(value) = self.header(header) {
                let host = strip_port(&value);
                if !host.is_empty() {
                    return host.to_owned();
                }
            }
        }
        "_default".to_owned()
    }

    // --- Response decoration ---

    /// Snapshot of the extra-metadata map merged into the envelope.
    #[must_use]
    pub fn extra(&self) -> Map<String, Value> {
        self.inner.extra.read().clone()
    }

    /// Set one extra-metadata entry.
    pub fn set_extra(&self, key: impl Into<String>, value: Value) {
        self.inner.extra.write().insert(key.into(), value);
    }

    /// Look up one extra-metadata entry.
    #[must_use]
    pub fn get_extra(&self, key: &str) -> Option<Value> {
        self.inner.extra.read().get(key).cloned()
    }

    /// The cache-duration hint for HTTP headers.
    #[must_use]
    pub fn cache(&self) -> Option<Duration> {
        *self.inner.cache.read()
    }

    /// Set the cache-duration hint.
    pub fn set_cache(&self, duration: Duration) {
        *self.inner.cache.write() = Some(duration);
    }

    // --- Object cache ---

    /// Attach an object under a type tag.
    pub fn attach_object(&self, tag: impl Into<String>, object: Object) {
        self.inner.objects.write().insert(tag.into(), object);
    }

    /// Look up an attached object, walking to the parent when absent here.
    #[must_use]
    pub fn object(&self, tag: &str) -> Option<Object> {
        if let Some(found) = self.inner.objects.read().get(tag) {
            return Some(Arc::clone(found));
        }
        self.inner.parent.as_ref()?.object(tag)
    }

    /// Typed lookup of an attached object.
    #[must_use]
    pub fn object_as<T: Send + Sync + 'static>(&self, tag: &str) -> Option<Arc<T>> {
        let object: Arc<dyn std::any::Any + Send + Sync> = self.object(tag)?;
        object.downcast::<T>().ok()
    }

    /// The user object, if one was attached.
    #[must_use]
    pub fn user(&self) -> Option<Object> {
        if let Some(user) = self.inner.user.read().as_ref() {
            return Some(Arc::clone(user));
        }
        self.inner.parent.as_ref()?.user()
    }

    /// Typed lookup of the user object. Returns `None` when no user is
    /// attached or the concrete type differs.
    #[must_use]
    pub fn user_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let user: Arc<dyn std::any::Any + Send + Sync> = self.user()?;
        user.downcast::<T>().ok()
    }

    /// Attach the user object.
    pub fn set_user(&self, user: Object) {
        *self.inner.user.write() = Some(user);
    }

    // --- Security flags ---

    /// Whether an outer hook validated CSRF for this request.
    #[must_use]
    pub fn csrf_validated(&self) -> bool {
        self.inner.csrf_validated.load(Ordering::Relaxed)
    }

    /// Mark this request CSRF-validated.
    pub fn set_csrf_validated(&self, validated: bool) {
        self.inner.csrf_validated.store(validated, Ordering::Relaxed);
    }

    /// Whether protected fields should be included in encoded objects.
    #[must_use]
    pub fn show_protected(&self) -> bool {
        self.inner.show_protected.load(Ordering::Relaxed)
    }

    /// Set the protected-field visibility flag.
    pub fn set_show_protected(&self, show: bool) {
        self.inner.show_protected.store(show, Ordering::Relaxed);
    }

    // --- Output channels ---

    /// The response sink for progress and streamed results.
    #[must_use]
    pub fn sink(&self) -> Option<Arc<dyn ResponseSink>> {
        self.inner.sink.read().clone()
    }

    /// Attach a response sink.
    pub fn set_sink(&self, sink: Arc<dyn ResponseSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    // --- Event subscriptions ---

    /// Whether this peer listens for a broadcast topic. `*` always matches;
    /// otherwise the top-most context's subscription set decides, with a
    /// `*` entry acting as a catch-all.
    #[must_use]
    pub fn listens_for(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }
        let top = self.topmost();
        let guard = top.inner.listen.read();
        match guard.as_ref() {
            Some(set) => set
                .get(topic)
                .copied()
                .unwrap_or_else(|| set.get("*").copied().unwrap_or(false)),
            None => false,
        }
    }

    /// Subscribe or unsubscribe the connection from a topic. Mutates the
    /// top-most context; an emptied set returns to the absent
    /// representation.
    pub fn set_listen(&self, topic: impl Into<String>, listen: bool) {
        let top = self.topmost();
        let mut guard = top.inner.listen.write();
        if listen {
            guard
                .get_or_insert_with(HashMap::new)
                .insert(topic.into(), true);
        } else if let Some(set) = guard.as_mut() {
            set.remove(&topic.into());
            if set.is_empty() {
                *guard = None;
            }
        }
    }

    /// Walk to the top-most context in the parent chain.
    #[must_use]
    pub fn topmost(&self) -> Context {
        let mut current = self.clone();
        while let Some(parent) = current.inner.parent.clone() {
            current = parent;
        }
        current
    }

    /// The parent context, if this is a child.
    #[must_use]
    pub fn parent(&self) -> Option<Context> {
        self.inner.parent.clone()
    }

    // --- Lifecycle ---

    /// Seconds elapsed since construction, as a fractional double.
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        self.inner.start.elapsed().as_secs_f64()
    }

    /// The cancellation token for this request; cancelling the parent
    /// (connection teardown) cascades to children.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Cancel this request and all children.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    // --- Value lookup protocol ---

    /// Generic string-keyed lookup for downstream code; unknown keys
    /// forward to the parent.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        match key {
            "request_id" => Some(Value::String(self.inner.request_id.clone())),
            "domain" => Some(Value::String(self.domain())),
            "input_json" => self
                .input_json()
                .map(|raw| Value::String(String::from_utf8_lossy(&raw).into_owned())),
            "user_object" => self.user().map(|u| u.encode(self)),
            _ => self.inner.parent.as_ref()?.value(key),
        }
    }

    /// The request parameters lazily encoded as JSON, cached after the
    /// first call.
    #[must_use]
    pub fn input_json(&self) -> Option<Bytes> {
        self.inner
            .input_json
            .get_or_init(|| {
                let params = self.inner.params.read();
                let value = params.as_ref()?;
                let encoded = serde_json::to_vec(value).ok()?;
                if encoded.is_empty() {
                    None
                } else {
                    Some(Bytes::from(encoded))
                }
            })
            .clone()
    }

    // --- Query scoping ---

    /// The standard pagination window derived from `page_no` and
    /// `results_per_page` parameters.
    #[must_use]
    pub fn pagination(&self, results_per_page: u64) -> Pagination {
        let page = self.param::<i64>("page_no").filter(|p| *p >= 1).unwrap_or(1) as u64;
        let mut per_page = if results_per_page == 0 {
            25
        } else {
            results_per_page
        };
        if let Some(requested) = self.param::<i64>("results_per_page") {
            if requested > 0 && requested <= 100 {
                per_page = requested as u64;
            }
        }
        Pagination {
            page,
            limit: per_page,
            offset: (page - 1) * per_page,
        }
    }
}

/// An offset/limit window for list actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u64,
    /// Rows to skip.
    pub offset: u64,
    /// Rows per page.
    pub limit: u64,
}

/// Strip a port suffix from a host value, tolerating bracketed IPv6.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}
