//! The transport-neutral response envelope.
//!
//! Every request, on every transport, resolves to a [`Response`]. The
//! envelope it assembles is a flat map with a fixed overlay order: the
//! context's extra metadata first, then the framework-owned fields, so
//! decorations can never shadow `result`, `time`, or `request_id`.

use bytes::Bytes;
use http::{Method, StatusCode};
use serde_json::{Map, Value};

use crate::context::{Context, WeakContext};
use crate::error::{ApiError, ApiResult};
use crate::params::MediaType;

/// The response category reported in the `result` envelope field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// The request produced a value.
    Success,
    /// The request failed.
    Error,
    /// The client should retry elsewhere.
    Redirect,
    /// An intermediate message; the terminal response is still pending.
    Progress,
    /// The connection is being handed to a long-lived transport.
    Upgrade,
}

impl ResponseKind {
    /// The wire value of the `result` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Redirect => "redirect",
            Self::Progress => "progress",
            Self::Upgrade => "upgrade",
        }
    }
}

/// The data carried by a response.
///
/// Values go through the envelope; bytes and readers exist for raw mode,
/// where the payload is written to the transport verbatim.
pub enum Payload {
    /// No payload.
    None,
    /// A structured value.
    Value(Value),
    /// Verbatim bytes.
    Bytes(Bytes),
    /// A stream copied to the transport until EOF, then closed.
    Reader(Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("Payload::None"),
            Self::Value(v) => write!(f, "Payload::Value({v})"),
            Self::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Self::Reader(_) => f.write_str("Payload::Reader"),
        }
    }
}

impl Payload {
    /// The payload rendered as an envelope value. Bytes become base64 per
    /// structured-text convention; readers cannot appear in envelopes.
    fn as_envelope_value(&self) -> Value {
        use base64::Engine as _;
        match self {
            Self::None | Self::Reader(_) => Value::Null,
            Self::Value(v) => v.clone(),
            Self::Bytes(b) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }
}

/// One response travelling toward a transport sink.
pub struct Response {
    kind: ResponseKind,
    time: f64,
    payload: Payload,
    error: Option<String>,
    status: StatusCode,
    token: Option<String>,
    error_info: Option<Value>,
    debug: Option<String>,
    redirect_url: Option<String>,
    redirect_code: Option<u16>,
    allow_methods: Option<Vec<Method>>,
    ctx: WeakContext,
}

impl Response {
    fn base(ctx: &Context, kind: ResponseKind, status: StatusCode) -> Self {
        Self {
            kind,
            time: ctx.elapsed(),
            payload: Payload::None,
            error: None,
            status,
            token: None,
            error_info: None,
            debug: None,
            redirect_url: None,
            redirect_code: None,
            allow_methods: None,
            ctx: ctx.downgrade(),
        }
    }

    /// A success response carrying the given payload.
    #[must_use]
    pub fn success(ctx: &Context, payload: Payload) -> Self {
        let mut resp = Self::base(ctx, ResponseKind::Success, StatusCode::OK);
        resp.payload = payload;
        resp
    }

    /// An error response built from an [`ApiError`].
    #[must_use]
    pub fn from_error(ctx: &Context, err: &ApiError) -> Self {
        let mut resp = Self::base(ctx, ResponseKind::Error, err.status);
        resp.error = Some(err.message.clone());
        resp.token = Some(err.token.clone());
        resp.error_info = err.info.clone();
        resp
    }

    /// An error response for a captured panic; the debug field carries the
    /// stack.
    #[must_use]
    pub fn from_panic(ctx: &Context, message: &str, stack: String) -> Self {
        let mut resp = Self::base(ctx, ResponseKind::Error, StatusCode::INTERNAL_SERVER_ERROR);
        resp.error = Some(format!("panic: {message}"));
        resp.token = Some("error_internal".to_owned());
        resp.debug = Some(stack);
        resp
    }

    /// A redirect response. This is the one way to produce the `redirect`
    /// envelope kind.
    #[must_use]
    pub fn redirect(ctx: &Context, url: impl Into<String>, code: u16) -> Self {
        let mut resp = Self::base(ctx, ResponseKind::Redirect, StatusCode::OK);
        resp.redirect_url = Some(url.into());
        resp.redirect_code = Some(code);
        resp
    }

    /// A progress message; never the terminal response for a request.
    #[must_use]
    pub fn progress(ctx: &Context, data: Value) -> Self {
        let mut resp = Self::base(ctx, ResponseKind::Progress, StatusCode::OK);
        resp.payload = Payload::Value(data);
        resp
    }

    /// The upgrade pseudo-response handing control to a long-lived
    /// transport.
    #[must_use]
    pub fn upgrade(ctx: &Context) -> Self {
        Self::base(ctx, ResponseKind::Upgrade, StatusCode::SWITCHING_PROTOCOLS)
    }

    /// The synthetic `OPTIONS` response advertising the verbs the
    /// dispatcher accepts at this endpoint.
    #[must_use]
    pub fn options(ctx: &Context, methods: &[Method]) -> Self {
        let mut resp = Self::base(ctx, ResponseKind::Success, StatusCode::NO_CONTENT);
        resp.allow_methods = Some(methods.to_vec());
        resp
    }

    /// The response kind.
    #[must_use]
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// The HTTP status this response maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Take the payload out, leaving none behind. Used by raw-mode serving
    /// to consume readers.
    pub fn take_payload(&mut self) -> Payload {
        std::mem::replace(&mut self.payload, Payload::None)
    }

    /// The error message, when this is an error response.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The stable error token, when present.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// The redirect target, when this is a redirect.
    #[must_use]
    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect_url.as_deref()
    }

    /// The redirect status code, when this is a redirect.
    #[must_use]
    pub fn redirect_code(&self) -> Option<u16> {
        self.redirect_code
    }

    /// The advertised allow-list, when this is a synthetic `OPTIONS`
    /// response.
    #[must_use]
    pub fn allow_methods(&self) -> Option<&[Method]> {
        self.allow_methods.as_deref()
    }

    /// The originating context, if still alive.
    #[must_use]
    pub fn context(&self) -> Option<Context> {
        self.ctx.upgrade()
    }

    /// Re-read the elapsed time from the context, for responses built
    /// earlier in the pipeline.
    pub fn refresh_time(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            self.time = ctx.elapsed();
        }
    }

    /// Assemble the envelope map.
    ///
    /// Overlay order: context extras first, then `result`, `error`+`code`,
    /// `time`, `data`, `request_id`, `redirect_url`+`redirect_code`,
    /// `token`, `error_info`, `query_id`. Framework fields therefore win
    /// over extras of the same name.
    #[must_use]
    pub fn envelope(&self) -> Map<String, Value> {
        let ctx = self.ctx.upgrade();

        let mut map = ctx.as_ref().map(Context::extra).unwrap_or_default();
        map.insert(
            "result".to_owned(),
            Value::String(self.kind.as_str().to_owned()),
        );
        if let Some(error) = &self.error {
            map.insert("error".to_owned(), Value::String(error.clone()));
            map.insert("code".to_owned(), Value::from(self.status.as_u16()));
        }
        map.insert("time".to_owned(), Value::from(self.time));
        map.insert("data".to_owned(), self.payload.as_envelope_value());
        if let Some(ctx) = &ctx {
            map.insert(
                "request_id".to_owned(),
                Value::String(ctx.request_id().to_owned()),
            );
        }
        if let Some(url) = &self.redirect_url {
            map.insert("redirect_url".to_owned(), Value::String(url.clone()));
            if let Some(code) = self.redirect_code {
                map.insert("redirect_code".to_owned(), Value::from(code));
            }
        }
        if let Some(token) = &self.token {
            map.insert("token".to_owned(), Value::String(token.clone()));
        }
        if let Some(info) = &self.error_info {
            map.insert("error_info".to_owned(), info.clone());
        }
        if let Some(debug) = &self.debug {
            map.insert("debug".to_owned(), Value::String(debug.clone()));
        }
        if let Some(query_id) = ctx.as_ref().and_then(|c| c.query_id().map(ToOwned::to_owned)) {
            map.insert("query_id".to_owned(), Value::String(query_id));
        }
        map
    }

    /// Encode the envelope in the given media type. JSON honors the pretty
    /// flag with four-space indentation; the binary encoding's map keys are
    /// deterministic because the envelope map is ordered.
    pub fn encode_envelope(&self, media_type: MediaType, pretty: bool) -> ApiResult<Bytes> {
        encode_value(&Value::Object(self.envelope()), media_type, pretty)
    }
}

/// Encode any value in the given media type.
pub fn encode_value(value: &Value, media_type: MediaType, pretty: bool) -> ApiResult<Bytes> {
    match media_type {
        MediaType::Json => {
            let encoded = if pretty {
                let mut buf = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
                let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
                serde::Serialize::serialize(value, &mut ser)
                    .map_err(|e| ApiError::internal(format!("cannot encode response: {e}")))?;
                buf
            } else {
                serde_json::to_vec(value)
                    .map_err(|e| ApiError::internal(format!("cannot encode response: {e}")))?
            };
            Ok(Bytes::from(encoded))
        }
        MediaType::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)
                .map_err(|e| ApiError::internal(format!("cannot encode response: {e}")))?;
            Ok(Bytes::from(buf))
        }
    }
}
