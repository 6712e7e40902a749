//! Envelope-to-HTTP serving.
//!
//! Every HTTP response carries the standard cache and CORS headers, then
//! one of four shapes: a 204 `OPTIONS` advertisement, a raw-mode payload,
//! a protocol upgrade, or the encoded envelope with the negotiated
//! `Content-Type`.

use std::time::Duration;

use http::{header, StatusCode};
use serde_json::Value;
use tracing::{error, warn};

use apibus_core::context::Context;
use apibus_core::engine::Engine;
use apibus_core::params::MediaType;
use apibus_core::response::{encode_value, Payload, Response, ResponseKind};

use crate::body::ApiResponseBody;

/// Serve one pipeline response over HTTP.
pub async fn serve(
    engine: &Engine,
    ctx: &Context,
    mut resp: Response,
) -> http::Response<ApiResponseBody> {
    if resp.kind() == ResponseKind::Upgrade {
        return match apibus_ws::accept_upgrade(engine, ctx) {
            Ok(upgrade) => {
                let mut builder = http::Response::builder().status(upgrade.status);
                for (name, value) in &upgrade.headers {
                    builder = builder.header(name.clone(), value.clone());
                }
                finish(builder, ApiResponseBody::empty())
            }
            Err(e) => {
                warn!(error = %e, "websocket upgrade rejected");
                serve_enveloped(ctx, &Response::from_error(ctx, &e), base_headers(ctx))
            }
        };
    }

    let builder = base_headers(ctx);

    if let Some(methods) = resp.allow_methods() {
        let list = methods
            .iter()
            .map(http::Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let builder = builder
            .status(resp.status())
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Authorization, Content-Type")
            .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, list);
        return finish(builder, ApiResponseBody::empty());
    }

    if ctx.raw() {
        return serve_raw(ctx, &mut resp, builder).await;
    }
    serve_enveloped(ctx, &resp, builder)
}

/// The cache and CORS headers present on every response.
fn base_headers(ctx: &Context) -> http::response::Builder {
    let mut builder = http::Response::builder();

    match ctx.cache() {
        Some(duration) if duration > Duration::ZERO => {
            let secs = duration.as_secs();
            builder = builder
                .header(header::CACHE_CONTROL, format!("public,max-age={secs}"))
                .header(
                    header::EXPIRES,
                    http_date(chrono::Utc::now() + chrono::Duration::seconds(secs as i64)),
                )
                .header("X-Accel-Expires", secs);
        }
        _ => {
            builder = builder
                .header(
                    header::CACHE_CONTROL,
                    "no-store, no-cache, must-revalidate, max-age=0",
                )
                .header(
                    header::EXPIRES,
                    http_date(chrono::Utc::now() - chrono::Duration::days(365)),
                );
        }
    }

    builder = builder.header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    match ctx.header("origin") {
        Some(origin) if !origin.is_empty() => {
            builder = builder
                .header(header::VARY, "Accept-Encoding,Origin")
                .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        _ => {
            builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        }
    }
    builder
}

/// Format a timestamp as an HTTP date.
fn http_date(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serve the envelope with the negotiated encoding.
fn serve_enveloped(
    ctx: &Context,
    resp: &Response,
    builder: http::response::Builder,
) -> http::Response<ApiResponseBody> {
    let media_type = ctx.media_type();
    let content_type = match media_type {
        MediaType::Json => "application/json; charset=utf-8",
        MediaType::Cbor => "application/cbor",
    };
    let builder = builder
        .status(resp.status())
        .header(header::CONTENT_TYPE, content_type);

    match resp.encode_envelope(media_type, ctx.pretty()) {
        Ok(bytes) => finish(builder, ApiResponseBody::from_bytes(bytes)),
        Err(e) => {
            error!(error = %e, "failed to encode response envelope");
            finish(
                http::Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR),
                ApiResponseBody::empty(),
            )
        }
    }
}

/// Serve a raw-mode response: the payload bypasses the envelope entirely.
async fn serve_raw(
    ctx: &Context,
    resp: &mut Response,
    builder: http::response::Builder,
) -> http::Response<ApiResponseBody> {
    if resp.kind() == ResponseKind::Error {
        let builder = builder
            .status(resp.status())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
        let message = resp.error().unwrap_or_default().to_owned();
        return finish(builder, ApiResponseBody::from_string(message));
    }

    if resp.kind() == ResponseKind::Redirect {
        let status = resp
            .redirect_code()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::FOUND);
        let mut builder = builder.status(status);
        if let Some(url) = resp.redirect_url() {
            builder = builder.header(header::LOCATION, url);
        }
        return finish(builder, ApiResponseBody::empty());
    }

    let mime = ctx.get_extra("mime").and_then(|v| match v {
        Value::String(s) => Some(s),
        _ => None,
    });

    match resp.take_payload() {
        Payload::Value(Value::String(text)) => {
            let builder = with_mime(builder, mime);
            finish(builder, ApiResponseBody::from_string(text))
        }
        Payload::Bytes(bytes) => {
            let builder = with_mime(builder, mime);
            finish(builder, ApiResponseBody::from_bytes(bytes))
        }
        Payload::Reader(mut reader) => {
            let builder = with_mime(builder, mime);
            let mut buffered = Vec::new();
            match tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffered).await {
                Ok(_) => finish(builder, ApiResponseBody::from_bytes(buffered)),
                Err(e) => finish(
                    http::Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    ApiResponseBody::from_string(e.to_string()),
                ),
            }
        }
        Payload::None => finish(builder, ApiResponseBody::empty()),
        Payload::Value(other) => {
            let builder = builder.header(header::CONTENT_TYPE, "application/json; charset=utf-8");
            match encode_value(&other, MediaType::Json, ctx.pretty()) {
                Ok(bytes) => finish(builder, ApiResponseBody::from_bytes(bytes)),
                Err(e) => finish(
                    http::Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    ApiResponseBody::from_string(e.to_string()),
                ),
            }
        }
    }
}

/// Apply a `mime` extra as the content type, when present.
fn with_mime(builder: http::response::Builder, mime: Option<String>) -> http::response::Builder {
    match mime {
        Some(mime) => builder.header(header::CONTENT_TYPE, mime),
        None => builder,
    }
}

/// Build the response, falling back to a bare 500 if header values were
/// invalid.
fn finish(
    builder: http::response::Builder,
    body: ApiResponseBody,
) -> http::Response<ApiResponseBody> {
    builder.body(body).unwrap_or_else(|_| {
        http::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(ApiResponseBody::empty())
            .expect("static response should be valid")
    })
}
