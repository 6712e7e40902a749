//! Request helpers: reverse-proxy awareness and request forwarding.

use bytes::Bytes;
use http::request::Parts;
use http::Method;

use apibus_core::context::Context;
use apibus_core::error::{ApiError, ApiResult};

/// The domain for a request: `Sec-Original-Host` first (proxy scenarios),
/// then `Host`, with any port stripped. Falls back to `_default`.
#[must_use]
pub fn get_domain_for_request(parts: &Parts) -> String {
    for name in ["sec-original-host", "host"] {
        if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
            let host = strip_port(value);
            if !host.is_empty() {
                return host.to_owned();
            }
        }
    }
    "_default".to_owned()
}

/// The externally visible URL root for a request.
///
/// Combines the request scheme, the resolved domain, and the
/// `Sec-Access-Prefix` header a fronting proxy sets when the service is
/// mounted below a path.
#[must_use]
pub fn get_prefix_for_request(parts: &Parts) -> String {
    let scheme = parts
        .uri
        .scheme_str()
        .unwrap_or("http")
        .to_owned();
    let domain = get_domain_for_request(parts);

    let path = match parts
        .headers
        .get("sec-access-prefix")
        .and_then(|v| v.to_str().ok())
    {
        Some(prefix) if !prefix.is_empty() => {
            if prefix.starts_with('/') {
                prefix.to_owned()
            } else {
                format!("/{prefix}")
            }
        }
        _ => "/".to_owned(),
    };

    format!("{scheme}://{domain}{path}")
}

/// Rebuild an outgoing request for a context, e.g. for forwarding to
/// another node.
///
/// Parameters travel as a JSON body on body-bearing verbs and as a
/// `_`-encoded query argument otherwise. Headers from the original
/// request are carried over.
///
/// # Errors
///
/// Fails when the parameters cannot be encoded or the target produces an
/// invalid URI.
pub fn build_forward_request(ctx: &Context, target: &str) -> ApiResult<http::Request<Bytes>> {
    let verb = ctx.verb();
    let mut uri = format!("{}/{}", target.trim_end_matches('/'), ctx.path());
    let mut body = Bytes::new();
    let mut json_body = false;

    if let Some(params) = ctx.params() {
        let encoded = serde_json::to_vec(&params)
            .map_err(|e| ApiError::internal(format!("cannot encode parameters: {e}")))?;
        if matches!(verb, Method::POST | Method::PATCH | Method::PUT) {
            body = Bytes::from(encoded);
            json_body = true;
        } else {
            let escaped: String =
                form_urlencoded::byte_serialize(&encoded).collect();
            uri.push_str("?_=");
            uri.push_str(&escaped);
        }
    }

    let mut builder = http::Request::builder().method(verb).uri(uri);

    // Carry the original request headers, then the forwarding overrides.
    if let Some(headers) = builder.headers_mut() {
        if let Some(original) = ctx.headers() {
            *headers = original;
        }
        if json_body {
            headers.insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json; charset=utf-8"),
            );
        }
    }

    builder
        .body(body)
        .map_err(|e| ApiError::internal(format!("cannot build forwarded request: {e}")))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}
