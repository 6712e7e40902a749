//! Request-body collection under media-type size limits.
//!
//! Limits are enforced before any structured decoding happens: the
//! `Content-Length` header is validated first, and collection itself is
//! capped one byte above the limit, so an oversize body never allocates
//! memory proportional to its structured content.

use bytes::Bytes;
use http::Method;
use http_body_util::BodyExt;

use apibus_core::error::{ApiError, ApiResult};
use apibus_core::params;

/// Collect the request body for body-bearing verbs.
///
/// Returns `Ok(None)` for non-body verbs, empty bodies, and unsupported
/// media types (whose bodies are dropped unread).
///
/// # Errors
///
/// `error_length_required` when `Content-Length` is missing on a
/// body-bearing verb; `error_request_entity_too_large` when the declared
/// or actual size exceeds the media-type limit.
pub async fn collect_body<B>(
    parts: &http::request::Parts,
    body: B,
) -> ApiResult<Option<Bytes>>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if !matches!(parts.method, Method::POST | Method::PATCH | Method::PUT) {
        return Ok(None);
    }

    let declared = parts
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let Some(length) = declared else {
        return Err(ApiError::length_required());
    };
    if length == 0 {
        return Ok(None);
    }

    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(limit) = params::body_limit(params::content_type_essence(content_type)) else {
        return Ok(None);
    };
    if length > limit {
        return Err(ApiError::entity_too_large(limit));
    }

    let capped = http_body_util::Limited::new(body, usize::try_from(limit + 1).unwrap_or(usize::MAX));
    let collected = capped.collect().await.map_err(|e| {
        if e.is::<http_body_util::LengthLimitError>() {
            ApiError::entity_too_large(limit)
        } else {
            ApiError::internal(format!("failed to read request body: {e}"))
        }
    })?;
    let bytes = collected.to_bytes();
    if bytes.len() as u64 > limit {
        return Err(ApiError::entity_too_large(limit));
    }
    Ok(Some(bytes))
}
