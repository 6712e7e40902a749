//! Request parameter parsing and access.
//!
//! This module owns the heterogeneous-input side of the request lifecycle:
//!
//! - Query strings are parsed with PHP-style bracket semantics (`a[b][c]`
//!   builds nested maps, `a[]` builds ordered sequences).
//! - Bodies are decoded per media type under hard size limits, with the
//!   `_` field acting as an embedded-JSON override for form payloads.
//! - A single permissive conversion primitive backs every typed accessor,
//!   so numeric widening and unambiguous string↔number coercion behave the
//!   same everywhere.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{ApiError, ApiResult};

/// Maximum body size for `application/json` requests.
pub const JSON_BODY_LIMIT: u64 = 10 << 20;
/// Maximum body size for `application/cbor` requests.
pub const CBOR_BODY_LIMIT: u64 = 10 << 20;
/// Maximum body size for `application/x-www-form-urlencoded` requests.
pub const FORM_BODY_LIMIT: u64 = 1 << 20;
/// Maximum body size for `multipart/form-data` requests.
pub const MULTIPART_BODY_LIMIT: u64 = 256 << 20;

/// Bodies up to this size are retained on the context for replay.
pub const REPLAY_BODY_LIMIT: u64 = 10 << 20;

/// The media types a response can be encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Structured text.
    Json,
    /// Compact binary.
    Cbor,
}

impl MediaType {
    /// Returns the canonical media-type string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Cbor => "application/cbor",
        }
    }
}

/// Strip parameters from a `Content-Type` value, yielding the bare type.
#[must_use]
pub fn content_type_essence(header: &str) -> &str {
    header.split(';').next().unwrap_or(header).trim()
}

/// Return the body size limit for a request media type, or `None` when the
/// type is not accepted as request input.
#[must_use]
pub fn body_limit(media_type: &str) -> Option<u64> {
    match media_type {
        "application/json" => Some(JSON_BODY_LIMIT),
        "application/cbor" => Some(CBOR_BODY_LIMIT),
        "application/x-www-form-urlencoded" => Some(FORM_BODY_LIMIT),
        "multipart/form-data" => Some(MULTIPART_BODY_LIMIT),
        _ => None,
    }
}

/// Parse an `Accept` header into an ordered list of media-type patterns.
///
/// Entries are split on commas and stripped of `;`-parameters; order is
/// preserved because negotiation picks the first acceptable entry.
#[must_use]
pub fn parse_accept(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(|entry| content_type_essence(entry).to_owned())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Shell-style pattern match supporting `*` and `?`.
#[must_use]
pub fn media_type_matches(pattern: &str, value: &str) -> bool {
    fn matches(p: &[u8], v: &[u8]) -> bool {
        match p.first() {
            None => v.is_empty(),
            Some(b'*') => matches(&p[1..], v) || (!v.is_empty() && matches(p, &v[1..])),
            Some(b'?') => !v.is_empty() && matches(&p[1..], &v[1..]),
            Some(c) => v.first() == Some(c) && matches(&p[1..], &v[1..]),
        }
    }
    matches(pattern.as_bytes(), value.as_bytes())
}

/// Pick the response encoding: the first accept entry matching a supported
/// media type wins; the default is JSON.
#[must_use]
pub fn select_media_type(accept: &[String]) -> MediaType {
    for pattern in accept {
        for media_type in [MediaType::Json, MediaType::Cbor] {
            if media_type_matches(pattern, media_type.as_str()) {
                return media_type;
            }
        }
    }
    MediaType::Json
}

/// Parse a query string with PHP-style bracket semantics.
///
/// `a[b][c]=1` constructs nested maps, `a[]=1&a[]=2` an ordered sequence,
/// and a bare repeated `a=1&a=2` keeps the last value.
#[must_use]
pub fn parse_php_query(query: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let (root, segments) = split_bracket_key(&key);
        if root.is_empty() {
            continue;
        }
        let slot = out.entry(root).or_insert(Value::Null);
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        insert_at(slot, &refs, Value::String(value.into_owned()));
    }
    out
}

/// Split `a[b][c]` into the root key and its bracket segments.
///
/// A key whose brackets are unbalanced is treated as a literal flat key.
fn split_bracket_key(key: &str) -> (String, Vec<String>) {
    let Some(open) = key.find('[') else {
        return (key.to_owned(), Vec::new());
    };

    let root = key[..open].to_owned();
    let mut segments = Vec::new();
    let mut rest = &key[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            return (key.to_owned(), Vec::new());
        };
        segments.push(stripped[..close].to_owned());
        rest = &stripped[close + 1..];
    }
    if !rest.is_empty() {
        return (key.to_owned(), Vec::new());
    }
    (root, segments)
}

/// Insert a value at a bracket path, creating maps and sequences on demand.
fn insert_at(slot: &mut Value, segments: &[&str], value: Value) {
    let Some((segment, rest)) = segments.split_first() else {
        *slot = value;
        return;
    };

    if segment.is_empty() {
        // `[]` appends to a sequence.
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(items) = slot {
            items.push(Value::Null);
            if let Some(last) = items.last_mut() {
                insert_at(last, rest, value);
            }
        }
        return;
    }

    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        let child = map.entry((*segment).to_owned()).or_insert(Value::Null);
        insert_at(child, rest, value);
    }
}

/// Walk nested maps by a dot-separated path. An empty path returns the
/// whole value.
#[must_use]
pub fn get_path<'a>(params: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(params);
    }
    let mut current = params;
    for key in path.split('.') {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// The centralized permissive conversion primitive.
///
/// Tries a direct deserialization first, then falls back to unambiguous
/// coercions: strings parsing as numbers or booleans, and numbers or
/// booleans rendered as strings. Map-to-struct assignment by field name is
/// what direct deserialization already provides.
#[must_use]
pub fn convert<T: DeserializeOwned>(value: &Value) -> Option<T> {
    if let Ok(converted) = serde_json::from_value(value.clone()) {
        return Some(converted);
    }

    match value {
        Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                if let Ok(converted) = serde_json::from_value(Value::from(i)) {
                    return Some(converted);
                }
            }
            if let Ok(f) = s.parse::<f64>() {
                if let Ok(converted) = serde_json::from_value(Value::from(f)) {
                    return Some(converted);
                }
            }
            if let Ok(b) = s.parse::<bool>() {
                if let Ok(converted) = serde_json::from_value(Value::Bool(b)) {
                    return Some(converted);
                }
            }
            None
        }
        Value::Number(n) => serde_json::from_value(Value::String(n.to_string())).ok(),
        Value::Bool(b) => serde_json::from_value(Value::String(b.to_string())).ok(),
        _ => None,
    }
}

/// Decode a request body into parameters according to its `Content-Type`.
///
/// Returns `Ok(None)` for media types that are not accepted as input (the
/// request proceeds without parameters). Size limits are the caller's
/// responsibility and must be enforced before the body is materialized.
pub async fn parse_body(content_type: &str, data: Bytes) -> ApiResult<Option<Value>> {
    match content_type_essence(content_type) {
        "application/json" => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| ApiError::internal(format!("invalid JSON body: {e}"))),
        "application/cbor" => ciborium::from_reader(data.as_ref())
            .map(Some)
            .map_err(|e| ApiError::internal(format!("invalid CBOR body: {e}"))),
        "application/x-www-form-urlencoded" => {
            let text = String::from_utf8_lossy(&data);
            let map = parse_php_query(&text);
            apply_embedded_json(map).map(Some)
        }
        "multipart/form-data" => parse_multipart(content_type, data).await.map(Some),
        _ => Ok(None),
    }
}

/// A field named `_` containing a string is an embedded JSON document that
/// replaces every other parsed parameter.
fn apply_embedded_json(map: Map<String, Value>) -> ApiResult<Value> {
    if let Some(Value::String(doc)) = map.get("_") {
        return serde_json::from_str(doc)
            .map_err(|e| ApiError::internal(format!("invalid embedded JSON in `_`: {e}")));
    }
    Ok(Value::Object(map))
}

/// Parse a buffered multipart body. File parts become
/// `{"filename": ..., "data": <base64>}`; plain parts become strings.
async fn parse_multipart(content_type: &str, data: Bytes) -> ApiResult<Value> {
    use base64::Engine as _;

    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| ApiError::internal(format!("invalid multipart boundary: {e}")))?;
    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(data) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut map = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::internal(format!("invalid multipart body: {e}")))?
    {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };
        let filename = field.file_name().map(ToOwned::to_owned);
        let content = field
            .bytes()
            .await
            .map_err(|e| ApiError::internal(format!("invalid multipart part: {e}")))?;

        match filename {
            None => {
                map.insert(
                    name,
                    Value::String(String::from_utf8_lossy(&content).into_owned()),
                );
            }
            Some(filename) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
                map.insert(
                    name,
                    serde_json::json!({"filename": filename, "data": encoded}),
                );
            }
        }
    }
    apply_embedded_json(map)
}
