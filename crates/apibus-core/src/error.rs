//! Error types shared by every transport.
//!
//! An [`ApiError`] carries a human-readable message, an HTTP-style status
//! code, and a stable token that programmatic clients match on. Tokens are
//! part of the wire contract and must never change once published.

use std::fmt;

use http::StatusCode;
use serde_json::Value;

/// Well-known error codes with stable wire tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ApiErrorCode {
    /// No class, id, or method matched the request path.
    NotFound,
    /// Generic forbidden.
    AccessDenied,
    /// Unclassified server fault.
    #[default]
    Internal,
    /// A POST that required CSRF validation did not carry it.
    InsecureRequest,
    /// I'm a teapot.
    Teapot,
    /// Body-bearing request without a `Content-Length` header.
    LengthRequired,
    /// Body exceeds the limit for its media type.
    RequestEntityTooLarge,
    /// The verb is not accepted at the resolved endpoint.
    MethodNotAllowed,
}

impl ApiErrorCode {
    /// Returns the stable wire token for this code.
    #[must_use]
    pub fn token(&self) -> &'static str {
        match self {
            Self::NotFound => "error_not_found",
            Self::AccessDenied => "error_access_denied",
            Self::Internal => "error_internal",
            Self::InsecureRequest => "error_insecure_request",
            Self::Teapot => "error_teapot",
            Self::LengthRequired => "error_length_required",
            Self::RequestEntityTooLarge => "error_request_entity_too_large",
            Self::MethodNotAllowed => "error_method_not_allowed",
        }
    }

    /// Returns the default HTTP status code for this error.
    #[must_use]
    pub fn default_status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InsecureRequest => StatusCode::BAD_REQUEST,
            Self::Teapot => StatusCode::IM_A_TEAPOT,
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::RequestEntityTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// An error produced anywhere in the request lifecycle.
///
/// The numeric status follows HTTP conventions but is set by the creator;
/// the token is the contract for clients.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    /// The error code providing the default token and status.
    pub code: ApiErrorCode,
    /// Human-readable message.
    pub message: String,
    /// HTTP status reported in the envelope and on the HTTP transport.
    pub status: StatusCode,
    /// Wire token; defaults to the code's token but may be customized.
    pub token: String,
    /// Optional structured error detail forwarded to the client.
    pub info: Option<Value>,
    /// The underlying cause, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ApiError {
    /// Create an error from a code, using the token as the message.
    #[must_use]
    pub fn new(code: ApiErrorCode) -> Self {
        Self::with_message(code, code.token())
    }

    /// Create an error from a code with a custom message.
    #[must_use]
    pub fn with_message(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.default_status(),
            token: code.token().to_owned(),
            message: message.into(),
            code,
            info: None,
            source: None,
        }
    }

    /// Create an error with a free-form token and status.
    ///
    /// Used for application-defined failure modes that still need a stable
    /// token; the code is recorded as [`ApiErrorCode::Internal`].
    #[must_use]
    pub fn custom(status: StatusCode, token: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: ApiErrorCode::Internal,
            message: message.into(),
            status,
            token: token.into(),
            info: None,
            source: None,
        }
    }

    /// Attach structured error detail.
    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    /// Override the HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // -- Convenience constructors --

    /// No class/id/method matched.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(ApiErrorCode::NotFound)
    }

    /// Generic forbidden.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::with_message(ApiErrorCode::AccessDenied, message)
    }

    /// Unclassified server fault.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_message(ApiErrorCode::Internal, message)
    }

    /// Refuse to brew coffee.
    #[must_use]
    pub fn teapot() -> Self {
        Self::new(ApiErrorCode::Teapot)
    }

    /// Missing CSRF validation on a request that requires it.
    #[must_use]
    pub fn insecure_request() -> Self {
        Self::with_message(
            ApiErrorCode::InsecureRequest,
            "request requires CSRF validation",
        )
    }

    /// Missing `Content-Length` header.
    #[must_use]
    pub fn length_required() -> Self {
        Self::with_message(ApiErrorCode::LengthRequired, "Content-Length is required")
    }

    /// Body exceeds the media-type limit.
    #[must_use]
    pub fn entity_too_large(limit: u64) -> Self {
        Self::with_message(
            ApiErrorCode::RequestEntityTooLarge,
            format!("request body exceeds {limit} byte limit"),
        )
    }

    /// Verb not accepted at this endpoint.
    #[must_use]
    pub fn method_not_allowed(verb: &str) -> Self {
        Self::with_message(
            ApiErrorCode::MethodNotAllowed,
            format!("method {verb} is not allowed on this endpoint"),
        )
    }
}

/// Convenience result type for framework operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Create an [`ApiError`] from an error code.
///
/// # Examples
///
/// ```
/// use apibus_core::api_error;
/// use apibus_core::error::ApiErrorCode;
///
/// let err = api_error!(NotFound);
/// assert_eq!(err.token, "error_not_found");
///
/// let err = api_error!(AccessDenied, "no such session");
/// assert_eq!(err.message, "no such session");
/// ```
#[macro_export]
macro_rules! api_error {
    ($code:ident) => {
        $crate::error::ApiError::new($crate::error::ApiErrorCode::$code)
    };
    ($code:ident, $msg:expr) => {
        $crate::error::ApiError::with_message($crate::error::ApiErrorCode::$code, $msg)
    };
}
