//! HTTP front-end for the apibus dispatch core.
//!
//! Adapts hyper requests to the transport-neutral pipeline: body
//! collection under media-type limits, context construction, envelope
//! serving with content negotiation, CORS and cache headers, raw mode,
//! `OPTIONS` allow-lists, and the hand-off to the WebSocket front-end on
//! upgrade responses.

pub mod body;
pub mod helper;
pub mod limits;
pub mod serve;
pub mod service;

pub use body::ApiResponseBody;
pub use helper::{build_forward_request, get_domain_for_request, get_prefix_for_request};
pub use limits::collect_body;
pub use serve::serve;
pub use service::{handle_request, ApiService};
