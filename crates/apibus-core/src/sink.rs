//! Response sinks: where one response gets written.
//!
//! A sink accepts a [`Response`] and pushes it to a transport. Long-lived
//! transports attach a sink to the context so progress messages and the
//! terminal envelope travel through the same serialized writer, which is
//! what guarantees their relative order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ApiResult;
use crate::response::Response;

/// Future type returned by sink operations.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = ApiResult<()>> + Send + 'a>>;

/// Accepts one response and writes it to a transport.
pub trait ResponseSink: Send + Sync {
    /// Serialize and write the response envelope.
    fn send_response<'a>(&'a self, resp: &'a Response) -> SinkFuture<'a>;
}

/// Accepts an arbitrary value and writes it to a transport; used by the
/// stream-socket broadcast fan-out, which carries pre-formed payloads
/// rather than envelopes.
pub trait RawSink: Send + Sync {
    /// Serialize and write the value.
    fn send_value<'a>(&'a self, value: &'a Value) -> SinkFuture<'a>;
}

/// A streaming encoder in the `encode(obj) -> result` shape.
pub trait Encoder: Send + Sync {
    /// Encode one value onto the underlying stream.
    fn encode(&self, value: &Value) -> ApiResult<()>;
}

struct EncoderSink<E>(E);

impl<E: Encoder> ResponseSink for EncoderSink<E> {
    fn send_response<'a>(&'a self, resp: &'a Response) -> SinkFuture<'a> {
        let result = self.0.encode(&Value::Object(resp.envelope()));
        Box::pin(async move { result })
    }
}

/// Wrap any [`Encoder`] as a [`ResponseSink`].
pub fn encoder_sink<E: Encoder + 'static>(encoder: E) -> Arc<dyn ResponseSink> {
    Arc::new(EncoderSink(encoder))
}
