//! WebSocket response sink.
//!
//! All writers on one connection (frame responses, progress, broadcast)
//! share the mutex-guarded write half, so progress messages for a request
//! always precede its terminal envelope.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use hyper_util::rt::TokioIo;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use apibus_core::error::{ApiError, ApiResult};
use apibus_core::params::MediaType;
use apibus_core::response::Response;
use apibus_core::sink::{ResponseSink, SinkFuture};

/// The server side of one upgraded connection.
pub(crate) type WsStream = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

/// The shared, serialized write half.
pub(crate) type SharedWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// A sink writing envelopes as WebSocket frames, text or binary per the
/// negotiated media type.
pub struct WsSink {
    writer: SharedWriter,
    media_type: MediaType,
}

impl WsSink {
    pub(crate) fn new(writer: SharedWriter, media_type: MediaType) -> Self {
        Self { writer, media_type }
    }

    /// Write one pre-encoded payload as a frame of the negotiated type.
    pub(crate) async fn send_bytes(&self, bytes: bytes::Bytes) -> ApiResult<()> {
        let message = frame_for(self.media_type, bytes);
        self.writer
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| ApiError::internal(format!("websocket write failed: {e}")))
    }
}

/// Wrap encoded bytes in the frame type matching the encoding.
pub(crate) fn frame_for(media_type: MediaType, bytes: bytes::Bytes) -> Message {
    match media_type {
        MediaType::Json => Message::Text(String::from_utf8_lossy(&bytes).into_owned()),
        MediaType::Cbor => Message::Binary(bytes.to_vec()),
    }
}

impl ResponseSink for WsSink {
    fn send_response<'a>(&'a self, resp: &'a Response) -> SinkFuture<'a> {
        Box::pin(async move {
            let bytes = resp.encode_envelope(self.media_type, false)?;
            self.send_bytes(bytes).await
        })
    }
}
