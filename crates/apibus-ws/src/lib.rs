//! WebSocket front-end for the apibus dispatch core.
//!
//! When the dispatcher returns an upgrade pseudo-response, the HTTP
//! front-end calls [`accept_upgrade`]: the handshake is validated (origin
//! checking is relaxed only for CSRF-validated requests), the response
//! encoding is pinned from the pre-upgrade accept list, and the connection
//! task is spawned. Each incoming frame then runs the pipeline in its own
//! task, so responses are correlated by `query_id`, not by order. A
//! parallel task fans broadcast events into the socket, filtered through
//! the connection context's subscription set.

mod sink;

use std::sync::Arc;

use futures_util::StreamExt;
use http::{header, HeaderValue, StatusCode};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use apibus_core::context::Context;
use apibus_core::engine::Engine;
use apibus_core::error::{ApiError, ApiResult};
use apibus_core::params::MediaType;
use apibus_core::response::Response;
use apibus_core::sink::ResponseSink;

pub use sink::WsSink;
use sink::{frame_for, SharedWriter};

/// Maximum size of one incoming frame.
pub const READ_LIMIT: usize = 128 * 1024;

/// The handshake reply the HTTP front-end writes for an accepted upgrade.
#[derive(Debug)]
pub struct UpgradeResponse {
    /// Always `101 Switching Protocols`.
    pub status: StatusCode,
    /// `Connection`, `Upgrade`, and `Sec-WebSocket-Accept` headers.
    pub headers: Vec<(header::HeaderName, HeaderValue)>,
}

/// Validate the WebSocket handshake and take over the connection.
///
/// On success the connection task is already spawned; the caller only has
/// to write the returned `101` response. The context becomes the
/// connection-scoped parent: it owns the subscription set and is
/// registered in the connected-clients map under its request id.
///
/// # Errors
///
/// Fails when the request is not a WebSocket handshake, when the origin
/// check rejects a cross-origin request without CSRF validation, or when
/// the underlying connection cannot be upgraded.
pub fn accept_upgrade(engine: &Engine, ctx: &Context) -> ApiResult<UpgradeResponse> {
    let connection = ctx.header("connection").unwrap_or_default();
    let upgrade = ctx.header("upgrade").unwrap_or_default();
    if !connection.to_ascii_lowercase().contains("upgrade")
        || !upgrade.eq_ignore_ascii_case("websocket")
    {
        return Err(ApiError::custom(
            StatusCode::BAD_REQUEST,
            "invalid_upgrade",
            "not a websocket handshake",
        ));
    }
    if ctx.header("sec-websocket-version").as_deref() != Some("13") {
        return Err(ApiError::custom(
            StatusCode::BAD_REQUEST,
            "invalid_upgrade",
            "unsupported websocket version",
        ));
    }
    let Some(key) = ctx.header("sec-websocket-key") else {
        return Err(ApiError::custom(
            StatusCode::BAD_REQUEST,
            "invalid_upgrade",
            "missing Sec-WebSocket-Key",
        ));
    };

    // Cross-origin connections are refused unless CSRF validation already
    // vouched for the caller.
    if !ctx.csrf_validated() {
        if let Some(origin) = ctx.header("origin") {
            let origin_host = host_of_origin(&origin);
            let request_host = ctx.domain();
            if !origin_host.eq_ignore_ascii_case(&request_host) {
                return Err(ApiError::access_denied("origin not allowed"));
            }
        }
    }

    let Some(on_upgrade) = ctx.take_extension::<hyper::upgrade::OnUpgrade>() else {
        return Err(ApiError::internal("connection cannot be upgraded"));
    };

    // Pin the negotiated encoding; every later frame and broadcast uses it.
    let media_type = ctx.media_type();
    ctx.set_accept(vec![media_type.as_str().to_owned()]);

    let engine = engine.clone();
    let conn_ctx = ctx.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => run_connection(engine, conn_ctx, upgraded, media_type).await,
            Err(e) => warn!(error = %e, "websocket upgrade failed after accept"),
        }
    });

    let accept = derive_accept_key(key.as_bytes());
    Ok(UpgradeResponse {
        status: StatusCode::SWITCHING_PROTOCOLS,
        headers: vec![
            (header::CONNECTION, HeaderValue::from_static("Upgrade")),
            (header::UPGRADE, HeaderValue::from_static("websocket")),
            (
                header::SEC_WEBSOCKET_ACCEPT,
                HeaderValue::from_str(&accept)
                    .unwrap_or_else(|_| HeaderValue::from_static("")),
            ),
        ],
    })
}

/// The host portion of an `Origin` header value.
fn host_of_origin(origin: &str) -> String {
    let without_scheme = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    if let Some(rest) = host_port.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_owned();
    }
    host_port.split(':').next().unwrap_or(host_port).to_owned()
}

/// Drive one upgraded connection: register the peer, fan broadcasts in,
/// dispatch each frame concurrently, tear down on read error or close.
async fn run_connection(
    engine: Engine,
    ctx: Context,
    upgraded: hyper::upgrade::Upgraded,
    media_type: MediaType,
) {
    let io = hyper_util::rt::TokioIo::new(upgraded);
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(READ_LIMIT);
    config.max_frame_size = Some(READ_LIMIT);
    let stream = WebSocketStream::from_raw_socket(io, Role::Server, Some(config)).await;
    let (write, mut read) = stream.split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write));

    engine.register_ws_client(ctx.clone());
    info!(request_id = %ctx.request_id(), encoding = media_type.as_str(), "websocket peer connected");

    let fan_out = tokio::spawn(broadcast_loop(
        engine.bus().subscribe(),
        ctx.clone(),
        Arc::clone(&writer),
        media_type,
    ));

    let cancel = ctx.cancellation();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    spawn_frame(&engine, &ctx, text.into_bytes(), MediaType::Json, &writer);
                }
                Some(Ok(Message::Binary(data))) => {
                    spawn_frame(&engine, &ctx, data, MediaType::Cbor, &writer);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                Some(Err(e)) => {
                    debug!(request_id = %ctx.request_id(), error = %e, "websocket read failed");
                    break;
                }
            },
        }
    }

    ctx.cancel();
    engine.release_ws_client(ctx.request_id());
    fan_out.abort();
    info!(request_id = %ctx.request_id(), "websocket peer disconnected");
}

/// Dispatch one frame in its own task. Frame N+1 does not wait for frame
/// N's response; clients correlate with `query_id`.
fn spawn_frame(
    engine: &Engine,
    parent: &Context,
    data: Vec<u8>,
    media_type: MediaType,
    writer: &SharedWriter,
) {
    let engine = engine.clone();
    let parent = parent.clone();
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        let (ctx, parsed) = Context::child_from_frame(&parent, &data, media_type);
        let sink = Arc::new(WsSink::new(writer, media_type));
        ctx.set_sink(Arc::clone(&sink) as Arc<dyn ResponseSink>);

        let resp = match parsed {
            Ok(()) => engine.respond(&ctx).await,
            Err(e) => Response::from_error(&ctx, &e),
        };
        if let Err(e) = sink.send_response(&resp).await {
            debug!(error = %e, "websocket response write failed, closing peer");
            parent.cancel();
        }
    });
}

/// Forward matching broadcast events to this peer.
///
/// Encoding is memoized on the event, so all subscribers on one format
/// share a single serialization. A lagged reader logs the gap and resumes
/// at the ring tail.
async fn broadcast_loop(
    mut events: tokio::sync::broadcast::Receiver<Arc<apibus_core::broadcast::BusEvent>>,
    ctx: Context,
    writer: SharedWriter,
    media_type: MediaType,
) {
    use futures_util::SinkExt;

    let cancel = ctx.cancellation();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if !ctx.listens_for(event.topic()) {
                        continue;
                    }
                    let Some(bytes) = event.encoded(media_type) else {
                        continue;
                    };
                    let message = frame_for(media_type, bytes);
                    if writer.lock().await.send(message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(request_id = %ctx.request_id(), skipped, "peer lagged behind broadcast ring");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
