//! End-to-end tests for the apibus server.
//!
//! Each test spawns an in-process server on an ephemeral port and talks to
//! it over real transports: hand-written HTTP/1.1 over TCP, a WebSocket
//! client, and UNIX stream sockets.

use std::net::SocketAddr;
use std::sync::{Arc, Once};

use dashmap::DashMap;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use apibus_core::context::Context;
use apibus_core::engine::Engine;
use apibus_core::error::ApiError;
use apibus_core::hook::{CsrfHeaderHook, RequireCsrf};
use apibus_core::registry::{
    action_fn, ActionKind, ApiObject, Object, OpFuture, Outcome, StaticClass, Updatable,
};
use apibus_http::ApiService;

static INIT: Once = Once::new();

/// Initialize tracing (once).
fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

/// A user record in the test store.
pub struct TestUser {
    id: String,
    name: RwLock<String>,
}

impl ApiObject for TestUser {
    fn encode(&self, _ctx: &Context) -> Value {
        json!({"id": self.id, "name": *self.name.read()})
    }

    fn as_updatable(&self) -> Option<&dyn Updatable> {
        Some(self)
    }
}

impl Updatable for TestUser {
    fn api_update<'a>(&'a self, ctx: &'a Context) -> OpFuture<'a> {
        Box::pin(async move {
            if let Some(name) = ctx.param::<String>("name") {
                *self.name.write() = name;
            }
            Ok(())
        })
    }
}

/// Build the engine used by every test server: a `User` collection, a
/// `Ping:echo` static, `Events` subscription statics, and CSRF hooks.
#[must_use]
pub fn test_engine() -> Engine {
    let store: Arc<DashMap<String, Arc<TestUser>>> = Arc::new(DashMap::new());
    store.insert(
        "42".to_owned(),
        Arc::new(TestUser {
            id: "42".to_owned(),
            name: RwLock::new("A".to_owned()),
        }),
    );

    let fetch_store = Arc::clone(&store);
    let fetch = action_fn(move |_ctx, args| {
        let store = Arc::clone(&fetch_store);
        async move {
            let id = args["id"].as_str().unwrap_or_default();
            match store.get(id) {
                Some(user) => Ok(Outcome::Object(Arc::clone(user.value()) as Object)),
                None => Err(ApiError::not_found()),
            }
        }
    });
    let list_store = Arc::clone(&store);
    let list = action_fn(move |ctx, _args| {
        let store = Arc::clone(&list_store);
        async move {
            let users: Vec<Value> = store.iter().map(|e| e.value().encode(&ctx)).collect();
            Ok(Outcome::Value(Value::Array(users)))
        }
    });
    let create_store = Arc::clone(&store);
    let create = action_fn(move |ctx, _args| {
        let store = Arc::clone(&create_store);
        async move {
            let name = ctx.param_or::<String>("name", "anonymous".to_owned());
            let id = uuid::Uuid::new_v4().simple().to_string();
            let user = Arc::new(TestUser {
                id: id.clone(),
                name: RwLock::new(name),
            });
            store.insert(id, Arc::clone(&user));
            Ok(Outcome::Object(user as Object))
        }
    });

    let echo = action_fn(|_ctx, args| async move { Ok(Outcome::Value(args)) });
    let subscribe = action_fn(|ctx, _args| async move {
        let channel = ctx.param_or::<String>("channel", "*".to_owned());
        ctx.set_listen(&channel, true);
        Ok(Outcome::Value(json!({"subscribed": channel})))
    });

    let user = StaticClass::builder("User")
        .action(ActionKind::Fetch, fetch)
        .action(ActionKind::List, list)
        .action(ActionKind::Create, create)
        .build();
    let ping = StaticClass::builder("Ping").static_method("echo", echo).build();
    let events = StaticClass::builder("Events")
        .static_method("subscribe", subscribe)
        .build();
    let root = StaticClass::builder("")
        .child(user)
        .child(ping)
        .child(events)
        .build();

    Engine::builder()
        .root(root)
        .request_hook(Arc::new(CsrfHeaderHook))
        .request_hook(Arc::new(RequireCsrf))
        .build()
}

/// Spawn an in-process server on an ephemeral port.
pub async fn spawn_server() -> (SocketAddr, Engine) {
    init_tracing();

    let engine = test_engine();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let service = ApiService::new(engine.clone());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let svc = service.clone();
            tokio::spawn(async move {
                let http = HttpConnBuilder::new(TokioExecutor::new());
                let _ = http
                    .serve_connection_with_upgrades(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (addr, engine)
}

/// A parsed HTTP/1.1 response.
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpReply {
    /// Look up a header, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body as JSON.
    #[must_use]
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("valid JSON body")
    }
}

/// Issue one hand-written HTTP/1.1 request over a fresh TCP connection.
///
/// `Content-Length` is only sent when the caller lists it, so tests can
/// probe its absence.
pub async fn raw_http(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> HttpReply {
    let mut request =
        format!("{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("request head written");
    stream.write_all(body).await.expect("request body written");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("response read");

    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> HttpReply {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]);
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");

    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        })
        .collect();

    HttpReply {
        status,
        headers,
        body,
    }
}

/// A connected WebSocket client.
pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket connection through the `@ws` special path.
pub async fn ws_connect(addr: SocketAddr, accept: Option<&str>) -> WsClient {
    let mut request = format!("ws://{addr}/@ws")
        .into_client_request()
        .expect("client request");
    if let Some(accept) = accept {
        request
            .headers_mut()
            .insert("accept", accept.parse().expect("header value"));
    }
    let (ws, _) = connect_async(request).await.expect("websocket connect");
    ws
}

/// Send one JSON request frame.
pub async fn ws_send_json(ws: &mut WsClient, frame: &Value) {
    use futures_util::SinkExt;
    ws.send(Message::Text(frame.to_string()))
        .await
        .expect("frame sent");
}

/// Receive the next text frame as JSON, skipping control frames.
pub async fn ws_recv_json(ws: &mut WsClient) -> Value {
    use futures_util::StreamExt;
    loop {
        let msg = ws
            .next()
            .await
            .expect("stream open")
            .expect("frame received");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Receive the next binary frame as CBOR, skipping control frames.
pub async fn ws_recv_cbor(ws: &mut WsClient) -> Value {
    use futures_util::StreamExt;
    loop {
        let msg = ws
            .next()
            .await
            .expect("stream open")
            .expect("frame received");
        match msg {
            Message::Binary(data) => {
                return ciborium::from_reader(data.as_slice()).expect("valid CBOR frame")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

mod test_broadcast;
mod test_http;
mod test_socket;
mod test_ws;
