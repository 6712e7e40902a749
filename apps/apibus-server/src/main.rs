//! apibus demo server.
//!
//! Serves the demo object tree over HTTP and WebSocket on one listener,
//! and optionally over a named local stream socket.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `API_LISTEN` | `0.0.0.0:9400` | HTTP/WebSocket bind address |
//! | `API_SOCKET` | *(unset)* | Path for the local stream socket |
//! | `LOG_LEVEL` | `info` | Log level filter |
//! | `RUST_LOG` | *(unset)* | Fine-grained tracing filter (overrides `LOG_LEVEL`) |

mod demo;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use apibus_core::context::PreAttached;
use apibus_core::engine::Engine;
use apibus_core::hook::CsrfHeaderHook;
use apibus_core::registry::{action_fn, Outcome};
use apibus_http::ApiService;

/// Server version reported by `@ping`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server configuration, driven by environment variables.
#[derive(Debug, Clone)]
struct ServerConfig {
    listen: String,
    socket_path: Option<String>,
    log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9400".to_owned(),
            socket_path: None,
            log_level: "info".to_owned(),
        }
    }
}

impl ServerConfig {
    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("API_LISTEN") {
            config.listen = v;
        }
        if let Ok(v) = std::env::var("API_SOCKET") {
            if !v.is_empty() {
                config.socket_path = Some(v);
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            config.log_level = v;
        }
        config
    }
}

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the `LOG_LEVEL` config
/// value.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// Build the engine: demo registry, CSRF marker hook, and the `@publish`
/// special that fans demo events out to both long-lived transports.
fn build_engine() -> Engine {
    let engine = Engine::builder()
        .root(demo::build_registry())
        .request_hook(Arc::new(CsrfHeaderHook))
        .special(
            "version",
            action_fn(|_ctx, _args| async move {
                Ok(Outcome::Value(json!({"version": VERSION})))
            }),
        )
        .build();

    let publisher = engine.clone();
    engine.register_special(
        "publish",
        action_fn(move |ctx, _args| {
            let engine = publisher.clone();
            async move {
                let channel = ctx.param_or::<String>("channel", "*".to_owned());
                let data = ctx.get_param("data").unwrap_or(Value::Null);
                let event = json!({"result": "event", "channel": channel, "data": data});
                engine.send_ws(&ctx, channel.clone(), event.clone());
                engine.broadcast_json(&event);
                Ok(Outcome::Value(json!({"published": channel})))
            }
        }),
    );

    engine
}

/// Run the accept loop, serving connections until a shutdown signal is
/// received.
async fn serve(listener: TcpListener, service: ApiService) -> Result<()> {
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let http = HttpConnBuilder::new(TokioExecutor::new());

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal, draining connections");
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let svc = service.clone();
                let conn = http.serve_connection_with_upgrades(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!(peer_addr = %peer_addr, error = %e, "connection error");
                    }
                });
            }

            () = &mut shutdown => {
                info!("shutting down gracefully");
                break;
            }
        }
    }

    // Wait for in-flight requests to complete.
    graceful.shutdown().await;
    info!("all connections drained, exiting");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config.log_level)?;

    let engine = build_engine();

    // Optional local stream socket, torn down when the guard drops.
    let _socket_guard = match &config.socket_path {
        Some(path) => Some(
            apibus_socket::bind_unix(engine.clone(), path, PreAttached::default())
                .await
                .with_context(|| format!("failed to bind stream socket at {path}"))?,
        ),
        None => None,
    };

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.listen))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(
        %addr,
        socket = config.socket_path.as_deref().unwrap_or("-"),
        version = VERSION,
        "starting apibus server",
    );

    serve(listener, ApiService::new(engine)).await
}
