//! Local stream-socket front-end for the apibus dispatch core.
//!
//! Two entry points: [`make_socket_fd`] builds a connected socket pair and
//! returns one end as a file descriptor suitable for passing to a spawned
//! process; [`bind_unix`] listens on a named UNIX socket path. Peers speak
//! newline-framed JSON request objects (`{path, verb?, params,
//! query_id?}`) and receive envelope lines back. Frames dispatch
//! concurrently, so several requests may be in flight on one socket;
//! clients correlate responses with `query_id`.
//!
//! Platform path-length ceilings for UNIX sockets sit around 104–108
//! bytes. [`bind_unix`] works around long paths by creating a randomly
//! named symlink in the current directory and listening through it; the
//! symlink is removed on teardown.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use apibus_core::context::{Context, PreAttached};
use apibus_core::engine::Engine;
use apibus_core::error::{ApiError, ApiResult};
use apibus_core::params::MediaType;
use apibus_core::response::Response;
use apibus_core::sink::{RawSink, ResponseSink, SinkFuture};

/// Paths at or above this length get the symlink treatment.
const PATH_LIMIT: usize = 100;

/// Create a connected socket pair, serve one end, and return the other as
/// a file descriptor for a spawned process.
///
/// Must be called from within a tokio runtime; the serving task is
/// spawned immediately.
///
/// # Errors
///
/// Propagates socket-pair creation and registration failures.
pub fn make_socket_fd(engine: &Engine, extra: PreAttached) -> std::io::Result<OwnedFd> {
    let (theirs, ours) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
    ours.set_nonblocking(true)?;
    let stream = UnixStream::from_std(std::os::unix::net::UnixStream::from(ours))?;

    let engine = engine.clone();
    tokio::spawn(handle_client(engine, stream, extra));

    Ok(OwnedFd::from(theirs))
}

/// A bound named listener. Dropping it stops the accept loop and removes
/// the socket file and any fallback symlink.
pub struct SocketListener {
    path: PathBuf,
    symlink: Option<PathBuf>,
    handle: tokio::task::JoinHandle<()>,
}

impl SocketListener {
    /// The requested socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(link) = &self.symlink {
            let _ = std::fs::remove_file(link);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Listen on a named UNIX socket, serving each connection.
///
/// # Errors
///
/// Propagates path resolution and bind failures.
pub async fn bind_unix(
    engine: Engine,
    path: impl AsRef<Path>,
    extra: PreAttached,
) -> std::io::Result<SocketListener> {
    let absolute = std::path::absolute(path)?;
    let _ = std::fs::remove_file(&absolute);
    if let Some(dir) = absolute.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut bind_path = absolute.clone();
    let mut symlink = None;
    if absolute.as_os_str().len() >= PATH_LIMIT {
        // Near the platform ceiling: bind through a short symlink in the
        // current directory instead.
        loop {
            let candidate = PathBuf::from(format!(
                ".socket_tmp.{}.{}",
                std::process::id(),
                Uuid::new_v4().simple()
            ));
            if candidate.symlink_metadata().is_ok() {
                continue;
            }
            std::os::unix::fs::symlink(&absolute, &candidate)?;
            bind_path = candidate.clone();
            symlink = Some(candidate);
            break;
        }
    }

    let listener = UnixListener::bind(&bind_path)?;
    info!(path = %absolute.display(), "stream socket listening");

    let handle = tokio::spawn(accept_loop(engine, listener, extra));
    Ok(SocketListener {
        path: absolute,
        symlink,
        handle,
    })
}

async fn accept_loop(engine: Engine, listener: UnixListener, extra: PreAttached) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(handle_client(engine.clone(), stream, extra.clone()));
            }
            Err(e) => {
                warn!(error = %e, "stream socket accept failed");
                return;
            }
        }
    }
}

/// Serve one connected peer until EOF or a read error.
pub async fn handle_client(engine: Engine, stream: UnixStream, extra: PreAttached) {
    let client_id = Uuid::new_v4();
    let (read_half, write_half) = stream.into_split();
    let sink = Arc::new(SocketSink::new(write_half));

    engine.register_socket_client(client_id, Arc::clone(&sink) as Arc<dyn RawSink>);
    debug!(client = %client_id, "stream-socket peer connected");

    // The connection-scoped parent carries the pre-attached objects and
    // the subscription set; each frame spawns a child below it.
    let parent = Context::new("", http::Method::GET);
    for (tag, object) in &extra.objects {
        parent.attach_object(tag.clone(), Arc::clone(object));
    }
    if let Some(user) = &extra.user {
        parent.set_user(Arc::clone(user));
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let engine = engine.clone();
                let parent = parent.clone();
                let sink = Arc::clone(&sink);
                tokio::spawn(run_frame(engine, parent, sink, line));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(client = %client_id, error = %e, "stream-socket read failed");
                break;
            }
        }
    }

    parent.cancel();
    engine.release_socket_client(client_id);
    debug!(client = %client_id, "stream-socket peer disconnected");
}

async fn run_frame(engine: Engine, parent: Context, sink: Arc<SocketSink>, line: String) {
    let (ctx, parsed) = Context::child_from_frame(&parent, line.as_bytes(), MediaType::Json);
    ctx.set_sink(Arc::clone(&sink) as Arc<dyn ResponseSink>);

    let resp = match parsed {
        Ok(()) => engine.respond(&ctx).await,
        Err(e) => {
            warn!(error = %e, "invalid frame on stream socket");
            Response::from_error(&ctx, &e)
        }
    };
    if sink.send_response(&resp).await.is_err() {
        parent.cancel();
    }
}

/// Write half of one peer, serialized behind a mutex so frame responses,
/// progress messages, and broadcasts interleave without tearing.
pub struct SocketSink {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl SocketSink {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    async fn write_line(&self, data: &[u8]) -> ApiResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| ApiError::internal(format!("stream-socket write failed: {e}")))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| ApiError::internal(format!("stream-socket write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| ApiError::internal(format!("stream-socket flush failed: {e}")))
    }
}

impl ResponseSink for SocketSink {
    fn send_response<'a>(&'a self, resp: &'a Response) -> SinkFuture<'a> {
        Box::pin(async move {
            let bytes = resp.encode_envelope(MediaType::Json, false)?;
            self.write_line(&bytes).await
        })
    }
}

impl RawSink for SocketSink {
    fn send_value<'a>(&'a self, value: &'a serde_json::Value) -> SinkFuture<'a> {
        Box::pin(async move {
            let bytes = serde_json::to_vec(value)
                .map_err(|e| ApiError::internal(format!("cannot encode broadcast: {e}")))?;
            self.write_line(&bytes).await
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use apibus_core::registry::{action_fn, Outcome, StaticClass};

    use super::*;

    fn engine() -> Engine {
        let echo = action_fn(|_ctx, args| async move { Ok(Outcome::Value(args)) });
        let ping = StaticClass::builder("Ping").static_method("echo", echo).build();
        let root = StaticClass::builder("").child(ping).build();
        Engine::builder().root(root).build()
    }

    async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(
        reader: &mut BufReader<R>,
    ) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("response line");
        serde_json::from_str(&line).expect("valid envelope")
    }

    #[tokio::test]
    async fn test_should_serve_frames_over_socket_pair() {
        let engine = engine();
        let (server, client) = UnixStream::pair().expect("socket pair");
        tokio::spawn(handle_client(engine, server, PreAttached::default()));

        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(b"{\"path\":\"Ping:echo\",\"params\":{\"x\":1},\"query_id\":\"q1\"}\n")
            .await
            .expect("request written");

        let env = read_envelope(&mut reader).await;
        assert_eq!(env["result"], json!("success"));
        assert_eq!(env["data"], json!({"x": 1}));
        assert_eq!(env["query_id"], json!("q1"));
    }

    #[tokio::test]
    async fn test_should_answer_invalid_frames_with_error_envelope() {
        let engine = engine();
        let (server, client) = UnixStream::pair().expect("socket pair");
        tokio::spawn(handle_client(engine, server, PreAttached::default()));

        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"not json\n").await.expect("written");
        let env = read_envelope(&mut reader).await;
        assert_eq!(env["result"], json!("error"));
        assert_eq!(env["code"], json!(500));
    }

    #[tokio::test]
    async fn test_should_register_and_release_clients() {
        let engine = engine();
        let (server, client) = UnixStream::pair().expect("socket pair");
        tokio::spawn(handle_client(engine.clone(), server, PreAttached::default()));

        // Wait for registration, then for teardown after close.
        for _ in 0..50 {
            if engine.socket_client_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.socket_client_count(), 1);

        drop(client);
        for _ in 0..50 {
            if engine.socket_client_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.socket_client_count(), 0);
    }

    #[tokio::test]
    async fn test_should_serve_through_returned_fd() {
        let engine = engine();
        let fd = make_socket_fd(&engine, PreAttached::default()).expect("socket pair");

        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true).expect("nonblocking");
        let client = UnixStream::from_std(std_stream).expect("tokio stream");

        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);
        write
            .write_all(b"{\"path\":\"@ping\",\"params\":{}}\n")
            .await
            .expect("request written");

        let env = read_envelope(&mut reader).await;
        assert_eq!(env["data"]["ping"], json!("pong"));
    }

    #[tokio::test]
    async fn test_should_bind_named_listener_and_serve() {
        let engine = engine();
        let dir = std::env::temp_dir().join(format!("apibus-test-{}", Uuid::new_v4().simple()));
        let path = dir.join("api.sock");
        let listener = bind_unix(engine, &path, PreAttached::default())
            .await
            .expect("bound");

        let client = UnixStream::connect(listener.path()).await.expect("connect");
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);
        write
            .write_all(b"{\"path\":\"Ping:echo\",\"params\":{\"ok\":true}}\n")
            .await
            .expect("request written");

        let env = read_envelope(&mut reader).await;
        assert_eq!(env["data"], json!({"ok": true}));

        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }
}
