//! Stream-socket transport integration tests.

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    use apibus_core::context::PreAttached;
    use apibus_socket::bind_unix;

    use crate::test_engine;

    async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("response line");
        serde_json::from_str(&line).expect("valid envelope line")
    }

    fn temp_socket_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "apibus-it-{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    #[tokio::test]
    async fn test_should_serve_newline_framed_requests() {
        let engine = test_engine();
        let dir = temp_socket_dir();
        let listener = bind_unix(engine, dir.join("api.sock"), PreAttached::default())
            .await
            .expect("bound");

        let client = UnixStream::connect(listener.path()).await.expect("connect");
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write
            .write_all(b"{\"path\":\"User/42\",\"params\":{},\"query_id\":\"s1\"}\n")
            .await
            .expect("request written");

        let env = read_envelope(&mut reader).await;
        assert_eq!(env["result"], json!("success"));
        assert_eq!(env["data"], json!({"id": "42", "name": "A"}));
        assert_eq!(env["query_id"], json!("s1"));

        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_should_handle_concurrent_requests_on_one_socket() {
        let engine = test_engine();
        let dir = temp_socket_dir();
        let listener = bind_unix(engine, dir.join("api.sock"), PreAttached::default())
            .await
            .expect("bound");

        let client = UnixStream::connect(listener.path()).await.expect("connect");
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        for n in 0..3 {
            let frame = format!(
                "{{\"path\":\"Ping:echo\",\"params\":{{\"n\":{n}}},\"query_id\":\"c{n}\"}}\n"
            );
            write.write_all(frame.as_bytes()).await.expect("written");
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let env = read_envelope(&mut reader).await;
            let id = env["query_id"].as_str().expect("query id").to_owned();
            assert_eq!(env["data"]["n"].as_i64(), id[1..].parse::<i64>().ok());
            seen.push(id);
        }
        seen.sort();
        assert_eq!(seen, vec!["c0", "c1", "c2"]);

        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_should_fall_back_to_symlink_for_long_paths() {
        let engine = test_engine();
        let long_segment = "x".repeat(90);
        let dir = temp_socket_dir().join(long_segment);
        let path = dir.join("api.sock");
        assert!(path.as_os_str().len() >= 100);

        let listener = bind_unix(engine, &path, PreAttached::default())
            .await
            .expect("bound through symlink");

        // The advertised path is the requested one.
        assert_eq!(listener.path(), path.as_path());

        // Clients face the same kernel path ceiling, so connect through a
        // short symlink of their own.
        let client_link = std::path::PathBuf::from(format!(
            ".socket_client_{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::os::unix::fs::symlink(listener.path(), &client_link).expect("client symlink");
        let client = UnixStream::connect(&client_link).await.expect("connect");
        let _ = std::fs::remove_file(&client_link);
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);
        write
            .write_all(b"{\"path\":\"@ping\",\"params\":{}}\n")
            .await
            .expect("request written");
        let env = read_envelope(&mut reader).await;
        assert_eq!(env["data"]["ping"], json!("pong"));

        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_should_fan_out_json_broadcasts_to_socket_peers() {
        let engine = test_engine();
        let dir = temp_socket_dir();
        let listener = bind_unix(engine.clone(), dir.join("api.sock"), PreAttached::default())
            .await
            .expect("bound");

        let client = UnixStream::connect(listener.path()).await.expect("connect");
        let (read, _write) = client.into_split();
        let mut reader = BufReader::new(read);

        for _ in 0..50 {
            if engine.socket_client_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        engine.broadcast_json(&json!({"result": "event", "data": "hello"}));

        let event = read_envelope(&mut reader).await;
        assert_eq!(event["result"], json!("event"));
        assert_eq!(event["data"], json!("hello"));

        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }
}
