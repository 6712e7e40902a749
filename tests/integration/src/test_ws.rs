//! WebSocket transport integration tests.

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message;

    use crate::{spawn_server, ws_connect, ws_recv_cbor, ws_recv_json, ws_send_json};

    #[tokio::test]
    async fn test_should_dispatch_text_frames_and_echo_query_id() {
        let (addr, _engine) = spawn_server().await;
        let mut ws = ws_connect(addr, None).await;

        ws_send_json(
            &mut ws,
            &json!({"path": "Ping:echo", "params": {"x": 1}, "query_id": "q7"}),
        )
        .await;

        let env = ws_recv_json(&mut ws).await;
        assert_eq!(env["result"], json!("success"));
        assert_eq!(env["data"], json!({"x": 1}));
        assert_eq!(env["query_id"], json!("q7"));
    }

    #[tokio::test]
    async fn test_should_default_frame_verb_to_get() {
        let (addr, _engine) = spawn_server().await;
        let mut ws = ws_connect(addr, None).await;

        ws_send_json(&mut ws, &json!({"path": "User/42", "params": {}})).await;
        let env = ws_recv_json(&mut ws).await;
        assert_eq!(env["data"], json!({"id": "42", "name": "A"}));
    }

    #[tokio::test]
    async fn test_should_answer_binary_frames_in_cbor() {
        use futures_util::SinkExt;

        let (addr, _engine) = spawn_server().await;
        let mut ws = ws_connect(addr, Some("application/cbor")).await;

        let frame = json!({"path": "Ping:echo", "params": {"n": 5}, "query_id": "b1"});
        let mut encoded = Vec::new();
        ciborium::into_writer(&frame, &mut encoded).expect("encodes");
        ws.send(Message::Binary(encoded)).await.expect("frame sent");

        let env = ws_recv_cbor(&mut ws).await;
        assert_eq!(env["result"], json!("success"));
        assert_eq!(env["data"], json!({"n": 5}));
        assert_eq!(env["query_id"], json!("b1"));
    }

    #[tokio::test]
    async fn test_should_report_errors_per_frame() {
        let (addr, _engine) = spawn_server().await;
        let mut ws = ws_connect(addr, None).await;

        ws_send_json(&mut ws, &json!({"path": "Nothing", "params": {}})).await;
        let env = ws_recv_json(&mut ws).await;
        assert_eq!(env["result"], json!("error"));
        assert_eq!(env["token"], json!("error_not_found"));

        // The connection survives a failed request.
        ws_send_json(
            &mut ws,
            &json!({"path": "Ping:echo", "params": {"still": "alive"}}),
        )
        .await;
        let env = ws_recv_json(&mut ws).await;
        assert_eq!(env["data"], json!({"still": "alive"}));
    }

    #[tokio::test]
    async fn test_should_correlate_interleaved_frames_by_query_id() {
        let (addr, _engine) = spawn_server().await;
        let mut ws = ws_connect(addr, None).await;

        for n in 0..4 {
            ws_send_json(
                &mut ws,
                &json!({"path": "Ping:echo", "params": {"n": n}, "query_id": format!("q{n}")}),
            )
            .await;
        }

        // Responses may arrive in any order; every query id shows up once.
        let mut seen = Vec::new();
        for _ in 0..4 {
            let env = ws_recv_json(&mut ws).await;
            let id = env["query_id"].as_str().expect("query id").to_owned();
            assert_eq!(env["data"]["n"].as_i64(), id[1..].parse::<i64>().ok());
            seen.push(id);
        }
        seen.sort();
        assert_eq!(seen, vec!["q0", "q1", "q2", "q3"]);
    }

    #[tokio::test]
    async fn test_should_register_peer_in_client_map() {
        let (addr, engine) = spawn_server().await;
        let ws = ws_connect(addr, None).await;

        for _ in 0..50 {
            if engine.ws_client_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.ws_client_count(), 1);

        drop(ws);
        for _ in 0..50 {
            if engine.ws_client_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.ws_client_count(), 0);
    }
}
