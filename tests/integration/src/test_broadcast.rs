//! Broadcast fan-out integration tests.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use apibus_core::context::Context;

    use crate::{spawn_server, ws_connect, ws_recv_json, ws_send_json, WsClient};

    async fn subscribe(ws: &mut WsClient, channel: &str) {
        ws_send_json(
            ws,
            &json!({"path": "Events:subscribe", "params": {"channel": channel}}),
        )
        .await;
        let env = ws_recv_json(ws).await;
        assert_eq!(env["data"]["subscribed"], json!(channel));
    }

    async fn assert_silent(ws: &mut WsClient) {
        let quiet = tokio::time::timeout(Duration::from_millis(200), ws_recv_json(ws)).await;
        assert!(quiet.is_err(), "peer should not have received a frame");
    }

    #[tokio::test]
    async fn test_should_deliver_topic_events_to_matching_subscribers_only() {
        let (addr, engine) = spawn_server().await;

        let mut users_peer = ws_connect(addr, None).await;
        let mut orders_peer = ws_connect(addr, None).await;
        subscribe(&mut users_peer, "users").await;
        subscribe(&mut orders_peer, "orders").await;

        let origin = Context::new("", http::Method::GET);
        engine.send_ws(&origin, "users", json!({"result": "event", "data": {"user": "42"}}));

        let event = ws_recv_json(&mut users_peer).await;
        assert_eq!(event["data"], json!({"user": "42"}));

        assert_silent(&mut orders_peer).await;
    }

    #[tokio::test]
    async fn test_should_deliver_wildcard_events_to_everyone() {
        let (addr, engine) = spawn_server().await;

        let mut users_peer = ws_connect(addr, None).await;
        let mut orders_peer = ws_connect(addr, None).await;
        subscribe(&mut users_peer, "users").await;
        subscribe(&mut orders_peer, "orders").await;

        let origin = Context::new("", http::Method::GET);
        engine.broadcast_ws(&origin, json!({"result": "event", "data": "all"}));

        assert_eq!(ws_recv_json(&mut users_peer).await["data"], json!("all"));
        assert_eq!(ws_recv_json(&mut orders_peer).await["data"], json!("all"));
    }

    #[tokio::test]
    async fn test_should_not_deliver_to_unsubscribed_peers() {
        let (addr, engine) = spawn_server().await;

        let mut silent_peer = ws_connect(addr, None).await;
        // Run one request so the connection is fully alive.
        ws_send_json(&mut silent_peer, &json!({"path": "@ping", "params": {}})).await;
        ws_recv_json(&mut silent_peer).await;

        let origin = Context::new("", http::Method::GET);
        engine.send_ws(&origin, "users", json!({"data": 1}));

        assert_silent(&mut silent_peer).await;
    }

    #[tokio::test]
    async fn test_should_honor_wildcard_subscription() {
        let (addr, engine) = spawn_server().await;

        let mut peer = ws_connect(addr, None).await;
        subscribe(&mut peer, "*").await;

        let origin = Context::new("", http::Method::GET);
        engine.send_ws(&origin, "anything", json!({"data": "seen"}));

        assert_eq!(ws_recv_json(&mut peer).await["data"], json!("seen"));
    }
}
