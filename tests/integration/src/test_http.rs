//! HTTP transport integration tests.

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{raw_http, spawn_server};

    #[tokio::test]
    async fn test_should_serve_success_envelope_for_fetch() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(addr, "GET", "/User/42", &[], b"").await;

        assert_eq!(reply.status, 200);
        assert_eq!(
            reply.header("content-type"),
            Some("application/json; charset=utf-8")
        );

        let env = reply.json();
        assert_eq!(env["result"], json!("success"));
        assert_eq!(env["data"], json!({"id": "42", "name": "A"}));
        assert_eq!(env["request_id"].as_str().expect("request id").len(), 36);
        assert!(env["time"].as_f64().expect("time") >= 0.0);
    }

    #[tokio::test]
    async fn test_should_update_user_via_patch() {
        let (addr, _engine) = spawn_server().await;
        let body = br#"{"name":"B"}"#;
        let reply = raw_http(
            addr,
            "PATCH",
            "/User/42",
            &[
                ("Content-Type", "application/json"),
                ("Content-Length", "12"),
            ],
            body,
        )
        .await;

        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["data"], json!({"id": "42", "name": "B"}));
    }

    #[tokio::test]
    async fn test_should_reject_post_without_csrf() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(
            addr,
            "POST",
            "/User",
            &[
                ("Content-Type", "application/json"),
                ("Content-Length", "14"),
            ],
            br#"{"name":"Eve"}"#,
        )
        .await;

        assert_eq!(reply.status, 400);
        let env = reply.json();
        assert_eq!(env["result"], json!("error"));
        assert_eq!(env["code"], json!(400));
        assert_eq!(env["token"], json!("error_insecure_request"));
    }

    #[tokio::test]
    async fn test_should_create_user_with_csrf_header() {
        let (addr, _engine) = spawn_server().await;
        let body = br#"{"name":"Eve"}"#;
        let reply = raw_http(
            addr,
            "POST",
            "/User",
            &[
                ("Content-Type", "application/json"),
                ("Content-Length", "14"),
                ("Sec-Csrf-Token", "valid"),
            ],
            body,
        )
        .await;

        assert_eq!(reply.status, 200);
        let env = reply.json();
        assert_eq!(env["result"], json!("success"));
        assert_eq!(env["data"]["name"], json!("Eve"));
    }

    #[tokio::test]
    async fn test_should_answer_options_with_instance_allow_list() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(addr, "OPTIONS", "/User/42", &[], b"").await;

        assert_eq!(reply.status, 204);
        assert_eq!(
            reply.header("access-control-allow-methods"),
            Some("GET, HEAD, OPTIONS, PATCH, DELETE")
        );
        assert_eq!(
            reply.header("access-control-allow-headers"),
            Some("Authorization, Content-Type")
        );
        assert_eq!(reply.header("access-control-max-age"), Some("86400"));
    }

    #[tokio::test]
    async fn test_should_send_cors_headers_on_errors() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(addr, "GET", "/Nothing", &[], b"").await;

        assert_eq!(reply.status, 404);
        assert_eq!(reply.header("access-control-allow-origin"), Some("*"));
        assert_eq!(reply.header("access-control-allow-credentials"), Some("true"));
        assert_eq!(reply.json()["token"], json!("error_not_found"));
    }

    #[tokio::test]
    async fn test_should_reflect_request_origin() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(
            addr,
            "GET",
            "/User",
            &[("Origin", "https://app.example")],
            b"",
        )
        .await;

        assert_eq!(
            reply.header("access-control-allow-origin"),
            Some("https://app.example")
        );
        assert_eq!(reply.header("vary"), Some("Accept-Encoding,Origin"));
    }

    #[tokio::test]
    async fn test_should_require_content_length_on_body_verbs() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(
            addr,
            "POST",
            "/User",
            &[
                ("Content-Type", "application/json"),
                ("Sec-Csrf-Token", "valid"),
                ("Transfer-Encoding", "chunked"),
            ],
            b"0\r\n\r\n",
        )
        .await;

        assert_eq!(reply.status, 411);
        assert_eq!(reply.json()["token"], json!("error_length_required"));
    }

    #[tokio::test]
    async fn test_should_reject_oversize_declared_bodies() {
        let (addr, _engine) = spawn_server().await;
        let oversize = ((1 << 20) + 1).to_string();
        let reply = raw_http(
            addr,
            "POST",
            "/User",
            &[
                ("Content-Type", "application/x-www-form-urlencoded"),
                ("Content-Length", &oversize),
                ("Sec-Csrf-Token", "valid"),
            ],
            b"",
        )
        .await;

        assert_eq!(reply.status, 413);
        assert_eq!(
            reply.json()["token"],
            json!("error_request_entity_too_large")
        );
    }

    #[tokio::test]
    async fn test_should_fail_double_id_with_not_found() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(addr, "GET", "/User/123/456", &[], b"").await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.json()["token"], json!("error_not_found"));
    }

    #[tokio::test]
    async fn test_should_produce_equal_envelopes_for_repeated_gets() {
        let (addr, _engine) = spawn_server().await;
        let mut first = raw_http(addr, "GET", "/User/42", &[], b"").await.json();
        let mut second = raw_http(addr, "GET", "/User/42", &[], b"").await.json();

        for env in [&mut first, &mut second] {
            let map = env.as_object_mut().expect("envelope object");
            map.remove("time");
            map.remove("request_id");
        }
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_should_match_form_underscore_and_json_bodies() {
        let (addr, _engine) = spawn_server().await;

        // `_` in a urlencoded body carries the same JSON document.
        let form = b"_=%7B%22x%22%3A%5B1%2C2%5D%7D";
        let from_form = raw_http(
            addr,
            "POST",
            "/Ping:echo",
            &[
                ("Content-Type", "application/x-www-form-urlencoded"),
                ("Content-Length", &form.len().to_string()),
                ("Sec-Csrf-Token", "valid"),
            ],
            form,
        )
        .await
        .json();

        let json_body = br#"{"x":[1,2]}"#;
        let from_json = raw_http(
            addr,
            "POST",
            "/Ping:echo",
            &[
                ("Content-Type", "application/json"),
                ("Content-Length", &json_body.len().to_string()),
                ("Sec-Csrf-Token", "valid"),
            ],
            json_body,
        )
        .await
        .json();

        assert_eq!(from_form["data"], from_json["data"]);
        assert_eq!(from_form["data"], json!({"x": [1, 2]}));
    }

    #[tokio::test]
    async fn test_should_serve_ping_special() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(addr, "GET", "/@ping", &[], b"").await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["data"]["ping"], json!("pong"));
    }

    #[tokio::test]
    async fn test_should_serve_query_params_to_static_methods() {
        let (addr, _engine) = spawn_server().await;
        let reply = raw_http(addr, "GET", "/Ping:echo?a=1&b[c]=2", &[], b"").await;
        assert_eq!(reply.json()["data"], json!({"a": "1", "b": {"c": "2"}}));
    }
}
