//! HTTP carrier integration tests
//!
//! Drives the SSE and streamable transports with `reqwest` over real
//! sockets: JSON-RPC routes, broadcast/targeted SSE delivery, replay from
//! `Last-Event-ID`, heartbeats, origin policy, and session lifecycle.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use mcpwire::config::HttpConfig;
use mcpwire::transport::http_sse::HttpSseTransport;
use mcpwire::transport::http_streamable::HttpStreamableTransport;
use mcpwire::transport::{handler_fn, Transport};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_sse(config: HttpConfig) -> (Arc<HttpSseTransport>, String) {
    let transport = Arc::new(HttpSseTransport::new(config));
    transport
        .start(handler_fn(|payload: Bytes| Some(payload)))
        .await
        .expect("start sse server");
    let addr = transport.local_addr().await.unwrap();
    (transport, format!("http://{}", addr))
}

async fn start_streamable(config: HttpConfig) -> (Arc<HttpStreamableTransport>, String) {
    let transport = Arc::new(HttpStreamableTransport::new(config));
    transport
        .start(handler_fn(|payload: Bytes| Some(payload)))
        .await
        .expect("start streamable server");
    let addr = transport.local_addr().await.unwrap();
    (transport, format!("http://{}", addr))
}

/// Drain an SSE response body for `window`, returning everything read.
async fn read_sse(response: reqwest::Response, window: Duration) -> String {
    let mut stream = response.bytes_stream();
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(chunk))) => collected.push_str(&String::from_utf8_lossy(&chunk)),
            _ => break,
        }
    }
    collected
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// `GET /` serves the landing page; unknown paths 404.
#[tokio::test]
async fn test_landing_page_and_404() {
    let (transport, base) = start_sse(HttpConfig::default()).await;

    let landing = reqwest::get(format!("{}/", base)).await.unwrap();
    assert_eq!(landing.status(), 200);
    assert!(landing
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("text/html"));
    assert!(landing.text().await.unwrap().contains("mcpwire"));

    let missing = reqwest::get(format!("{}/nope/missing", base)).await.unwrap();
    assert_eq!(missing.status(), 404);

    transport.stop().await;
}

/// `GET /tools` serves the injected catalogue as JSON.
#[tokio::test]
async fn test_tools_catalogue() {
    let (transport, base) = start_sse(HttpConfig::default()).await;
    transport.set_tool_catalogue(r#"{"tools":[{"name":"echo"}]}"#);

    let response = reqwest::get(format!("{}/tools", base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["tools"][0]["name"], "echo");

    transport.stop().await;
}

/// `POST /call_tool` hands the body to the handler and returns its reply.
#[tokio::test]
async fn test_call_tool_post_round_trip() {
    let (transport, base) = start_sse(HttpConfig::default()).await;

    let request = r#"{"jsonrpc":"2.0","id":1,"method":"call_tool","params":{}}"#;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/call_tool", base))
        .header("Content-Type", "application/json")
        .body(request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), request);

    transport.stop().await;
}

/// `GET /call_tool` translates `name` and `param_*` query parameters into
/// a `call_tool` envelope with URL decoding.
#[tokio::test]
async fn test_call_tool_get_query_translation() {
    let (transport, base) = start_sse(HttpConfig::default()).await;

    let response = reqwest::get(format!(
        "{}/call_tool?name=echo&param_text=hello+world&param_path=a%2Fb",
        base
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);

    // The echo handler returns the envelope the transport built.
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["method"], "call_tool");
    assert_eq!(body["params"]["name"], "echo");
    assert_eq!(body["params"]["arguments"]["text"], "hello world");
    assert_eq!(body["params"]["arguments"]["path"], "a/b");

    transport.stop().await;
}

/// `OPTIONS /call_tool` answers with CORS headers and an empty body.
#[tokio::test]
async fn test_call_tool_options_cors() {
    let (transport, base) = start_sse(HttpConfig::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("{}/call_tool", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    assert!(response
        .headers()
        .get("access-control-allow-methods")
        .is_some());
    assert!(response.text().await.unwrap().is_empty());

    transport.stop().await;
}

/// A handler returning a JSON-RPC error envelope drives the HTTP status:
/// 400 for invalid request/params, 500 otherwise.
#[tokio::test]
async fn test_error_envelope_status_mapping() {
    let transport = Arc::new(HttpSseTransport::new(HttpConfig::default()));
    transport
        .start(handler_fn(|payload: Bytes| {
            let code = if payload.starts_with(b"bad") { -32602 } else { -32601 };
            Some(Bytes::from(format!(
                r#"{{"jsonrpc":"2.0","id":1,"error":{{"code":{},"message":"x"}}}}"#,
                code
            )))
        }))
        .await
        .unwrap();
    let base = format!("http://{}", transport.local_addr().await.unwrap());

    let client = reqwest::Client::new();
    let invalid_params = client
        .post(format!("{}/call_tool", base))
        .body("bad request")
        .send()
        .await
        .unwrap();
    assert_eq!(invalid_params.status(), 400);

    let method_missing = client
        .post(format!("{}/call_tool", base))
        .body("other")
        .send()
        .await
        .unwrap();
    assert_eq!(method_missing.status(), 500);

    transport.stop().await;
}

// ---------------------------------------------------------------------------
// SSE delivery
// ---------------------------------------------------------------------------

/// Broadcasts reach only session-less clients; targeted events reach only
/// the session owner; both land in the replay store with consecutive ids.
#[tokio::test]
async fn test_sse_broadcast_vs_targeted() {
    let (transport, base) = start_sse(HttpConfig::default()).await;
    let client = reqwest::Client::new();

    let stream_a = client
        .get(format!("{}/events", base))
        .send()
        .await
        .unwrap();
    let stream_b = client
        .get(format!("{}/events?session_id=sess-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(stream_a.status(), 200);
    assert_eq!(stream_b.status(), 200);

    // Wait for both registrations before publishing.
    for _ in 0..50 {
        if transport.sse_client_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first = transport.publish(Some("note"), "x", None).unwrap();
    let second = transport.publish(Some("note"), "y", Some("sess-1")).unwrap();
    assert_eq!(
        second.id.parse::<u64>().unwrap(),
        first.id.parse::<u64>().unwrap() + 1
    );

    let a = read_sse(stream_a, Duration::from_millis(400)).await;
    let b = read_sse(stream_b, Duration::from_millis(400)).await;

    assert!(a.contains("data: x"), "A receives the broadcast: {:?}", a);
    assert!(!a.contains("data: y"), "A must not see the targeted event");
    assert!(b.contains("data: y"), "B receives the targeted event: {:?}", b);
    assert!(!b.contains("data: x"), "B must not see the broadcast");

    transport.stop().await;
}

/// A client resuming with `Last-Event-ID: 1` replays exactly the stored
/// events after id 1, in order.
#[tokio::test]
async fn test_sse_replay_from_last_event_id() {
    let (transport, base) = start_sse(HttpConfig::default()).await;

    transport.publish(None, "a", None).unwrap();
    transport.publish(None, "b", None).unwrap();
    transport.publish(None, "c", None).unwrap();

    let client = reqwest::Client::new();
    let stream = client
        .get(format!("{}/events", base))
        .header("Last-Event-ID", "1")
        .send()
        .await
        .unwrap();

    let collected = read_sse(stream, Duration::from_millis(400)).await;
    assert!(!collected.contains("data: a"), "id 1 is the exclusive resume point");
    let b_pos = collected.find("id: 2\ndata: b").expect("replayed b");
    let c_pos = collected.find("id: 3\ndata: c").expect("replayed c");
    assert!(b_pos < c_pos, "replay preserves id order");

    transport.stop().await;
}

/// Heartbeat comments flow on the configured interval.
#[tokio::test]
async fn test_sse_heartbeats() {
    let config = HttpConfig {
        heartbeat_interval_ms: 100,
        ..Default::default()
    };
    let (transport, base) = start_sse(config).await;

    let stream = reqwest::get(format!("{}/events", base)).await.unwrap();
    let collected = read_sse(stream, Duration::from_millis(450)).await;
    assert!(
        collected.contains(": heartbeat "),
        "expected heartbeat comments, got {:?}",
        collected
    );

    transport.stop().await;
}

/// `POST /events` publishes into the stream and the replay store.
#[tokio::test]
async fn test_post_events_publishes() {
    let (transport, base) = start_sse(HttpConfig::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/events", base))
        .json(&serde_json::json!({"type": "note", "data": "posted"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(transport.stored_events(), 1);

    // Control characters in the payload are rejected.
    let bad = client
        .post(format!("{}/events", base))
        .json(&serde_json::json!({"data": "bell\u{0007}"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    transport.stop().await;
}

// ---------------------------------------------------------------------------
// Streamable transport: origin policy and sessions
// ---------------------------------------------------------------------------

/// Allowed origins pass (exact and wildcard); anything else is rejected.
#[tokio::test]
async fn test_origin_policy_enforcement() {
    let config = HttpConfig {
        validate_origin: true,
        allowed_origins: "http://localhost:*,https://example.com".to_string(),
        ..Default::default()
    };
    let (transport, base) = start_streamable(config).await;
    let client = reqwest::Client::new();

    for origin in ["http://localhost:3000", "https://example.com"] {
        let response = client
            .post(format!("{}/mcp", base))
            .header("Origin", origin)
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "origin {} must pass", origin);
    }

    let denied = client
        .post(format!("{}/mcp", base))
        .header("Origin", "http://evil.test")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 403);

    transport.stop().await;
}

/// The first POST establishes a session and returns `Mcp-Session-Id`;
/// the id is stable across subsequent requests.
#[tokio::test]
async fn test_streamable_session_establishment() {
    let (transport, base) = start_streamable(HttpConfig::default()).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/mcp", base))
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let session_id = first
        .headers()
        .get("mcp-session-id")
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(session_id.len(), 32);
    assert!(session_id.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(transport.session_count(), 1);

    let second = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &session_id)
        .body(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(
        second.headers().get("mcp-session-id").unwrap().to_str().unwrap(),
        session_id
    );
    assert_eq!(transport.session_count(), 1, "no second session created");

    transport.stop().await;
}

/// An unknown or malformed session id is rejected.
#[tokio::test]
async fn test_streamable_session_validation() {
    let (transport, base) = start_streamable(HttpConfig::default()).await;
    let client = reqwest::Client::new();

    let unknown = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", "00000000000000000000000000000000")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    let malformed = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", "has space")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);

    transport.stop().await;
}

/// Session lifecycle: usable while fresh, gone after its timeout.
#[tokio::test]
async fn test_streamable_session_expiry() {
    let config = HttpConfig {
        session_timeout_seconds: 1,
        ..Default::default()
    };
    let (transport, base) = start_streamable(config).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/mcp", base))
        .body("{}")
        .send()
        .await
        .unwrap();
    let session_id = first
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Within the timeout the session resolves.
    let fresh = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &session_id)
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(fresh.status(), 200);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let expired = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &session_id)
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(expired.status(), 404);
    assert_eq!(transport.session_count(), 0);

    transport.stop().await;
}

/// `DELETE /mcp` terminates the session; a second DELETE is a 404.
#[tokio::test]
async fn test_streamable_session_delete() {
    let (transport, base) = start_streamable(HttpConfig::default()).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/mcp", base))
        .body("{}")
        .send()
        .await
        .unwrap();
    let session_id = first
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let deleted = client
        .delete(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    assert_eq!(transport.session_count(), 0);

    let again = client
        .delete(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);

    transport.stop().await;
}

/// A session's GET stream replays stored events strictly after the
/// presented `Last-Event-ID` and receives live events thereafter.
#[tokio::test]
async fn test_streamable_replay_and_live_delivery() {
    let (transport, base) = start_streamable(HttpConfig::default()).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/mcp", base))
        .body("{}")
        .send()
        .await
        .unwrap();
    let session_id = first
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    transport.store_event(&session_id, None, "a", None).unwrap();
    transport.store_event(&session_id, None, "b", None).unwrap();
    transport.store_event(&session_id, None, "c", None).unwrap();

    let stream = client
        .get(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &session_id)
        .header("Last-Event-ID", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    // Live event published after the stream opened.
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.store_event(&session_id, None, "live", None).unwrap();

    let collected = read_sse(stream, Duration::from_millis(400)).await;
    assert!(!collected.contains("data: a"));
    assert!(collected.contains("id: 2\ndata: b"));
    assert!(collected.contains("id: 3\ndata: c"));
    assert!(collected.contains("data: live"));

    transport.stop().await;
}
