//! WebSocket client integration tests
//!
//! Runs the client against small in-process tokio-tungstenite servers:
//! request/response correlation, the timed-out late-reply discipline, and
//! reconnect bookkeeping.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use mcpwire::config::WsClientConfig;
use mcpwire::error::{kind_of, TransportError};
use mcpwire::transport::ws_client::{ClientState, WsClientTransport};
use mcpwire::transport::{handler_fn, Transport};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// WebSocket echo server on an ephemeral port.
async fn spawn_echo_server() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(msg)) = source.next().await {
                    match msg {
                        Message::Text(_) | Message::Binary(_) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    port
}

/// Server that delays the reply to request id 7 by `delay_ms` and answers
/// everything else immediately.
async fn spawn_delaying_server(delay_ms: u64) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (sink, mut source) = ws.split();
                let sink = std::sync::Arc::new(tokio::sync::Mutex::new(sink));
                while let Some(Ok(msg)) = source.next().await {
                    let Message::Text(request) = msg else { continue };
                    let parsed: serde_json::Value = serde_json::from_str(&request).unwrap();
                    let id = parsed["id"].as_i64().unwrap_or(0);
                    let reply = format!(r#"{{"jsonrpc":"2.0","id":{},"result":"r{}"}}"#, id, id);

                    let sink = std::sync::Arc::clone(&sink);
                    tokio::spawn(async move {
                        if id == 7 {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        }
                        let _ = sink.lock().await.send(Message::Text(reply)).await;
                    });
                }
            });
        }
    });
    port
}

// ---------------------------------------------------------------------------
// Request/response
// ---------------------------------------------------------------------------

/// A request is answered with the matching payload.
#[tokio::test]
async fn test_ws_request_response() {
    let port = spawn_echo_server().await;
    let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
    client.start(handler_fn(|_| None)).await.unwrap();
    client.wait_for_connection(5_000).await.unwrap();

    let request = br#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#;
    let reply = client.request(request, 5_000).await.unwrap();
    assert_eq!(&reply[..], &request[..]);

    client.stop().await;
}

/// A timed-out request returns `Timeout`; its late reply is swallowed and
/// the next request completes with its own payload.
#[tokio::test]
async fn test_ws_sync_timeout_then_late_reply_is_discarded() {
    let port = spawn_delaying_server(250).await;
    let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
    client.start(handler_fn(|_| None)).await.unwrap();
    client.wait_for_connection(5_000).await.unwrap();

    // Request 7 times out at 100 ms; the server replies at ~250 ms.
    let err = client
        .request(br#"{"jsonrpc":"2.0","id":7,"method":"slow"}"#, 100)
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), Some(TransportError::Timeout(_))));

    // Request 8 must not see the stale id-7 reply.
    let reply = client
        .request(br#"{"jsonrpc":"2.0","id":8,"method":"fast"}"#, 2_000)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(parsed["id"], 8);
    assert_eq!(parsed["result"], "r8");

    client.stop().await;
}

/// Async notifications (no id) bypass the sync slot and reach the
/// message handler.
#[tokio::test]
async fn test_ws_notification_goes_to_handler() {
    let port = spawn_echo_server().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<bytes::Bytes>();
    let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
    client
        .start(handler_fn(move |payload| {
            let _ = tx.send(payload);
            None
        }))
        .await
        .unwrap();
    client.wait_for_connection(5_000).await.unwrap();

    // No "id" field: the echoed frame is delivered asynchronously.
    client
        .send(br#"{"jsonrpc":"2.0","method":"notify"}"#)
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler delivery")
        .unwrap();
    assert_eq!(&delivered[..], &br#"{"jsonrpc":"2.0","method":"notify"}"#[..]);

    client.stop().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// `sendv` joins its buffers into one frame.
#[tokio::test]
async fn test_ws_sendv_round_trip() {
    let port = spawn_echo_server().await;
    let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
    client.start(handler_fn(|_| None)).await.unwrap();
    client.wait_for_connection(5_000).await.unwrap();

    client
        .sendv(&[br#"{"jsonrpc":"2.0","id":5,"#, br#""method":"join"}"#])
        .await
        .unwrap();
    let reply = client.receive(5_000).await.unwrap();
    assert_eq!(&reply[..], &br#"{"jsonrpc":"2.0","id":5,"method":"join"}"#[..]);

    client.stop().await;
}

/// Stop is prompt, sets the terminal state, and send afterwards reports
/// not running.
#[tokio::test]
async fn test_ws_stop_quiesces() {
    let port = spawn_echo_server().await;
    let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
    client.start(handler_fn(|_| None)).await.unwrap();
    client.wait_for_connection(5_000).await.unwrap();

    let started = std::time::Instant::now();
    client.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.state(), ClientState::Disconnected);

    let err = client.send(b"{}").await.unwrap_err();
    assert!(matches!(kind_of(&err), Some(TransportError::NotRunning)));
}

/// Small requests ride the reusable send buffer; the counters show it.
#[tokio::test]
async fn test_ws_send_buffer_reuse_counters() {
    let port = spawn_echo_server().await;
    let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
    client.start(handler_fn(|_| None)).await.unwrap();
    client.wait_for_connection(5_000).await.unwrap();

    for i in 0..3 {
        let request = format!(r#"{{"jsonrpc":"2.0","id":{},"method":"m"}}"#, i);
        client.request(request.as_bytes(), 5_000).await.unwrap();
    }

    let stats = client.send_stats();
    assert!(stats.reusable_hits >= 3, "small frames reuse the send buffer");
    assert_eq!(stats.heap_allocs, 0);
    assert!(stats.ascii_fast_paths >= 3);
    assert_eq!(stats.utf8_validations, 0);

    client.stop().await;
}
