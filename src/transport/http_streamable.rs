//! Streamable HTTP transport with session multiplexing
//!
//! Extends the HTTP carrier with per-session SSE streams and replay. A
//! session is established on the first `POST /mcp` (the response carries
//! `Mcp-Session-Id`); subsequent requests present that header and are
//! rejected when the session has expired or was terminated. `GET /mcp`
//! opens the session's event stream, resuming strictly after the id in
//! `Last-Event-ID` when one is supplied. `DELETE /mcp` terminates the
//! session.
//!
//! When origin validation is enabled, every request must present an
//! `Origin` header matching the allow-list; entries may end in `*` as a
//! suffix wildcard (`http://localhost:*`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::error::{Result, TransportError};
use crate::net::Shutdown;
use crate::session::{SessionManager, SessionState, MAX_SESSION_ID_LEN};
use crate::sse::{render_event, EventStore, SseEvent};
use crate::text;
use crate::transport::http_sse::{jsonrpc_error_body, status_for_code};
use crate::transport::{Carrier, MessageHandler, Role, Transport};

/// Session expiry sweep cadence.
const SESSION_SWEEP_TICK: Duration = Duration::from_secs(5);

/// Origin allow-list with suffix wildcards.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Parse a comma-separated allow-list, trimming whitespace.
    pub fn parse(csv: &str) -> Self {
        Self {
            allowed: csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Whether `origin` matches any entry (exact, or wildcard prefix for
    /// entries ending in `*`).
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed.iter().any(|entry| {
            match entry.strip_suffix('*') {
                Some(prefix) => origin.starts_with(prefix),
                None => entry == origin,
            }
        })
    }
}

/// Per-session stream state: stored events plus live stream senders.
struct StreamContext {
    store: EventStore,
    senders: StdMutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl StreamContext {
    fn new(capacity: usize) -> Self {
        Self {
            store: EventStore::new(capacity),
            senders: StdMutex::new(Vec::new()),
        }
    }

    /// Store one event and push it to every live stream of the session.
    fn store_and_deliver(
        &self,
        id: Option<&str>,
        event_type: Option<&str>,
        data: &str,
    ) -> SseEvent {
        let event = match id {
            Some(id) => self.store.store_with_id(id, event_type, data),
            None => self.store.store(event_type, data),
        };
        let frame = render_event(&event);
        let mut senders = self.senders.lock().expect("stream senders lock poisoned");
        senders.retain(|tx| tx.send(frame.clone()).is_ok());
        event
    }
}

type StreamMap = Arc<StdMutex<HashMap<String, Arc<StreamContext>>>>;

struct StreamShared {
    config: HttpConfig,
    origin: Option<OriginPolicy>,
    sessions: SessionManager,
    streams: StreamMap,
    handler: StdMutex<Option<Arc<dyn MessageHandler>>>,
}

struct Running {
    shutdown: Shutdown,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// Streamable HTTP server transport with sessions and replay.
pub struct HttpStreamableTransport {
    shared: Arc<StreamShared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl HttpStreamableTransport {
    /// Construct a stopped transport; `start` binds the listener.
    pub fn new(config: HttpConfig) -> Self {
        let origin = if config.validate_origin {
            Some(OriginPolicy::parse(&config.allowed_origins))
        } else {
            None
        };
        let streams: StreamMap = Arc::new(StdMutex::new(HashMap::new()));

        // Expired or terminated sessions drop their stream context with
        // them; live GET streams end when the senders are dropped.
        let streams_for_events = Arc::clone(&streams);
        let sessions = SessionManager::new(
            config.max_sessions,
            Duration::from_secs(config.session_timeout_seconds),
        )
        .with_event_callback(move |id, state| {
            if matches!(state, SessionState::Expired | SessionState::Terminated) {
                streams_for_events
                    .lock()
                    .expect("stream map lock poisoned")
                    .remove(id);
            }
        });

        Self {
            shared: Arc::new(StreamShared {
                config,
                origin,
                sessions,
                streams,
                handler: StdMutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// The bound address, available while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.active_count()
    }

    /// Store an event on a session's stream and deliver it to any open
    /// stream of that session.
    ///
    /// # Errors
    ///
    /// - [`TransportError::SessionNotFound`] for an unknown session.
    /// - [`TransportError::InvalidArg`] for SSE-illegal text.
    pub fn store_event(
        &self,
        session_id: &str,
        event_type: Option<&str>,
        data: &str,
        id: Option<&str>,
    ) -> Result<SseEvent> {
        if let Some(event_type) = event_type {
            if !text::is_valid_sse_text(event_type) {
                return Err(TransportError::InvalidArg(
                    "event type contains control characters".into(),
                )
                .into());
            }
        }
        if !text::is_valid_sse_text(data) {
            return Err(
                TransportError::InvalidArg("event data contains control characters".into())
                    .into(),
            );
        }

        if self.shared.sessions.get(session_id).is_none() {
            return Err(TransportError::SessionNotFound(session_id.to_string()).into());
        }
        let context = context_for(&self.shared, session_id);
        Ok(context.store_and_deliver(id, event_type, data))
    }

    fn router(shared: Arc<StreamShared>) -> Router {
        Router::new()
            .route("/mcp", post(rpc_post).get(stream_get).delete(session_delete))
            .with_state(shared)
    }

    async fn session_sweep_loop(shared: Arc<StreamShared>, shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(SESSION_SWEEP_TICK) => {}
            }
            let cleaned = shared.sessions.cleanup_expired();
            if cleaned > 0 {
                debug!(cleaned, "expired sessions swept");
            }
        }
    }
}

/// Fetch (or lazily create) the stream context for a session.
fn context_for(shared: &StreamShared, session_id: &str) -> Arc<StreamContext> {
    let mut streams = shared.streams.lock().expect("stream map lock poisoned");
    Arc::clone(streams.entry(session_id.to_string()).or_insert_with(|| {
        Arc::new(StreamContext::new(shared.config.max_stored_events))
    }))
}

#[async_trait::async_trait]
impl Transport for HttpStreamableTransport {
    fn role(&self) -> Role {
        Role::Server
    }

    fn carrier(&self) -> Carrier {
        Carrier::HttpStreamable
    }

    fn is_running(&self) -> bool {
        self.running.try_lock().map(|r| r.is_some()).unwrap_or(true)
    }

    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        *self.shared.handler.lock().expect("handler lock poisoned") = Some(handler);

        let listener = TcpListener::bind(self.shared.config.bind_addr())
            .await
            .map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let shutdown = Shutdown::new();
        let tracker = TaskTracker::new();

        let router = Self::router(Arc::clone(&self.shared));
        let serve_shutdown = shutdown.clone();
        tracker.spawn(async move {
            let server = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_shutdown.wait().await });
            if let Err(e) = server.await {
                warn!(error = %e, "streamable http server terminated");
            }
        });
        tracker.spawn(Self::session_sweep_loop(
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));

        *running = Some(Running {
            shutdown,
            tracker,
            local_addr,
        });
        info!(addr = %local_addr, "streamable http server started");
        Ok(())
    }

    async fn stop(&self) {
        let running = { self.running.lock().await.take() };
        let Some(running) = running else { return };

        running.shutdown.trigger();
        running.tracker.close();
        running.tracker.wait().await;
        info!("streamable http server stopped");
    }
}

impl Drop for HttpStreamableTransport {
    /// Best-effort teardown when dropped while running; `stop` remains
    /// the orderly path.
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.shutdown.trigger();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Header extraction and response helpers
// ---------------------------------------------------------------------------

/// Extract and validate `Mcp-Session-Id` (header names are
/// case-insensitive).
///
/// Returns `Err` for a present-but-invalid value: ids must be visible
/// ASCII and shorter than [`MAX_SESSION_ID_LEN`].
fn extract_session_id(headers: &HeaderMap) -> std::result::Result<Option<String>, ()> {
    match headers.get("mcp-session-id") {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().map_err(|_| ())?;
            if value.len() >= MAX_SESSION_ID_LEN || !text::is_visible_ascii(value) {
                return Err(());
            }
            Ok(Some(value.to_string()))
        }
    }
}

/// Extract `Last-Event-ID`; values outside `[A-Za-z0-9_-]` (and empty
/// values) are ignored rather than rejected.
fn extract_last_event_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .filter(|id| text::is_valid_event_id(id))
        .map(str::to_string)
}

/// JSON response helper: status, `Content-Type`, `Content-Length`,
/// optional `Mcp-Session-Id`, then the body.
fn json_response(status: StatusCode, body: String, session_id: Option<&str>) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len().to_string());
    if let Some(session_id) = session_id {
        builder = builder.header("Mcp-Session-Id", session_id);
    }
    builder.body(Body::from(body)).expect("response build")
}

/// Enforce the origin policy; `Err` carries the rejection response.
fn check_origin(shared: &StreamShared, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let Some(policy) = &shared.origin else {
        return Ok(());
    };
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if policy.allows(origin) {
        return Ok(());
    }
    debug!(origin, "request origin denied");
    Err(json_response(
        StatusCode::FORBIDDEN,
        jsonrpc_error_body(serde_json::Value::Null, -32000),
        None,
    ))
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn rpc_post(
    State(shared): State<Arc<StreamShared>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = check_origin(&shared, &headers) {
        return rejection;
    }

    let session_id = match extract_session_id(&headers) {
        Ok(session_id) => session_id,
        Err(()) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                jsonrpc_error_body(serde_json::Value::Null, -32600),
                None,
            );
        }
    };

    // Resolve or establish the session.
    let (session_id, fresh) = match session_id {
        Some(id) => {
            if shared.sessions.get(&id).is_none() {
                return json_response(
                    StatusCode::NOT_FOUND,
                    jsonrpc_error_body(serde_json::Value::Null, -32001),
                    None,
                );
            }
            shared.sessions.touch(&id);
            (id, false)
        }
        None => match shared.sessions.create(0) {
            Ok(id) => (id, true),
            Err(_) => {
                return json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    jsonrpc_error_body(serde_json::Value::Null, -32002),
                    None,
                );
            }
        },
    };

    let handler = shared.handler.lock().expect("handler lock poisoned").clone();
    let Some(handler) = handler else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            jsonrpc_error_body(serde_json::Value::Null, -32603),
            Some(&session_id),
        );
    };

    let reply = handler.on_message(body).await;
    let (status, payload) = match reply {
        Some(payload) => {
            let status = serde_json::from_slice::<serde_json::Value>(&payload)
                .ok()
                .and_then(|v| v.get("error")?.get("code")?.as_i64())
                .map(|code| status_for_code(code as i32))
                .unwrap_or(StatusCode::OK);
            (status, String::from_utf8_lossy(&payload).into_owned())
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            jsonrpc_error_body(serde_json::Value::Null, -32603),
        ),
    };

    if fresh {
        debug!(session_id = %session_id, "session established");
    }
    json_response(status, payload, Some(&session_id))
}

async fn stream_get(
    State(shared): State<Arc<StreamShared>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = check_origin(&shared, &headers) {
        return rejection;
    }

    let session_id = match extract_session_id(&headers) {
        Ok(Some(session_id)) => session_id,
        Ok(None) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                jsonrpc_error_body(serde_json::Value::Null, -32600),
                None,
            );
        }
        Err(()) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                jsonrpc_error_body(serde_json::Value::Null, -32600),
                None,
            );
        }
    };

    if shared.sessions.get(&session_id).is_none() {
        return json_response(
            StatusCode::NOT_FOUND,
            jsonrpc_error_body(serde_json::Value::Null, -32001),
            None,
        );
    }
    shared.sessions.touch(&session_id);

    let context = context_for(&shared, &session_id);
    let (tx, rx) = mpsc::unbounded_channel::<String>();

    // Replay strictly after the resume point; None replays everything
    // stored for this session.
    let last_event_id = extract_last_event_id(&headers);
    for event in context.store.replay_after(last_event_id.as_deref()) {
        let _ = tx.send(render_event(&event));
    }
    context
        .senders
        .lock()
        .expect("stream senders lock poisoned")
        .push(tx);

    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, std::convert::Infallible>(frame));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("Mcp-Session-Id", session_id)
        .body(Body::from_stream(stream))
        .expect("response build")
}

async fn session_delete(
    State(shared): State<Arc<StreamShared>>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = check_origin(&shared, &headers) {
        return rejection;
    }

    let session_id = match extract_session_id(&headers) {
        Ok(Some(session_id)) => session_id,
        _ => {
            return json_response(
                StatusCode::BAD_REQUEST,
                jsonrpc_error_body(serde_json::Value::Null, -32600),
                None,
            );
        }
    };

    if shared.sessions.terminate(&session_id) {
        json_response(StatusCode::OK, r#"{"result":"terminated"}"#.to_string(), None)
    } else {
        json_response(
            StatusCode::NOT_FOUND,
            jsonrpc_error_body(serde_json::Value::Null, -32001),
            None,
        )
    }
}
