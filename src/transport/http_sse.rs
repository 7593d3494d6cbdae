//! HTTP + SSE server transport
//!
//! Serves the JSON-RPC invocation routes and a `text/event-stream`
//! channel with a circular replay store, per-client filters, targeted and
//! broadcast delivery, and periodic heartbeat comments.
//!
//! Routes:
//!
//! - `GET /` -- static landing page.
//! - `GET /tools` -- JSON catalogue supplied by the embedding server.
//! - `GET|POST|OPTIONS /call_tool` -- JSON-RPC invocation; GET translates
//!   query parameters into a `call_tool` envelope.
//! - `GET /events` -- SSE stream; `session_id` and `filter` query
//!   parameters narrow delivery, `Last-Event-ID` resumes from the store.
//! - `POST /events` -- publish an event into the stream.
//! - anything else -- static file under `doc_root`, or 404.
//!
//! Delivery rules: a client with a session id receives only events
//! targeted at that session (matched case-sensitively first, then
//! case-insensitively); broadcasts skip clients that hold a session id;
//! an event-type filter suppresses everything else.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
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
use crate::sse::{render_event, render_heartbeat, EventStore, SseEvent};
use crate::text;
use crate::transport::{Carrier, MessageHandler, Role, Transport};

/// Landing page served at `GET /`.
const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>mcpwire</title></head>\n\
<body><h1>mcpwire transport</h1>\n\
<p>JSON-RPC endpoint: <code>POST /call_tool</code> &middot; \
event stream: <code>GET /events</code></p></body></html>\n";

/// One registered SSE consumer.
struct SseClient {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
    filter: Option<String>,
    session_id: Option<String>,
    last_event_id: Option<String>,
}

/// Registry of connected SSE clients, guarded by one lock.
struct ClientRegistry {
    clients: StdMutex<Vec<SseClient>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    fn new() -> Self {
        Self {
            clients: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(
        &self,
        tx: mpsc::UnboundedSender<String>,
        filter: Option<String>,
        session_id: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .lock()
            .expect("sse client registry lock poisoned")
            .push(SseClient {
                id,
                tx,
                filter,
                session_id,
                last_event_id: None,
            });
        id
    }

    fn len(&self) -> usize {
        self.clients
            .lock()
            .expect("sse client registry lock poisoned")
            .len()
    }

    /// Deliver one stored event to every matching client.
    ///
    /// Clients whose channel has gone away are dropped from the registry
    /// in the same pass.
    fn deliver(&self, event: &SseEvent, target_session: Option<&str>) -> usize {
        let frame = render_event(event);
        let mut clients = self
            .clients
            .lock()
            .expect("sse client registry lock poisoned");
        let mut delivered = 0;
        clients.retain_mut(|client| {
            if !event_matches(client, event, target_session) {
                return true;
            }
            match client.tx.send(frame.clone()) {
                Ok(()) => {
                    client.last_event_id = Some(event.id.clone());
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(client = client.id, "sse client disconnected, removed");
                    false
                }
            }
        });
        delivered
    }

    /// Send the heartbeat comment to every connected client.
    fn heartbeat(&self, counter: u64) {
        let frame = render_heartbeat(counter);
        let mut clients = self
            .clients
            .lock()
            .expect("sse client registry lock poisoned");
        clients.retain(|client| client.tx.send(frame.clone()).is_ok());
    }
}

/// Delivery predicate for one client/event pair.
fn event_matches(client: &SseClient, event: &SseEvent, target_session: Option<&str>) -> bool {
    // Event-type filter suppresses everything that does not match.
    if let Some(filter) = &client.filter {
        match &event.event_type {
            Some(event_type) if event_type == filter => {}
            _ => return false,
        }
    }
    match target_session {
        // Targeted event: only the session owner sees it.
        Some(target) => match &client.session_id {
            Some(own) => own == target || own.eq_ignore_ascii_case(target),
            None => false,
        },
        // Broadcast: clients bound to a session do not see it.
        None => client.session_id.is_none(),
    }
}

struct SseShared {
    config: HttpConfig,
    store: EventStore,
    registry: ClientRegistry,
    handler: StdMutex<Option<Arc<dyn MessageHandler>>>,
    tool_catalogue: StdMutex<Option<String>>,
}

struct Running {
    shutdown: Shutdown,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// HTTP server transport with an SSE event stream.
pub struct HttpSseTransport {
    shared: Arc<SseShared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl HttpSseTransport {
    /// Construct a stopped transport; `start` binds the listener.
    pub fn new(config: HttpConfig) -> Self {
        let store = EventStore::new(config.max_stored_events);
        Self {
            shared: Arc::new(SseShared {
                config,
                store,
                registry: ClientRegistry::new(),
                handler: StdMutex::new(None),
                tool_catalogue: StdMutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// The bound address, available while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Install the JSON catalogue served at `GET /tools`.
    pub fn set_tool_catalogue(&self, catalogue: impl Into<String>) {
        *self
            .shared
            .tool_catalogue
            .lock()
            .expect("catalogue lock poisoned") = Some(catalogue.into());
    }

    /// Number of connected SSE clients.
    pub fn sse_client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Publish an event to the stream.
    ///
    /// The event is stored for replay and delivered per the filter and
    /// targeting rules. Returns the stored event.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidArg`] when the event type or data contain
    /// SSE-illegal control characters, or the session id is not visible
    /// ASCII.
    pub fn publish(
        &self,
        event_type: Option<&str>,
        data: &str,
        session_id: Option<&str>,
    ) -> Result<SseEvent> {
        publish_on(&self.shared, event_type, data, session_id)
    }

    /// Number of events currently held for replay.
    pub fn stored_events(&self) -> usize {
        self.shared.store.len()
    }

    fn router(shared: Arc<SseShared>) -> Router {
        Router::new()
            .route("/", get(landing))
            .route("/tools", get(tools))
            .route(
                "/call_tool",
                get(call_tool_get).post(call_tool_post).options(call_tool_options),
            )
            .route("/events", get(events_stream).post(events_publish))
            .fallback(static_fallback)
            .with_state(shared)
    }

    async fn heartbeat_loop(shared: Arc<SseShared>, shutdown: Shutdown) {
        let interval = Duration::from_millis(shared.config.heartbeat_interval_ms.max(1));
        let mut counter = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            counter += 1;
            shared.registry.heartbeat(counter);
        }
    }
}

/// Validate and publish one event (shared with the streamable carrier).
fn publish_on(
    shared: &SseShared,
    event_type: Option<&str>,
    data: &str,
    session_id: Option<&str>,
) -> Result<SseEvent> {
    if let Some(event_type) = event_type {
        if !text::is_valid_sse_text(event_type) {
            return Err(
                TransportError::InvalidArg("event type contains control characters".into()).into(),
            );
        }
    }
    if !text::is_valid_sse_text(data) {
        return Err(
            TransportError::InvalidArg("event data contains control characters".into()).into(),
        );
    }
    if let Some(session) = session_id {
        if !text::is_visible_ascii(session) {
            return Err(
                TransportError::InvalidArg("session id must be visible ASCII".into()).into(),
            );
        }
    }

    let event = shared.store.store(event_type, data);
    let delivered = shared.registry.deliver(&event, session_id);
    debug!(id = %event.id, delivered, "sse event published");
    Ok(event)
}

#[async_trait::async_trait]
impl Transport for HttpSseTransport {
    fn role(&self) -> Role {
        Role::Server
    }

    fn carrier(&self) -> Carrier {
        Carrier::Http
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
                warn!(error = %e, "http server terminated");
            }
        });

        if self.shared.config.enable_heartbeats {
            tracker.spawn(Self::heartbeat_loop(
                Arc::clone(&self.shared),
                shutdown.clone(),
            ));
        }

        *running = Some(Running {
            shutdown,
            tracker,
            local_addr,
        });
        info!(addr = %local_addr, "http sse server started");
        Ok(())
    }

    async fn stop(&self) {
        let running = { self.running.lock().await.take() };
        let Some(running) = running else { return };

        running.shutdown.trigger();
        running.tracker.close();
        running.tracker.wait().await;
        info!("http sse server stopped");
    }
}

impl Drop for HttpSseTransport {
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
// Route handlers
// ---------------------------------------------------------------------------

fn apply_cors(config: &HttpConfig, builder: axum::http::response::Builder) -> axum::http::response::Builder {
    if !config.enable_cors {
        return builder;
    }
    builder
        .header("Access-Control-Allow-Origin", config.cors_allow_origin.as_str())
        .header("Access-Control-Allow-Methods", config.cors_allow_methods.as_str())
        .header("Access-Control-Allow-Headers", config.cors_allow_headers.as_str())
        .header("Access-Control-Max-Age", config.cors_max_age.to_string())
}

async fn landing(State(shared): State<Arc<SseShared>>) -> Response {
    apply_cors(&shared.config, Response::builder())
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html")
        .body(Body::from(LANDING_PAGE))
        .expect("static response")
}

async fn tools(State(shared): State<Arc<SseShared>>) -> Response {
    let catalogue = shared
        .tool_catalogue
        .lock()
        .expect("catalogue lock poisoned")
        .clone()
        .unwrap_or_else(|| r#"{"tools":[]}"#.to_string());
    apply_cors(&shared.config, Response::builder())
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(catalogue))
        .expect("static response")
}

/// Map a JSON-RPC error code to its standard message.
pub(crate) fn jsonrpc_error_message(code: i32) -> &'static str {
    match code {
        -32700 => "Parse error",
        -32600 => "Invalid Request",
        -32601 => "Method not found",
        -32602 => "Invalid params",
        -32603 => "Internal error",
        -32099..=-32000 => "Server error",
        _ => "Unknown error",
    }
}

/// Render a JSON-RPC error envelope.
pub(crate) fn jsonrpc_error_body(id: serde_json::Value, code: i32) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": jsonrpc_error_message(code) }
    })
    .to_string()
}

/// HTTP status for a JSON-RPC error code.
pub(crate) fn status_for_code(code: i32) -> StatusCode {
    match code {
        -32600 | -32602 => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run the message handler and translate the outcome into an HTTP
/// response per the response policy.
async fn dispatch_jsonrpc(shared: &SseShared, body: Bytes) -> Response {
    let handler = shared.handler.lock().expect("handler lock poisoned").clone();
    let Some(handler) = handler else {
        return apply_cors(&shared.config, Response::builder())
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(jsonrpc_error_body(serde_json::Value::Null, -32603)))
            .expect("static response");
    };

    let reply = handler.on_message(body).await;
    let (status, payload) = match reply {
        Some(payload) => {
            // A handler returning an error envelope drives the status.
            let status = serde_json::from_slice::<serde_json::Value>(&payload)
                .ok()
                .and_then(|v| v.get("error")?.get("code")?.as_i64())
                .map(|code| status_for_code(code as i32))
                .unwrap_or(StatusCode::OK);
            (status, payload)
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::from(jsonrpc_error_body(serde_json::Value::Null, -32603)),
        ),
    };

    apply_cors(&shared.config, Response::builder())
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, payload.len().to_string())
        .body(Body::from(payload))
        .expect("response build")
}

/// Translate `?name=<tool>&param_<k>=<v>` into a `call_tool` envelope.
fn envelope_from_query(query: &str) -> Result<String> {
    let mut name: Option<String> = None;
    let mut arguments = serde_json::Map::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "name" {
            name = Some(value.into_owned());
        } else if let Some(arg) = key.strip_prefix("param_") {
            arguments.insert(
                arg.to_string(),
                serde_json::Value::String(value.into_owned()),
            );
        }
    }

    let name =
        name.ok_or_else(|| TransportError::InvalidArg("missing tool name".into()))?;
    Ok(serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "call_tool",
        "params": { "name": name, "arguments": arguments }
    })
    .to_string())
}

async fn call_tool_get(
    State(shared): State<Arc<SseShared>>,
    RawQuery(query): RawQuery,
) -> Response {
    let envelope = match envelope_from_query(query.as_deref().unwrap_or("")) {
        Ok(envelope) => envelope,
        Err(_) => {
            return apply_cors(&shared.config, Response::builder())
                .status(StatusCode::BAD_REQUEST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(jsonrpc_error_body(serde_json::Value::Null, -32600)))
                .expect("static response");
        }
    };
    dispatch_jsonrpc(&shared, Bytes::from(envelope)).await
}

async fn call_tool_post(State(shared): State<Arc<SseShared>>, body: Bytes) -> Response {
    dispatch_jsonrpc(&shared, body).await
}

async fn call_tool_options(State(shared): State<Arc<SseShared>>) -> Response {
    apply_cors(&shared.config, Response::builder())
        .status(StatusCode::OK)
        .body(Body::empty())
        .expect("static response")
}

#[derive(serde::Deserialize)]
struct PublishBody {
    #[serde(rename = "type")]
    event_type: Option<String>,
    data: String,
    session_id: Option<String>,
}

async fn events_publish(State(shared): State<Arc<SseShared>>, body: Bytes) -> Response {
    let parsed: PublishBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return apply_cors(&shared.config, Response::builder())
                .status(StatusCode::BAD_REQUEST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(jsonrpc_error_body(serde_json::Value::Null, -32700)))
                .expect("static response");
        }
    };

    match publish_on(
        &shared,
        parsed.event_type.as_deref(),
        &parsed.data,
        parsed.session_id.as_deref(),
    ) {
        Ok(event) => apply_cors(&shared.config, Response::builder())
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"id":"{}"}}"#, event.id)))
            .expect("response build"),
        Err(_) => apply_cors(&shared.config, Response::builder())
            .status(StatusCode::BAD_REQUEST)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(jsonrpc_error_body(serde_json::Value::Null, -32602)))
            .expect("static response"),
    }
}

async fn events_stream(
    State(shared): State<Arc<SseShared>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let mut session_id: Option<String> = None;
    let mut filter: Option<String> = None;
    if let Some(query) = &query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "session_id" => session_id = Some(value.into_owned()),
                "filter" => filter = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    if let Some(session) = &session_id {
        if !text::is_visible_ascii(session) {
            return apply_cors(&shared.config, Response::builder())
                .status(StatusCode::BAD_REQUEST)
                .body(Body::from("invalid session_id"))
                .expect("static response");
        }
    }

    // Resume point: malformed ids are ignored rather than rejected.
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .filter(|id| text::is_valid_event_id(id))
        .map(str::to_string);

    let (tx, rx) = mpsc::unbounded_channel::<String>();

    // Replay strictly after the resume point, honouring the filter.
    for event in shared.store.replay_after(last_event_id.as_deref()) {
        if let Some(filter) = &filter {
            match &event.event_type {
                Some(event_type) if event_type == filter => {}
                _ => continue,
            }
        }
        let _ = tx.send(render_event(&event));
    }

    shared.registry.register(tx, filter, session_id);

    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, std::convert::Infallible>(frame));
    apply_cors(&shared.config, Response::builder())
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("response build")
}

async fn static_fallback(
    State(shared): State<Arc<SseShared>>,
    method: Method,
    uri: axum::http::Uri,
) -> Response {
    let not_found = || {
        apply_cors(&shared.config, Response::builder())
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("static response")
    };

    if method != Method::GET {
        return not_found();
    }
    let Some(root) = &shared.config.doc_root else {
        return not_found();
    };

    // Path traversal is rejected outright.
    let rel = uri.path().trim_start_matches('/');
    if rel.is_empty() || rel.split('/').any(|seg| seg == "..") {
        return not_found();
    }

    let path = std::path::Path::new(root).join(rel);
    match tokio::fs::read(&path).await {
        Ok(contents) => apply_cors(&shared.config, Response::builder())
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(contents))
            .expect("response build"),
        Err(_) => not_found(),
    }
}
