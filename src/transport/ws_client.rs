//! WebSocket client transport
//!
//! A single event task owns the socket: it services inbound frames,
//! drains the outgoing queue, emits pings, and drives reconnection. The
//! public surface stays uniform with the other carriers: `send` queues a
//! frame, `receive` blocks for the reply correlated to the most recent
//! request id, and `request` composes the two.
//!
//! # Synchronous request/response
//!
//! `send` extracts the JSON-RPC `"id"` from the payload and arms the
//! sync-response slot before any bytes leave the process, so the reply
//! cannot race the waiter. A timed-out request leaves the slot armed with
//! its `timed_out` flag set: when the late reply eventually arrives it is
//! recognized by id and swallowed instead of surfacing as stray traffic
//! to the next request.
//!
//! # Reconnection
//!
//! Bounded attempts with exponential backoff: base 2 s, growing 1.5x to a
//! 60 s ceiling, +/-20 % jitter, reset after 60 s of quiet. Reconnects
//! are driven purely by state transitions; missed pongs log and reset
//! their counter but never force a reconnect themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::config::WsClientConfig;
use crate::error::{Result, TransportError};
use crate::frame::strip_length_prefix;
use crate::net::Shutdown;
use crate::text;
use crate::transport::{Carrier, MessageHandler, Role, Transport};

/// Initial reconnect delay.
const BASE_BACKOFF: Duration = Duration::from_millis(2_000);
/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_millis(60_000);
/// Quiet span after which the backoff schedule resets to base.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);
/// Event task housekeeping tick (activity and ping checks).
const SERVICE_TICK: Duration = Duration::from_secs(1);
/// Chunked wait used by `wait_for_connection`.
const CONNECT_WAIT_CHUNK: Duration = Duration::from_millis(50);
/// Initial chunk of the sync-response wait.
const RESPONSE_WAIT_MIN: Duration = Duration::from_millis(10);
/// Ceiling chunk of the sync-response wait.
const RESPONSE_WAIT_MAX: Duration = Duration::from_millis(250);
/// Consecutive missed pongs tolerated before the counter resets.
const MAX_MISSED_PONGS: u32 = 3;

/// Connection lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No socket; reconnect may be pending.
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Socket is live.
    Connected,
    /// Local stop in progress.
    Closing,
    /// Handshake failed; reconnect may be pending.
    Error,
}

/// Where an outgoing message was staged.
enum SendBuffer {
    /// The per-client reusable small buffer.
    Reusable(BytesMut),
    /// A slot borrowed from the buffer pool.
    Pooled(BytesMut),
    /// Plain heap allocation (pool exhausted or message too large).
    Heap(BytesMut),
}

impl SendBuffer {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Reusable(b) | Self::Pooled(b) | Self::Heap(b) => b,
        }
    }
}

/// Counters for the send staging strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendStats {
    /// Messages staged in the reusable small buffer.
    pub reusable_hits: u64,
    /// Messages staged in a pool slot.
    pub pool_hits: u64,
    /// Messages staged on the heap.
    pub heap_allocs: u64,
    /// Messages that passed the 8-byte-stride ASCII fast path.
    pub ascii_fast_paths: u64,
    /// Messages that required full UTF-8 validation.
    pub utf8_validations: u64,
}

#[derive(Default)]
struct SendCounters {
    reusable_hits: AtomicU64,
    pool_hits: AtomicU64,
    heap_allocs: AtomicU64,
    ascii_fast_paths: AtomicU64,
    utf8_validations: AtomicU64,
}

/// Sync-response slot guarded by the response mutex.
struct SyncSlot {
    active: bool,
    request_id: Option<i64>,
    timed_out: bool,
    response: Option<bytes::Bytes>,
}

struct ClientShared {
    config: WsClientConfig,
    state_tx: watch::Sender<ClientState>,
    sync: StdMutex<SyncSlot>,
    response_ready: Notify,
    out_tx: StdMutex<Option<mpsc::UnboundedSender<SendBuffer>>>,
    handler: StdMutex<Option<Arc<dyn MessageHandler>>>,
    send_pool: BufferPool,
    small_buf: StdMutex<Option<BytesMut>>,
    counters: SendCounters,
    reconnect_kick: Notify,
    shutdown: StdMutex<Shutdown>,
}

impl ClientShared {
    fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_replace(state);
    }

    fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.lock().expect("shutdown lock poisoned").clone()
    }

    /// Stage `data` per the three-way allocation strategy.
    fn stage(&self, data: &[u8]) -> SendBuffer {
        if data.len() <= self.config.small_send_threshold {
            let taken = self.small_buf.lock().expect("send buffer lock poisoned").take();
            if let Some(mut buf) = taken {
                buf.clear();
                buf.extend_from_slice(data);
                self.counters.reusable_hits.fetch_add(1, Ordering::Relaxed);
                return SendBuffer::Reusable(buf);
            }
        }
        if data.len() <= self.send_pool.slot_size() {
            if let Some(mut buf) = self.send_pool.acquire() {
                buf.extend_from_slice(data);
                self.counters.pool_hits.fetch_add(1, Ordering::Relaxed);
                return SendBuffer::Pooled(buf);
            }
        }
        self.counters.heap_allocs.fetch_add(1, Ordering::Relaxed);
        SendBuffer::Heap(BytesMut::from(data))
    }

    /// The single free path for every staging choice.
    fn recycle(&self, buffer: SendBuffer) {
        match buffer {
            SendBuffer::Reusable(buf) => {
                *self.small_buf.lock().expect("send buffer lock poisoned") = Some(buf);
            }
            SendBuffer::Pooled(buf) => self.send_pool.release(buf),
            SendBuffer::Heap(_) => {}
        }
    }

    /// Convert staged bytes to a WebSocket message, validating UTF-8 only
    /// when the ASCII fast path sees a high bit.
    fn to_message(&self, data: &[u8]) -> Message {
        if text::is_ascii_fast(data) {
            self.counters.ascii_fast_paths.fetch_add(1, Ordering::Relaxed);
            // ASCII is UTF-8 by construction.
            return Message::Text(String::from_utf8_lossy(data).into_owned());
        }
        self.counters.utf8_validations.fetch_add(1, Ordering::Relaxed);
        match std::str::from_utf8(data) {
            Ok(s) => Message::Text(s.to_string()),
            Err(_) => Message::Binary(data.to_vec()),
        }
    }

    /// Route one complete inbound frame through the sync-response slot.
    ///
    /// In sync-mode the frame lands in the response slot (or is swallowed
    /// as a recognized late reply) and `Consumed` is returned; outside
    /// sync-mode the payload is handed back for async delivery. The lock
    /// is held only for the routing decision, never during I/O.
    fn route_inbound(&self, raw: &[u8]) -> Inbound {
        let payload = strip_length_prefix(raw);

        let mut sync = self.sync.lock().expect("response lock poisoned");
        if sync.active {
            if sync.timed_out {
                let reply_id = extract_request_id(payload);
                if reply_id.is_some() && reply_id == sync.request_id {
                    debug!(id = ?reply_id, "late reply for timed-out request discarded");
                    sync.active = false;
                    sync.timed_out = false;
                    sync.request_id = None;
                } else {
                    debug!("stray frame while awaiting late reply, discarded");
                }
                return Inbound::Consumed;
            }
            // A reply carrying a different id than the armed request is a
            // late straggler from an earlier exchange; it must never be
            // handed to the current waiter.
            let reply_id = extract_request_id(payload);
            if reply_id.is_some() && reply_id != sync.request_id {
                debug!(id = ?reply_id, "reply id does not match pending request, discarded");
                return Inbound::Consumed;
            }
            sync.response = Some(bytes::Bytes::copy_from_slice(payload));
            drop(sync);
            self.response_ready.notify_waiters();
            return Inbound::Consumed;
        }
        drop(sync);

        Inbound::Deliver(bytes::Bytes::copy_from_slice(payload))
    }
}

/// Routing decision for one inbound frame.
enum Inbound {
    /// Taken by the sync-response slot (or swallowed as a late reply).
    Consumed,
    /// Deliver to the async message handler.
    Deliver(bytes::Bytes),
}

/// WebSocket client with reconnect, ping liveness and sync-response
/// correlation.
pub struct WsClientTransport {
    shared: Arc<ClientShared>,
    running: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsClientTransport {
    /// Construct a stopped client.
    pub fn new(config: WsClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        let send_pool = BufferPool::new(config.buffer_pool_size, {
            // Pool slots hold anything up to 4x the small threshold.
            config.small_send_threshold * 4
        });
        let small = BytesMut::with_capacity(config.small_send_threshold);
        Self {
            shared: Arc::new(ClientShared {
                config,
                state_tx,
                sync: StdMutex::new(SyncSlot {
                    active: false,
                    request_id: None,
                    timed_out: false,
                    response: None,
                }),
                response_ready: Notify::new(),
                out_tx: StdMutex::new(None),
                handler: StdMutex::new(None),
                send_pool,
                small_buf: StdMutex::new(Some(small)),
                counters: SendCounters::default(),
                reconnect_kick: Notify::new(),
                shutdown: StdMutex::new(Shutdown::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Snapshot the send staging counters.
    pub fn send_stats(&self) -> SendStats {
        let c = &self.shared.counters;
        SendStats {
            reusable_hits: c.reusable_hits.load(Ordering::Relaxed),
            pool_hits: c.pool_hits.load(Ordering::Relaxed),
            heap_allocs: c.heap_allocs.load(Ordering::Relaxed),
            ascii_fast_paths: c.ascii_fast_paths.load(Ordering::Relaxed),
            utf8_validations: c.utf8_validations.load(Ordering::Relaxed),
        }
    }

    /// Block until the client reaches `Connected`.
    ///
    /// Waits in short chunks; a lingering `Disconnected`/`Error` state
    /// kicks the event task into another connect attempt.
    pub async fn wait_for_connection(&self, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1));
        loop {
            match self.shared.state() {
                ClientState::Connected => return Ok(()),
                ClientState::Closing => return Err(TransportError::NotRunning.into()),
                ClientState::Disconnected | ClientState::Error => {
                    self.shared.reconnect_kick.notify_one();
                }
                ClientState::Connecting => {}
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout("websocket connect".into()).into());
            }
            tokio::time::sleep(CONNECT_WAIT_CHUNK).await;
        }
    }

    /// One synchronous request/response exchange.
    ///
    /// Equivalent to `send` followed by `receive(timeout_ms)`.
    pub async fn request(&self, payload: &[u8], timeout_ms: u64) -> Result<bytes::Bytes> {
        self.send(payload).await?;
        self.receive(timeout_ms).await
    }

    async fn event_loop(shared: Arc<ClientShared>, mut out_rx: mpsc::UnboundedReceiver<SendBuffer>) {
        let shutdown = shared.shutdown_handle();
        let mut attempts = 0u32;
        let mut backoff = BASE_BACKOFF;
        let mut last_attempt: Option<Instant> = None;

        loop {
            if shutdown.is_triggered() {
                break;
            }

            // Backoff schedule: reset after a quiet minute, otherwise
            // grow 1.5x toward the ceiling with +/-20 % jitter.
            if let Some(last) = last_attempt {
                backoff = if last.elapsed() >= BACKOFF_RESET_AFTER {
                    attempts = 0;
                    BASE_BACKOFF
                } else {
                    next_backoff(backoff)
                };
                let delay = apply_jitter(backoff);
                debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            last_attempt = Some(Instant::now());
            attempts += 1;
            if attempts > shared.config.max_reconnect_attempts {
                warn!(attempts, "reconnect attempts exhausted");
                shared.set_state(ClientState::Error);
                // Stay parked until a caller kicks another round.
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = shared.reconnect_kick.notified() => {
                        attempts = 0;
                        backoff = BASE_BACKOFF;
                        continue;
                    }
                }
            }

            shared.set_state(ClientState::Connecting);
            let request = match build_request(&shared.config) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "invalid websocket endpoint configuration");
                    shared.set_state(ClientState::Error);
                    break;
                }
            };
            let endpoint = request.uri().clone();

            match tokio_tungstenite::connect_async(request).await {
                Ok((ws, _resp)) => {
                    info!(endpoint = %endpoint, "websocket connected");
                    shared.set_state(ClientState::Connected);
                    attempts = 0;
                    backoff = BASE_BACKOFF;
                    Self::serve(&shared, ws, &mut out_rx, &shutdown).await;
                    if shutdown.is_triggered() {
                        break;
                    }
                    shared.set_state(ClientState::Disconnected);
                }
                Err(e) => {
                    warn!(error = %e, "websocket handshake failed");
                    shared.set_state(ClientState::Error);
                }
            }

            if !shared.config.reconnect_enabled {
                // Park until a caller explicitly kicks a reconnect.
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = shared.reconnect_kick.notified() => {}
                }
            }
        }

        shared.set_state(ClientState::Closing);
        debug!("websocket event task stopped");
        shared.set_state(ClientState::Disconnected);
    }

    /// Service one live connection until it drops or shutdown fires.
    async fn serve(
        shared: &Arc<ClientShared>,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        out_rx: &mut mpsc::UnboundedReceiver<SendBuffer>,
        shutdown: &Shutdown,
    ) {
        let (mut sink, mut stream) = ws.split();
        let ping_interval = Duration::from_millis(shared.config.ping_interval_ms.max(1));
        let ping_timeout = Duration::from_millis(shared.config.ping_timeout_ms.max(1));

        let mut last_activity = Instant::now();
        let mut last_ping = Instant::now();
        let mut ping_in_flight = false;
        let mut missed_pongs = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }

                _ = tokio::time::sleep(SERVICE_TICK) => {
                    let sync_active = shared.sync.lock().expect("response lock poisoned").active;
                    if ping_in_flight && last_ping.elapsed() >= ping_timeout {
                        ping_in_flight = false;
                        missed_pongs += 1;
                        if missed_pongs >= MAX_MISSED_PONGS {
                            warn!(missed_pongs, "websocket peer unresponsive to pings");
                            missed_pongs = 0;
                        }
                    } else if !ping_in_flight
                        && !sync_active
                        && last_activity.elapsed() >= ping_interval
                    {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            return;
                        }
                        ping_in_flight = true;
                        last_ping = Instant::now();
                    }
                }

                buffer = out_rx.recv() => {
                    let Some(buffer) = buffer else { return };
                    let message = shared.to_message(buffer.bytes());
                    shared.recycle(buffer);
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "websocket send failed");
                        return;
                    }
                    last_activity = Instant::now();
                }

                frame = stream.next() => {
                    let Some(frame) = frame else { return };
                    last_activity = Instant::now();
                    match frame {
                        Ok(Message::Text(data)) => {
                            if Self::deliver(shared, data.as_bytes(), &mut sink).await.is_err() {
                                return;
                            }
                        }
                        Ok(Message::Binary(data)) => {
                            if Self::deliver(shared, &data, &mut sink).await.is_err() {
                                return;
                            }
                        }
                        Ok(Message::Pong(_)) => {
                            ping_in_flight = false;
                            missed_pongs = 0;
                        }
                        Ok(Message::Ping(payload)) => {
                            // The library queues the pong; sending any
                            // frame flushes it promptly.
                            let _ = payload;
                        }
                        Ok(Message::Close(_)) => {
                            debug!("websocket peer closed");
                            return;
                        }
                        Ok(Message::Frame(_)) => {}
                        Err(e) => {
                            let err = TransportError::Websocket(e.to_string());
                            let handler =
                                shared.handler.lock().expect("handler lock poisoned").clone();
                            if let Some(handler) = handler {
                                handler.on_transport_error(&err);
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Route one inbound frame and, outside sync-mode, run the handler
    /// and send back its optional reply.
    async fn deliver(
        shared: &Arc<ClientShared>,
        raw: &[u8],
        sink: &mut futures::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<TcpStream>>,
            Message,
        >,
    ) -> Result<()> {
        let payload = match shared.route_inbound(raw) {
            Inbound::Consumed => return Ok(()),
            Inbound::Deliver(payload) => payload,
        };

        let handler = shared.handler.lock().expect("handler lock poisoned").clone();
        let Some(handler) = handler else { return Ok(()) };

        if let Some(reply) = handler.on_message(payload).await {
            let buffer = shared.stage(&reply);
            let message = shared.to_message(buffer.bytes());
            shared.recycle(buffer);
            sink.send(message)
                .await
                .map_err(|e| TransportError::Websocket(e.to_string()))?;
        }
        Ok(())
    }
}

/// Build the upgrade request, attaching the configured `Origin` and
/// `Sec-WebSocket-Protocol` headers.
fn build_request(
    config: &WsClientConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let endpoint = config.endpoint()?;
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Config(format!("websocket request: {}", e)))?;

    if let Some(origin) = &config.origin {
        let value = origin
            .parse()
            .map_err(|_| TransportError::Config(format!("invalid origin header: {}", origin)))?;
        request.headers_mut().insert("Origin", value);
    }
    if let Some(protocol) = &config.protocol {
        let value = protocol.parse().map_err(|_| {
            TransportError::Config(format!("invalid protocol header: {}", protocol))
        })?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    Ok(request)
}

#[async_trait::async_trait]
impl Transport for WsClientTransport {
    fn role(&self) -> Role {
        Role::Client
    }

    fn carrier(&self) -> Carrier {
        Carrier::Ws
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
        *self.shared.shutdown.lock().expect("shutdown lock poisoned") = Shutdown::new();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.shared.out_tx.lock().expect("out queue lock poisoned") = Some(out_tx);

        let shared = Arc::clone(&self.shared);
        *running = Some(tokio::spawn(async move {
            Self::event_loop(shared, out_rx).await;
        }));
        Ok(())
    }

    async fn stop(&self) {
        let handle = { self.running.lock().await.take() };
        let Some(handle) = handle else { return };

        self.shared.set_state(ClientState::Closing);
        self.shared.shutdown_handle().trigger();
        self.shared.response_ready.notify_waiters();
        *self.shared.out_tx.lock().expect("out queue lock poisoned") = None;
        let _ = handle.await;
        info!("websocket client stopped");
    }

    /// Queue one message for the event task.
    ///
    /// When the payload carries a JSON-RPC `"id"`, the sync-response slot
    /// is armed before the bytes are queued so the reply cannot race a
    /// following `receive`.
    async fn send(&self, data: &[u8]) -> Result<()> {
        let tx = {
            let guard = self.shared.out_tx.lock().expect("out queue lock poisoned");
            guard.clone().ok_or(TransportError::NotRunning)?
        };

        if let Some(id) = extract_request_id(data) {
            let mut sync = self.shared.sync.lock().expect("response lock poisoned");
            sync.active = true;
            sync.request_id = Some(id);
            sync.timed_out = false;
            sync.response = None;
        }

        let buffer = self.shared.stage(data);
        tx.send(buffer)
            .map_err(|_| TransportError::NotRunning.into())
    }

    async fn sendv(&self, bufs: &[&[u8]]) -> Result<()> {
        let joined: Vec<u8> = bufs.concat();
        self.send(&joined).await
    }

    /// Wait for the response correlated to the last armed request id.
    ///
    /// The wait chunk starts at 10 ms and grows 1.5x to 250 ms. On
    /// timeout the slot's `timed_out` flag is set and sync-mode stays
    /// armed so the late reply can be recognized and swallowed.
    async fn receive(&self, timeout_ms: u64) -> Result<bytes::Bytes> {
        {
            let sync = self.shared.sync.lock().expect("response lock poisoned");
            if !sync.active {
                return Err(TransportError::InvalidArg(
                    "receive without a pending request".into(),
                )
                .into());
            }
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1));
        let mut chunk = RESPONSE_WAIT_MIN;
        loop {
            {
                let mut sync = self.shared.sync.lock().expect("response lock poisoned");
                if let Some(response) = sync.response.take() {
                    sync.active = false;
                    sync.request_id = None;
                    sync.timed_out = false;
                    return Ok(response);
                }
            }
            if self.shared.shutdown_handle().is_triggered() {
                return Err(TransportError::Cancelled.into());
            }
            if Instant::now() >= deadline {
                let mut sync = self.shared.sync.lock().expect("response lock poisoned");
                sync.timed_out = true;
                return Err(TransportError::Timeout("websocket request".into()).into());
            }

            tokio::select! {
                _ = self.shared.response_ready.notified() => {}
                _ = tokio::time::sleep(chunk) => {}
            }
            chunk = (chunk + chunk / 2).min(RESPONSE_WAIT_MAX);
        }
    }
}

impl Drop for WsClientTransport {
    /// Best-effort teardown when dropped while running; `stop` remains
    /// the orderly path.
    fn drop(&mut self) {
        self.shared.shutdown_handle().trigger();
        self.shared.response_ready.notify_waiters();
    }
}

/// Extract the integer after `"id":` in a JSON-RPC payload.
///
/// A full JSON parse is unnecessary on this hot path; the id field as
/// produced by our peers is always an unquoted integer.
fn extract_request_id(payload: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(payload).ok()?;
    let pos = text.find("\"id\"")?;
    let rest = text[pos + 4..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Grow the backoff 1.5x toward the ceiling.
fn next_backoff(prev: Duration) -> Duration {
    (prev + prev / 2).min(MAX_BACKOFF)
}

/// Apply +/-20 % uniform jitter.
fn apply_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..=1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::handler_fn;

    #[test]
    fn test_extract_request_id_variants() {
        assert_eq!(extract_request_id(br#"{"id":7,"method":"x"}"#), Some(7));
        assert_eq!(extract_request_id(br#"{"id": 42}"#), Some(42));
        assert_eq!(extract_request_id(br#"{"id":-3}"#), Some(-3));
        assert_eq!(extract_request_id(br#"{"method":"notify"}"#), None);
        assert_eq!(extract_request_id(&[0xFF, 0xFE]), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut d = BASE_BACKOFF;
        d = next_backoff(d);
        assert_eq!(d, Duration::from_millis(3_000));
        for _ in 0..20 {
            d = next_backoff(d);
        }
        assert_eq!(d, MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_within_20_percent() {
        for _ in 0..100 {
            let d = apply_jitter(Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(800));
            assert!(d <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn test_stage_small_message_uses_reusable_buffer() {
        let client = WsClientTransport::new(WsClientConfig::new("localhost", 1));
        let buffer = client.shared.stage(b"small");
        assert!(matches!(buffer, SendBuffer::Reusable(_)));
        client.shared.recycle(buffer);
        assert_eq!(client.send_stats().reusable_hits, 1);

        // The reusable buffer is back; a second small stage reuses it.
        let again = client.shared.stage(b"again");
        assert!(matches!(again, SendBuffer::Reusable(_)));
        assert_eq!(client.send_stats().reusable_hits, 2);
    }

    #[test]
    fn test_stage_medium_message_uses_pool_then_heap() {
        let mut config = WsClientConfig::new("localhost", 1);
        config.small_send_threshold = 8;
        config.buffer_pool_size = 1;
        let client = WsClientTransport::new(config);

        let medium = vec![b'x'; 16];
        let first = client.shared.stage(&medium);
        assert!(matches!(first, SendBuffer::Pooled(_)));

        // Pool slot is out; the next medium message goes to the heap.
        let second = client.shared.stage(&medium);
        assert!(matches!(second, SendBuffer::Heap(_)));
        client.shared.recycle(first);
        client.shared.recycle(second);

        let stats = client.send_stats();
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.heap_allocs, 1);
    }

    #[test]
    fn test_sync_response_delivery() {
        let client = WsClientTransport::new(WsClientConfig::new("localhost", 1));
        {
            let mut sync = client.shared.sync.lock().unwrap();
            sync.active = true;
            sync.request_id = Some(1);
        }
        let _ = client.shared.route_inbound(br#"{"id":1,"result":"ok"}"#);
        let sync = client.shared.sync.lock().unwrap();
        assert_eq!(sync.response.as_deref(), Some(&br#"{"id":1,"result":"ok"}"#[..]));
    }

    #[test]
    fn test_late_reply_is_swallowed_and_exits_sync_mode() {
        let client = WsClientTransport::new(WsClientConfig::new("localhost", 1));
        {
            let mut sync = client.shared.sync.lock().unwrap();
            sync.active = true;
            sync.request_id = Some(7);
            sync.timed_out = true;
        }

        let _ = client.shared.route_inbound(br#"{"id":7,"result":"late"}"#);

        let sync = client.shared.sync.lock().unwrap();
        assert!(!sync.active, "matching late reply exits sync mode");
        assert!(sync.response.is_none(), "late reply is discarded");
    }

    #[test]
    fn test_stray_frame_keeps_sync_mode_armed() {
        let client = WsClientTransport::new(WsClientConfig::new("localhost", 1));
        {
            let mut sync = client.shared.sync.lock().unwrap();
            sync.active = true;
            sync.request_id = Some(7);
            sync.timed_out = true;
        }

        let _ = client.shared.route_inbound(br#"{"id":9,"result":"other"}"#);

        let sync = client.shared.sync.lock().unwrap();
        assert!(sync.active, "stray frames do not clear the armed slot");
        assert!(sync.timed_out);
    }

    #[test]
    fn test_inbound_length_prefix_is_stripped() {
        let client = WsClientTransport::new(WsClientConfig::new("localhost", 1));
        {
            let mut sync = client.shared.sync.lock().unwrap();
            sync.active = true;
            sync.request_id = Some(1);
        }

        let inner = br#"{"id":1}"#;
        let mut framed = Vec::from(&(inner.len() as u32).to_be_bytes()[..]);
        framed.extend_from_slice(inner);
        let _ = client.shared.route_inbound(&framed);

        let sync = client.shared.sync.lock().unwrap();
        assert_eq!(sync.response.as_deref(), Some(&inner[..]));
    }

    async fn echo_ws_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
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

    #[tokio::test]
    async fn test_request_response_over_real_socket() {
        let port = echo_ws_server().await;
        let client = WsClientTransport::new(WsClientConfig::new("127.0.0.1", port));
        client.start(handler_fn(|_| None)).await.unwrap();
        client.wait_for_connection(5_000).await.unwrap();

        let reply = client
            .request(br#"{"id":1,"method":"echo"}"#, 5_000)
            .await
            .unwrap();
        assert_eq!(&reply[..], br#"{"id":1,"method":"echo"}"#);

        client.stop().await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_state() {
        // A port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = WsClientConfig::new("127.0.0.1", port);
        config.reconnect_enabled = false;
        let client = WsClientTransport::new(config);
        client.start(handler_fn(|_| None)).await.unwrap();

        let err = client.wait_for_connection(500).await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::Timeout(_))
        ));
        client.stop().await;
    }
}
