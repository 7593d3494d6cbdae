//! WebSocket server transport
//!
//! Client slots live in a fixed table whose occupancy is a bitmap, one
//! bit per slot packed 32 to a word, so the liveness and cleanup passes
//! scan a handful of words instead of walking every entry. A connection
//! that arrives with the table full is dropped before the upgrade
//! handshake.
//!
//! Liveness is ping-driven: a client silent past `ping_timeout_ms` is
//! pinged on each scan, and after `max_missed_pongs` unanswered pings the
//! connection is closed. A periodic cleanup pass releases slots stuck in
//! `Closing`/`Error` for five seconds, returning their receive buffer to
//! the pool when the size still matches.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::buffer::{round_to_slot, BufferPool};
use crate::config::WsServerConfig;
use crate::error::{Result, TransportError};
use crate::net::Shutdown;
use crate::transport::{Carrier, MessageHandler, Role, Transport};

/// Slots stuck in Closing/Error are reaped after this long.
const DEAD_SLOT_GRACE: Duration = Duration::from_secs(5);

/// Per-slot lifecycle while the occupancy bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Active,
    Closing,
    Error,
}

/// Control messages from the liveness/cleanup tasks to a connection.
enum Control {
    Ping,
    Close,
}

struct ClientSlot {
    state: SlotState,
    last_activity: Instant,
    pings_sent: u32,
    control: Option<mpsc::UnboundedSender<Control>>,
    recv_buf: Option<BytesMut>,
}

impl ClientSlot {
    fn empty() -> Self {
        Self {
            state: SlotState::Active,
            last_activity: Instant::now(),
            pings_sent: 0,
            control: None,
            recv_buf: None,
        }
    }
}

/// Fixed client table with bitmap occupancy.
struct ClientTable {
    words: Vec<AtomicU32>,
    slots: Vec<StdMutex<ClientSlot>>,
    capacity: usize,
}

impl ClientTable {
    fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(32)).map(|_| AtomicU32::new(0)).collect();
        let slots = (0..capacity).map(|_| StdMutex::new(ClientSlot::empty())).collect();
        Self {
            words,
            slots,
            capacity,
        }
    }

    /// Claim a free slot via a word-wise scan; `None` when full.
    fn claim(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Acquire);
                let free = (!current).trailing_zeros() as usize;
                if free >= 32 {
                    break; // word full, next word
                }
                let idx = w * 32 + free;
                if idx >= self.capacity {
                    break;
                }
                let bit = 1u32 << free;
                if word
                    .compare_exchange(current, current | bit, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Clear the occupancy bit for `idx`.
    fn release(&self, idx: usize) {
        let bit = 1u32 << (idx % 32);
        self.words[idx / 32].fetch_and(!bit, Ordering::AcqRel);
    }

    fn is_occupied(&self, idx: usize) -> bool {
        let bit = 1u32 << (idx % 32);
        self.words[idx / 32].load(Ordering::Acquire) & bit != 0
    }

    fn occupied_count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    fn with_slot<R>(&self, idx: usize, f: impl FnOnce(&mut ClientSlot) -> R) -> R {
        let mut slot = self.slots[idx].lock().expect("client slot lock poisoned");
        f(&mut slot)
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
    rejected: AtomicU64,
}

/// Snapshot of the server counters.
#[derive(Debug, Clone, Copy)]
pub struct WsServerStats {
    /// Connections upgraded over the transport lifetime.
    pub total_connections: u64,
    /// Currently connected clients.
    pub active_connections: usize,
    /// High-water mark of connected clients.
    pub peak_connections: usize,
    /// Connections dropped with the table full.
    pub rejected_connections: u64,
}

struct Running {
    shutdown: Shutdown,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// WebSocket server with a bitmap slot table and ping liveness.
pub struct WsServerTransport {
    config: WsServerConfig,
    table: Arc<ClientTable>,
    counters: Arc<Counters>,
    pool: Arc<BufferPool>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl WsServerTransport {
    /// Construct a stopped transport; `start` binds the listener.
    pub fn new(config: WsServerConfig) -> Self {
        let table = Arc::new(ClientTable::new(config.max_clients));
        let pool = Arc::new(BufferPool::new(
            config.buffer_pool_size,
            config.buffer_slot_size,
        ));
        Self {
            config,
            table,
            counters: Arc::new(Counters::default()),
            pool,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// The bound address, available while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Snapshot the server counters.
    pub fn stats(&self) -> WsServerStats {
        WsServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            peak_connections: self.counters.peak.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        table: Arc<ClientTable>,
        counters: Arc<Counters>,
        pool: Arc<BufferPool>,
        handler: Arc<dyn MessageHandler>,
        config: WsServerConfig,
        shutdown: Shutdown,
        tracker: TaskTracker,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "ws accept failed");
                    continue;
                }
            };

            let Some(idx) = table.claim() else {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(%peer, "ws client table full, connection dropped");
                continue; // stream drops before the upgrade handshake
            };

            counters.total.fetch_add(1, Ordering::Relaxed);
            let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
            counters.peak.fetch_max(active, Ordering::Relaxed);

            let table_for_conn = Arc::clone(&table);
            let counters_for_conn = Arc::clone(&counters);
            let pool_for_conn = Arc::clone(&pool);
            let handler_for_conn = Arc::clone(&handler);
            let shutdown_for_conn = shutdown.clone();
            tracker.spawn(async move {
                Self::connection_loop(
                    stream,
                    idx,
                    table_for_conn,
                    pool_for_conn,
                    handler_for_conn,
                    shutdown_for_conn,
                )
                .await;
                counters_for_conn.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
        debug!("ws acceptor stopped");
    }

    async fn connection_loop(
        stream: TcpStream,
        idx: usize,
        table: Arc<ClientTable>,
        pool: Arc<BufferPool>,
        handler: Arc<dyn MessageHandler>,
        shutdown: Shutdown,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(error = %e, "ws handshake failed");
                table.release(idx);
                return;
            }
        };

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        table.with_slot(idx, |slot| {
            *slot = ClientSlot::empty();
            slot.control = Some(control_tx);
            slot.recv_buf = pool.acquire();
        });

        let (mut sink, mut source) = ws.split();
        let slot_size = pool.slot_size();

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                control = control_rx.recv() => {
                    match control {
                        Some(Control::Ping) => {
                            if sink.send(Message::Ping(Vec::new())).await.is_err() {
                                table.with_slot(idx, |s| s.state = SlotState::Error);
                                break;
                            }
                        }
                        Some(Control::Close) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            table.with_slot(idx, |s| s.state = SlotState::Closing);
                            break;
                        }
                    }
                }

                frame = source.next() => {
                    let Some(frame) = frame else {
                        table.with_slot(idx, |s| s.state = SlotState::Closing);
                        break;
                    };
                    match frame {
                        Ok(Message::Text(data)) => {
                            let payload = Self::buffer_payload(
                                &table, idx, slot_size, data.as_bytes(),
                            );
                            if let Some(reply) = handler.on_message(payload).await {
                                let message = match std::str::from_utf8(&reply) {
                                    Ok(s) => Message::Text(s.to_string()),
                                    Err(_) => Message::Binary(reply.to_vec()),
                                };
                                if sink.send(message).await.is_err() {
                                    table.with_slot(idx, |s| s.state = SlotState::Error);
                                    break;
                                }
                            }
                        }
                        Ok(Message::Binary(data)) => {
                            let payload = Self::buffer_payload(&table, idx, slot_size, &data);
                            if let Some(reply) = handler.on_message(payload).await {
                                if sink.send(Message::Binary(reply.to_vec())).await.is_err() {
                                    table.with_slot(idx, |s| s.state = SlotState::Error);
                                    break;
                                }
                            }
                        }
                        Ok(Message::Pong(_)) => {
                            table.with_slot(idx, |slot| {
                                slot.last_activity = Instant::now();
                                slot.pings_sent = 0;
                            });
                        }
                        Ok(Message::Ping(_)) => {
                            table.with_slot(idx, |slot| slot.last_activity = Instant::now());
                        }
                        Ok(Message::Close(_)) => {
                            table.with_slot(idx, |s| s.state = SlotState::Closing);
                            break;
                        }
                        Ok(Message::Frame(_)) => {}
                        Err(e) => {
                            debug!(error = %e, "ws read failed");
                            table.with_slot(idx, |s| s.state = SlotState::Error);
                            break;
                        }
                    }
                }
            }
        }

        // Immediate release: return the receive buffer and clear the bit.
        let buf = table.with_slot(idx, |slot| {
            slot.control = None;
            slot.recv_buf.take()
        });
        if let Some(buf) = buf {
            pool.release(buf);
        }
        table.release(idx);
    }

    /// Stage an inbound payload through the slot's growable receive
    /// buffer, then hand out an owned copy.
    ///
    /// Growth is 1.5x rounded up to the pool slot size so the buffer
    /// stays pool-eligible when the slot is released.
    fn buffer_payload(
        table: &ClientTable,
        idx: usize,
        slot_size: usize,
        data: &[u8],
    ) -> bytes::Bytes {
        table.with_slot(idx, |slot| {
            slot.last_activity = Instant::now();
            slot.pings_sent = 0;
            let buf = slot.recv_buf.get_or_insert_with(BytesMut::new);
            if buf.capacity() < data.len() {
                let target = round_to_slot(data.len() + data.len() / 2, slot_size);
                buf.reserve(target - buf.len());
            }
            buf.clear();
            buf.extend_from_slice(data);
            bytes::Bytes::copy_from_slice(buf)
        })
    }

    async fn liveness_loop(
        table: Arc<ClientTable>,
        config: WsServerConfig,
        shutdown: Shutdown,
    ) {
        let interval = Duration::from_millis(config.ping_interval_ms.max(1));
        let timeout = Duration::from_millis(config.ping_timeout_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let now = Instant::now();
            for idx in 0..table.capacity {
                if !table.is_occupied(idx) {
                    continue;
                }
                table.with_slot(idx, |slot| {
                    if slot.state != SlotState::Active {
                        return;
                    }
                    if now.duration_since(slot.last_activity) < timeout {
                        return;
                    }
                    if slot.pings_sent >= config.max_missed_pongs {
                        debug!(slot = idx, "ws client unresponsive, closing");
                        slot.state = SlotState::Closing;
                        if let Some(control) = &slot.control {
                            let _ = control.send(Control::Close);
                        }
                    } else if let Some(control) = &slot.control {
                        slot.pings_sent += 1;
                        let _ = control.send(Control::Ping);
                    }
                });
            }
        }
    }

    async fn cleanup_loop(table: Arc<ClientTable>, config: WsServerConfig, shutdown: Shutdown) {
        let interval = Duration::from_millis(config.cleanup_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let now = Instant::now();
            for idx in 0..table.capacity {
                if !table.is_occupied(idx) {
                    continue;
                }
                let reap = table.with_slot(idx, |slot| {
                    let dead = slot.state != SlotState::Active && slot.control.is_none();
                    dead && now.duration_since(slot.last_activity) >= DEAD_SLOT_GRACE
                });
                if reap {
                    debug!(slot = idx, "reaping dead ws slot");
                    table.release(idx);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for WsServerTransport {
    fn role(&self) -> Role {
        Role::Server
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

        let listener = TcpListener::bind(self.config.bind_addr())
            .await
            .map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let shutdown = Shutdown::new();
        let tracker = TaskTracker::new();

        tracker.spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.table),
            Arc::clone(&self.counters),
            Arc::clone(&self.pool),
            handler,
            self.config.clone(),
            shutdown.clone(),
            tracker.clone(),
        ));
        tracker.spawn(Self::liveness_loop(
            Arc::clone(&self.table),
            self.config.clone(),
            shutdown.clone(),
        ));
        tracker.spawn(Self::cleanup_loop(
            Arc::clone(&self.table),
            self.config.clone(),
            shutdown.clone(),
        ));

        *running = Some(Running {
            shutdown,
            tracker,
            local_addr,
        });
        info!(addr = %local_addr, "ws server started");
        Ok(())
    }

    async fn stop(&self) {
        let running = { self.running.lock().await.take() };
        let Some(running) = running else { return };

        running.shutdown.trigger();
        running.tracker.close();
        running.tracker.wait().await;
        info!("ws server stopped");
    }
}

impl Drop for WsServerTransport {
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
