//! Framed TCP server transport
//!
//! An acceptor task hands each connection to a per-connection handler,
//! bounded by a fixed slot table and a worker admission semaphore. Slots
//! move `Inactive -> Initializing -> Active -> Closing -> Inactive`; the
//! `Initializing` intermediate is claimed under the table lock, so a slot
//! can never be handed to two connections and a failed worker submission
//! reverts it without ever exposing a half-built entry.
//!
//! A cleanup task scans the table on `max(idle_timeout / 2, 30 s)` and
//! asks stale handlers to stop; each handler additionally enforces the
//! idle timeout on its own readable wait, honours its per-slot stop flag,
//! and tears down only its own slot on error. One bad connection never
//! affects the acceptor or its neighbours.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::TcpServerConfig;
use crate::error::{Result, TransportError};
use crate::frame;
use crate::net::{self, Readiness, Shutdown};
use crate::transport::{Carrier, MessageHandler, Role, Transport};

/// Acceptor wake quantum; shutdown is observed at least this often.
const ACCEPT_QUANTUM: Duration = Duration::from_secs(1);

/// Cleanup task wake quantum.
const CLEANUP_TICK: Duration = Duration::from_secs(1);

/// Lower bound on the idle-scan period.
const MIN_SCAN_PERIOD: Duration = Duration::from_secs(30);

/// Lifecycle of one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Inactive,
    Initializing,
    Active,
    Closing,
}

struct Slot {
    state: SlotState,
    peer: Option<SocketAddr>,
    connected_at: Option<Instant>,
    last_activity: Instant,
    messages: u64,
    stop: Option<Shutdown>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Inactive,
            peer: None,
            connected_at: None,
            last_activity: Instant::now(),
            messages: 0,
            stop: None,
        }
    }

    fn clear(&mut self) {
        self.state = SlotState::Inactive;
        self.peer = None;
        self.connected_at = None;
        self.messages = 0;
        self.stop = None;
    }
}

/// Fixed table of connection slots.
struct SlotTable {
    slots: Mutex<Vec<Slot>>,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(|_| Slot::new()).collect()),
        }
    }

    /// Claim an Inactive slot for `peer`, moving it to Initializing.
    fn claim(&self, peer: SocketAddr) -> Option<(usize, Shutdown)> {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        let idx = slots.iter().position(|s| s.state == SlotState::Inactive)?;
        let stop = Shutdown::new();
        let slot = &mut slots[idx];
        slot.state = SlotState::Initializing;
        slot.peer = Some(peer);
        slot.connected_at = Some(Instant::now());
        slot.last_activity = Instant::now();
        slot.messages = 0;
        slot.stop = Some(stop.clone());
        Some((idx, stop))
    }

    /// Promote Initializing -> Active after a successful worker submit.
    fn activate(&self, idx: usize) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        if slots[idx].state == SlotState::Initializing {
            slots[idx].state = SlotState::Active;
        }
    }

    /// Revert a failed claim back to Inactive.
    fn revert(&self, idx: usize) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        slots[idx].clear();
    }

    /// Active/Initializing -> Closing -> Inactive for a finished handler.
    fn close(&self, idx: usize) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        let slot = &mut slots[idx];
        if slot.state != SlotState::Inactive {
            slot.state = SlotState::Closing;
            slot.clear();
        }
    }

    fn touch(&self, idx: usize) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        slots[idx].last_activity = Instant::now();
    }

    fn bump_messages(&self, idx: usize) {
        let mut slots = self.slots.lock().expect("slot table lock poisoned");
        slots[idx].messages += 1;
    }

    fn occupied(&self) -> usize {
        let slots = self.slots.lock().expect("slot table lock poisoned");
        slots.iter().filter(|s| s.state != SlotState::Inactive).count()
    }

    /// Ask every handler whose slot idled past `idle_timeout` to stop.
    fn stop_stale(&self, idle_timeout: Duration) -> usize {
        let slots = self.slots.lock().expect("slot table lock poisoned");
        let now = Instant::now();
        let mut stopped = 0;
        for slot in slots.iter() {
            if slot.state == SlotState::Active
                && now.duration_since(slot.last_activity) > idle_timeout
            {
                if let Some(stop) = &slot.stop {
                    stop.trigger();
                    stopped += 1;
                }
            }
        }
        stopped
    }

    /// Stop every live handler (transport shutdown).
    fn stop_all(&self) {
        let slots = self.slots.lock().expect("slot table lock poisoned");
        for slot in slots.iter() {
            if let Some(stop) = &slot.stop {
                stop.trigger();
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
    rejected: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of the server counters.
#[derive(Debug, Clone, Copy)]
pub struct TcpServerStats {
    /// Connections accepted over the transport lifetime.
    pub total_connections: u64,
    /// Currently active connections.
    pub active_connections: usize,
    /// High-water mark of active connections.
    pub peak_connections: usize,
    /// Connections turned away with the table full.
    pub rejected_connections: u64,
    /// Messages received.
    pub messages_in: u64,
    /// Replies sent.
    pub messages_out: u64,
    /// Payload bytes received.
    pub bytes_in: u64,
    /// Payload bytes sent.
    pub bytes_out: u64,
    /// Connection-level errors observed.
    pub errors: u64,
    /// When `start` completed, if running.
    pub started_at: Option<Instant>,
}

struct Running {
    shutdown: Shutdown,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// TCP server transport: length-prefixed request/response over a bounded
/// slot table.
pub struct TcpServerTransport {
    config: TcpServerConfig,
    slots: Arc<SlotTable>,
    counters: Arc<Counters>,
    running: tokio::sync::Mutex<Option<Running>>,
    started_at: Mutex<Option<Instant>>,
}

impl TcpServerTransport {
    /// Construct a stopped transport; `start` binds the listener.
    pub fn new(config: TcpServerConfig) -> Self {
        let slots = Arc::new(SlotTable::new(config.max_clients));
        Self {
            config,
            slots,
            counters: Arc::new(Counters::default()),
            running: tokio::sync::Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    /// The bound address, available while running.
    ///
    /// Useful with `port: 0` configs, where the kernel picks the port.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Snapshot the server counters.
    pub fn stats(&self) -> TcpServerStats {
        TcpServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            peak_connections: self.counters.peak.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
            messages_in: self.counters.messages_in.load(Ordering::Relaxed),
            messages_out: self.counters.messages_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            started_at: *self.started_at.lock().expect("stats lock poisoned"),
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        slots: Arc<SlotTable>,
        counters: Arc<Counters>,
        workers: Arc<Semaphore>,
        handler: Arc<dyn MessageHandler>,
        config: TcpServerConfig,
        shutdown: Shutdown,
        tracker: TaskTracker,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(ACCEPT_QUANTUM) => continue,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            stream.set_nodelay(true).ok();

            let (idx, stop) = match slots.claim(peer) {
                Some(claimed) => claimed,
                None => {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, "slot table full, connection rejected");
                    continue; // stream drops here, closing the socket
                }
            };

            // Worker admission. A full pool is a failed submission: the
            // slot reverts and the socket closes.
            let permit = match Arc::clone(&workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    slots.revert(idx);
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(%peer, "worker pool full, connection dropped");
                    continue;
                }
            };

            counters.total.fetch_add(1, Ordering::Relaxed);
            let active = counters.active.fetch_add(1, Ordering::Relaxed) + 1;
            counters.peak.fetch_max(active, Ordering::Relaxed);

            let slots_for_conn = Arc::clone(&slots);
            let counters_for_conn = Arc::clone(&counters);
            let handler_for_conn = Arc::clone(&handler);
            let config_for_conn = config.clone();
            let transport_shutdown = shutdown.clone();
            tracker.spawn(async move {
                let _permit = permit;
                Self::connection_loop(
                    stream,
                    idx,
                    stop,
                    transport_shutdown,
                    slots_for_conn,
                    counters_for_conn,
                    handler_for_conn,
                    config_for_conn,
                )
                .await;
            });
            slots.activate(idx);
        }
        debug!("acceptor stopped");
    }

    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        mut stream: TcpStream,
        idx: usize,
        stop: Shutdown,
        transport_shutdown: Shutdown,
        slots: Arc<SlotTable>,
        counters: Arc<Counters>,
        handler: Arc<dyn MessageHandler>,
        config: TcpServerConfig,
    ) {
        loop {
            if transport_shutdown.is_triggered() || stop.is_triggered() {
                break;
            }

            match net::wait_readable(&stream, config.idle_timeout_ms, &stop).await {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::TimedOut) => {
                    debug!(slot = idx, "connection idle timeout");
                    break;
                }
                Ok(Readiness::Cancelled) => break,
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(kind) = crate::error::kind_of(&e) {
                        handler.on_transport_error(kind);
                    }
                    break;
                }
            }

            let payload =
                match frame::recv_framed(&mut stream, config.max_frame_len, &stop).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        match crate::error::kind_of(&e) {
                            Some(TransportError::ConnectionClosed)
                            | Some(TransportError::Cancelled) => {}
                            Some(kind) => {
                                counters.errors.fetch_add(1, Ordering::Relaxed);
                                handler.on_transport_error(kind);
                            }
                            None => {
                                counters.errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        break;
                    }
                };

            counters.messages_in.fetch_add(1, Ordering::Relaxed);
            counters
                .bytes_in
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            slots.touch(idx);

            if let Some(reply) = handler.on_message(payload).await {
                if let Err(e) =
                    frame::send_framed(&mut stream, &reply, config.max_frame_len, &stop).await
                {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(kind) = crate::error::kind_of(&e) {
                        if kind.is_connection_fatal() {
                            handler.on_transport_error(kind);
                        }
                    }
                    break;
                }
                counters.messages_out.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_out
                    .fetch_add(reply.len() as u64, Ordering::Relaxed);
            }
            slots.bump_messages(idx);
        }

        // This handler owns the slot's teardown: shutdown both halves,
        // then clear the entry.
        let _ = stream.into_std().map(|s| s.shutdown(std::net::Shutdown::Both));
        slots.close(idx);
        counters.active.fetch_sub(1, Ordering::Relaxed);
    }

    async fn cleanup_loop(
        slots: Arc<SlotTable>,
        idle_timeout: Duration,
        shutdown: Shutdown,
    ) {
        let scan_period = (idle_timeout / 2).max(MIN_SCAN_PERIOD);
        let mut last_scan = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(CLEANUP_TICK) => {}
            }
            if last_scan.elapsed() >= scan_period {
                last_scan = Instant::now();
                let stopped = slots.stop_stale(idle_timeout);
                if stopped > 0 {
                    debug!(stopped, "idle scan stopped stale connections");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpServerTransport {
    fn role(&self) -> Role {
        Role::Server
    }

    fn carrier(&self) -> Carrier {
        Carrier::Tcp
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
            .map_err(|e| {
                TransportError::Io(e)
            })?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let shutdown = Shutdown::new();
        let tracker = TaskTracker::new();
        let workers = Arc::new(Semaphore::new(self.config.workers));

        tracker.spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.slots),
            Arc::clone(&self.counters),
            workers,
            handler,
            self.config.clone(),
            shutdown.clone(),
            tracker.clone(),
        ));
        tracker.spawn(Self::cleanup_loop(
            Arc::clone(&self.slots),
            Duration::from_millis(self.config.idle_timeout_ms.max(1)),
            shutdown.clone(),
        ));

        *self.started_at.lock().expect("stats lock poisoned") = Some(Instant::now());
        *running = Some(Running {
            shutdown,
            tracker,
            local_addr,
        });
        info!(addr = %local_addr, "tcp server started");
        Ok(())
    }

    async fn stop(&self) {
        let running = { self.running.lock().await.take() };
        let Some(running) = running else {
            return;
        };

        running.shutdown.trigger();
        self.slots.stop_all();
        running.tracker.close();
        running.tracker.wait().await;
        *self.started_at.lock().expect("stats lock poisoned") = None;
        info!("tcp server stopped");
    }
}

impl Drop for TcpServerTransport {
    /// Best-effort teardown for transports dropped while running: the
    /// shutdown signal fires so background tasks exit on their next
    /// quantum. `stop` remains the orderly path.
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.shutdown.trigger();
                self.slots.stop_all();
            }
        }
    }
}
