//! Warm TCP connection pool for the pooled client carrier
//!
//! The pool keeps between `min` and `max` connections to one peer.
//! `get` prefers a validated idle connection, creates a new one below the
//! cap, and otherwise waits for a release. A background maintenance task
//! evicts idle connections beyond the idle timeout (never dropping below
//! `min`), health-probes the warm set, and re-warms after evictions while
//! the peer is reachable.
//!
//! Invariants: `in_use + idle <= max` at all times; every connection
//! handed out by `get` is returned exactly once through `release`; a
//! connection released invalid is closed, never re-pooled.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TcpPoolConfig;
use crate::error::{Result, TransportError};
use crate::net::Shutdown;

/// Hard age cap: even a busy connection is retired after this long.
const CONN_MAX_AGE: Duration = Duration::from_secs(600);

/// Cadence of the maintenance scan.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// One pooled connection, owned by the caller between `get` and
/// `release`.
#[derive(Debug)]
pub struct PooledConn {
    stream: TcpStream,
    created: Instant,
    last_used: Instant,
}

impl PooledConn {
    fn new(stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            stream,
            created: now,
            last_used: now,
        }
    }

    /// Mutable access to the underlying socket.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Shared access to the underlying socket.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

#[derive(Default)]
struct PoolCounters {
    created: u64,
    reused: u64,
    evicted_idle: u64,
    evicted_unhealthy: u64,
    get_timeouts: u64,
}

struct PoolInner {
    idle: Vec<PooledConn>,
    in_use: usize,
    counters: PoolCounters,
}

/// Snapshot of pool occupancy and counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Connections currently lent out.
    pub in_use: usize,
    /// Warm connections waiting in the pool.
    pub idle: usize,
    /// Connections opened over the pool lifetime.
    pub created: u64,
    /// `get` calls satisfied from the warm set.
    pub reused: u64,
    /// Idle-timeout evictions.
    pub evicted_idle: u64,
    /// Health-probe evictions.
    pub evicted_unhealthy: u64,
    /// `get` calls that hit their deadline.
    pub get_timeouts: u64,
}

/// Bounded pool of warm connections to a single peer.
pub struct ConnectionPool {
    config: TcpPoolConfig,
    inner: Mutex<PoolInner>,
    released: Notify,
    shutdown: Shutdown,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool; no connections are opened until [`start`](Self::start).
    pub fn new(config: TcpPoolConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            config,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                in_use: 0,
                counters: PoolCounters::default(),
            }),
            released: Notify::new(),
            shutdown: Shutdown::new(),
            maintenance: Mutex::new(None),
        })
    }

    /// Warm up to `min_connections` and spawn the maintenance task.
    ///
    /// Warm-up is best-effort: an unreachable peer logs and leaves the
    /// pool cold; the maintenance task keeps retrying.
    pub async fn start(self: &std::sync::Arc<Self>) {
        self.warm_to_min().await;

        let pool = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            pool.maintenance_loop().await;
        });
        *self.maintenance.lock().expect("pool maintenance lock poisoned") = Some(handle);
    }

    /// Acquire a connection, waiting up to `wait_ms` for one to free up.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] when the deadline elapses at capacity.
    /// - [`TransportError::Cancelled`] when the pool is shutting down.
    /// - Connect errors when a fresh connection cannot be established.
    pub async fn get(&self, wait_ms: u64) -> Result<PooledConn> {
        let deadline = Instant::now() + Duration::from_millis(wait_ms.max(1));

        loop {
            if self.shutdown.is_triggered() {
                return Err(TransportError::Cancelled.into());
            }

            // Prefer a warm connection; newest first for cache locality.
            let candidate = {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                match inner.idle.pop() {
                    Some(conn) => {
                        inner.in_use += 1;
                        Some(conn)
                    }
                    None => None,
                }
            };

            if let Some(conn) = candidate {
                if probe_alive(&conn.stream).await {
                    let mut inner = self.inner.lock().expect("pool lock poisoned");
                    inner.counters.reused += 1;
                    drop(inner);
                    return Ok(conn);
                }
                // Stale connection: discard and look again.
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                inner.in_use -= 1;
                inner.counters.evicted_unhealthy += 1;
                drop(inner);
                debug!("pooled connection failed validation, discarded");
                continue;
            }

            // Create below the cap; the slot is reserved before the
            // connect so concurrent gets cannot overshoot `max`.
            let may_create = {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                if inner.in_use + inner.idle.len() < self.config.max_connections {
                    inner.in_use += 1;
                    true
                } else {
                    false
                }
            };

            if may_create {
                match self.connect().await {
                    Ok(stream) => {
                        let mut inner = self.inner.lock().expect("pool lock poisoned");
                        inner.counters.created += 1;
                        drop(inner);
                        return Ok(PooledConn::new(stream));
                    }
                    Err(e) => {
                        let mut inner = self.inner.lock().expect("pool lock poisoned");
                        inner.in_use -= 1;
                        drop(inner);
                        self.released.notify_one();
                        return Err(e);
                    }
                }
            }

            // At capacity: wait for a release, bounded by the deadline
            // and the shutdown quantum.
            let now = Instant::now();
            if now >= deadline {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                inner.counters.get_timeouts += 1;
                drop(inner);
                return Err(TransportError::Timeout("connection pool get".into()).into());
            }
            let quantum = (deadline - now).min(crate::net::POLL_QUANTUM);
            tokio::select! {
                _ = self.shutdown.wait() => return Err(TransportError::Cancelled.into()),
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(quantum) => {}
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Invalid connections, releases during shutdown, overfull idle sets
    /// and connections past the hard age cap are closed and dropped;
    /// everything else is re-pooled and a waiter is woken.
    pub fn release(&self, mut conn: PooledConn, valid: bool) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.in_use = inner.in_use.saturating_sub(1);

        let keep = valid
            && !self.shutdown.is_triggered()
            && inner.idle.len() < self.config.max_connections
            && conn.created.elapsed() < CONN_MAX_AGE;

        if keep {
            conn.last_used = Instant::now();
            inner.idle.push(conn);
        }
        drop(inner);
        self.released.notify_one();
    }

    /// Signal shutdown without waiting for the maintenance task.
    ///
    /// Used on drop paths that cannot await; the maintenance task exits
    /// on its next quantum.
    pub fn signal_shutdown(&self) {
        self.shutdown.trigger();
        self.released.notify_waiters();
    }

    /// Stop the maintenance task and close every warm connection.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        self.released.notify_waiters();

        let handle = self
            .maintenance
            .lock()
            .expect("pool maintenance lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.idle.clear();
    }

    /// Snapshot occupancy and counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool lock poisoned");
        PoolStats {
            in_use: inner.in_use,
            idle: inner.idle.len(),
            created: inner.counters.created,
            reused: inner.counters.reused,
            evicted_idle: inner.counters.evicted_idle,
            evicted_unhealthy: inner.counters.evicted_unhealthy,
            get_timeouts: inner.counters.get_timeouts,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.config.peer_addr();
        let connect = TcpStream::connect(&addr);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(e)) => Err(crate::net::classify_io_error(e).into()),
            Err(_) => Err(TransportError::Timeout(format!("connect to {}", addr)).into()),
        }
    }

    async fn warm_to_min(&self) {
        loop {
            let need = {
                let inner = self.inner.lock().expect("pool lock poisoned");
                let have = inner.in_use + inner.idle.len();
                self.config.min_connections.saturating_sub(have)
            };
            if need == 0 || self.shutdown.is_triggered() {
                return;
            }
            match self.connect().await {
                Ok(stream) => {
                    let mut inner = self.inner.lock().expect("pool lock poisoned");
                    if inner.in_use + inner.idle.len() < self.config.max_connections {
                        inner.counters.created += 1;
                        inner.idle.push(PooledConn::new(stream));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pool warm-up connect failed");
                    return;
                }
            }
        }
    }

    async fn maintenance_loop(&self) {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms.max(1));
        let health_interval = Duration::from_millis(self.config.health_check_interval_ms.max(1));
        let mut last_health_check = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(MAINTENANCE_TICK) => {}
            }

            // Idle eviction: oldest first, never dropping below min.
            {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                let min = self.config.min_connections;
                let now = Instant::now();
                let mut i = 0;
                while i < inner.idle.len() {
                    if inner.idle.len() <= min {
                        break;
                    }
                    if now.duration_since(inner.idle[i].last_used) > idle_timeout {
                        inner.idle.remove(i);
                        inner.counters.evicted_idle += 1;
                    } else {
                        i += 1;
                    }
                }
            }

            // Periodic health probe of the warm set.
            if last_health_check.elapsed() >= health_interval {
                last_health_check = Instant::now();
                self.probe_idle().await;
            }

            // Re-warm after evictions or probe failures.
            self.warm_to_min().await;
        }
    }

    async fn probe_idle(&self) {
        // Take the warm set out, probe without holding the lock, put the
        // healthy ones back.
        let candidates: Vec<PooledConn> = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            std::mem::take(&mut inner.idle)
        };

        let mut healthy = Vec::with_capacity(candidates.len());
        let mut dropped = 0u64;
        for conn in candidates {
            if probe_alive(&conn.stream).await {
                healthy.push(conn);
            } else {
                dropped += 1;
            }
        }

        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.counters.evicted_unhealthy += dropped;
        // New idle entries may have been released while probing; keep both.
        healthy.append(&mut inner.idle);
        inner.idle = healthy;
    }
}

/// Non-destructive liveness probe.
///
/// A zero-deadline peek distinguishes "no data pending" (healthy) from a
/// peer close (peek returns 0) without consuming stream bytes.
async fn probe_alive(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(Duration::from_millis(1), stream.peek(&mut byte)).await {
        // Nothing readable within the probe window: connection is quiet
        // and assumed healthy.
        Err(_) => true,
        // Readable with data: healthy (stray bytes are the caller's
        // protocol concern).
        Ok(Ok(n)) => n > 0,
        Ok(Err(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn echo_listener() -> (tokio::net::TcpListener, std::net::SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn accept_forever(listener: tokio::net::TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    fn config_for(addr: std::net::SocketAddr) -> TcpPoolConfig {
        let mut cfg = TcpPoolConfig::new("127.0.0.1", addr.port());
        cfg.min_connections = 0;
        cfg.max_connections = 2;
        cfg
    }

    #[tokio::test]
    async fn test_get_creates_then_reuses() {
        let (listener, addr) = echo_listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(config_for(addr));
        pool.start().await;

        let conn = pool.get(1000).await.unwrap();
        pool.release(conn, true);

        let _again = pool.get(1000).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.created, 1, "second get must reuse the warm socket");
        assert_eq!(stats.reused, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_bound_is_respected() {
        let (listener, addr) = echo_listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(config_for(addr));
        pool.start().await;

        let a = pool.get(500).await.unwrap();
        let b = pool.get(500).await.unwrap();

        let err = pool.get(100).await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::Timeout(_))
        ));

        pool.release(a, true);
        pool.release(b, true);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (listener, addr) = echo_listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(config_for(addr));
        pool.start().await;

        let a = pool.get(500).await.unwrap();
        let _b = pool.get(500).await.unwrap();

        let waiter = Arc::clone(&pool);
        let handle = tokio::spawn(async move { waiter.get(2000).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(a, true);

        let got = handle.await.unwrap();
        assert!(got.is_ok(), "waiter should obtain the released connection");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_release_closes_connection() {
        let (listener, addr) = echo_listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(config_for(addr));
        pool.start().await;

        let conn = pool.get(500).await.unwrap();
        pool.release(conn, false);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0, "invalid connections are not re-pooled");
        assert_eq!(stats.in_use, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_fails_fast_when_peer_unreachable() {
        // Bind then drop to obtain a port that refuses connections.
        let (listener, addr) = echo_listener().await;
        drop(listener);

        let mut cfg = config_for(addr);
        cfg.connect_timeout_ms = 300;
        let pool = ConnectionPool::new(cfg);
        pool.start().await;

        assert!(pool.get(500).await.is_err());
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0, "failed connect releases its reservation");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let (listener, addr) = echo_listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(config_for(addr));
        pool.start().await;
        let _a = pool.get(500).await.unwrap();
        let _b = pool.get(500).await.unwrap();

        let waiter = Arc::clone(&pool);
        let handle = tokio::spawn(async move { waiter.get(30_000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown().await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::Cancelled)
        ));
    }
}
