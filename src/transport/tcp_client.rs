//! Pooled TCP client transport
//!
//! Each `send`/`sendv` borrows a warm connection from the
//! [`ConnectionPool`], performs one framed request/response exchange, and
//! returns the connection. The response is delivered through the message
//! handler; any reply the handler returns is dropped, because this
//! carrier has nowhere to forward it.
//!
//! Synchronous `receive` is intentionally unsupported on this transport:
//! request/response correlation happens inside `send`, so a separate
//! receive call has nothing to wait for.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::TcpPoolConfig;
use crate::error::{Result, TransportError};
use crate::frame;
use crate::net::Shutdown;
use crate::pool::{ConnectionPool, PoolStats};
use crate::transport::{Carrier, MessageHandler, Role, Transport};

struct Running {
    pool: Arc<ConnectionPool>,
    handler: Arc<dyn MessageHandler>,
    shutdown: Shutdown,
}

/// Client transport multiplexing request/response exchanges over a warm
/// connection pool.
pub struct TcpPoolTransport {
    config: TcpPoolConfig,
    running: Mutex<Option<Running>>,
}

impl TcpPoolTransport {
    /// Construct a stopped transport; `start` warms the pool.
    pub fn new(config: TcpPoolConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    /// Snapshot the pool counters, if running.
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.running.lock().await.as_ref().map(|r| r.pool.stats())
    }

    /// One request/response exchange over a pooled connection.
    async fn exchange(&self, bufs: &[&[u8]]) -> Result<()> {
        let (pool, handler, shutdown) = {
            let running = self.running.lock().await;
            let running = running.as_ref().ok_or(TransportError::NotRunning)?;
            (
                Arc::clone(&running.pool),
                Arc::clone(&running.handler),
                running.shutdown.clone(),
            )
        };

        let mut conn = pool.get(self.config.request_timeout_ms).await?;

        let outcome = self
            .request_on(conn.stream_mut(), bufs, &shutdown)
            .await;

        match outcome {
            Ok(response) => {
                pool.release(conn, true);
                // The pooled client does not auto-forward handler replies.
                let _ = handler.on_message(response).await;
                Ok(())
            }
            Err(e) => {
                // The connection may carry half a frame; never re-pool it.
                pool.release(conn, false);
                if let Some(kind) = crate::error::kind_of(&e) {
                    if kind.is_connection_fatal() {
                        handler.on_transport_error(kind);
                    }
                }
                Err(e)
            }
        }
    }

    async fn request_on(
        &self,
        stream: &mut tokio::net::TcpStream,
        bufs: &[&[u8]],
        shutdown: &Shutdown,
    ) -> Result<bytes::Bytes> {
        let max = self.config.max_frame_len;
        let timeout = Duration::from_millis(self.config.request_timeout_ms.max(1));

        frame::send_framed_vectored(stream, bufs, max, shutdown).await?;

        match tokio::time::timeout(timeout, frame::recv_framed(stream, max, shutdown)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("pooled request timed out waiting for response");
                Err(TransportError::Timeout("pooled request".into()).into())
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpPoolTransport {
    fn role(&self) -> Role {
        Role::Client
    }

    fn carrier(&self) -> Carrier {
        Carrier::TcpPool
    }

    fn is_running(&self) -> bool {
        self.running.try_lock().map(|r| r.is_some()).unwrap_or(true)
    }

    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let pool = ConnectionPool::new(self.config.clone());
        pool.start().await;

        *running = Some(Running {
            pool,
            handler,
            shutdown: Shutdown::new(),
        });
        info!(peer = %self.config.peer_addr(), "tcp pool transport started");
        Ok(())
    }

    async fn stop(&self) {
        let running = { self.running.lock().await.take() };
        if let Some(running) = running {
            running.shutdown.trigger();
            running.pool.shutdown().await;
            info!("tcp pool transport stopped");
        }
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.exchange(&[data]).await
    }

    async fn sendv(&self, bufs: &[&[u8]]) -> Result<()> {
        self.exchange(bufs).await
    }

    /// Always unsupported on the pooled carrier.
    async fn receive(&self, _timeout_ms: u64) -> Result<bytes::Bytes> {
        Err(TransportError::NotSupported("receive on pooled tcp client").into())
    }
}

impl Drop for TcpPoolTransport {
    /// Best-effort teardown when dropped while running; `stop` remains
    /// the orderly path.
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.shutdown.trigger();
                running.pool.signal_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpServerConfig;
    use crate::transport::handler_fn;
    use crate::transport::tcp_server::TcpServerTransport;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: StdMutex<Vec<Bytes>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, payload: Bytes) -> Option<Bytes> {
            self.seen.lock().unwrap().push(payload);
            None
        }
    }

    async fn echo_server() -> (Arc<TcpServerTransport>, u16) {
        let server = Arc::new(TcpServerTransport::new(TcpServerConfig::default()));
        server
            .start(handler_fn(|payload: Bytes| Some(payload)))
            .await
            .unwrap();
        let port = server.local_addr().await.unwrap().port();
        (server, port)
    }

    #[tokio::test]
    async fn test_send_delivers_response_to_handler() {
        let (server, port) = echo_server().await;

        let mut cfg = TcpPoolConfig::new("127.0.0.1", port);
        cfg.min_connections = 1;
        let client = TcpPoolTransport::new(cfg);
        let recorder = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        client.start(Arc::clone(&recorder) as Arc<dyn MessageHandler>).await.unwrap();

        client.send(b"hello pool").await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0][..], b"hello pool");
        drop(seen);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sequential_requests_reuse_connections() {
        let (server, port) = echo_server().await;

        let mut cfg = TcpPoolConfig::new("127.0.0.1", port);
        cfg.min_connections = 2;
        cfg.max_connections = 4;
        let client = TcpPoolTransport::new(cfg);
        client.start(handler_fn(|_| None)).await.unwrap();

        for i in 0..10 {
            client.send(format!("req-{}", i).as_bytes()).await.unwrap();
        }

        let stats = client.pool_stats().await.unwrap();
        assert!(
            stats.created <= 4,
            "10 sequential requests must reuse pooled sockets, created {}",
            stats.created
        );
        assert_eq!(stats.in_use, 0);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sendv_gathers_buffers() {
        let (server, port) = echo_server().await;

        let client = TcpPoolTransport::new(TcpPoolConfig::new("127.0.0.1", port));
        let recorder = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        client.start(Arc::clone(&recorder) as Arc<dyn MessageHandler>).await.unwrap();

        client.sendv(&[b"part-a|", b"part-b"]).await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(&seen[0][..], b"part-a|part-b");
        drop(seen);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_receive_is_not_supported() {
        let client = TcpPoolTransport::new(TcpPoolConfig::new("127.0.0.1", 1));
        let err = client.receive(10).await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_running() {
        let client = TcpPoolTransport::new(TcpPoolConfig::new("127.0.0.1", 1));
        let err = client.send(b"x").await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_request_timeout_invalidates_connection() {
        // A server that accepts but never replies.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut cfg = TcpPoolConfig::new("127.0.0.1", port);
        cfg.min_connections = 0;
        cfg.request_timeout_ms = 200;
        let client = TcpPoolTransport::new(cfg);
        client.start(handler_fn(|_| None)).await.unwrap();

        let err = client.send(b"no answer").await.unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(TransportError::Timeout(_))
        ));

        let stats = client.pool_stats().await.unwrap();
        assert_eq!(stats.idle, 0, "timed-out connection must not be re-pooled");

        client.stop().await;
    }
}
