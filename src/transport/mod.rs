//! Transport abstraction and carrier implementations
//!
//! This module defines the [`Transport`] trait that all carriers satisfy,
//! and the [`MessageHandler`] trait through which the protocol layer above
//! receives messages. Concrete carriers live in submodules:
//!
//! - [`tcp_server::TcpServerTransport`] -- framed TCP acceptor with a
//!   bounded slot table and worker pool.
//! - [`tcp_client::TcpPoolTransport`] -- request/response client over a
//!   warm TCP connection pool.
//! - [`ws_client::WsClientTransport`] -- WebSocket client with reconnect
//!   and synchronous request/response.
//! - [`ws_server::WsServerTransport`] -- WebSocket server with a bitmap
//!   slot table and ping liveness.
//! - [`http_sse::HttpSseTransport`] -- HTTP server with an SSE event
//!   stream, replay store and heartbeats.
//! - [`http_streamable::HttpStreamableTransport`] -- session-multiplexed
//!   streamable HTTP server.
//!
//! # Design
//!
//! The trait is intentionally uniform: every carrier exposes `start`,
//! `stop`, `send`, `sendv` and `receive`, and reports the operations its
//! role does not carry with [`TransportError::NotSupported`] instead of a
//! separate trait per role. Server carriers produce replies by returning
//! them from [`MessageHandler::on_message`]; client carriers deliver
//! inbound traffic through the same hook.
//!
//! Teardown is two-phase: `stop` quiesces background tasks and closes
//! sockets (idempotent), and dropping the transport releases whatever
//! remains.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

pub mod http_sse;
pub mod http_streamable;
pub mod tcp_client;
pub mod tcp_server;
pub mod ws_client;
pub mod ws_server;

/// Which side of the protocol a transport implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates connections and sends requests.
    Client,
    /// Accepts connections and answers via the message callback.
    Server,
}

/// The underlying carrier of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    /// Raw framed TCP (server).
    Tcp,
    /// Pooled framed TCP (client).
    TcpPool,
    /// HTTP + SSE.
    Http,
    /// Streamable HTTP with session multiplexing.
    HttpStreamable,
    /// WebSocket.
    Ws,
}

/// Hook through which the protocol layer receives inbound messages.
///
/// Implementations hold their own context in fields; the runtime never
/// passes an opaque user pointer. Dispatch is serialized per connection
/// and parallel across connections, so implementations must be
/// re-entrant.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message.
    ///
    /// Returning `Some(reply)` sends the reply back on the same
    /// connection (server carriers) or hands it to the caller (client
    /// carriers ignore the value). Returning `None` produces no reply.
    async fn on_message(&self, payload: Bytes) -> Option<Bytes>;

    /// Observe a connection-fatal transport error.
    ///
    /// Invoked only for fatal conditions; per-request failures are
    /// returned synchronously to the caller and never arrive here.
    fn on_transport_error(&self, _error: &TransportError) {}
}

/// Adapter turning a plain closure into a [`MessageHandler`].
///
/// Useful for tests and simple echo services.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a [`MessageHandler`] that replies with `f(payload)`.
pub fn handler_fn<F>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Bytes) -> Option<Bytes> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait::async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Bytes) -> Option<Bytes> + Send + Sync + 'static,
{
    async fn on_message(&self, payload: Bytes) -> Option<Bytes> {
        (self.f)(payload)
    }
}

/// Abstraction over the five carrier implementations.
///
/// All methods are `async`; carriers are driven polymorphically through
/// `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// The role this transport plays.
    fn role(&self) -> Role;

    /// The carrier this transport runs on.
    fn carrier(&self) -> Carrier;

    /// Whether `start` has completed and `stop` has not yet run.
    fn is_running(&self) -> bool;

    /// Start background work and register the message handler.
    ///
    /// Idempotent: starting a running transport is a no-op. Fatal startup
    /// failures (bind errors, resource exhaustion) are returned and leave
    /// the transport cleanly stopped.
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Quiesce background work, wake blocked operations, close sockets.
    ///
    /// Idempotent and bounded: every internal wait observes the shutdown
    /// signal within its poll quantum.
    async fn stop(&self);

    /// Send one message.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotSupported`] on server-role carriers.
    async fn send(&self, _data: &[u8]) -> Result<()> {
        Err(TransportError::NotSupported("send").into())
    }

    /// Send one message gathered from several buffers.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotSupported`] on server-role carriers.
    async fn sendv(&self, _bufs: &[&[u8]]) -> Result<()> {
        Err(TransportError::NotSupported("sendv").into())
    }

    /// Block until a reply arrives or `timeout_ms` elapses.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotSupported`] where the carrier shape forbids
    /// synchronous receive (server carriers, the pooled TCP client).
    async fn receive(&self, _timeout_ms: u64) -> Result<Bytes> {
        Err(TransportError::NotSupported("receive").into())
    }
}

/// Build a transport from a carrier-tagged configuration.
///
/// The transport is constructed but not started; call
/// [`Transport::start`] to begin I/O.
///
/// # Errors
///
/// Returns [`TransportError::Config`] when the configuration fails
/// validation.
pub fn create(config: TransportConfig) -> Result<Arc<dyn Transport>> {
    match config {
        TransportConfig::TcpServer(cfg) => {
            cfg.validate()?;
            Ok(Arc::new(tcp_server::TcpServerTransport::new(cfg)))
        }
        TransportConfig::TcpPool(cfg) => {
            cfg.validate()?;
            Ok(Arc::new(tcp_client::TcpPoolTransport::new(cfg)))
        }
        TransportConfig::WsClient(cfg) => {
            Ok(Arc::new(ws_client::WsClientTransport::new(cfg)))
        }
        TransportConfig::WsServer(cfg) => {
            Ok(Arc::new(ws_server::WsServerTransport::new(cfg)))
        }
        TransportConfig::Http(cfg) => Ok(Arc::new(http_sse::HttpSseTransport::new(cfg))),
        TransportConfig::HttpStreamable(cfg) => {
            Ok(Arc::new(http_streamable::HttpStreamableTransport::new(cfg)))
        }
    }
}
