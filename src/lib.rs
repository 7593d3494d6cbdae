//! mcpwire - transport runtime for MCP-style JSON-RPC peers
//!
//! This library moves framed messages between peers over five carriers --
//! raw TCP, pooled TCP, HTTP+SSE, streamable HTTP, and WebSocket -- behind
//! one uniform [`Transport`] interface. The protocol layer above plugs in
//! through a [`MessageHandler`]; the runtime owns sockets, slot tables,
//! pools, reconnection and teardown.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `transport`: the [`Transport`] trait, carrier implementations, and
//!   the configuration-driven factory
//! - `frame`: length-prefix framing for the TCP carriers
//! - `net`: cancel-aware socket I/O primitives
//! - `pool`: the warm TCP connection pool
//! - `buffer`: fixed-slot buffer reuse for hot paths
//! - `sse`: the SSE event model and circular replay store
//! - `session`: session table for the streamable HTTP carrier
//! - `config`: per-carrier configuration structures
//! - `error`: error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcpwire::{handler_fn, Transport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: TransportConfig = serde_yaml::from_str("carrier: tcp_server\nport: 9000\n")?;
//!     let server = mcpwire::transport::create(config)?;
//!     server.start(handler_fn(|payload| Some(payload))).await?;
//!     // ... serve until shutdown ...
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod net;
pub mod pool;
pub mod session;
pub mod sse;
pub mod text;
pub mod transport;

// Re-export commonly used types
pub use config::{
    HttpConfig, TcpPoolConfig, TcpServerConfig, TransportConfig, WsClientConfig, WsServerConfig,
};
pub use error::{Result, TransportError};
pub use session::{SessionManager, SessionState};
pub use transport::{create, handler_fn, Carrier, MessageHandler, Role, Transport};
