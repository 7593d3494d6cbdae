//! Configuration for the transport carriers
//!
//! Each carrier has its own configuration structure with defaulted knobs,
//! all serde-derived so an embedding application can load them from a
//! YAML document. [`TransportConfig`] is the tagged union consumed by the
//! transport factory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// TCP server carrier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; `0` selects an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// Size of the connection slot table.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Per-connection idle timeout before the cleanup pass stops it.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Largest payload accepted on the wire.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Concurrent per-connection handlers admitted at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Slots in the receive buffer pool.
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            max_clients: default_max_clients(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            workers: default_workers(),
            buffer_pool_size: default_buffer_pool_size(),
        }
    }
}

impl TcpServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(TransportError::Config("max_clients must be > 0".into()).into());
        }
        if self.workers == 0 {
            return Err(TransportError::Config("workers must be > 0".into()).into());
        }
        Ok(())
    }
}

/// TCP connection pool configuration (client side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpPoolConfig {
    /// Remote host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Remote port.
    pub port: u16,

    /// Warm connections the pool keeps alive.
    #[serde(default = "default_pool_min")]
    pub min_connections: usize,

    /// Hard cap on simultaneously open connections.
    #[serde(default = "default_pool_max")]
    pub max_connections: usize,

    /// Idle connections above `min_connections` older than this are closed.
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Deadline for establishing a new connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline applied to each pooled request/response exchange.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How often the maintenance task probes idle connections.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Deadline for one health probe.
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Largest payload accepted on the wire (16 MiB for the pool carrier).
    #[serde(default = "default_pool_max_frame_len")]
    pub max_frame_len: usize,
}

impl TcpPoolConfig {
    /// Pool config targeting `host:port` with defaulted knobs.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            min_connections: default_pool_min(),
            max_connections: default_pool_max(),
            idle_timeout_ms: default_pool_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            max_frame_len: default_pool_max_frame_len(),
        }
    }

    /// `host:port` string for connecting.
    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(TransportError::Config("max_connections must be > 0".into()).into());
        }
        if self.min_connections > self.max_connections {
            return Err(TransportError::Config(
                "min_connections must not exceed max_connections".into(),
            )
            .into());
        }
        Ok(())
    }
}

/// WebSocket client carrier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsClientConfig {
    /// Remote host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Remote port.
    pub port: u16,

    /// Request path for the upgrade.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Optional `Origin` header value.
    #[serde(default)]
    pub origin: Option<String>,

    /// Optional `Sec-WebSocket-Protocol` value.
    #[serde(default)]
    pub protocol: Option<String>,

    /// Use `wss://` instead of `ws://`.
    #[serde(default)]
    pub use_ssl: bool,

    /// Client certificate path, passed through to the TLS provider.
    #[serde(default)]
    pub cert_path: Option<String>,

    /// Client key path, passed through to the TLS provider.
    #[serde(default)]
    pub key_path: Option<String>,

    /// Idle span after which a ping is emitted.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Span without a pong after which a miss is counted.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Whether dropped connections are re-established automatically.
    #[serde(default = "default_true")]
    pub reconnect_enabled: bool,

    /// Bounded reconnect attempts per outage.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Messages at or below this size use the reusable send buffer.
    #[serde(default = "default_small_send_threshold")]
    pub small_send_threshold: usize,

    /// Slots in the send buffer pool.
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,
}

impl WsClientConfig {
    /// Client config targeting `host:port` with defaulted knobs.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: default_ws_path(),
            origin: None,
            protocol: None,
            use_ssl: false,
            cert_path: None,
            key_path: None,
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            reconnect_enabled: true,
            max_reconnect_attempts: default_reconnect_attempts(),
            small_send_threshold: default_small_send_threshold(),
            buffer_pool_size: default_buffer_pool_size(),
        }
    }

    /// Build the `ws://` / `wss://` endpoint URL.
    pub fn endpoint(&self) -> Result<url::Url> {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        url::Url::parse(&format!("{}://{}:{}{}", scheme, self.host, self.port, path))
            .map_err(|e| TransportError::Config(format!("invalid ws endpoint: {}", e)).into())
    }
}

/// WebSocket server carrier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; `0` selects an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// Size of the client slot table (one occupancy bit per slot).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Liveness scan cadence.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Inactivity span after which a client is pinged.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Unanswered pings before the connection is closed.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,

    /// Cleanup pass cadence for dead slots.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Slots in the receive buffer pool.
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// Size of one receive buffer slot; growth rounds to this.
    #[serde(default = "default_buffer_slot_size")]
    pub buffer_slot_size: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            max_clients: default_max_clients(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            max_missed_pongs: default_max_missed_pongs(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            buffer_pool_size: default_buffer_pool_size(),
            buffer_slot_size: default_buffer_slot_size(),
        }
    }
}

impl WsServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// HTTP carrier configuration, shared by the SSE and streamable servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; `0` selects an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// Root for static-file fallback; `None` disables it (plain 404).
    #[serde(default)]
    pub doc_root: Option<String>,

    /// Emit CORS headers on every response.
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// `Access-Control-Allow-Origin` value.
    #[serde(default = "default_cors_origin")]
    pub cors_allow_origin: String,

    /// `Access-Control-Allow-Methods` value.
    #[serde(default = "default_cors_methods")]
    pub cors_allow_methods: String,

    /// `Access-Control-Allow-Headers` value.
    #[serde(default = "default_cors_headers")]
    pub cors_allow_headers: String,

    /// `Access-Control-Max-Age` seconds.
    #[serde(default = "default_cors_max_age")]
    pub cors_max_age: u64,

    /// Emit SSE heartbeat comments.
    #[serde(default = "default_true")]
    pub enable_heartbeats: bool,

    /// Heartbeat cadence.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Capacity of the circular event replay store.
    #[serde(default = "default_max_stored_events")]
    pub max_stored_events: usize,

    /// Enforce the Origin allow-list (streamable carrier).
    #[serde(default)]
    pub validate_origin: bool,

    /// Comma-separated Origin allow-list; entries may end in `*`.
    #[serde(default)]
    pub allowed_origins: String,

    /// Default session timeout.
    #[serde(default = "default_session_timeout_seconds")]
    pub session_timeout_seconds: u64,

    /// Size of the session slot table.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            doc_root: None,
            enable_cors: true,
            cors_allow_origin: default_cors_origin(),
            cors_allow_methods: default_cors_methods(),
            cors_allow_headers: default_cors_headers(),
            cors_max_age: default_cors_max_age(),
            enable_heartbeats: true,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_stored_events: default_max_stored_events(),
            validate_origin: false,
            allowed_origins: String::new(),
            session_timeout_seconds: default_session_timeout_seconds(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl HttpConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tagged configuration union consumed by [`crate::transport::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "carrier", rename_all = "snake_case")]
pub enum TransportConfig {
    /// TCP server carrier (server role).
    TcpServer(TcpServerConfig),
    /// Pooled TCP carrier (client role).
    TcpPool(TcpPoolConfig),
    /// WebSocket client carrier.
    WsClient(WsClientConfig),
    /// WebSocket server carrier.
    WsServer(WsServerConfig),
    /// HTTP+SSE server carrier.
    Http(HttpConfig),
    /// Streamable HTTP server carrier with sessions.
    HttpStreamable(HttpConfig),
}

impl TransportConfig {
    /// Load a carrier configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] when the file cannot be read and
    /// [`TransportError::Yaml`] when it does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(TransportError::Yaml)?;
        Ok(config)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_clients() -> usize {
    64
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

fn default_max_frame_len() -> usize {
    1024 * 1024
}

fn default_pool_max_frame_len() -> usize {
    16 * 1024 * 1024
}

fn default_workers() -> usize {
    8
}

fn default_buffer_pool_size() -> usize {
    32
}

fn default_buffer_slot_size() -> usize {
    4096
}

fn default_pool_min() -> usize {
    2
}

fn default_pool_max() -> usize {
    8
}

fn default_pool_idle_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    1_000
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_ping_interval_ms() -> u64 {
    5_000
}

fn default_ping_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_small_send_threshold() -> usize {
    4096
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_cleanup_interval_ms() -> u64 {
    5_000
}

fn default_cors_origin() -> String {
    "*".to_string()
}

fn default_cors_methods() -> String {
    "GET, POST, OPTIONS".to_string()
}

fn default_cors_headers() -> String {
    "Content-Type, Mcp-Session-Id, Last-Event-ID".to_string()
}

fn default_cors_max_age() -> u64 {
    86_400
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_stored_events() -> usize {
    5_000
}

fn default_session_timeout_seconds() -> u64 {
    3_600
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}
