//! Error types for mcpwire
//!
//! This module defines all error types used throughout the transport
//! runtime, using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for mcpwire operations
///
/// This enum encompasses every failure class a carrier can produce. Raw
/// `std::io::Error` values never cross a transport boundary untranslated;
/// the socket layer classifies them into the variants below before they
/// reach callers.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A caller-supplied argument was rejected
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// The transport has not been started (or has already been stopped)
    #[error("Transport is not running")]
    NotRunning,

    /// The operation is not available on this transport shape
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// A bounded wait elapsed before the operation completed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The operation was interrupted by shutdown
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// The peer closed or reset the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// The wire framing was violated (bad length prefix, truncated frame)
    #[error("Framing error: {0}")]
    FramingError(String),

    /// A payload exceeded the configured size cap
    #[error("Message size {len} exceeds limit {max}")]
    SizeLimitExceeded {
        /// Observed payload length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Unclassified I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded table (slots, pool, sessions) is full
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// No session with the given identifier exists
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but its timeout has elapsed
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The request's Origin header is not on the allow-list
    #[error("Origin denied: {0}")]
    OriginDenied(String),

    /// The message callback reported a JSON-RPC error code
    #[error("Callback error: code={code}")]
    CallbackError {
        /// JSON-RPC error code returned by the handler
        code: i32,
    },

    /// WebSocket protocol-level failure
    #[error("WebSocket error: {0}")]
    Websocket(String),

    /// Configuration loading or validation failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TransportError {
    /// Whether this error tears down the connection it occurred on.
    ///
    /// Per-request conditions (timeouts, a rejected argument) are returned
    /// to the caller and leave the transport running; the error callback is
    /// reserved for the fatal classes.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Io(_) | Self::FramingError(_) | Self::Websocket(_)
        )
    }
}

/// Result type alias for mcpwire operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Recover the [`TransportError`] classification from an `anyhow` chain.
///
/// Returns `None` when the error did not originate in this crate.
pub fn kind_of(err: &anyhow::Error) -> Option<&TransportError> {
    err.downcast_ref::<TransportError>()
}
