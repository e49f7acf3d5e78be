//! Error types for doorbell-link.

use thiserror::Error;

use crate::protocol::PacketType;
use crate::session::ConnectionState;

/// Main error type for all doorbell-link operations.
#[derive(Debug, Error)]
pub enum DoorbellError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing the device configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fewer than 5 bytes were supplied where a header was expected.
    #[error("Malformed header: need 5 bytes, got {0}")]
    MalformedHeader(usize),

    /// A contiguous buffer ended before the declared payload length.
    #[error("Truncated packet: declared {declared} payload bytes, got {available}")]
    Truncated { declared: u32, available: usize },

    /// Payload length does not fit in the 32-bit length prefix.
    #[error("Payload of {0} bytes does not fit in a 32-bit length prefix")]
    PayloadTooLarge(usize),

    /// Payload too short (or otherwise invalid) for the layout of its type.
    #[error("Malformed {packet_type} payload: {reason}")]
    MalformedPayload {
        packet_type: PacketType,
        reason: String,
    },

    /// The transport handed back fewer bytes than it declared available.
    #[error("Transport corrupted: requested {requested} bytes, received {received}")]
    TransportCorrupted { requested: usize, received: usize },

    /// Every connection attempt to the gateway failed.
    #[error("Failed to connect to {host}:{port} after {attempts} attempts")]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: u32,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A handshake packet could not be delivered in full.
    #[error("Write incomplete: sent {written} of {total} bytes")]
    WriteIncomplete { written: usize, total: usize },

    /// Operation not valid in the current connection state.
    #[error("Invalid state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Username rejected before it reached the wire.
    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DoorbellError {
    /// Whether the error leaves the connection unusable and requires a reconnect.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            DoorbellError::TransportCorrupted { .. }
                | DoorbellError::ConnectionClosed
                | DoorbellError::WriteIncomplete { .. }
                | DoorbellError::Io(_)
        )
    }
}

/// Result type alias using DoorbellError.
pub type Result<T> = std::result::Result<T, DoorbellError>;
