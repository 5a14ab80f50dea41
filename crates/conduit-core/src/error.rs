//! Error types for the conduit IPC bus.
//!
//! Transport failures inside background tasks never cross component
//! boundaries as `Err`; they are logged and handed to the error callback with
//! the numeric code from [`IpcError::code`]. Errors returned from the public
//! API are capacity, role, validation and timeout failures.

use crate::connection::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for conduit.
#[derive(Debug, Error)]
pub enum IpcError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to bind {address}: {message}")]
    BindFailed {
        address: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed {
        address: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Endpoint {address} stayed busy for {waited:?}")]
    EndpointBusy { address: String, waited: Duration },

    #[error("Write to peer {peer} failed: {message}")]
    WriteFailed { peer: PeerId, message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Gave up on {address} after {attempts} failed connection attempts")]
    ReconnectExhausted { address: String, attempts: u32 },

    // Protocol errors
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    // Capacity and routing errors
    #[error("Payload of {size} bytes exceeds maximum frame size {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Peer limit of {max} reached, refusing {description}")]
    PeerLimitReached { max: usize, description: String },

    #[error("Send queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Operation {operation} is only available in {required} role")]
    WrongRole {
        operation: &'static str,
        required: &'static str,
    },

    #[error("IPC manager is not running")]
    NotRunning,

    #[error("Request {id} could not be delivered to any peer")]
    Undeliverable { id: String },

    #[error("Handler for channel {channel} failed: {message}")]
    HandlerFailed { channel: String, message: String },

    // Timeouts
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    // Configuration errors
    #[error("Invalid address {address:?}: {message}")]
    InvalidAddress { address: String, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for conduit operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::MalformedFrame {
            message: err.to_string(),
        }
    }
}

impl IpcError {
    /// Numeric code passed to the error callback.
    ///
    /// IO errors carry the raw OS error when the platform supplied one.
    /// Everything else maps to a fixed application code:
    /// - -32000: transport failure without an OS code
    /// - -32001: peer not found
    /// - -32002: request timeout
    /// - -32003: capacity (peer limit, queue full, payload too large, undeliverable)
    /// - -32004: not running or wrong role
    /// - -32005: validation / invalid address
    /// - -32603: a channel handler failed
    /// - -32700: malformed or oversized frame
    pub fn code(&self) -> i32 {
        match self {
            IpcError::Io {
                source: Some(err), ..
            }
            | IpcError::BindFailed {
                source: Some(err), ..
            }
            | IpcError::ConnectFailed {
                source: Some(err), ..
            } => err.raw_os_error().unwrap_or(-32000),

            IpcError::Io { .. }
            | IpcError::BindFailed { .. }
            | IpcError::ConnectFailed { .. }
            | IpcError::EndpointBusy { .. }
            | IpcError::WriteFailed { .. }
            | IpcError::ConnectionLost { .. }
            | IpcError::ReconnectExhausted { .. } => -32000,

            IpcError::PeerNotFound(_) => -32001,

            IpcError::Timeout(_) => -32002,

            IpcError::PayloadTooLarge { .. }
            | IpcError::PeerLimitReached { .. }
            | IpcError::QueueFull { .. }
            | IpcError::Undeliverable { .. } => -32003,

            IpcError::NotRunning | IpcError::WrongRole { .. } => -32004,

            IpcError::InvalidAddress { .. } | IpcError::Validation { .. } => -32005,

            IpcError::HandlerFailed { .. } => -32603,

            IpcError::FrameTooLarge { .. } | IpcError::MalformedFrame { .. } => -32700,
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::Io { .. }
                | IpcError::ConnectFailed { .. }
                | IpcError::EndpointBusy { .. }
                | IpcError::QueueFull { .. }
                | IpcError::Timeout(_)
        )
    }

    /// Whether a reader seeing this error must give up on the connection.
    ///
    /// Protocol errors only drop the offending frame.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            IpcError::FrameTooLarge { .. } | IpcError::MalformedFrame { .. }
        )
    }
}
