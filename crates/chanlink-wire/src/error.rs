//! Errors from the transport and hub layers.

use crate::message::ChannelNameError;
use crate::transport::TransportState;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Invalid channel '{channel}': {reason}")]
    InvalidChannel {
        channel: String,
        reason: ChannelNameError,
    },
    #[error("Transport has no established socket")]
    NotConnected,
    #[error("Transport is {current}, cannot {operation}")]
    InvalidState {
        current: TransportState,
        operation: &'static str,
    },
    #[error("Unavailable for write: awaiting acknowledgement")]
    Unavailable,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Connect to {target} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("Port {port} already in use: {source}")]
    PortInUse {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("No free port in {first}..={last}")]
    PortRetriesExhausted { first: u16, last: u16 },
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Connect failures worth another attempt: refused, timed out, or the host
/// name did not resolve.
pub(crate) fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::NotFound
    )
}

/// Result alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;
