//! Error types for meter-gateway.

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceId;

/// Main error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading a configuration override file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload does not fit the 16-bit length field.
    #[error("Payload length {0} is outside 0..=65535")]
    PayloadOutOfRange(usize),

    /// A frame passed codec validation but makes no sense to the session.
    /// The connection that produced it is closed.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connection closed (writer task gone).
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection's writer queue is full; the peer is not reading.
    #[error("Writer queue full")]
    SlowConsumer,
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Outcome of a failed [`CommandDispatcher::send`](crate::dispatch::CommandDispatcher::send).
///
/// Every variant is surfaced to the caller as-is; the dispatcher never retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The global in-flight budget is exhausted.
    #[error("Command queue is full")]
    QueueFull,

    /// The device is not registered or its connection is not writable.
    #[error("No writable connection for device {0}")]
    ConnectionUnavailable(DeviceId),

    /// No matching reply arrived before the deadline.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// Writing the command frame failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The payload cannot be encoded (longer than 65535 bytes).
    #[error("Payload length {0} exceeds 65535")]
    PayloadTooLarge(usize),
}

/// Reason a candidate frame was rejected by the decoder.
///
/// Never returned across the I/O boundary: the decoder skips past the
/// offending start byte and keeps scanning.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Byte at the candidate position is not `0x68`.
    #[error("Missing start marker")]
    BadStartMarker,

    /// Byte at offset 7 is not `0x68`.
    #[error("Missing second start marker")]
    BadSecondMarker,

    /// Declared payload length is above the configured limit.
    #[error("Declared payload length {declared} exceeds limit {limit}")]
    PayloadTooLong {
        /// Length from the header.
        declared: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Checksum byte does not match the computed sum.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Computed checksum.
        expected: u8,
        /// Checksum byte on the wire.
        actual: u8,
    },

    /// Trailing byte is not `0x16`.
    #[error("Missing end marker")]
    BadEndMarker,
}
