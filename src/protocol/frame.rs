//! Frame struct with typed accessors.
//!
//! Represents one complete protocol message. Uses `bytes::Bytes` for
//! zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use meter_gateway::protocol::{Address, ControlCode, Frame, Sequence};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(
//!     Address::new([1, 2, 3, 4]),
//!     Sequence::new([0, 1]),
//!     ControlCode::Heartbeat,
//!     Bytes::new(),
//! );
//!
//! assert!(frame.is_heartbeat());
//! assert_eq!(frame.payload_len(), 0);
//! ```

use std::fmt;

use bytes::Bytes;

use super::control::ControlCode;

/// 4-byte terminal address, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address([u8; 4]);

impl Address {
    /// Create an address from raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// 2-byte master-station address + running sequence field.
///
/// Used together with the device identity to correlate replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence([u8; 2]);

impl Sequence {
    /// Create a sequence from raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    /// Create a sequence from a counter value, high byte first.
    ///
    /// ```
    /// use meter_gateway::protocol::Sequence;
    ///
    /// assert_eq!(Sequence::from_counter(0x0102).as_bytes(), &[0x01, 0x02]);
    /// ```
    #[inline]
    pub const fn from_counter(value: u16) -> Self {
        Self(value.to_be_bytes())
    }

    /// Get the raw bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

/// A complete protocol frame.
///
/// The payload length is always `payload.len()`; the codec checks that it
/// fits the 16-bit length field when encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    address: Address,
    sequence: Sequence,
    control_code: u8,
    payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(
        address: Address,
        sequence: Sequence,
        control_code: impl Into<u8>,
        payload: Bytes,
    ) -> Self {
        Self {
            address,
            sequence,
            control_code: control_code.into(),
            payload,
        }
    }

    /// Create a frame copying the payload from a slice.
    pub fn from_parts(
        address: Address,
        sequence: Sequence,
        control_code: impl Into<u8>,
        payload: &[u8],
    ) -> Self {
        Self::new(
            address,
            sequence,
            control_code,
            Bytes::copy_from_slice(payload),
        )
    }

    /// Build a reply to this frame: same address and sequence, new control
    /// code and payload.
    pub fn reply(&self, control_code: impl Into<u8>, payload: Bytes) -> Self {
        Self::new(self.address, self.sequence, control_code, payload)
    }

    /// Get the terminal address.
    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Get the sequence field.
    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Get the raw control byte.
    #[inline]
    pub fn control_code(&self) -> u8 {
        self.control_code
    }

    /// Get the typed control code.
    #[inline]
    pub fn control(&self) -> ControlCode {
        ControlCode::from(self.control_code)
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Check if this is a heartbeat upload.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.control().is_heartbeat()
    }
}
