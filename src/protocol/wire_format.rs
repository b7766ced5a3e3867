//! Wire format encoding and decoding.
//!
//! Frame layout:
//! ```text
//! ┌──────┬─────────┬──────────┬──────┬─────────┬──────────┬─────────┬──────────┬──────┐
//! │ 0x68 │ Address │ Sequence │ 0x68 │ Control │ Length   │ Payload │ Checksum │ 0x16 │
//! │ 1    │ 4 bytes │ 2 bytes  │ 1    │ 1 byte  │ u16 LE   │ N bytes │ 1 byte   │ 1    │
//! └──────┴─────────┴──────────┴──────┴─────────┴──────────┴─────────┴──────────┴──────┘
//! ```
//!
//! The checksum is the sum, modulo 256, of every byte from the first
//! `0x68` through the last payload byte.
//!
//! Decoding never fails the stream. A candidate frame with a bad marker,
//! checksum or oversized length is rejected and scanning resumes at the
//! next byte, so one corrupt byte cannot take down frames buffered after it.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Address, Frame, Sequence};
use crate::error::{FramingError, GatewayError, Result};

/// Start marker (appears twice in the header).
pub const START_MARKER: u8 = 0x68;

/// End marker.
pub const END_MARKER: u8 = 0x16;

/// Header size in bytes: marker, address, sequence, marker, control, length.
pub const HEADER_SIZE: usize = 11;

/// Trailer size in bytes: checksum + end marker.
pub const TRAILER_SIZE: usize = 2;

/// Smallest possible frame (empty payload).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TRAILER_SIZE;

/// Offset of the second start marker from the frame start.
pub const SECOND_MARKER_OFFSET: usize = 7;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

const CONTROL_OFFSET: usize = 8;
const LENGTH_OFFSET: usize = 9;

/// Result of one [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A frame was decoded. `consumed` covers any garbage skipped before it.
    Frame {
        /// The decoded frame.
        frame: Frame,
        /// Bytes to drop from the front of the buffer.
        consumed: usize,
    },
    /// No complete frame yet. The first `discard` bytes are garbage and may
    /// be dropped; everything after must be offered again with more data.
    NeedMore {
        /// Garbage bytes to drop from the front of the buffer.
        discard: usize,
    },
}

/// Compute the checksum of a byte region.
///
/// ```
/// use meter_gateway::protocol::checksum;
///
/// assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
/// ```
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Decode the first frame in `buf`, resynchronizing past corrupt data.
///
/// Call repeatedly, dropping the reported bytes each time, until it
/// returns [`Decoded::NeedMore`]: one network read may hold several frames.
pub fn decode(buf: &[u8]) -> Decoded {
    decode_with_limit(buf, MAX_PAYLOAD_LEN)
}

/// Like [`decode`], but treats a declared payload length above
/// `max_payload_len` as corruption.
pub fn decode_with_limit(buf: &[u8], max_payload_len: usize) -> Decoded {
    let mut pos = 0;

    loop {
        // Jump to the next plausible frame start
        match buf[pos..].iter().position(|&b| b == START_MARKER) {
            Some(offset) => pos += offset,
            None => return Decoded::NeedMore { discard: buf.len() },
        }

        match decode_at(&buf[pos..], max_payload_len) {
            Ok(Some((frame, len))) => {
                return Decoded::Frame {
                    frame,
                    consumed: pos + len,
                }
            }
            Ok(None) => return Decoded::NeedMore { discard: pos },
            Err(reason) => {
                tracing::trace!(offset = pos, %reason, "Rejected candidate frame, resyncing");
                pos += 1;
            }
        }
    }
}

/// Strictly decode a frame starting at `buf[0]`.
///
/// Returns `Ok(None)` if more bytes are needed, `Ok(Some((frame, len)))` on
/// success, or the reason the candidate is not a frame.
pub fn decode_at(
    buf: &[u8],
    max_payload_len: usize,
) -> std::result::Result<Option<(Frame, usize)>, FramingError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != START_MARKER {
        return Err(FramingError::BadStartMarker);
    }
    if buf.len() <= SECOND_MARKER_OFFSET {
        return Ok(None);
    }
    if buf[SECOND_MARKER_OFFSET] != START_MARKER {
        return Err(FramingError::BadSecondMarker);
    }
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let declared = u16::from_le_bytes([buf[LENGTH_OFFSET], buf[LENGTH_OFFSET + 1]]) as usize;
    if declared > max_payload_len {
        return Err(FramingError::PayloadTooLong {
            declared,
            limit: max_payload_len,
        });
    }

    let total = HEADER_SIZE + declared + TRAILER_SIZE;
    if buf.len() < total {
        return Ok(None);
    }

    let payload_end = HEADER_SIZE + declared;
    let expected = checksum(&buf[..payload_end]);
    let actual = buf[payload_end];
    if expected != actual {
        return Err(FramingError::ChecksumMismatch { expected, actual });
    }
    if buf[payload_end + 1] != END_MARKER {
        return Err(FramingError::BadEndMarker);
    }

    let frame = Frame::from_parts(
        Address::new([buf[1], buf[2], buf[3], buf[4]]),
        Sequence::new([buf[5], buf[6]]),
        buf[CONTROL_OFFSET],
        &buf[HEADER_SIZE..payload_end],
    );
    Ok(Some((frame, total)))
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns `PayloadOutOfRange` if the payload is longer than 65535 bytes.
///
/// # Example
///
/// ```
/// use meter_gateway::protocol::{encode, Address, ControlCode, Frame, Sequence};
/// use bytes::Bytes;
///
/// let frame = Frame::new(
///     Address::new([1, 2, 3, 4]),
///     Sequence::new([0, 1]),
///     ControlCode::Heartbeat,
///     Bytes::new(),
/// );
/// let bytes = encode(&frame).unwrap();
/// assert_eq!(bytes.len(), 13);
/// assert_eq!(bytes[0], 0x68);
/// assert_eq!(bytes[12], 0x16);
/// ```
pub fn encode(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(MIN_FRAME_SIZE + frame.payload_len());
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame, appending to an existing buffer.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    let len = frame.payload_len();
    if len > MAX_PAYLOAD_LEN {
        return Err(GatewayError::PayloadOutOfRange(len));
    }

    let start = buf.len();
    buf.reserve(MIN_FRAME_SIZE + len);
    buf.put_u8(START_MARKER);
    buf.put_slice(frame.address().as_bytes());
    buf.put_slice(frame.sequence().as_bytes());
    buf.put_u8(START_MARKER);
    buf.put_u8(frame.control_code());
    buf.put_u16_le(len as u16);
    buf.put_slice(frame.payload());

    let sum = checksum(&buf[start..]);
    buf.put_u8(sum);
    buf.put_u8(END_MARKER);
    Ok(())
}
