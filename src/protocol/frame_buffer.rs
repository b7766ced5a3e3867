//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` to hold bytes between socket reads. Each push
//! drains every complete frame, discards garbage that can never start a
//! frame, and keeps an incomplete candidate untouched until more data
//! arrives.
//!
//! # Example
//!
//! ```
//! use meter_gateway::protocol::{encode, Address, ControlCode, Frame, FrameBuffer, Sequence};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(
//!     Address::new([1, 2, 3, 4]),
//!     Sequence::new([0, 1]),
//!     ControlCode::Login,
//!     Bytes::new(),
//! );
//! let bytes = encode(&frame).unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! assert!(buffer.push(&bytes[..6]).is_empty());
//! let frames = buffer.push(&bytes[6..]);
//! assert_eq!(frames, vec![frame]);
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{decode_with_limit, Decoded, MAX_PAYLOAD_LEN, MIN_FRAME_SIZE};
use super::Frame;

/// Default initial buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Malformed input never produces an error. Rejected bytes are counted in
/// [`FrameBuffer::discarded_bytes`] and scanning resumes one byte later.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    max_payload_len: usize,
    discarded: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_BUFFER_CAPACITY, MAX_PAYLOAD_LEN)
    }

    /// Create a frame buffer that treats declared payloads longer than
    /// `max_payload_len` as corruption.
    pub fn with_max_payload(max_payload_len: usize) -> Self {
        Self::with_capacity_and_max_payload(DEFAULT_BUFFER_CAPACITY, max_payload_len)
    }

    /// Create a new frame buffer with custom capacity and payload limit.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_payload_len: max_payload_len.min(MAX_PAYLOAD_LEN),
            discarded: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Frames come out in stream order. Partial data stays buffered for
    /// the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match decode_with_limit(&self.buffer, self.max_payload_len) {
                Decoded::Frame { frame, consumed } => {
                    let frame_len = MIN_FRAME_SIZE + frame.payload_len();
                    self.discarded += (consumed - frame_len) as u64;
                    self.buffer.advance(consumed);
                    frames.push(frame);
                }
                Decoded::NeedMore { discard } => {
                    if discard > 0 {
                        tracing::debug!(bytes = discard, "Discarding unframed bytes");
                        self.discarded += discard as u64;
                        self.buffer.advance(discard);
                    }
                    break;
                }
            }
        }
        frames
    }

    /// Get the number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes dropped as garbage since creation.
    #[inline]
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Address, ControlCode, Sequence, SECOND_MARKER_OFFSET};
    use bytes::Bytes;

    fn make_frame(seq: u16, code: u8, payload: &[u8]) -> Frame {
        Frame::from_parts(
            Address::new([0x10, 0x20, 0x30, 0x40]),
            Sequence::from_counter(seq),
            code,
            payload,
        )
    }

    fn bytes_of(frame: &Frame) -> Vec<u8> {
        encode(frame).unwrap().to_vec()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(1, 0x8C, b"hello");

        let frames = buffer.push(&bytes_of(&frame));

        assert_eq!(frames, vec![frame]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.discarded_bytes(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let sent = vec![
            make_frame(1, 0xA4, b""),
            make_frame(2, 0x8C, b"second"),
            make_frame(3, 0x8C, b"third"),
        ];

        let combined: Vec<u8> = sent.iter().flat_map(bytes_of).collect();
        let frames = buffer.push(&combined);

        assert_eq!(frames, sent);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_frame() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(9, 0x8C, b"this payload arrives in two reads");
        let bytes = bytes_of(&frame);

        let split = 15;
        assert!(buffer.push(&bytes[..split]).is_empty());
        assert_eq!(buffer.len(), split);

        let frames = buffer.push(&bytes[split..]);
        assert_eq!(frames, vec![frame]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(4, ControlCode::LOGIN, b"hi");

        let mut all_frames = Vec::new();
        for byte in bytes_of(&frame) {
            all_frames.extend(buffer.push(&[byte]));
        }

        assert_eq!(all_frames, vec![frame]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = make_frame(1, 0x8C, b"first");
        let second = make_frame(2, 0x8C, b"second");
        let second_bytes = bytes_of(&second);

        let mut data = bytes_of(&first);
        data.extend_from_slice(&second_bytes[..5]);

        assert_eq!(buffer.push(&data), vec![first]);
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.push(&second_bytes[5..]), vec![second]);
    }

    #[test]
    fn test_leading_garbage_is_dropped() {
        let mut buffer = FrameBuffer::new();
        let frame = make_frame(1, 0xA4, b"");

        assert!(buffer.push(&[0x00, 0x01, 0x02]).is_empty());
        assert!(buffer.is_empty());
        assert_eq!(buffer.discarded_bytes(), 3);

        assert_eq!(buffer.push(&bytes_of(&frame)), vec![frame]);
    }

    #[test]
    fn test_corrupt_frame_then_valid_frame() {
        let mut buffer = FrameBuffer::new();
        let bad = make_frame(1, 0x8C, b"bad");
        let good = make_frame(2, 0x8C, b"good");

        let mut data = bytes_of(&bad);
        data[SECOND_MARKER_OFFSET] = 0x00;
        let bad_len = data.len() as u64;
        data.extend_from_slice(&bytes_of(&good));

        assert_eq!(buffer.push(&data), vec![good]);
        assert_eq!(buffer.discarded_bytes(), bad_len);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_declaration_is_skipped() {
        let mut buffer = FrameBuffer::with_max_payload(8);
        let big = make_frame(1, 0x8C, &[0u8; 32]);
        let small = make_frame(2, 0x8C, b"ok");

        let mut data = bytes_of(&big);
        data.extend_from_slice(&bytes_of(&small));

        assert_eq!(buffer.push(&data), vec![small]);
    }

    #[test]
    fn test_payload_survives_buffering() {
        let mut buffer = FrameBuffer::new();
        let frame = Frame::new(
            Address::default(),
            Sequence::default(),
            0x8Cu8,
            Bytes::from_static(b"abc"),
        );
        let frames = buffer.push(&bytes_of(&frame));
        assert_eq!(frames[0].payload_bytes(), Bytes::from_static(b"abc"));
    }
}
