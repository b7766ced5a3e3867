//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the meter link-layer protocol:
//! - Frame encoding/decoding with checksum and resynchronization
//! - Frame buffer for accumulating partial reads
//! - Frame struct and control codes

mod control;
mod frame;
mod frame_buffer;
mod wire_format;

pub use control::ControlCode;
pub use frame::{Address, Frame, Sequence};
pub use frame_buffer::{FrameBuffer, DEFAULT_BUFFER_CAPACITY};
pub use wire_format::{
    checksum, decode, decode_at, decode_with_limit, encode, encode_into, Decoded, END_MARKER,
    HEADER_SIZE, MAX_PAYLOAD_LEN, MIN_FRAME_SIZE, SECOND_MARKER_OFFSET, START_MARKER,
    TRAILER_SIZE,
};
