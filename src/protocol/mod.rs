//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the byte-level framing of the channel:
//! - 8-byte length prefix encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    FramePrefix, ABSOLUTE_MAX_SIZE, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE,
    PREFIX_SIZE,
};
