//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForPrefix`: Need at least 8 bytes
//! - `WaitingForBody`: Prefix parsed, need header + payload bytes
//!
//! # Example
//!
//! ```ignore
//! use kernelwire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the stream
//! let frames = buffer.push(&chunk)?;
//!
//! for frame in frames {
//!     println!("Got frame: {}", frame.header_str()?);
//! }
//! ```

use bytes::BytesMut;

use super::wire_format::{
    FramePrefix, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, PREFIX_SIZE,
};
use super::Frame;
use crate::error::Result;

/// Default initial buffer capacity (64 KB).
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the complete length prefix (need 8 bytes).
    WaitingForPrefix,
    /// Prefix parsed, waiting for header and payload bytes.
    WaitingForBody { prefix: FramePrefix },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed header size.
    max_header_size: u32,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max header: 64KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom size limits.
    pub fn with_limits(max_header_size: u32, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            state: State::WaitingForPrefix,
            max_header_size,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames (may be empty if still waiting for
    /// data). Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a length is negative or exceeds the configured limits.
    /// The buffer must not be used after an error; the stream is desynchronized.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let prefix = match FramePrefix::decode(&self.buffer)? {
                        Some(prefix) => prefix,
                        None => return Ok(None),
                    };
                    prefix.validate(self.max_header_size, self.max_payload_size)?;

                    let _ = self.buffer.split_to(PREFIX_SIZE);
                    self.state = State::WaitingForBody { prefix };
                }

                State::WaitingForBody { prefix } => {
                    if self.buffer.len() < prefix.body_length() {
                        return Ok(None);
                    }

                    let header = self.buffer.split_to(prefix.header_length as usize).freeze();
                    let payload = if prefix.has_payload() {
                        Some(self.buffer.split_to(prefix.payload_length as usize).freeze())
                    } else {
                        None
                    };

                    self.state = State::WaitingForPrefix;
                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if a frame has been started but not completed.
    ///
    /// Used to tell a clean end of stream from one that cut a frame in half.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForBody { .. })
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
