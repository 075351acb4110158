//! Frame reader over the read half of the stream.
//!
//! Wraps an [`AsyncRead`] with a [`FrameBuffer`] and yields one complete
//! frame per call. Frames that arrive together in one read are queued and
//! handed out in arrival order.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ChannelError, Result};
use crate::protocol::{Frame, FrameBuffer, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};

/// Default read buffer size (64 KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads length-prefixed frames from a byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with default limits.
    pub fn new(reader: R) -> Self {
        Self::with_limits(
            reader,
            DEFAULT_READ_BUFFER_SIZE,
            DEFAULT_MAX_HEADER_SIZE,
            DEFAULT_MAX_PAYLOAD_SIZE,
        )
    }

    /// Create a reader with a custom read buffer size and frame limits.
    pub fn with_limits(
        reader: R,
        read_buffer_size: usize,
        max_header_size: u32,
        max_payload_size: u32,
    ) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_limits(max_header_size, max_payload_size),
            ready: VecDeque::new(),
            chunk: vec![0u8; read_buffer_size.max(1)],
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
    ///
    /// # Errors
    ///
    /// - `Io(UnexpectedEof)` if the stream ends in the middle of a frame
    /// - `Protocol` on negative or oversized lengths
    ///
    /// # Cancel safety
    ///
    /// Cancel-safe: bytes already read stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.is_mid_frame() {
                    return Err(ChannelError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("stream closed mid-frame ({} bytes buffered)", self.buffer.len()),
                    )));
                }
                return Ok(None);
            }

            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }

    /// Get a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}
