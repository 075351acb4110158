//! Wire format encoding and decoding.
//!
//! Every frame starts with an 8-byte length prefix:
//! ```text
//! ┌────────────┬─────────────┬──────────────┬───────────────┐
//! │ Header Len │ Payload Len │ Header bytes │ Payload bytes │
//! │ int32 BE   │ int32 BE    │ UTF-8 text   │ raw           │
//! └────────────┴─────────────┴──────────────┴───────────────┘
//! ```
//!
//! A payload length of 0 means the frame carries no payload.
//! All multi-byte integers are Big Endian.

use crate::error::{ChannelError, Result};

/// Length prefix size in bytes (two int32 values).
pub const PREFIX_SIZE: usize = 8;

/// Default maximum header size (64 KB).
pub const DEFAULT_MAX_HEADER_SIZE: u32 = 64 * 1024;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Absolute maximum header or payload size (max i32).
pub const ABSOLUTE_MAX_SIZE: u32 = 2_147_483_647;

/// Decoded length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    /// Header length in bytes.
    pub header_length: u32,
    /// Payload length in bytes (0 = no payload).
    pub payload_length: u32,
}

impl FramePrefix {
    /// Create a prefix from in-memory lengths.
    ///
    /// Fails if either length does not fit in a signed 32-bit integer.
    pub fn for_lengths(header_length: usize, payload_length: usize) -> Result<Self> {
        Ok(Self {
            header_length: checked_length("header", header_length)?,
            payload_length: checked_length("payload", payload_length)?,
        })
    }

    /// Encode the prefix to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use kernelwire::protocol::FramePrefix;
    ///
    /// let prefix = FramePrefix::for_lengths(20, 5).unwrap();
    /// assert_eq!(prefix.encode(), [0, 0, 0, 20, 0, 0, 0, 5]);
    /// ```
    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        buf[0..4].copy_from_slice(&self.header_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a prefix from bytes.
    ///
    /// Returns `Ok(None)` if the buffer is too short, and an error if either
    /// length is negative when read as int32.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < PREFIX_SIZE {
            return Ok(None);
        }
        let header_length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let payload_length = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if header_length < 0 || payload_length < 0 {
            return Err(ChannelError::Protocol(format!(
                "Negative frame length (header {}, payload {})",
                header_length, payload_length
            )));
        }

        Ok(Some(Self {
            header_length: header_length as u32,
            payload_length: payload_length as u32,
        }))
    }

    /// Validate the prefix against the configured limits.
    ///
    /// Checks:
    /// - Header is not empty (every message carries at least an id)
    /// - Header length doesn't exceed max
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_header_size: u32, max_payload_size: u32) -> Result<()> {
        if self.header_length == 0 {
            return Err(ChannelError::Protocol("Frame header is empty".to_string()));
        }

        if self.header_length > max_header_size {
            return Err(ChannelError::Protocol(format!(
                "Header size {} exceeds maximum {}",
                self.header_length, max_header_size
            )));
        }

        if self.payload_length > max_payload_size {
            return Err(ChannelError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    /// Number of bytes following the prefix.
    #[inline]
    pub fn body_length(&self) -> usize {
        self.header_length as usize + self.payload_length as usize
    }

    /// Check if the frame carries a payload.
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.payload_length > 0
    }
}

fn checked_length(what: &str, length: usize) -> Result<u32> {
    u32::try_from(length)
        .ok()
        .filter(|&len| len <= ABSOLUTE_MAX_SIZE)
        .ok_or_else(|| {
            ChannelError::Protocol(format!(
                "{} size {} exceeds maximum {}",
                what, length, ABSOLUTE_MAX_SIZE
            ))
        })
}
