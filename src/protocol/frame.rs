//! Frame struct with typed accessors.
//!
//! Represents one length-prefixed header + payload unit read off the wire.
//! Uses `bytes::Bytes` for zero-copy sharing of both parts.
//!
//! # Example
//!
//! ```
//! use kernelwire::protocol::Frame;
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Bytes::from_static(b"@id=1@command=getpid"), None);
//!
//! assert_eq!(frame.header_str().unwrap(), "@id=1@command=getpid");
//! assert!(frame.payload().is_none());
//! ```

use bytes::Bytes;

use super::wire_format::{FramePrefix, PREFIX_SIZE};
use crate::error::{ChannelError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header bytes (UTF-8 text).
    pub header: Bytes,
    /// Payload bytes, `None` when the frame carried no payload.
    pub payload: Option<Bytes>,
}

impl Frame {
    /// Create a new frame from header and payload.
    ///
    /// An empty payload is stored as `None`, since it is indistinguishable
    /// from an absent payload on the wire.
    pub fn new(header: Bytes, payload: Option<Bytes>) -> Self {
        Self {
            header,
            payload: payload.filter(|p| !p.is_empty()),
        }
    }

    /// Decode the header as UTF-8 text.
    pub fn header_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.header)
            .map_err(|e| ChannelError::InvalidMessage(format!("Header is not valid UTF-8: {}", e)))
    }

    /// Get a reference to the payload bytes, if any.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Get the payload length (0 when absent).
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes the length prefix and appends header and payload into a
/// contiguous buffer.
///
/// # Example
///
/// ```
/// use kernelwire::protocol::{build_frame, PREFIX_SIZE};
///
/// let bytes = build_frame(b"@id=0@command=reset", Some(&b"xy"[..])).unwrap();
/// assert_eq!(bytes.len(), PREFIX_SIZE + 19 + 2);
/// ```
pub fn build_frame(header: &[u8], payload: Option<&[u8]>) -> Result<Vec<u8>> {
    let payload = payload.unwrap_or_default();
    let prefix = FramePrefix::for_lengths(header.len(), payload.len())?;

    let mut buf = Vec::with_capacity(PREFIX_SIZE + header.len() + payload.len());
    buf.extend_from_slice(&prefix.encode());
    buf.extend_from_slice(header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(
            Bytes::from_static(b"@id=3@command=execute"),
            Some(Bytes::from_static(b"hello")),
        );

        assert_eq!(frame.header_str().unwrap(), "@id=3@command=execute");
        assert_eq!(frame.payload(), Some(&b"hello"[..]));
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn test_frame_empty_payload_is_absent() {
        let frame = Frame::new(Bytes::from_static(b"@id=1@command=x"), Some(Bytes::new()));

        assert!(frame.payload.is_none());
        assert_eq!(frame.payload_len(), 0);
    }

    #[test]
    fn test_frame_invalid_utf8_header() {
        let frame = Frame::new(Bytes::from_static(&[0xff, 0xfe]), None);
        let err = frame.header_str().unwrap_err();
        assert!(matches!(err, ChannelError::InvalidMessage(_)));
    }

    #[test]
    fn test_build_frame_layout() {
        let bytes = build_frame(b"head", Some(&b"body!"[..])).unwrap();

        assert_eq!(bytes.len(), PREFIX_SIZE + 4 + 5);
        assert_eq!(&bytes[0..4], &4i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &5i32.to_be_bytes());
        assert_eq!(&bytes[8..12], b"head");
        assert_eq!(&bytes[12..], b"body!");
    }

    #[test]
    fn test_build_frame_without_payload() {
        let bytes = build_frame(b"head", None).unwrap();

        assert_eq!(bytes.len(), PREFIX_SIZE + 4);
        assert_eq!(&bytes[4..8], &0i32.to_be_bytes());
    }

    #[test]
    fn test_build_frame_roundtrip() {
        use super::super::FrameBuffer;

        let bytes = build_frame(b"@id=7@command=getTable", Some(&b"0123456789"[..])).unwrap();

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header_str().unwrap(), "@id=7@command=getTable");
        assert_eq!(frames[0].payload(), Some(&b"0123456789"[..]));
    }
}
