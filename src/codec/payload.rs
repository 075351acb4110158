//! Positional payload codec.
//!
//! A payload is a flat sequence of fields with no schema on the wire; both
//! sides agree on the field order per command:
//! ```text
//! variable field: ┌───────────┬────────────┐   fixed field: ┌──────────┐
//!                 │ length    │ raw bytes  │                │ int32 BE │
//!                 │ int32 BE  │            │                └──────────┘
//!                 └───────────┴────────────┘
//! ```
//! Strings are variable fields holding UTF-8.
//!
//! # Example
//!
//! ```
//! use kernelwire::codec::{PayloadDecoder, PayloadEncoder};
//!
//! let mut encoder = PayloadEncoder::new();
//! encoder.put_string("table")?.put_int(0).put_int(99);
//! let payload = encoder.finish();
//!
//! let mut decoder = PayloadDecoder::new(payload);
//! assert_eq!(decoder.next_string()?, "table");
//! assert_eq!(decoder.next_int()?, 0);
//! assert_eq!(decoder.next_int()?, 99);
//! # Ok::<(), kernelwire::ChannelError>(())
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ChannelError, Result};

/// Initial encoder capacity in bytes.
pub const INITIAL_CAPACITY: usize = 1024;

/// Size of a length prefix or fixed int field.
const INT_SIZE: usize = 4;

/// Append-only encoder over a growable buffer.
///
/// Starts at [`INITIAL_CAPACITY`] and doubles whenever a write would not
/// fit, keeping everything written so far.
#[derive(Debug)]
pub struct PayloadEncoder {
    buf: BytesMut,
}

impl PayloadEncoder {
    /// Create an encoder with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Create an encoder with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.max(INT_SIZE)),
        }
    }

    /// Append a UTF-8 string as a variable-length field.
    pub fn put_string(&mut self, value: &str) -> Result<&mut Self> {
        self.put_bytes(value.as_bytes())
    }

    /// Append raw bytes as a variable-length field.
    ///
    /// # Errors
    ///
    /// Fails if the field is longer than `i32::MAX` bytes.
    pub fn put_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        let length = i32::try_from(value.len()).map_err(|_| {
            ChannelError::InvalidPayload(format!(
                "Field of {} bytes does not fit an int32 length",
                value.len()
            ))
        })?;

        self.make_space(INT_SIZE + value.len());
        self.buf.put_i32(length);
        self.buf.put_slice(value);
        Ok(self)
    }

    /// Append a fixed-width int32 field.
    pub fn put_int(&mut self, value: i32) -> &mut Self {
        self.make_space(INT_SIZE);
        self.buf.put_i32(value);
        self
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Finish encoding and return the written bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Double the capacity until `size` more bytes fit.
    fn make_space(&mut self, size: usize) {
        let mut capacity = self.buf.capacity();
        while capacity - self.buf.len() < size {
            capacity *= 2;
        }
        if capacity > self.buf.capacity() {
            self.buf.reserve(capacity - self.buf.len());
        }
    }
}

impl Default for PayloadEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Positional decoder over a received payload.
///
/// Each `next_*` call consumes exactly what the matching `put_*` wrote.
/// Byte fields are returned as zero-copy slices of the payload.
#[derive(Debug, Clone)]
pub struct PayloadDecoder {
    buf: Bytes,
}

impl PayloadDecoder {
    /// Create a decoder over a payload.
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }

    /// Read the next variable-length field as a UTF-8 string.
    pub fn next_string(&mut self) -> Result<String> {
        let bytes = self.next_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ChannelError::InvalidPayload(format!("String field is not UTF-8: {}", e)))
    }

    /// Read the next variable-length field as raw bytes.
    pub fn next_bytes(&mut self) -> Result<Bytes> {
        let length = self.next_int()?;
        let length = usize::try_from(length).map_err(|_| {
            ChannelError::InvalidPayload(format!("Negative field length {}", length))
        })?;
        self.ensure(length)?;
        Ok(self.buf.split_to(length))
    }

    /// Read the next fixed-width int32 field.
    pub fn next_int(&mut self) -> Result<i32> {
        self.ensure(INT_SIZE)?;
        Ok(self.buf.get_i32())
    }

    /// Number of unread bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ChannelError::InvalidPayload(format!(
                "Payload truncated: need {} bytes, {} left",
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_fields_decode_in_order() {
        let mut encoder = PayloadEncoder::new();
        encoder
            .put_string("sql")
            .unwrap()
            .put_bytes(&[1, 2, 3])
            .unwrap()
            .put_int(-7);

        let mut decoder = PayloadDecoder::new(encoder.finish());
        assert_eq!(decoder.next_string().unwrap(), "sql");
        assert_eq!(&decoder.next_bytes().unwrap()[..], &[1, 2, 3]);
        assert_eq!(decoder.next_int().unwrap(), -7);
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_wire_layout() {
        let mut encoder = PayloadEncoder::new();
        encoder.put_string("ab").unwrap().put_int(258);

        let bytes = encoder.finish();
        assert_eq!(&bytes[..], &[0, 0, 0, 2, b'a', b'b', 0, 0, 1, 2]);
    }

    #[test]
    fn test_growth_beyond_initial_capacity() {
        let big = "x".repeat(5000);
        let mut encoder = PayloadEncoder::new();
        assert!(encoder.capacity() >= INITIAL_CAPACITY);

        encoder.put_int(1);
        encoder.put_string(&big).unwrap();
        encoder.put_int(2);

        assert_eq!(encoder.len(), 4 + 4 + 5000 + 4);
        assert!(encoder.capacity() >= encoder.len());

        let mut decoder = PayloadDecoder::new(encoder.finish());
        assert_eq!(decoder.next_int().unwrap(), 1);
        assert_eq!(decoder.next_string().unwrap(), big);
        assert_eq!(decoder.next_int().unwrap(), 2);
    }

    #[test]
    fn test_growth_keeps_earlier_fields() {
        let mut encoder = PayloadEncoder::with_capacity(8);
        for i in 0..100 {
            encoder.put_int(i);
        }

        let mut decoder = PayloadDecoder::new(encoder.finish());
        for i in 0..100 {
            assert_eq!(decoder.next_int().unwrap(), i);
        }
    }

    #[test]
    fn test_utf8_string() {
        let mut encoder = PayloadEncoder::new();
        encoder.put_string("grüße, 世界").unwrap();

        let mut decoder = PayloadDecoder::new(encoder.finish());
        assert_eq!(decoder.next_string().unwrap(), "grüße, 世界");
    }

    #[test]
    fn test_empty_fields() {
        let mut encoder = PayloadEncoder::new();
        encoder.put_string("").unwrap().put_bytes(&[]).unwrap();

        let mut decoder = PayloadDecoder::new(encoder.finish());
        assert_eq!(decoder.next_string().unwrap(), "");
        assert!(decoder.next_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_payload() {
        let mut decoder = PayloadDecoder::new(Bytes::from_static(&[0, 0, 0, 10, 1, 2]));
        let err = decoder.next_bytes().unwrap_err();
        assert!(err.to_string().contains("truncated"));

        let mut decoder = PayloadDecoder::new(Bytes::from_static(&[0, 0]));
        assert!(decoder.next_int().is_err());
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut decoder = PayloadDecoder::new(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]));
        let err = decoder.next_string().unwrap_err();
        assert!(err.to_string().contains("Negative"));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut decoder = PayloadDecoder::new(Bytes::from_static(&[0, 0, 0, 2, 0xc3, 0x28]));
        assert!(matches!(
            decoder.next_string(),
            Err(ChannelError::InvalidPayload(_))
        ));
    }
}
