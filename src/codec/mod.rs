//! Codec module - positional payload encoding.
//!
//! Payloads are thin agreed-upon binary records: a sequence of
//! length-prefixed byte strings, UTF-8 strings, and fixed-width int32 values.
//! There is no schema on the wire; both sides read fields back in the order
//! they were written.
//!
//! - [`PayloadEncoder`] - append-only writer over a growable buffer
//! - [`PayloadDecoder`] - positional reader over received bytes (zero-copy)

mod payload;

pub use payload::{PayloadDecoder, PayloadEncoder, INITIAL_CAPACITY};
