//! Internal: Declare an Error type for tunnel-bytes

use thiserror::Error;

/// Error type for decoding tunnel records from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The record ended before all of its fields were present.
    #[error("record truncated (or not fully present)")]
    Truncated,
    /// Extra bytes followed a record that should have filled its buffer.
    #[error("extra bytes at end of record")]
    ExtraneousBytes,
    /// A field held a value that the record format does not allow.
    #[error("bad record: {0}")]
    BadMessage(&'static str),
    /// A length or offset field pointed outside of the buffer.
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}
