//! Define an error type for the tunnel-cell crate.
use thiserror::Error;

/// An error that occurred while decoding or encoding a tunnel record.
///
/// Every one of these, when it comes from the network, means that a
/// cell was corrupt: the caller drops that cell and keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An error from the tunnel_bytes crate while decoding a record.
    #[error("parsing error: {0}")]
    BytesErr(#[from] tunnel_bytes::Error),
    /// The SHA-256 checksum at the front of a cell did not match.
    #[error("cell checksum mismatch")]
    BadChecksum,
    /// A cell had no zero byte terminating its padding.
    #[error("no padding terminator in cell")]
    NoTerminator,
    /// A buffer that should hold a cell had the wrong length.
    #[error("bad cell length {0}")]
    BadCellLength(usize),
    /// A delivery instruction used the reserved delivery type.
    #[error("undefined delivery type")]
    UndefinedDeliveryType,
    /// A TUNNEL delivery instruction named tunnel 0.
    #[error("tunnel delivery to tunnel id 0")]
    ZeroTunnelId,
    /// A fragment was larger than any fragment can legitimately be.
    #[error("fragment of {0} bytes is too large")]
    FragmentTooLarge(usize),
    /// A follow-on fragment claimed a fragment number outside 1..=63.
    #[error("bad fragment number {0}")]
    BadFragmentNumber(u8),
    /// An I2NP message was malformed.
    #[error("bad I2NP message: {0}")]
    BadMessage(&'static str),
    /// There was a programming error somewhere in the code.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}
