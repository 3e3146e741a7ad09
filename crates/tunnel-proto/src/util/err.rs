//! Define an error type for the tunnel-proto crate.
use thiserror::Error;

/// An error type for the tunnel-proto crate.
///
/// Most of these describe a cell or fragment that we had to drop.  The
/// last few describe bugs: they should never happen, and when they do
/// we log them loudly and abandon whatever we were doing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred in the tunnel_bytes crate while decoding
    /// an object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] tunnel_bytes::Error),
    /// A cell or record was malformed.
    #[error("cell error: {0}")]
    CellErr(#[from] tunnel_cell::Error),
    /// A fragment was inconsistent with the others for its message.
    #[error("corrupt fragment: {0}")]
    Corrupt(&'static str),
    /// The keys for this hop have already been destroyed.
    #[error("hop keys were destroyed")]
    MissingKey,
    /// A reply record failed its integrity check.
    #[error("reply record failed authentication")]
    BadAuth,
    /// Tried to use a hop that isn't in the route.
    #[error("no such hop in tunnel")]
    NoSuchHop,
    /// A message was too long to fit in the largest possible number of
    /// fragments.
    #[error("message of {0} bytes is too long for a tunnel")]
    MessageTooLong(usize),
    /// Something was released to the buffer pool twice.
    #[error("buffer released twice")]
    DoubleRelease,
    /// A buffer was used after it was released to the pool.
    #[error("buffer used after release")]
    UseAfterRelease,
    /// There was a programming error somewhere in the code.
    #[error("internal programming error: {0}")]
    Internal(&'static str),
}
