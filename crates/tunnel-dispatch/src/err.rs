//! Declare error types for tunnel-dispatch

use thiserror::Error;
use tunnel_cell::ids::TunnelId;

/// An error returned by the dispatch layer.
///
/// Data-plane entry points mostly report a dropped message with
/// `false`; these errors are for the cases where a caller has to make
/// a decision, such as a duplicate registration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Some role is already registered under this tunnel id.
    #[error("Tunnel id {0} is already registered")]
    AlreadyRegistered(TunnelId),

    /// A tunnel id of zero can't be registered.
    #[error("Tunnel id zero is reserved")]
    ZeroTunnelId,

    /// A hop or route lacks a piece it needs for this role.
    #[error("Can't join tunnel: {0}")]
    BadRoute(&'static str),

    /// A message's expiration was too far in the past or future.
    #[error("Message expiration {expiration} is outside [{earliest}, {latest}]")]
    BadExpiration {
        /// The offending expiration, ms since the epoch.
        expiration: u64,
        /// Earliest acceptable value.
        earliest: u64,
        /// Latest acceptable value.
        latest: u64,
    },

    /// The dispatch table has been shut down.
    #[error("Dispatcher is shut down")]
    Shutdown,

    /// A protocol error while handling a tunnel.
    #[error("Protocol error: {0}")]
    Proto(#[from] tunnel_proto::Error),

    /// A malformed message or cell.
    #[error("Cell error: {0}")]
    Cell(#[from] tunnel_cell::Error),

    /// An I/O error, such as failing to start a pump thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error of some kind that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}
