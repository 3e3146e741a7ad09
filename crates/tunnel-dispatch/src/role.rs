//! Handlers for each role this router can play in a tunnel.

pub(crate) mod endpoint;
pub(crate) mod filter;
pub(crate) mod inbound;
pub(crate) mod outbound;
pub(crate) mod participant;

use tunnel_cell::i2np::TunnelData;
use tunnel_cell::ids::RouterHash;
use tunnel_rtcompat::Runtime;

use inbound::InboundEndpoint;
use participant::Participant;

/// What we do with a cell that arrives on a tunnel id in the
/// participant table.
pub(crate) enum ParticipantRole<R: Runtime> {
    /// Peel and pass on.
    Relay(Participant<R>),
    /// Decrypt and reassemble: the tunnel is one of our inbound ones.
    InboundEndpoint(InboundEndpoint<R>),
}

impl<R: Runtime> ParticipantRole<R> {
    /// Handle one cell.  Returns false if it was dropped.
    pub(crate) fn dispatch(&self, msg: TunnelData, expiration: u64, from: &RouterHash) -> bool {
        match self {
            ParticipantRole::Relay(p) => p.dispatch(msg, expiration, from),
            ParticipantRole::InboundEndpoint(e) => e.dispatch(msg, from),
        }
    }

    /// Release whatever this role holds.
    pub(crate) fn destroy(&self) {
        match self {
            ParticipantRole::Relay(p) => p.hop().destroy(),
            ParticipantRole::InboundEndpoint(e) => {
                e.clear();
                e.route().destroy();
            }
        }
    }
}
