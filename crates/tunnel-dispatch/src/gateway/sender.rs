//! Encrypt finished cells and hand them to the transport.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;
use tunnel_cell::cell::RawCell;
use tunnel_cell::i2np::TunnelData;
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_proto::batch::CellSink;
use tunnel_proto::hop::HopRecord;
use tunnel_proto::route::TunnelRoute;

use crate::traits::{Priority, Transport};

/// The layer encryption a gateway applies to each cell.
pub(crate) enum CellCrypto {
    /// Our own outbound tunnel: pre-apply every relay's layer.
    Outbound(Arc<TunnelRoute>),
    /// Someone's inbound tunnel, where we are the gateway: apply ours.
    Relay(Arc<HopRecord>),
}

impl CellCrypto {
    /// Encrypt `cell` in place.  Returns false if the keys are gone.
    fn apply(&self, cell: &mut [u8]) -> bool {
        match self {
            CellCrypto::Outbound(route) => route.encrypt_outbound(cell),
            CellCrypto::Relay(hop) => {
                let ok = hop.peel_one_hop(cell);
                if ok {
                    hop.incr_processed(1);
                }
                ok
            }
        }
    }

    /// Release the keys.
    pub(crate) fn destroy(&self) {
        match self {
            CellCrypto::Outbound(route) => route.destroy(),
            CellCrypto::Relay(hop) => hop.destroy(),
        }
    }
}

/// A [`CellSink`] that encrypts cells and sends them to the next hop.
pub(crate) struct TunnelSender<'a> {
    /// How to encrypt.
    pub(crate) crypto: &'a CellCrypto,
    /// Where to send.
    pub(crate) transport: &'a dyn Transport,
    /// The next router.
    pub(crate) next_hop: &'a RouterHash,
    /// Tunnel id the next router knows this tunnel by.
    pub(crate) send_tunnel: TunnelId,
    /// Expiration stamped on each TunnelData message.
    pub(crate) expiration: u64,
    /// Transport priority.
    pub(crate) priority: Priority,
    /// Cells sent.
    pub(crate) sent: usize,
    /// Cells dropped because the keys were gone.
    pub(crate) failed: usize,
}

impl CellSink for TunnelSender<'_> {
    fn send_cell(&mut self, mut cell: Box<RawCell>) {
        if !self.crypto.apply(&mut cell[..]) {
            debug!("Dropping cell for destroyed tunnel {}", self.send_tunnel);
            self.failed += 1;
            return;
        }
        let id = rand::thread_rng().gen_range(1..=u32::MAX).into();
        let msg = TunnelData::new(self.send_tunnel, cell).into_message(id, self.expiration);
        self.transport.send(self.next_hop, msg, self.priority);
        self.sent += 1;
    }
}
