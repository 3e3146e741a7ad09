//! The last hop of someone else's outbound tunnel.
//!
//! An outbound endpoint peels the final layer, reassembles whole
//! messages from the cells, and sends each one wherever its delivery
//! instructions say.  Everything it sends is on behalf of a stranger,
//! so it is shaped like any other participating traffic.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::i2np::{I2npMessage, TunnelData};
use tunnel_cell::ids::RouterHash;
use tunnel_proto::hop::HopRecord;
use tunnel_proto::reassembly::{MessageReceiver, ReassemblyEngine};
use tunnel_rtcompat::Runtime;

use crate::context::Context;
use crate::role::outbound::OutboundDistributor;
use crate::shaper::{Location, SyntheticRed};
use crate::traits::Priority;

/// Recent corrupt cells, by the router that sent them.
pub(crate) struct CorruptionTracker {
    /// Bad cells within the window that trigger a ban.
    threshold: u32,
    /// How far back we count.
    window: Duration,
    /// When each recent bad cell arrived, by sender.
    seen: Mutex<HashMap<RouterHash, VecDeque<Instant>>>,
}

impl CorruptionTracker {
    /// Create an empty tracker.
    pub(crate) fn new(threshold: u32, window: Duration) -> Self {
        CorruptionTracker {
            threshold,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Note a corrupt cell from `peer` at `now`.  Returns true when
    /// `peer` has now crossed the threshold; its history is then reset.
    pub(crate) fn record(&self, peer: &RouterHash, now: Instant) -> bool {
        let mut seen = self.seen.lock();
        let times = seen.entry(*peer).or_default();
        while matches!(times.front(), Some(t) if now.saturating_duration_since(*t) > self.window) {
            times.pop_front();
        }
        times.push_back(now);
        if times.len() as u32 >= self.threshold {
            seen.remove(peer);
            return true;
        }
        false
    }
}

/// Handles the messages an outbound endpoint reassembles.
struct EndpointReceiver<R: Runtime> {
    /// Sends them on.
    distributor: Arc<OutboundDistributor<R>>,
    /// This hop's shaping state, shared with the distributor.
    red: Arc<SyntheticRed>,
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
}

impl<R: Runtime> MessageReceiver for EndpointReceiver<R> {
    fn receive_complete(&self, bytes: &[u8], delivery: Delivery) {
        let msg = match I2npMessage::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!("Unparseable message at outbound endpoint: {}", e);
                return;
            }
        };
        let target = match delivery.router() {
            Some(r) => *r,
            None => {
                warn!("Outbound endpoint got a {} for local delivery; dropping", msg.msg_type());
                return;
            }
        };
        if target != self.ctx.services.us
            && self.ctx.shaper.should_drop(
                Location::OutboundEndpoint,
                msg.msg_type(),
                bytes.len(),
                Some(&self.red),
                self.ctx.now(),
            )
        {
            return;
        }
        self.distributor.distribute(msg, delivery);
    }
}

/// Peels and reassembles at the end of someone's outbound tunnel.
pub(crate) struct OutboundEndpoint<R: Runtime> {
    /// Our hop of the tunnel.
    hop: Arc<HopRecord>,
    /// Turns cells into messages.
    reassembly: ReassemblyEngine<R>,
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
}

impl<R: Runtime> OutboundEndpoint<R> {
    /// Set up an endpoint for `hop`.
    pub(crate) fn new(ctx: Arc<Context<R>>, hop: Arc<HopRecord>) -> Self {
        let red = Arc::new(ctx.shaper.hop_estimator(hop.allocated_bw(), ctx.now()));
        let distributor = Arc::new(OutboundDistributor::new(
            Arc::clone(&ctx),
            Priority::PARTICIPATING,
            Some(Arc::clone(&red)),
        ));
        let receiver = Arc::new(EndpointReceiver {
            distributor,
            red,
            ctx: Arc::clone(&ctx),
        });
        let reassembly = ReassemblyEngine::new(
            ctx.runtime.clone(),
            ctx.config.reassembly().clone(),
            Arc::clone(&ctx.pool),
            receiver,
            Arc::clone(&ctx.reassembly_stats),
        );
        OutboundEndpoint {
            hop,
            reassembly,
            ctx,
        }
    }

    /// Handle one cell from the previous hop.  Returns false if it was
    /// dropped.
    pub(crate) fn dispatch(&self, mut msg: TunnelData, from: &RouterHash) -> bool {
        if !self.hop.peel_one_hop(msg.cell_mut()) {
            debug!("Can't peel cell on tunnel {}: keys gone", self.hop.receive_tunnel());
            return false;
        }
        self.hop.incr_processed(1);
        if self.reassembly.receive(msg.cell()) {
            return true;
        }
        debug!(
            "Corrupt cell from {} at endpoint of tunnel {}",
            from,
            self.hop.receive_tunnel()
        );
        let profiles = &self.ctx.services.profiles;
        profiles.tunnel_failed(from, 50);
        if self.ctx.corruption.record(from, self.ctx.now()) {
            warn!("Banning {}: repeatedly sent corrupt tunnel cells", from);
            profiles.ban(from, "corrupt tunnel cells", self.ctx.config.corrupt_ban());
        }
        false
    }

    /// Return this hop.
    pub(crate) fn hop(&self) -> &Arc<HopRecord> {
        &self.hop
    }

    /// Discard partial messages and release their buffers.
    pub(crate) fn clear(&self) {
        self.reassembly.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn corruption_window() {
        let t = CorruptionTracker::new(3, Duration::from_secs(600));
        let bad = RouterHash::new([9; 32]);
        let other = RouterHash::new([8; 32]);
        let t0 = Instant::now();
        assert!(!t.record(&bad, t0));
        assert!(!t.record(&bad, t0 + Duration::from_secs(100)));
        // The first one has aged out by now.
        assert!(!t.record(&bad, t0 + Duration::from_secs(700)));
        assert!(!t.record(&other, t0 + Duration::from_secs(701)));
        assert!(t.record(&bad, t0 + Duration::from_secs(701)));
        // Reset after reporting.
        assert!(!t.record(&bad, t0 + Duration::from_secs(702)));
    }
}
