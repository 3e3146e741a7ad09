//! The end of one of our own inbound tunnels.

use std::sync::Arc;

use tracing::{debug, info, warn};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::i2np::{I2npMessage, TunnelData};
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_proto::reassembly::{MessageReceiver, ReassemblyEngine};
use tunnel_proto::route::TunnelRoute;
use tunnel_rtcompat::Runtime;

use crate::context::Context;
use crate::role::filter::{self, TunnelTrust, Verdict};

/// Delivers messages that come out of one of our inbound tunnels.
pub(crate) struct InboundDistributor<R: Runtime> {
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
    /// The client this tunnel serves, or None if exploratory.
    client: Option<RouterHash>,
    /// Our id for the tunnel.
    tunnel: TunnelId,
}

impl<R: Runtime> InboundDistributor<R> {
    /// Construct the distributor for `route`.
    pub(crate) fn new(ctx: Arc<Context<R>>, route: &TunnelRoute) -> Self {
        InboundDistributor {
            ctx,
            client: route.destination().copied(),
            tunnel: route.local_id(),
        }
    }

    /// Return the trust level of our tunnel.
    fn trust(&self) -> TunnelTrust {
        if self.client.is_some() {
            TunnelTrust::Client
        } else {
            TunnelTrust::Exploratory
        }
    }

    /// Check `msg` against the exit filter, and send it where
    /// `delivery` says.
    pub(crate) fn distribute(&self, msg: I2npMessage, delivery: Delivery) {
        match filter::check(self.trust(), &msg) {
            Verdict::Accept => {}
            Verdict::Ignore(why) => {
                info!("Ignoring {} from inbound tunnel {}: {}", msg.msg_type(), self.tunnel, why);
                return;
            }
            Verdict::Dangerous(why) => {
                warn!(
                    "Dropped dangerous {} from inbound tunnel {}: {}",
                    msg.msg_type(),
                    self.tunnel,
                    why
                );
                self.ctx.stats.dangerous_dropped.inc();
                return;
            }
        }

        // Only an instruction naming no router, or naming us with no
        // tunnel, is delivered here.  Anything else, one of our own
        // tunnels included, goes out through an outbound tunnel.
        let ctx = &self.ctx;
        let target = match (delivery.router(), delivery.tunnel()) {
            (Some(r), Some(_)) => *r,
            (Some(r), None) if *r != ctx.services.us => *r,
            _ => {
                ctx.deliver_local(msg, Some(self.tunnel));
                return;
            }
        };
        let out = match ctx.services.selector.select_outbound(self.client.as_ref(), &target) {
            Some(t) => t,
            None => {
                debug!("No outbound tunnel to route {} on to {}", msg.msg_type(), target);
                return;
            }
        };
        let mut msg = msg;
        let floor = ctx.forward_expiration();
        if msg.expiration() < floor {
            msg.set_expiration(floor);
        }
        match ctx.table() {
            Some(t) => {
                if let Err(e) = t.dispatch_outbound(msg, out, delivery.tunnel(), target) {
                    debug!("Couldn't route message on from tunnel {}: {}", self.tunnel, e);
                }
            }
            None => debug!("Dropping onward message after shutdown"),
        }
    }
}

impl<R: Runtime> MessageReceiver for InboundDistributor<R> {
    fn receive_complete(&self, bytes: &[u8], delivery: Delivery) {
        match I2npMessage::decode(bytes) {
            Ok(msg) => self.distribute(msg, delivery),
            Err(e) => debug!("Unparseable message from inbound tunnel {}: {}", self.tunnel, e),
        }
    }
}

/// Decrypts and reassembles at the end of our own inbound tunnel.
pub(crate) struct InboundEndpoint<R: Runtime> {
    /// The tunnel.
    route: Arc<TunnelRoute>,
    /// Turns cells into messages.
    reassembly: ReassemblyEngine<R>,
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
}

impl<R: Runtime> InboundEndpoint<R> {
    /// Set up the endpoint for `route`.
    pub(crate) fn new(ctx: Arc<Context<R>>, route: Arc<TunnelRoute>) -> Self {
        let distributor = Arc::new(InboundDistributor::new(Arc::clone(&ctx), &route));
        let reassembly = ReassemblyEngine::new(
            ctx.runtime.clone(),
            ctx.config.reassembly().clone(),
            Arc::clone(&ctx.pool),
            distributor,
            Arc::clone(&ctx.reassembly_stats),
        );
        InboundEndpoint {
            route,
            reassembly,
            ctx,
        }
    }

    /// Handle one cell from the last relay.  Returns false if it was
    /// dropped.
    pub(crate) fn dispatch(&self, mut msg: TunnelData, from: &RouterHash) -> bool {
        if !self.route.decrypt_inbound(msg.cell_mut()) {
            debug!("Can't decrypt cell from {} on our tunnel {}", from, self.route.local_id());
            return false;
        }
        self.route.incr_processed_messages(1);
        if self.reassembly.receive(msg.cell()) {
            return true;
        }
        self.blame_hops();
        false
    }

    /// Charge every relay of the tunnel with an equal share of the
    /// failure; we can't tell which one corrupted the cell.
    fn blame_hops(&self) {
        let relays = self.route.len().saturating_sub(1);
        if relays == 0 {
            return;
        }
        let pct = (100 / relays) as u32;
        debug!(
            "Corrupt cell on our tunnel {}; blaming {} relays {}% each",
            self.route.local_id(),
            relays,
            pct
        );
        for peer in (0..relays).filter_map(|i| self.route.peer(i)) {
            self.ctx.services.profiles.tunnel_failed(peer, pct);
        }
    }

    /// Return the tunnel.
    pub(crate) fn route(&self) -> &Arc<TunnelRoute> {
        &self.route
    }

    /// Discard partial messages and release their buffers.
    pub(crate) fn clear(&self) {
        self.reassembly.clear();
    }
}
