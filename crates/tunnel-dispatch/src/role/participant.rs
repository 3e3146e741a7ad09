//! A middle hop in someone else's tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use tunnel_cell::cell::CELL_LEN;
use tunnel_cell::i2np::{MessageType, TunnelData};
use tunnel_cell::ids::RouterHash;
use tunnel_proto::hop::HopRecord;
use tunnel_rtcompat::Runtime;

use crate::context::Context;
use crate::shaper::{Location, SyntheticRed};
use crate::traits::Priority;
use crate::{Error, Result};

/// Peels one layer off each cell and passes it on.
pub(crate) struct Participant<R: Runtime> {
    /// Our hop of the tunnel.
    hop: Arc<HopRecord>,
    /// The router we forward to.
    next_hop: RouterHash,
    /// Set once we know how to reach `next_hop`.
    next_hop_known: Arc<AtomicBool>,
    /// Shaping state for this hop.
    red: SyntheticRed,
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
}

impl<R: Runtime> Participant<R> {
    /// Set up forwarding for `hop`.
    ///
    /// If we don't know the next hop yet, we start looking it up now,
    /// so that it's likely known when the first cell arrives.
    pub(crate) fn new(ctx: Arc<Context<R>>, hop: Arc<HopRecord>) -> Result<Self> {
        let next_hop = *hop
            .next_hop()
            .ok_or(Error::BadRoute("participant has no next hop"))?;
        let known = Arc::new(AtomicBool::new(ctx.services.netdb.is_known(&next_hop)));
        if !known.load(Ordering::Relaxed) {
            let flag = Arc::clone(&known);
            ctx.services.netdb.lookup(
                &next_hop,
                ctx.config.long_lookup_timeout(),
                Box::new(move |found| {
                    if found {
                        flag.store(true, Ordering::Relaxed);
                    }
                }),
            );
        }
        let red = ctx.shaper.hop_estimator(hop.allocated_bw(), ctx.now());
        Ok(Participant {
            hop,
            next_hop,
            next_hop_known: known,
            red,
            ctx,
        })
    }

    /// Handle one cell from the previous hop.  Returns false if it was
    /// dropped.
    ///
    /// Shaping happens before any decryption, so a dropped cell costs
    /// us nothing but the check.
    pub(crate) fn dispatch(&self, mut msg: TunnelData, expiration: u64, from: &RouterHash) -> bool {
        let ctx = &self.ctx;
        if ctx.shaper.should_drop(
            Location::Participant,
            MessageType::TUNNEL_DATA,
            CELL_LEN,
            Some(&self.red),
            ctx.now(),
        ) {
            return false;
        }
        if !self.hop.peel_one_hop(msg.cell_mut()) {
            debug!(
                "Can't peel cell from {} on tunnel {}: keys gone",
                from,
                self.hop.receive_tunnel()
            );
            return false;
        }
        self.hop.incr_processed(1);
        self.forward(msg, expiration)
    }

    /// Send a peeled cell to the next hop.
    fn forward(&self, mut msg: TunnelData, expiration: u64) -> bool {
        let ctx = &self.ctx;
        let max_age = ctx.config.max_forward_age().as_millis() as u64;
        if expiration.saturating_add(max_age) < ctx.now_ms() {
            debug!(
                "Not forwarding cell on tunnel {}: expired at {}",
                self.hop.receive_tunnel(),
                expiration
            );
            return false;
        }
        msg.set_tunnel_id(self.hop.send_tunnel());
        let out = msg.into_message(ctx.random_msg_id(), ctx.forward_expiration());

        if self.next_hop_known.load(Ordering::Relaxed) || ctx.services.netdb.is_known(&self.next_hop) {
            self.next_hop_known.store(true, Ordering::Relaxed);
            trace!("Forwarding cell to {}", self.next_hop);
            ctx.services
                .transport
                .send(&self.next_hop, out, Priority::PARTICIPATING);
            return true;
        }

        let transport = Arc::clone(&ctx.services.transport);
        let stats = Arc::clone(&ctx.stats);
        let known = Arc::clone(&self.next_hop_known);
        let next = self.next_hop;
        ctx.services.netdb.lookup(
            &self.next_hop,
            ctx.config.lookup_timeout(),
            Box::new(move |found| {
                if found {
                    known.store(true, Ordering::Relaxed);
                    transport.send(&next, out, Priority::PARTICIPATING);
                } else {
                    debug!("Lookup of next hop {} failed; dropping cell", next);
                    stats.lookup_failed.inc();
                }
            }),
        );
        true
    }

    /// Return this hop.
    pub(crate) fn hop(&self) -> &Arc<HopRecord> {
        &self.hop
    }
}
