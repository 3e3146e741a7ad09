//! Sending messages on from the far end of an outbound tunnel.
//!
//! The same distributor serves a stranger's tunnel that ends at us
//! (participating priority, shaped) and our own zero-hop tunnels
//! (our priority, unshaped).

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::i2np::{I2npMessage, MessageType, TunnelGateway};
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_rtcompat::Runtime;

use crate::context::Context;
use crate::shaper::{Location, SyntheticRed};
use crate::traits::Priority;

/// Rough size of the lookup we send for an unknown router.
const LOOKUP_COST: usize = 1024;

/// Routers we recently sent to without having a connection.
struct NewRouters {
    /// Distinct routers seen this period.
    seen: HashSet<RouterHash>,
    /// When this period began.
    period_start: Instant,
}

/// Delivers messages that leave an outbound tunnel.
pub(crate) struct OutboundDistributor<R: Runtime> {
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
    /// Transport priority for what we send.
    priority: Priority,
    /// The endpoint's shaping state, if this is a stranger's tunnel.
    red: Option<Arc<SyntheticRed>>,
    /// The new-router limit.
    throttle: Mutex<NewRouters>,
}

impl<R: Runtime> OutboundDistributor<R> {
    /// Construct a distributor.
    pub(crate) fn new(ctx: Arc<Context<R>>, priority: Priority, red: Option<Arc<SyntheticRed>>) -> Self {
        let period_start = ctx.now();
        OutboundDistributor {
            ctx,
            priority,
            red,
            throttle: Mutex::new(NewRouters {
                seen: HashSet::new(),
                period_start,
            }),
        }
    }

    /// Send `msg` where `delivery` says.
    pub(crate) fn distribute(self: &Arc<Self>, msg: I2npMessage, delivery: Delivery) {
        let target = match delivery.router() {
            Some(r) => *r,
            None => {
                self.ctx.deliver_local(msg, None);
                return;
            }
        };
        let tunnel = delivery.tunnel();
        let ctx = &self.ctx;
        if self.priority == Priority::PARTICIPATING
            && target != ctx.services.us
            && !ctx.services.transport.is_established(&target)
            && self.too_many_new_routers(&target)
        {
            debug!("Too many new routers this period; dropping message to {}", target);
            ctx.stats.obep_throttled.inc();
            return;
        }
        if target == ctx.services.us || ctx.services.netdb.is_known(&target) {
            self.send(msg, target, tunnel);
            return;
        }

        if ctx.shaper.should_drop(
            Location::OutboundEndpoint,
            MessageType::DATABASE_LOOKUP,
            LOOKUP_COST,
            self.red.as_deref(),
            ctx.now(),
        ) {
            return;
        }
        let me = Arc::clone(self);
        ctx.services.netdb.lookup(
            &target,
            ctx.config.lookup_timeout(),
            Box::new(move |found| {
                if found {
                    me.send(msg, target, tunnel);
                } else {
                    debug!("Couldn't find {} for outbound endpoint message", target);
                    me.ctx.stats.lookup_failed.inc();
                }
            }),
        );
    }

    /// Return true if `target` would push us over this period's limit
    /// on new routers.  Otherwise remember it.
    fn too_many_new_routers(&self, target: &RouterHash) -> bool {
        let now = self.ctx.now();
        let mut t = self.throttle.lock();
        if now.saturating_duration_since(t.period_start) >= self.ctx.config.new_router_period() {
            t.seen.clear();
            t.period_start = now;
        }
        if t.seen.contains(target) {
            return false;
        }
        if t.seen.len() >= self.ctx.config.max_new_routers_per_period() {
            return true;
        }
        t.seen.insert(*target);
        false
    }

    /// Hand `msg` to `target`, wrapped for its tunnel if it has one.
    fn send(&self, msg: I2npMessage, target: RouterHash, tunnel: Option<TunnelId>) {
        let ctx = &self.ctx;
        let msg = match tunnel {
            Some(tid) => {
                let wrapped = TunnelGateway::new(tid, msg)
                    .into_message(ctx.random_msg_id(), ctx.forward_expiration());
                match wrapped {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Can't wrap message for tunnel {} at {}: {}", tid, target, e);
                        return;
                    }
                }
            }
            None => msg,
        };
        if target == ctx.services.us {
            ctx.deliver_local(msg, None);
        } else {
            trace!("Sending {} to {}", msg.msg_type(), target);
            ctx.services.transport.send(&target, msg, self.priority);
        }
    }
}
