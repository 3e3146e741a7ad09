//! Gateways: where messages enter a tunnel.
//!
//! We are the gateway of each outbound tunnel we build, and of each
//! inbound tunnel whose first hop we agreed to be.  Either way, a
//! gateway takes whole messages, batches them into cells, encrypts
//! the cells and sends them to the next hop.
//!
//! Messages wait in two places.  [`add()`](Gateway::add) only pushes
//! onto the pre-queue and asks the [`Pump`](crate::pump::Pump) for
//! attention; a pump thread later moves a bounded batch into the
//! working queue and runs the [`BatchingEngine`] over it under the
//! gateway's lock.  If the engine wants to wait for more messages
//! before sending a partial cell, a timer asks for another pump once
//! the wait is over.

mod queue;
mod sender;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::i2np::I2npMessage;
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_proto::batch::{BatchOutcome, BatchingEngine, PendingMessage};
use tunnel_proto::hop::HopRecord;
use tunnel_proto::route::TunnelRoute;
use tunnel_rtcompat::{Runtime, TimerHandle};

use crate::context::Context;
use crate::pump::Pumpable;
use crate::role::inbound::InboundDistributor;
use crate::role::outbound::OutboundDistributor;
use crate::shaper::{Location, SyntheticRed};
use crate::traits::Priority;
use crate::{Error, Result};

use queue::{GatewayMessage, PreQueue};
use sender::{CellCrypto, TunnelSender};

/// The part of a gateway that is only touched under its lock.
struct Working {
    /// Messages being turned into cells, oldest first.
    queue: VecDeque<PendingMessage>,
    /// Decides when to send.
    batch: BatchingEngine,
    /// Pending delayed flush, if any.
    flush: Option<TimerHandle>,
}

/// A gateway with a pre-queue, pumped by the shared pump threads.
pub struct Gateway<R: Runtime> {
    /// Our id on the pump.
    id: u64,
    /// Ourself, for the pump and for timers.
    me: Weak<Gateway<R>>,
    /// True for an inbound gateway we relay.
    inbound: bool,
    /// How cells are encrypted.
    crypto: CellCrypto,
    /// The router after us.
    next_hop: RouterHash,
    /// The tunnel id the next router expects.
    send_tunnel: TunnelId,
    /// Transport priority for our cells.
    priority: Priority,
    /// Messages added but not yet pumped.
    prequeue: Mutex<PreQueue>,
    /// Messages being batched.
    working: Mutex<Working>,
    /// Shaping state, for an inbound gateway we relay.
    red: Option<SyntheticRed>,
    /// Set once the tunnel is removed.
    destroyed: AtomicBool,
    /// Shared dispatcher state.
    ctx: Arc<Context<R>>,
}

impl<R: Runtime> Gateway<R> {
    /// Construct the gateway for one of our own outbound tunnels.
    pub(crate) fn outbound(ctx: Arc<Context<R>>, route: Arc<TunnelRoute>) -> Result<Arc<Self>> {
        let next_hop = *route
            .peer(1)
            .ok_or(Error::BadRoute("outbound tunnel has no first hop"))?;
        let send_tunnel = route.local_id();
        let priority = Priority(Priority::MY_DATA.0 + route.priority());
        let prequeue = PreQueue::priority(ctx.config.gateway().initial_outbound_queue());
        Ok(Self::build(
            ctx,
            false,
            CellCrypto::Outbound(route),
            next_hop,
            send_tunnel,
            priority,
            prequeue,
            None,
        ))
    }

    /// Construct the gateway for someone's inbound tunnel, where we
    /// are the first hop.
    pub(crate) fn inbound_relay(ctx: Arc<Context<R>>, hop: Arc<HopRecord>) -> Result<Arc<Self>> {
        let next_hop = *hop
            .next_hop()
            .ok_or(Error::BadRoute("inbound gateway has no next hop"))?;
        let send_tunnel = hop.send_tunnel();
        let red = ctx.shaper.hop_estimator(hop.allocated_bw(), ctx.now());
        let prequeue = PreQueue::bounded(ctx.config.gateway().max_inbound_queue());
        Ok(Self::build(
            ctx,
            true,
            CellCrypto::Relay(hop),
            next_hop,
            send_tunnel,
            Priority::PARTICIPATING,
            prequeue,
            Some(red),
        ))
    }

    /// Assemble a gateway.
    #[allow(clippy::too_many_arguments)]
    fn build(
        ctx: Arc<Context<R>>,
        inbound: bool,
        crypto: CellCrypto,
        next_hop: RouterHash,
        send_tunnel: TunnelId,
        priority: Priority,
        prequeue: PreQueue,
        red: Option<SyntheticRed>,
    ) -> Arc<Self> {
        let batch = BatchingEngine::new(ctx.config.batch().clone(), Arc::clone(&ctx.batch_stats));
        Arc::new_cyclic(|me| Gateway {
            id: ctx.next_gateway_id(),
            me: me.clone(),
            inbound,
            crypto,
            next_hop,
            send_tunnel,
            priority,
            prequeue: Mutex::new(prequeue),
            working: Mutex::new(Working {
                queue: VecDeque::new(),
                batch,
                flush: None,
            }),
            red,
            destroyed: AtomicBool::new(false),
            ctx,
        })
    }

    /// Queue `msg` to be sent through this tunnel, for `delivery` at
    /// the far end.
    ///
    /// Returns false if the message was dropped: by the shaper, by a
    /// full queue, or because the tunnel is gone.
    pub fn add(&self, msg: I2npMessage, delivery: Delivery) -> bool {
        self.add_with_priority(msg, delivery, self.priority)
    }

    /// Like [`add`](Gateway::add), but on one of our outbound gateways
    /// `priority` decides which waiting message is pumped first.  Equal
    /// priorities go in the order they were added.
    ///
    /// An inbound gateway we relay ignores `priority`: it is first in,
    /// first out.
    pub fn add_with_priority(&self, msg: I2npMessage, delivery: Delivery, priority: Priority) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let now = self.ctx.now();
        if self.inbound
            && self.ctx.shaper.should_drop(
                Location::InboundGateway,
                msg.msg_type(),
                msg.encoded_len(),
                self.red.as_ref(),
                now,
            )
        {
            self.ctx.gateway_stats.congestion_dropped.inc();
            return false;
        }
        let m = GatewayMessage::new(msg, delivery, priority, now);
        if !self.prequeue.lock().offer(m) {
            debug!("Gateway queue to {} is full; dropping", self.next_hop);
            self.ctx.gateway_stats.overflow_dropped.inc();
            return false;
        }
        self.request_pump();
        true
    }

    /// Ask the pump for attention.
    fn request_pump(&self) {
        if let Some(me) = self.me.upgrade() {
            self.ctx.pump.wants_pumping(me);
        }
    }

    /// Return the number of messages not yet pumped.
    pub fn prequeue_len(&self) -> usize {
        self.prequeue.lock().len()
    }

    /// Return the number of messages being batched.
    pub fn working_len(&self) -> usize {
        self.working.lock().queue.len()
    }

    /// Return true if a delayed flush is scheduled.
    pub fn flush_pending(&self) -> bool {
        matches!(&self.working.lock().flush, Some(t) if t.is_pending())
    }

    /// Turn a queued message into a pending one.
    fn pending(&self, m: GatewayMessage) -> Result<PendingMessage> {
        let data = m.msg.to_bytes()?;
        let id = self.ctx.random_msg_id();
        Ok(PendingMessage::new(
            data,
            m.delivery,
            id,
            m.msg.expiration(),
            m.queued_at,
        )?)
    }

    /// Send whatever the batching engine allows, and arrange for the
    /// rest.
    fn flush(&self, w: &mut Working, now: Instant) {
        let now_ms = self.ctx.now_ms();
        let mut sender = TunnelSender {
            crypto: &self.crypto,
            transport: self.ctx.services.transport.as_ref(),
            next_hop: &self.next_hop,
            send_tunnel: self.send_tunnel,
            expiration: self.ctx.forward_expiration(),
            priority: self.priority,
            sent: 0,
            failed: 0,
        };
        let Working { queue, batch, flush } = w;
        match batch.preprocess(queue, now, &mut sender) {
            Ok(BatchOutcome::Delay(d)) => self.schedule_flush(flush, d),
            Ok(_) => {
                if let Some(t) = flush.take() {
                    t.cancel();
                }
            }
            Err(e) => {
                error!("Batching failed on tunnel {}: {}; discarding queue", self.send_tunnel, e);
                queue.clear();
            }
        }
        if sender.sent > 0 || sender.failed > 0 {
            trace!(
                "Tunnel {}: {} cells sent, {} failed",
                self.send_tunnel,
                sender.sent,
                sender.failed
            );
        }

        // Whole messages that expired while waiting are not worth
        // sending.  One already partly sent has to finish.
        let cutoff = now_ms.saturating_sub(self.ctx.config.clock_fudge().as_millis() as u64);
        let before = queue.len();
        queue.retain(|m| m.offset() > 0 || !m.is_expired(cutoff));
        let expired = before - queue.len();
        if expired > 0 {
            debug!("Expired {} queued messages on tunnel {}", expired, self.send_tunnel);
            self.ctx.gateway_stats.expired_dropped.add(expired as u64);
        }
    }

    /// Arrange for a pump after `delay`, unless one is already due.
    fn schedule_flush(&self, slot: &mut Option<TimerHandle>, delay: Duration) {
        if matches!(slot, Some(t) if t.is_pending()) {
            return;
        }
        let me = self.me.clone();
        let handle = self.ctx.runtime.schedule(
            delay,
            Box::new(move || {
                if let Some(gw) = me.upgrade() {
                    gw.request_pump();
                }
            }),
        );
        *slot = Some(handle);
    }

    /// Stop using this gateway and discard everything queued.
    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.prequeue.lock().clear();
        {
            let mut w = self.working.lock();
            w.queue.clear();
            if let Some(t) = w.flush.take() {
                t.cancel();
            }
        }
        self.crypto.destroy();
    }
}

impl<R: Runtime> Pumpable for Gateway<R> {
    fn pump_id(&self) -> u64 {
        self.id
    }

    fn pump(&self) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let backlogged = self.ctx.services.transport.is_backlogged(&self.next_hop);
        let max = self.ctx.config.pump().per_pump(self.inbound, backlogged);
        let mut batch = Vec::new();
        let more = {
            let mut q = self.prequeue.lock();
            q.drain_into(&mut batch, max);
            !q.is_empty()
        };
        if backlogged {
            debug!(
                "Next hop {} backlogged; pumped {} from tunnel {}",
                self.next_hop,
                batch.len(),
                self.send_tunnel
            );
        }

        let now = self.ctx.now();
        let mut w = self.working.lock();
        if batch.is_empty() && w.queue.is_empty() {
            return more;
        }
        for m in batch {
            match self.pending(m) {
                Ok(p) => w.queue.push_back(p),
                Err(e) => debug!("Can't send message down tunnel {}: {}", self.send_tunnel, e),
            }
        }
        self.flush(&mut w, now);
        more
    }
}

/// Where messages for one tunnel id enter it.
pub(crate) enum GatewayHandle<R: Runtime> {
    /// A tunnel with hops: queue, batch, encrypt.
    Pumped(Arc<Gateway<R>>),
    /// Our own one-hop outbound tunnel: we are also its endpoint.
    ZeroHopOutbound(Arc<OutboundDistributor<R>>),
    /// Our own one-hop inbound tunnel: we are also its endpoint.
    ZeroHopInbound(Arc<InboundDistributor<R>>),
}

impl<R: Runtime> Clone for GatewayHandle<R> {
    fn clone(&self) -> Self {
        match self {
            GatewayHandle::Pumped(g) => GatewayHandle::Pumped(Arc::clone(g)),
            GatewayHandle::ZeroHopOutbound(d) => GatewayHandle::ZeroHopOutbound(Arc::clone(d)),
            GatewayHandle::ZeroHopInbound(d) => GatewayHandle::ZeroHopInbound(Arc::clone(d)),
        }
    }
}

impl<R: Runtime> GatewayHandle<R> {
    /// Send `msg` into this tunnel, bound for `delivery`.
    pub(crate) fn add(&self, msg: I2npMessage, delivery: Delivery) -> bool {
        match self {
            GatewayHandle::Pumped(g) => g.add(msg, delivery),
            GatewayHandle::ZeroHopOutbound(d) => {
                d.distribute(msg, delivery);
                true
            }
            GatewayHandle::ZeroHopInbound(d) => {
                d.distribute(msg, delivery);
                true
            }
        }
    }

    /// Return the pumped gateway, if there is one.
    pub(crate) fn pumped(&self) -> Option<&Arc<Gateway<R>>> {
        match self {
            GatewayHandle::Pumped(g) => Some(g),
            _ => None,
        }
    }

    /// Tear this gateway down.
    pub(crate) fn destroy(&self) {
        if let GatewayHandle::Pumped(g) = self {
            g.destroy();
        }
    }
}
