//! The table from tunnel id to what we do with that tunnel's traffic.
//!
//! Every tunnel id we know is registered as exactly one of:
//!
//! * the gateway of an outbound tunnel we built,
//! * the gateway of an inbound tunnel, either ours (zero-hop) or
//!   someone else's that we relay,
//! * a participant: a middle hop we relay, or the endpoint of one of
//!   our own inbound tunnels,
//! * the endpoint of someone else's outbound tunnel.
//!
//! Registration is insert-if-absent under a single write lock, so a
//! second registration of an id fails without touching the first.
//! Lookups take the read lock just long enough to clone a handle; the
//! handler itself runs without it.

mod leave;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, info, trace};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::i2np::{I2npMessage, MessageType, TunnelData, TunnelGateway};
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_proto::hop::HopRecord;
use tunnel_proto::pool::PoolStats;
use tunnel_proto::route::TunnelRoute;
use tunnel_proto::{BatchStats, ReassemblyStats};
use tunnel_rtcompat::{Runtime, TimerHandle};

use crate::config::DispatchConfig;
use crate::context::Context;
use crate::gateway::{Gateway, GatewayHandle};
use crate::pump::Pump;
use crate::role::endpoint::OutboundEndpoint;
use crate::role::inbound::{InboundDistributor, InboundEndpoint};
use crate::role::outbound::OutboundDistributor;
use crate::role::participant::Participant;
use crate::role::ParticipantRole;
use crate::stats::{DispatchStats, GatewayStats};
use crate::traits::{Priority, Services};
use crate::{Error, Result};

use leave::{leave_grace, LeaveQueue};

/// The registration maps.  An id appears in at most one of the first
/// four.
struct Tables<R: Runtime> {
    /// Our outbound tunnels, by the id hop 1 receives on.
    outbound_gateways: HashMap<TunnelId, GatewayHandle<R>>,
    /// Inbound tunnels whose gateway is here, by receive id.
    inbound_gateways: HashMap<TunnelId, GatewayHandle<R>>,
    /// Relayed middle hops and our own inbound endpoints.
    participants: HashMap<TunnelId, Arc<ParticipantRole<R>>>,
    /// Other routers' outbound tunnels that end here.
    outbound_endpoints: HashMap<TunnelId, Arc<OutboundEndpoint<R>>>,
    /// Every hop we relay for someone else, whatever its role.
    participating: HashMap<TunnelId, Arc<HopRecord>>,
    /// When recently removed ids were removed.
    recently_expired: HashMap<TunnelId, Instant>,
}

impl<R: Runtime> Tables<R> {
    /// Return an empty set of tables.
    fn new() -> Self {
        Tables {
            outbound_gateways: HashMap::new(),
            inbound_gateways: HashMap::new(),
            participants: HashMap::new(),
            outbound_endpoints: HashMap::new(),
            participating: HashMap::new(),
            recently_expired: HashMap::new(),
        }
    }

    /// Return true if `id` is registered in any role.
    fn contains(&self, id: TunnelId) -> bool {
        self.outbound_gateways.contains_key(&id)
            || self.inbound_gateways.contains_key(&id)
            || self.participants.contains_key(&id)
            || self.outbound_endpoints.contains_key(&id)
    }

    /// Return the number of registered ids.
    fn len(&self) -> usize {
        self.outbound_gateways.len()
            + self.inbound_gateways.len()
            + self.participants.len()
            + self.outbound_endpoints.len()
    }
}

/// A role, built and ready to be registered.
enum NewRole<R: Runtime> {
    /// One of our outbound tunnels.
    OutboundGateway(GatewayHandle<R>),
    /// An inbound gateway.
    InboundGateway(GatewayHandle<R>),
    /// A participant or inbound endpoint.
    Participant(Arc<ParticipantRole<R>>),
    /// An outbound endpoint.
    OutboundEndpoint(Arc<OutboundEndpoint<R>>),
}

/// A role, removed from the tables and waiting to be torn down.
enum OldRole<R: Runtime> {
    /// A gateway.
    Gateway(GatewayHandle<R>),
    /// A participant or inbound endpoint.
    Participant(Arc<ParticipantRole<R>>),
    /// An outbound endpoint.
    OutboundEndpoint(Arc<OutboundEndpoint<R>>),
}

impl<R: Runtime> OldRole<R> {
    /// Release everything the role holds.
    fn destroy(self) {
        match self {
            OldRole::Gateway(g) => g.destroy(),
            OldRole::Participant(p) => p.destroy(),
            OldRole::OutboundEndpoint(e) => {
                e.clear();
                e.hop().destroy();
            }
        }
    }
}

/// Routes tunnel traffic arriving at this router to the right handler.
///
/// Construct one with [`DispatchTable::new`], register tunnels with
/// the `join_*` methods as they are built or agreed to, and pass every
/// incoming tunnel message to [`DispatchTable::dispatch_incoming`].
pub struct DispatchTable<R: Runtime> {
    /// Shared state for the role handlers.
    ctx: Arc<Context<R>>,
    /// The registration maps.
    tables: RwLock<Tables<R>>,
    /// Participating tunnels by expiration.
    leave: LeaveQueue,
    /// The next expiration scan.
    leave_timer: Mutex<Option<TimerHandle>>,
    /// Sum of bandwidth allocated to participating hops.
    allocated_bw: AtomicU64,
    /// Set by [`shutdown`](DispatchTable::shutdown).
    shut_down: AtomicBool,
}

impl<R: Runtime> DispatchTable<R> {
    /// Construct a dispatch table, start its pump threads, and start
    /// scanning for expired tunnels.
    pub fn new(runtime: R, config: DispatchConfig, services: Services) -> Result<Arc<Self>> {
        let pump = Arc::new(Pump::new(runtime.clone(), config.pump().clone())?);
        let table = Arc::new_cyclic(|me: &Weak<Self>| DispatchTable {
            ctx: Arc::new(Context::new(runtime, config, services, pump, me.clone())),
            tables: RwLock::new(Tables::new()),
            leave: LeaveQueue::default(),
            leave_timer: Mutex::new(None),
            allocated_bw: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });
        Self::schedule_leave_scan(&table);
        Ok(table)
    }

    /// Return the configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.ctx.config
    }

    /// Return the pump.  With zero pump threads, call
    /// [`Pump::run_pending`] on it to make gateways send.
    pub fn pump(&self) -> &Pump<R> {
        &self.ctx.pump
    }

    /// Return the dispatch counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.ctx.stats
    }

    /// Return the counters shared by our gateways.
    pub fn gateway_stats(&self) -> &GatewayStats {
        &self.ctx.gateway_stats
    }

    /// Return the batching counters shared by our gateways.
    pub fn batch_stats(&self) -> &BatchStats {
        &self.ctx.batch_stats
    }

    /// Return the reassembly counters shared by our endpoints.
    pub fn reassembly_stats(&self) -> &ReassemblyStats {
        &self.ctx.reassembly_stats
    }

    /// Return the fragment buffer pool's counters.
    pub fn pool_stats(&self) -> &PoolStats {
        self.ctx.pool.stats()
    }

    /// Return the total bandwidth allocated to participating hops, in
    /// bytes per second.
    pub fn allocated_bandwidth(&self) -> u64 {
        self.allocated_bw.load(Ordering::Relaxed)
    }

    /// Return the number of registered tunnel ids.
    pub fn n_registered(&self) -> usize {
        self.tables.read().len()
    }

    /// Return the number of hops we relay for other routers.
    pub fn n_participating(&self) -> usize {
        self.tables.read().participating.len()
    }

    /// Return true if `id` is registered in any role.
    pub fn is_registered(&self, id: TunnelId) -> bool {
        self.tables.read().contains(id)
    }

    /// Return the pumped gateway registered under `id`, if there is one.
    pub fn gateway(&self, id: TunnelId) -> Option<Arc<Gateway<R>>> {
        let t = self.tables.read();
        t.outbound_gateways
            .get(&id)
            .or_else(|| t.inbound_gateways.get(&id))
            .and_then(|h| h.pumped().cloned())
    }

    /// Fail early if `id` can't be registered.
    fn check_free(&self, id: TunnelId) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if id.is_zero() {
            return Err(Error::ZeroTunnelId);
        }
        if self.tables.read().contains(id) {
            return Err(Error::AlreadyRegistered(id));
        }
        Ok(())
    }

    /// Register `role` under `id`, unless something got there first.
    /// `hop` is set for tunnels we relay for others.
    fn register(&self, id: TunnelId, role: NewRole<R>, hop: Option<Arc<HopRecord>>) -> Result<()> {
        let mut t = self.tables.write();
        if t.contains(id) {
            return Err(Error::AlreadyRegistered(id));
        }
        match role {
            NewRole::OutboundGateway(g) => {
                t.outbound_gateways.insert(id, g);
            }
            NewRole::InboundGateway(g) => {
                t.inbound_gateways.insert(id, g);
            }
            NewRole::Participant(p) => {
                t.participants.insert(id, p);
            }
            NewRole::OutboundEndpoint(e) => {
                t.outbound_endpoints.insert(id, e);
            }
        }
        t.recently_expired.remove(&id);
        if let Some(hop) = hop {
            self.allocated_bw
                .fetch_add(u64::from(hop.allocated_bw()), Ordering::Relaxed);
            self.leave.push(hop.expiration(), id);
            t.participating.insert(id, hop);
        }
        Ok(())
    }

    /// Register one of our outbound tunnels.
    ///
    /// Its gateway is this router; messages sent with
    /// [`dispatch_outbound`](Self::dispatch_outbound) enter it here.
    pub fn join_outbound(&self, route: Arc<TunnelRoute>) -> Result<()> {
        if route.is_inbound() {
            return Err(Error::BadRoute("not an outbound tunnel"));
        }
        let id = route.local_id();
        self.check_free(id)?;
        let handle = if route.len() == 1 {
            let prio = Priority(Priority::MY_DATA.0 + route.priority());
            GatewayHandle::ZeroHopOutbound(Arc::new(OutboundDistributor::new(
                Arc::clone(&self.ctx),
                prio,
                None,
            )))
        } else {
            GatewayHandle::Pumped(Gateway::outbound(Arc::clone(&self.ctx), route)?)
        };
        self.register(id, NewRole::OutboundGateway(handle), None)?;
        debug!("Joined outbound tunnel {}", id);
        Ok(())
    }

    /// Register one of our inbound tunnels.
    ///
    /// We are its endpoint, or with a single hop its gateway as well.
    pub fn join_inbound(&self, route: Arc<TunnelRoute>) -> Result<()> {
        if !route.is_inbound() {
            return Err(Error::BadRoute("not an inbound tunnel"));
        }
        let id = route.local_id();
        self.check_free(id)?;
        let role = if route.len() == 1 {
            NewRole::InboundGateway(GatewayHandle::ZeroHopInbound(Arc::new(
                InboundDistributor::new(Arc::clone(&self.ctx), &route),
            )))
        } else {
            NewRole::Participant(Arc::new(ParticipantRole::InboundEndpoint(InboundEndpoint::new(
                Arc::clone(&self.ctx),
                route,
            ))))
        };
        self.register(id, role, None)?;
        debug!("Joined inbound tunnel {}", id);
        Ok(())
    }

    /// Register a middle hop of someone else's tunnel.
    pub fn join_participant(&self, hop: Arc<HopRecord>) -> Result<()> {
        let id = hop.receive_tunnel();
        self.check_free(id)?;
        let p = Participant::new(Arc::clone(&self.ctx), Arc::clone(&hop))?;
        let role = NewRole::Participant(Arc::new(ParticipantRole::Relay(p)));
        self.register(id, role, Some(hop))?;
        debug!("Joined tunnel {} as participant", id);
        Ok(())
    }

    /// Register the endpoint of someone else's outbound tunnel.
    pub fn join_outbound_endpoint(&self, hop: Arc<HopRecord>) -> Result<()> {
        let id = hop.receive_tunnel();
        self.check_free(id)?;
        let e = OutboundEndpoint::new(Arc::clone(&self.ctx), Arc::clone(&hop));
        self.register(id, NewRole::OutboundEndpoint(Arc::new(e)), Some(hop))?;
        debug!("Joined tunnel {} as outbound endpoint", id);
        Ok(())
    }

    /// Register the gateway of someone else's inbound tunnel.
    ///
    /// It is keyed by the receive id that TunnelGateway messages name.
    pub fn join_inbound_gateway(&self, hop: Arc<HopRecord>) -> Result<()> {
        let id = hop.receive_tunnel();
        self.check_free(id)?;
        let g = Gateway::inbound_relay(Arc::clone(&self.ctx), Arc::clone(&hop))?;
        let role = NewRole::InboundGateway(GatewayHandle::Pumped(g));
        self.register(id, role, Some(hop))?;
        debug!("Joined tunnel {} as inbound gateway", id);
        Ok(())
    }

    /// Count a message for an id we don't have.
    fn count_missing(&self, id: TunnelId, what: &str) {
        let now = self.ctx.now();
        let window = self.ctx.config.recent_expiry_window();
        let recent = matches!(
            self.tables.read().recently_expired.get(&id),
            Some(at) if now.saturating_duration_since(*at) < window
        );
        if recent {
            trace!("Dropping {} for recently removed tunnel {}", what, id);
            self.ctx.stats.recently_expired_dropped.inc();
        } else {
            debug!("Dropping {} for unknown tunnel {}", what, id);
            self.ctx.stats.unknown_tunnel.inc();
        }
    }

    /// Check an expiration against the window around now.
    fn check_expiration(&self, expiration: u64) -> Result<()> {
        let now = self.ctx.now_ms();
        let earliest = now.saturating_sub(self.ctx.config.clock_fudge().as_millis() as u64);
        let latest = now + self.ctx.config.max_future_expiration().as_millis() as u64;
        if expiration < earliest || expiration > latest {
            self.ctx.stats.bad_expiration.inc();
            return Err(Error::BadExpiration {
                expiration,
                earliest,
                latest,
            });
        }
        Ok(())
    }

    /// Handle one cell from `from`, for a tunnel we relay or whose
    /// inbound endpoint we are.
    ///
    /// Returns false if the cell was dropped; cells for unknown tunnels
    /// are normal after a tunnel goes away.
    pub fn dispatch_cell(&self, msg: TunnelData, expiration: u64, from: &RouterHash) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        let id = msg.tunnel_id();
        let (participant, endpoint) = {
            let t = self.tables.read();
            (
                t.participants.get(&id).cloned(),
                t.outbound_endpoints.get(&id).cloned(),
            )
        };
        if let Some(p) = participant {
            self.ctx.stats.dispatched_participant.inc();
            return p.dispatch(msg, expiration, from);
        }
        if let Some(e) = endpoint {
            self.ctx.stats.dispatched_endpoint.inc();
            return e.dispatch(msg, from);
        }
        self.count_missing(id, "cell");
        false
    }

    /// Inject a message at an inbound gateway we host.
    ///
    /// `expiration` is that of the wrapping message.  Both it and the
    /// inner message's must fall within the acceptable window, or the
    /// message is refused with [`Error::BadExpiration`].  Returns
    /// `Ok(false)` if the message was dropped for any other reason.
    pub fn dispatch_gateway(&self, gw: TunnelGateway, expiration: u64) -> Result<bool> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let id = gw.tunnel_id();
        let handle = self.tables.read().inbound_gateways.get(&id).cloned();
        let handle = match handle {
            Some(h) => h,
            None => {
                self.count_missing(id, "gateway message");
                return Ok(false);
            }
        };
        self.check_expiration(expiration)?;
        self.check_expiration(gw.inner().expiration())?;
        self.ctx.stats.dispatched_inbound.inc();
        Ok(handle.add(gw.into_inner(), Delivery::Local))
    }

    /// Send `msg` down our outbound tunnel `outbound`, to be delivered
    /// to `target`, or to its tunnel `target_tunnel`.
    ///
    /// A message that already expired or expires too far ahead is
    /// refused with [`Error::BadExpiration`]; otherwise its expiration
    /// is reset to give it time to cross the tunnel.
    pub fn dispatch_outbound(
        &self,
        mut msg: I2npMessage,
        outbound: TunnelId,
        target_tunnel: Option<TunnelId>,
        target: RouterHash,
    ) -> Result<bool> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let handle = self.tables.read().outbound_gateways.get(&outbound).cloned();
        let handle = match handle {
            Some(h) => h,
            None => {
                self.count_missing(outbound, "outbound message");
                return Ok(false);
            }
        };
        self.check_expiration(msg.expiration())?;
        msg.set_expiration(self.ctx.forward_expiration());
        self.ctx.stats.dispatched_outbound.inc();
        let delivery = Delivery::from_parts(Some(target), target_tunnel);
        Ok(handle.add(msg, delivery))
    }

    /// Handle a message that arrived from `from`.
    ///
    /// TunnelData and TunnelGateway messages are dispatched; anything
    /// else goes to local delivery.  Returns false if it was dropped.
    pub fn dispatch_incoming(&self, msg: I2npMessage, from: &RouterHash) -> bool {
        let ty = msg.msg_type();
        if ty == MessageType::TUNNEL_DATA {
            match TunnelData::decode(msg.payload()) {
                Ok(td) => self.dispatch_cell(td, msg.expiration(), from),
                Err(e) => {
                    debug!("Malformed TunnelData from {}: {}", from, e);
                    false
                }
            }
        } else if ty == MessageType::TUNNEL_GATEWAY {
            let gw = match TunnelGateway::decode(msg.payload()) {
                Ok(gw) => gw,
                Err(e) => {
                    debug!("Malformed TunnelGateway from {}: {}", from, e);
                    return false;
                }
            };
            match self.dispatch_gateway(gw, msg.expiration()) {
                Ok(sent) => sent,
                Err(e) => {
                    info!("Refused gateway message from {}: {}", from, e);
                    false
                }
            }
        } else {
            self.ctx.services.local.deliver(msg, None);
            true
        }
    }

    /// Remember that `id` was just removed.
    fn note_removed(t: &mut Tables<R>, id: TunnelId, now: Instant) {
        t.recently_expired.insert(id, now);
    }

    /// Remove one of our outbound tunnels.  Returns false if it wasn't
    /// registered.
    pub fn remove_outbound(&self, id: TunnelId) -> bool {
        let now = self.ctx.now();
        let old = {
            let mut t = self.tables.write();
            let old = t.outbound_gateways.remove(&id);
            if old.is_some() {
                Self::note_removed(&mut t, id, now);
            }
            old
        };
        match old {
            Some(g) => {
                OldRole::Gateway(g).destroy();
                debug!("Removed outbound tunnel {}", id);
                true
            }
            None => false,
        }
    }

    /// Remove one of our inbound tunnels.  Returns false if it wasn't
    /// registered.
    pub fn remove_inbound(&self, id: TunnelId) -> bool {
        let now = self.ctx.now();
        let old = {
            let mut t = self.tables.write();
            if t.participating.contains_key(&id) {
                return false;
            }
            let old = match t.participants.remove(&id) {
                Some(p) => Some(OldRole::Participant(p)),
                None => t.inbound_gateways.remove(&id).map(OldRole::Gateway),
            };
            if old.is_some() {
                Self::note_removed(&mut t, id, now);
            }
            old
        };
        match old {
            Some(role) => {
                role.destroy();
                debug!("Removed inbound tunnel {}", id);
                true
            }
            None => false,
        }
    }

    /// Remove a tunnel we relay for someone else, whatever our role in
    /// it.  Returns false if it wasn't registered; racing removals are
    /// normal.
    pub fn remove_participant(&self, id: TunnelId) -> bool {
        let now = self.ctx.now();
        let (hop, old) = {
            let mut t = self.tables.write();
            let hop = match t.participating.remove(&id) {
                Some(h) => h,
                None => return false,
            };
            let old = if let Some(p) = t.participants.remove(&id) {
                Some(OldRole::Participant(p))
            } else if let Some(e) = t.outbound_endpoints.remove(&id) {
                Some(OldRole::OutboundEndpoint(e))
            } else {
                t.inbound_gateways.remove(&id).map(OldRole::Gateway)
            };
            Self::note_removed(&mut t, id, now);
            (hop, old)
        };
        self.allocated_bw
            .fetch_sub(u64::from(hop.allocated_bw()), Ordering::Relaxed);
        if let Some(role) = old {
            role.destroy();
        }
        hop.destroy();
        debug!("Left tunnel {} after {} cells", id, hop.processed());
        true
    }

    /// Remove participating tunnels that have expired, and forget ids
    /// removed long enough ago.
    fn leave_scan(&self) {
        let now_ms = self.ctx.now_ms();
        let grace = leave_grace(self.ctx.config.clock_fudge());
        for id in self.leave.take_due(now_ms, grace) {
            // The id may have been removed and joined again since.
            let exp = self.tables.read().participating.get(&id).map(|h| h.expiration());
            if matches!(exp, Some(exp) if exp.saturating_add(grace.as_millis() as u64) <= now_ms) {
                self.remove_participant(id);
            }
        }
        let now = self.ctx.now();
        let window = self.ctx.config.recent_expiry_window();
        self.tables
            .write()
            .recently_expired
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    /// Arrange for the next expiration scan.
    fn schedule_leave_scan(this: &Arc<Self>) {
        if this.shut_down.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(this);
        let handle = this.ctx.runtime.schedule(
            this.ctx.config.leave_scan_interval(),
            Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    table.leave_scan();
                    Self::schedule_leave_scan(&table);
                }
            }),
        );
        *this.leave_timer.lock() = Some(handle);
    }

    /// Stop everything: the pump threads, the expiration scan, and
    /// every registered tunnel.  Messages in flight are lost.
    ///
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(t) = self.leave_timer.lock().take() {
            t.cancel();
        }
        self.ctx.pump.stop();
        let old = std::mem::replace(&mut *self.tables.write(), Tables::new());
        self.leave.clear();
        self.allocated_bw.store(0, Ordering::Relaxed);
        let n = old.len();
        for g in old
            .outbound_gateways
            .into_values()
            .chain(old.inbound_gateways.into_values())
        {
            OldRole::Gateway(g).destroy();
        }
        for p in old.participants.into_values() {
            OldRole::Participant(p).destroy();
        }
        for e in old.outbound_endpoints.into_values() {
            OldRole::OutboundEndpoint(e).destroy();
        }
        for hop in old.participating.into_values() {
            hop.destroy();
        }
        info!("Dispatcher shut down; dropped {} tunnels", n);
    }
}

impl<R: Runtime> Drop for DispatchTable<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{relay_hop, router, setup, setup_refusing};
    use bytes::Bytes;
    use rand::RngCore;
    use std::time::Duration;
    use tunnel_cell::cell::CELL_LEN;
    use tunnel_proto::hop::HopKeys;
    use tunnel_proto::route::Direction;
    use tunnel_rtcompat::Clock;

    fn random_cell() -> Box<[u8; CELL_LEN]> {
        let mut cell = Box::new([0_u8; CELL_LEN]);
        rand::thread_rng().fill_bytes(&mut cell[..]);
        cell
    }

    fn data(ty: MessageType, expiration: u64) -> I2npMessage {
        I2npMessage::new(ty, 77.into(), expiration, Bytes::from_static(b"hello"))
    }

    #[test]
    fn join_and_duplicates() {
        let s = setup();
        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(hop).unwrap();
        assert_eq!(s.table.allocated_bandwidth(), 10_000);

        let (_, dup) = relay_hop(&s.rt, 10, 12, 3);
        assert!(matches!(
            s.table.join_participant(Arc::clone(&dup)),
            Err(Error::AlreadyRegistered(_))
        ));
        assert!(matches!(
            s.table.join_outbound_endpoint(dup),
            Err(Error::AlreadyRegistered(_))
        ));
        assert_eq!(s.table.n_registered(), 1);
        assert_eq!(s.table.n_participating(), 1);
        assert_eq!(s.table.allocated_bandwidth(), 10_000);

        let (_, zero) = relay_hop(&s.rt, 0, 12, 3);
        assert!(matches!(
            s.table.join_inbound_gateway(zero),
            Err(Error::ZeroTunnelId)
        ));
    }

    #[test]
    fn participant_forwards() {
        let s = setup();
        s.fakes.netdb.known.lock().insert(router(2));
        let (keys, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(hop).unwrap();
        assert!(s.fakes.netdb.pending.lock().is_empty());

        let cell = random_cell();
        let mut expected = cell.clone();
        let twin = HopRecord::new(10.into(), 11.into(), &keys);
        assert!(twin.peel_one_hop(&mut expected[..]));

        let now = s.rt.wallclock_millis();
        assert!(s
            .table
            .dispatch_cell(TunnelData::new(10.into(), cell), now + 5_000, &router(0)));
        let sent = s.fakes.transport.take();
        assert_eq!(sent.len(), 1);
        let (peer, msg, prio) = &sent[0];
        assert_eq!(*peer, router(2));
        assert_eq!(*prio, Priority::PARTICIPATING);
        assert_eq!(msg.msg_type(), MessageType::TUNNEL_DATA);
        assert_eq!(msg.expiration(), now + 20_000);
        let td = TunnelData::decode(msg.payload()).unwrap();
        assert_eq!(td.tunnel_id(), 11.into());
        assert_eq!(td.cell()[..], expected[..]);
        assert_eq!(s.table.stats().dispatched_participant.get(), 1);

        // Far too old to pass on.
        let stale = now - 80_000;
        assert!(!s
            .table
            .dispatch_cell(TunnelData::new(10.into(), random_cell()), stale, &router(0)));
        assert!(s.fakes.transport.take().is_empty());
    }

    #[test]
    fn shaped_before_peeling() {
        let s = setup_refusing();
        s.fakes.netdb.known.lock().insert(router(2));
        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(Arc::clone(&hop)).unwrap();

        let now = s.rt.wallclock_millis();
        assert!(!s
            .table
            .dispatch_cell(TunnelData::new(10.into(), random_cell()), now + 5_000, &router(0)));
        assert_eq!(s.table.stats().participating_dropped.get(), 1);
        // Never decrypted, never sent.
        assert_eq!(hop.processed(), 0);
        assert!(s.fakes.transport.take().is_empty());
    }

    #[test]
    fn unknown_next_hop() {
        let s = setup();
        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(hop).unwrap();
        // Looked up at join time, with the longer timeout.
        assert_eq!(s.fakes.netdb.pending.lock()[0].1, Duration::from_secs(25));

        let now = s.rt.wallclock_millis();
        assert!(s
            .table
            .dispatch_cell(TunnelData::new(10.into(), random_cell()), now, &router(0)));
        assert_eq!(s.fakes.netdb.pending.lock().len(), 2);
        assert_eq!(s.fakes.netdb.answer_all(), 2);
        assert_eq!(s.table.stats().lookup_failed.get(), 1);
        assert!(s.fakes.transport.take().is_empty());

        // Once it can be found, the cell goes out after the lookup.
        s.fakes.netdb.findable.lock().insert(router(2));
        assert!(s
            .table
            .dispatch_cell(TunnelData::new(10.into(), random_cell()), now, &router(0)));
        assert_eq!(s.fakes.netdb.answer_all(), 1);
        assert_eq!(s.fakes.transport.take().len(), 1);
    }

    #[test]
    fn unknown_and_recently_expired() {
        let s = setup();
        let now = s.rt.wallclock_millis();
        let from = router(0);
        assert!(!s
            .table
            .dispatch_cell(TunnelData::new(99.into(), random_cell()), now, &from));
        assert_eq!(s.table.stats().unknown_tunnel.get(), 1);

        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(Arc::clone(&hop)).unwrap();
        assert!(s.table.remove_participant(10.into()));
        assert!(!s.table.remove_participant(10.into()));
        assert!(hop.is_destroyed());
        assert_eq!(s.table.allocated_bandwidth(), 0);

        assert!(!s
            .table
            .dispatch_cell(TunnelData::new(10.into(), random_cell()), now, &from));
        assert_eq!(s.table.stats().recently_expired_dropped.get(), 1);

        s.rt.advance(Duration::from_secs(31));
        assert!(!s
            .table
            .dispatch_cell(TunnelData::new(10.into(), random_cell()), now, &from));
        assert_eq!(s.table.stats().unknown_tunnel.get(), 2);
    }

    #[test]
    fn participants_leave_after_expiring() {
        let s = setup();
        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(hop).unwrap();
        // Expires at +600s; kept for another 91s.
        s.rt.advance(Duration::from_secs(690));
        assert_eq!(s.table.n_registered(), 1);
        s.rt.advance(Duration::from_secs(2));
        assert_eq!(s.table.n_registered(), 0);
        assert_eq!(s.table.n_participating(), 0);
    }

    #[test]
    fn gateway_expiration_window() {
        let s = setup();
        s.fakes.netdb.known.lock().insert(router(2));
        let (_, hop) = relay_hop(&s.rt, 20, 21, 2);
        s.table.join_inbound_gateway(hop).unwrap();
        let now = s.rt.wallclock_millis();

        let gw = TunnelGateway::new(20.into(), data(MessageType::DATA, now + 10_000));
        let r = s.table.dispatch_gateway(gw.clone(), now - 120_000);
        assert!(matches!(r, Err(Error::BadExpiration { .. })));
        let far = TunnelGateway::new(20.into(), data(MessageType::DATA, now + 600_000));
        let r = s.table.dispatch_gateway(far, now + 10_000);
        assert!(matches!(r, Err(Error::BadExpiration { .. })));
        assert_eq!(s.table.stats().bad_expiration.get(), 2);

        assert!(s.table.dispatch_gateway(gw, now + 10_000).unwrap());
        let g = s.table.gateway(20.into()).unwrap();
        assert_eq!(g.prequeue_len(), 1);
        assert_eq!(s.table.pump().run_pending(), 1);
        // One small message: the batcher waits for company.
        assert_eq!(g.working_len(), 1);
        assert!(g.flush_pending());
        assert!(s.fakes.transport.take().is_empty());

        s.rt.advance(Duration::from_millis(50));
        assert_eq!(s.table.pump().run_pending(), 1);
        assert_eq!(g.working_len(), 0);
        let sent = s.fakes.transport.take();
        assert_eq!(sent.len(), 1);
        let td = TunnelData::decode(sent[0].1.payload()).unwrap();
        assert_eq!(sent[0].0, router(2));
        assert_eq!(td.tunnel_id(), 21.into());
    }

    #[test]
    fn zero_hop_inbound_filters() {
        let s = setup();
        let keys = HopKeys::generate(&mut rand::thread_rng());
        let hop = Arc::new(HopRecord::new(30.into(), 0.into(), &keys));
        let route = TunnelRoute::new(Direction::Inbound, vec![hop], vec![router(1)])
            .unwrap()
            .with_destination(router(9));
        s.table.join_inbound(Arc::new(route)).unwrap();
        let now = s.rt.wallclock_millis();

        let lookup = TunnelGateway::new(30.into(), data(MessageType::DATABASE_LOOKUP, now + 5_000));
        assert!(s.table.dispatch_gateway(lookup, now + 5_000).unwrap());
        assert!(s.fakes.local.delivered.lock().is_empty());
        assert_eq!(s.table.stats().dangerous_dropped.get(), 1);

        let garlic = TunnelGateway::new(30.into(), data(MessageType::GARLIC, now + 5_000));
        assert!(s.table.dispatch_gateway(garlic, now + 5_000).unwrap());
        let got = s.fakes.local.delivered.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.msg_type(), MessageType::GARLIC);
        assert_eq!(got[0].1, Some(30.into()));
    }

    #[test]
    fn incoming_by_type() {
        let s = setup();
        let now = s.rt.wallclock_millis();
        assert!(s
            .table
            .dispatch_incoming(data(MessageType::DELIVERY_STATUS, now), &router(4)));
        assert_eq!(s.fakes.local.delivered.lock().len(), 1);

        let td = TunnelData::new(55.into(), random_cell()).into_message(1.into(), now);
        assert!(!s.table.dispatch_incoming(td, &router(4)));
        assert_eq!(s.table.stats().unknown_tunnel.get(), 1);

        let junk = I2npMessage::new(MessageType::TUNNEL_DATA, 2.into(), now, Bytes::new());
        assert!(!s.table.dispatch_incoming(junk, &router(4)));
    }

    #[test]
    fn removal_is_role_specific() {
        let s = setup();
        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(hop).unwrap();
        assert!(!s.table.remove_inbound(10.into()));
        assert!(!s.table.remove_outbound(10.into()));
        assert!(s.table.is_registered(10.into()));
    }

    #[test]
    fn shutdown_clears() {
        let s = setup();
        let (_, hop) = relay_hop(&s.rt, 10, 11, 2);
        s.table.join_participant(Arc::clone(&hop)).unwrap();
        s.table.shutdown();
        s.table.shutdown();
        assert_eq!(s.table.n_registered(), 0);
        assert!(hop.is_destroyed());
        assert!(s.table.pump().is_stopped());
        let (_, again) = relay_hop(&s.rt, 12, 13, 2);
        assert!(matches!(s.table.join_participant(again), Err(Error::Shutdown)));
    }
}
