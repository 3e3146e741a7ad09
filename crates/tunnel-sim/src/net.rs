//! A network of routers that lives in one process.
//!
//! Every router has its own [`DispatchTable`] and pump threads.  What
//! one router's transport sends goes onto a single shared queue, and a
//! carrier thread hands each message to its destination's dispatcher
//! in order.  Nothing is lost unless a router drops it.

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use tunnel_cell::i2np::I2npMessage;
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_dispatch::config::DispatchConfig;
use tunnel_dispatch::shaper::TokenBucket;
use tunnel_dispatch::traits::{
    LocalDelivery, LookupCallback, NetDb, OutboundTunnelSelector, PeerProfiles, Priority,
    Services, Transport,
};
use tunnel_dispatch::DispatchTable;
use tunnel_proto::hop::{HopKeys, HopRecord};
use tunnel_proto::route::{Direction, TunnelRoute};
use tunnel_rtcompat::{Clock, SystemRuntime};

/// Bandwidth each router grants a hop it relays.
const HOP_BANDWIDTH: u32 = 64 * 1024;

/// One message in flight.
struct Frame {
    /// Sender.
    from: RouterHash,
    /// Recipient.
    to: RouterHash,
    /// The message.
    msg: I2npMessage,
}

/// Queue state behind the wire's lock.
#[derive(Default)]
struct WireState {
    /// Messages not yet delivered, oldest first.
    frames: VecDeque<Frame>,
    /// Set when the network is shutting down.
    stopping: bool,
}

/// Every link in the network.
#[derive(Default)]
pub(crate) struct Wire {
    /// Queued messages.
    state: Mutex<WireState>,
    /// Signalled when a message is queued or we stop.
    wake: Condvar,
    /// Messages handed to their recipient so far.
    carried: AtomicU64,
}

impl Wire {
    /// Queue a message.
    fn push(&self, frame: Frame) {
        {
            let mut s = self.state.lock();
            if s.stopping {
                return;
            }
            s.frames.push_back(frame);
        }
        self.wake.notify_one();
    }

    /// Wait for the next message.  Returns None once stopped.
    fn next(&self) -> Option<Frame> {
        let mut s = self.state.lock();
        loop {
            if s.stopping {
                return None;
            }
            if let Some(f) = s.frames.pop_front() {
                return Some(f);
            }
            self.wake.wait(&mut s);
        }
    }

    /// Stop carrying, and forget whatever is queued.
    fn stop(&self) {
        {
            let mut s = self.state.lock();
            s.stopping = true;
            s.frames.clear();
        }
        self.wake.notify_all();
    }

    /// Return the number of messages delivered so far.
    pub(crate) fn carried(&self) -> u64 {
        self.carried.load(Ordering::Relaxed)
    }
}

/// One router's end of the wire.
struct Link {
    /// The router sending.
    us: RouterHash,
    /// Where it sends.
    wire: Arc<Wire>,
}

impl Transport for Link {
    fn send(&self, peer: &RouterHash, msg: I2npMessage, priority: Priority) {
        trace!("{} -> {}: {} at priority {}", self.us, peer, msg.msg_type(), priority.0);
        self.wire.push(Frame {
            from: self.us,
            to: *peer,
            msg,
        });
    }
    fn is_established(&self, _peer: &RouterHash) -> bool {
        true
    }
    fn is_backlogged(&self, _peer: &RouterHash) -> bool {
        false
    }
}

/// Knows every router in the network, and nobody else.
struct Directory {
    /// Members.
    routers: HashSet<RouterHash>,
}

impl NetDb for Directory {
    fn is_known(&self, peer: &RouterHash) -> bool {
        self.routers.contains(peer)
    }
    fn lookup(&self, peer: &RouterHash, _timeout: Duration, done: LookupCallback) {
        done(self.routers.contains(peer));
    }
}

/// Counts what reaches one router.
#[derive(Default)]
pub(crate) struct Inbox {
    /// Messages delivered.
    messages: AtomicU64,
    /// Payload bytes delivered.
    bytes: AtomicU64,
    /// Messages that came out of one of our inbound tunnels.
    via_tunnel: AtomicU64,
}

impl Inbox {
    /// Return the number of messages delivered.
    pub(crate) fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
    /// Return the number of payload bytes delivered.
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
    /// Return the number delivered from an inbound tunnel.
    pub(crate) fn via_tunnel(&self) -> u64 {
        self.via_tunnel.load(Ordering::Relaxed)
    }
}

impl LocalDelivery for Inbox {
    fn deliver(&self, msg: I2npMessage, via: Option<TunnelId>) {
        debug!("Delivered {} ({} bytes) via {:?}", msg.msg_type(), msg.payload().len(), via);
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(msg.payload().len() as u64, Ordering::Relaxed);
        if via.is_some() {
            self.via_tunnel.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Hands out the router's one outbound tunnel, once it has one.
#[derive(Default)]
struct Selector {
    /// Our outbound tunnel.
    tunnel: Mutex<Option<TunnelId>>,
}

impl OutboundTunnelSelector for Selector {
    fn select_outbound(&self, _client: Option<&RouterHash>, _target: &RouterHash) -> Option<TunnelId> {
        *self.tunnel.lock()
    }
}

/// Logs blame instead of keeping profiles.
struct Reputation {
    /// Whose opinion this is.
    us: RouterHash,
}

impl PeerProfiles for Reputation {
    fn tunnel_failed(&self, peer: &RouterHash, pct: u32) {
        info!("{} charges {} with {}% of a tunnel failure", self.us, peer, pct);
    }
    fn ban(&self, peer: &RouterHash, reason: &'static str, duration: Duration) {
        warn!("{} bans {} for {:?}: {}", self.us, peer, duration, reason);
    }
}

/// One simulated router.
pub(crate) struct SimRouter {
    /// Its identity.
    pub(crate) id: RouterHash,
    /// Its dispatcher.
    pub(crate) table: Arc<DispatchTable<SystemRuntime>>,
    /// What it received.
    pub(crate) inbox: Arc<Inbox>,
    /// Its choice of outbound tunnel for onward traffic.
    selector: Arc<Selector>,
}

/// A tunnel, as its creator sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tunnel {
    /// The id the creator registered it under.
    pub(crate) local_id: TunnelId,
    /// The id its gateway receives on.
    pub(crate) gateway_id: TunnelId,
}

/// The whole network.
pub(crate) struct SimNet {
    /// The routers, in creation order.
    routers: Vec<SimRouter>,
    /// The shared links.
    wire: Arc<Wire>,
    /// The thread that carries messages.
    carrier: Option<JoinHandle<()>>,
    /// Clocks and timers for every router.
    runtime: SystemRuntime,
}

/// Deliver messages until the wire stops.
fn carry(wire: Arc<Wire>, tables: HashMap<RouterHash, Arc<DispatchTable<SystemRuntime>>>) {
    while let Some(f) = wire.next() {
        match tables.get(&f.to) {
            Some(t) => {
                t.dispatch_incoming(f.msg, &f.from);
            }
            None => debug!("No router {} on this network", f.to),
        }
        wire.carried.fetch_add(1, Ordering::Relaxed);
    }
}

impl SimNet {
    /// Start `n` routers, each with `config`.
    pub(crate) fn new(n: usize, config: &DispatchConfig) -> Result<Self> {
        if n == 0 || n > usize::from(u8::MAX) {
            bail!("can't simulate {} routers", n);
        }
        let runtime = SystemRuntime::new()?;
        let wire = Arc::new(Wire::default());
        let ids: Vec<RouterHash> = (1..=n).map(|i| RouterHash::new([i as u8; 32])).collect();
        let directory = Arc::new(Directory {
            routers: ids.iter().copied().collect(),
        });

        let mut routers = Vec::with_capacity(n);
        for &id in &ids {
            let inbox = Arc::new(Inbox::default());
            let selector = Arc::new(Selector::default());
            let services = Services::new(
                id,
                Arc::new(Link {
                    us: id,
                    wire: Arc::clone(&wire),
                }),
                Arc::clone(&directory) as Arc<dyn NetDb>,
                Arc::clone(&inbox) as Arc<dyn LocalDelivery>,
                Arc::clone(&selector) as Arc<dyn OutboundTunnelSelector>,
                Arc::new(Reputation { us: id }),
                Arc::new(TokenBucket::new(config.share_bandwidth())),
            );
            let table = DispatchTable::new(runtime.clone(), config.clone(), services)?;
            routers.push(SimRouter {
                id,
                table,
                inbox,
                selector,
            });
        }

        let tables: HashMap<_, _> = routers
            .iter()
            .map(|r| (r.id, Arc::clone(&r.table)))
            .collect();
        let w = Arc::clone(&wire);
        let carrier = std::thread::Builder::new()
            .name("sim-wire".into())
            .spawn(move || carry(w, tables))?;
        info!("Started {} routers", n);
        Ok(SimNet {
            routers,
            wire,
            carrier: Some(carrier),
            runtime,
        })
    }

    /// Return router `i`.
    pub(crate) fn router(&self, i: usize) -> &SimRouter {
        &self.routers[i]
    }

    /// Return every router.
    pub(crate) fn routers(&self) -> &[SimRouter] {
        &self.routers
    }

    /// Return the wire.
    pub(crate) fn wire(&self) -> &Wire {
        &self.wire
    }

    /// Return the current time in ms since the epoch.
    pub(crate) fn now_ms(&self) -> u64 {
        self.runtime.wallclock_millis()
    }

    /// Send `msg` from router `from` straight to router `to`.
    pub(crate) fn send(&self, from: usize, to: usize, msg: I2npMessage) {
        self.wire.push(Frame {
            from: self.routers[from].id,
            to: self.routers[to].id,
            msg,
        });
    }

    /// Plan a tunnel through `path`, with fresh keys and tunnel ids.
    ///
    /// The gateway of an outbound tunnel receives on no tunnel at all.
    fn plan(&self, path: &[usize], lifetime: Duration, outbound: bool) -> Result<Vec<HopPlan>> {
        if path.is_empty() || path.iter().any(|&i| i >= self.routers.len()) {
            bail!("bad tunnel path {:?}", path);
        }
        let mut rng = rand::thread_rng();
        let created = self.now_ms();
        let expiration = created + lifetime.as_millis() as u64;
        let ids: Vec<TunnelId> = path.iter().map(|_| rng.gen_range(1..=u32::MAX).into()).collect();
        // A zero-hop outbound tunnel is still registered by its send id.
        let last_send = if outbound && path.len() == 1 {
            ids[0]
        } else {
            0.into()
        };
        Ok((0..path.len())
            .map(|i| HopPlan {
                keys: HopKeys::generate(&mut rng),
                receive: if outbound && i == 0 { 0.into() } else { ids[i] },
                send: ids.get(i + 1).copied().unwrap_or(last_send),
                prev: i.checked_sub(1).map(|p| self.routers[path[p]].id),
                next: path.get(i + 1).map(|&n| self.routers[n].id),
                created,
                expiration,
            })
            .collect())
    }

    /// Build an outbound tunnel for router `path[0]`, through the rest
    /// of `path`.  Its creator will use it for onward traffic.
    pub(crate) fn build_outbound(&self, path: &[usize], lifetime: Duration) -> Result<Tunnel> {
        let plan = self.plan(path, lifetime, true)?;
        let n = plan.len();
        for (i, hop) in plan.iter().enumerate().skip(1) {
            let table = &self.routers[path[i]].table;
            if i == n - 1 {
                table.join_outbound_endpoint(hop.record())?;
            } else {
                table.join_participant(hop.record())?;
            }
        }
        let creator = &self.routers[path[0]];
        let route = TunnelRoute::new(
            Direction::Outbound,
            plan.iter().map(HopPlan::record).collect(),
            path.iter().map(|&i| self.routers[i].id).collect(),
        )?;
        let local_id = route.local_id();
        creator.table.join_outbound(Arc::new(route))?;
        *creator.selector.tunnel.lock() = Some(local_id);
        info!("Built {}-hop outbound tunnel {} for {}", n, local_id, creator.id);
        Ok(Tunnel {
            local_id,
            gateway_id: local_id,
        })
    }

    /// Build an inbound tunnel that ends at router `path[last]`, with
    /// its gateway at `path[0]`.
    pub(crate) fn build_inbound(
        &self,
        path: &[usize],
        lifetime: Duration,
        client: Option<RouterHash>,
    ) -> Result<Tunnel> {
        let plan = self.plan(path, lifetime, false)?;
        let n = plan.len();
        for (i, hop) in plan.iter().enumerate().take(n - 1) {
            let table = &self.routers[path[i]].table;
            if i == 0 {
                table.join_inbound_gateway(hop.record())?;
            } else {
                table.join_participant(hop.record())?;
            }
        }
        let creator = &self.routers[path[n - 1]];
        let mut route = TunnelRoute::new(
            Direction::Inbound,
            plan.iter().map(HopPlan::record).collect(),
            path.iter().map(|&i| self.routers[i].id).collect(),
        )?;
        if let Some(c) = client {
            route = route.with_destination(c);
        }
        let local_id = route.local_id();
        creator.table.join_inbound(Arc::new(route))?;
        info!("Built {}-hop inbound tunnel {} for {}", n, local_id, creator.id);
        Ok(Tunnel {
            local_id,
            gateway_id: plan[0].receive,
        })
    }

    /// Wait until `done` returns true, or `limit` passes.  Returns
    /// whether `done` was satisfied.
    pub(crate) fn wait_for<F>(&self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < limit {
            if done(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done(self)
    }

    /// Stop carrying messages and shut every router down.
    pub(crate) fn shutdown(&mut self) {
        self.wire.stop();
        if let Some(h) = self.carrier.take() {
            if h.join().is_err() {
                warn!("The carrier thread panicked");
            }
        }
        for r in &self.routers {
            r.table.shutdown();
        }
    }
}

impl Drop for SimNet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything needed to make one hop's record, on either side of it.
struct HopPlan {
    /// The hop's keys.
    keys: HopKeys,
    /// Id the hop receives on.
    receive: TunnelId,
    /// Id the hop sends on, or zero at the end.
    send: TunnelId,
    /// The router before this one.
    prev: Option<RouterHash>,
    /// The router after this one.
    next: Option<RouterHash>,
    /// Creation time, ms since the epoch.
    created: u64,
    /// Expiration time, ms since the epoch.
    expiration: u64,
}

impl HopPlan {
    /// Make a record for this hop.  The creator and the relay each get
    /// their own.
    fn record(&self) -> Arc<HopRecord> {
        let mut h = HopRecord::new(self.receive, self.send, &self.keys)
            .with_lifetime(self.created, self.expiration)
            .with_allocated_bw(HOP_BANDWIDTH);
        if let Some(p) = self.prev {
            h = h.with_prev_hop(p);
        }
        if let Some(n) = self.next {
            h = h.with_next_hop(n);
        }
        Arc::new(h)
    }
}
