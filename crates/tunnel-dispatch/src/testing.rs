//! Testing stubs for the router services the dispatcher talks to.
//! Only enabled with `cfg(test)`.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tunnel_cell::i2np::I2npMessage;
use tunnel_cell::ids::{RouterHash, TunnelId};
use tunnel_proto::hop::{HopKeys, HopRecord};
use tunnel_rtcompat::Clock;
use tunnel_rtmock::MockRuntime;

use crate::config::{DispatchConfig, DispatchConfigBuilder, PumpConfigBuilder};
use crate::traits::{
    BandwidthLimiter, LocalDelivery, LookupCallback, NetDb, OutboundTunnelSelector, PeerProfiles,
    Priority, Services, Transport,
};
use crate::DispatchTable;

pub(crate) fn router(n: u8) -> RouterHash {
    RouterHash::new([n; 32])
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    pub(crate) sent: Mutex<Vec<(RouterHash, I2npMessage, Priority)>>,
    pub(crate) established: Mutex<HashSet<RouterHash>>,
    pub(crate) backlogged: Mutex<HashSet<RouterHash>>,
}

impl FakeTransport {
    pub(crate) fn take(&self) -> Vec<(RouterHash, I2npMessage, Priority)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for FakeTransport {
    fn send(&self, peer: &RouterHash, msg: I2npMessage, priority: Priority) {
        self.sent.lock().push((*peer, msg, priority));
    }
    fn is_established(&self, peer: &RouterHash) -> bool {
        self.established.lock().contains(peer)
    }
    fn is_backlogged(&self, peer: &RouterHash) -> bool {
        self.backlogged.lock().contains(peer)
    }
}

/// A network database that knows some routers, can find some others,
/// and holds lookups until told to answer them.
#[derive(Default)]
pub(crate) struct FakeNetDb {
    pub(crate) known: Mutex<HashSet<RouterHash>>,
    pub(crate) findable: Mutex<HashSet<RouterHash>>,
    pub(crate) pending: Mutex<Vec<(RouterHash, Duration, LookupCallback)>>,
}

impl FakeNetDb {
    /// Answer every pending lookup.  Returns how many there were.
    pub(crate) fn answer_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let n = pending.len();
        for (peer, _, cb) in pending {
            let found = self.findable.lock().contains(&peer);
            if found {
                self.known.lock().insert(peer);
            }
            cb(found);
        }
        n
    }
}

impl NetDb for FakeNetDb {
    fn is_known(&self, peer: &RouterHash) -> bool {
        self.known.lock().contains(peer)
    }
    fn lookup(&self, peer: &RouterHash, timeout: Duration, done: LookupCallback) {
        self.pending.lock().push((*peer, timeout, done));
    }
}

#[derive(Default)]
pub(crate) struct FakeLocal {
    pub(crate) delivered: Mutex<Vec<(I2npMessage, Option<TunnelId>)>>,
}

impl LocalDelivery for FakeLocal {
    fn deliver(&self, msg: I2npMessage, via: Option<TunnelId>) {
        self.delivered.lock().push((msg, via));
    }
}

#[derive(Default)]
pub(crate) struct FakeSelector {
    pub(crate) tunnel: Mutex<Option<TunnelId>>,
}

impl OutboundTunnelSelector for FakeSelector {
    fn select_outbound(&self, _client: Option<&RouterHash>, _target: &RouterHash) -> Option<TunnelId> {
        *self.tunnel.lock()
    }
}

#[derive(Default)]
pub(crate) struct FakeProfiles {
    pub(crate) failures: Mutex<Vec<(RouterHash, u32)>>,
    pub(crate) bans: Mutex<Vec<(RouterHash, &'static str, Duration)>>,
}

impl PeerProfiles for FakeProfiles {
    fn tunnel_failed(&self, peer: &RouterHash, pct: u32) {
        self.failures.lock().push((*peer, pct));
    }
    fn ban(&self, peer: &RouterHash, reason: &'static str, duration: Duration) {
        self.bans.lock().push((*peer, reason, duration));
    }
}

/// A limiter that allows everything, or nothing.
pub(crate) struct FakeLimiter(pub(crate) bool);

impl BandwidthLimiter for FakeLimiter {
    fn sent_participating(&self, _len: usize, _factor: f32, _now: Instant) -> bool {
        self.0
    }
}

/// The fakes behind one [`Services`].
pub(crate) struct Fakes {
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) netdb: Arc<FakeNetDb>,
    pub(crate) local: Arc<FakeLocal>,
    pub(crate) selector: Arc<FakeSelector>,
    pub(crate) profiles: Arc<FakeProfiles>,
}

impl Fakes {
    pub(crate) fn new() -> Self {
        Fakes {
            transport: Arc::default(),
            netdb: Arc::default(),
            local: Arc::default(),
            selector: Arc::default(),
            profiles: Arc::default(),
        }
    }

    pub(crate) fn services(&self, us: RouterHash) -> Services {
        self.services_limited(us, true)
    }

    /// Like [`services`](Fakes::services), but with a global limiter
    /// that allows everything or nothing.
    pub(crate) fn services_limited(&self, us: RouterHash, allow: bool) -> Services {
        Services::new(
            us,
            Arc::clone(&self.transport) as Arc<dyn Transport>,
            Arc::clone(&self.netdb) as Arc<dyn NetDb>,
            Arc::clone(&self.local) as Arc<dyn LocalDelivery>,
            Arc::clone(&self.selector) as Arc<dyn OutboundTunnelSelector>,
            Arc::clone(&self.profiles) as Arc<dyn PeerProfiles>,
            Arc::new(FakeLimiter(allow)),
        )
    }
}

/// A config with no pump threads, so tests pump by hand.
pub(crate) fn manual_config() -> DispatchConfig {
    let mut pump = PumpConfigBuilder::default();
    pump.set_threads(0);
    let mut b = DispatchConfigBuilder::default();
    b.set_pump(pump.build().unwrap());
    b.build().unwrap()
}

pub(crate) struct Setup {
    pub(crate) rt: MockRuntime,
    pub(crate) fakes: Fakes,
    pub(crate) table: Arc<DispatchTable<MockRuntime>>,
}

/// A dispatcher for router 1, pumped by hand.
pub(crate) fn setup() -> Setup {
    setup_with(manual_config())
}

pub(crate) fn setup_with(config: DispatchConfig) -> Setup {
    let rt = MockRuntime::start();
    let fakes = Fakes::new();
    let table = DispatchTable::new(rt.clone(), config, fakes.services(router(1))).unwrap();
    Setup { rt, fakes, table }
}

/// A hand-pumped dispatcher for router 1 whose global bandwidth
/// limiter refuses every participating message.
pub(crate) fn setup_refusing() -> Setup {
    let rt = MockRuntime::start();
    let fakes = Fakes::new();
    let table = DispatchTable::new(rt.clone(), manual_config(), fakes.services_limited(router(1), false)).unwrap();
    Setup { rt, fakes, table }
}

/// A relayed hop record, receiving on `recv` from router 0 and
/// sending on `send` to router `next`, expiring ten minutes from now.
pub(crate) fn relay_hop(rt: &MockRuntime, recv: u32, send: u32, next: u8) -> (HopKeys, Arc<HopRecord>) {
    let keys = HopKeys::generate(&mut rand::thread_rng());
    let now = rt.wallclock_millis();
    let hop = HopRecord::new(recv.into(), send.into(), &keys)
        .with_prev_hop(router(0))
        .with_next_hop(router(next))
        .with_lifetime(now, now + 600_000)
        .with_allocated_bw(10_000);
    (keys, Arc::new(hop))
}
