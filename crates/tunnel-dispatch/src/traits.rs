//! Collaborators supplied by the rest of the router.
//!
//! The dispatch layer moves messages between tunnels, but it doesn't
//! own connections, the network database, or anything that consumes
//! messages addressed to us.  Each of those is a trait here, and a
//! [`Services`] bundle holds one of each.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tunnel_cell::i2np::I2npMessage;
use tunnel_cell::ids::{RouterHash, TunnelId};

/// Priority of a message handed to the transport.  Higher goes first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Traffic for other routers' tunnels.
    pub const PARTICIPATING: Priority = Priority(200);
    /// Traffic we originate.
    pub const MY_DATA: Priority = Priority(400);
}

/// Sends messages to directly connected routers.
pub trait Transport: Send + Sync {
    /// Queue `msg` for delivery to `peer`.
    ///
    /// Must not block; the transport drops what it can't send.
    fn send(&self, peer: &RouterHash, msg: I2npMessage, priority: Priority);
    /// Return true if we have a connection to `peer`.
    fn is_established(&self, peer: &RouterHash) -> bool;
    /// Return true if the connection to `peer` has a long send queue.
    fn is_backlogged(&self, peer: &RouterHash) -> bool;
}

/// Called when a lookup finishes, with true if the router was found.
pub type LookupCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// The part of the network database that the data plane needs.
pub trait NetDb: Send + Sync {
    /// Return true if we already know how to reach `peer`.
    fn is_known(&self, peer: &RouterHash) -> bool;
    /// Start looking `peer` up, and call `done` within `timeout`.
    fn lookup(&self, peer: &RouterHash, timeout: Duration, done: LookupCallback);
}

/// Consumes messages whose journey ends at this router.
pub trait LocalDelivery: Send + Sync {
    /// Handle `msg`.  `via` is the inbound tunnel it arrived on, if any.
    fn deliver(&self, msg: I2npMessage, via: Option<TunnelId>);
}

/// Chooses one of our outbound tunnels for onward traffic.
pub trait OutboundTunnelSelector: Send + Sync {
    /// Return an outbound tunnel for traffic to `target`, from the
    /// client pool for `client`, or the exploratory pool if `None`.
    fn select_outbound(&self, client: Option<&RouterHash>, target: &RouterHash)
        -> Option<TunnelId>;
}

/// Records what we learn about other routers' behaviour.
pub trait PeerProfiles: Send + Sync {
    /// Charge `peer` with `pct` percent of one tunnel failure.
    fn tunnel_failed(&self, peer: &RouterHash, pct: u32);
    /// Refuse to deal with `peer` for `duration`.
    fn ban(&self, peer: &RouterHash, reason: &'static str, duration: Duration);
}

/// The router-wide limit on participating traffic.
pub trait BandwidthLimiter: Send + Sync {
    /// Account for sending `len` participating bytes; return false if
    /// the message should be dropped instead.
    fn sent_participating(&self, len: usize, factor: f32, now: Instant) -> bool;
}

/// Everything the dispatch layer needs from the rest of the router.
#[derive(Clone)]
#[non_exhaustive]
pub struct Services {
    /// Our own identity.
    pub us: RouterHash,
    /// Connections to other routers.
    pub transport: Arc<dyn Transport>,
    /// Router lookups.
    pub netdb: Arc<dyn NetDb>,
    /// Messages for us.
    pub local: Arc<dyn LocalDelivery>,
    /// Our outbound tunnels.
    pub selector: Arc<dyn OutboundTunnelSelector>,
    /// Peer reputation.
    pub profiles: Arc<dyn PeerProfiles>,
    /// Shared bandwidth limit.
    pub limiter: Arc<dyn BandwidthLimiter>,
}

impl Services {
    /// Bundle a set of collaborators.
    pub fn new(
        us: RouterHash,
        transport: Arc<dyn Transport>,
        netdb: Arc<dyn NetDb>,
        local: Arc<dyn LocalDelivery>,
        selector: Arc<dyn OutboundTunnelSelector>,
        profiles: Arc<dyn PeerProfiles>,
        limiter: Arc<dyn BandwidthLimiter>,
    ) -> Self {
        Services {
            us,
            transport,
            netdb,
            local,
            selector,
            profiles,
            limiter,
        }
    }
}
