//! Per-hop state: one router's view of one tunnel.
//!
//! A relay holds a single [`HopRecord`] for each tunnel it
//! participates in.  The tunnel's creator holds one per hop, inside a
//! [`TunnelRoute`](crate::route::TunnelRoute).  A record knows the
//! identities of its immediate neighbors and nothing further.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use rand::{CryptoRng, Rng};
use tunnel_cell::ids::{RouterHash, TunnelId};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{AeadReplyLayer, AesReplyLayer, HopLayer, TunnelLayer};
use crate::{Error, Result};

/// Key material for one hop, as agreed during tunnel construction.
///
/// Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// AES-256 key for cell payloads.
    pub layer_key: [u8; 32],
    /// AES-256 key for cell IVs.
    pub iv_key: [u8; 32],
    /// AES-256 key for build reply layers.
    pub reply_key: [u8; 32],
    /// IV for build reply layers.
    pub reply_iv: [u8; 16],
    /// AEAD material for this hop's own reply record, if it uses the
    /// AEAD record format.
    pub aead_reply: Option<AeadReplyKeys>,
}

/// ChaCha20-Poly1305 material for a hop's reply record.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadReplyKeys {
    /// The reply key.
    pub key: [u8; 32],
    /// Associated data bound to the record.
    pub ad: [u8; 32],
}

impl HopKeys {
    /// Generate fresh random keys, without AEAD reply material.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        HopKeys {
            layer_key: rng.gen(),
            iv_key: rng.gen(),
            reply_key: rng.gen(),
            reply_iv: rng.gen(),
            aead_reply: None,
        }
    }
    /// Generate fresh random keys, with AEAD reply material.
    pub fn generate_aead<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut keys = Self::generate(rng);
        keys.aead_reply = Some(AeadReplyKeys {
            key: rng.gen(),
            ad: rng.gen(),
        });
        keys
    }
}

/// The keyed layers for a hop, present until the hop is destroyed.
struct Layers {
    /// The layer applied to every cell.
    tunnel: TunnelLayer,
    /// The AES layer for build replies.
    reply: AesReplyLayer,
    /// The AEAD layer for this hop's own reply record, if any.
    aead: Option<AeadReplyLayer>,
}

/// One hop of one tunnel.
pub struct HopRecord {
    /// Tunnel id on which this hop receives cells; zero at a gateway.
    receive_tunnel: TunnelId,
    /// Tunnel id on which this hop sends cells; zero at an endpoint.
    send_tunnel: TunnelId,
    /// The router that sends to us, if we are not the gateway.
    prev_hop: Option<RouterHash>,
    /// The router we send to, if we are not the endpoint.
    next_hop: Option<RouterHash>,
    /// Creation time, ms since the epoch.
    created: u64,
    /// Expiration time, ms since the epoch.
    expiration: u64,
    /// Keys, or None once the hop is destroyed.
    layers: RwLock<Option<Layers>>,
    /// Cells processed by this hop.
    processed: AtomicU64,
    /// Bandwidth allocated to this hop, in bytes per second.
    allocated_bw: AtomicU32,
}

impl HopRecord {
    /// Construct a new hop record from its tunnel ids and keys.
    pub fn new(receive_tunnel: TunnelId, send_tunnel: TunnelId, keys: &HopKeys) -> Self {
        let layers = Layers {
            tunnel: TunnelLayer::new(&keys.layer_key, &keys.iv_key),
            reply: AesReplyLayer::new(&keys.reply_key, &keys.reply_iv),
            aead: keys
                .aead_reply
                .as_ref()
                .map(|a| AeadReplyLayer::new(&a.key, &a.ad)),
        };
        HopRecord {
            receive_tunnel,
            send_tunnel,
            prev_hop: None,
            next_hop: None,
            created: 0,
            expiration: 0,
            layers: RwLock::new(Some(layers)),
            processed: AtomicU64::new(0),
            allocated_bw: AtomicU32::new(0),
        }
    }
    /// Set the previous hop's identity.
    pub fn with_prev_hop(mut self, prev: RouterHash) -> Self {
        self.prev_hop = Some(prev);
        self
    }
    /// Set the next hop's identity.
    pub fn with_next_hop(mut self, next: RouterHash) -> Self {
        self.next_hop = Some(next);
        self
    }
    /// Set creation and expiration times, in ms since the epoch.
    pub fn with_lifetime(mut self, created: u64, expiration: u64) -> Self {
        self.created = created;
        self.expiration = expiration;
        self
    }
    /// Set the bandwidth allocated to this hop, in bytes per second.
    pub fn with_allocated_bw(self, bw: u32) -> Self {
        self.allocated_bw.store(bw, Ordering::Relaxed);
        self
    }

    /// Return the tunnel id on which this hop receives.
    pub fn receive_tunnel(&self) -> TunnelId {
        self.receive_tunnel
    }
    /// Return the tunnel id on which this hop sends.
    pub fn send_tunnel(&self) -> TunnelId {
        self.send_tunnel
    }
    /// Return the previous hop, if any.
    pub fn prev_hop(&self) -> Option<&RouterHash> {
        self.prev_hop.as_ref()
    }
    /// Return the next hop, if any.
    pub fn next_hop(&self) -> Option<&RouterHash> {
        self.next_hop.as_ref()
    }
    /// Return true if this hop is a gateway (it receives from no one).
    pub fn is_gateway(&self) -> bool {
        self.receive_tunnel.is_zero()
    }
    /// Return true if this hop is an endpoint (it sends to no one).
    pub fn is_endpoint(&self) -> bool {
        self.send_tunnel.is_zero() || self.next_hop.is_none()
    }
    /// Return the creation time, ms since the epoch.
    pub fn created(&self) -> u64 {
        self.created
    }
    /// Return the expiration time, ms since the epoch.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }
    /// Return the number of cells this hop has processed.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
    /// Count `n` more processed cells.
    pub fn incr_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }
    /// Return the bandwidth allocated to this hop, in bytes per second.
    pub fn allocated_bw(&self) -> u32 {
        self.allocated_bw.load(Ordering::Relaxed)
    }

    /// Remove this hop's layer from a cell.
    ///
    /// Returns false if the hop has been destroyed or the cell is the
    /// wrong size; the caller drops the cell either way.
    pub fn peel_one_hop(&self, cell: &mut [u8]) -> bool {
        match &*self.layers.read() {
            Some(l) => l.tunnel.peel_one_hop(cell).is_ok(),
            None => false,
        }
    }
    /// Add this hop's layer to a cell.  See [`HopRecord::peel_one_hop`].
    pub fn add_one_hop(&self, cell: &mut [u8]) -> bool {
        match &*self.layers.read() {
            Some(l) => l.tunnel.add_one_hop(cell).is_ok(),
            None => false,
        }
    }
    /// Remove this hop's AES layer from a build reply record.
    pub fn peel_reply(&self, record: &mut [u8]) -> Result<()> {
        match &*self.layers.read() {
            Some(l) => l.reply.peel_one_hop(record),
            None => Err(Error::MissingKey),
        }
    }
    /// Add this hop's AES layer to a build reply record.
    pub fn add_reply(&self, record: &mut [u8]) -> Result<()> {
        match &*self.layers.read() {
            Some(l) => l.reply.add_one_hop(record),
            None => Err(Error::MissingKey),
        }
    }
    /// Remove this hop's AEAD seal from its own reply record.
    pub fn open_aead_reply(&self, record: &mut [u8]) -> Result<()> {
        match &*self.layers.read() {
            Some(Layers { aead: Some(a), .. }) => a.peel_one_hop(record),
            Some(_) => Err(Error::Internal("hop has no AEAD reply key")),
            None => Err(Error::MissingKey),
        }
    }
    /// Seal this hop's own reply record with its AEAD key.
    pub fn seal_aead_reply(&self, record: &mut [u8]) -> Result<()> {
        match &*self.layers.read() {
            Some(Layers { aead: Some(a), .. }) => a.seal(record),
            Some(_) => Err(Error::Internal("hop has no AEAD reply key")),
            None => Err(Error::MissingKey),
        }
    }
    /// Return true if this hop uses the AEAD reply record format.
    pub fn has_aead_reply(&self) -> bool {
        matches!(&*self.layers.read(), Some(Layers { aead: Some(_), .. }))
    }
    /// Forget this hop's keys.  Idempotent.
    pub fn destroy(&self) {
        *self.layers.write() = None;
    }
    /// Return true if [`HopRecord::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.layers.read().is_none()
    }
}

impl std::fmt::Debug for HopRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopRecord")
            .field("receive", &self.receive_tunnel)
            .field("send", &self.send_tunnel)
            .field("prev", &self.prev_hop)
            .field("next", &self.next_hop)
            .field("expiration", &self.expiration)
            .finish()
    }
}
