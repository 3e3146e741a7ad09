//! A tunnel as seen by the router that created it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;
use tunnel_cell::ids::{RouterHash, TunnelId};

use crate::crypto::reply::{aead_record_status, verify_aes_record};
use crate::hop::HopRecord;
use crate::{Error, Result};

/// After this many consecutive failed tests, a tunnel is abandoned.
pub const MAX_CONSECUTIVE_TEST_FAILURES: u32 = 2;

/// Which way a tunnel carries traffic relative to its creator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From some gateway towards us.
    Inbound,
    /// From us towards some endpoint.
    Outbound,
}

/// A tunnel we created: every hop's keys, in order from gateway to
/// endpoint, plus bookkeeping.
///
/// For an outbound tunnel, hop 0 is us; for an inbound tunnel, the
/// last hop is us.
pub struct TunnelRoute {
    /// The hops, gateway first.
    hops: Vec<Arc<HopRecord>>,
    /// The router at each hop, aligned with `hops`.
    peers: Vec<RouterHash>,
    /// Which way this tunnel goes.
    direction: Direction,
    /// The client destination this tunnel serves; None if exploratory.
    destination: Option<RouterHash>,
    /// Priority of messages sent down this tunnel.
    priority: i32,
    /// Expiration, ms since the epoch.
    expiration: u64,
    /// Consecutive failed tests.
    failures: AtomicU32,
    /// Set once this tunnel has failed too often to hand out again.
    reused: AtomicBool,
    /// Messages carried.
    processed_messages: AtomicU64,
    /// Bytes carried and verified at the far end.
    verified_bytes: AtomicU64,
}

impl TunnelRoute {
    /// Construct a route from its hops and the router at each hop.
    pub fn new(
        direction: Direction,
        hops: Vec<Arc<HopRecord>>,
        peers: Vec<RouterHash>,
    ) -> Result<Self> {
        if hops.is_empty() || hops.len() != peers.len() {
            return Err(Error::Internal("route needs one peer per hop"));
        }
        let expiration = hops.iter().map(|h| h.expiration()).min().unwrap_or(0);
        Ok(TunnelRoute {
            hops,
            peers,
            direction,
            destination: None,
            priority: 0,
            expiration,
            failures: AtomicU32::new(0),
            reused: AtomicBool::new(false),
            processed_messages: AtomicU64::new(0),
            verified_bytes: AtomicU64::new(0),
        })
    }
    /// Mark this as a client tunnel serving `dest`.
    pub fn with_destination(mut self, dest: RouterHash) -> Self {
        self.destination = Some(dest);
        self
    }
    /// Set the priority for messages sent down this tunnel.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Return the number of hops, including us.
    pub fn len(&self) -> usize {
        self.hops.len()
    }
    /// Return true if the route has no hops (never true once built).
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
    /// Return the `i`th hop.
    pub fn hop(&self, i: usize) -> Option<&Arc<HopRecord>> {
        self.hops.get(i)
    }
    /// Return the router at the `i`th hop.
    pub fn peer(&self, i: usize) -> Option<&RouterHash> {
        self.peers.get(i)
    }
    /// Return the direction of this tunnel.
    pub fn direction(&self) -> Direction {
        self.direction
    }
    /// Return true if this is an inbound tunnel.
    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }
    /// Return true if this tunnel serves no particular client.
    pub fn is_exploratory(&self) -> bool {
        self.destination.is_none()
    }
    /// Return the client destination, if any.
    pub fn destination(&self) -> Option<&RouterHash> {
        self.destination.as_ref()
    }
    /// Return the priority of messages on this tunnel.
    pub fn priority(&self) -> i32 {
        self.priority
    }
    /// Return the expiration, ms since the epoch.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    /// Return the tunnel id by which this route is registered locally.
    ///
    /// For an outbound tunnel that's our send id to hop 1; for an
    /// inbound tunnel it's the id on which we receive from the last
    /// relay.
    pub fn local_id(&self) -> TunnelId {
        match self.direction {
            Direction::Outbound => self.hops[0].send_tunnel(),
            Direction::Inbound => self.hops[self.hops.len() - 1].receive_tunnel(),
        }
    }

    /// Pre-encrypt a cell we are about to send down an outbound tunnel,
    /// so that each relay's single peel exposes the next layer.
    ///
    /// Returns false if any hop's keys are gone.
    pub fn encrypt_outbound(&self, cell: &mut [u8]) -> bool {
        if self.direction != Direction::Outbound {
            return false;
        }
        self.hops[1..]
            .iter()
            .rev()
            .all(|hop| hop.add_one_hop(cell))
    }

    /// Undo every relay's layer on a cell that reached us at the end of
    /// an inbound tunnel.
    ///
    /// Returns false if any hop's keys are gone.
    pub fn decrypt_inbound(&self, cell: &mut [u8]) -> bool {
        if self.direction != Direction::Inbound {
            return false;
        }
        let relays = &self.hops[..self.hops.len() - 1];
        relays.iter().rev().all(|hop| hop.add_one_hop(cell))
    }

    /// Decrypt and verify the reply record written by hop `hop`, and
    /// return its status byte.
    ///
    /// Every hop after `hop` (except an inbound tunnel's last, which is
    /// us) has added an AES layer; `hop` itself has either added one
    /// too, over a hashed record, or sealed the record with its AEAD
    /// key.  Any failure yields None.
    pub fn decrypt_reply_record(&self, hop: usize, record: &mut [u8]) -> Option<u8> {
        let this = self.hops.get(hop)?;
        let mut start = self.hops.len() as isize - 1;
        if self.is_inbound() {
            start -= 1;
        }
        let is_aead = this.has_aead_reply();
        let end = if is_aead { hop as isize + 1 } else { hop as isize };
        let mut j = start;
        while j >= end {
            if let Err(e) = self.hops[j as usize].peel_reply(record) {
                debug!("reply layer {} for hop {} failed: {}", j, hop, e);
                return None;
            }
            j -= 1;
        }
        let status = if is_aead {
            this.open_aead_reply(record)
                .and_then(|()| aead_record_status(record))
        } else {
            verify_aes_record(record)
        };
        match status {
            Ok(s) => Some(s),
            Err(e) => {
                debug!("reply record for hop {} did not verify: {}", hop, e);
                None
            }
        }
    }

    /// Note that a test of this tunnel failed.
    ///
    /// Returns true if the tunnel should still be used.  Past
    /// [`MAX_CONSECUTIVE_TEST_FAILURES`], marks the tunnel reused and
    /// returns false.
    pub fn tunnel_failed(&self) -> bool {
        let n = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if n <= MAX_CONSECUTIVE_TEST_FAILURES {
            true
        } else {
            self.reused.store(true, Ordering::Release);
            false
        }
    }
    /// Note that this tunnel failed outright; it will not be used again.
    pub fn tunnel_failed_completely(&self) {
        self.failures
            .store(MAX_CONSECUTIVE_TEST_FAILURES + 1, Ordering::Release);
        self.reused.store(true, Ordering::Release);
    }
    /// Note that a test of this tunnel succeeded.
    pub fn test_successful(&self) {
        self.failures.store(0, Ordering::Release);
    }
    /// Return the number of consecutive failed tests.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
    /// Return true if this tunnel has been given up on.
    pub fn is_reused(&self) -> bool {
        self.reused.load(Ordering::Acquire)
    }
    /// Count `n` more messages carried.
    pub fn incr_processed_messages(&self, n: u64) {
        self.processed_messages.fetch_add(n, Ordering::Relaxed);
    }
    /// Return the number of messages carried.
    pub fn processed_messages(&self) -> u64 {
        self.processed_messages.load(Ordering::Relaxed)
    }
    /// Count `n` more bytes verified at the far end.
    pub fn incr_verified_bytes(&self, n: u64) {
        self.verified_bytes.fetch_add(n, Ordering::Relaxed);
    }
    /// Return the number of bytes verified at the far end.
    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::Relaxed)
    }
    /// Forget every hop's keys.
    pub fn destroy(&self) {
        for h in &self.hops {
            h.destroy();
        }
    }
}

impl std::fmt::Debug for TunnelRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRoute")
            .field("direction", &self.direction)
            .field("len", &self.hops.len())
            .field("local_id", &self.local_id())
            .field("exploratory", &self.is_exploratory())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::reply::{make_aes_record, REPLY_RECORD_LEN, TAG_LEN};
    use crate::hop::HopKeys;
    use rand::RngCore;
    use tunnel_cell::cell::CELL_LEN;

    fn build(direction: Direction, aead: &[bool]) -> TunnelRoute {
        let mut rng = rand::thread_rng();
        let n = aead.len();
        let hops = aead
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let keys = if *a {
                    HopKeys::generate_aead(&mut rng)
                } else {
                    HopKeys::generate(&mut rng)
                };
                let recv = if i == 0 { 0 } else { 100 + i as u32 };
                let send = if i + 1 == n { 0 } else { 101 + i as u32 };
                Arc::new(HopRecord::new(recv.into(), send.into(), &keys))
            })
            .collect();
        let peers = (0..n).map(|i| RouterHash::new([i as u8; 32])).collect();
        TunnelRoute::new(direction, hops, peers).unwrap()
    }

    #[test]
    fn outbound_layers() {
        let route = build(Direction::Outbound, &[false; 4]);
        assert_eq!(route.local_id(), TunnelId::from(101));
        let mut cell = [0_u8; CELL_LEN];
        rand::thread_rng().fill_bytes(&mut cell);
        let orig = cell;
        assert!(route.encrypt_outbound(&mut cell));
        for i in 1..4 {
            assert!(route.hop(i).unwrap().peel_one_hop(&mut cell));
        }
        assert_eq!(&cell[..], &orig[..]);
        assert!(!route.decrypt_inbound(&mut cell));
    }

    #[test]
    fn inbound_layers() {
        let route = build(Direction::Inbound, &[false; 3]);
        assert_eq!(route.local_id(), TunnelId::from(102));
        let mut cell = [0_u8; CELL_LEN];
        rand::thread_rng().fill_bytes(&mut cell);
        let orig = cell;
        // The gateway and the participant each peel once...
        for i in 0..2 {
            assert!(route.hop(i).unwrap().peel_one_hop(&mut cell));
        }
        // ...and we undo both.
        assert!(route.decrypt_inbound(&mut cell));
        assert_eq!(&cell[..], &orig[..]);

        route.hop(0).unwrap().destroy();
        assert!(!route.decrypt_inbound(&mut cell));
    }

    #[test]
    fn failure_counting() {
        let route = build(Direction::Outbound, &[false; 2]);
        assert!(route.tunnel_failed());
        assert!(route.tunnel_failed());
        assert!(!route.is_reused());
        assert!(!route.tunnel_failed());
        assert!(route.is_reused());
        route.test_successful();
        assert_eq!(route.failure_count(), 0);
        route.tunnel_failed_completely();
        assert_eq!(route.failure_count(), 3);
    }

    #[test]
    fn reply_records() {
        // Hop 1 uses AES records, hop 2 AEAD; hop 0 is us.
        let route = build(Direction::Outbound, &[false, false, true]);

        // Hop 1 writes its record and adds its layer; hop 2 adds its own.
        let mut r1 = make_aes_record(b"one", 0);
        route.hop(1).unwrap().add_reply(&mut r1).unwrap();
        route.hop(2).unwrap().add_reply(&mut r1).unwrap();
        assert_eq!(route.decrypt_reply_record(1, &mut r1), Some(0));

        // Hop 2 seals its own record; no later hop touches it.
        let mut r2 = [0_u8; REPLY_RECORD_LEN];
        r2[REPLY_RECORD_LEN - TAG_LEN - 1] = 50;
        route.hop(2).unwrap().seal_aead_reply(&mut r2).unwrap();
        let mut copy = r2;
        assert_eq!(route.decrypt_reply_record(2, &mut copy), Some(50));

        // Tampering is caught.
        r2[0] ^= 1;
        assert_eq!(route.decrypt_reply_record(2, &mut r2), None);
        assert_eq!(route.decrypt_reply_record(9, &mut r2), None);
    }
}
