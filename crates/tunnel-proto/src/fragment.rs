//! Reassembly state for one fragmented message.

use std::time::Instant;

use tracing::{error, warn};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::ids::MessageId;

use crate::pool::{BufHandle, BufferPool};
use crate::{Error, Result};

/// One received fragment: a pooled buffer and how much of it is used.
struct Slot {
    /// The buffer holding the fragment body.
    buf: BufHandle,
    /// Length of the fragment body.
    len: usize,
}

/// Accumulates the fragments of one message until it is complete.
///
/// Fragments may arrive in any order.  The message is complete once the
/// fragment flagged "last" has arrived and so has every fragment before
/// it.  Fragment 0 is the only one that says where the message goes.
pub struct FragmentAssembler {
    /// The message we're assembling.
    msg_id: MessageId,
    /// Received fragments, indexed by fragment number.
    slots: Vec<Option<Slot>>,
    /// Upper bound on fragment numbers.
    max_fragments: usize,
    /// Index of the final fragment, once we've seen it.
    last: Option<usize>,
    /// Highest fragment number seen so far.
    highest: usize,
    /// Number of slots filled.
    received: usize,
    /// Total bytes received.
    total_len: usize,
    /// Delivery instructions, from fragment 0.
    delivery: Option<Delivery>,
    /// When the first fragment arrived.
    created: Instant,
    /// Set once the buffers have gone back to the pool.
    released: bool,
}

impl FragmentAssembler {
    /// Create an empty assembler for `msg_id`.
    pub fn new(msg_id: MessageId, max_fragments: usize, created: Instant) -> Self {
        FragmentAssembler {
            msg_id,
            slots: Vec::new(),
            max_fragments,
            last: None,
            highest: 0,
            received: 0,
            total_len: 0,
            delivery: None,
            created,
            released: false,
        }
    }

    /// Return the id of the message being assembled.
    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }
    /// Return when the first fragment arrived.
    pub fn created(&self) -> Instant {
        self.created
    }
    /// Return the number of fragments received so far.
    pub fn fragment_count(&self) -> usize {
        self.received
    }
    /// Return the number of bytes received so far.
    pub fn total_len(&self) -> usize {
        self.total_len
    }
    /// Return the delivery instructions, if fragment 0 has arrived.
    pub fn delivery(&self) -> Option<&Delivery> {
        self.delivery.as_ref()
    }

    /// Add fragment `index` to this message.
    ///
    /// `delivery` must be given for fragment 0, and only for it.
    /// Out-of-range, duplicate, or contradictory fragments are rejected
    /// with [`Error::Corrupt`], and leave the assembler unchanged.
    pub fn receive_fragment(
        &mut self,
        pool: &BufferPool,
        index: usize,
        body: &[u8],
        is_last: bool,
        delivery: Option<Delivery>,
    ) -> Result<()> {
        if self.released {
            return Err(Error::UseAfterRelease);
        }
        if index >= self.max_fragments {
            return Err(Error::Corrupt("fragment number out of range"));
        }
        if (index == 0) != delivery.is_some() {
            return Err(Error::Corrupt("delivery instructions on wrong fragment"));
        }
        if self.slots.get(index).map(Option::is_some).unwrap_or(false) {
            return Err(Error::Corrupt("duplicate fragment"));
        }
        if let Some(last) = self.last {
            if index > last || (is_last && index != last) {
                return Err(Error::Corrupt("fragment beyond the last one"));
            }
        }
        if is_last && index < self.highest {
            return Err(Error::Corrupt("last fragment precedes others"));
        }

        let buf = pool.acquire();
        if let Err(e) = pool.write(&buf, body) {
            if let Err(re) = pool.release(buf) {
                warn!("releasing buffer for message {}: {}", self.msg_id, re);
            }
            return Err(e);
        }
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(Slot {
            buf,
            len: body.len(),
        });
        self.received += 1;
        self.total_len += body.len();
        self.highest = self.highest.max(index);
        if is_last {
            self.last = Some(index);
        }
        if let Some(d) = delivery {
            self.delivery = Some(d);
        }
        Ok(())
    }

    /// Return true if every fragment has arrived.
    pub fn is_complete(&self) -> bool {
        match self.last {
            Some(last) => !self.released && self.received == last + 1,
            None => false,
        }
    }

    /// Copy out the complete message and release all the buffers.
    pub fn take_message(&mut self, pool: &BufferPool) -> Result<(Vec<u8>, Delivery)> {
        if !self.is_complete() {
            return Err(Error::Internal("taking an incomplete message"));
        }
        let delivery = self
            .delivery
            .ok_or(Error::Internal("complete message without delivery"))?;
        let mut out = Vec::with_capacity(self.total_len);
        for slot in self.slots.iter().flatten() {
            pool.read(&slot.buf, slot.len, |b| out.extend_from_slice(b))?;
        }
        self.release(pool)?;
        Ok((out, delivery))
    }

    /// Give every buffer back to the pool.
    ///
    /// Calling this twice is a bug, and returns [`Error::DoubleRelease`].
    pub fn release(&mut self, pool: &BufferPool) -> Result<()> {
        if self.released {
            error!("fragments of message {} released twice", self.msg_id);
            return Err(Error::DoubleRelease);
        }
        self.released = true;
        let mut result = Ok(());
        for slot in self.slots.drain(..).flatten() {
            if let Err(e) = pool.release(slot.buf) {
                result = Err(e);
            }
        }
        result
    }

    /// Return true if this assembler's buffers have been released.
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl std::fmt::Debug for FragmentAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentAssembler")
            .field("msg_id", &self.msg_id)
            .field("received", &self.received)
            .field("last", &self.last)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn asm() -> FragmentAssembler {
        FragmentAssembler::new(MessageId::from(1), 64, Instant::now())
    }

    #[test]
    fn out_of_order() {
        let pool = BufferPool::new();
        let mut a = asm();
        a.receive_fragment(&pool, 2, b"ghi", true, None).unwrap();
        assert!(!a.is_complete());
        a.receive_fragment(&pool, 0, b"abc", false, Some(Delivery::Local))
            .unwrap();
        assert!(!a.is_complete());
        a.receive_fragment(&pool, 1, b"def", false, None).unwrap();
        assert!(a.is_complete());
        assert_eq!(pool.stats().outstanding(), 3);
        let (msg, d) = a.take_message(&pool).unwrap();
        assert_eq!(msg, b"abcdefghi");
        assert_eq!(d, Delivery::Local);
        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(a.release(&pool), Err(Error::DoubleRelease));
        assert_eq!(pool.stats().released.get(), 3);
    }

    #[test]
    fn rejects_inconsistent_fragments() {
        let pool = BufferPool::new();
        let mut a = asm();
        a.receive_fragment(&pool, 1, b"x", false, None).unwrap();
        assert!(a.receive_fragment(&pool, 1, b"y", false, None).is_err());
        assert!(a.receive_fragment(&pool, 64, b"y", true, None).is_err());
        assert!(a.receive_fragment(&pool, 2, b"y", false, Some(Delivery::Local)).is_err());
        assert!(a.receive_fragment(&pool, 0, b"y", false, None).is_err());
        a.receive_fragment(&pool, 3, b"z", true, None).unwrap();
        assert!(a.receive_fragment(&pool, 4, b"w", false, None).is_err());
        assert!(a.receive_fragment(&pool, 2, b"w", true, None).is_err());
        assert_eq!(a.fragment_count(), 2);
        assert_eq!(pool.stats().outstanding(), 2);
        a.release(&pool).unwrap();
        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(
            a.receive_fragment(&pool, 0, b"", false, Some(Delivery::Local)),
            Err(Error::UseAfterRelease)
        );
    }

    #[test]
    fn last_before_higher() {
        let pool = BufferPool::new();
        let mut a = asm();
        a.receive_fragment(&pool, 5, b"x", false, None).unwrap();
        assert!(a.receive_fragment(&pool, 3, b"y", true, None).is_err());
        a.release(&pool).unwrap();
    }
}
