//! A pool of fixed-size buffers for fragment storage.
//!
//! Reassembly holds on to fragment bodies for up to the reassembly
//! timeout, and there can be thousands of messages in flight.  Rather
//! than allocate for every fragment, we keep a slab of
//! [`CELL_LEN`]-byte buffers and a free list.
//!
//! A buffer is named by a [`BufHandle`], which is neither `Clone` nor
//! `Copy`: whoever holds the handle owns the buffer, and giving it back
//! with [`BufferPool::release`] consumes the handle.  Each slot also
//! carries a generation number, so that a handle that has somehow
//! outlived its buffer is refused with [`Error::UseAfterRelease`]
//! rather than reading someone else's data.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;
use tunnel_cell::cell::CELL_LEN;

use crate::{Counter, Error, Result};

/// Source of distinct pool ids, so handles can't cross pools.
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Counters for a [`BufferPool`].
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Buffers handed out.
    pub acquired: Counter,
    /// Buffers given back.
    pub released: Counter,
}

impl PoolStats {
    /// Return the number of buffers currently handed out.
    pub fn outstanding(&self) -> u64 {
        self.acquired.get().saturating_sub(self.released.get())
    }
    /// Return the current value of every counter, by name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("acquired", self.acquired.get()),
            ("released", self.released.get()),
            ("outstanding", self.outstanding()),
        ]
    }
}

/// Owning reference to one pooled buffer.
#[derive(Debug)]
pub struct BufHandle {
    /// Which pool this came from.
    pool_id: usize,
    /// Index of the slot in the slab.
    index: usize,
    /// Generation of the slot when this handle was issued.
    generation: u64,
}

/// One slot in the slab.
struct Slot {
    /// The storage itself.
    buf: Box<[u8; CELL_LEN]>,
    /// Bumped every time the slot is released.
    generation: u64,
    /// True while a handle to this slot is outstanding.
    in_use: bool,
}

/// State protected by the pool lock.
struct Slab {
    /// Every slot ever allocated.
    slots: Vec<Slot>,
    /// Indices of slots not in use.
    free: Vec<usize>,
}

/// A pool of [`CELL_LEN`]-byte buffers.
pub struct BufferPool {
    /// Distinguishes this pool's handles from other pools'.
    id: usize,
    /// The slab and its free list.
    slab: Mutex<Slab>,
    /// Counters.
    stats: PoolStats,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        BufferPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            slab: Mutex::new(Slab {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            stats: PoolStats::default(),
        }
    }

    /// Take a buffer from the pool, allocating if none is free.
    ///
    /// The buffer's contents are unspecified.
    pub fn acquire(&self) -> BufHandle {
        let mut slab = self.slab.lock();
        let index = match slab.free.pop() {
            Some(i) => i,
            None => {
                slab.slots.push(Slot {
                    buf: Box::new([0_u8; CELL_LEN]),
                    generation: 0,
                    in_use: false,
                });
                slab.slots.len() - 1
            }
        };
        let slot = &mut slab.slots[index];
        slot.in_use = true;
        self.stats.acquired.inc();
        BufHandle {
            pool_id: self.id,
            index,
            generation: slot.generation,
        }
    }

    /// Look up the slot for a handle, checking that it is still live.
    fn live_slot<'a>(&self, slab: &'a mut Slab, h: &BufHandle) -> Result<&'a mut Slot> {
        if h.pool_id != self.id {
            return Err(Error::Internal("buffer handle from another pool"));
        }
        match slab.slots.get_mut(h.index) {
            Some(slot) if slot.in_use && slot.generation == h.generation => Ok(slot),
            _ => {
                error!("pooled buffer {} used after release", h.index);
                Err(Error::UseAfterRelease)
            }
        }
    }

    /// Copy `data` into the buffer named by `h`, starting at the front.
    pub fn write(&self, h: &BufHandle, data: &[u8]) -> Result<()> {
        if data.len() > CELL_LEN {
            return Err(Error::Internal("write larger than a pooled buffer"));
        }
        let mut slab = self.slab.lock();
        let slot = self.live_slot(&mut slab, h)?;
        slot.buf[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Run `f` on the first `len` bytes of the buffer named by `h`.
    pub fn read<T, F>(&self, h: &BufHandle, len: usize, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        if len > CELL_LEN {
            return Err(Error::Internal("read larger than a pooled buffer"));
        }
        let mut slab = self.slab.lock();
        let slot = self.live_slot(&mut slab, h)?;
        Ok(f(&slot.buf[..len]))
    }

    /// Give a buffer back to the pool.
    pub fn release(&self, h: BufHandle) -> Result<()> {
        let mut slab = self.slab.lock();
        let slot = match self.live_slot(&mut slab, &h) {
            Ok(slot) => slot,
            Err(Error::UseAfterRelease) => {
                error!("pooled buffer {} released twice", h.index);
                return Err(Error::DoubleRelease);
            }
            Err(e) => return Err(e),
        };
        slot.in_use = false;
        slot.generation += 1;
        slab.free.push(h.index);
        self.stats.released.inc();
        Ok(())
    }

    /// Return this pool's counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Return the number of buffers the pool has ever allocated.
    pub fn capacity(&self) -> usize {
        self.slab.lock().slots.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl BufHandle {
    /// Testing only: forge a second handle to the same buffer.
    pub(crate) fn forge_duplicate(&self) -> BufHandle {
        BufHandle {
            pool_id: self.pool_id,
            index: self.index,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reuse_slots() {
        let pool = BufferPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        pool.write(&a, b"alpha").unwrap();
        pool.write(&b, b"beta").unwrap();
        assert_eq!(pool.read(&a, 5, |d| d.to_vec()).unwrap(), b"alpha");
        assert_eq!(pool.stats().outstanding(), 2);
        pool.release(a).unwrap();
        let c = pool.acquire();
        // The freed slot is reused rather than a new one allocated.
        assert_eq!(pool.capacity(), 2);
        pool.release(b).unwrap();
        pool.release(c).unwrap();
        assert_eq!(pool.stats().outstanding(), 0);
        assert_eq!(
            pool.stats().snapshot(),
            vec![("acquired", 3), ("released", 3), ("outstanding", 0)]
        );
    }

    #[test]
    fn stale_handles_refused() {
        let pool = BufferPool::new();
        let a = pool.acquire();
        let dup = a.forge_duplicate();
        pool.release(a).unwrap();
        assert_eq!(pool.read(&dup, 1, |_| ()), Err(Error::UseAfterRelease));
        assert_eq!(pool.write(&dup, b"x"), Err(Error::UseAfterRelease));

        // Even after the slot is reused, the old generation is refused.
        let b = pool.acquire();
        assert_eq!(pool.read(&dup, 1, |_| ()), Err(Error::UseAfterRelease));
        assert_eq!(pool.release(dup), Err(Error::DoubleRelease));
        assert_eq!(pool.stats().released.get(), 1);
        pool.release(b).unwrap();
    }

    #[test]
    fn handles_do_not_cross_pools() {
        let p1 = BufferPool::new();
        let p2 = BufferPool::new();
        let a = p1.acquire();
        assert!(matches!(p2.write(&a, b"x"), Err(Error::Internal(_))));
        p1.release(a).unwrap();
    }
}
