//! Removing participating tunnels once they expire.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tunnel_cell::ids::TunnelId;

/// Participating tunnels, soonest expiration first.
#[derive(Default)]
pub(super) struct LeaveQueue {
    /// (expiration in ms since the epoch, receive tunnel id)
    heap: Mutex<BinaryHeap<Reverse<(u64, TunnelId)>>>,
}

impl LeaveQueue {
    /// Remember to remove `id` once `expiration` has passed.
    pub(super) fn push(&self, expiration: u64, id: TunnelId) {
        self.heap.lock().push(Reverse((expiration, id)));
    }

    /// Take every id whose expiration plus `grace` is at or before
    /// `now_ms`.
    pub(super) fn take_due(&self, now_ms: u64, grace: Duration) -> Vec<TunnelId> {
        let grace = grace.as_millis() as u64;
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(Reverse((exp, id))) = heap.peek().copied() {
            if exp.saturating_add(grace) > now_ms {
                break;
            }
            heap.pop();
            due.push(id);
        }
        due
    }

    /// Return the number of tunnels waiting to leave.
    pub(super) fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Forget everything.
    pub(super) fn clear(&self) {
        self.heap.lock().clear();
    }
}

/// How long after its stated expiration a participating tunnel is
/// kept, to allow for clock skew between us and its creator.
pub(super) fn leave_grace(clock_fudge: Duration) -> Duration {
    clock_fudge + clock_fudge / 2 + Duration::from_secs(1)
}
