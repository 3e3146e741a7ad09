//! Pre-queues: where messages wait between `add()` and the next pump.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

use tunnel_cell::delivery::Delivery;
use tunnel_cell::i2np::I2npMessage;

use crate::traits::Priority;

/// A message handed to a gateway, with where it should end up.
#[derive(Debug, Clone)]
pub(crate) struct GatewayMessage {
    /// The message itself.
    pub(crate) msg: I2npMessage,
    /// Where the tunnel endpoint should send it.
    pub(crate) delivery: Delivery,
    /// Send order between messages on one gateway.
    pub(crate) priority: Priority,
    /// When it was added.
    pub(crate) queued_at: Instant,
    /// Arrival order, for FIFO order within a priority.
    seq: u64,
}

impl GatewayMessage {
    /// Wrap a message for queuing.
    pub(crate) fn new(msg: I2npMessage, delivery: Delivery, priority: Priority, now: Instant) -> Self {
        GatewayMessage {
            msg,
            delivery,
            priority,
            queued_at: now,
            seq: 0,
        }
    }
}

impl PartialEq for GatewayMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for GatewayMessage {}
impl PartialOrd for GatewayMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for GatewayMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest priority first; then earliest first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The messages a gateway hasn't pumped yet.
#[derive(Debug)]
pub(crate) enum PreQueue {
    /// Our own outbound gateway: unbounded, highest message priority
    /// first, and first in first out within a priority.
    Priority {
        /// Waiting messages.
        heap: BinaryHeap<GatewayMessage>,
        /// Next sequence number.
        next_seq: u64,
    },
    /// An inbound gateway we relay: bounded, first in first out.
    Bounded {
        /// Waiting messages.
        fifo: VecDeque<GatewayMessage>,
        /// Most messages we hold.
        max: usize,
    },
}

impl PreQueue {
    /// Create a priority pre-queue.
    pub(crate) fn priority(initial_capacity: usize) -> Self {
        PreQueue::Priority {
            heap: BinaryHeap::with_capacity(initial_capacity),
            next_seq: 0,
        }
    }

    /// Create a bounded FIFO pre-queue.
    pub(crate) fn bounded(max: usize) -> Self {
        PreQueue::Bounded {
            fifo: VecDeque::new(),
            max,
        }
    }

    /// Add `m`.  Returns false, dropping it, if the queue is full.
    pub(crate) fn offer(&mut self, mut m: GatewayMessage) -> bool {
        match self {
            PreQueue::Priority { heap, next_seq } => {
                m.seq = *next_seq;
                *next_seq += 1;
                heap.push(m);
                true
            }
            PreQueue::Bounded { fifo, max } => {
                if fifo.len() >= *max {
                    return false;
                }
                fifo.push_back(m);
                true
            }
        }
    }

    /// Move up to `max` messages, in send order, onto `out`.
    pub(crate) fn drain_into(&mut self, out: &mut Vec<GatewayMessage>, max: usize) {
        match self {
            PreQueue::Priority { heap, .. } => {
                while out.len() < max {
                    match heap.pop() {
                        Some(m) => out.push(m),
                        None => break,
                    }
                }
            }
            PreQueue::Bounded { fifo, .. } => {
                let n = max.saturating_sub(out.len()).min(fifo.len());
                out.extend(fifo.drain(..n));
            }
        }
    }

    /// Return the number of waiting messages.
    pub(crate) fn len(&self) -> usize {
        match self {
            PreQueue::Priority { heap, .. } => heap.len(),
            PreQueue::Bounded { fifo, .. } => fifo.len(),
        }
    }

    /// Return true if nothing is waiting.
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard everything.
    pub(crate) fn clear(&mut self) {
        match self {
            PreQueue::Priority { heap, .. } => heap.clear(),
            PreQueue::Bounded { fifo, .. } => fifo.clear(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use tunnel_cell::i2np::MessageType;

    fn msg(id: u32, prio: i32, now: Instant) -> GatewayMessage {
        let m = I2npMessage::new(MessageType::DATA, id.into(), 0, Bytes::from_static(b"x"));
        GatewayMessage::new(m, Delivery::Local, Priority(prio), now)
    }

    fn ids(v: &[GatewayMessage]) -> Vec<u32> {
        v.iter().map(|m| m.msg.id().get()).collect()
    }

    #[test]
    fn priority_then_fifo() {
        let now = Instant::now();
        let mut q = PreQueue::priority(4);
        assert!(q.offer(msg(1, 100, now)));
        assert!(q.offer(msg(2, 400, now)));
        assert!(q.offer(msg(3, 100, now)));
        assert!(q.offer(msg(4, 400, now)));
        assert_eq!(q.len(), 4);
        let mut out = Vec::new();
        q.drain_into(&mut out, 3);
        assert_eq!(ids(&out), vec![2, 4, 1]);
        out.clear();
        q.drain_into(&mut out, 10);
        assert_eq!(ids(&out), vec![3]);
        assert!(q.is_empty());
    }

    #[test]
    fn bounded_overflow() {
        let now = Instant::now();
        let mut q = PreQueue::bounded(2);
        assert!(q.offer(msg(1, 0, now)));
        assert!(q.offer(msg(2, 999, now)));
        assert!(!q.offer(msg(3, 0, now)));
        let mut out = Vec::new();
        q.drain_into(&mut out, 1);
        assert_eq!(ids(&out), vec![1]);
        assert!(q.offer(msg(4, 0, now)));
        q.clear();
        assert!(q.is_empty());
    }
}
