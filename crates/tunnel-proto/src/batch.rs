//! Pack outbound messages into cells.
//!
//! A tunnel gateway keeps a queue of [`PendingMessage`]s.  Each time
//! the queue changes, it asks a [`BatchingEngine`] to turn as much of
//! the queue as it sensibly can into cells.  Full cells always go out
//! at once.  A partly-full cell goes out if the queue is long, the
//! cell is nearly full, or the oldest message has waited long enough;
//! otherwise the engine asks to be called again after a delay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{error, trace};
use tunnel_bytes::SliceWriter;
use tunnel_cell::cell::{self, RawCell, CELL_LEN, FULL_SIZE, MAX_FRAGMENT_SIZE};
use tunnel_cell::delivery::Delivery;
use tunnel_cell::frag::{self, FOLLOW_ON_INSTRUCTION_LEN, MAX_FRAGMENT_NUM};
use tunnel_cell::ids::MessageId;

use crate::config::BatchConfig;
use crate::util::stats::BatchStats;
use crate::{Error, Result};

/// Largest message we can fragment.
///
/// Each follow-on fragment starts a fresh cell, so every fragment
/// after the first can carry at most [`MAX_FRAGMENT_SIZE`] bytes; the
/// first carries no more than that either.
pub const MAX_MESSAGE_LEN: usize = MAX_FRAGMENT_NUM as usize * MAX_FRAGMENT_SIZE;

/// Extra instruction bytes for the message id of a fragmented message.
const MSG_ID_LEN: usize = 4;

/// A message waiting to be sent, possibly partway through.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// The encoded message.
    data: Bytes,
    /// Where the endpoint should send it.
    delivery: Delivery,
    /// Id for its fragments.
    msg_id: MessageId,
    /// Expiration, in milliseconds since the epoch.
    expiration: u64,
    /// Bytes already written into cells.
    offset: usize,
    /// Number of the next fragment to write.
    frag_num: u8,
    /// When it was queued.
    created: Instant,
}

impl PendingMessage {
    /// Wrap `data` for sending.
    ///
    /// Fails if the message is empty or too long to fragment.
    pub fn new(
        data: Bytes,
        delivery: Delivery,
        msg_id: MessageId,
        expiration: u64,
        created: Instant,
    ) -> Result<Self> {
        if data.is_empty() || data.len() > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLong(data.len()));
        }
        Ok(PendingMessage {
            data,
            delivery,
            msg_id,
            expiration,
            offset: 0,
            frag_num: 0,
            created,
        })
    }

    /// Return the whole message.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
    /// Return the delivery instructions.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }
    /// Return the message id used for fragments.
    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }
    /// Return the expiration time in milliseconds since the epoch.
    pub fn expiration(&self) -> u64 {
        self.expiration
    }
    /// Return true if the message expired before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration < now_ms
    }
    /// Return when the message was queued.
    pub fn created(&self) -> Instant {
        self.created
    }
    /// Return the number of bytes already written into cells.
    pub fn offset(&self) -> usize {
        self.offset
    }
    /// Return the number of the next fragment.
    pub fn frag_num(&self) -> u8 {
        self.frag_num
    }
    /// Return the number of bytes still to send.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
    /// Return true once every byte has been written.
    pub fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Return the instruction size for this message's next fragment,
    /// if it were placed after `allocated` bytes of a cell.
    fn instruction_len(&self, allocated: usize) -> usize {
        if self.frag_num > 0 {
            return FOLLOW_ON_INSTRUCTION_LEN;
        }
        let base = frag::first_instruction_len(&self.delivery, false);
        if allocated + self.remaining() + base > FULL_SIZE {
            base + MSG_ID_LEN
        } else {
            base
        }
    }

    /// Write as much of this message as fits into `buf` after `used`
    /// bytes, and return the new number of used bytes.
    fn write_fragment(&mut self, buf: &mut [u8], used: usize) -> Result<usize> {
        let remaining = self.remaining();
        let mut w = SliceWriter::new(buf, used);
        if self.frag_num == 0 {
            let base = frag::first_instruction_len(&self.delivery, false);
            if used + remaining + base > FULL_SIZE {
                let instr = base + MSG_ID_LEN;
                if used + instr >= FULL_SIZE {
                    return Err(Error::Internal("no room for first fragment"));
                }
                let len = FULL_SIZE - instr - used;
                let body = &self.data[self.offset..self.offset + len];
                frag::write_first(&mut w, &self.delivery, Some(self.msg_id), body)?;
                self.offset += len;
                self.frag_num = 1;
            } else {
                frag::write_first(&mut w, &self.delivery, None, &self.data[self.offset..])?;
                self.offset = self.data.len();
            }
        } else {
            if self.frag_num > MAX_FRAGMENT_NUM {
                return Err(Error::Internal("too many fragments"));
            }
            let fits = used + FOLLOW_ON_INSTRUCTION_LEN + remaining <= FULL_SIZE;
            let len = if fits {
                remaining
            } else if used + FOLLOW_ON_INSTRUCTION_LEN < FULL_SIZE {
                FULL_SIZE - FOLLOW_ON_INSTRUCTION_LEN - used
            } else {
                return Err(Error::Internal("no room for follow-on fragment"));
            };
            let body = &self.data[self.offset..self.offset + len];
            frag::write_follow_on(&mut w, self.msg_id, self.frag_num, fits, body)?;
            self.offset += len;
            self.frag_num += 1;
        }
        Ok(w.finish()?)
    }
}

/// Something that takes finished (but not yet encrypted) cells.
pub trait CellSink {
    /// Take ownership of one framed cell.
    fn send_cell(&mut self, cell: Box<RawCell>);
}

impl CellSink for Vec<Box<RawCell>> {
    fn send_cell(&mut self, cell: Box<RawCell>) {
        self.push(cell);
    }
}

/// What a gateway should do after a call to
/// [`BatchingEngine::preprocess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BatchOutcome {
    /// Nothing is left in the queue.
    Drained,
    /// Messages remain; call again after this long.
    Delay(Duration),
}

/// Decides when queued messages become cells, and builds the cells.
pub struct BatchingEngine {
    /// Thresholds and delays.
    config: BatchConfig,
    /// When the oldest unsent partial cell started waiting.
    pending_since: Option<Instant>,
    /// Counters.
    stats: Arc<BatchStats>,
}

impl BatchingEngine {
    /// Create a new engine.
    pub fn new(config: BatchConfig, stats: Arc<BatchStats>) -> Self {
        BatchingEngine {
            config,
            pending_since: None,
            stats,
        }
    }

    /// Return this engine's counters.
    pub fn stats(&self) -> &Arc<BatchStats> {
        &self.stats
    }

    /// Return the fill level past which a partial cell is sent at once.
    fn full_enough(&self) -> usize {
        FULL_SIZE * self.config.full_enough_percent() / 100
    }

    /// Return how much longer the current partial cell may wait.
    ///
    /// The wait is measured from when the partial cell started waiting,
    /// not from this call, so later messages can't postpone it.
    pub fn delay_amount(&self, now: Instant) -> Duration {
        let delay = self.config.send_delay();
        match self.pending_since {
            Some(since) => (since + delay).saturating_duration_since(now).min(delay),
            None => delay,
        }
    }

    /// Turn messages from `pending` into cells, passing each cell to
    /// `sink`.
    ///
    /// Completely sent messages are removed from the front of
    /// `pending`.  A message split across cells stays at the front
    /// until its last fragment is sent.
    pub fn preprocess(
        &mut self,
        pending: &mut VecDeque<PendingMessage>,
        now: Instant,
        sink: &mut dyn CellSink,
    ) -> Result<BatchOutcome> {
        'cells: while !pending.is_empty() {
            let mut allocated = 0;
            for i in 0..pending.len() {
                let instr = pending[i].instruction_len(allocated);
                let wanted = pending[i].remaining() + instr;
                allocated += wanted;
                if allocated < FULL_SIZE {
                    continue;
                }
                let mut last = i;
                if allocated - wanted + instr >= FULL_SIZE {
                    // Not even one byte of message i fits; end the cell
                    // before it.
                    if i == 0 {
                        error!("a lone message can't fit in an empty cell");
                        return Err(Error::Internal("message can't fit in an empty cell"));
                    }
                    last = i - 1;
                }
                self.pending_since = None;
                self.send(pending, last, sink)?;
                self.stats.full_cells.inc();
                for _ in 0..last {
                    match pending.pop_front() {
                        Some(m) if m.is_complete() => {}
                        _ => {
                            error!("message left unfinished in the middle of a full cell");
                            return Err(Error::Internal("unfinished message inside a cell"));
                        }
                    }
                }
                if pending.front().map_or(false, PendingMessage::is_complete) {
                    pending.pop_front();
                }
                continue 'cells;
            }

            // Everything left fits in one partial cell.
            let timed_out = self.pending_since.is_some() && self.delay_amount(now) == Duration::ZERO;
            let flush = pending.len() > self.config.force_flush_count()
                || timed_out
                || allocated >= self.full_enough();
            if !flush {
                if self.pending_since.is_none() {
                    self.pending_since = Some(now);
                }
                self.stats.delays_requested.inc();
                let delay = self.delay_amount(now);
                trace!(
                    "holding {} messages ({} bytes) for {:?}",
                    pending.len(),
                    allocated,
                    delay
                );
                return Ok(BatchOutcome::Delay(delay));
            }

            self.send(pending, pending.len() - 1, sink)?;
            self.stats.partial_flushes.inc();
            while pending.front().map_or(false, PendingMessage::is_complete) {
                pending.pop_front();
            }
            if !pending.is_empty() {
                error!("partial flush left {} messages unsent", pending.len());
                self.pending_since = Some(now);
                return Err(Error::Internal("partial flush left messages unsent"));
            }
        }
        self.pending_since = None;
        Ok(BatchOutcome::Drained)
    }

    /// Write messages `0..=last` of `pending` into one cell and send it.
    fn send(
        &self,
        pending: &mut VecDeque<PendingMessage>,
        last: usize,
        sink: &mut dyn CellSink,
    ) -> Result<()> {
        let mut records = [0_u8; FULL_SIZE];
        let mut used = 0;
        for msg in pending.iter_mut().take(last + 1) {
            used = msg.write_fragment(&mut records[..], used)?;
        }
        if used == 0 {
            error!("tried to send an empty cell");
            return Err(Error::Internal("empty cell"));
        }
        self.stats.small_fragment_waste.add((FULL_SIZE - used) as u64);
        let mut out: Box<RawCell> = Box::new([0_u8; CELL_LEN]);
        cell::frame(&mut out[..], &records[..used], &mut rand::thread_rng())?;
        trace!("sending cell with {} record bytes", used);
        sink.send_cell(out);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tunnel_bytes::Reader;
    use tunnel_cell::frag::Record;

    fn engine() -> BatchingEngine {
        BatchingEngine::new(BatchConfig::default(), Arc::default())
    }

    fn msg(len: usize, id: u32, now: Instant) -> PendingMessage {
        PendingMessage::new(
            Bytes::from(vec![id as u8; len]),
            Delivery::Local,
            MessageId::from(id),
            u64::MAX,
            now,
        )
        .unwrap()
    }

    /// Return the body lengths of the records in `c`.
    fn body_lens(c: &RawCell) -> Vec<usize> {
        let recs = cell::open(&c[..]).unwrap();
        let mut r = Reader::from_slice(recs);
        let mut out = Vec::new();
        while r.remaining() > 0 {
            match Record::take_from(&mut r, MAX_FRAGMENT_SIZE).unwrap() {
                Record::First(f) => out.push(f.body.len()),
                Record::FollowOn(f) => out.push(f.body.len()),
            }
        }
        out
    }

    #[test]
    fn too_long() {
        let now = Instant::now();
        let big = Bytes::from(vec![0; MAX_MESSAGE_LEN + 1]);
        let r = PendingMessage::new(big, Delivery::Local, MessageId::from(1), 0, now);
        assert_eq!(r.unwrap_err(), Error::MessageTooLong(MAX_MESSAGE_LEN + 1));
        let empty = PendingMessage::new(Bytes::new(), Delivery::Local, MessageId::from(1), 0, now);
        assert!(empty.is_err());
    }

    #[test]
    fn three_cells_for_2500_bytes() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut q: VecDeque<_> = vec![msg(2500, 7, t0)].into();
        let mut out: Vec<Box<RawCell>> = Vec::new();

        let r = e.preprocess(&mut q, t0, &mut out).unwrap();
        assert_eq!(r, BatchOutcome::Delay(Duration::from_millis(50)));
        assert_eq!(out.len(), 2);
        assert_eq!(body_lens(&out[0]), vec![996]);
        assert_eq!(body_lens(&out[1]), vec![996]);
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].remaining(), 508);

        let r = e
            .preprocess(&mut q, t0 + Duration::from_millis(50), &mut out)
            .unwrap();
        assert_eq!(r, BatchOutcome::Drained);
        assert_eq!(out.len(), 3);
        assert_eq!(body_lens(&out[2]), vec![508]);
        assert!(q.is_empty());

        let s = e.stats();
        assert_eq!(s.full_cells.get(), 2);
        assert_eq!(s.partial_flushes.get(), 1);
        assert_eq!(s.delays_requested.get(), 1);
        assert_eq!(s.small_fragment_waste.get(), (FULL_SIZE - 515) as u64);
    }

    #[test]
    fn delay_is_not_restarted() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut q: VecDeque<_> = vec![msg(10, 1, t0)].into();
        let mut out: Vec<Box<RawCell>> = Vec::new();
        assert_eq!(
            e.preprocess(&mut q, t0, &mut out).unwrap(),
            BatchOutcome::Delay(Duration::from_millis(50))
        );
        let t1 = t0 + Duration::from_millis(30);
        q.push_back(msg(10, 2, t1));
        assert_eq!(
            e.preprocess(&mut q, t1, &mut out).unwrap(),
            BatchOutcome::Delay(Duration::from_millis(20))
        );
        assert!(out.is_empty());
        let t2 = t0 + Duration::from_millis(60);
        assert_eq!(e.preprocess(&mut q, t2, &mut out).unwrap(), BatchOutcome::Drained);
        assert_eq!(out.len(), 1);
        assert_eq!(body_lens(&out[0]), vec![10, 10]);
    }

    #[test]
    fn flush_thresholds() {
        let t0 = Instant::now();
        let mut out: Vec<Box<RawCell>> = Vec::new();

        // Five short messages wait; six go at once.
        let mut e = engine();
        let mut q: VecDeque<_> = (0..5).map(|i| msg(20, i, t0)).collect();
        assert!(matches!(
            e.preprocess(&mut q, t0, &mut out).unwrap(),
            BatchOutcome::Delay(_)
        ));
        q.push_back(msg(20, 5, t0));
        assert_eq!(e.preprocess(&mut q, t0, &mut out).unwrap(), BatchOutcome::Drained);
        assert_eq!(out.len(), 1);
        assert_eq!(body_lens(&out[0]).len(), 6);

        // A cell that is 80% full goes at once.
        let mut e = engine();
        let mut q: VecDeque<_> = vec![msg(799, 9, t0)].into();
        assert_eq!(e.preprocess(&mut q, t0, &mut out).unwrap(), BatchOutcome::Drained);
        assert_eq!(out.len(), 2);
        // ...but slightly less than that waits.
        let mut q: VecDeque<_> = vec![msg(798, 10, t0)].into();
        assert!(matches!(
            e.preprocess(&mut q, t0, &mut out).unwrap(),
            BatchOutcome::Delay(_)
        ));
    }

    #[test]
    fn packing_splits_the_overflow() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut q: VecDeque<_> = (1..=3).map(|i| msg(400, i, t0)).collect();
        let mut out: Vec<Box<RawCell>> = Vec::new();
        let r = e.preprocess(&mut q, t0, &mut out).unwrap();
        assert!(matches!(r, BatchOutcome::Delay(_)));
        assert_eq!(out.len(), 1);
        // Two whole messages, then as much of the third as fits.
        assert_eq!(body_lens(&out[0]), vec![400, 400, 1003 - 806 - 7]);
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].msg_id(), MessageId::from(3));
        assert_eq!(q[0].frag_num(), 1);
        assert_eq!(q[0].remaining(), 400 - 190);
    }

    #[test]
    fn exact_fit_is_unfragmented() {
        let t0 = Instant::now();
        let mut e = engine();
        let mut q: VecDeque<_> = vec![msg(FULL_SIZE - 3, 1, t0)].into();
        let mut out: Vec<Box<RawCell>> = Vec::new();
        assert_eq!(e.preprocess(&mut q, t0, &mut out).unwrap(), BatchOutcome::Drained);
        assert_eq!(out.len(), 1);
        assert_eq!(body_lens(&out[0]), vec![FULL_SIZE - 3]);
        assert_eq!(e.stats().full_cells.get(), 1);
        assert_eq!(e.stats().small_fragment_waste.get(), 0);
    }
}
