//! Recover whole messages from the cells arriving at a tunnel's end.
//!
//! A [`ReassemblyEngine`] belongs to one tunnel endpoint.  It checks
//! each cell's checksum, walks its fragment records, hands every
//! fragment to the [`FragmentAssembler`] for its message, and passes
//! each finished message to a [`MessageReceiver`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};
use tunnel_bytes::Reader;
use tunnel_cell::cell;
use tunnel_cell::delivery::Delivery;
use tunnel_cell::frag::Record;
use tunnel_cell::ids::MessageId;
use tunnel_rtcompat::{Runtime, TimerHandle};

use crate::config::ReassemblyConfig;
use crate::fragment::FragmentAssembler;
use crate::pool::BufferPool;
use crate::util::stats::ReassemblyStats;
use crate::{Error, Result};

/// Something that wants the messages that come out of a tunnel.
pub trait MessageReceiver: Send + Sync {
    /// Handle one complete message, bound for `delivery`.
    fn receive_complete(&self, msg: &[u8], delivery: Delivery);
}

impl<F> MessageReceiver for F
where
    F: Fn(&[u8], Delivery) + Send + Sync,
{
    fn receive_complete(&self, msg: &[u8], delivery: Delivery) {
        self(msg, delivery)
    }
}

/// An assembler plus the bookkeeping for its timeout.
struct Pending {
    /// The partial message.
    asm: FragmentAssembler,
    /// Distinguishes this assembler from a later one with the same id.
    serial: u64,
    /// The timeout that will discard it.
    timer: TimerHandle,
}

/// The table of partial messages.
#[derive(Default)]
struct Table {
    /// Partial messages by id.
    pending: HashMap<MessageId, Pending>,
    /// Next serial number to assign.
    next_serial: u64,
}

/// Reassembles fragmented messages at a tunnel endpoint.
pub struct ReassemblyEngine<R: Runtime> {
    /// Clock and timers.
    runtime: R,
    /// Limits and timeouts.
    config: ReassemblyConfig,
    /// Where fragment bodies are stored.
    pool: Arc<BufferPool>,
    /// Partial messages.  Timeouts hold a weak reference.
    table: Arc<Mutex<Table>>,
    /// Where finished messages go.
    receiver: Arc<dyn MessageReceiver>,
    /// Counters.
    stats: Arc<ReassemblyStats>,
}

impl<R: Runtime> ReassemblyEngine<R> {
    /// Construct a new engine.
    pub fn new(
        runtime: R,
        config: ReassemblyConfig,
        pool: Arc<BufferPool>,
        receiver: Arc<dyn MessageReceiver>,
        stats: Arc<ReassemblyStats>,
    ) -> Self {
        ReassemblyEngine {
            runtime,
            config,
            pool,
            table: Arc::new(Mutex::new(Table::default())),
            receiver,
            stats,
        }
    }

    /// Process one decrypted cell.
    ///
    /// Returns false if the cell was corrupt.  Records that preceded the
    /// bad one have already been handled; nothing after it is.  A bad
    /// cell never disturbs the partial messages it doesn't mention.
    pub fn receive(&self, cell_bytes: &[u8]) -> bool {
        let records = match cell::open(cell_bytes) {
            Ok(r) => r,
            Err(e) => {
                debug!("dropping cell: {}", e);
                self.stats.corrupt.inc();
                return false;
            }
        };
        let mut r = Reader::from_slice(records);
        while r.remaining() > 0 {
            let res = Record::take_from(&mut r, self.config.max_fragment_size())
                .map_err(Error::from)
                .and_then(|rec| self.handle_record(rec));
            if let Err(e) = res {
                if e == Error::CellErr(tunnel_cell::Error::UndefinedDeliveryType) {
                    self.stats.unknown_delivery_type.inc();
                }
                debug!("corrupt record in cell: {}", e);
                self.stats.corrupt.inc();
                return false;
            }
        }
        true
    }

    /// Handle one record from a cell.
    fn handle_record(&self, rec: Record<'_>) -> Result<()> {
        match rec {
            Record::First(f) => match f.msg_id {
                None => {
                    trace!("unfragmented message of {} bytes", f.body.len());
                    self.stats.completed.inc();
                    self.receiver.receive_complete(f.body, f.delivery);
                    Ok(())
                }
                Some(id) => self.receive_fragment(id, 0, f.body, false, Some(f.delivery)),
            },
            Record::FollowOn(f) => {
                self.receive_fragment(f.msg_id, f.frag_num as usize, f.body, f.is_last, None)
            }
        }
    }

    /// Add a fragment to its message, delivering the message if that
    /// completes it.
    fn receive_fragment(
        &self,
        id: MessageId,
        index: usize,
        body: &[u8],
        is_last: bool,
        delivery: Option<Delivery>,
    ) -> Result<()> {
        let done = {
            let mut table = self.table.lock();
            if !table.pending.contains_key(&id) {
                let serial = table.next_serial;
                table.next_serial += 1;
                let timer = self.schedule_timeout(id, serial);
                let asm = FragmentAssembler::new(id, self.config.max_fragments(), self.runtime.now());
                table.pending.insert(id, Pending { asm, serial, timer });
            }
            let entry = table
                .pending
                .get_mut(&id)
                .ok_or(Error::Internal("assembler vanished"))?;
            if let Err(e) = entry
                .asm
                .receive_fragment(&self.pool, index, body, is_last, delivery)
            {
                if entry.asm.fragment_count() == 0 {
                    if let Some(mut p) = table.pending.remove(&id) {
                        p.timer.cancel();
                        if let Err(re) = p.asm.release(&self.pool) {
                            warn!("releasing rejected message {}: {}", id, re);
                        }
                    }
                }
                return Err(e);
            }
            if entry.asm.is_complete() {
                match table.pending.remove(&id) {
                    Some(mut p) => {
                        p.timer.cancel();
                        Some(p.asm.take_message(&self.pool)?)
                    }
                    None => None,
                }
            } else {
                None
            }
        };
        if let Some((msg, delivery)) = done {
            trace!("reassembled message {} of {} bytes", id, msg.len());
            self.stats.completed.inc();
            self.receiver.receive_complete(&msg, delivery);
        }
        Ok(())
    }

    /// Arrange for message `id` to be discarded if it is still
    /// incomplete when the timeout expires.
    fn schedule_timeout(&self, id: MessageId, serial: u64) -> TimerHandle {
        let table: Weak<Mutex<Table>> = Arc::downgrade(&self.table);
        let pool = Arc::clone(&self.pool);
        let stats = Arc::clone(&self.stats);
        self.runtime.schedule(
            self.config.timeout(),
            Box::new(move || {
                let table = match table.upgrade() {
                    Some(t) => t,
                    None => return,
                };
                let mut table = table.lock();
                let ours = matches!(table.pending.get(&id), Some(p) if p.serial == serial);
                if !ours {
                    return;
                }
                if let Some(mut p) = table.pending.remove(&id) {
                    debug!(
                        "message {} timed out with {} fragments",
                        id,
                        p.asm.fragment_count()
                    );
                    stats.failed.inc();
                    if let Err(e) = p.asm.release(&pool) {
                        error!("releasing timed-out message {}: {}", id, e);
                    }
                }
            }),
        )
    }

    /// Return the number of partial messages.
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Return this engine's counters.
    pub fn stats(&self) -> &Arc<ReassemblyStats> {
        &self.stats
    }

    /// Discard every partial message and cancel their timeouts.
    pub fn clear(&self) {
        let mut table = self.table.lock();
        for (id, mut p) in table.pending.drain() {
            p.timer.cancel();
            if let Err(e) = p.asm.release(&self.pool) {
                error!("releasing message {} on clear: {}", id, e);
            }
        }
    }
}

impl<R: Runtime> Drop for ReassemblyEngine<R> {
    fn drop(&mut self) {
        self.clear();
    }
}
