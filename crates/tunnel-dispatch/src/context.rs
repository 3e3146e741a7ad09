//! State shared by every role handler of one dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use rand::Rng;
use tracing::debug;
use tunnel_cell::i2np::{I2npMessage, MessageType};
use tunnel_cell::ids::{MessageId, TunnelId};
use tunnel_proto::pool::BufferPool;
use tunnel_proto::{BatchStats, ReassemblyStats};
use tunnel_rtcompat::Runtime;

use crate::config::DispatchConfig;
use crate::dispatch::DispatchTable;
use crate::pump::Pump;
use crate::role::endpoint::CorruptionTracker;
use crate::shaper::CongestionShaper;
use crate::stats::{DispatchStats, GatewayStats};
use crate::traits::Services;

/// Everything a role handler may need besides its own hop state.
pub(crate) struct Context<R: Runtime> {
    /// Clock and timers.
    pub(crate) runtime: R,
    /// Configuration.
    pub(crate) config: DispatchConfig,
    /// The rest of the router.
    pub(crate) services: Services,
    /// Dispatch counters.
    pub(crate) stats: Arc<DispatchStats>,
    /// Gateway counters.
    pub(crate) gateway_stats: Arc<GatewayStats>,
    /// Batching counters, shared by every gateway.
    pub(crate) batch_stats: Arc<BatchStats>,
    /// Reassembly counters, shared by every endpoint.
    pub(crate) reassembly_stats: Arc<ReassemblyStats>,
    /// Fragment storage, shared by every endpoint.
    pub(crate) pool: Arc<BufferPool>,
    /// Drop decisions for participating traffic.
    pub(crate) shaper: CongestionShaper,
    /// Gateway pump threads.
    pub(crate) pump: Arc<Pump<R>>,
    /// Corrupt-cell history by previous hop.
    pub(crate) corruption: CorruptionTracker,
    /// The table that owns us, for messages that loop back.
    table: Weak<DispatchTable<R>>,
    /// Source of gateway ids.
    next_gateway_id: AtomicU64,
}

impl<R: Runtime> Context<R> {
    /// Assemble a context.
    pub(crate) fn new(
        runtime: R,
        config: DispatchConfig,
        services: Services,
        pump: Arc<Pump<R>>,
        table: Weak<DispatchTable<R>>,
    ) -> Self {
        let stats = Arc::new(DispatchStats::default());
        let shaper = CongestionShaper::new(
            config.transit_throttle_factor(),
            config.share_bandwidth(),
            Arc::clone(&services.limiter),
            Arc::clone(&stats),
        );
        let corruption = CorruptionTracker::new(config.corrupt_threshold(), config.corrupt_window());
        Context {
            runtime,
            config,
            services,
            stats,
            gateway_stats: Arc::new(GatewayStats::default()),
            batch_stats: Arc::new(BatchStats::default()),
            reassembly_stats: Arc::new(ReassemblyStats::default()),
            pool: Arc::new(BufferPool::new()),
            shaper,
            pump,
            corruption,
            table,
            next_gateway_id: AtomicU64::new(1),
        }
    }

    /// Return the monotonic time.
    pub(crate) fn now(&self) -> Instant {
        self.runtime.now()
    }

    /// Return the wall-clock time in ms since the epoch.
    pub(crate) fn now_ms(&self) -> u64 {
        self.runtime.wallclock_millis()
    }

    /// Return the expiration to give a message we forward now.
    pub(crate) fn forward_expiration(&self) -> u64 {
        self.now_ms() + self.config.forward_expiration().as_millis() as u64
    }

    /// Return a fresh random message id.
    pub(crate) fn random_msg_id(&self) -> MessageId {
        rand::thread_rng().gen_range(1..=u32::MAX).into()
    }

    /// Return a new gateway id.
    pub(crate) fn next_gateway_id(&self) -> u64 {
        self.next_gateway_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the dispatch table, unless it's gone.
    pub(crate) fn table(&self) -> Option<Arc<DispatchTable<R>>> {
        self.table.upgrade()
    }

    /// Handle a message whose next hop is this router.
    ///
    /// Tunnel messages go back through the dispatch table; anything
    /// else is for the local message pool.
    pub(crate) fn deliver_local(&self, msg: I2npMessage, via: Option<TunnelId>) {
        let ty = msg.msg_type();
        if ty == MessageType::TUNNEL_DATA || ty == MessageType::TUNNEL_GATEWAY {
            match self.table() {
                Some(t) => {
                    let us = self.services.us;
                    t.dispatch_incoming(msg, &us);
                }
                None => debug!("Dropping looped-back {} after shutdown", ty),
            }
        } else {
            self.services.local.deliver(msg, via);
        }
    }
}
