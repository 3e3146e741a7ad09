//! Configuration logic for a tunnel dispatcher.

use derive_builder::Builder;
use serde::Deserialize;

use std::time::Duration;

use tunnel_proto::config::{BatchConfig, ReassemblyConfig};

/// Most pump threads we will ever start.
const MAX_PUMP_THREADS: usize = 4;

/// Pick a pump thread count from the number of available cores.
fn default_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).max(1).min(MAX_PUMP_THREADS)
}

/// Configuration for the pump threads shared by every local gateway.
///
/// This type is immutable once constructed. To create an object of this
/// type, use [`PumpConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct PumpConfig {
    /// Number of worker threads.  Zero means nobody pumps until
    /// [`Pump::run_pending`](crate::pump::Pump::run_pending) is called.
    #[builder(default = "default_threads()")]
    pub(crate) threads: usize,

    /// How long a gateway with leftover messages waits before it is
    /// pumped again.
    #[builder(default = "Duration::from_millis(50)")]
    #[serde(with = "humantime_serde")]
    pub(crate) requeue_delay: Duration,

    /// Messages taken from an outbound gateway's queue per pump.
    #[builder(default = "256")]
    pub(crate) max_outbound_per_pump: usize,

    /// Messages taken from an inbound gateway's queue per pump.
    #[builder(default = "128")]
    pub(crate) max_inbound_per_pump: usize,

    /// Messages taken per pump from an outbound gateway whose first hop
    /// is backlogged.
    #[builder(default = "2")]
    pub(crate) backlogged_outbound_per_pump: usize,

    /// Messages taken per pump from an inbound gateway whose next hop
    /// is backlogged.
    #[builder(default = "1")]
    pub(crate) backlogged_inbound_per_pump: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfigBuilder::default().build().unwrap()
    }
}

impl PumpConfig {
    /// Return the number of worker threads to start.
    pub fn threads(&self) -> usize {
        self.threads.min(MAX_PUMP_THREADS)
    }
    /// Return the requeue delay for gateways with leftover messages.
    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }
    /// Return how many messages to take from one queue in one pump.
    pub fn per_pump(&self, inbound: bool, backlogged: bool) -> usize {
        let n = match (inbound, backlogged) {
            (false, false) => self.max_outbound_per_pump,
            (false, true) => self.backlogged_outbound_per_pump,
            (true, false) => self.max_inbound_per_pump,
            (true, true) => self.backlogged_inbound_per_pump,
        };
        n.max(1)
    }
}

/// Configuration for gateway pre-queues.
///
/// This type is immutable once constructed. To create an object of this
/// type, use [`GatewayConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct GatewayConfig {
    /// Initial capacity of an outbound gateway's priority queue.
    #[builder(default = "256")]
    pub(crate) initial_outbound_queue: usize,

    /// Most messages an inbound gateway we relay will hold.
    #[builder(default = "2048")]
    pub(crate) max_inbound_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfigBuilder::default().build().unwrap()
    }
}

impl GatewayConfig {
    /// Return the initial capacity of an outbound pre-queue.
    pub fn initial_outbound_queue(&self) -> usize {
        self.initial_outbound_queue
    }
    /// Return the bound on an inbound pre-queue.
    pub fn max_inbound_queue(&self) -> usize {
        self.max_inbound_queue.max(1)
    }
}

/// Configuration for a [`DispatchTable`](crate::DispatchTable).
///
/// This type is immutable once constructed.  To create an object of
/// this type, use [`DispatchConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct DispatchConfig {
    /// How far apart our clock and a peer's might be.
    #[builder(default = "Duration::from_secs(60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) clock_fudge: Duration,

    /// Messages expiring further in the future than this are refused.
    #[builder(default = "Duration::from_secs(3 * 60 + 60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) max_future_expiration: Duration,

    /// How long to remember a removed tunnel id, so that late messages
    /// for it are dropped quietly.
    #[builder(default = "Duration::from_secs(30)")]
    #[serde(with = "humantime_serde")]
    pub(crate) recent_expiry_window: Duration,

    /// Lifetime given to each message we forward.
    #[builder(default = "Duration::from_secs(20)")]
    #[serde(with = "humantime_serde")]
    pub(crate) forward_expiration: Duration,

    /// Messages that expired longer ago than this are not forwarded.
    #[builder(default = "Duration::from_secs(75)")]
    #[serde(with = "humantime_serde")]
    pub(crate) max_forward_age: Duration,

    /// Timeout for a next-hop lookup while forwarding.
    #[builder(default = "Duration::from_secs(15)")]
    #[serde(with = "humantime_serde")]
    pub(crate) lookup_timeout: Duration,

    /// Timeout for the next-hop lookup made when a tunnel is joined.
    #[builder(default = "Duration::from_secs(25)")]
    #[serde(with = "humantime_serde")]
    pub(crate) long_lookup_timeout: Duration,

    /// How often to look for expired participating tunnels.
    #[builder(default = "Duration::from_secs(1)")]
    #[serde(with = "humantime_serde")]
    pub(crate) leave_scan_interval: Duration,

    /// Bandwidth we share with other routers' tunnels, bytes per second.
    #[builder(default = "256 * 1024")]
    pub(crate) share_bandwidth: u32,

    /// Scale applied to every participating-traffic drop decision.
    /// Zero disables early dropping.
    #[builder(default = "1.0")]
    pub(crate) transit_throttle_factor: f32,

    /// Most previously unseen routers an endpoint may contact per period.
    #[builder(default = "64")]
    pub(crate) max_new_routers_per_period: usize,

    /// Length of the new-router period.
    #[builder(default = "Duration::from_secs(15)")]
    #[serde(with = "humantime_serde")]
    pub(crate) new_router_period: Duration,

    /// Corrupt cells from one previous hop that trigger a ban.
    #[builder(default = "3")]
    pub(crate) corrupt_threshold: u32,

    /// Window over which corrupt cells are counted.
    #[builder(default = "Duration::from_secs(10 * 60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) corrupt_window: Duration,

    /// How long to ban a previous hop that keeps sending corrupt cells.
    #[builder(default = "Duration::from_secs(8 * 60 * 60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) corrupt_ban: Duration,

    /// When to send partly-full cells.
    #[builder(default)]
    pub(crate) batch: BatchConfig,

    /// Pump threads and batch sizes.
    #[builder(default)]
    pub(crate) pump: PumpConfig,

    /// Gateway queue sizes.
    #[builder(default)]
    pub(crate) gateway: GatewayConfig,

    /// Reassembly limits.
    #[builder(default)]
    pub(crate) reassembly: ReassemblyConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfigBuilder::default().build().unwrap()
    }
}

impl DispatchConfig {
    /// Return the clock-skew allowance.
    pub fn clock_fudge(&self) -> Duration {
        self.clock_fudge
    }
    /// Return the farthest future expiration we accept.
    pub fn max_future_expiration(&self) -> Duration {
        self.max_future_expiration
    }
    /// Return how long removed ids are remembered.
    pub fn recent_expiry_window(&self) -> Duration {
        self.recent_expiry_window
    }
    /// Return the lifetime given to forwarded messages.
    pub fn forward_expiration(&self) -> Duration {
        self.forward_expiration
    }
    /// Return the oldest expiration we still forward.
    pub fn max_forward_age(&self) -> Duration {
        self.max_forward_age
    }
    /// Return the next-hop lookup timeout.
    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }
    /// Return the lookup timeout used at join time.
    pub fn long_lookup_timeout(&self) -> Duration {
        self.long_lookup_timeout
    }
    /// Return the interval between expiry scans.
    pub fn leave_scan_interval(&self) -> Duration {
        self.leave_scan_interval
    }
    /// Return the shared bandwidth, bytes per second.
    pub fn share_bandwidth(&self) -> u32 {
        self.share_bandwidth
    }
    /// Return the throttle factor for participating traffic.
    pub fn transit_throttle_factor(&self) -> f32 {
        self.transit_throttle_factor.max(0.0)
    }
    /// Return the new-router limit per period.
    pub fn max_new_routers_per_period(&self) -> usize {
        self.max_new_routers_per_period
    }
    /// Return the new-router period.
    pub fn new_router_period(&self) -> Duration {
        self.new_router_period
    }
    /// Return the corruption count that triggers a ban.
    pub fn corrupt_threshold(&self) -> u32 {
        self.corrupt_threshold.max(1)
    }
    /// Return the corruption counting window.
    pub fn corrupt_window(&self) -> Duration {
        self.corrupt_window
    }
    /// Return the length of a corruption ban.
    pub fn corrupt_ban(&self) -> Duration {
        self.corrupt_ban
    }
    /// Return the batching configuration.
    pub fn batch(&self) -> &BatchConfig {
        &self.batch
    }
    /// Return the pump configuration.
    pub fn pump(&self) -> &PumpConfig {
        &self.pump
    }
    /// Return the gateway configuration.
    pub fn gateway(&self) -> &GatewayConfig {
        &self.gateway
    }
    /// Return the reassembly configuration.
    pub fn reassembly(&self) -> &ReassemblyConfig {
        &self.reassembly
    }
}
