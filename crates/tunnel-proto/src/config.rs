//! Configuration for batching and reassembly.

use derive_builder::Builder;
use serde::Deserialize;

use std::time::Duration;

use tunnel_cell::cell::{MAX_FRAGMENTS, MAX_FRAGMENT_SIZE};

/// Configuration for how eagerly a gateway sends partly-full cells.
///
/// This type is immutable once constructed. To create an object of this
/// type, use [`BatchConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct BatchConfig {
    /// How long a partly-full cell may wait for more messages before
    /// it is sent anyway.
    #[builder(default = "Duration::from_millis(50)")]
    #[serde(with = "humantime_serde")]
    pub(crate) send_delay: Duration,

    /// If more than this many messages are waiting, send at once
    /// rather than wait.
    #[builder(default = "5")]
    pub(crate) force_flush_count: usize,

    /// A cell at least this full (in percent) is sent at once.
    #[builder(default = "80")]
    pub(crate) full_enough_percent: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build().unwrap()
    }
}

impl BatchConfig {
    /// Return the maximum delay before sending a partly-full cell.
    pub fn send_delay(&self) -> Duration {
        self.send_delay
    }
    /// Return the queue length past which we never wait.
    pub fn force_flush_count(&self) -> usize {
        self.force_flush_count
    }
    /// Return the fill level, in percent, past which we never wait.
    pub fn full_enough_percent(&self) -> usize {
        self.full_enough_percent
    }
}

/// Configuration for reassembling fragmented messages.
///
/// This type is immutable once constructed. To create an object of this
/// type, use [`ReassemblyConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Give up on a partly-received message after this long.
    #[builder(default = "Duration::from_secs(45)")]
    #[serde(with = "humantime_serde")]
    pub(crate) timeout: Duration,

    /// Largest number of fragments in one message.
    #[builder(default = "MAX_FRAGMENTS")]
    pub(crate) max_fragments: usize,

    /// Largest fragment body we accept.
    #[builder(default = "MAX_FRAGMENT_SIZE")]
    pub(crate) max_fragment_size: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfigBuilder::default().build().unwrap()
    }
}

impl ReassemblyConfig {
    /// Return the reassembly timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    /// Return the maximum number of fragments in one message.
    pub fn max_fragments(&self) -> usize {
        self.max_fragments.min(MAX_FRAGMENTS)
    }
    /// Return the largest fragment body we accept.
    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size.min(MAX_FRAGMENT_SIZE)
    }
}
