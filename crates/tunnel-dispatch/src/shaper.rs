//! Early, proportionate dropping of participating traffic.
//!
//! Each hop we relay for gets a [`SyntheticRed`]: a model of the queue
//! that would build up if the hop's traffic were sent at its allocated
//! rate.  When that imaginary queue grows, messages are dropped with
//! rising probability, well before any real queue overflows.  Whatever
//! survives is then charged against the router-wide
//! [`BandwidthLimiter`], for which [`TokenBucket`] is the stock
//! implementation.
//!
//! All of this happens before a message is queued or encrypted, so a
//! dropped message costs nothing more than the decision.

use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use tunnel_cell::i2np::MessageType;

use crate::stats::DispatchStats;
use crate::traits::BandwidthLimiter;

/// Largest drop probability for one KiB at factor 1.
const MAX_DROP_PROBABILITY: f32 = 0.0002;
/// Weight of history in every filtered estimate.
const DECAY_FACTOR: f32 = 8.0;
/// Shortest interval over which we sample, in milliseconds.
const RTT_MIN_MS: u64 = 50;
/// Most sampling intervals we decay over after a quiet period.
const MAX_DECAY_STEPS: u64 = 16;

/// Bandwidth we assume for a hop that didn't negotiate one, bytes/s.
pub const DEFAULT_BW_PER_TUNNEL_ESTIMATE: u32 = 200 * 2048 / (10 * 60);

/// Where in a tunnel we are relaying.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Location {
    /// A middle hop.
    Participant,
    /// The last hop of someone's outbound tunnel.
    OutboundEndpoint,
    /// The first hop of someone's inbound tunnel.
    InboundGateway,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Location::Participant => "participant",
            Location::OutboundEndpoint => "OBEP",
            Location::InboundGateway => "IBGW",
        };
        f.write_str(s)
    }
}

/// Blend a new sample into a running estimate.
fn westwood(old: f32, new: f32) -> f32 {
    (old * (DECAY_FACTOR - 1.0) + new) / DECAY_FACTOR
}

/// Return the number of whole milliseconds from `then` to `now`.
fn ms_between(then: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(then).as_millis() as u64
}

/// Mutable part of a [`SyntheticRed`].
#[derive(Debug)]
struct RedState {
    /// When the first sample arrived; None before that.
    started: Option<Instant>,
    /// When the bandwidth estimate was last updated.
    last_ack: Instant,
    /// When the queue estimate was last updated.
    last_queue_update: Instant,
    /// Filtered bandwidth estimate, bytes per ms.
    bk_filtered: f32,
    /// Less smoothed bandwidth estimate, bytes per ms.
    bk_raw: f32,
    /// Bytes accepted since the bandwidth estimate was updated.
    bytes_acked: u64,
    /// Bytes accepted since the queue estimate was updated.
    new_data: u64,
    /// Estimated size of the synthetic queue.
    queue_estimate: f32,
    /// Filtered queue size; this is what the thresholds apply to.
    avg_queue: f32,
    /// Messages accepted since the last drop, or -1 below threshold.
    drop_count: i32,
}

impl RedState {
    /// Bring the queue estimate up to `now`, draining at `bytes_per_ms`.
    fn update_queue(&mut self, now: Instant, bytes_per_ms: f32) {
        let mut dt = ms_between(self.last_queue_update, now);
        if dt > 2 * RTT_MIN_MS {
            let steps = (dt / RTT_MIN_MS - 1).min(MAX_DECAY_STEPS);
            for _ in 0..steps {
                if self.avg_queue <= 0.0 {
                    break;
                }
                self.decay_queue(RTT_MIN_MS, bytes_per_ms);
            }
            dt -= steps * RTT_MIN_MS;
        }
        if self.new_data > 0 {
            let mut q = self.new_data as f32 - dt as f32 * bytes_per_ms;
            if q < 1.0 {
                q = 0.0;
            }
            self.queue_estimate = westwood(self.queue_estimate, q);
            self.avg_queue = westwood(self.avg_queue, self.queue_estimate);
            self.new_data = 0;
        } else {
            self.decay_queue(dt, bytes_per_ms);
        }
        self.last_queue_update = now;
    }

    /// Drain the queue estimate for `dt` ms.
    fn decay_queue(&mut self, dt: u64, bytes_per_ms: f32) {
        self.queue_estimate -= dt as f32 * bytes_per_ms;
        if self.queue_estimate < 1.0 {
            self.queue_estimate = 0.0;
        }
        self.avg_queue = westwood(self.avg_queue, self.queue_estimate);
    }

    /// Fold the bytes accepted since the last update into the
    /// bandwidth estimate.
    fn update_bandwidth(&mut self, now: Instant) {
        let mut dt = ms_between(self.last_ack, now).max(1);
        if dt > 2 * RTT_MIN_MS {
            let steps = (dt / RTT_MIN_MS - 1).min(MAX_DECAY_STEPS);
            for _ in 0..steps {
                self.decay_bandwidth();
            }
            dt -= steps * RTT_MIN_MS;
        }
        if self.bytes_acked > 0 {
            let sample = self.bytes_acked as f32 / dt as f32;
            self.bk_raw = westwood(self.bk_raw, sample);
            self.bk_filtered = westwood(self.bk_filtered, self.bk_raw);
        } else {
            self.decay_bandwidth();
        }
        self.bytes_acked = 0;
        self.last_ack = now;
    }

    /// Let the bandwidth estimate sag for one quiet interval.
    fn decay_bandwidth(&mut self) {
        self.bk_raw *= (DECAY_FACTOR - 1.0) / DECAY_FACTOR;
        self.bk_filtered = westwood(self.bk_filtered, self.bk_raw);
    }
}

/// A random-early-detection estimator for one hop's traffic.
///
/// Nothing is actually queued.  The estimator tracks how large a queue
/// would be if accepted bytes drained at the configured bandwidth,
/// and drops with a probability that rises from zero at the minimum
/// threshold to certainty past the maximum.
#[derive(Debug)]
pub struct SyntheticRed {
    /// Configured drain rate, bytes per second.
    bandwidth: u32,
    /// Queue size at which dropping starts.
    min_threshold: f32,
    /// Queue size past which everything is dropped.
    max_threshold: f32,
    /// Estimates.
    state: Mutex<RedState>,
}

impl SyntheticRed {
    /// Create an estimator for a hop with `bandwidth` bytes/s, using
    /// thresholds scaled to that bandwidth.
    pub fn new(bandwidth: u32, now: Instant) -> Self {
        let min = (bandwidth / 4).max(2048);
        let max = bandwidth.max(8192);
        Self::with_thresholds(bandwidth, min, max, now)
    }

    /// Create an estimator with explicit thresholds, in bytes.
    pub fn with_thresholds(bandwidth: u32, min: u32, max: u32, now: Instant) -> Self {
        let max = max.max(min + 1);
        debug!(
            "RED estimator: {} B/s, thresholds {}..{} B",
            bandwidth, min, max
        );
        SyntheticRed {
            bandwidth,
            min_threshold: min as f32,
            max_threshold: max as f32,
            state: Mutex::new(RedState {
                started: None,
                last_ack: now,
                last_queue_update: now,
                bk_filtered: 0.0,
                bk_raw: 0.0,
                bytes_acked: 0,
                new_data: 0,
                queue_estimate: 0.0,
                avg_queue: 0.0,
                drop_count: -1,
            }),
        }
    }

    /// Return the configured bandwidth, bytes per second.
    pub fn bandwidth(&self) -> u32 {
        self.bandwidth
    }

    /// Offer `len` bytes to the synthetic queue.
    ///
    /// Returns false if they should be dropped.  A `factor` of zero
    /// never drops; larger factors drop more eagerly.
    pub fn offer(&self, len: usize, factor: f32, now: Instant) -> bool {
        let bytes_per_ms = self.bandwidth as f32 / 1000.0;
        let mut s = self.state.lock();
        if s.started.is_none() {
            let dt = ms_between(s.last_ack, now).max(RTT_MIN_MS);
            let sample = len as f32 / dt as f32;
            s.started = Some(now);
            s.bk_filtered = sample;
            s.bk_raw = sample;
            s.last_ack = now;
            s.last_queue_update = now;
            s.new_data = len as u64;
            return true;
        }

        if ms_between(s.last_queue_update, now) > RTT_MIN_MS {
            s.update_queue(now, bytes_per_ms);
        }

        if factor > 0.0 {
            if s.avg_queue > self.max_threshold {
                s.drop_count = 0;
                return false;
            }
            if s.avg_queue > self.min_threshold {
                s.drop_count += 1;
                let fill = (s.avg_queue - self.min_threshold)
                    / (self.max_threshold - self.min_threshold);
                let pb = ((len as f32 / 1024.0) * factor * MAX_DROP_PROBABILITY * fill)
                    .min(MAX_DROP_PROBABILITY);
                let denom = 1.0 - s.drop_count as f32 * pb;
                let pa = if denom <= 0.0 { 0.99 } else { (pb / denom).min(0.99) };
                if rand::thread_rng().gen::<f32>() < pa {
                    s.drop_count = 0;
                    return false;
                }
                s.drop_count = -1;
            }
        }

        s.new_data += len as u64;
        s.bytes_acked += len as u64;
        if ms_between(s.last_ack, now) >= RTT_MIN_MS {
            s.update_bandwidth(now);
        }
        true
    }

    /// Return the current bandwidth estimate, bytes per second.
    pub fn bandwidth_estimate(&self) -> f32 {
        self.state.lock().bk_filtered * 1000.0
    }

    /// Return the current filtered queue size, bytes.
    pub fn queue_estimate(&self) -> f32 {
        self.state.lock().avg_queue
    }
}

impl fmt::Display for SyntheticRed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        write!(
            f,
            "RED[bw {} B/s, est {:.0} B/s, queue {:.0} B, th {:.0}..{:.0}]",
            self.bandwidth,
            s.bk_filtered * 1000.0,
            s.avg_queue,
            self.min_threshold,
            self.max_threshold
        )
    }
}

/// Mutable part of a [`TokenBucket`].
#[derive(Debug)]
struct BucketState {
    /// Tokens (bytes) available.
    tokens: f64,
    /// When tokens were last added.
    last_refill: Option<Instant>,
}

/// A one-second token bucket over the shared bandwidth.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill rate, bytes per second; also the bucket size.
    rate: u32,
    /// Current level.
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket for `rate` bytes per second.
    pub fn new(rate: u32) -> Self {
        TokenBucket {
            rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(rate),
                last_refill: None,
            }),
        }
    }

    /// Return the number of bytes that could be sent right now.
    pub fn available(&self, now: Instant) -> u64 {
        let mut s = self.state.lock();
        self.refill(&mut s, now);
        s.tokens as u64
    }

    /// Top `s` up for the time since the last refill.
    fn refill(&self, s: &mut BucketState, now: Instant) {
        let cap = f64::from(self.rate);
        if let Some(last) = s.last_refill {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            s.tokens = (s.tokens + dt * cap).min(cap);
        }
        s.last_refill = Some(now);
    }
}

impl BandwidthLimiter for TokenBucket {
    fn sent_participating(&self, len: usize, factor: f32, now: Instant) -> bool {
        let mut s = self.state.lock();
        self.refill(&mut s, now);
        let len = len as f64;
        if s.tokens >= len {
            s.tokens -= len;
            return true;
        }
        // Out of tokens: drop with probability `factor`.
        factor <= 0.0 || rand::thread_rng().gen::<f32>() >= factor
    }
}

/// Decides whether participating traffic must be dropped.
pub struct CongestionShaper {
    /// Router-wide scale for all drop decisions.
    throttle_factor: f32,
    /// Bandwidth we share, bytes per second.
    share_bandwidth: u32,
    /// The router-wide limit.
    limiter: Arc<dyn BandwidthLimiter>,
    /// Where drops are counted.
    stats: Arc<DispatchStats>,
}

impl CongestionShaper {
    /// Create a new shaper.
    pub(crate) fn new(
        throttle_factor: f32,
        share_bandwidth: u32,
        limiter: Arc<dyn BandwidthLimiter>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        CongestionShaper {
            throttle_factor,
            share_bandwidth,
            limiter,
            stats,
        }
    }

    /// Return the drop factor for a message of type `ty` at `loc`.
    ///
    /// Build messages are small and a lost one costs a whole tunnel,
    /// so they get half the factor.  Other endpoint traffic gets half
    /// again as much.
    pub fn drop_factor(&self, loc: Location, ty: MessageType) -> f32 {
        let scale = if ty.is_tunnel_build() {
            0.5
        } else if loc == Location::OutboundEndpoint {
            1.5
        } else {
            1.0
        };
        self.throttle_factor * scale
    }

    /// Return the bandwidth to model for a hop that was allocated
    /// `allocated` bytes/s.
    ///
    /// Allocations too small to be meaningful are replaced with the
    /// largest share a single tunnel may use.
    pub fn hop_bandwidth(&self, allocated: u32) -> u32 {
        let reasonable_max = self.share_bandwidth / 2;
        if allocated <= DEFAULT_BW_PER_TUNNEL_ESTIMATE || allocated < reasonable_max / 10 {
            reasonable_max.max(DEFAULT_BW_PER_TUNNEL_ESTIMATE)
        } else {
            allocated
        }
    }

    /// Build an estimator for a hop that was allocated `allocated`
    /// bytes/s.
    pub fn hop_estimator(&self, allocated: u32, now: Instant) -> SyntheticRed {
        SyntheticRed::new(self.hop_bandwidth(allocated), now)
    }

    /// Return true if a `len`-byte message of type `ty` at `loc` must
    /// be dropped.  Drops are counted.
    pub fn should_drop(
        &self,
        loc: Location,
        ty: MessageType,
        len: usize,
        red: Option<&SyntheticRed>,
        now: Instant,
    ) -> bool {
        if len == 0 {
            return false;
        }
        let factor = self.drop_factor(loc, ty);
        if let Some(red) = red {
            if !red.offer(len, factor, now) {
                warn!(
                    "Dropping participating message (per-tunnel limit): {} {} {}B {}",
                    loc, ty, len, red
                );
                self.stats.participating_dropped.inc();
                return true;
            }
        }
        if !self.limiter.sent_participating(len, factor, now) {
            warn!(
                "Dropping participating message (global limit): {} {} {}B",
                loc, ty, len
            );
            self.stats.participating_dropped.inc();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    struct Unlimited;
    impl BandwidthLimiter for Unlimited {
        fn sent_participating(&self, _: usize, _: f32, _: Instant) -> bool {
            true
        }
    }

    #[test]
    fn red_fills_and_drains() {
        let t0 = Instant::now();
        let red = SyntheticRed::new(1000, t0);
        assert_eq!(red.bandwidth(), 1000);

        // Arrive far faster than the hop drains; once the filtered
        // queue passes the max threshold, everything is dropped.
        let mut t = t0;
        let mut dropped = 0;
        for _ in 0..2000 {
            t += Duration::from_millis(5);
            if !red.offer(1024, 1.0, t) {
                dropped += 1;
            }
        }
        assert!(dropped > 0);
        assert!(red.queue_estimate() > 2048.0);
        assert!(red.bandwidth_estimate() > 0.0);

        // After a long quiet spell the queue has drained.
        for _ in 0..200 {
            t += Duration::from_secs(1);
            red.offer(1, 0.0, t);
        }
        assert!(red.queue_estimate() < 2048.0);
        assert!(red.offer(1024, 1.0, t + Duration::from_secs(1)));
    }

    #[test]
    fn zero_factor_never_drops() {
        let t0 = Instant::now();
        let red = SyntheticRed::with_thresholds(0, 1, 2, t0);
        let mut t = t0;
        for _ in 0..500 {
            t += Duration::from_millis(100);
            assert!(red.offer(1024, 0.0, t));
        }
        assert!(red.queue_estimate() > 2.0);
        // But anything that counts is now refused.
        assert!(!red.offer(1024, 1.0, t + Duration::from_millis(100)));
    }

    #[test]
    fn token_bucket() {
        let t0 = Instant::now();
        let b = TokenBucket::new(2048);
        assert!(b.sent_participating(1024, 1.0, t0));
        assert!(b.sent_participating(1024, 1.0, t0));
        assert!(!b.sent_participating(1024, 1.0, t0));
        // Factor zero disables dropping even when empty.
        assert!(b.sent_participating(1024, 0.0, t0));
        let t1 = t0 + Duration::from_millis(600);
        assert!(b.available(t1) >= 1200);
        assert!(b.sent_participating(1024, 1.0, t1));
        // Never more than a second's worth.
        assert_eq!(b.available(t1 + Duration::from_secs(60)), 2048);
    }

    #[test]
    fn factors_and_bandwidth() {
        let stats = Arc::new(DispatchStats::default());
        let s = CongestionShaper::new(1.0, 200_000, Arc::new(Unlimited), stats);
        assert!(
            s.drop_factor(Location::Participant, MessageType::TUNNEL_BUILD)
                < s.drop_factor(Location::Participant, MessageType::TUNNEL_DATA)
        );
        assert!(
            s.drop_factor(Location::OutboundEndpoint, MessageType::DATA)
                > s.drop_factor(Location::Participant, MessageType::DATA)
        );
        // Too small, so replaced with half the share.
        assert_eq!(s.hop_bandwidth(0), 100_000);
        assert_eq!(s.hop_bandwidth(5_000), 100_000);
        assert_eq!(s.hop_bandwidth(50_000), 50_000);
    }

    #[test]
    fn global_limit_counts_drops() {
        let stats = Arc::new(DispatchStats::default());
        let s = CongestionShaper::new(
            1.0,
            4096,
            Arc::new(TokenBucket::new(1024)),
            Arc::clone(&stats),
        );
        let now = Instant::now();
        assert!(!s.should_drop(Location::Participant, MessageType::TUNNEL_DATA, 1024, None, now));
        assert!(s.should_drop(Location::Participant, MessageType::TUNNEL_DATA, 1024, None, now));
        assert!(!s.should_drop(Location::Participant, MessageType::TUNNEL_DATA, 0, None, now));
        assert_eq!(stats.participating_dropped.get(), 1);
    }
}
