//! Functionality for simulating the passage of time in unit tests.
//!
//! We do this by providing [`MockRuntime`], a [`Runtime`] whose clocks
//! only move when the test tells them to, and whose timers run on the
//! calling thread during [`MockRuntime::advance`].
//!
//! [`Runtime`]: tunnel_rtcompat::Runtime

#![allow(clippy::missing_docs_in_private_items)]

use std::{
    cmp::{Eq, Ordering, PartialEq, PartialOrd},
    collections::BinaryHeap,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use parking_lot::Mutex;
use tunnel_rtcompat::{Clock, Scheduler, Task, TimerHandle};

/// A mock [`Runtime`](tunnel_rtcompat::Runtime) for testing.
///
/// The MockRuntime ignores the current time, and instead keeps its own
/// view of the current `Instant` and `SystemTime`.  You can advance them
/// in-step by calling `advance()`, and you can simulate jumps in the
/// system clock by calling `jump_to()`.
///
/// This is *not* for production use.
#[derive(Clone)]
pub struct MockRuntime {
    /// The shared backend for this MockRuntime and its clones.
    state: Arc<Mutex<Schedule>>,
}

/// Shared backend for a mock runtime.
struct Schedule {
    /// What time do we pretend it is (monotonic)?  This value only
    /// moves forward.
    instant: Instant,
    /// What time do we pretend it is (wall clock)? This value can move
    /// in any way, but usually moves in step with `instant`.
    wallclock: SystemTime,
    /// Priority queue of timers, in the order that we should run them.
    timers: BinaryHeap<TimerEntry>,
    /// Sequence number for the next timer.
    next_seq: u64,
}

/// An entry telling us when to run which task.
struct TimerEntry {
    when: Instant,
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

impl MockRuntime {
    /// Create a new MockRuntime, starting at a given wall-clock time.
    pub fn new(wallclock: SystemTime) -> Self {
        let state = Schedule {
            instant: Instant::now(),
            wallclock,
            timers: BinaryHeap::new(),
            next_seq: 0,
        };
        MockRuntime {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a new MockRuntime whose wall clock starts at a fixed,
    /// arbitrary point in 2021.
    pub fn start() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_625_000_000))
    }

    /// Advance the simulated timeline forward by `dur`, running every
    /// timer that comes due along the way.
    ///
    /// Timers run in deadline order, on the calling thread, with the
    /// clocks set to their deadline.  A timer that schedules another
    /// timer which falls inside the window will see that timer run
    /// too, before `advance` returns.
    pub fn advance(&self, dur: Duration) {
        let target = self.state.lock().instant + dur;
        loop {
            let due = {
                let mut state = self.state.lock();
                let ready = matches!(state.timers.peek(), Some(e) if e.when <= target);
                if !ready {
                    state.advance_clocks_to(target);
                    return;
                }
                match state.timers.pop() {
                    Some(entry) => {
                        state.advance_clocks_to(entry.when);
                        entry
                    }
                    None => return,
                }
            };
            if due.handle.try_fire() {
                (due.task)();
            }
        }
    }

    /// Simulate a discontinuity in the system clock, by jumping to
    /// `new_wallclock`.  The monotonic clock does not move.
    pub fn jump_to(&self, new_wallclock: SystemTime) {
        self.state.lock().wallclock = new_wallclock;
    }

    /// Return the amount of virtual time until the next pending timer,
    /// or None if there are none.  Cancelled timers still count until
    /// they are reaped by `advance`.
    pub fn time_until_next_timeout(&self) -> Option<Duration> {
        let state = self.state.lock();
        let now = state.instant;
        state
            .timers
            .peek()
            .map(|e| e.when.saturating_duration_since(now))
    }

    /// Return the number of timers that are still pending.
    pub fn n_pending(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|e| e.handle.is_pending())
            .count()
    }
}

impl Schedule {
    fn advance_clocks_to(&mut self, when: Instant) {
        if when > self.instant {
            let delta = when - self.instant;
            self.instant = when;
            self.wallclock += delta;
        }
    }
}

impl Clock for MockRuntime {
    fn now(&self) -> Instant {
        self.state.lock().instant
    }
    fn wallclock(&self) -> SystemTime {
        self.state.lock().wallclock
    }
}

impl Scheduler for MockRuntime {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock();
        let when = state.instant + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(TimerEntry {
            when,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockRuntime")
            .field("wallclock", &state.wallclock)
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq)).reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn basics_of_time_travel() {
        let w1 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let rt = MockRuntime::new(w1);
        let i1 = rt.now();
        assert_eq!(rt.wallclock(), w1);

        let interval = Duration::new(4 * 3600 + 13 * 60, 0);
        rt.advance(interval);
        assert_eq!(rt.now(), i1 + interval);
        assert_eq!(rt.wallclock(), w1 + interval);

        rt.jump_to(w1 + interval * 3);
        assert_eq!(rt.now(), i1 + interval);
        assert_eq!(rt.wallclock(), w1 + interval * 3);
    }

    #[test]
    fn timers_fire_in_order() {
        let rt = MockRuntime::start();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in &[(300_u64, 'c'), (100, 'a'), (200, 'b'), (100, 'a')] {
            let log = Arc::clone(&log);
            let tag = *tag;
            rt.schedule(Duration::from_millis(*ms), Box::new(move || log.lock().push(tag)));
        }
        assert_eq!(rt.time_until_next_timeout(), Some(Duration::from_millis(100)));
        rt.advance(Duration::from_millis(150));
        assert_eq!(&log.lock()[..], &['a', 'a']);
        assert_eq!(rt.time_until_next_timeout(), Some(Duration::from_millis(50)));
        rt.advance(Duration::from_secs(1));
        assert_eq!(&log.lock()[..], &['a', 'a', 'b', 'c']);
        assert_eq!(rt.time_until_next_timeout(), None);
    }

    #[test]
    fn timer_sees_its_deadline() {
        let rt = MockRuntime::start();
        let start = rt.now();
        let seen = Arc::new(Mutex::new(None));
        let (rt2, seen2) = (rt.clone(), Arc::clone(&seen));
        rt.schedule(
            Duration::from_millis(50),
            Box::new(move || *seen2.lock() = Some(rt2.now())),
        );
        rt.advance(Duration::from_millis(70));
        assert_eq!(*seen.lock(), Some(start + Duration::from_millis(50)));
        assert_eq!(rt.now(), start + Duration::from_millis(70));
    }

    #[test]
    fn rescheduling_inside_window() {
        let rt = MockRuntime::start();
        let count = Arc::new(AtomicUsize::new(0));
        fn again(rt: MockRuntime, count: Arc<AtomicUsize>) {
            if count.fetch_add(1, AtomicOrdering::SeqCst) < 4 {
                let rt2 = rt.clone();
                rt.schedule(Duration::from_millis(10), Box::new(move || again(rt2, count)));
            }
        }
        let (rt2, c2) = (rt.clone(), Arc::clone(&count));
        rt.schedule(Duration::from_millis(10), Box::new(move || again(rt2, c2)));
        rt.advance(Duration::from_millis(35));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
        rt.advance(Duration::from_millis(100));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 5);
    }

    #[test]
    fn cancelled_timer_skipped() {
        let rt = MockRuntime::start();
        let hit = Arc::new(AtomicUsize::new(0));
        let h2 = Arc::clone(&hit);
        let handle = rt.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                h2.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );
        assert_eq!(rt.n_pending(), 1);
        assert!(handle.cancel());
        assert_eq!(rt.n_pending(), 0);
        rt.advance(Duration::from_millis(10));
        assert_eq!(hit.load(AtomicOrdering::SeqCst), 0);
    }
}
