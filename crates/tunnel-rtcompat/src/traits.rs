//! Declare the traits that a runtime must provide.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::timer::TimerHandle;

/// A unit of deferred work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that knows what time it is.
///
/// We keep two notions of time: a monotonic [`Instant`] for timeouts
/// and delays, and a wall-clock [`SystemTime`] for the absolute
/// expiration stamps that travel inside messages.
pub trait Clock: Send + Sync {
    /// Return the current monotonic time.
    fn now(&self) -> Instant;
    /// Return the current wall-clock time.
    fn wallclock(&self) -> SystemTime;
    /// Return the current wall-clock time in milliseconds since the
    /// UNIX epoch, as used by message expiration fields.
    fn wallclock_millis(&self) -> u64 {
        millis_since_epoch(self.wallclock())
    }
}

/// Something that can run a task after a delay.
pub trait Scheduler: Send + Sync {
    /// Arrange for `task` to run once `delay` has elapsed.
    ///
    /// The returned handle can cancel the task; cancelling after the
    /// task has already run is harmless.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// A runtime for the tunnel data plane: a clock plus a scheduler.
pub trait Runtime: Clock + Scheduler + Clone + 'static {}

impl<T> Runtime for T where T: Clock + Scheduler + Clone + 'static {}

/// Convert a wall-clock time into milliseconds since the UNIX epoch.
///
/// Times before the epoch map to zero.
pub fn millis_since_epoch(t: SystemTime) -> u64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}
