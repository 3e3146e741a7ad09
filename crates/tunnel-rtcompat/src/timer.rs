//! Timers on a tokio runtime.
//!
//! All timed work in the data plane (delayed batch flushes, requeues
//! of backlogged gateways, reassembly timeouts, expiry scans) goes
//! through one [`TokioTimers`].  Each scheduled task becomes a tokio
//! task that sleeps until its deadline, then runs unless it was
//! cancelled in the meantime.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime as TokioRuntime};
use tracing::trace;

use crate::traits::Task;

/// The task has been scheduled but has neither run nor been cancelled.
const PENDING: u8 = 0;
/// The task has run (or is running).
const FIRED: u8 = 1;
/// The task was cancelled before it ran.
const CANCELLED: u8 = 2;

/// A handle to a scheduled task.
///
/// Exactly one of "fire" and "cancel" wins; whichever comes second is
/// a no-op.  That makes it safe to cancel a timer whose task may be
/// running concurrently on a timer worker.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    /// Shared state: PENDING, FIRED, or CANCELLED.
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    /// Create a new handle in the pending state.
    pub fn new() -> Self {
        TimerHandle {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }
    /// Try to cancel the task.
    ///
    /// Return true if the task had not yet run and now never will.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }
    /// Claim the right to run the task.
    ///
    /// Return true if the caller should run it.  Runtimes call this
    /// just before invoking a due task.
    pub fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }
    /// Return true if the task is still waiting to run.
    pub fn is_pending(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) == PENDING
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A small tokio runtime that does nothing but run timers.
///
/// Dropping it shuts the runtime down without waiting; tasks that have
/// not yet run are discarded.
pub(crate) struct TokioTimers {
    /// The runtime, until we shut it down.
    runtime: Option<TokioRuntime>,
    /// Handle for spawning onto `runtime` from any thread.
    handle: Handle,
    /// Timers that have been scheduled and have not yet come due.
    pending: Arc<AtomicUsize>,
}

impl TokioTimers {
    /// Start a runtime with a single worker for timers.
    pub(crate) fn launch() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tunnel-timer")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(TokioTimers {
            runtime: Some(runtime),
            handle,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Schedule `task` to run after `delay`.
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let deadline = tokio::time::Instant::now() + delay;
        let fire = handle.clone();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, AtomicOrdering::Relaxed);
        self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            pending.fetch_sub(1, AtomicOrdering::Relaxed);
            if fire.try_fire() {
                task();
            } else {
                trace!("discarding cancelled timer");
            }
        });
        handle
    }

    /// Return the number of timers not yet due, including cancelled
    /// ones whose deadline hasn't passed.
    pub(crate) fn n_pending(&self) -> usize {
        self.pending.load(AtomicOrdering::Relaxed)
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        // The last handle can be dropped by a timer task itself, where
        // blocking on the runtime's shutdown is not allowed.
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn handle_cancel_vs_fire() {
        let h = TimerHandle::new();
        assert!(h.is_pending());
        assert!(h.cancel());
        assert!(!h.try_fire());
        assert!(!h.cancel());

        let h = TimerHandle::new();
        assert!(h.try_fire());
        // Cancelling after the fact is harmless.
        assert!(!h.cancel());
        assert!(!h.is_pending());
    }

    #[test]
    fn tasks_run_in_deadline_order() {
        let timers = TokioTimers::launch().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        timers.schedule(Duration::from_millis(40), Box::new(move || tx2.send(2).unwrap()));
        timers.schedule(Duration::from_millis(5), Box::new(move || tx.send(1).unwrap()));
        assert_eq!(timers.n_pending(), 2);
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(timers.n_pending(), 0);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let timers = TokioTimers::launch().unwrap();
        let (tx, rx) = mpsc::channel::<u32>();
        let h = timers.schedule(Duration::from_millis(20), Box::new(move || tx.send(9).unwrap()));
        assert!(h.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(timers.n_pending(), 0);
    }

    #[test]
    fn dropped_from_inside_a_task() {
        let timers = Arc::new(TokioTimers::launch().unwrap());
        let (tx, rx) = mpsc::channel();
        let last = Arc::clone(&timers);
        timers.schedule(
            Duration::from_millis(1),
            Box::new(move || {
                drop(last);
                tx.send(()).unwrap();
            }),
        );
        drop(timers);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
