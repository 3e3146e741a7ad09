//! Compatibility between the tunnel data plane and the passage of time.
//!
//! # Overview
//!
//! The batching, pumping, reassembly and dispatch code never calls
//! [`std::time::Instant::now`] or sleeps directly.  Instead, it is
//! generic over a [`Runtime`]: something that can say what time it is
//! ([`Clock`]) and run a task after a delay ([`Scheduler`]).
//!
//! This crate provides [`SystemRuntime`], which reads the real clocks
//! and runs timers on a small tokio runtime.  The `tunnel-rtmock` crate
//! provides a mock runtime whose time only moves when a test says so.
//!
//! # Limitations
//!
//! The timer runtime of a [`SystemRuntime`] has a single worker thread.
//! Tasks should be short: they typically requeue a gateway on a pump or
//! flush a batch, and anything expensive they do delays every other
//! timer.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::trait_duplication_in_bounds)]
#![warn(clippy::unseparated_literal_suffix)]

mod timer;
mod traits;

use timer::TokioTimers;
pub use timer::TimerHandle;
pub use traits::{millis_since_epoch, Clock, Runtime, Scheduler, Task};

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// A [`Runtime`] backed by the operating system clocks and tokio
/// timers.
///
/// Cloning a `SystemRuntime` is cheap and yields a handle to the same
/// timer runtime.  It shuts down once every clone has been dropped.
#[derive(Clone)]
pub struct SystemRuntime {
    /// The shared timer runtime.
    timer: Arc<TokioTimers>,
}

impl SystemRuntime {
    /// Create a new runtime and start its timer worker.
    pub fn new() -> std::io::Result<Self> {
        Ok(SystemRuntime {
            timer: Arc::new(TokioTimers::launch()?),
        })
    }
}

impl std::fmt::Debug for SystemRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemRuntime")
            .field("pending_timers", &self.timer.n_pending())
            .finish()
    }
}

impl Clock for SystemRuntime {
    fn now(&self) -> Instant {
        Instant::now()
    }
    fn wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl Scheduler for SystemRuntime {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        self.timer.schedule(delay, task)
    }
}
