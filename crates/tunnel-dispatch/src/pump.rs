//! A small pool of tokio tasks that turns queued gateway messages into
//! cells.
//!
//! A gateway's `add()` only queues a message and asks to be pumped.
//! Pump tasks take gateways off a shared "wants pumping" channel one
//! at a time, and each pump drains a bounded batch.  A gateway with
//! messages left over is set aside as backlogged and requeued after a
//! short delay, so one busy tunnel can't monopolize the workers.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime as TokioRuntime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use tunnel_rtcompat::Runtime;

use crate::config::PumpConfig;
use crate::Result;

/// Something with queued work that a pump task can run.
pub trait Pumpable: Send + Sync {
    /// Return an id that is unique among live pumpables.
    fn pump_id(&self) -> u64;
    /// Do one bounded batch of work.  Return true if more remains.
    fn pump(&self) -> bool;
}

/// Bookkeeping for the ready channel.
#[derive(Default)]
struct PumpState {
    /// Ids of everything sent on the ready channel and not yet taken.
    queued: HashSet<u64>,
    /// Ids of gateways waiting out a requeue delay.
    backlogged: HashSet<u64>,
    /// Set once we start shutting down.
    stopping: bool,
}

/// State shared between the pump handle and its workers.
struct Shared<R: Runtime> {
    /// Runtime, for requeue timers.
    runtime: R,
    /// Configuration.
    config: PumpConfig,
    /// Dedup and shutdown state.
    state: Mutex<PumpState>,
    /// Sending side of the ready channel.
    ready_tx: UnboundedSender<Arc<dyn Pumpable>>,
    /// Receiving side of the ready channel, taken by one worker at a
    /// time.
    ready_rx: tokio::sync::Mutex<UnboundedReceiver<Arc<dyn Pumpable>>>,
}

impl<R: Runtime> Shared<R> {
    /// Queue `p` unless it's already waiting or backlogged.
    fn enqueue(&self, p: Arc<dyn Pumpable>) {
        let mut st = self.state.lock();
        if st.stopping {
            return;
        }
        let id = p.pump_id();
        if st.backlogged.contains(&id) || !st.queued.insert(id) {
            return;
        }
        if self.ready_tx.send(p).is_err() {
            st.queued.remove(&id);
        }
    }

    /// Note that `p` came off the ready channel.  Return false if we
    /// are stopping and it shouldn't run.
    fn claim(&self, p: &Arc<dyn Pumpable>) -> bool {
        let mut st = self.state.lock();
        st.queued.remove(&p.pump_id());
        !st.stopping
    }

    /// Run one pump of `p`, and set it aside if it has more to do.
    fn pump_one(self: &Arc<Self>, p: Arc<dyn Pumpable>) {
        if !p.pump() {
            return;
        }
        let id = p.pump_id();
        {
            let mut st = self.state.lock();
            if st.stopping || !st.backlogged.insert(id) {
                return;
            }
        }
        trace!("Gateway {} backlogged, requeuing later", id);
        let me = Arc::clone(self);
        self.runtime.schedule(
            self.config.requeue_delay(),
            Box::new(move || {
                me.state.lock().backlogged.remove(&id);
                me.enqueue(p);
            }),
        );
    }

    /// Body of each worker task.
    async fn worker(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                p = async { self.ready_rx.lock().await.recv().await } => p,
            };
            match next {
                Some(p) if self.claim(&p) => self.pump_one(p),
                Some(_) => {}
                None => return,
            }
        }
    }
}

/// The tokio runtime that hosts the pump tasks.
struct Workers {
    /// Runtime owning the worker threads.
    runtime: TokioRuntime,
    /// One task per worker.
    tasks: JoinSet<()>,
    /// Cancelled to stop every worker.
    cancel: CancellationToken,
}

impl Workers {
    /// Cancel the workers and wait for them to finish.
    fn shutdown(self) {
        let Workers {
            runtime,
            mut tasks,
            cancel,
        } = self;
        cancel.cancel();
        if Handle::try_current().is_ok() {
            // Blocking is not allowed inside an async context, which
            // includes a pump task stopping its own pump.
            tasks.abort_all();
            drop(tasks);
            runtime.shutdown_background();
            return;
        }
        runtime.block_on(async {
            while let Some(res) = tasks.join_next().await {
                if matches!(res, Err(ref e) if e.is_panic()) {
                    info!("A pump task panicked");
                }
            }
        });
    }
}

/// The pump tasks and their ready channel.
pub struct Pump<R: Runtime> {
    /// Channel and settings, shared with the workers.
    shared: Arc<Shared<R>>,
    /// Worker tasks, until they are stopped.  None if the pump has no
    /// threads.
    workers: Mutex<Option<Workers>>,
}

impl<R: Runtime> Pump<R> {
    /// Start `config.threads()` pump tasks on their own tokio runtime.
    pub fn new(runtime: R, config: PumpConfig) -> Result<Self> {
        let n = config.threads();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            runtime,
            config,
            state: Mutex::new(PumpState::default()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
        });
        let workers = if n == 0 {
            None
        } else {
            let rt = Builder::new_multi_thread()
                .worker_threads(n)
                .thread_name("tunnel-pump")
                .build()?;
            let cancel = CancellationToken::new();
            let mut tasks = JoinSet::new();
            for _ in 0..n {
                let sh = Arc::clone(&shared);
                tasks.spawn_on(sh.worker(cancel.clone()), rt.handle());
            }
            Some(Workers {
                runtime: rt,
                tasks,
                cancel,
            })
        };
        debug!("Started {} pump workers", n);
        Ok(Pump {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Ask for `p` to be pumped.  Harmless if it is already waiting.
    pub fn wants_pumping(&self, p: Arc<dyn Pumpable>) {
        self.shared.enqueue(p);
    }

    /// Pump everything that is waiting on the calling thread, and
    /// return how many pumps ran.
    ///
    /// This is how a pump with zero threads makes progress.  Returns 0
    /// if a worker is currently waiting on the ready channel.
    pub fn run_pending(&self) -> usize {
        let mut rx = match self.shared.ready_rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => return 0,
        };
        let mut n = 0;
        while let Ok(p) = rx.try_recv() {
            if self.shared.claim(&p) {
                self.shared.pump_one(p);
                n += 1;
            }
        }
        n
    }

    /// Return the number of gateways waiting for a worker.
    pub fn n_waiting(&self) -> usize {
        self.shared.state.lock().queued.len()
    }

    /// Return true once [`stop`](Pump::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopping
    }

    /// Stop pumping: drop all queued work and stop the workers.
    ///
    /// Calling this more than once is harmless.
    pub fn stop(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.stopping {
                return;
            }
            st.stopping = true;
            st.queued.clear();
            st.backlogged.clear();
        }
        let workers = self.workers.lock().take();
        if let Some(w) = workers {
            w.shutdown();
        }
        if let Ok(mut rx) = self.shared.ready_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}

impl<R: Runtime> Drop for Pump<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::PumpConfigBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tunnel_rtmock::MockRuntime;

    /// Has `work` units to do, `per_pump` at a time.
    struct Work {
        id: u64,
        work: AtomicUsize,
        per_pump: usize,
        pumps: AtomicUsize,
    }

    impl Work {
        fn new(id: u64, work: usize, per_pump: usize) -> Arc<Self> {
            Arc::new(Work {
                id,
                work: AtomicUsize::new(work),
                per_pump,
                pumps: AtomicUsize::new(0),
            })
        }
    }

    impl Pumpable for Work {
        fn pump_id(&self) -> u64 {
            self.id
        }
        fn pump(&self) -> bool {
            self.pumps.fetch_add(1, Ordering::SeqCst);
            let left = self.work.load(Ordering::SeqCst).saturating_sub(self.per_pump);
            self.work.store(left, Ordering::SeqCst);
            left > 0
        }
    }

    fn manual(rt: &MockRuntime) -> Pump<MockRuntime> {
        let cfg = PumpConfigBuilder::default().set_threads(0).build().unwrap();
        Pump::new(rt.clone(), cfg).unwrap()
    }

    #[test]
    fn dedup() {
        let rt = MockRuntime::start();
        let pump = manual(&rt);
        let w = Work::new(1, 1, 1);
        pump.wants_pumping(w.clone());
        pump.wants_pumping(w.clone());
        assert_eq!(pump.n_waiting(), 1);
        assert_eq!(pump.run_pending(), 1);
        assert_eq!(w.pumps.load(Ordering::SeqCst), 1);
        assert_eq!(pump.run_pending(), 0);
    }

    #[test]
    fn backlogged_requeue() {
        let rt = MockRuntime::start();
        let pump = manual(&rt);
        let busy = Work::new(1, 5, 2);
        let idle = Work::new(2, 1, 1);
        pump.wants_pumping(busy.clone());
        pump.wants_pumping(idle.clone());
        assert_eq!(pump.run_pending(), 2);
        // Busy has more, but waits out the requeue delay; asking again
        // doesn't jump the queue.
        pump.wants_pumping(busy.clone());
        assert_eq!(pump.n_waiting(), 0);
        rt.advance(Duration::from_millis(49));
        assert_eq!(pump.n_waiting(), 0);
        rt.advance(Duration::from_millis(1));
        assert_eq!(pump.n_waiting(), 1);
        pump.run_pending();
        rt.advance(Duration::from_millis(50));
        pump.run_pending();
        assert_eq!(busy.work.load(Ordering::SeqCst), 0);
        assert_eq!(busy.pumps.load(Ordering::SeqCst), 3);
        assert_eq!(rt.n_pending(), 0);
    }

    #[test]
    fn threads_and_stop() {
        let rt = MockRuntime::start();
        let cfg = PumpConfigBuilder::default().set_threads(2).build().unwrap();
        let pump = Pump::new(rt, cfg).unwrap();
        let ws: Vec<_> = (0..20).map(|i| Work::new(i, 1, 1)).collect();
        for w in &ws {
            pump.wants_pumping(w.clone());
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while ws.iter().any(|w| w.pumps.load(Ordering::SeqCst) == 0) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        pump.stop();
        pump.stop();
        assert!(pump.is_stopped());
        let late = Work::new(99, 1, 1);
        pump.wants_pumping(late.clone());
        assert_eq!(pump.n_waiting(), 0);
        assert_eq!(pump.run_pending(), 0);
        assert_eq!(late.pumps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backlogged_requeue_on_workers() {
        let rt = MockRuntime::start();
        let cfg = PumpConfigBuilder::default().set_threads(1).build().unwrap();
        let pump = Pump::new(rt.clone(), cfg).unwrap();
        let busy = Work::new(7, 4, 2);
        pump.wants_pumping(busy.clone());
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while rt.n_pending() == 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        // Requeued only once the delay passes.
        assert_eq!(busy.pumps.load(Ordering::SeqCst), 1);
        assert_eq!(pump.n_waiting(), 0);
        rt.advance(Duration::from_millis(50));
        while busy.pumps.load(Ordering::SeqCst) < 2 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        assert_eq!(busy.work.load(Ordering::SeqCst), 0);
        pump.stop();
    }

    #[tokio::test]
    async fn stop_inside_async_context() {
        let rt = MockRuntime::start();
        let cfg = PumpConfigBuilder::default().set_threads(1).build().unwrap();
        let pump = Pump::new(rt, cfg).unwrap();
        pump.stop();
        assert!(pump.is_stopped());
    }
}
