//! Worker threads, level-triggered wake-ups and interrupt fan-out
//!
//! Interrupt handlers never run consumer code. They record what happened,
//! wake the workers parked on the affected fifo and leave everything else
//! to those workers and to the notifier thread that invokes endpoint
//! callbacks.

use crate::fifo::{CommonFifo, FlowTransition};
use crate::hal::{FifoEvents, IrqHandler};
use crate::topology::{FifoId, FIFO_COUNT};
use crate::utils::cpu::WorkerOptions;
use crate::{Error, Result};
use crossbeam_utils::CachePadded;
use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wait condition workers park on between cycles
///
/// Waiting is level-triggered: the caller's readiness check runs before
/// every park, and a park never outlasts the poll interval, so a lost
/// wake-up only costs one interval.
#[derive(Debug, Default)]
pub struct Waiter {
    seq: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Park until `ready` holds; returns false once `stop` is raised
    pub fn wait_until<F>(&self, mut ready: F, poll_interval: Duration, stop: &AtomicBool) -> bool
    where
        F: FnMut() -> bool,
    {
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            let seen = self.seq.load(Ordering::Acquire);
            if ready() {
                return true;
            }
            let mut guard = self.lock.lock();
            if self.seq.load(Ordering::Acquire) == seen && !stop.load(Ordering::Acquire) {
                self.cond.wait_for(&mut guard, poll_interval);
            }
        }
    }

    /// Number of wake-ups delivered so far
    pub fn wakeups(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

/// A dedicated thread running one cycle per wake-up
///
/// Stopping is cooperative: the thread finishes the cycle it is in, then
/// exits before parking again.
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    waiter: Arc<Waiter>,
    cycles: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<R, C>(
        name: impl Into<String>,
        waiter: Arc<Waiter>,
        options: WorkerOptions,
        poll_interval: Duration,
        mut ready: R,
        mut cycle: C,
    ) -> Result<Self>
    where
        R: FnMut() -> bool + Send + 'static,
        C: FnMut() + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicUsize::new(0));

        let handle = {
            let thread_name = name.clone();
            let stop = Arc::clone(&stop);
            let waiter = Arc::clone(&waiter);
            let cycles = Arc::clone(&cycles);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    options.apply(&thread_name);
                    debug!("worker {} started", thread_name);
                    while waiter.wait_until(&mut ready, poll_interval, &stop) {
                        cycle();
                        cycles.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!("worker {} exiting", thread_name);
                })
                .map_err(|e| Error::Worker(format!("spawning {}: {}", name, e)))?
        };

        info!("spawned worker {}", name);
        Ok(Self {
            name,
            stop,
            waiter,
            cycles,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.stop.load(Ordering::Acquire)
    }

    /// Cycles completed so far
    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Ask the thread to exit after its current cycle and join it
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.waiter.wake();

        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        // A cycle tearing down its own worker cannot join itself
        if handle.thread().id() == thread::current().id() {
            debug!("worker {} stopping from its own cycle", self.name);
            return Ok(());
        }
        handle
            .join()
            .map_err(|_| Error::Worker(format!("{} panicked", self.name)))?;
        info!("stopped worker {}", self.name);
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("cycles", &self.cycles())
            .finish()
    }
}

/// Interrupt statistics
#[derive(Debug, Default)]
pub struct IrqStats {
    pub interrupts: AtomicUsize,
    pub flow_enters: AtomicUsize,
    pub flow_leaves: AtomicUsize,
    pub unknown_fifo: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqStatsView {
    pub interrupts: usize,
    pub flow_enters: usize,
    pub flow_leaves: usize,
    pub unknown_fifo: usize,
}

/// Fan-out of fifo interrupts to flow state, workers and the notifier
pub struct IrqDispatch {
    fifos: HashMap<FifoId, Arc<CommonFifo>>,
    waiters: RwLock<HashMap<FifoId, Vec<Arc<Waiter>>>>,
    pending: Box<[CachePadded<AtomicU32>]>,
    notifier: Arc<Waiter>,
    stats: IrqStats,
}

impl IrqDispatch {
    pub fn new(fifos: impl IntoIterator<Item = Arc<CommonFifo>>) -> Self {
        Self {
            fifos: fifos.into_iter().map(|fifo| (fifo.id(), fifo)).collect(),
            waiters: RwLock::new(HashMap::new()),
            pending: (0..FIFO_COUNT)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
            notifier: Arc::new(Waiter::new()),
            stats: IrqStats::default(),
        }
    }

    /// Handler to install into the hardware ops
    ///
    /// Holds the dispatcher weakly so the hardware never keeps it alive.
    pub fn handler(self: &Arc<Self>) -> IrqHandler {
        let dispatch: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |fifo: FifoId, events: FifoEvents| {
            if let Some(dispatch) = dispatch.upgrade() {
                dispatch.handle(fifo, events);
            }
        })
    }

    /// Park `waiter` on interrupts of `fifo`
    pub fn add_waiter(&self, fifo: FifoId, waiter: Arc<Waiter>) {
        self.waiters.write().entry(fifo).or_default().push(waiter);
    }

    pub fn remove_waiter(&self, fifo: FifoId, waiter: &Arc<Waiter>) {
        if let Some(list) = self.waiters.write().get_mut(&fifo) {
            list.retain(|w| !Arc::ptr_eq(w, waiter));
        }
    }

    /// The waiter the notifier worker parks on
    pub fn notifier(&self) -> Arc<Waiter> {
        Arc::clone(&self.notifier)
    }

    /// Interrupt entry point
    pub fn handle(&self, fifo: FifoId, events: FifoEvents) {
        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
        let target = match self.fifos.get(&fifo) {
            Some(target) => target,
            None => {
                self.stats.unknown_fifo.fetch_add(1, Ordering::Relaxed);
                trace!("irq for unconfigured fifo {}: {:?}", fifo, events);
                return;
            }
        };

        if events.contains(FifoEvents::ENTER_FLOW_CTRL) && target.flow().apply(FlowTransition::Enter) {
            self.stats.flow_enters.fetch_add(1, Ordering::Relaxed);
            debug!("fifo {} entered flow control", fifo);
        }
        if events.contains(FifoEvents::EXIT_FLOW_CTRL) && target.flow().apply(FlowTransition::Leave) {
            self.stats.flow_leaves.fetch_add(1, Ordering::Relaxed);
            debug!("fifo {} left flow control", fifo);
        }

        if let Some(waiters) = self.waiters.read().get(&fifo) {
            for waiter in waiters {
                waiter.wake();
            }
        }

        self.pending[fifo.index()].fetch_or(events.bits(), Ordering::AcqRel);
        self.notifier.wake();
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .iter()
            .any(|bits| bits.load(Ordering::Acquire) != 0)
    }

    /// Hand every pending event set to `deliver`, clearing it
    pub fn drain_pending<F>(&self, mut deliver: F) -> usize
    where
        F: FnMut(FifoId, FifoEvents),
    {
        let mut delivered = 0;
        for fifo in FifoId::ALL {
            let bits = self.pending[fifo.index()].swap(0, Ordering::AcqRel);
            if bits != 0 {
                deliver(fifo, FifoEvents::from_bits_retain(bits));
                delivered += 1;
            }
        }
        delivered
    }

    pub fn stats(&self) -> IrqStatsView {
        IrqStatsView {
            interrupts: self.stats.interrupts.load(Ordering::Relaxed),
            flow_enters: self.stats.flow_enters.load(Ordering::Relaxed),
            flow_leaves: self.stats.flow_leaves.load(Ordering::Relaxed),
            unknown_fifo: self.stats.unknown_fifo.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::{FifoSizing, RingSizing};
    use crate::hal::soft::SoftwareFabric;
    use std::time::Instant;

    fn fifo(id: FifoId) -> Arc<CommonFifo> {
        let sizing = FifoSizing {
            fifo: id,
            tx: RingSizing::general(8),
            rx: RingSizing::general(8),
        };
        Arc::new(CommonFifo::new(sizing, 0, Arc::new(SoftwareFabric::new())))
    }

    #[test]
    fn test_waiter_is_level_triggered() {
        let waiter = Waiter::new();
        let stop = AtomicBool::new(false);
        let mut polls = 0;
        // Nobody ever wakes us: readiness is still noticed on a later poll
        let start = Instant::now();
        assert!(waiter.wait_until(
            || {
                polls += 1;
                polls >= 3
            },
            Duration::from_millis(5),
            &stop
        ));
        assert!(polls >= 3);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_waiter_observes_stop() {
        let waiter = Waiter::new();
        let stop = AtomicBool::new(true);
        assert!(!waiter.wait_until(|| true, Duration::from_millis(5), &stop));
    }

    #[test]
    fn test_worker_runs_and_stops() {
        let waiter = Arc::new(Waiter::new());
        let flag = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut worker = {
            let flag = Arc::clone(&flag);
            let runs = Arc::clone(&runs);
            Worker::spawn(
                "test-worker",
                Arc::clone(&waiter),
                WorkerOptions::default(),
                Duration::from_millis(5),
                {
                    let flag = Arc::clone(&flag);
                    move || flag.load(Ordering::Acquire)
                },
                move || {
                    runs.fetch_add(1, Ordering::Relaxed);
                    flag.store(false, Ordering::Release);
                },
            )
            .unwrap()
        };

        flag.store(true, Ordering::Release);
        waiter.wake();
        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        worker.stop().unwrap();
        assert!(!worker.is_running());
        assert_eq!(worker.cycles(), 1);
    }

    #[test]
    fn test_worker_thread_carries_its_name() {
        let waiter = Arc::new(Waiter::new());
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let once = Arc::new(AtomicBool::new(true));

        let mut worker = {
            let seen = Arc::clone(&seen);
            let once = Arc::clone(&once);
            Worker::spawn(
                "ipa-recv-test",
                Arc::clone(&waiter),
                WorkerOptions::default(),
                Duration::from_millis(5),
                {
                    let once = Arc::clone(&once);
                    move || once.load(Ordering::Acquire)
                },
                move || {
                    *seen.lock() = thread::current().name().map(str::to_string);
                    once.store(false, Ordering::Release);
                },
            )
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(seen.lock().as_deref(), Some("ipa-recv-test"));
        assert_eq!(worker.name(), "ipa-recv-test");
        worker.stop().unwrap();
    }

    #[test]
    fn test_irq_applies_flow_and_pends_events() {
        let target = fifo(FifoId::ApIpDl);
        let dispatch = Arc::new(IrqDispatch::new(vec![Arc::clone(&target)]));
        let waiter = Arc::new(Waiter::new());
        dispatch.add_waiter(FifoId::ApIpDl, Arc::clone(&waiter));

        let handler = dispatch.handler();
        handler(FifoId::ApIpDl, FifoEvents::ENTER_FLOW_CTRL);
        handler(FifoId::ApIpDl, FifoEvents::ENTER_FLOW_CTRL | FifoEvents::INTR_BIT);
        assert!(target.flow().is_asserted());
        assert_eq!(dispatch.stats().flow_enters, 1);
        assert_eq!(waiter.wakeups(), 2);

        assert!(dispatch.has_pending());
        let mut seen = Vec::new();
        dispatch.drain_pending(|fifo, events| seen.push((fifo, events)));
        assert_eq!(
            seen,
            vec![(FifoId::ApIpDl, FifoEvents::ENTER_FLOW_CTRL | FifoEvents::INTR_BIT)]
        );
        assert!(!dispatch.has_pending());

        handler(FifoId::UsbUl, FifoEvents::INTR_BIT);
        assert_eq!(dispatch.stats().unknown_fifo, 1);
    }
}
