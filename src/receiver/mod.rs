//! Receive pipeline: harvest completions, replenish, dispatch to NICs
//!
//! One pipeline per receiving endpoint. Each cycle drains every completed
//! descriptor, checks it against the buffer pool front, posts exactly as
//! many fresh buffers as it harvested and only then hands payloads to the
//! NIC table, with no lock held.

use crate::fifo::{CommonFifo, Descriptor, RingDirection};
use crate::memory::DmaBuffer;
use crate::nic::{NicTable, RecvPacket, VirtualNic};
use crate::poll::{IrqDispatch, Waiter, Worker};
use crate::queue::SkbArray;
use crate::topology::EndpointId;
use crate::utils::cpu::WorkerOptions;
use crate::{Error, Result};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Where the pipeline is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Draining,
    Replenishing,
    Dispatching,
    Stopped,
}

/// Buffer geometry of a receive pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Usable receive length
    pub buf_len: usize,
    /// Headroom reserved on top of `buf_len`
    pub rsvd_len: usize,
    /// Where the hardware starts writing inside a buffer
    pub offset: u16,
    pub max_nics: usize,
}

impl ReceiverConfig {
    pub fn buffer_size(&self) -> usize {
        self.buf_len + self.rsvd_len
    }

    fn descriptor_len(&self) -> u32 {
        (self.buffer_size() - self.offset as usize) as u32
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            buf_len: 1600,
            rsvd_len: 64,
            offset: 64,
            max_nics: 8,
        }
    }
}

#[derive(Debug, Default)]
struct ReceiverStats {
    cycles: AtomicUsize,
    harvested: AtomicUsize,
    replenished: AtomicUsize,
    alloc_failures: AtomicUsize,
    replenish_deferred: AtomicUsize,
    dispatched: AtomicUsize,
    dispatch_errors: AtomicUsize,
    consistency_errors: AtomicUsize,
    malformed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverStatsView {
    pub cycles: usize,
    pub harvested: usize,
    pub replenished: usize,
    pub alloc_failures: usize,
    /// Buffers not posted because the ring had no room
    pub replenish_deferred: usize,
    pub dispatched: usize,
    /// Packets no NIC claimed
    pub dispatch_errors: usize,
    pub consistency_errors: usize,
    /// Completions whose payload lies outside their buffer
    pub malformed: usize,
}

/// Outcome of one drain/replenish/dispatch cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    pub harvested: usize,
    pub replenished: usize,
    pub dispatched: usize,
    pub dropped: usize,
    /// Set when the drain stopped on a pool/ring disagreement
    pub consistency: Option<Error>,
}

/// Receive pipeline of one endpoint
pub struct Receiver {
    endpoint: EndpointId,
    fifo: Arc<CommonFifo>,
    pool: Mutex<SkbArray<DmaBuffer>>,
    nics: NicTable,
    config: ReceiverConfig,
    state: AtomicCell<ReceiverState>,
    stats: ReceiverStats,
}

impl Receiver {
    /// Pipeline over an open receiving fifo; the pool is as deep as its rx ring
    pub fn new(endpoint: EndpointId, fifo: Arc<CommonFifo>, config: ReceiverConfig) -> Result<Self> {
        if !fifo.route().is_recv() {
            return Err(Error::InvalidConfig(format!(
                "fifo {} does not deliver to software",
                fifo.id()
            )));
        }
        if config.offset as usize >= config.buffer_size() {
            return Err(Error::InvalidConfig(format!(
                "payload offset {} outside a {} byte buffer",
                config.offset,
                config.buffer_size()
            )));
        }
        let pool = SkbArray::new(fifo.sizing().rx.depth)?;

        Ok(Self {
            endpoint,
            fifo,
            pool: Mutex::new(pool),
            nics: NicTable::new(config.max_nics),
            config,
            state: AtomicCell::new(ReceiverState::Idle),
            stats: ReceiverStats::default(),
        })
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn fifo(&self) -> &Arc<CommonFifo> {
        &self.fifo
    }

    pub fn nics(&self) -> &NicTable {
        &self.nics
    }

    pub fn add_nic(&self, nic: Arc<VirtualNic>) -> Result<()> {
        self.nics.add(nic)
    }

    pub fn state(&self) -> ReceiverState {
        self.state.load()
    }

    /// Buffers currently owned by the hardware
    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Completions waiting to be harvested
    pub fn has_work(&self) -> bool {
        !self.fifo.is_empty(RingDirection::Tx)
    }

    /// Fill the pool with as many buffers as the tx ring can complete
    pub fn prefill(&self) -> Result<usize> {
        let want = self.fifo.sizing().tx.depth;
        let posted = self.replenish(&mut self.pool.lock(), want);
        info!(
            "receiver {}: prefilled {} of {} buffers ({} bytes each)",
            self.endpoint,
            posted,
            want,
            self.config.buffer_size()
        );
        if posted == 0 && want > 0 {
            return Err(Error::MemoryAllocation(format!(
                "no receive buffers posted for {}",
                self.endpoint
            )));
        }
        Ok(posted)
    }

    /// Allocate and post up to `count` fresh buffers, all in one batch
    fn replenish(&self, pool: &mut SkbArray<DmaBuffer>, count: usize) -> usize {
        let count = count.min(pool.free());
        if count == 0 {
            return 0;
        }

        let route = self.fifo.route();
        let mut buffers = Vec::with_capacity(count);
        let mut descs = Vec::with_capacity(count);
        for _ in 0..count {
            match DmaBuffer::alloc(self.config.buffer_size()) {
                Ok(buffer) => {
                    descs.push(Descriptor::new(
                        buffer.dma_addr(),
                        self.config.descriptor_len(),
                        self.config.offset,
                        route.src.id(),
                        route.dst.id(),
                    ));
                    buffers.push(buffer);
                }
                Err(e) => {
                    self.stats.alloc_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("receiver {}: buffer allocation failed: {}", self.endpoint, e);
                    break;
                }
            }
        }

        // SAFETY: every descriptor covers a buffer in `buffers`, which moves
        // into the pool below and is never freed while the fifo can reach it.
        match unsafe { self.fifo.post_receive(&descs) } {
            Ok(()) => {}
            Err(Error::RingFull(_)) => {
                self.stats
                    .replenish_deferred
                    .fetch_add(descs.len(), Ordering::Relaxed);
                debug!("receiver {}: rx ring full, deferring {}", self.endpoint, descs.len());
                return 0;
            }
            Err(e @ (Error::SelfLoop { .. } | Error::FifoNotOpen(_))) => {
                error!("receiver {}: posting buffers failed: {}", self.endpoint, e);
                return 0;
            }
            Err(e) => {
                // Written but not published; the hardware may still see them
                error!("receiver {}: publishing buffers failed: {}", self.endpoint, e);
                buffers.into_iter().for_each(std::mem::forget);
                return 0;
            }
        }

        let posted = buffers.len();
        for buffer in buffers {
            let addr = buffer.dma_addr();
            if let Err((buffer, e)) = pool.push(buffer, addr) {
                // The hardware already owns this address; never free it
                error!("receiver {}: {} for posted buffer {:#x}", self.endpoint, e, addr);
                std::mem::forget(buffer);
            }
        }
        self.stats.replenished.fetch_add(posted, Ordering::Relaxed);
        posted
    }

    /// Run one drain/replenish/dispatch cycle
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        self.state.store(ReceiverState::Draining);
        let mut harvested: Vec<(DmaBuffer, Descriptor)> = Vec::new();
        {
            let mut pool = self.pool.lock();
            loop {
                let desc = match self.fifo.take_completed() {
                    Ok(desc) => desc,
                    Err(Error::RingEmpty(_)) => break,
                    Err(e) => {
                        error!("receiver {}: harvest failed: {}", self.endpoint, e);
                        break;
                    }
                };

                match pool.peek_addr() {
                    Some(expected) if expected == desc.address => {
                        if let Ok((buffer, _)) = pool.pop() {
                            harvested.push((buffer, desc));
                        }
                    }
                    Some(expected) => {
                        error!(
                            "receiver {}: completion order mismatch, expected {:#x}, got {:#x}; descriptor discarded",
                            self.endpoint, expected, desc.address
                        );
                        self.stats.consistency_errors.fetch_add(1, Ordering::Relaxed);
                        report.consistency = Some(Error::OrderMismatch {
                            endpoint: self.endpoint,
                            expected,
                            actual: desc.address,
                        });
                        break;
                    }
                    None => {
                        error!(
                            "receiver {}: completion {:#x} with no buffer outstanding",
                            self.endpoint, desc.address
                        );
                        self.stats.consistency_errors.fetch_add(1, Ordering::Relaxed);
                        report.consistency = Some(Error::UnexpectedCompletion {
                            endpoint: self.endpoint,
                            address: desc.address,
                        });
                        break;
                    }
                }
            }
            report.harvested = harvested.len();
            self.stats
                .harvested
                .fetch_add(harvested.len(), Ordering::Relaxed);

            self.state.store(ReceiverState::Replenishing);
            report.replenished = self.replenish(&mut pool, harvested.len());
        }

        self.state.store(ReceiverState::Dispatching);
        for (buffer, desc) in harvested {
            let offset = desc.offset as usize;
            let len = desc.length as usize;
            if offset + len > buffer.len() {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "receiver {}: completion {:#x} claims {}+{} bytes of a {} byte buffer",
                    self.endpoint,
                    desc.address,
                    offset,
                    len,
                    buffer.len()
                );
                report.dropped += 1;
                continue;
            }

            let packet = RecvPacket {
                buffer,
                offset,
                len,
                source_id: desc.source_id,
                flow_id: desc.flow_id,
                error_code: desc.error_code,
            };
            match self.nics.dispatch(packet) {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    self.stats.dispatch_errors.fetch_add(1, Ordering::Relaxed);
                    trace!("receiver {}: {}", self.endpoint, e);
                    report.dropped += 1;
                }
            }
        }
        self.stats
            .dispatched
            .fetch_add(report.dispatched, Ordering::Relaxed);

        self.state.store(ReceiverState::Idle);
        report
    }

    pub fn stats(&self) -> ReceiverStatsView {
        ReceiverStatsView {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            harvested: self.stats.harvested.load(Ordering::Relaxed),
            replenished: self.stats.replenished.load(Ordering::Relaxed),
            alloc_failures: self.stats.alloc_failures.load(Ordering::Relaxed),
            replenish_deferred: self.stats.replenish_deferred.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            dispatch_errors: self.stats.dispatch_errors.load(Ordering::Relaxed),
            consistency_errors: self.stats.consistency_errors.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        // Sole owner of the fifo: it drops (and closes) before the pool does
        if Arc::strong_count(&self.fifo) == 1 {
            return;
        }
        // Posted buffers stay reachable by the hardware; never free them
        let pool = self.pool.get_mut();
        let mut leaked = 0;
        while let Ok((buffer, _)) = pool.pop() {
            std::mem::forget(buffer);
            leaked += 1;
        }
        if leaked > 0 {
            debug!(
                "receiver {}: left {} posted buffers with fifo {}",
                self.endpoint,
                leaked,
                self.fifo.id()
            );
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("endpoint", &self.endpoint)
            .field("fifo", &self.fifo.id())
            .field("state", &self.state())
            .field("pool", &self.pool_len())
            .field("nics", &self.nics.len())
            .finish()
    }
}

/// A [`Receiver`] driven by its own worker thread
pub struct SkbReceiver {
    receiver: Arc<Receiver>,
    waiter: Arc<Waiter>,
    irq: Arc<IrqDispatch>,
    worker: Worker,
}

impl SkbReceiver {
    /// Park a worker on the receiver's fifo interrupts
    pub fn spawn(
        receiver: Arc<Receiver>,
        irq: Arc<IrqDispatch>,
        options: WorkerOptions,
        poll_interval: Duration,
    ) -> Result<Self> {
        let waiter = Arc::new(Waiter::new());
        irq.add_waiter(receiver.fifo().id(), Arc::clone(&waiter));

        let ready = {
            let receiver = Arc::clone(&receiver);
            move || receiver.has_work()
        };
        let cycle = {
            let receiver = Arc::clone(&receiver);
            move || {
                let report = receiver.run_cycle();
                trace!("receiver {}: {:?}", receiver.endpoint(), report);
            }
        };
        let worker = Worker::spawn(
            format!("ipa-recv-{}", receiver.endpoint()),
            Arc::clone(&waiter),
            options,
            poll_interval,
            ready,
            cycle,
        )
        .map_err(|e| {
            irq.remove_waiter(receiver.fifo().id(), &waiter);
            e
        })?;

        Ok(Self {
            receiver,
            waiter,
            irq,
            worker,
        })
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop after the current cycle
    pub fn stop(&mut self) -> Result<()> {
        self.irq.remove_waiter(self.receiver.fifo().id(), &self.waiter);
        self.worker.stop()?;
        self.receiver.state.store(ReceiverState::Stopped);
        Ok(())
    }
}
