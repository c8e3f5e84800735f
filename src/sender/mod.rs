//! Transmit path: post outbound payloads, reclaim them on completion
//!
//! Mirrors the receive pipeline. Each payload is copied into a DMA buffer,
//! posted into the send fifo and parked in the pool until the hardware
//! returns its descriptor. Buffers come back in posting order.

use crate::fifo::{CommonFifo, Descriptor, RingDirection};
use crate::memory::DmaBuffer;
use crate::poll::{IrqDispatch, Waiter, Worker};
use crate::queue::SkbArray;
use crate::topology::EndpointId;
use crate::utils::cpu::WorkerOptions;
use crate::{Error, Result};
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct SenderStats {
    sent: AtomicUsize,
    sent_bytes: AtomicUsize,
    reclaimed: AtomicUsize,
    flow_refused: AtomicUsize,
    pool_full: AtomicUsize,
    consistency_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderStatsView {
    pub sent: usize,
    pub sent_bytes: usize,
    pub reclaimed: usize,
    /// Payloads refused while the fifo was in flow control
    pub flow_refused: usize,
    pub pool_full: usize,
    pub consistency_errors: usize,
}

/// Transmit side of one endpoint
pub struct Sender {
    endpoint: EndpointId,
    fifo: Arc<CommonFifo>,
    pool: Mutex<SkbArray<DmaBuffer>>,
    offset: u16,
    stats: SenderStats,
}

impl Sender {
    /// Transmit path over an open send fifo; payloads start at `offset`
    pub fn new(endpoint: EndpointId, fifo: Arc<CommonFifo>, offset: u16) -> Result<Self> {
        if fifo.route().is_recv() {
            return Err(Error::InvalidConfig(format!(
                "fifo {} does not carry traffic to the accelerator",
                fifo.id()
            )));
        }
        let pool = SkbArray::new(fifo.sizing().rx.depth)?;
        Ok(Self {
            endpoint,
            fifo,
            pool: Mutex::new(pool),
            offset,
            stats: SenderStats::default(),
        })
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn fifo(&self) -> &Arc<CommonFifo> {
        &self.fifo
    }

    /// Payloads posted and not yet reclaimed
    pub fn in_flight(&self) -> usize {
        self.pool.lock().len()
    }

    /// Completions waiting to be reclaimed
    pub fn has_work(&self) -> bool {
        !self.fifo.is_empty(RingDirection::Tx)
    }

    /// Post one payload tagged with `flow_id`
    ///
    /// Refused with [`Error::FlowControlled`] while the fifo asserts flow
    /// control and with [`Error::PoolFull`] when every slot is in flight.
    pub fn send(&self, payload: &[u8], flow_id: u8) -> Result<()> {
        if self.fifo.flow().is_asserted() {
            self.stats.flow_refused.fetch_add(1, Ordering::Relaxed);
            trace!("sender {}: fifo {} in flow control", self.endpoint, self.fifo.id());
            return Err(Error::FlowControlled(self.fifo.id()));
        }

        let mut pool = self.pool.lock();
        if pool.is_full() {
            self.stats.pool_full.fetch_add(1, Ordering::Relaxed);
            return Err(Error::PoolFull);
        }

        let offset = self.offset as usize;
        let mut buffer = DmaBuffer::alloc(offset + payload.len().max(1))?;
        buffer.as_mut_slice()[offset..offset + payload.len()].copy_from_slice(payload);

        let route = self.fifo.route();
        let desc = Descriptor::new(
            buffer.dma_addr(),
            payload.len() as u32,
            self.offset,
            route.src.id(),
            route.dst.id(),
        )
        .with_flow(flow_id);
        // SAFETY: `buffer` moves into the pool below and is only released
        // once its completion has been taken back.
        match unsafe { self.fifo.post_receive(&[desc]) } {
            Ok(()) => {}
            Err(e @ (Error::RingFull(_) | Error::SelfLoop { .. } | Error::FifoNotOpen(_))) => {
                return Err(e)
            }
            Err(e) => {
                // Written but not published; the hardware may still see it
                std::mem::forget(buffer);
                return Err(e);
            }
        }

        let addr = buffer.dma_addr();
        if let Err((buffer, e)) = pool.push(buffer, addr) {
            error!("sender {}: {} for posted buffer {:#x}", self.endpoint, e, addr);
            std::mem::forget(buffer);
            return Err(e);
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .sent_bytes
            .fetch_add(payload.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Release every buffer the hardware has finished with
    ///
    /// Stops at the first completion that does not match the oldest
    /// in-flight buffer; that buffer stays parked.
    pub fn reclaim(&self) -> Result<usize> {
        let mut pool = self.pool.lock();
        let mut reclaimed = 0;
        let outcome = loop {
            let desc = match self.fifo.take_completed() {
                Ok(desc) => desc,
                Err(Error::RingEmpty(_)) => break Ok(()),
                Err(e) => break Err(e),
            };
            match pool.peek_addr() {
                Some(expected) if expected == desc.address => {
                    pool.pop()?;
                    reclaimed += 1;
                }
                Some(expected) => {
                    error!(
                        "sender {}: completion order mismatch, expected {:#x}, got {:#x}",
                        self.endpoint, expected, desc.address
                    );
                    self.stats.consistency_errors.fetch_add(1, Ordering::Relaxed);
                    break Err(Error::OrderMismatch {
                        endpoint: self.endpoint,
                        expected,
                        actual: desc.address,
                    });
                }
                None => {
                    error!(
                        "sender {}: completion {:#x} with nothing in flight",
                        self.endpoint, desc.address
                    );
                    self.stats.consistency_errors.fetch_add(1, Ordering::Relaxed);
                    break Err(Error::UnexpectedCompletion {
                        endpoint: self.endpoint,
                        address: desc.address,
                    });
                }
            }
        };
        drop(pool);

        self.stats.reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
        if reclaimed > 0 {
            debug!("sender {}: reclaimed {}", self.endpoint, reclaimed);
        }
        outcome.map(|()| reclaimed)
    }

    pub fn stats(&self) -> SenderStatsView {
        SenderStatsView {
            sent: self.stats.sent.load(Ordering::Relaxed),
            sent_bytes: self.stats.sent_bytes.load(Ordering::Relaxed),
            reclaimed: self.stats.reclaimed.load(Ordering::Relaxed),
            flow_refused: self.stats.flow_refused.load(Ordering::Relaxed),
            pool_full: self.stats.pool_full.load(Ordering::Relaxed),
            consistency_errors: self.stats.consistency_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Sender {
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
                "sender {}: left {} posted buffers with fifo {}",
                self.endpoint,
                leaked,
                self.fifo.id()
            );
        }
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("endpoint", &self.endpoint)
            .field("fifo", &self.fifo.id())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A [`Sender`] whose completions are reclaimed by a worker thread
pub struct SkbSender {
    sender: Arc<Sender>,
    waiter: Arc<Waiter>,
    irq: Arc<IrqDispatch>,
    worker: Worker,
}

impl SkbSender {
    pub fn spawn(
        sender: Arc<Sender>,
        irq: Arc<IrqDispatch>,
        options: WorkerOptions,
        poll_interval: Duration,
    ) -> Result<Self> {
        let waiter = Arc::new(Waiter::new());
        irq.add_waiter(sender.fifo().id(), Arc::clone(&waiter));

        let ready = {
            let sender = Arc::clone(&sender);
            move || sender.has_work()
        };
        let cycle = {
            let sender = Arc::clone(&sender);
            move || {
                if let Err(e) = sender.reclaim() {
                    trace!("sender {}: {}", sender.endpoint(), e);
                }
            }
        };
        let worker = Worker::spawn(
            format!("ipa-send-{}", sender.endpoint()),
            Arc::clone(&waiter),
            options,
            poll_interval,
            ready,
            cycle,
        )
        .map_err(|e| {
            irq.remove_waiter(sender.fifo().id(), &waiter);
            e
        })?;
        info!("sender {} running on fifo {}", sender.endpoint(), sender.fifo().id());

        Ok(Self {
            sender,
            waiter,
            irq,
            worker,
        })
    }

    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.irq.remove_waiter(self.sender.fifo().id(), &self.waiter);
        self.worker.stop()
    }
}
