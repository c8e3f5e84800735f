//! Hardware ops: the only point of contact with fifo registers
//!
//! The fabric never touches registers directly. Everything register-level
//! goes through an injected [`FifoOps`] implementation, one per fabric
//! instance. [`soft::SoftwareFabric`] implements it in memory.

pub mod soft;

use crate::fifo::{FlowControlConfig, SharedRings};
use crate::memory::DeviceAddress;
use crate::topology::FifoId;
use crate::Result;
use std::sync::Arc;

bitflags::bitflags! {
    /// Interrupt sources reported for a fifo
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FifoEvents: u32 {
        /// Completions were written to the tx ring
        const INTR_BIT = 1 << 0;
        /// tx ring reached the software interrupt threshold
        const TX_FIFO_THRESHOLD_SW = 1 << 1;
        /// Interrupt delay timer expired with completions pending
        const DELAY_TIMER = 1 << 2;
        /// tx ring reached the hardware interrupt threshold
        const TX_FIFO_THRESHOLD_HW = 1 << 3;
        const TX_FIFO_FULL = 1 << 4;
        const ENTER_FLOW_CTRL = 1 << 5;
        const EXIT_FLOW_CTRL = 1 << 6;
    }
}

/// Events that wake a receive pipeline
pub const RECV_EVENTS: FifoEvents = FifoEvents::INTR_BIT
    .union(FifoEvents::TX_FIFO_THRESHOLD_SW)
    .union(FifoEvents::DELAY_TIMER);

/// Interrupt sink installed by the fabric
///
/// Runs in interrupt context: it may only record state and wake workers.
pub type IrqHandler = Arc<dyn Fn(FifoId, FifoEvents) + Send + Sync>;

/// What the hardware needs to know to service an opened fifo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoInfo {
    pub fifo: FifoId,
    pub register_base: u64,
    pub rx_base: DeviceAddress,
    pub rx_depth: usize,
    pub tx_base: DeviceAddress,
    pub tx_depth: usize,
    pub pam: bool,
    pub recv: bool,
}

/// Occupancy of both rings of a fifo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillDepth {
    pub rx: u32,
    pub tx: u32,
}

/// Register-level operations on common fifos
pub trait FifoOps: Send + Sync {
    /// Install the sink for fifo interrupts
    ///
    /// The handler may run inside a doorbell write, with the fifo's ring
    /// lock held, so it must not take a ring lock itself.
    fn register_irq_handler(&self, handler: IrqHandler);

    /// Bind a fifo's ring memory and register window
    fn open_ring(&self, info: &FifoInfo, rings: SharedRings) -> Result<()>;

    /// Release a fifo's register window
    fn close_ring(&self, _fifo: FifoId) -> Result<()> {
        Ok(())
    }

    fn set_interrupt_threshold(&self, fifo: FifoId, enable: bool, threshold: u32) -> Result<()>;

    fn set_interrupt_timeout(&self, fifo: FifoId, enable: bool, delay_us: u32) -> Result<()>;

    /// Threshold interrupt handled by the pass-through hardware itself
    fn set_hw_interrupt_threshold(&self, fifo: FifoId, enable: bool, threshold: u32) -> Result<()> {
        self.set_interrupt_threshold(fifo, enable, threshold)
    }

    fn set_hw_interrupt_timeout(&self, fifo: FifoId, enable: bool, delay_us: u32) -> Result<()> {
        self.set_interrupt_timeout(fifo, enable, delay_us)
    }

    fn set_interrupt_txfifo_full(&self, fifo: FifoId, enable: bool) -> Result<()>;

    fn enable_flow_control_interrupt(&self, fifo: FifoId, cfg: &FlowControlConfig) -> Result<()>;

    fn get_fill_depth(&self, fifo: FifoId) -> Result<FillDepth>;

    /// `stop == true` holds back new completions
    fn ctrl_receive(&self, fifo: FifoId, stop: bool) -> Result<()>;

    /// Doorbell: software moved the rx write cursor
    ///
    /// Called with the fifo's ring lock held; implementations must not
    /// take that lock.
    fn write_rx_wptr(&self, fifo: FifoId, wptr: u32) -> Result<()>;

    /// Doorbell: software moved the tx read cursor
    ///
    /// Same locking rule as [`FifoOps::write_rx_wptr`].
    fn write_tx_rptr(&self, fifo: FifoId, rptr: u32) -> Result<()>;
}
