//! Common fifos: the hardware-visible descriptor rings of the fabric
//!
//! Every common fifo pairs two descriptor rings. Software writes the rx
//! ring (free buffers for a receiving fifo, outbound packets for a sending
//! one) and the hardware writes completions into the tx ring. Both rings
//! sit behind one short-held lock together with the doorbell register write
//! that publishes a cursor move.

mod descriptor;
mod flow;

pub use descriptor::{Descriptor, DescriptorRing, DESCRIPTOR_SIZE};
pub use flow::{
    FifoParams, FlowControl, FlowControlConfig, FlowCtrlIrqMode, FlowCtrlSource, FlowTransition,
    Watermarks,
};

use crate::hal::{FifoInfo, FifoOps, FillDepth};
use crate::memory::{DeviceAddress, Placement, RingAllocator};
use crate::topology::{FifoId, FifoRoute};
use crate::{Error, Result};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Size of one fifo's register window
pub const FIFO_REG_SIZE: u64 = 0x80;

/// Ring within a common fifo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingDirection {
    /// Written by software, consumed by hardware
    Rx,
    /// Written by hardware, consumed by software
    Tx,
}

/// Depth and placement of one ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSizing {
    pub depth: usize,
    #[serde(default)]
    pub placement: Placement,
}

impl RingSizing {
    pub fn general(depth: usize) -> Self {
        Self {
            depth,
            placement: Placement::GeneralMemory,
        }
    }

    pub fn fast(depth: usize) -> Self {
        Self {
            depth,
            placement: Placement::FastMemory,
        }
    }
}

/// Ring sizing of one common fifo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoSizing {
    pub fifo: FifoId,
    pub tx: RingSizing,
    pub rx: RingSizing,
}

/// Both rings of an open fifo
#[derive(Debug)]
pub struct FifoRings {
    pub rx: DescriptorRing,
    pub tx: DescriptorRing,
}

impl FifoRings {
    pub fn ring(&self, direction: RingDirection) -> &DescriptorRing {
        match direction {
            RingDirection::Rx => &self.rx,
            RingDirection::Tx => &self.tx,
        }
    }
}

/// Rings shared between a fifo and the hardware that services it
pub type SharedRings = Arc<Mutex<FifoRings>>;

/// One common fifo of the fabric
pub struct CommonFifo {
    route: &'static FifoRoute,
    sizing: FifoSizing,
    register_base: u64,
    hal: Arc<dyn FifoOps>,
    rings: RwLock<Option<SharedRings>>,
    params: Mutex<Option<FifoParams>>,
    flow: FlowControl,
}

impl CommonFifo {
    /// Describe a fifo; nothing is allocated until [`CommonFifo::open`]
    pub fn new(sizing: FifoSizing, fabric_register_base: u64, hal: Arc<dyn FifoOps>) -> Self {
        let route = sizing.fifo.route();
        let register_base =
            fabric_register_base + (sizing.fifo.index() as u64 + 1) * FIFO_REG_SIZE;

        Self {
            route,
            sizing,
            register_base,
            hal,
            rings: RwLock::new(None),
            params: Mutex::new(None),
            flow: FlowControl::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> FifoId {
        self.route.fifo
    }

    #[inline]
    pub fn route(&self) -> &'static FifoRoute {
        self.route
    }

    #[inline]
    pub fn sizing(&self) -> &FifoSizing {
        &self.sizing
    }

    /// Start of this fifo's register window
    #[inline]
    pub fn register_base(&self) -> u64 {
        self.register_base
    }

    #[inline]
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn is_open(&self) -> bool {
        self.rings.read().is_some()
    }

    pub fn params(&self) -> Option<FifoParams> {
        *self.params.lock()
    }

    fn rings(&self) -> Result<SharedRings> {
        self.rings
            .read()
            .as_ref()
            .cloned()
            .ok_or(Error::FifoNotOpen(self.id()))
    }

    /// Bind ring memory and the register window; a no-op when already open
    pub fn open(&self, allocator: &RingAllocator, fast_fallback: bool) -> Result<()> {
        let mut slot = self.rings.write();
        if slot.is_some() {
            trace!("fifo {} already open", self.id());
            return Ok(());
        }

        let allocate = |direction, sizing: RingSizing| {
            if fast_fallback {
                allocator.allocate_with_fallback(direction, sizing.depth, sizing.placement)
            } else {
                allocator.allocate(direction, sizing.depth, sizing.placement)
            }
        };
        let rx = DescriptorRing::new(allocate(RingDirection::Rx, self.sizing.rx)?, self.sizing.rx.depth)?;
        let tx = DescriptorRing::new(allocate(RingDirection::Tx, self.sizing.tx)?, self.sizing.tx.depth)?;

        let info = FifoInfo {
            fifo: self.id(),
            register_base: self.register_base,
            rx_base: rx.base_address(),
            rx_depth: rx.depth(),
            tx_base: tx.base_address(),
            tx_depth: tx.depth(),
            pam: self.route.pam,
            recv: self.route.is_recv(),
        };
        let rings = Arc::new(Mutex::new(FifoRings { rx, tx }));
        self.hal.open_ring(&info, Arc::clone(&rings))?;

        info!(
            "opened fifo {}: rx {}x{} at {}, tx {}x{} at {}, regs {:#x}",
            self.id(),
            info.rx_depth,
            DESCRIPTOR_SIZE,
            info.rx_base,
            info.tx_depth,
            DESCRIPTOR_SIZE,
            info.tx_base,
            self.register_base
        );
        *slot = Some(rings);
        Ok(())
    }

    /// Program interrupt and flow-control behaviour
    ///
    /// Pass-through fifos use hardware interrupt thresholds unless
    /// `force_sw_intr` is set.
    pub fn configure(&self, params: &FifoParams, force_sw_intr: bool) -> Result<()> {
        let id = self.id();
        params.watermarks.validate(self.sizing.rx.depth.max(self.sizing.tx.depth))?;

        if !force_sw_intr && self.route.pam {
            self.hal
                .set_hw_interrupt_threshold(id, true, params.tx_intr_threshold)?;
            self.hal
                .set_hw_interrupt_timeout(id, true, params.tx_intr_delay_us)?;
        } else {
            if params.tx_intr_threshold > 0 {
                self.hal
                    .set_interrupt_threshold(id, true, params.tx_intr_threshold)?;
            }
            if params.tx_intr_delay_us > 0 {
                self.hal
                    .set_interrupt_timeout(id, true, params.tx_intr_delay_us)?;
            }
        }

        let flow_cfg = params.flow_control(self.route.is_recv());
        self.hal.enable_flow_control_interrupt(id, &flow_cfg)?;
        self.hal
            .set_interrupt_txfifo_full(id, params.flowctrl_in_tx_full)?;

        *self.params.lock() = Some(*params);
        debug!("configured fifo {}: {:?}", id, params);
        Ok(())
    }

    /// Make `items` visible to the hardware, all or none
    ///
    /// Self-looping descriptors are rejected before anything is written.
    /// A ring without room for every item returns [`Error::RingFull`] and is
    /// left untouched. [`Error::SelfLoop`], [`Error::RingFull`] and
    /// [`Error::FifoNotOpen`] mean nothing was posted; any other error comes
    /// from publishing the write pointer after the items were written.
    ///
    /// # Safety
    ///
    /// The hardware writes received payloads into, and reads transmitted
    /// payloads from, `address + offset .. address + offset + length` of
    /// every descriptor. Each such range must be valid for reads and writes
    /// and must not be accessed by anything else from the moment it is
    /// posted until the fifo hands the descriptor back as a completion. If
    /// it is never completed, the memory must stay allocated for as long as
    /// the fifo is open.
    pub unsafe fn post_receive(&self, items: &[Descriptor]) -> Result<()> {
        if let Some(bad) = items.iter().find(|desc| desc.is_self_loop()) {
            error!(
                "fifo {}: descriptor at {:#x} loops terminal {} back to itself",
                self.id(),
                bad.address,
                bad.source_id
            );
            return Err(Error::SelfLoop {
                fifo: self.id(),
                terminal: bad.source_id,
            });
        }
        if items.is_empty() {
            return Ok(());
        }

        let rings = self.rings()?;
        let mut rings = rings.lock();
        if rings.rx.push_batch(items).is_err() {
            trace!(
                "fifo {}: rx ring full ({} free, {} requested)",
                self.id(),
                rings.rx.index().free(),
                items.len()
            );
            return Err(Error::RingFull(self.id()));
        }
        let wptr = rings.rx.index().wp();
        self.hal.write_rx_wptr(self.id(), wptr)
    }

    /// Read the oldest completed descriptor
    pub fn take_completed(&self) -> Result<Descriptor> {
        let rings = self.rings()?;
        let mut rings = rings.lock();
        let desc = rings.tx.pop().map_err(|_| Error::RingEmpty(self.id()))?;
        let rptr = rings.tx.index().rp();
        self.hal.write_tx_rptr(self.id(), rptr)?;
        Ok(desc)
    }

    /// Peek at a ring without consuming anything
    ///
    /// A fifo that is not open reads as empty.
    pub fn is_empty(&self, direction: RingDirection) -> bool {
        match self.rings() {
            Ok(rings) => rings.lock().ring(direction).is_empty(),
            Err(_) => true,
        }
    }

    /// Free slots left in the rx ring
    pub fn rx_room(&self) -> Result<usize> {
        Ok(self.rings()?.lock().rx.index().free())
    }

    /// Occupancy of both rings as the hardware reports it
    pub fn fill_depth(&self) -> Result<FillDepth> {
        if !self.is_open() {
            return Err(Error::FifoNotOpen(self.id()));
        }
        self.hal.get_fill_depth(self.id())
    }

    /// Allow or stop new completions for this fifo
    pub fn set_receive(&self, enabled: bool) -> Result<()> {
        debug!("fifo {}: receive {}", self.id(), if enabled { "on" } else { "off" });
        self.hal.ctrl_receive(self.id(), !enabled)
    }

    /// Base addresses of both rings
    pub fn ring_bases(&self) -> Result<(DeviceAddress, DeviceAddress)> {
        let rings = self.rings()?;
        let rings = rings.lock();
        Ok((rings.tx.base_address(), rings.rx.base_address()))
    }
}

impl Drop for CommonFifo {
    fn drop(&mut self) {
        if self.rings.get_mut().take().is_some() {
            if let Err(e) = self.hal.close_ring(self.id()) {
                warn!("fifo {}: close failed: {}", self.id(), e);
            }
        }
    }
}

impl fmt::Debug for CommonFifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonFifo")
            .field("fifo", &self.id())
            .field("sizing", &self.sizing)
            .field("register_base", &format_args!("{:#x}", self.register_base))
            .field("open", &self.is_open())
            .field("flow_asserted", &self.flow.is_asserted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::soft::SoftwareFabric;
    use crate::topology::Terminal;

    fn open_fifo(fifo: FifoId, depth: usize) -> (Arc<SoftwareFabric>, CommonFifo, RingAllocator) {
        let hal = Arc::new(SoftwareFabric::new());
        let sizing = FifoSizing {
            fifo,
            tx: RingSizing::general(depth),
            rx: RingSizing::general(depth),
        };
        let fifo = CommonFifo::new(sizing, 0x2000_0000, hal.clone());
        let allocator = RingAllocator::new(0, 0).unwrap();
        fifo.open(&allocator, false).unwrap();
        (hal, fifo, allocator)
    }

    fn free_desc(fifo: &CommonFifo, address: u64) -> Descriptor {
        let route = fifo.route();
        Descriptor::new(address, 1536, 64, route.src.id(), route.dst.id())
    }

    #[test]
    fn test_register_window() {
        let hal = Arc::new(SoftwareFabric::new());
        let sizing = FifoSizing {
            fifo: FifoId::SdioUl,
            tx: RingSizing::general(8),
            rx: RingSizing::general(8),
        };
        let fifo = CommonFifo::new(sizing, 0x2000_0000, hal);
        assert_eq!(fifo.register_base(), 0x2000_0000 + 2 * FIFO_REG_SIZE);
        assert!(!fifo.is_open());
        assert!(fifo.is_empty(RingDirection::Tx));
        assert!(matches!(fifo.take_completed(), Err(Error::FifoNotOpen(FifoId::SdioUl))));
    }

    #[test]
    fn test_open_is_idempotent() {
        let (_hal, fifo, allocator) = open_fifo(FifoId::ApIpDl, 8);
        let bases = fifo.ring_bases().unwrap();
        fifo.open(&allocator, false).unwrap();
        assert_eq!(fifo.ring_bases().unwrap(), bases);
        assert_eq!(allocator.stats().general_rings, 2);
    }

    #[test]
    fn test_self_loop_rejected_before_posting() {
        let (_hal, fifo, _allocator) = open_fifo(FifoId::ApIpDl, 8);
        let good = free_desc(&fifo, 0x1000);
        let looped = Descriptor::new(0x2000, 64, 0, Terminal::ApIp.id(), Terminal::ApIp.id());
        // SAFETY: nothing is delivered on this fifo, the addresses are never touched
        let err = unsafe { fifo.post_receive(&[good, looped]) }.unwrap_err();
        assert!(matches!(err, Error::SelfLoop { .. }));
        assert_eq!(fifo.rx_room().unwrap(), 8);
    }

    #[test]
    fn test_post_receive_ring_full() {
        let (hal, fifo, _allocator) = open_fifo(FifoId::ApIpDl, 4);
        let batch: Vec<Descriptor> = (0..3).map(|i| free_desc(&fifo, 0x1000 * (i + 1))).collect();
        // SAFETY: nothing is delivered on this fifo, the addresses are never touched
        unsafe { fifo.post_receive(&batch) }.unwrap();

        let err = unsafe { fifo.post_receive(&batch) }.unwrap_err();
        assert!(matches!(err, Error::RingFull(FifoId::ApIpDl)));
        assert_eq!(fifo.rx_room().unwrap(), 1);
        assert_eq!(fifo.fill_depth().unwrap(), FillDepth { rx: 3, tx: 0 });
        assert_eq!(hal.rx_wptr(FifoId::ApIpDl), Some(3));
    }

    #[test]
    fn test_completions_in_post_order() {
        let (hal, fifo, _allocator) = open_fifo(FifoId::ApIpDl, 8);
        for i in 0..5u64 {
            hal.inject(FifoId::ApIpDl, free_desc(&fifo, 0x100 * (i + 1)))
                .unwrap();
        }
        assert!(!fifo.is_empty(RingDirection::Tx));
        for i in 0..5u64 {
            assert_eq!(fifo.take_completed().unwrap().address, 0x100 * (i + 1));
        }
        assert!(matches!(fifo.take_completed(), Err(Error::RingEmpty(_))));
        assert!(fifo.is_empty(RingDirection::Tx));
        assert_eq!(hal.tx_rptr(FifoId::ApIpDl), Some(5));
    }

    #[test]
    fn test_configure_pam_uses_hw_thresholds() {
        let (hal, fifo, _allocator) = open_fifo(FifoId::UsbDl, 64);
        let params = FifoParams::receiver_default(64, 32, 0);
        fifo.configure(&params, false).unwrap();
        let regs = hal.registers(FifoId::UsbDl).unwrap();
        assert_eq!(regs.hw_threshold, Some(32));
        assert_eq!(regs.sw_threshold, None);
        assert!(regs.flow.map_or(false, |cfg| cfg.remote));

        let (hal, fifo, _allocator) = open_fifo(FifoId::ApIpDl, 64);
        fifo.configure(&params, false).unwrap();
        let regs = hal.registers(FifoId::ApIpDl).unwrap();
        assert_eq!(regs.sw_threshold, Some(32));
        assert_eq!(regs.sw_timeout, None);
        assert_eq!(fifo.params(), Some(params));
    }
}
