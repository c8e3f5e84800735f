//! Endpoints: logical duplex connections over a send and a receive fifo
//!
//! Endpoints are built once from the fifo sizing table. Rings are opened at
//! bring-up and survive disconnects; connecting only binds callbacks and
//! fifo parameters.

use crate::fifo::{CommonFifo, Descriptor, FifoParams, FifoSizing};
use crate::hal::{FifoEvents, FifoOps};
use crate::memory::{DeviceAddress, RingAllocator};
use crate::topology::{EndpointId, FifoId};
use crate::{Error, Result};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Completion callback; the closure carries whatever context it needs
pub type NotifyCallback = Arc<dyn Fn(EndpointId, FifoEvents) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connected,
    /// Bring-up failed; the endpoint refuses every operation
    Unavailable,
}

/// Which of an endpoint's fifos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoRole {
    Send,
    Recv,
}

impl fmt::Display for FifoRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FifoRole::Send => write!(f, "send"),
            FifoRole::Recv => write!(f, "receive"),
        }
    }
}

/// An externally owned buffer to post as a free descriptor
///
/// Only [`PostedBuffer::new`] builds one, so every value carries its
/// caller's promise about the memory behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedBuffer {
    addr: u64,
    len: u32,
    offset: u16,
}

impl PostedBuffer {
    /// # Safety
    ///
    /// The hardware writes up to `len` bytes at `addr + offset` once the
    /// buffer is posted. That range must be valid for writes and must not
    /// be accessed by anything else until the buffer comes back as a
    /// completion. If it never does, the memory must stay allocated for as
    /// long as the fifo is open.
    pub unsafe fn new(addr: u64, len: u32, offset: u16) -> Self {
        Self { addr, len, offset }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }
}

/// What a client binds when connecting
#[derive(Default, Clone)]
pub struct ConnectParams {
    pub send_param: Option<FifoParams>,
    pub recv_param: Option<FifoParams>,
    pub send_notify: Option<NotifyCallback>,
    pub recv_notify: Option<NotifyCallback>,
    /// Free buffers to post into the receive fifo right away
    pub recv_buffers: Vec<PostedBuffer>,
    /// Use software interrupt thresholds even on pass-through fifos
    pub force_sw_intr: bool,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("send_param", &self.send_param)
            .field("recv_param", &self.recv_param)
            .field("send_notify", &self.send_notify.is_some())
            .field("recv_notify", &self.recv_notify.is_some())
            .field("recv_buffers", &self.recv_buffers.len())
            .field("force_sw_intr", &self.force_sw_intr)
            .finish()
    }
}

/// Ring addresses a pass-through peer needs to drive one fifo itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PamFifoInfo {
    pub tx_base: DeviceAddress,
    pub rx_base: DeviceAddress,
    /// Fifo status register
    pub sts_addr: u64,
    pub depth: usize,
}

/// Returned by a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    /// Downlink: the endpoint's send fifo
    pub send: Option<PamFifoInfo>,
    /// Uplink: the endpoint's receive fifo
    pub recv: Option<PamFifoInfo>,
}

#[derive(Default)]
struct Callbacks {
    send: Option<NotifyCallback>,
    recv: Option<NotifyCallback>,
}

/// A logical duplex connection
pub struct Endpoint {
    id: EndpointId,
    send_fifo: Option<Arc<CommonFifo>>,
    recv_fifo: Option<Arc<CommonFifo>>,
    callbacks: RwLock<Callbacks>,
    state: AtomicCell<EndpointState>,
}

impl Endpoint {
    pub fn new(
        id: EndpointId,
        send_fifo: Option<Arc<CommonFifo>>,
        recv_fifo: Option<Arc<CommonFifo>>,
    ) -> Self {
        Self {
            id,
            send_fifo,
            recv_fifo,
            callbacks: RwLock::new(Callbacks::default()),
            state: AtomicCell::new(EndpointState::Disconnected),
        }
    }

    #[inline]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn state(&self) -> EndpointState {
        self.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    pub fn send_fifo(&self) -> Option<&Arc<CommonFifo>> {
        self.send_fifo.as_ref()
    }

    pub fn recv_fifo(&self) -> Option<&Arc<CommonFifo>> {
        self.recv_fifo.as_ref()
    }

    /// Fifo in `role`, or [`Error::MissingFifo`]
    pub fn fifo(&self, role: FifoRole) -> Result<&Arc<CommonFifo>> {
        let fifo = match role {
            FifoRole::Send => self.send_fifo.as_ref(),
            FifoRole::Recv => self.recv_fifo.as_ref(),
        };
        fifo.ok_or(Error::MissingFifo {
            endpoint: self.id,
            role,
        })
    }

    fn fifos(&self) -> impl Iterator<Item = &Arc<CommonFifo>> {
        self.send_fifo.iter().chain(self.recv_fifo.iter())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.state() == EndpointState::Unavailable {
            return Err(Error::EndpointUnavailable(self.id));
        }
        Ok(())
    }

    /// Open both fifos; a failure leaves the endpoint unavailable
    pub fn bring_up(&self, allocator: &RingAllocator, fast_fallback: bool) -> Result<()> {
        for fifo in self.fifos() {
            if let Err(e) = fifo.open(allocator, fast_fallback) {
                self.state.store(EndpointState::Unavailable);
                return Err(e);
            }
        }
        debug!("endpoint {} up", self.id);
        Ok(())
    }

    /// Bind callbacks and fifo parameters
    pub fn connect(
        &self,
        allocator: &RingAllocator,
        fast_fallback: bool,
        params: ConnectParams,
    ) -> Result<ConnectionInfo> {
        self.ensure_available()?;

        for (fifo, param) in [
            (&self.send_fifo, params.send_param),
            (&self.recv_fifo, params.recv_param),
        ] {
            if let Some(fifo) = fifo {
                fifo.open(allocator, fast_fallback)?;
                if let Some(param) = param {
                    fifo.configure(&param, params.force_sw_intr)?;
                }
            }
        }

        if !params.recv_buffers.is_empty() {
            self.init_free_fifo(&params.recv_buffers)?;
        }

        {
            let mut callbacks = self.callbacks.write();
            callbacks.send = params.send_notify;
            callbacks.recv = params.recv_notify;
        }
        self.state.store(EndpointState::Connected);
        info!("endpoint {} connected", self.id);
        self.connection_info()
    }

    /// Clear callbacks; rings stay allocated for the next connect
    pub fn disconnect(&self) -> Result<()> {
        self.ensure_available()?;
        *self.callbacks.write() = Callbacks::default();
        if self.state.swap(EndpointState::Disconnected) == EndpointState::Connected {
            info!("endpoint {} disconnected", self.id);
        }
        Ok(())
    }

    /// Allow or hold back new completions on the receive fifo
    pub fn set_receiving(&self, enabled: bool) -> Result<()> {
        self.ensure_available()?;
        self.fifo(FifoRole::Recv)?.set_receive(enabled)
    }

    /// Post externally owned buffers into the receive fifo
    pub fn init_free_fifo(&self, buffers: &[PostedBuffer]) -> Result<()> {
        self.ensure_available()?;
        let fifo = self.fifo(FifoRole::Recv)?;
        let route = fifo.route();
        let descs: Vec<Descriptor> = buffers
            .iter()
            .map(|buf| Descriptor::new(buf.addr, buf.len, buf.offset, route.src.id(), route.dst.id()))
            .collect();
        // SAFETY: every `PostedBuffer` was built under the same contract
        // `post_receive` asks for.
        unsafe { fifo.post_receive(&descs)? };
        debug!("endpoint {}: posted {} free buffers", self.id, descs.len());
        Ok(())
    }

    /// Ring addresses of both fifos
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let pam_info = |fifo: &Arc<CommonFifo>| -> Result<PamFifoInfo> {
            let (tx_base, rx_base) = fifo.ring_bases()?;
            Ok(PamFifoInfo {
                tx_base,
                rx_base,
                sts_addr: fifo.register_base(),
                depth: fifo.sizing().tx.depth,
            })
        };
        Ok(ConnectionInfo {
            send: self.send_fifo.as_ref().map(pam_info).transpose()?,
            recv: self.recv_fifo.as_ref().map(pam_info).transpose()?,
        })
    }

    /// Run the client callback registered for `fifo`
    pub fn notify(&self, fifo: FifoId, events: FifoEvents) {
        if !self.is_connected() {
            return;
        }
        let callback = {
            let callbacks = self.callbacks.read();
            if self.recv_fifo.as_ref().map(|f| f.id()) == Some(fifo) {
                callbacks.recv.clone()
            } else if self.send_fifo.as_ref().map(|f| f.id()) == Some(fifo) {
                callbacks.send.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback(self.id, events);
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("send_fifo", &self.send_fifo.as_ref().map(|f| f.id()))
            .field("recv_fifo", &self.recv_fifo.as_ref().map(|f| f.id()))
            .finish()
    }
}

/// Every endpoint of one fabric, keyed by id
pub struct EndpointRegistry {
    endpoints: HashMap<EndpointId, Arc<Endpoint>>,
    by_fifo: HashMap<FifoId, EndpointId>,
}

impl EndpointRegistry {
    /// Build endpoints from the sizing table
    ///
    /// Fifos with no tx depth are skipped. When two fifos of one endpoint
    /// claim the same role, the one listed later replaces the earlier.
    pub fn build(sizing: &[FifoSizing], register_base: u64, hal: &Arc<dyn FifoOps>) -> Self {
        let mut roles: HashMap<EndpointId, (Option<Arc<CommonFifo>>, Option<Arc<CommonFifo>>)> =
            HashMap::new();

        for entry in sizing.iter().filter(|entry| entry.tx.depth > 0) {
            let fifo = Arc::new(CommonFifo::new(*entry, register_base, Arc::clone(hal)));
            let route = fifo.route();
            let slot = roles.entry(route.endpoint).or_default();
            let target = if route.to_ipa { &mut slot.0 } else { &mut slot.1 };
            if let Some(previous) = target.replace(fifo) {
                warn!(
                    "endpoint {}: fifo {} replaces {} as {} fifo",
                    route.endpoint,
                    route.fifo,
                    previous.id(),
                    if route.to_ipa { FifoRole::Send } else { FifoRole::Recv }
                );
            }
        }

        let mut endpoints = HashMap::new();
        let mut by_fifo = HashMap::new();
        for (id, (send, recv)) in roles {
            for fifo in send.iter().chain(recv.iter()) {
                by_fifo.insert(fifo.id(), id);
            }
            endpoints.insert(id, Arc::new(Endpoint::new(id, send, recv)));
        }
        Self { endpoints, by_fifo }
    }

    pub fn get(&self, id: EndpointId) -> Result<&Arc<Endpoint>> {
        self.endpoints.get(&id).ok_or(Error::UnknownEndpoint(id))
    }

    /// Endpoint owning `fifo`
    pub fn by_fifo(&self, fifo: FifoId) -> Option<&Arc<Endpoint>> {
        self.by_fifo.get(&fifo).and_then(|id| self.endpoints.get(id))
    }

    /// Fifo `fifo` if some endpoint owns it
    pub fn fifo(&self, fifo: FifoId) -> Option<&Arc<CommonFifo>> {
        let endpoint = self.by_fifo(fifo)?;
        endpoint.fifos().find(|f| f.id() == fifo)
    }

    /// Endpoints in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        let mut endpoints: Vec<&Arc<Endpoint>> = self.endpoints.values().collect();
        endpoints.sort_by_key(|endpoint| endpoint.id());
        endpoints.into_iter()
    }

    /// Every fifo owned by an endpoint
    pub fn fifos(&self) -> Vec<Arc<CommonFifo>> {
        self.iter().flat_map(|endpoint| endpoint.fifos().cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::{RingDirection, RingSizing};
    use crate::hal::soft::SoftwareFabric;
    use crate::memory::DmaBuffer;
    use parking_lot::Mutex;

    fn sizing(fifo: FifoId, depth: usize) -> FifoSizing {
        FifoSizing {
            fifo,
            tx: RingSizing::general(depth),
            rx: RingSizing::general(depth),
        }
    }

    fn registry(entries: &[FifoSizing]) -> (Arc<SoftwareFabric>, EndpointRegistry, RingAllocator) {
        let soft = Arc::new(SoftwareFabric::new());
        let hal: Arc<dyn FifoOps> = soft.clone();
        let registry = EndpointRegistry::build(entries, 0x4000_0000, &hal);
        (soft, registry, RingAllocator::new(0, 0).unwrap())
    }

    #[test]
    fn test_build_assigns_roles() {
        let (_soft, registry, _alloc) = registry(&[
            sizing(FifoId::ApEthDl, 8),
            sizing(FifoId::ApEthUl, 8),
            FifoSizing {
                fifo: FifoId::UsbUl,
                tx: RingSizing::general(0),
                rx: RingSizing::general(8),
            },
        ]);
        let eth = registry.get(EndpointId::ApEth).unwrap();
        assert_eq!(eth.send_fifo().map(|f| f.id()), Some(FifoId::ApEthDl));
        assert_eq!(eth.recv_fifo().map(|f| f.id()), Some(FifoId::ApEthUl));
        assert!(matches!(
            registry.get(EndpointId::Usb),
            Err(Error::UnknownEndpoint(EndpointId::Usb))
        ));
        assert_eq!(registry.by_fifo(FifoId::ApEthUl).map(|e| e.id()), Some(EndpointId::ApEth));
        assert_eq!(registry.fifos().len(), 2);
    }

    #[test]
    fn test_later_fifo_replaces_earlier_role() {
        let (_soft, registry, _alloc) =
            registry(&[sizing(FifoId::PcieUl, 8), sizing(FifoId::PcieDl, 8)]);
        let pcie = registry.get(EndpointId::Pcie).unwrap();
        assert_eq!(pcie.recv_fifo().map(|f| f.id()), Some(FifoId::PcieDl));
        assert!(pcie.send_fifo().is_none());
    }

    #[test]
    fn test_connect_posts_buffers_and_reports_rings() {
        let (soft, registry, alloc) =
            registry(&[sizing(FifoId::UsbUl, 16), sizing(FifoId::UsbDl, 16)]);
        let usb = registry.get(EndpointId::Usb).unwrap();
        let bufs: Vec<DmaBuffer> = (0..4).map(|_| DmaBuffer::alloc(256).unwrap()).collect();
        let params = ConnectParams {
            recv_param: Some(FifoParams::receiver_default(16, 8, 0)),
            // SAFETY: nothing is ever delivered on this fifo
            recv_buffers: bufs
                .iter()
                .map(|b| unsafe { PostedBuffer::new(b.dma_addr(), 256, 0) })
                .collect(),
            ..Default::default()
        };

        let info = usb.connect(&alloc, false, params).unwrap();
        assert!(usb.is_connected());
        let recv = info.recv.unwrap();
        assert_eq!(recv.depth, 16);
        assert_eq!(recv.sts_addr, usb.recv_fifo().unwrap().register_base());
        assert_eq!(info.send.map(|s| s.depth), Some(16));
        assert_eq!(soft.rx_wptr(FifoId::UsbDl), Some(4));
        // Pass-through fifo: hardware thresholds
        assert_eq!(soft.registers(FifoId::UsbDl).unwrap().hw_threshold, Some(8));
    }

    #[test]
    fn test_disconnect_keeps_rings_and_drops_callbacks() {
        let (soft, registry, alloc) = registry(&[sizing(FifoId::ApIpDl, 8)]);
        let ep = registry.get(EndpointId::ApIp).unwrap();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let params = ConnectParams {
            recv_notify: Some(Arc::new(move |_: EndpointId, _: FifoEvents| *counter.lock() += 1)),
            ..Default::default()
        };
        let first = ep.connect(&alloc, false, params.clone()).unwrap();

        ep.notify(FifoId::ApIpDl, FifoEvents::INTR_BIT);
        assert_eq!(*calls.lock(), 1);

        ep.disconnect().unwrap();
        assert_eq!(ep.state(), EndpointState::Disconnected);
        ep.notify(FifoId::ApIpDl, FifoEvents::INTR_BIT);
        assert_eq!(*calls.lock(), 1);
        assert!(soft.registers(FifoId::ApIpDl).is_some());

        let second = ep.connect(&alloc, false, params).unwrap();
        assert_eq!(first, second);
        assert_eq!(alloc.stats().general_rings, 2);
    }

    #[test]
    fn test_set_receiving_and_missing_fifo() {
        let (soft, registry, alloc) = registry(&[sizing(FifoId::ApIpUl, 8)]);
        let ep = registry.get(EndpointId::ApIp).unwrap();
        ep.bring_up(&alloc, false).unwrap();
        assert!(matches!(
            ep.set_receiving(false),
            Err(Error::MissingFifo { role: FifoRole::Recv, .. })
        ));
        assert!(ep.fifo(FifoRole::Send).unwrap().is_empty(RingDirection::Rx));
        assert!(soft.registers(FifoId::ApIpUl).unwrap().receiving);
    }

    #[test]
    fn test_unavailable_endpoint_refuses_connect() {
        let (_soft, registry, alloc) = registry(&[FifoSizing {
            fifo: FifoId::ApIpDl,
            tx: RingSizing::fast(8),
            rx: RingSizing::fast(8),
        }]);
        let ep = registry.get(EndpointId::ApIp).unwrap();
        // No fast region and no fallback: bring-up fails
        assert!(matches!(
            ep.bring_up(&alloc, false),
            Err(Error::FastMemoryExhausted { .. })
        ));
        assert_eq!(ep.state(), EndpointState::Unavailable);
        assert!(matches!(
            ep.connect(&alloc, false, ConnectParams::default()),
            Err(Error::EndpointUnavailable(EndpointId::ApIp))
        ));
    }
}
