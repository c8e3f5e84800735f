//! Virtual NICs and the per-endpoint dispatch table
//!
//! Several NICs may share one endpoint. Each harvested packet goes to the
//! most specific NIC whose source mask accepts the packet's source terminal
//! and whose flow filter accepts its flow id; among equally specific NICs
//! the one registered first wins.

use crate::memory::DmaBuffer;
use crate::sender::Sender;
use crate::topology::TermMask;
use crate::{Error, Result};
use log::{debug, info, trace};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Flow id filter of a NIC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowFilter {
    Any,
    Exact(u8),
}

impl FlowFilter {
    /// Filter from its raw form, where -1 means any flow
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            -1 => Ok(FlowFilter::Any),
            0..=255 => Ok(FlowFilter::Exact(raw as u8)),
            _ => Err(Error::InvalidConfig(format!("flow id {} out of range", raw))),
        }
    }

    pub fn matches(self, flow_id: u8) -> bool {
        match self {
            FlowFilter::Any => true,
            FlowFilter::Exact(id) => id == flow_id,
        }
    }

    fn specificity(self) -> u8 {
        match self {
            FlowFilter::Any => 0,
            FlowFilter::Exact(_) => 1,
        }
    }
}

/// Identity and filters of a virtual NIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicConfig {
    pub name: String,
    pub src_mask: TermMask,
    pub flow: FlowFilter,
}

impl NicConfig {
    pub fn new(name: impl Into<String>, src_mask: TermMask, flow: FlowFilter) -> Self {
        Self {
            name: name.into(),
            src_mask,
            flow,
        }
    }

    pub fn matches(&self, source_id: u8, flow_id: u8) -> bool {
        self.src_mask.accepts(source_id) && self.flow.matches(flow_id)
    }
}

/// A received payload handed to a NIC
///
/// Owns the buffer the hardware wrote into; the payload is
/// `buffer[offset..offset + len]`.
pub struct RecvPacket {
    pub buffer: DmaBuffer,
    pub offset: usize,
    pub len: usize,
    pub source_id: u8,
    pub flow_id: u8,
    pub error_code: u8,
}

impl RecvPacket {
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_slice()[self.offset..self.offset + self.len]
    }
}

impl fmt::Debug for RecvPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvPacket")
            .field("addr", &format_args!("{:#x}", self.buffer.dma_addr()))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("source_id", &self.source_id)
            .field("flow_id", &self.flow_id)
            .field("error_code", &self.error_code)
            .finish()
    }
}

/// Consumer of a NIC's received packets
pub type RecvHandler = Arc<dyn Fn(RecvPacket) + Send + Sync>;

#[derive(Debug, Default)]
struct NicStats {
    rx_packets: AtomicUsize,
    rx_bytes: AtomicUsize,
    rx_errors: AtomicUsize,
    tx_packets: AtomicUsize,
    tx_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NicStatsView {
    pub rx_packets: usize,
    pub rx_bytes: usize,
    /// Packets delivered with a hardware error code
    pub rx_errors: usize,
    pub tx_packets: usize,
    pub tx_errors: usize,
}

/// A dispatch target sharing an endpoint with other NICs
pub struct VirtualNic {
    config: NicConfig,
    handler: RecvHandler,
    sender: RwLock<Option<Arc<Sender>>>,
    stats: NicStats,
}

impl VirtualNic {
    pub fn new(config: NicConfig, handler: RecvHandler) -> Self {
        Self {
            config,
            handler,
            sender: RwLock::new(None),
            stats: NicStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NicConfig {
        &self.config
    }

    /// Deliver one packet to the consumer
    pub fn receive(&self, packet: RecvPacket) {
        self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.stats.rx_bytes.fetch_add(packet.len, Ordering::Relaxed);
        if packet.error_code != 0 {
            self.stats.rx_errors.fetch_add(1, Ordering::Relaxed);
        }
        (self.handler)(packet)
    }

    /// Attach the transmit path outbound payloads go through
    pub fn bind_sender(&self, sender: Arc<Sender>) {
        *self.sender.write() = Some(sender);
    }

    /// Push an outbound payload; exact-flow NICs tag it with their flow id
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let sender = self.sender.read().clone().ok_or_else(|| {
            Error::InvalidConfig(format!("nic {} has no sender bound", self.config.name))
        })?;
        let flow_id = match self.config.flow {
            FlowFilter::Exact(id) => id,
            FlowFilter::Any => 0,
        };
        match sender.send(payload, flow_id) {
            Ok(()) => {
                self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> NicStatsView {
        NicStatsView {
            rx_packets: self.stats.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.stats.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.stats.rx_errors.load(Ordering::Relaxed),
            tx_packets: self.stats.tx_packets.load(Ordering::Relaxed),
            tx_errors: self.stats.tx_errors.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for VirtualNic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualNic")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// NICs registered on one endpoint, in registration order
pub struct NicTable {
    nics: RwLock<Vec<Arc<VirtualNic>>>,
    max: usize,
}

impl NicTable {
    pub fn new(max: usize) -> Self {
        Self {
            nics: RwLock::new(Vec::with_capacity(max)),
            max,
        }
    }

    pub fn add(&self, nic: Arc<VirtualNic>) -> Result<()> {
        let mut nics = self.nics.write();
        if nics.len() >= self.max {
            return Err(Error::NicTableFull(self.max));
        }
        if nics
            .iter()
            .any(|other| other.config.src_mask == nic.config.src_mask && other.config.flow == nic.config.flow)
        {
            debug!("nic {} shadowed by an earlier nic with the same filter", nic.name());
        }
        info!("registered nic {} ({:?})", nic.name(), nic.config);
        nics.push(nic);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<VirtualNic>> {
        let mut nics = self.nics.write();
        let pos = nics.iter().position(|nic| nic.name() == name)?;
        Some(nics.remove(pos))
    }

    /// NIC a packet from `source_id` on `flow_id` belongs to
    pub fn select(&self, source_id: u8, flow_id: u8) -> Option<Arc<VirtualNic>> {
        let nics = self.nics.read();
        let mut best: Option<&Arc<VirtualNic>> = None;
        for nic in nics.iter().filter(|nic| nic.config.matches(source_id, flow_id)) {
            match best {
                Some(current) if current.config.flow.specificity() >= nic.config.flow.specificity() => {}
                _ => best = Some(nic),
            }
        }
        best.cloned()
    }

    /// Hand `packet` to its NIC
    ///
    /// The table lock is released before the consumer runs.
    pub fn dispatch(&self, packet: RecvPacket) -> Result<()> {
        let (source_id, flow_id) = (packet.source_id, packet.flow_id);
        match self.select(source_id, flow_id) {
            Some(nic) => {
                trace!("dispatch {} bytes to {}", packet.len, nic.name());
                nic.receive(packet);
                Ok(())
            }
            None => Err(Error::NoMatchingNic { source_id, flow_id }),
        }
    }

    /// Every registered NIC
    pub fn nics(&self) -> Vec<Arc<VirtualNic>> {
        self.nics.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nics.read().is_empty()
    }
}

impl fmt::Debug for NicTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NicTable")
            .field("nics", &self.len())
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Terminal;
    use parking_lot::Mutex;

    fn collecting_nic(name: &str, mask: TermMask, flow: FlowFilter) -> (Arc<VirtualNic>, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let nic = VirtualNic::new(
            NicConfig::new(name, mask, flow),
            Arc::new(move |packet: RecvPacket| sink.lock().push(packet.flow_id)),
        );
        (Arc::new(nic), seen)
    }

    fn packet(source_id: u8, flow_id: u8) -> RecvPacket {
        let mut buffer = DmaBuffer::alloc(16).unwrap();
        buffer.as_mut_slice()[4..8].copy_from_slice(b"data");
        RecvPacket {
            buffer,
            offset: 4,
            len: 4,
            source_id,
            flow_id,
            error_code: 0,
        }
    }

    #[test]
    fn test_flow_filter_from_raw() {
        assert_eq!(FlowFilter::from_raw(-1).unwrap(), FlowFilter::Any);
        assert_eq!(FlowFilter::from_raw(7).unwrap(), FlowFilter::Exact(7));
        assert!(FlowFilter::from_raw(256).is_err());
        assert!(FlowFilter::from_raw(-2).is_err());
    }

    #[test]
    fn test_exact_filter_beats_any() {
        let table = NicTable::new(8);
        let (any, any_seen) = collecting_nic("any", TermMask::all(), FlowFilter::Any);
        let (one, one_seen) = collecting_nic("one", TermMask::all(), FlowFilter::Exact(1));
        // Registered after the catch-all, still wins flow 1
        table.add(any).unwrap();
        table.add(one).unwrap();

        let usb = Terminal::Usb.id();
        table.dispatch(packet(usb, 1)).unwrap();
        table.dispatch(packet(usb, 2)).unwrap();
        assert_eq!(*one_seen.lock(), vec![1]);
        assert_eq!(*any_seen.lock(), vec![2]);
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let table = NicTable::new(8);
        let (first, first_seen) = collecting_nic("first", TermMask::USB, FlowFilter::Exact(3));
        let (second, second_seen) = collecting_nic("second", TermMask::all(), FlowFilter::Exact(3));
        table.add(first).unwrap();
        table.add(second).unwrap();

        table.dispatch(packet(Terminal::Usb.id(), 3)).unwrap();
        table.dispatch(packet(Terminal::Wifi.id(), 3)).unwrap();
        assert_eq!(first_seen.lock().len(), 1);
        assert_eq!(second_seen.lock().len(), 1);
    }

    #[test]
    fn test_no_match_is_reported() {
        let table = NicTable::new(8);
        let (usb, _) = collecting_nic("usb", TermMask::USB, FlowFilter::Any);
        table.add(usb).unwrap();
        let err = table.dispatch(packet(Terminal::Sdio0.id(), 0)).unwrap_err();
        assert!(matches!(err, Error::NoMatchingNic { source_id: 15, flow_id: 0 }));
    }

    #[test]
    fn test_table_capacity_and_removal() {
        let table = NicTable::new(1);
        let (a, _) = collecting_nic("a", TermMask::all(), FlowFilter::Any);
        let (b, _) = collecting_nic("b", TermMask::all(), FlowFilter::Any);
        table.add(a).unwrap();
        assert!(matches!(table.add(Arc::clone(&b)), Err(Error::NicTableFull(1))));
        assert_eq!(table.remove("a").map(|nic| nic.name().to_string()), Some("a".to_string()));
        table.add(b).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_receive_stats_and_payload() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        let nic = VirtualNic::new(
            NicConfig::new("n", TermMask::all(), FlowFilter::Any),
            Arc::new(move |packet: RecvPacket| sink.lock().extend_from_slice(packet.payload())),
        );
        nic.receive(packet(1, 0));
        assert_eq!(*got.lock(), b"data".to_vec());
        assert_eq!(nic.stats().rx_bytes, 4);
        assert!(nic.send(b"x").is_err());
    }
}
