//! Static fabric topology
//!
//! Terminals are the traffic sources and sinks attached to the fabric.
//! Every common fifo of the fabric is a fixed route between two terminals
//! and belongs to exactly one endpoint: fifos flowing into the accelerator
//! are the endpoint's send fifo, the others its receive fifo.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of common fifos in the fabric register file
pub const FIFO_COUNT: usize = 30;

/// Number of logical endpoints
pub const ENDPOINT_COUNT: usize = 15;

/// Hardware terminal identifiers as they appear in descriptors
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Usb = 1,
    ApIp = 2,
    ApEth = 3,
    Vcp = 4,
    Vap0 = 5,
    Pcie0 = 6,
    PcieLocalCtrl0 = 7,
    PcieLocalCtrl1 = 8,
    PcieLocalCtrl2 = 9,
    PcieLocalCtrl3 = 10,
    PcieRemoteCtrl0 = 11,
    PcieRemoteCtrl1 = 12,
    PcieRemoteCtrl2 = 13,
    PcieRemoteCtrl3 = 14,
    Sdio0 = 15,
    Wifi = 16,
}

impl Terminal {
    /// Raw id written into descriptors
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Look up a terminal from a raw descriptor id
    pub fn from_id(id: u8) -> Option<Self> {
        use Terminal::*;
        let terminal = match id {
            1 => Usb,
            2 => ApIp,
            3 => ApEth,
            4 => Vcp,
            5 => Vap0,
            6 => Pcie0,
            7 => PcieLocalCtrl0,
            8 => PcieLocalCtrl1,
            9 => PcieLocalCtrl2,
            10 => PcieLocalCtrl3,
            11 => PcieRemoteCtrl0,
            12 => PcieRemoteCtrl1,
            13 => PcieRemoteCtrl2,
            14 => PcieRemoteCtrl3,
            15 => Sdio0,
            16 => Wifi,
            _ => return None,
        };
        Some(terminal)
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.id())
    }
}

bitflags::bitflags! {
    /// Set of source terminals a NIC accepts traffic from
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TermMask: u32 {
        const USB = 1 << (Terminal::Usb as u32);
        const AP_IP = 1 << (Terminal::ApIp as u32);
        const AP_ETH = 1 << (Terminal::ApEth as u32);
        const VCP = 1 << (Terminal::Vcp as u32);
        const VAP0 = 1 << (Terminal::Vap0 as u32);
        const PCIE0 = 1 << (Terminal::Pcie0 as u32);
        const PCIE_LOCAL_CTRL0 = 1 << (Terminal::PcieLocalCtrl0 as u32);
        const PCIE_LOCAL_CTRL1 = 1 << (Terminal::PcieLocalCtrl1 as u32);
        const PCIE_LOCAL_CTRL2 = 1 << (Terminal::PcieLocalCtrl2 as u32);
        const PCIE_LOCAL_CTRL3 = 1 << (Terminal::PcieLocalCtrl3 as u32);
        const PCIE_REMOTE_CTRL0 = 1 << (Terminal::PcieRemoteCtrl0 as u32);
        const PCIE_REMOTE_CTRL1 = 1 << (Terminal::PcieRemoteCtrl1 as u32);
        const PCIE_REMOTE_CTRL2 = 1 << (Terminal::PcieRemoteCtrl2 as u32);
        const PCIE_REMOTE_CTRL3 = 1 << (Terminal::PcieRemoteCtrl3 as u32);
        const SDIO0 = 1 << (Terminal::Sdio0 as u32);
        const WIFI = 1 << (Terminal::Wifi as u32);
    }
}

impl TermMask {
    /// Mask bit for a raw terminal id; ids outside the mask width map to nothing
    pub fn from_terminal_id(id: u8) -> Self {
        if (id as u32) < u32::BITS {
            Self::from_bits_retain(1 << id)
        } else {
            Self::empty()
        }
    }

    /// Whether traffic from `source_id` passes this mask
    pub fn accepts(&self, source_id: u8) -> bool {
        self.intersects(Self::from_terminal_id(source_id))
    }
}

impl From<Terminal> for TermMask {
    fn from(terminal: Terminal) -> Self {
        Self::from_terminal_id(terminal.id())
    }
}

/// Logical endpoint identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointId {
    Usb = 0,
    ApIp,
    ApEth,
    Vcp,
    Pcie,
    PcieCtrl0,
    PcieCtrl1,
    PcieCtrl2,
    PcieCtrl3,
    RemotePcieCtrl0,
    RemotePcieCtrl1,
    RemotePcieCtrl2,
    RemotePcieCtrl3,
    Sdio,
    Wifi,
}

impl EndpointId {
    pub const ALL: [EndpointId; ENDPOINT_COUNT] = [
        EndpointId::Usb,
        EndpointId::ApIp,
        EndpointId::ApEth,
        EndpointId::Vcp,
        EndpointId::Pcie,
        EndpointId::PcieCtrl0,
        EndpointId::PcieCtrl1,
        EndpointId::PcieCtrl2,
        EndpointId::PcieCtrl3,
        EndpointId::RemotePcieCtrl0,
        EndpointId::RemotePcieCtrl1,
        EndpointId::RemotePcieCtrl2,
        EndpointId::RemotePcieCtrl3,
        EndpointId::Sdio,
        EndpointId::Wifi,
    ];

    /// Terminal that sources this endpoint's traffic
    pub fn source_terminal(self) -> Terminal {
        match self {
            EndpointId::Usb => Terminal::Usb,
            EndpointId::ApIp => Terminal::ApIp,
            EndpointId::ApEth => Terminal::ApEth,
            EndpointId::Vcp => Terminal::Vcp,
            EndpointId::Pcie => Terminal::Pcie0,
            EndpointId::PcieCtrl0 => Terminal::PcieLocalCtrl0,
            EndpointId::PcieCtrl1 => Terminal::PcieLocalCtrl1,
            EndpointId::PcieCtrl2 => Terminal::PcieLocalCtrl2,
            EndpointId::PcieCtrl3 => Terminal::PcieLocalCtrl3,
            EndpointId::RemotePcieCtrl0 => Terminal::PcieRemoteCtrl0,
            EndpointId::RemotePcieCtrl1 => Terminal::PcieRemoteCtrl1,
            EndpointId::RemotePcieCtrl2 => Terminal::PcieRemoteCtrl2,
            EndpointId::RemotePcieCtrl3 => Terminal::PcieRemoteCtrl3,
            EndpointId::Sdio => Terminal::Sdio0,
            EndpointId::Wifi => Terminal::Wifi,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Common fifo identifiers, in register-file order
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FifoId {
    UsbUl = 0,
    SdioUl,
    ApIpUl,
    PcieUl,
    RemotePcie0Ul,
    RemotePcie1Ul,
    RemotePcie2Ul,
    RemotePcie3Ul,
    ApEthDl,
    LocalPcie0Dl,
    LocalPcie1Dl,
    LocalPcie2Dl,
    LocalPcie3Dl,
    WifiUl,
    CpDl,
    UsbDl,
    SdioDl,
    ApIpDl,
    PcieDl,
    RemotePcie0Dl,
    RemotePcie1Dl,
    RemotePcie2Dl,
    RemotePcie3Dl,
    ApEthUl,
    LocalPcie0Ul,
    LocalPcie1Ul,
    LocalPcie2Ul,
    LocalPcie3Ul,
    WifiDl,
    CpUl,
}

impl FifoId {
    pub const ALL: [FifoId; FIFO_COUNT] = [
        FifoId::UsbUl,
        FifoId::SdioUl,
        FifoId::ApIpUl,
        FifoId::PcieUl,
        FifoId::RemotePcie0Ul,
        FifoId::RemotePcie1Ul,
        FifoId::RemotePcie2Ul,
        FifoId::RemotePcie3Ul,
        FifoId::ApEthDl,
        FifoId::LocalPcie0Dl,
        FifoId::LocalPcie1Dl,
        FifoId::LocalPcie2Dl,
        FifoId::LocalPcie3Dl,
        FifoId::WifiUl,
        FifoId::CpDl,
        FifoId::UsbDl,
        FifoId::SdioDl,
        FifoId::ApIpDl,
        FifoId::PcieDl,
        FifoId::RemotePcie0Dl,
        FifoId::RemotePcie1Dl,
        FifoId::RemotePcie2Dl,
        FifoId::RemotePcie3Dl,
        FifoId::ApEthUl,
        FifoId::LocalPcie0Ul,
        FifoId::LocalPcie1Ul,
        FifoId::LocalPcie2Ul,
        FifoId::LocalPcie3Ul,
        FifoId::WifiDl,
        FifoId::CpUl,
    ];

    /// Position of the fifo in the register file
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Static route description of this fifo
    pub fn route(self) -> &'static FifoRoute {
        &FIFO_ROUTES[self.index()]
    }
}

impl fmt::Display for FifoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self, self.index())
    }
}

/// Static description of one common fifo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoRoute {
    pub fifo: FifoId,
    /// Configuration property naming the ring the hardware writes to
    pub tx_name: &'static str,
    /// Configuration property naming the ring the hardware reads from
    pub rx_name: &'static str,
    pub endpoint: EndpointId,
    pub src: Terminal,
    pub dst: Terminal,
    /// Traffic flows into the accelerator (the endpoint's send fifo)
    pub to_ipa: bool,
    /// Hardware pass-through endpoint
    pub pam: bool,
}

impl FifoRoute {
    /// A receiving fifo delivers completions to software
    pub fn is_recv(&self) -> bool {
        !self.to_ipa
    }
}

macro_rules! route {
    ($fifo:ident, $tx:literal, $rx:literal, $ep:ident, $src:ident, $dst:ident, $to_ipa:literal, $pam:literal) => {
        FifoRoute {
            fifo: FifoId::$fifo,
            tx_name: $tx,
            rx_name: $rx,
            endpoint: EndpointId::$ep,
            src: Terminal::$src,
            dst: Terminal::$dst,
            to_ipa: $to_ipa,
            pam: $pam,
        }
    };
}

/// Route table indexed by [`FifoId::index`]
pub static FIFO_ROUTES: [FifoRoute; FIFO_COUNT] = [
    route!(UsbUl, "usb-ul-tx", "usb-ul-rx", Usb, Usb, ApEth, true, true),
    route!(SdioUl, "sdio-ul-tx", "sdio-ul-rx", Sdio, Sdio0, ApIp, true, false),
    route!(ApIpUl, "ap-ip-ul-tx", "ap-ip-ul-rx", ApIp, ApIp, Vap0, true, false),
    route!(PcieUl, "pcie-ul-tx", "pcie-ul-rx", Pcie, Pcie0, Vap0, false, false),
    route!(RemotePcie0Ul, "remote-pcie0-ul-tx", "remote-pcie0-ul-rx", RemotePcieCtrl0, PcieRemoteCtrl0, ApIp, true, false),
    route!(RemotePcie1Ul, "remote-pcie1-ul-tx", "remote-pcie1-ul-rx", RemotePcieCtrl1, PcieRemoteCtrl1, ApIp, true, false),
    route!(RemotePcie2Ul, "remote-pcie2-ul-tx", "remote-pcie2-ul-rx", RemotePcieCtrl2, PcieRemoteCtrl2, ApIp, true, false),
    route!(RemotePcie3Ul, "remote-pcie3-ul-tx", "remote-pcie3-ul-rx", RemotePcieCtrl3, PcieRemoteCtrl3, ApIp, true, false),
    route!(ApEthDl, "ap-eth-dl-tx", "ap-eth-dl-rx", ApEth, ApEth, Usb, true, false),
    route!(LocalPcie0Dl, "local-pcie0-dl-tx", "local-pcie0-dl-rx", PcieCtrl0, PcieLocalCtrl0, ApIp, false, false),
    route!(LocalPcie1Dl, "local-pcie1-dl-tx", "local-pcie1-dl-rx", PcieCtrl1, PcieLocalCtrl1, ApIp, false, false),
    route!(LocalPcie2Dl, "local-pcie2-dl-tx", "local-pcie2-dl-rx", PcieCtrl2, PcieLocalCtrl2, ApIp, false, false),
    route!(LocalPcie3Dl, "local-pcie3-dl-tx", "local-pcie3-dl-rx", PcieCtrl3, PcieLocalCtrl3, ApIp, false, false),
    route!(WifiUl, "wifi-ul-tx", "wifi-ul-rx", Wifi, Wifi, ApEth, false, true),
    route!(CpDl, "cp-dl-tx", "cp-dl-rx", Vcp, Vap0, ApIp, true, true),
    route!(UsbDl, "usb-dl-tx", "usb-dl-rx", Usb, Usb, ApEth, false, true),
    route!(SdioDl, "sdio-dl-tx", "sdio-dl-rx", Sdio, Sdio0, ApEth, false, false),
    route!(ApIpDl, "ap-ip-dl-tx", "ap-ip-dl-rx", ApIp, ApIp, Vap0, false, false),
    route!(PcieDl, "pcie-dl-tx", "pcie-dl-rx", Pcie, ApEth, Usb, false, false),
    route!(RemotePcie0Dl, "remote-pcie0-dl-tx", "remote-pcie0-dl-rx", RemotePcieCtrl0, PcieRemoteCtrl0, ApIp, false, false),
    route!(RemotePcie1Dl, "remote-pcie1-dl-tx", "remote-pcie1-dl-rx", RemotePcieCtrl1, PcieRemoteCtrl1, ApIp, false, false),
    route!(RemotePcie2Dl, "remote-pcie2-dl-tx", "remote-pcie2-dl-rx", RemotePcieCtrl2, PcieRemoteCtrl2, ApIp, false, false),
    route!(RemotePcie3Dl, "remote-pcie3-dl-tx", "remote-pcie3-dl-rx", RemotePcieCtrl3, PcieRemoteCtrl3, ApIp, false, false),
    route!(ApEthUl, "ap-eth-ul-tx", "ap-eth-ul-rx", ApEth, ApEth, Usb, false, false),
    route!(LocalPcie0Ul, "local-pcie0-ul-tx", "local-pcie0-ul-rx", PcieCtrl0, PcieLocalCtrl0, Vcp, false, false),
    route!(LocalPcie1Ul, "local-pcie1-ul-tx", "local-pcie1-ul-rx", PcieCtrl1, PcieLocalCtrl1, Vcp, false, false),
    route!(LocalPcie2Ul, "local-pcie2-ul-tx", "local-pcie2-ul-rx", PcieCtrl2, PcieLocalCtrl2, Vcp, false, false),
    route!(LocalPcie3Ul, "local-pcie3-ul-tx", "local-pcie3-ul-rx", PcieCtrl3, PcieLocalCtrl3, Vcp, false, false),
    route!(WifiDl, "wifi-dl-tx", "wifi-dl-rx", Wifi, Wifi, ApEth, true, true),
    route!(CpUl, "cp-ul-tx", "cp-ul-rx", Vcp, Vap0, Vcp, false, true),
];

/// Find a fifo by either of its configuration property names
pub fn fifo_by_name(name: &str) -> Option<FifoId> {
    FIFO_ROUTES
        .iter()
        .find(|route| route.tx_name == name || route.rx_name == name)
        .map(|route| route.fifo)
}

/// Fifos belonging to `endpoint`, in register-file order
pub fn fifos_of(endpoint: EndpointId) -> impl Iterator<Item = &'static FifoRoute> {
    FIFO_ROUTES
        .iter()
        .filter(move |route| route.endpoint == endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table_is_indexed_by_fifo() {
        for (index, route) in FIFO_ROUTES.iter().enumerate() {
            assert_eq!(route.fifo.index(), index);
            assert_eq!(FifoId::ALL[index], route.fifo);
        }
    }

    #[test]
    fn test_routes_never_loop() {
        for route in FIFO_ROUTES.iter() {
            assert_ne!(route.src, route.dst, "{} loops", route.fifo);
        }
    }

    #[test]
    fn test_terminal_ids_round_trip() {
        for id in 0..=32u8 {
            if let Some(terminal) = Terminal::from_id(id) {
                assert_eq!(terminal.id(), id);
            }
        }
        assert_eq!(Terminal::from_id(0), None);
        assert_eq!(Terminal::from_id(17), None);
    }

    #[test]
    fn test_term_mask() {
        let mask = TermMask::USB | TermMask::WIFI;
        assert!(mask.accepts(Terminal::Usb.id()));
        assert!(mask.accepts(Terminal::Wifi.id()));
        assert!(!mask.accepts(Terminal::Sdio0.id()));
        assert!(!mask.accepts(200));
        assert_eq!(TermMask::from(Terminal::ApEth), TermMask::AP_ETH);
    }

    #[test]
    fn test_endpoint_fifos() {
        let fifos: Vec<FifoId> = fifos_of(EndpointId::ApEth).map(|r| r.fifo).collect();
        assert_eq!(fifos, vec![FifoId::ApEthDl, FifoId::ApEthUl]);
        assert!(FifoId::ApEthDl.route().to_ipa);
        assert!(FifoId::ApEthUl.route().is_recv());
        assert_eq!(fifo_by_name("ap-eth-ul-rx"), Some(FifoId::ApEthUl));
        assert_eq!(fifo_by_name("nonexistent"), None);
    }
}
