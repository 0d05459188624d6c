use std::net::Ipv4Addr;
use thiserror::Error;

// https://www.iana.org/assignments/protocol-numbers/protocol-numbers.xhtml
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Ipv4Type {
    // 8 bit
    ICMP = 0x1,
    TCP = 0x6,
    UDP = 0x11,
    Unknown,
}

impl From<u8> for Ipv4Type {
    fn from(value: u8) -> Self {
        match value {
            v if v == Ipv4Type::ICMP as u8 => Ipv4Type::ICMP,
            v if v == Ipv4Type::TCP as u8 => Ipv4Type::TCP,
            v if v == Ipv4Type::UDP as u8 => Ipv4Type::UDP,
            _ => Ipv4Type::Unknown,
        }
    }
}

impl From<Ipv4Type> for u8 {
    fn from(e: Ipv4Type) -> Self {
        e as u8
    }
}

/// Errors surfaced across the engine interfaces.
///
/// Protocol-level anomalies (bad checksums, malformed options, unacceptable
/// segments, reassembly failures) never surface as errors; they are recovered
/// silently inside the engine. These kinds cover synchronous setup failures
/// and lower-layer send outcomes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpErr {
    #[error("no PCB available and no eviction candidate")]
    NoPcbAvail,
    #[error("no ephemeral port available")]
    NoPortAvail,
    #[error("send queue momentarily full in the lower layer")]
    BufferFull,
    #[error("datagram exceeds the path MTU")]
    FragNeeded,
    #[error("no route to the destination")]
    NoRoute,
    #[error("link-layer address not resolved, retry deferred")]
    NoArp,
    #[error("listener is not listening")]
    NotListening,
    #[error("address is already in use")]
    AlreadyConnected,
    #[error("operation invalid in the current state")]
    BadState,
}

/// Information about a received IPv4 datagram, as provided by the IP input
/// path: addressing plus the MTU of the interface it arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4RxInfo {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub iface_mtu: u16,
}

/// Check that an address is acceptable as a unicast source address.
pub fn is_unicast_src_addr(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast())
}
