//! The downward interface from the TCP engine to the IPv4 output path.
//!
//! Routing, the interface drivers and ARP live behind this trait. The engine
//! pre-resolves a route once per output burst with [`IpSender::prepare_send`]
//! and then emits consecutive segments through the prepared route.

use crate::buf::BufRef;
use crate::ip::defs::IpErr;
use std::net::Ipv4Addr;

/// Per-datagram send parameters.
#[derive(Debug, Clone, Copy)]
pub struct IpSendParams {
    pub ttl: u8,
    pub protocol: u8,
    /// Set DF; the engine disables fragmentation of TCP segments for PMTUD.
    pub dont_fragment: bool,
}

/// Opaque token identifying the sender of a failed datagram. When a deferred
/// condition clears (e.g. ARP resolution completes), the IP layer hands the
/// token back via `TcpStack::retry_sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryToken(pub u32);

pub trait IpSender {
    /// Routing state prepared once and reused for a burst of segments.
    type Prepared;

    /// Select the local address and interface for a remote, returning the
    /// local address and the interface MTU.
    fn select_local_addr(&mut self, remote_addr: Ipv4Addr) -> Result<(Ipv4Addr, u16), IpErr>;

    /// Whether `addr` is an address assigned to a local interface.
    fn is_local_addr(&self, addr: Ipv4Addr) -> bool;

    /// Current path MTU estimate towards `remote_addr` (>= the minimum IPv4
    /// MTU of 576).
    fn pmtu_estimate(&mut self, remote_addr: Ipv4Addr) -> u16;

    /// Pre-resolve routing for a burst of sends.
    fn prepare_send(
        &mut self,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        params: IpSendParams,
    ) -> Result<Self::Prepared, IpErr>;

    /// Send one IP payload through a prepared route.
    fn send_prepared(
        &mut self,
        prepared: &Self::Prepared,
        dgram: BufRef<'_>,
        retry: Option<RetryToken>,
    ) -> Result<(), IpErr>;

    /// Route and send one IP payload in a single step.
    fn send(
        &mut self,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        params: IpSendParams,
        dgram: BufRef<'_>,
        retry: Option<RetryToken>,
    ) -> Result<(), IpErr>;

    /// A local send failed with `FragNeeded`: clamp the PMTU estimate for
    /// `remote_addr` to the interface MTU. Returns the lowered estimate, or
    /// None if it was not lowered.
    fn handle_local_packet_too_big(&mut self, remote_addr: Ipv4Addr) -> Option<u16>;

    /// An ICMP frag-needed reported `mtu` for `remote_addr`. Returns the
    /// lowered estimate (clamped to at least the minimum MTU), or None if
    /// the estimate was not lowered.
    fn lower_pmtu(&mut self, remote_addr: Ipv4Addr, mtu: u16) -> Option<u16>;
}
