//! Userspace TCP/IPv4 protocol engine.
//!
//! The crate implements the hard core of a TCP/IPv4 stack: the TCP
//! connection state machine with congestion control, retransmission,
//! out-of-order buffering and window management, together with the RFC 815
//! fragment reassembler feeding it. Link-layer drivers, ARP, routing and the
//! event loop are external collaborators reached through the [`ip::IpSender`]
//! trait and the entry points on [`tcp::TcpStack`].
//!
//! The engine is single-threaded and cooperative: an event loop updates the
//! clock with [`tcp::TcpStack::set_now`], delivers datagrams and timer polls,
//! and sleeps until [`tcp::TcpStack::next_wake`].

pub mod buf;
pub mod ip;
pub mod tcp;

pub use buf::{BufRef, BufSeg};
pub use ip::defs::{IpErr, Ipv4RxInfo};
pub use tcp::usrreq::{
    ConnId, ConnectArgs, ConnectionHandler, ListenParams, ListenerHandler, ListenerId, TcpStack,
};
