//! Shared harness for the integration tests: a mock IP layer capturing
//! emitted segments, wire-level segment builders, recording handlers and a
//! deterministic clock.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::net::Ipv4Addr;

use ustack::buf::BufRef;
use ustack::ip::defs::{IpErr, Ipv4RxInfo};
use ustack::ip::send::{IpSendParams, IpSender, RetryToken};
use ustack::tcp::defs::{TcpConfig, MIN_MTU};
use ustack::tcp::packet::{
    parse_options, segment_checksum, write_header, TcpFlags, TcpOptions, TcpSegMeta,
    TCP_HEADER_LEN,
};
use ustack::tcp::usrreq::{ConnId, ConnectionHandler, ListenerHandler, TcpStack};

pub const LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const REMOTE_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const IFACE_MTU: u16 = 1500;
pub const LOCAL_PORT: u16 = 80;
pub const REMOTE_PORT: u16 = 5555;

/// IP layer double: trivial routing, a settable PMTU, captured output and
/// injectable send errors.
pub struct MockIp {
    pub local_addr: Ipv4Addr,
    pub iface_mtu: u16,
    pub pmtu: u16,
    pub sent: Vec<Vec<u8>>,
    pub fail_sends_with: Option<IpErr>,
    pub retry_tokens: Vec<RetryToken>,
}

impl MockIp {
    pub fn new() -> Self {
        MockIp {
            local_addr: LOCAL_ADDR,
            iface_mtu: IFACE_MTU,
            pmtu: IFACE_MTU,
            sent: Vec::new(),
            fail_sends_with: None,
            retry_tokens: Vec::new(),
        }
    }

    fn capture(&mut self, dgram: BufRef<'_>, retry: Option<RetryToken>) -> Result<(), IpErr> {
        if let Some(err) = self.fail_sends_with {
            if let Some(token) = retry {
                self.retry_tokens.push(token);
            }
            return Err(err);
        }
        self.sent.push(dgram.to_vec());
        Ok(())
    }
}

impl IpSender for MockIp {
    type Prepared = (Ipv4Addr, Ipv4Addr);

    fn select_local_addr(&mut self, _remote_addr: Ipv4Addr) -> Result<(Ipv4Addr, u16), IpErr> {
        Ok((self.local_addr, self.iface_mtu))
    }

    fn is_local_addr(&self, addr: Ipv4Addr) -> bool {
        addr == self.local_addr
    }

    fn pmtu_estimate(&mut self, _remote_addr: Ipv4Addr) -> u16 {
        self.pmtu
    }

    fn prepare_send(
        &mut self,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        _params: IpSendParams,
    ) -> Result<(Ipv4Addr, Ipv4Addr), IpErr> {
        Ok((local_addr, remote_addr))
    }

    fn send_prepared(
        &mut self,
        _prepared: &(Ipv4Addr, Ipv4Addr),
        dgram: BufRef<'_>,
        retry: Option<RetryToken>,
    ) -> Result<(), IpErr> {
        self.capture(dgram, retry)
    }

    fn send(
        &mut self,
        _local_addr: Ipv4Addr,
        _remote_addr: Ipv4Addr,
        _params: IpSendParams,
        dgram: BufRef<'_>,
        retry: Option<RetryToken>,
    ) -> Result<(), IpErr> {
        self.capture(dgram, retry)
    }

    fn handle_local_packet_too_big(&mut self, _remote_addr: Ipv4Addr) -> Option<u16> {
        if self.pmtu > self.iface_mtu {
            self.pmtu = self.iface_mtu;
            Some(self.pmtu)
        } else {
            None
        }
    }

    fn lower_pmtu(&mut self, _remote_addr: Ipv4Addr, mtu: u16) -> Option<u16> {
        let mtu = mtu.max(MIN_MTU);
        if mtu < self.pmtu {
            self.pmtu = mtu;
            Some(mtu)
        } else {
            None
        }
    }
}

/// One captured segment, parsed.
#[derive(Debug, Clone)]
pub struct Seg {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub opts: TcpOptions,
    pub payload: Vec<u8>,
}

impl Seg {
    pub fn parse(bytes: &[u8]) -> Seg {
        let meta = TcpSegMeta::parse(&BufRef::from_slice(bytes)).expect("short segment");
        let opts = parse_options(BufRef::from_slice(&bytes[TCP_HEADER_LEN..meta.data_offset]));
        Seg {
            src_port: meta.src_port,
            dst_port: meta.dst_port,
            seq: meta.seq_num,
            ack: meta.ack_num,
            flags: meta.flags,
            window: meta.window_size,
            opts,
            payload: bytes[meta.data_offset..].to_vec(),
        }
    }
}

pub fn take_sent(tcp: &mut TcpStack<MockIp>) -> Vec<Seg> {
    tcp.ip_mut().sent.drain(..).map(|b| Seg::parse(&b)).collect()
}

/// Feed one segment from the peer into the stack, with a valid checksum.
pub fn send_seg(
    tcp: &mut TcpStack<MockIp>,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    opts: Option<&TcpOptions>,
    payload: &[u8],
) {
    send_seg_from(tcp, REMOTE_PORT, LOCAL_PORT, seq, ack, flags, window, opts, payload);
}

#[allow(clippy::too_many_arguments)]
pub fn send_seg_from(
    tcp: &mut TcpStack<MockIp>,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    opts: Option<&TcpOptions>,
    payload: &[u8],
) {
    let mut seg = Vec::new();
    let chksum_at = write_header(&mut seg, src_port, dst_port, seq, ack, flags, window, opts);
    seg.extend_from_slice(payload);
    let chksum = segment_checksum(REMOTE_ADDR, LOCAL_ADDR, BufRef::from_slice(&seg));
    seg[chksum_at..chksum_at + 2].copy_from_slice(&chksum.to_be_bytes());
    let info = Ipv4RxInfo { src_addr: REMOTE_ADDR, dst_addr: LOCAL_ADDR, iface_mtu: IFACE_MTU };
    tcp.recv_ip4_datagram(&info, BufRef::from_slice(&seg));
}

pub fn new_stack() -> TcpStack<MockIp> {
    new_stack_with(TcpConfig::default())
}

pub fn new_stack_with(cfg: TcpConfig) -> TcpStack<MockIp> {
    let _ = env_logger::builder().is_test(true).try_init();
    TcpStack::new(cfg, MockIp::new())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Established,
    Aborted,
    DataReceived(usize),
    DataSent(usize),
    LisEstablished,
}

#[derive(Clone, Default)]
pub struct Events(pub Rc<RefCell<Vec<Event>>>);

impl Events {
    pub fn new() -> Self {
        Events::default()
    }

    pub fn push(&self, ev: Event) {
        self.0.borrow_mut().push(ev);
    }

    pub fn take(&self) -> Vec<Event> {
        self.0.borrow_mut().drain(..).collect()
    }
}

/// Connection handler that records every callback.
pub struct RecordingConn {
    pub events: Events,
}

impl<I> ConnectionHandler<I> for RecordingConn {
    fn established(&mut self, _tcp: &mut TcpStack<I>, _conn: ConnId) {
        self.events.push(Event::Established);
    }

    fn aborted(&mut self, _tcp: &mut TcpStack<I>, _conn: ConnId) {
        self.events.push(Event::Aborted);
    }

    fn data_received(&mut self, _tcp: &mut TcpStack<I>, _conn: ConnId, amount: usize) {
        self.events.push(Event::DataReceived(amount));
    }

    fn data_sent(&mut self, _tcp: &mut TcpStack<I>, _conn: ConnId, amount: usize) {
        self.events.push(Event::DataSent(amount));
    }
}

/// Listener handler that accepts every connection, installs a recording
/// connection handler and sizes the buffers.
pub struct AcceptingLis {
    pub events: Events,
    pub conn_events: Events,
    pub accepted: Rc<RefCell<Vec<(ConnId, Vec<u8>)>>>,
    pub rcv_buf: usize,
    pub snd_buf: usize,
}

impl AcceptingLis {
    pub fn new(events: Events, conn_events: Events) -> Self {
        AcceptingLis {
            events,
            conn_events,
            accepted: Rc::new(RefCell::new(Vec::new())),
            rcv_buf: 4096,
            snd_buf: 4096,
        }
    }
}

impl<I: IpSender> ListenerHandler<I> for AcceptingLis {
    fn established(&mut self, tcp: &mut TcpStack<I>, lis: ustack::tcp::usrreq::ListenerId) {
        self.events.push(Event::LisEstablished);
        let handler = Box::new(RecordingConn { events: self.conn_events.clone() });
        match tcp.accept_connection(lis, handler) {
            Ok((conn, initial)) => {
                if self.rcv_buf > 0 {
                    tcp.set_recv_buf(conn, self.rcv_buf).expect("set_recv_buf");
                }
                if self.snd_buf > 0 {
                    tcp.set_snd_buf(conn, self.snd_buf).expect("set_snd_buf");
                }
                self.accepted.borrow_mut().push((conn, initial));
            }
            Err(err) => panic!("accept_connection failed: {err}"),
        }
    }
}
