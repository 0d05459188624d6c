//! Handshake, demultiplexing and PCB pool scenarios.

mod common;

use common::*;
use std::net::Ipv4Addr;
use ustack::tcp::defs::TcpConfig;
use ustack::tcp::packet::{TcpFlags, TcpOptions};
use ustack::tcp::usrreq::{ConnectArgs, ListenParams, TcpStack};
use ustack::tcp::TcpStatus;
use ustack::ip::defs::IpErr;

fn listen(
    tcp: &mut TcpStack<MockIp>,
    initial_rcv_wnd: usize,
) -> (Events, Events, std::rc::Rc<std::cell::RefCell<Vec<(ustack::ConnId, Vec<u8>)>>>) {
    let lis_events = Events::new();
    let conn_events = Events::new();
    let handler = AcceptingLis::new(lis_events.clone(), conn_events.clone());
    let accepted = handler.accepted.clone();
    let params = ListenParams {
        addr: Ipv4Addr::UNSPECIFIED,
        port: LOCAL_PORT,
        initial_rcv_wnd,
        ..Default::default()
    };
    tcp.start_listening(&params, Box::new(handler)).expect("start_listening");
    (lis_events, conn_events, accepted)
}

#[test]
fn server_handshake() {
    let mut tcp = new_stack();
    tcp.set_now(100);
    let (lis_events, _conn_events, accepted) = listen(&mut tcp, 2048);

    // Peer opens with SYN carrying MSS and window scale.
    let opts = TcpOptions { mss: Some(1460), wnd_scale: Some(7) };
    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, Some(&opts), &[]);

    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    let syn_ack = &sent[0];
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(syn_ack.ack, 1001);
    assert_eq!(syn_ack.window, 2048);
    // MSS derived from the interface MTU; our scale factor mirrors back.
    assert_eq!(syn_ack.opts.mss, Some(1460));
    assert_eq!(syn_ack.opts.wnd_scale, Some(6));
    let iss = syn_ack.seq;

    // Nothing visible to the application yet.
    assert!(lis_events.take().is_empty());

    // Final ACK of the handshake.
    send_seg(&mut tcp, 1001, iss.wrapping_add(1), TcpFlags::ACK, 8192, None, &[]);

    assert_eq!(lis_events.take(), vec![Event::LisEstablished]);
    let accepted = accepted.borrow();
    assert_eq!(accepted.len(), 1);
    let (conn, initial) = &accepted[0];
    assert!(initial.is_empty());
    assert_eq!(tcp.conn_status(*conn), Some(TcpStatus::Established));
    let ((laddr, lport), (raddr, rport)) = tcp.conn_endpoints(*conn).unwrap();
    assert_eq!((laddr, lport), (LOCAL_ADDR, LOCAL_PORT));
    assert_eq!((raddr, rport), (REMOTE_ADDR, REMOTE_PORT));
}

#[test]
fn client_handshake() {
    let mut tcp = new_stack();
    tcp.set_now(50);

    let events = Events::new();
    let args = ConnectArgs { addr: REMOTE_ADDR, port: 80, rcv_wnd: 2048 };
    let conn = tcp
        .start_connection(&args, Box::new(RecordingConn { events: events.clone() }))
        .expect("start_connection");
    assert_eq!(tcp.conn_status(conn), Some(TcpStatus::SynSent));

    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    let syn = &sent[0];
    assert_eq!(syn.flags, TcpFlags::SYN);
    assert_eq!(syn.dst_port, 80);
    assert_eq!(syn.opts.mss, Some(1460));
    assert_eq!(syn.opts.wnd_scale, Some(6));
    // One count of window is reserved for receiving the SYN.
    assert_eq!(syn.window, 2049);
    let iss = syn.seq;
    let local_port = syn.src_port;

    // SYN-ACK from the peer (no window scaling on its side).
    let opts = TcpOptions { mss: Some(1460), wnd_scale: None };
    send_seg_from(
        &mut tcp,
        80,
        local_port,
        7000,
        iss.wrapping_add(1),
        TcpFlags::SYN | TcpFlags::ACK,
        8192,
        Some(&opts),
        &[],
    );

    assert_eq!(events.take(), vec![Event::Established]);
    assert_eq!(tcp.conn_status(conn), Some(TcpStatus::Established));

    // The handshake-completing ACK went out.
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::ACK);
    assert_eq!(sent[0].seq, iss.wrapping_add(1));
    assert_eq!(sent[0].ack, 7001);
}

#[test]
fn rst_reply_when_no_socket() {
    let mut tcp = new_stack();
    tcp.set_now(1);

    // An ACK to nowhere: RST with seq = received ack, no ACK flag.
    send_seg_from(&mut tcp, 4444, 9999, 555, 777, TcpFlags::ACK, 1024, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::RST);
    assert_eq!(sent[0].seq, 777);
    assert_eq!(sent[0].dst_port, 4444);

    // A SYN to nowhere: RST+ACK covering the SYN's sequence count.
    send_seg_from(&mut tcp, 4444, 9999, 1000, 0, TcpFlags::SYN, 1024, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(sent[0].seq, 0);
    assert_eq!(sent[0].ack, 1001);

    // An RST to nowhere is ignored.
    send_seg_from(&mut tcp, 4444, 9999, 1000, 0, TcpFlags::RST, 1024, None, &[]);
    assert!(take_sent(&mut tcp).is_empty());
}

#[test]
fn listener_reset_stops_listening() {
    let mut tcp = new_stack();
    tcp.set_now(1);

    let lis_events = Events::new();
    let conn_events = Events::new();
    let handler = AcceptingLis::new(lis_events.clone(), conn_events);
    let params = ListenParams { port: LOCAL_PORT, ..Default::default() };
    let lis = tcp.start_listening(&params, Box::new(handler)).unwrap();

    // A second listener on the same address and port is refused.
    let handler2 = AcceptingLis::new(Events::new(), Events::new());
    assert_eq!(
        tcp.start_listening(&params, Box::new(handler2)).unwrap_err(),
        IpErr::AlreadyConnected
    );

    tcp.reset_listener(lis);

    // With the listener gone a SYN gets the no-socket treatment.
    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].flags.contains(TcpFlags::RST));
    assert!(lis_events.take().is_empty());
}

#[test]
fn listener_reset_aborts_pending_handshakes() {
    let mut tcp = new_stack();
    tcp.set_now(1);

    let lis_events = Events::new();
    let handler = AcceptingLis::new(lis_events.clone(), Events::new());
    let params = ListenParams { port: LOCAL_PORT, initial_rcv_wnd: 1024, ..Default::default() };
    let lis = tcp.start_listening(&params, Box::new(handler)).unwrap();

    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let syn_ack = take_sent(&mut tcp).pop().unwrap();

    // Resetting the listener quietly drops the half-open handshake.
    tcp.reset_listener(lis);
    assert!(take_sent(&mut tcp).is_empty());

    // The peer's final ACK now hits no PCB and no listener.
    send_seg(&mut tcp, 1001, syn_ack.seq.wrapping_add(1), TcpFlags::ACK, 8192, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::RST);
    assert!(lis_events.take().is_empty());
}

#[test]
fn pcb_eviction_by_new_syn() {
    let cfg = TcpConfig { num_pcbs: 2, ..Default::default() };
    let mut tcp = new_stack_with(cfg);
    tcp.set_now(1);
    let (_lis_events, _conn_events, accepted) = listen(&mut tcp, 1024);

    // Two established connections, then abandoned by the application so
    // their PCBs sit unreferenced, draining their FINs.
    for port in [6001u16, 6002] {
        send_seg_from(&mut tcp, port, LOCAL_PORT, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
        let syn_ack = take_sent(&mut tcp).pop().unwrap();
        send_seg_from(
            &mut tcp,
            port,
            LOCAL_PORT,
            1001,
            syn_ack.seq.wrapping_add(1),
            TcpFlags::ACK,
            8192,
            None,
            &[],
        );
    }
    let conns: Vec<_> = accepted.borrow().iter().map(|(c, _)| *c).collect();
    assert_eq!(conns.len(), 2);
    for conn in conns {
        tcp.reset_connection(conn);
    }
    tcp.set_now(10);
    tcp.poll(); // the abandoned PCBs emit their FINs
    take_sent(&mut tcp);

    // A third handshake must evict the oldest unreferenced PCB with RST.
    send_seg_from(&mut tcp, 6003, LOCAL_PORT, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 2);
    assert!(sent[0].flags.contains(TcpFlags::RST));
    assert!(matches!(sent[0].dst_port, 6001 | 6002));
    assert_eq!(sent[1].flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(sent[1].dst_port, 6003);
}

#[test]
fn syn_retransmission_in_syn_rcvd() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (_lis_events, _conn_events, _) = listen(&mut tcp, 1024);

    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let first = take_sent(&mut tcp).pop().unwrap();

    // The peer did not see our SYN-ACK and retransmits its SYN.
    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let second = take_sent(&mut tcp).pop().unwrap();
    assert_eq!(second.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(second.seq, first.seq);
    assert_eq!(second.ack, 1001);
}

#[test]
fn small_peer_mss_is_refused() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (_lis_events, _conn_events, _) = listen(&mut tcp, 1024);

    // An MSS below the minimum we operate with refuses the connection.
    let opts = TcpOptions { mss: Some(100), wnd_scale: None };
    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, Some(&opts), &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].flags.contains(TcpFlags::RST));
}

#[test]
fn syn_retry_after_arp_defer() {
    let mut tcp = new_stack();
    tcp.set_now(1);

    // The first SYN fails with a deferred ARP resolution.
    tcp.ip_mut().fail_sends_with = Some(IpErr::NoArp);
    let events = Events::new();
    let args = ConnectArgs { addr: REMOTE_ADDR, port: 80, rcv_wnd: 1024 };
    let conn = tcp
        .start_connection(&args, Box::new(RecordingConn { events }))
        .expect("start_connection");
    assert!(take_sent(&mut tcp).is_empty());
    let token = *tcp.ip().retry_tokens.last().expect("retry token registered");

    // Resolution completes; the IP layer kicks the retry.
    tcp.ip_mut().fail_sends_with = None;
    tcp.retry_sending(token);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, TcpFlags::SYN);
    assert_eq!(tcp.conn_status(conn), Some(TcpStatus::SynSent));
}

#[test]
fn simultaneous_open_is_rejected() {
    let mut tcp = new_stack();
    tcp.set_now(1);

    let events = Events::new();
    let args = ConnectArgs { addr: REMOTE_ADDR, port: 80, rcv_wnd: 1024 };
    let _conn = tcp
        .start_connection(&args, Box::new(RecordingConn { events }))
        .expect("start_connection");
    let syn = take_sent(&mut tcp).pop().unwrap();

    // A SYN (without ACK) crossing ours draws an RST.
    send_seg_from(&mut tcp, 80, syn.src_port, 9000, 0, TcpFlags::SYN, 4096, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].flags.contains(TcpFlags::RST));
    assert_eq!(sent[0].ack, 9001);
}
