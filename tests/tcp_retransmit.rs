//! Loss recovery: retransmission timeouts, fast retransmit, zero-window
//! probing and path-MTU shrinkage.

mod common;

use common::*;
use ustack::buf::BufRef;
use ustack::ip::defs::Ipv4RxInfo;
use ustack::ip::icmp::{DestUnreachMeta, ICMP4_CODE_DEST_UNREACH_FRAG_NEEDED};
use ustack::tcp::packet::{TcpFlags, TcpOptions};
use ustack::tcp::usrreq::{ConnId, TcpStack};
use ustack::ConnectArgs;

/// Connect out and complete the handshake with the given peer window.
/// Returns the connection, its events, our ISS and our local port.
fn established_client(
    tcp: &mut TcpStack<MockIp>,
    peer_window: u16,
    snd_buf: usize,
) -> (ConnId, Events, u32, u16) {
    let events = Events::new();
    let args = ConnectArgs { addr: REMOTE_ADDR, port: 80, rcv_wnd: 2048 };
    let conn = tcp
        .start_connection(&args, Box::new(RecordingConn { events: events.clone() }))
        .expect("start_connection");
    let syn = take_sent(tcp).pop().unwrap();
    let iss = syn.seq;
    let local_port = syn.src_port;

    let opts = TcpOptions { mss: Some(1460), wnd_scale: None };
    send_seg_from(
        tcp,
        80,
        local_port,
        7000,
        iss.wrapping_add(1),
        TcpFlags::SYN | TcpFlags::ACK,
        peer_window,
        Some(&opts),
        &[],
    );
    take_sent(tcp);
    assert_eq!(events.take(), vec![Event::Established]);

    tcp.set_recv_buf(conn, 4096).unwrap();
    tcp.set_snd_buf(conn, snd_buf).unwrap();
    take_sent(tcp);
    (conn, events, iss, local_port)
}

/// With a zero-delay handshake the smoothed RTT is zero and the RTO sits
/// at the configured minimum.
const MIN_RTO: u64 = 250;

#[test]
fn rto_retransmission_with_backoff() {
    let mut tcp = new_stack();
    tcp.set_now(1_000);
    let (conn, _events, iss, _port) = established_client(&mut tcp, 8192, 8192);

    let payload = vec![5u8; 1000];
    tcp.send_data(conn, &payload).unwrap();
    tcp.send_push(conn);
    tcp.set_now(1_002);
    tcp.poll();
    let first = take_sent(&mut tcp);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].payload.len(), 1000);
    let sent_at = 1_002;

    // Nothing before the RTO elapses.
    tcp.set_now(sent_at + MIN_RTO - 10);
    tcp.poll();
    assert!(take_sent(&mut tcp).is_empty());

    // First retransmission at the RTO.
    tcp.set_now(sent_at + MIN_RTO);
    tcp.poll();
    let rtx1 = take_sent(&mut tcp);
    assert_eq!(rtx1.len(), 1);
    assert_eq!(rtx1[0].seq, iss.wrapping_add(1));
    assert_eq!(rtx1[0].payload.len(), 1000);

    // The second retransmission waits a doubled RTO.
    tcp.set_now(sent_at + MIN_RTO + MIN_RTO);
    tcp.poll();
    assert!(take_sent(&mut tcp).is_empty());
    tcp.set_now(sent_at + MIN_RTO + 2 * MIN_RTO);
    tcp.poll();
    let rtx2 = take_sent(&mut tcp);
    assert_eq!(rtx2.len(), 1);
    assert_eq!(rtx2[0].seq, iss.wrapping_add(1));
}

#[test]
fn fast_retransmit_on_three_duplicate_acks() {
    let mut tcp = new_stack();
    tcp.set_now(1_000);
    let (conn, _events, iss, port) = established_client(&mut tcp, 8192, 8192);

    // Fill the pipe: three segments within the initial cwnd.
    let payload = vec![9u8; 4000];
    tcp.send_data(conn, &payload).unwrap();
    tcp.send_push(conn);
    tcp.set_now(1_002);
    tcp.poll();
    let segs = take_sent(&mut tcp);
    assert_eq!(segs.len(), 3);
    let baseline = iss.wrapping_add(1);
    assert_eq!(segs[0].seq, baseline);

    // Two duplicate ACKs at the baseline: nothing yet.
    for _ in 0..2 {
        send_seg_from(&mut tcp, 80, port, 7001, baseline, TcpFlags::ACK, 8192, None, &[]);
    }
    assert!(take_sent(&mut tcp).is_empty());

    // The third triggers fast retransmit of the first segment.
    send_seg_from(&mut tcp, 80, port, 7001, baseline, TcpFlags::ACK, 8192, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq, baseline);
    assert_eq!(sent[0].payload.len(), 1460);

    // A partial ACK during recovery triggers another retransmission from
    // the front of the send buffer (processed before snd_una advances).
    send_seg_from(
        &mut tcp,
        80,
        port,
        7001,
        baseline.wrapping_add(1460),
        TcpFlags::ACK,
        8192,
        None,
        &[],
    );
    let sent = take_sent(&mut tcp);
    assert!(!sent.is_empty());
    assert_eq!(sent[0].seq, baseline);
    assert_eq!(sent[0].payload.len(), 1460);

    // An ACK covering everything ends the episode.
    send_seg_from(
        &mut tcp,
        80,
        port,
        7001,
        baseline.wrapping_add(4000),
        TcpFlags::ACK,
        8192,
        None,
        &[],
    );
    take_sent(&mut tcp);
}

#[test]
fn zero_window_probing() {
    let mut tcp = new_stack();
    tcp.set_now(1_000);
    let (conn, _events, iss, port) = established_client(&mut tcp, 1000, 4096);

    // The peer closes its window.
    send_seg_from(&mut tcp, 80, port, 7001, iss.wrapping_add(1), TcpFlags::ACK, 0, None, &[]);
    take_sent(&mut tcp);

    // Queued data cannot move.
    let payload = vec![3u8; 100];
    tcp.send_data(conn, &payload).unwrap();
    tcp.send_push(conn);
    tcp.set_now(1_002);
    tcp.poll();
    assert!(take_sent(&mut tcp).is_empty());

    // After the RTO, exactly one 1-byte probe.
    tcp.set_now(1_002 + MIN_RTO);
    tcp.poll();
    let probes = take_sent(&mut tcp);
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].seq, iss.wrapping_add(1));
    assert_eq!(probes[0].payload.len(), 1);

    // Still zero: the next probe waits for the backed-off RTO.
    send_seg_from(&mut tcp, 80, port, 7001, iss.wrapping_add(1), TcpFlags::ACK, 0, None, &[]);
    take_sent(&mut tcp);
    tcp.set_now(1_002 + 2 * MIN_RTO);
    tcp.poll();
    assert!(take_sent(&mut tcp).is_empty());
    tcp.set_now(1_002 + 3 * MIN_RTO);
    tcp.poll();
    let probes = take_sent(&mut tcp);
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].payload.len(), 1);

    // The window opens; the rest flows.
    send_seg_from(&mut tcp, 80, port, 7001, iss.wrapping_add(2), TcpFlags::ACK, 1000, None, &[]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), 99);
}

#[test]
fn icmp_frag_needed_shrinks_mss_and_retransmits() {
    let mut tcp = new_stack();
    tcp.set_now(1_000);
    let (conn, _events, iss, port) = established_client(&mut tcp, 8192, 8192);

    let payload = vec![1u8; 2000];
    tcp.send_data(conn, &payload).unwrap();
    tcp.send_push(conn);
    tcp.set_now(1_002);
    tcp.poll();
    let segs = take_sent(&mut tcp);
    assert_eq!(segs.iter().map(|s| s.payload.len()).collect::<Vec<_>>(), vec![1460, 540]);

    // ICMP frag-needed for the first segment reports a 1000-byte path MTU.
    let du = DestUnreachMeta {
        icmp_code: ICMP4_CODE_DEST_UNREACH_FRAG_NEEDED,
        icmp_rest: [0, 0, 0x03, 0xe8],
    };
    // The embedded datagram is the one we sent: local -> remote.
    let info = Ipv4RxInfo { src_addr: LOCAL_ADDR, dst_addr: REMOTE_ADDR, iface_mtu: IFACE_MTU };
    let mut embedded = Vec::new();
    embedded.extend_from_slice(&port.to_be_bytes());
    embedded.extend_from_slice(&80u16.to_be_bytes());
    embedded.extend_from_slice(&iss.wrapping_add(1).to_be_bytes());
    tcp.handle_dest_unreach(&du, &info, BufRef::from_slice(&embedded));

    // Everything is requeued and resegmented to the reduced MSS (960).
    let sent = take_sent(&mut tcp);
    let lens: Vec<usize> = sent.iter().map(|s| s.payload.len()).collect();
    assert_eq!(lens, vec![960, 960, 80]);
    assert_eq!(sent[0].seq, iss.wrapping_add(1));
}

#[test]
fn send_error_arms_retry_timer() {
    let mut tcp = new_stack();
    tcp.set_now(1_000);
    let (conn, _events, _iss, _port) = established_client(&mut tcp, 8192, 8192);

    // The lower layer rejects the send; output backs off and retries.
    tcp.ip_mut().fail_sends_with = Some(ustack::ip::defs::IpErr::BufferFull);
    let payload = vec![4u8; 500];
    tcp.send_data(conn, &payload).unwrap();
    tcp.send_push(conn);
    tcp.set_now(1_002);
    tcp.poll();
    assert!(tcp.ip().sent.is_empty());

    tcp.ip_mut().fail_sends_with = None;
    // OutputRetryFullTicks is 100 ms.
    tcp.set_now(1_102);
    tcp.poll();
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), 500);
}
