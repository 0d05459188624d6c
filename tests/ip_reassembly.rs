//! Reassembly feeding the TCP input pipeline: fragments of a TCP segment
//! arrive out of order, the reassembled datagram is processed as one.

mod common;

use common::*;
use std::net::Ipv4Addr;
use ustack::buf::BufRef;
use ustack::ip::defs::Ipv4RxInfo;
use ustack::ip::packet::{Ipv4Header, IPV4_HEADER_LEN};
use ustack::ip::reassembly::{Ipv4Reassembly, ReassConfig};
use ustack::tcp::packet::{segment_checksum, write_header, TcpFlags};
use ustack::tcp::usrreq::ListenParams;

fn fragment_header(
    ident: u16,
    src_addr: Ipv4Addr,
    more: bool,
    offset: u16,
    payload_len: u16,
) -> [u8; IPV4_HEADER_LEN] {
    let header = Ipv4Header {
        dscp_ecn: 0,
        total_len: IPV4_HEADER_LEN as u16 + payload_len,
        ident,
        dont_fragment: false,
        more_fragments: more,
        fragment_offset: offset,
        ttl: 64,
        protocol: 6,
        checksum: 0,
        src_addr,
        dst_addr: LOCAL_ADDR,
    };
    let mut bytes = [0u8; IPV4_HEADER_LEN];
    header.write(&mut bytes);
    bytes
}

#[test]
fn fragmented_tcp_segment_reaches_the_engine() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let mut reass = Ipv4Reassembly::new(ReassConfig::default());

    // Server-side established connection.
    let lis_events = Events::new();
    let conn_events = Events::new();
    let mut handler = AcceptingLis::new(lis_events, conn_events.clone());
    handler.rcv_buf = 4096;
    let accepted = handler.accepted.clone();
    let params = ListenParams { port: LOCAL_PORT, initial_rcv_wnd: 2048, ..Default::default() };
    tcp.start_listening(&params, Box::new(handler)).unwrap();
    send_seg(&mut tcp, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let iss = take_sent(&mut tcp).pop().unwrap().seq;
    send_seg(&mut tcp, 1001, iss.wrapping_add(1), TcpFlags::ACK, 8192, None, &[]);
    take_sent(&mut tcp);
    let conn = accepted.borrow()[0].0;

    // A 1464-byte TCP segment (1444 bytes of data), fragmented on 8-byte
    // aligned boundaries.
    let payload: Vec<u8> = (0..1444u16).map(|i| i as u8).collect();
    let mut segment = Vec::new();
    let chksum_at = write_header(
        &mut segment,
        REMOTE_PORT,
        LOCAL_PORT,
        1001,
        iss.wrapping_add(1),
        TcpFlags::ACK,
        8192,
        None,
    );
    segment.extend_from_slice(&payload);
    let chksum = segment_checksum(REMOTE_ADDR, LOCAL_ADDR, BufRef::from_slice(&segment));
    segment[chksum_at..chksum_at + 2].copy_from_slice(&chksum.to_be_bytes());
    assert_eq!(segment.len(), 1464);

    // First, last, middle: the classic out-of-order arrival.
    let pieces = [
        (0u16, true, &segment[0..496]),
        (992u16, false, &segment[992..1464]),
        (496u16, true, &segment[496..992]),
    ];

    let mut completed = None;
    for (offset, more, piece) in pieces {
        let header = fragment_header(42, REMOTE_ADDR, more, offset, piece.len() as u16);
        let result = reass.reassemble(
            tcp.now(),
            42,
            REMOTE_ADDR,
            LOCAL_ADDR,
            6,
            64,
            more,
            offset,
            &header,
            BufRef::from_slice(piece),
        );
        if let Some(dgram) = result {
            completed = Some(dgram.to_vec());
        }
    }

    let dgram = completed.expect("datagram reassembled after the last piece");
    assert_eq!(dgram, segment);

    // The reassembled datagram flows into the TCP input like any other.
    let info = Ipv4RxInfo { src_addr: REMOTE_ADDR, dst_addr: LOCAL_ADDR, iface_mtu: IFACE_MTU };
    tcp.recv_ip4_datagram(&info, BufRef::from_slice(&dgram));

    assert_eq!(conn_events.take(), vec![Event::DataReceived(1444)]);
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ack, 1001 + 1444);

    let mut buf = vec![0u8; 2048];
    assert_eq!(tcp.recv_data(conn, &mut buf), 1444);
    assert_eq!(&buf[..1444], &payload[..]);
}

#[test]
fn unrelated_flows_do_not_mix() {
    let mut reass = Ipv4Reassembly::new(ReassConfig { max_entries: 2, ..Default::default() });
    let other_src = Ipv4Addr::new(10, 0, 0, 77);

    let a: Vec<u8> = vec![0xaa; 64];
    let b: Vec<u8> = vec![0xbb; 64];

    // Same ident from two different sources must reassemble separately.
    let header_a = fragment_header(9, REMOTE_ADDR, true, 0, 32);
    assert!(reass
        .reassemble(0, 9, REMOTE_ADDR, LOCAL_ADDR, 6, 64, true, 0, &header_a, BufRef::from_slice(&a[..32]))
        .is_none());
    let header_b = fragment_header(9, other_src, true, 0, 32);
    assert!(reass
        .reassemble(0, 9, other_src, LOCAL_ADDR, 6, 64, true, 0, &header_b, BufRef::from_slice(&b[..32]))
        .is_none());

    let header_b2 = fragment_header(9, other_src, false, 32, 32);
    let done_b = reass
        .reassemble(1, 9, other_src, LOCAL_ADDR, 6, 64, false, 32, &header_b2, BufRef::from_slice(&b[32..]))
        .expect("flow B completes")
        .to_vec();
    assert_eq!(done_b, b);

    let header_a2 = fragment_header(9, REMOTE_ADDR, false, 32, 32);
    let done_a = reass
        .reassemble(2, 9, REMOTE_ADDR, LOCAL_ADDR, 6, 64, false, 32, &header_a2, BufRef::from_slice(&a[32..]))
        .expect("flow A completes")
        .to_vec();
    assert_eq!(done_a, a);
}
