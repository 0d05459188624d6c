//! Listen-queue behavior: pre-accept buffering, dispatch order, entry
//! timeout and capacity.

mod common;

use common::*;
use std::cell::RefCell;
use std::rc::Rc;
use ustack::tcp::packet::TcpFlags;
use ustack::tcp::usrreq::{ListenParams, TcpStack};
use ustack::tcp::TcpStatus;

const QUEUE_TIMEOUT: u64 = 5_000;

fn queued_listener(
    tcp: &mut TcpStack<MockIp>,
    queue_size: usize,
) -> (Events, Events, Rc<RefCell<Vec<(ustack::ConnId, Vec<u8>)>>>) {
    let lis_events = Events::new();
    let conn_events = Events::new();
    let mut handler = AcceptingLis::new(lis_events.clone(), conn_events.clone());
    handler.rcv_buf = 2048;
    handler.snd_buf = 2048;
    let accepted = handler.accepted.clone();
    let params = ListenParams {
        port: LOCAL_PORT,
        queue_size,
        queue_timeout_ticks: QUEUE_TIMEOUT,
        queue_rx_buf_size: 512,
        ..Default::default()
    };
    tcp.start_listening(&params, Box::new(handler)).unwrap();
    (lis_events, conn_events, accepted)
}

fn handshake(tcp: &mut TcpStack<MockIp>, src_port: u16) -> u32 {
    send_seg_from(tcp, src_port, LOCAL_PORT, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let syn_ack = take_sent(tcp).pop().unwrap();
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    // The queued mode announces the entry buffer as the initial window.
    assert_eq!(syn_ack.window, 512);
    let iss = syn_ack.seq;
    send_seg_from(
        tcp,
        src_port,
        LOCAL_PORT,
        1001,
        iss.wrapping_add(1),
        TcpFlags::ACK,
        8192,
        None,
        &[],
    );
    take_sent(tcp);
    iss
}

#[test]
fn connection_dispatched_on_first_data() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (lis_events, _conn_events, accepted) = queued_listener(&mut tcp, 2);

    let iss = handshake(&mut tcp, 6001);

    // Established, but queued: the application has heard nothing.
    assert!(lis_events.take().is_empty());
    assert!(accepted.borrow().is_empty());

    // First data marks the entry ready and dispatches it; the buffered
    // bytes come along with the accept.
    let data = b"GET /".to_vec();
    send_seg_from(
        &mut tcp,
        6001,
        LOCAL_PORT,
        1001,
        iss.wrapping_add(1),
        TcpFlags::ACK,
        8192,
        None,
        &data,
    );

    assert_eq!(lis_events.take(), vec![Event::LisEstablished]);
    let accepted = accepted.borrow();
    assert_eq!(accepted.len(), 1);
    let (conn, initial) = &accepted[0];
    assert_eq!(initial, &data);
    assert_eq!(tcp.conn_status(*conn), Some(TcpStatus::Established));
    // The initial data was consumed through the accept.
    assert_eq!(tcp.recv_available(*conn), 0);
}

#[test]
fn fin_before_data_recycles_entry() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (lis_events, _conn_events, accepted) = queued_listener(&mut tcp, 1);

    let iss = handshake(&mut tcp, 6002);

    // A FIN with no data is useless to the application: the entry goes
    // away quietly and the engine winds the connection down itself.
    send_seg_from(
        &mut tcp,
        6002,
        LOCAL_PORT,
        1001,
        iss.wrapping_add(1),
        TcpFlags::ACK | TcpFlags::FIN,
        8192,
        None,
        &[],
    );
    assert!(lis_events.take().is_empty());
    assert!(accepted.borrow().is_empty());

    // The engine's own FIN goes out (ACK of the peer's FIN rides along).
    let sent = take_sent(&mut tcp);
    assert!(sent.iter().any(|s| s.flags.contains(TcpFlags::FIN)));
    assert_eq!(sent.last().unwrap().ack, 1002);

    // The entry is free again for the next handshake.
    let _ = handshake(&mut tcp, 6003);
    send_seg_from(&mut tcp, 6003, LOCAL_PORT, 1001, 0, TcpFlags::ACK, 8192, None, b"x");
    assert_eq!(lis_events.take(), vec![Event::LisEstablished]);
}

#[test]
fn queued_entry_times_out() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (lis_events, _conn_events, accepted) = queued_listener(&mut tcp, 1);

    handshake(&mut tcp, 6004);
    assert!(lis_events.take().is_empty());

    // No data within the queue timeout: the entry is dropped and the
    // engine closes the connection gracefully (the FIN leaves on the
    // deferred output timer).
    tcp.set_now(1 + QUEUE_TIMEOUT + 1);
    tcp.poll();
    tcp.set_now(1 + QUEUE_TIMEOUT + 10);
    tcp.poll();
    let sent = take_sent(&mut tcp);
    assert!(sent.iter().any(|s| s.flags.contains(TcpFlags::FIN)));
    assert!(lis_events.take().is_empty());
    assert!(accepted.borrow().is_empty());
}

#[test]
fn queue_at_capacity_refuses_quietly() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (lis_events, _conn_events, _accepted) = queued_listener(&mut tcp, 1);

    // First connection occupies the only entry.
    handshake(&mut tcp, 6005);
    assert!(lis_events.take().is_empty());

    // Second handshake: SYN-ACK is still answered...
    send_seg_from(&mut tcp, 6006, LOCAL_PORT, 1000, 0, TcpFlags::SYN, 8192, None, &[]);
    let syn_ack = take_sent(&mut tcp).pop().unwrap();
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);

    // ...but on completion there is no room: dropped without an RST.
    send_seg_from(
        &mut tcp,
        6006,
        LOCAL_PORT,
        1001,
        syn_ack.seq.wrapping_add(1),
        TcpFlags::ACK,
        8192,
        None,
        &[],
    );
    assert!(take_sent(&mut tcp).is_empty());
    assert!(lis_events.take().is_empty());

    // The refused peer's retransmitted data finds no connection: RST.
    send_seg_from(&mut tcp, 6006, LOCAL_PORT, 1001, 0, TcpFlags::ACK, 8192, None, b"hello");
    let sent = take_sent(&mut tcp);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].flags.contains(TcpFlags::RST));
}

#[test]
fn ready_entries_dispatch_in_arrival_order() {
    let mut tcp = new_stack();
    tcp.set_now(1);
    let (lis_events, _conn_events, accepted) = queued_listener(&mut tcp, 2);

    let iss_a = handshake(&mut tcp, 7001);
    tcp.set_now(10);
    let iss_b = handshake(&mut tcp, 7002);

    // B becomes ready first, then A: dispatch follows readiness order.
    tcp.set_now(20);
    send_seg_from(&mut tcp, 7002, LOCAL_PORT, 1001, iss_b.wrapping_add(1), TcpFlags::ACK, 8192, None, b"bb");
    tcp.set_now(30);
    send_seg_from(&mut tcp, 7001, LOCAL_PORT, 1001, iss_a.wrapping_add(1), TcpFlags::ACK, 8192, None, b"aa");

    assert_eq!(lis_events.take(), vec![Event::LisEstablished, Event::LisEstablished]);
    let accepted = accepted.borrow();
    assert_eq!(accepted.len(), 2);
    assert_eq!(accepted[0].1, b"bb");
    assert_eq!(accepted[1].1, b"aa");
}
