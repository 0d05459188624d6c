//! The TCP engine object and the application-visible operations on
//! listeners and connections.
//!
//! The engine is driven by an external event loop which updates the clock
//! with [`TcpStack::set_now`], delivers datagrams and timer polls, and
//! sleeps until [`TcpStack::next_wake`]. Application callbacks run
//! synchronously; a handler is detached from its slot for the duration of a
//! call so that it may re-enter the engine freely.

use crate::buf::BufRef;
use crate::ip::defs::IpErr;
use crate::ip::send::{IpSender, RetryToken};
use crate::tcp::defs::{
    SeqType, TcpConfig, TcpStatus, TimeTicks, DEFAULT_WND_ANN_THRESHOLD, MAX_WINDOW, MIN_MTU,
};
use crate::tcp::oos::OosBuffer;
use crate::tcp::pcb::{PcbIndex, PcbKey, TcpPcb};
use crate::tcp::timer::PcbTimer;
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;

/// Handle to a connection. Generation-checked: once the connection is gone
/// the id goes stale and all operations on it fail benignly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    pub(crate) index: usize,
    pub(crate) gen: u32,
}

/// Handle to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId {
    pub(crate) index: usize,
    pub(crate) gen: u32,
}

/// Application callbacks for a connection. For a given connection they
/// occur in causal order: `established` once (actively opened connections
/// only), then `data_received`/`data_sent` interleaved, with amount zero
/// signalling the FIN in each direction; or `aborted` once, after which the
/// handle is dead.
pub trait ConnectionHandler<I> {
    fn established(&mut self, _tcp: &mut TcpStack<I>, _conn: ConnId) {}
    fn aborted(&mut self, tcp: &mut TcpStack<I>, conn: ConnId);
    fn data_received(&mut self, tcp: &mut TcpStack<I>, conn: ConnId, amount: usize);
    fn data_sent(&mut self, tcp: &mut TcpStack<I>, conn: ConnId, amount: usize);
}

/// Application callback for a listener: a connection is ready to be taken
/// with [`TcpStack::accept_connection`]. Without a listen queue, failing to
/// accept from within the callback forfeits the connection.
pub trait ListenerHandler<I> {
    fn established(&mut self, tcp: &mut TcpStack<I>, lis: ListenerId);
}

#[derive(Debug, Clone)]
pub struct ListenParams {
    /// Local address to bind, or unspecified for all local addresses.
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Maximum handshakes in progress plus connections pending accept.
    pub max_pcbs: usize,
    /// Initial receive window for accepted connections (no listen queue).
    pub initial_rcv_wnd: usize,
    /// Number of listen-queue entries; zero accepts synchronously.
    pub queue_size: usize,
    /// How long a queued connection may sit without data before it is
    /// dropped.
    pub queue_timeout_ticks: TimeTicks,
    /// Receive buffer of each queue entry; doubles as the initial receive
    /// window in queued mode.
    pub queue_rx_buf_size: usize,
}

impl Default for ListenParams {
    fn default() -> Self {
        ListenParams {
            addr: Ipv4Addr::UNSPECIFIED,
            port: 0,
            max_pcbs: 16,
            initial_rcv_wnd: 0,
            queue_size: 0,
            queue_timeout_ticks: 10_000,
            queue_rx_buf_size: 1460,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Initial receive window to announce (the receive buffer should be at
    /// least this large by the time data flows).
    pub rcv_wnd: usize,
}

/// Outbound byte queue. The front is snd_una; `cur` is the offset of the
/// first unsent byte; `psh_index` marks data that must not be delayed.
#[derive(Debug)]
pub(crate) struct SendQueue {
    buf: VecDeque<u8>,
    cap: usize,
    pub(crate) cur: usize,
    pub(crate) psh_index: usize,
}

impl SendQueue {
    fn new() -> Self {
        SendQueue { buf: VecDeque::new(), cap: 0, cur: 0, psh_index: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn free(&self) -> usize {
        self.cap - self.buf.len()
    }

    fn set_capacity(&mut self, cap: usize) {
        debug_assert!(cap >= self.cap);
        self.cap = cap;
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        self.buf.extend(&data[..n]);
        n
    }

    /// Acked bytes leave from the front; the cursor and push index follow.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.buf.drain(..n);
        self.cur = self.cur.saturating_sub(n);
        self.psh_index = self.psh_index.saturating_sub(n);
    }

    /// Everything becomes unsent again (for retransmission).
    pub(crate) fn requeue(&mut self) {
        self.cur = 0;
    }

    /// Contiguous views of [offset, offset+len).
    pub(crate) fn range(&self, offset: usize, len: usize) -> (&[u8], &[u8]) {
        debug_assert!(offset + len <= self.buf.len());
        let (a, b) = self.buf.as_slices();
        if offset >= a.len() {
            let off = offset - a.len();
            (&b[off..off + len], &[][..])
        } else if offset + len <= a.len() {
            (&a[offset..offset + len], &[][..])
        } else {
            let a_part = &a[offset..];
            (a_part, &b[..len - a_part.len()])
        }
    }
}

/// Inbound ring buffer. `[head, head+len)` holds in-order bytes the
/// application has not consumed; the rest is free space, which is what the
/// window announcements are based on. Out-of-sequence data is parked in the
/// free region at its offset from the in-order point and committed once the
/// gap fills.
#[derive(Debug)]
pub(crate) struct RecvRing {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RecvRing {
    fn new() -> Self {
        RecvRing { buf: Box::new([]), head: 0, len: 0 }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    pub(crate) fn grow_to(&mut self, new_cap: usize) {
        if new_cap <= self.buf.len() {
            return;
        }
        let old_cap = self.buf.len();
        let mut new_buf = vec![0u8; new_cap].into_boxed_slice();
        // Linearize the whole old buffer from head so parked
        // out-of-sequence bytes keep their offsets from the in-order point.
        for k in 0..old_cap {
            new_buf[k] = self.buf[(self.head + k) % old_cap];
        }
        self.buf = new_buf;
        self.head = 0;
    }

    /// Write into the free region at `rel_off` from the in-order point.
    pub(crate) fn write_at(&mut self, rel_off: usize, mut data: BufRef<'_>) {
        debug_assert!(rel_off + data.len() <= self.free());
        if data.is_empty() {
            return;
        }
        let cap = self.buf.len();
        let mut pos = (self.head + self.len + rel_off) % cap;
        while !data.is_empty() {
            let chunk = data.chunk();
            let n = chunk.len().min(cap - pos);
            self.buf[pos..pos + n].copy_from_slice(&chunk[..n]);
            data.skip_bytes(n);
            pos = (pos + n) % cap;
        }
    }

    /// Bytes at the in-order point become consumable.
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.len += n;
    }

    pub(crate) fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        if n == 0 {
            return 0;
        }
        let cap = self.buf.len();
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        if n > first {
            out[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }

    pub(crate) fn read_all(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        let n = self.read_into(&mut out);
        debug_assert!(n == out.len());
        out
    }
}

/// Connection-resident state, released when the application abandons the
/// connection.
pub(crate) struct ConnState<I> {
    pub(crate) pcb: Option<PcbIndex>,
    pub(crate) snd: SendQueue,
    pub(crate) rcv: RecvRing,
    pub(crate) snd_closed: bool,
    pub(crate) end_sent: bool,
    pub(crate) end_received: bool,
    pub(crate) snd_wnd: SeqType,
    pub(crate) cwnd: SeqType,
    pub(crate) ssthresh: SeqType,
    pub(crate) cwnd_acked: SeqType,
    pub(crate) recover: SeqType,
    pub(crate) rtt_test_seq: SeqType,
    pub(crate) srtt: u16,
    pub(crate) rttvar: u16,
    pub(crate) rcv_ann_thres: SeqType,
    pub(crate) pmtu: u16,
    pub(crate) ooseq: OosBuffer,
    pub(crate) handler: Option<Box<dyn ConnectionHandler<I>>>,
}

impl<I> ConnState<I> {
    fn new(num_oos_segs: u8, handler: Box<dyn ConnectionHandler<I>>) -> Self {
        ConnState {
            pcb: None,
            snd: SendQueue::new(),
            rcv: RecvRing::new(),
            snd_closed: false,
            end_sent: false,
            end_received: false,
            snd_wnd: 0,
            cwnd: 0,
            ssthresh: 0,
            cwnd_acked: 0,
            recover: 0,
            rtt_test_seq: 0,
            srtt: 0,
            rttvar: 0,
            rcv_ann_thres: DEFAULT_WND_ANN_THRESHOLD,
            pmtu: MIN_MTU,
            ooseq: OosBuffer::new(num_oos_segs),
            handler: Some(handler),
        }
    }
}

pub(crate) struct ConnSlot<I> {
    pub(crate) gen: u32,
    pub(crate) state: Option<ConnState<I>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueEntry {
    pub(crate) conn: Option<usize>,
    pub(crate) ready: bool,
    pub(crate) time: TimeTicks,
}

pub(crate) struct ListenQueue {
    pub(crate) entries: Vec<QueueEntry>,
    pub(crate) timeout_ticks: TimeTicks,
    pub(crate) rx_buf_size: usize,
    pub(crate) dequeue_pending: bool,
    pub(crate) timeout_at: Option<TimeTicks>,
    pub(crate) to_accept: Option<usize>,
}

pub(crate) struct ListenerState<I> {
    pub(crate) addr: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) max_pcbs: usize,
    pub(crate) num_pcbs: usize,
    pub(crate) initial_rcv_wnd: SeqType,
    pub(crate) accept_pcb: Option<PcbIndex>,
    pub(crate) handler: Option<Box<dyn ListenerHandler<I>>>,
    pub(crate) queue: Option<ListenQueue>,
}

pub(crate) struct LisSlot<I> {
    pub(crate) gen: u32,
    pub(crate) state: Option<ListenerState<I>>,
}

/// Internal handler of listen-queue entries: marks entries ready on first
/// data, drops FIN-before-data connections, recycles on abort.
struct QueueEntryHandler {
    li: usize,
    entry: usize,
}

impl<I: IpSender> ConnectionHandler<I> for QueueEntryHandler {
    fn aborted(&mut self, tcp: &mut TcpStack<I>, _conn: ConnId) {
        tcp.queue_entry_aborted(self.li, self.entry);
    }

    fn data_received(&mut self, tcp: &mut TcpStack<I>, _conn: ConnId, amount: usize) {
        tcp.queue_entry_data_received(self.li, self.entry, amount);
    }

    fn data_sent(&mut self, _tcp: &mut TcpStack<I>, _conn: ConnId, _amount: usize) {
        debug_assert!(false, "queued connection never sends");
    }
}

/// The TCP protocol engine.
pub struct TcpStack<I> {
    pub(crate) cfg: TcpConfig,
    pub(crate) ip: I,
    pub(crate) now: TimeTicks,
    pub(crate) pcbs: Vec<TcpPcb>,
    pub(crate) index_active: BTreeMap<PcbKey, PcbIndex>,
    pub(crate) index_timewait: BTreeMap<PcbKey, PcbIndex>,
    /// LRU of unreferenced PCBs: front is most recently used, the back is
    /// next in line for eviction.
    pub(crate) unrefed: VecDeque<PcbIndex>,
    pub(crate) conns: Vec<ConnSlot<I>>,
    pub(crate) listeners: Vec<LisSlot<I>>,
    /// The PCB owning the current input-processing stack frame; cleared by
    /// any abort of it so processing stops.
    pub(crate) current_pcb: Option<PcbIndex>,
    pub(crate) next_ephemeral_port: u16,
    /// Initial send window of the PCB published in accept_pcb, valid while
    /// an established dispatch is in progress.
    pub(crate) accept_snd_wnd: SeqType,
    pub(crate) timers_dirty: bool,
    pub(crate) next_wake: Option<TimeTicks>,
    /// Scratch for assembling outgoing segment headers.
    pub(crate) tx_buf: Vec<u8>,
}

impl<I: IpSender> TcpStack<I> {
    pub fn new(cfg: TcpConfig, ip: I) -> Self {
        assert!(cfg.num_pcbs > 0);
        assert!(cfg.num_oos_segs >= 1 && cfg.num_oos_segs <= 15);
        assert!(cfg.rcv_wnd_shift <= 14);
        assert!(cfg.ephemeral_port_first > 0);
        assert!(cfg.ephemeral_port_first <= cfg.ephemeral_port_last);

        let pcbs: Vec<TcpPcb> = (0..cfg.num_pcbs).map(|_| TcpPcb::new()).collect();
        let unrefed: VecDeque<PcbIndex> = (0..cfg.num_pcbs).collect();
        let next_ephemeral_port = cfg.ephemeral_port_first;

        TcpStack {
            cfg,
            ip,
            now: 0,
            pcbs,
            index_active: BTreeMap::new(),
            index_timewait: BTreeMap::new(),
            unrefed,
            conns: Vec::new(),
            listeners: Vec::new(),
            current_pcb: None,
            next_ephemeral_port,
            accept_snd_wnd: 0,
            timers_dirty: false,
            next_wake: None,
            tx_buf: Vec::new(),
        }
    }

    pub fn ip(&self) -> &I {
        &self.ip
    }

    pub fn ip_mut(&mut self) -> &mut I {
        &mut self.ip
    }

    /// Advance the engine clock. Must be called by the event loop before
    /// delivering any event.
    pub fn set_now(&mut self, now: TimeTicks) {
        debug_assert!(now >= self.now);
        self.now = now;
    }

    pub fn now(&self) -> TimeTicks {
        self.now
    }

    /// Fire every due timer.
    pub fn poll(&mut self) {
        loop {
            let mut fired = false;

            for i in 0..self.pcbs.len() {
                while let Some(timer) = self.pcbs[i].timers.take_expired(self.now) {
                    self.mark_timers_dirty();
                    fired = true;
                    match timer {
                        PcbTimer::Abort => self.pcb_abrt_timer_handler(i),
                        PcbTimer::Output => self.pcb_output_timer_handler(i),
                        PcbTimer::Rtx => self.pcb_rtx_timer_handler(i),
                    }
                }
            }

            for li in 0..self.listeners.len() {
                let due = self.listeners[li]
                    .state
                    .as_ref()
                    .and_then(|l| l.queue.as_ref())
                    .and_then(|q| q.timeout_at)
                    .is_some_and(|t| t <= self.now);
                if due {
                    fired = true;
                    self.lis_timeout_handler(li);
                }
            }

            if !fired {
                break;
            }
        }

        // Deferred dequeue dispatches, once per poll.
        for li in 0..self.listeners.len() {
            let pending = self.listeners[li]
                .state
                .as_mut()
                .and_then(|l| l.queue.as_mut())
                .map(|q| std::mem::replace(&mut q.dequeue_pending, false))
                .unwrap_or(false);
            if pending {
                self.dispatch_connections(li);
            }
        }

        self.do_delayed_timer_update();
    }

    /// Earliest deadline any timer is armed for. The event loop sleeps
    /// until then (or until traffic arrives).
    pub fn next_wake(&self) -> Option<TimeTicks> {
        self.next_wake
    }

    /// The lower layer reports that a deferred send (e.g. pending ARP
    /// resolution) can be retried.
    pub fn retry_sending(&mut self, token: RetryToken) {
        let i = token.0 as usize;
        if i >= self.pcbs.len() {
            return;
        }
        self.pcb_send_retry(i);
        self.do_delayed_timer_update();
    }

    pub(crate) fn mark_timers_dirty(&mut self) {
        self.timers_dirty = true;
    }

    /// Recompute the wakeup deadline once per cooperative entry. Nested
    /// timer updates from within callbacks collapse into this.
    pub(crate) fn do_delayed_timer_update(&mut self) {
        if !self.timers_dirty {
            return;
        }
        self.timers_dirty = false;

        let mut wake: Option<TimeTicks> = None;
        for pcb in &mut self.pcbs {
            pcb.timers.take_dirty();
            wake = min_opt(wake, pcb.timers.next_expiry());
        }
        for slot in &self.listeners {
            if let Some(q) = slot.state.as_ref().and_then(|l| l.queue.as_ref()) {
                wake = min_opt(wake, q.timeout_at);
                if q.dequeue_pending {
                    wake = min_opt(wake, Some(self.now));
                }
            }
        }
        self.next_wake = wake;
    }

    // ===== Listener operations =====

    pub fn start_listening(
        &mut self,
        params: &ListenParams,
        handler: Box<dyn ListenerHandler<I>>,
    ) -> Result<ListenerId, IpErr> {
        if params.max_pcbs == 0 {
            return Err(IpErr::BadState);
        }
        if self.find_listener(params.addr, params.port).is_some() {
            return Err(IpErr::AlreadyConnected);
        }

        // In queued mode connections receive into the per-entry buffers, so
        // that is the window to announce.
        let initial_rcv_wnd = if params.queue_size > 0 {
            params.queue_rx_buf_size
        } else {
            params.initial_rcv_wnd
        };
        let initial_rcv_wnd = (initial_rcv_wnd as u64).min(u64::from(MAX_WINDOW)) as SeqType;

        let queue = (params.queue_size > 0).then(|| ListenQueue {
            entries: vec![
                QueueEntry { conn: None, ready: false, time: 0 };
                params.queue_size
            ],
            timeout_ticks: params.queue_timeout_ticks,
            rx_buf_size: params.queue_rx_buf_size,
            dequeue_pending: false,
            timeout_at: None,
            to_accept: None,
        });

        let state = ListenerState {
            addr: params.addr,
            port: params.port,
            max_pcbs: params.max_pcbs,
            num_pcbs: 0,
            initial_rcv_wnd,
            accept_pcb: None,
            handler: Some(handler),
            queue,
        };

        let li = self.alloc_listener(state);
        log::debug!("Listening on {}:{}.", params.addr, params.port);
        Ok(ListenerId { index: li, gen: self.listeners[li].gen })
    }

    /// Stop listening. SYN_RCVD handshakes are quietly aborted; queued
    /// connections are abandoned; established connections already accepted
    /// are unaffected.
    pub fn reset_listener(&mut self, lis: ListenerId) {
        let li = match self.lis_by_id(lis) {
            Some(li) => li,
            None => return,
        };

        let num_entries = self
            .lis(li)
            .queue
            .as_ref()
            .map(|q| q.entries.len())
            .unwrap_or(0);
        for e in 0..num_entries {
            let ci = self
                .lis_mut(li)
                .queue
                .as_mut()
                .and_then(|q| q.entries[e].conn.take());
            if let Some(ci) = ci {
                self.abandon_conn(ci);
            }
        }

        self.unlink_listener(li);
        self.listeners[li].state = None;
        self.do_delayed_timer_update();
    }

    /// Ask for the next ready queued connection to be dispatched from the
    /// event loop rather than from inside the current callback.
    pub fn schedule_dequeue(&mut self, lis: ListenerId) {
        if let Some(li) = self.lis_by_id(lis) {
            if let Some(q) = self.lis_mut(li).queue.as_mut() {
                q.dequeue_pending = true;
                self.mark_timers_dirty();
                self.do_delayed_timer_update();
            }
        }
    }

    /// Take the pending connection of a listener. Returns the new
    /// connection id and any data received while it sat in the listen
    /// queue. With a queue, a FIN may already have been consumed; check
    /// [`TcpStack::was_end_received`].
    pub fn accept_connection(
        &mut self,
        lis: ListenerId,
        handler: Box<dyn ConnectionHandler<I>>,
    ) -> Result<(ConnId, Vec<u8>), IpErr> {
        let li = self.lis_by_id(lis).ok_or(IpErr::NotListening)?;

        if self.lis(li).queue.is_none() {
            // Synchronous accept from within the established callback.
            if self.lis(li).accept_pcb.is_none() {
                return Err(IpErr::BadState);
            }
            let num_oos = self.cfg.num_oos_segs;
            let ci = self.alloc_conn(ConnState::new(num_oos, handler));
            self.accept_pcb_into_conn(li, ci);
            Ok((ConnId { index: ci, gen: self.conns[ci].gen }, Vec::new()))
        } else {
            // Move the published ready entry out of the queue.
            let entry = self
                .lis_mut(li)
                .queue
                .as_mut()
                .and_then(|q| q.to_accept.take())
                .ok_or(IpErr::BadState)?;
            let src_ci = self
                .lis_mut(li)
                .queue
                .as_mut()
                .and_then(|q| q.entries[entry].conn.take())
                .ok_or(IpErr::BadState)?;

            let mut state = self.conns[src_ci].state.take().expect("queue entry without state");
            let initial_rx_data = state.rcv.read_all();
            state.handler = Some(handler);
            let pcb = state.pcb;

            let ci = self.alloc_conn(state);
            if let Some(i) = pcb {
                self.pcbs[i].con = crate::tcp::pcb::PcbRef::Conn(ci);
            }
            Ok((ConnId { index: ci, gen: self.conns[ci].gen }, initial_rx_data))
        }
    }

    // ===== Connection operations =====

    /// Open a connection. The handler's `established` callback fires when
    /// the handshake completes; until then the connection behaves like any
    /// other (data may already be queued for sending).
    pub fn start_connection(
        &mut self,
        args: &ConnectArgs,
        handler: Box<dyn ConnectionHandler<I>>,
    ) -> Result<ConnId, IpErr> {
        let num_oos = self.cfg.num_oos_segs;
        let ci = self.alloc_conn(ConnState::new(num_oos, handler));
        match self.create_connection(ci, args) {
            Ok(_pcb) => {
                self.do_delayed_timer_update();
                Ok(ConnId { index: ci, gen: self.conns[ci].gen })
            }
            Err(err) => {
                self.free_conn(ci);
                Err(err)
            }
        }
    }

    /// Abandon the connection. No further callbacks occur; the engine
    /// finishes or aborts the protocol exchange on its own.
    pub fn reset_connection(&mut self, conn: ConnId) {
        if let Some(ci) = self.conn_by_id(conn) {
            self.abandon_conn(ci);
            self.do_delayed_timer_update();
        }
    }

    /// Provide (or enlarge) the receive buffer. The window announced to the
    /// peer derives from the free space in it.
    pub fn set_recv_buf(&mut self, conn: ConnId, size: usize) -> Result<(), IpErr> {
        let ci = self.conn_by_id(conn).ok_or(IpErr::BadState)?;
        if size < self.conn(ci).rcv.capacity() {
            return Err(IpErr::BadState);
        }
        self.conn_mut(ci).rcv.grow_to(size);
        if let Some(i) = self.conn(ci).pcb {
            self.pcb_rcv_buf_extended(i);
            self.do_delayed_timer_update();
        }
        Ok(())
    }

    /// Enlarge the receive buffer by `amount`.
    pub fn extend_recv_buf(&mut self, conn: ConnId, amount: usize) -> Result<(), IpErr> {
        let ci = self.conn_by_id(conn).ok_or(IpErr::BadState)?;
        let new_cap = self.conn(ci).rcv.capacity() + amount;
        self.set_recv_buf(conn, new_cap)
    }

    /// Consume received in-order data. Freed space extends the receive
    /// window (subject to the announcement threshold).
    pub fn recv_data(&mut self, conn: ConnId, out: &mut [u8]) -> usize {
        let ci = match self.conn_by_id(conn) {
            Some(ci) => ci,
            None => return 0,
        };
        let n = self.conn_mut(ci).rcv.read_into(out);
        if n > 0 {
            if let Some(i) = self.conn(ci).pcb {
                self.pcb_rcv_buf_extended(i);
                self.do_delayed_timer_update();
            }
        }
        n
    }

    /// Bytes of received data ready for [`TcpStack::recv_data`].
    pub fn recv_available(&self, conn: ConnId) -> usize {
        self.conn_by_id(conn).map_or(0, |ci| self.conn(ci).rcv.len())
    }

    /// Set the send-buffer capacity.
    pub fn set_snd_buf(&mut self, conn: ConnId, size: usize) -> Result<(), IpErr> {
        let ci = self.conn_by_id(conn).ok_or(IpErr::BadState)?;
        if size < self.conn(ci).snd.capacity() {
            return Err(IpErr::BadState);
        }
        self.conn_mut(ci).snd.set_capacity(size);
        Ok(())
    }

    /// Queue bytes for sending; returns how many fit in the send buffer.
    /// `data_sent` callbacks follow as the peer acknowledges.
    pub fn send_data(&mut self, conn: ConnId, data: &[u8]) -> Result<usize, IpErr> {
        let ci = self.conn_by_id(conn).ok_or(IpErr::BadState)?;
        if self.conn(ci).snd_closed {
            return Err(IpErr::BadState);
        }
        let written = self.conn_mut(ci).snd.write(data);
        if written > 0 {
            if let Some(i) = self.conn(ci).pcb {
                self.pcb_snd_buf_extended(i);
                self.do_delayed_timer_update();
            }
        }
        Ok(written)
    }

    /// Free space in the send buffer.
    pub fn send_space(&self, conn: ConnId) -> usize {
        self.conn_by_id(conn).map_or(0, |ci| self.conn(ci).snd.free())
    }

    /// Mark everything queued so far as push: it will not be delayed for
    /// segmentation.
    pub fn send_push(&mut self, conn: ConnId) {
        let ci = match self.conn_by_id(conn) {
            Some(ci) => ci,
            None => return,
        };
        if self.conn(ci).snd_closed {
            return;
        }
        let len = self.conn(ci).snd.len();
        self.conn_mut(ci).snd.psh_index = len;

        if let Some(i) = self.conn(ci).pcb {
            if self.pcbs[i].state.is_snd_open() && len > 0 {
                self.pcb_push_output(i);
                self.do_delayed_timer_update();
            }
        }
    }

    /// Close the sending direction, queueing a FIN after all data.
    pub fn close_sending(&mut self, conn: ConnId) -> Result<(), IpErr> {
        let ci = self.conn_by_id(conn).ok_or(IpErr::BadState)?;
        if self.conn(ci).snd_closed {
            return Err(IpErr::BadState);
        }
        {
            let con = self.conn_mut(ci);
            con.snd.psh_index = con.snd.len();
            con.snd_closed = true;
        }
        // In SYN_SENT the input path queues the FIN when the handshake
        // completes.
        if let Some(i) = self.conn(ci).pcb {
            if self.pcbs[i].state != TcpStatus::SynSent {
                self.pcb_end_sending(i);
                self.do_delayed_timer_update();
            }
        }
        Ok(())
    }

    /// Recompute the window announcement immediately, e.g. after raising
    /// the update threshold.
    pub fn announce_window_update(&mut self, conn: ConnId) {
        if let Some(ci) = self.conn_by_id(conn) {
            if let Some(i) = self.conn(ci).pcb {
                self.pcb_rcv_buf_extended(i);
                self.do_delayed_timer_update();
            }
        }
    }

    /// Set the window-announcement threshold (SWS avoidance).
    pub fn set_window_update_threshold(&mut self, conn: ConnId, thres: SeqType) {
        debug_assert!(thres > 0 && thres <= MAX_WINDOW);
        if let Some(ci) = self.conn_by_id(conn) {
            self.conn_mut(ci).rcv_ann_thres = thres;
        }
    }

    /// State of the PCB backing the connection; Closed once it is gone.
    pub fn conn_status(&self, conn: ConnId) -> Option<TcpStatus> {
        let ci = self.conn_by_id(conn)?;
        Some(match self.conn(ci).pcb {
            Some(i) => self.pcbs[i].state,
            None => TcpStatus::Closed,
        })
    }

    pub fn was_end_received(&self, conn: ConnId) -> bool {
        self.conn_by_id(conn).is_some_and(|ci| self.conn(ci).end_received)
    }

    pub fn was_end_sent(&self, conn: ConnId) -> bool {
        self.conn_by_id(conn).is_some_and(|ci| self.conn(ci).end_sent)
    }

    /// Local and remote endpoints of the connection.
    pub fn conn_endpoints(&self, conn: ConnId) -> Option<((Ipv4Addr, u16), (Ipv4Addr, u16))> {
        let ci = self.conn_by_id(conn)?;
        let i = self.conn(ci).pcb?;
        let key = self.pcbs[i].key;
        Some(((key.local_addr, key.local_port), (key.remote_addr, key.remote_port)))
    }

    // ===== Slot management =====

    pub(crate) fn conn(&self, ci: usize) -> &ConnState<I> {
        self.conns[ci].state.as_ref().expect("no connection in slot")
    }

    pub(crate) fn conn_mut(&mut self, ci: usize) -> &mut ConnState<I> {
        self.conns[ci].state.as_mut().expect("no connection in slot")
    }

    pub(crate) fn lis(&self, li: usize) -> &ListenerState<I> {
        self.listeners[li].state.as_ref().expect("no listener in slot")
    }

    pub(crate) fn lis_mut(&mut self, li: usize) -> &mut ListenerState<I> {
        self.listeners[li].state.as_mut().expect("no listener in slot")
    }

    fn conn_by_id(&self, id: ConnId) -> Option<usize> {
        let slot = self.conns.get(id.index)?;
        (slot.gen == id.gen && slot.state.is_some()).then_some(id.index)
    }

    fn lis_by_id(&self, id: ListenerId) -> Option<usize> {
        let slot = self.listeners.get(id.index)?;
        (slot.gen == id.gen && slot.state.is_some()).then_some(id.index)
    }

    fn alloc_conn(&mut self, state: ConnState<I>) -> usize {
        for (ci, slot) in self.conns.iter_mut().enumerate() {
            if slot.state.is_none() {
                slot.gen = slot.gen.wrapping_add(1);
                slot.state = Some(state);
                return ci;
            }
        }
        self.conns.push(ConnSlot { gen: 0, state: Some(state) });
        self.conns.len() - 1
    }

    pub(crate) fn free_conn(&mut self, ci: usize) {
        self.conns[ci].state = None;
    }

    fn alloc_listener(&mut self, state: ListenerState<I>) -> usize {
        for (li, slot) in self.listeners.iter_mut().enumerate() {
            if slot.state.is_none() {
                slot.gen = slot.gen.wrapping_add(1);
                slot.state = Some(state);
                return li;
            }
        }
        self.listeners.push(LisSlot { gen: 0, state: Some(state) });
        self.listeners.len() - 1
    }

    /// Sever the connection from its PCB (application side) and release the
    /// slot. The PCB drains or aborts on its own.
    pub(crate) fn abandon_conn(&mut self, ci: usize) {
        if let Some(i) = self.conn_mut(ci).pcb.take() {
            self.pcbs[i].con = crate::tcp::pcb::PcbRef::None;
            let con = self.conn(ci);
            // Unsent data or received-but-unconsumed data calls for a
            // reset (RFC 2525 section 2.17).
            let rst_needed = con.snd.len() > 0 || con.rcv.len() > 0;
            let rcv_ann_thres = con.rcv_ann_thres;
            self.pcb_abandoned(i, rst_needed, rcv_ann_thres);
        }
        self.free_conn(ci);
    }

    // ===== Callback dispatch =====

    fn dispatch_conn<F>(&mut self, ci: usize, f: F)
    where
        F: FnOnce(&mut dyn ConnectionHandler<I>, &mut Self, ConnId),
    {
        let (gen, mut handler) = {
            let slot = &mut self.conns[ci];
            match slot.state.as_mut().and_then(|s| s.handler.take()) {
                Some(h) => (slot.gen, h),
                None => return,
            }
        };
        let id = ConnId { index: ci, gen };
        f(handler.as_mut(), self, id);
        // Put the handler back unless the connection went away (or was
        // replaced) while the callback ran.
        if let Some(slot) = self.conns.get_mut(ci) {
            if slot.gen == gen {
                if let Some(state) = slot.state.as_mut() {
                    if state.handler.is_none() {
                        state.handler = Some(handler);
                    }
                }
            }
        }
    }

    fn dispatch_lis<F>(&mut self, li: usize, f: F)
    where
        F: FnOnce(&mut dyn ListenerHandler<I>, &mut Self, ListenerId),
    {
        let (gen, mut handler) = {
            let slot = &mut self.listeners[li];
            match slot.state.as_mut().and_then(|s| s.handler.take()) {
                Some(h) => (slot.gen, h),
                None => return,
            }
        };
        let id = ListenerId { index: li, gen };
        f(handler.as_mut(), self, id);
        if let Some(slot) = self.listeners.get_mut(li) {
            if slot.gen == gen {
                if let Some(state) = slot.state.as_mut() {
                    if state.handler.is_none() {
                        state.handler = Some(handler);
                    }
                }
            }
        }
    }

    /// The engine aborted the PCB under a live connection: sever, tell the
    /// application, release the slot. The id is dead afterwards.
    pub(crate) fn conn_pcb_aborted(&mut self, ci: usize) {
        if let Some(state) = self.conns[ci].state.as_mut() {
            state.pcb = None;
        }
        let gen = self.conns[ci].gen;
        self.dispatch_conn(ci, |h, tcp, id| h.aborted(tcp, id));
        if self.conns[ci].gen == gen && self.conns[ci].state.is_some() {
            self.free_conn(ci);
        }
    }

    pub(crate) fn conn_established(&mut self, ci: usize) {
        self.dispatch_conn(ci, |h, tcp, id| h.established(tcp, id));
    }

    pub(crate) fn conn_data_received(&mut self, ci: usize, amount: usize) {
        debug_assert!(amount > 0);
        debug_assert!(!self.conn(ci).end_received);
        self.dispatch_conn(ci, |h, tcp, id| h.data_received(tcp, id, amount));
    }

    pub(crate) fn conn_end_received(&mut self, ci: usize) {
        debug_assert!(!self.conn(ci).end_received);
        self.conn_mut(ci).end_received = true;
        self.dispatch_conn(ci, |h, tcp, id| h.data_received(tcp, id, 0));
    }

    pub(crate) fn conn_data_sent(&mut self, ci: usize, amount: usize) {
        debug_assert!(amount > 0);
        debug_assert!(!self.conn(ci).end_sent);
        self.dispatch_conn(ci, |h, tcp, id| h.data_sent(tcp, id, amount));
    }

    pub(crate) fn conn_end_sent(&mut self, ci: usize) {
        debug_assert!(!self.conn(ci).end_sent);
        debug_assert!(self.conn(ci).snd_closed);
        self.conn_mut(ci).end_sent = true;
        self.dispatch_conn(ci, |h, tcp, id| h.data_sent(tcp, id, 0));
    }

    // ===== Listen queue internals =====

    /// A handshake completed on a listener (accept_pcb is published). With
    /// a queue, park the connection in a free entry; otherwise hand it to
    /// the application. If it is not taken, the caller cleans up.
    pub(crate) fn lis_established(&mut self, li: usize) {
        if self.lis(li).queue.is_none() {
            self.dispatch_lis(li, |h, tcp, id| h.established(tcp, id));
            return;
        }

        let free_entry = self
            .lis(li)
            .queue
            .as_ref()
            .unwrap()
            .entries
            .iter()
            .position(|e| e.conn.is_none());

        if let Some(e) = free_entry {
            let rx_buf_size = self.lis(li).queue.as_ref().unwrap().rx_buf_size;
            let num_oos = self.cfg.num_oos_segs;
            let handler: Box<dyn ConnectionHandler<I>> =
                Box::new(QueueEntryHandler { li, entry: e });
            let mut state = ConnState::new(num_oos, handler);
            state.rcv.grow_to(rx_buf_size);
            let ci = self.alloc_conn(state);
            self.accept_pcb_into_conn(li, ci);

            let now = self.now;
            let q = self.lis_mut(li).queue.as_mut().unwrap();
            q.entries[e] = QueueEntry { conn: Some(ci), ready: false, time: now };

            self.update_queue_timeout(li);
        }
        // No free entry: leave the PCB unaccepted; the caller aborts it
        // quietly.
    }

    /// Complete the accept of the published SYN_RCVD PCB into a connection
    /// slot.
    pub(crate) fn accept_pcb_into_conn(&mut self, li: usize, ci: usize) {
        let i = self.lis_mut(li).accept_pcb.take().expect("no accept-pending PCB");
        debug_assert!(self.pcbs[i].state == TcpStatus::SynRcvd);
        self.lis_mut(li).num_pcbs -= 1;

        // The PCB was taken off the unreferenced list when it was
        // published.
        self.pcbs[i].state = TcpStatus::Established;
        self.pcbs[i].con = crate::tcp::pcb::PcbRef::Conn(ci);
        self.conn_mut(ci).pcb = Some(i);

        let remote_addr = self.pcbs[i].key.remote_addr;
        let pmtu = self.ip.pmtu_estimate(remote_addr);
        self.conn_mut(ci).pmtu = pmtu;

        let snd_wnd = self.accept_snd_wnd;
        self.pcb_complete_established_transition(i, pmtu, snd_wnd);
    }

    fn find_oldest_entry(&self, li: usize, ready: bool) -> Option<usize> {
        let q = self.lis(li).queue.as_ref()?;
        let mut oldest: Option<usize> = None;
        for (e, entry) in q.entries.iter().enumerate() {
            if entry.conn.is_some() && entry.ready == ready {
                if oldest.map_or(true, |o| entry.time < q.entries[o].time) {
                    oldest = Some(e);
                }
            }
        }
        oldest
    }

    /// The timeout timer always tracks the oldest non-ready entry.
    fn update_queue_timeout(&mut self, li: usize) {
        let oldest = self.find_oldest_entry(li, false);
        let q = self.lis_mut(li).queue.as_mut().unwrap();
        q.timeout_at = oldest.map(|e| q.entries[e].time + q.timeout_ticks);
        self.mark_timers_dirty();
    }

    fn lis_timeout_handler(&mut self, li: usize) {
        // The timeout is kept aligned to the oldest non-ready entry, so one
        // must exist.
        match self.find_oldest_entry(li, false) {
            Some(e) => self.queue_entry_reset(li, e),
            None => {
                debug_assert!(false, "queue timeout without non-ready entry");
                let q = self.lis_mut(li).queue.as_mut().unwrap();
                q.timeout_at = None;
                self.mark_timers_dirty();
            }
        }
    }

    /// Hand ready entries to the application in arrival order until one is
    /// left untaken.
    pub(crate) fn dispatch_connections(&mut self, li: usize) {
        loop {
            let e = match self.find_oldest_entry(li, true) {
                Some(e) => e,
                None => break,
            };

            self.lis_mut(li).queue.as_mut().unwrap().to_accept = Some(e);
            self.dispatch_lis(li, |h, tcp, id| h.established(tcp, id));

            // The listener may have been reset from the callback.
            let q = match self.listeners[li].state.as_mut().and_then(|l| l.queue.as_mut()) {
                Some(q) => q,
                None => break,
            };
            q.to_accept = None;
            if q.entries[e].conn.is_some() {
                // Not taken; stop pushing.
                break;
            }
        }
    }

    fn queue_entry_reset(&mut self, li: usize, e: usize) {
        let (ci, was_ready) = {
            let q = self.lis_mut(li).queue.as_mut().unwrap();
            (q.entries[e].conn.take(), q.entries[e].ready)
        };
        if let Some(ci) = ci {
            self.abandon_conn(ci);
        }
        if !was_ready {
            self.update_queue_timeout(li);
        }
    }

    pub(crate) fn queue_entry_aborted(&mut self, li: usize, e: usize) {
        let was_ready = {
            let q = match self.listeners[li].state.as_mut().and_then(|l| l.queue.as_mut()) {
                Some(q) => q,
                None => return,
            };
            q.entries[e].conn = None;
            q.entries[e].ready
        };
        if !was_ready {
            self.update_queue_timeout(li);
        }
    }

    pub(crate) fn queue_entry_data_received(&mut self, li: usize, e: usize, amount: usize) {
        let ci = match self
            .listeners[li]
            .state
            .as_ref()
            .and_then(|l| l.queue.as_ref())
            .and_then(|q| q.entries[e].conn)
        {
            Some(ci) => ci,
            None => return,
        };

        // A FIN before any data is of no use to anyone; recycle the entry.
        if amount == 0 && self.conn(ci).rcv.len() == 0 {
            self.queue_entry_reset(li, e);
            return;
        }

        let already_ready = self.lis(li).queue.as_ref().unwrap().entries[e].ready;
        if !already_ready {
            self.lis_mut(li).queue.as_mut().unwrap().entries[e].ready = true;
            self.update_queue_timeout(li);
            self.dispatch_connections(li);
        }
    }
}

fn min_opt(a: Option<TimeTicks>, b: Option<TimeTicks>) -> Option<TimeTicks> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
