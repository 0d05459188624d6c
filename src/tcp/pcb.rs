//! Protocol Control Blocks: the fixed pool, the two lookup indices and the
//! unreferenced-LRU list, plus PCB lifecycle transitions.

use crate::ip::defs::IpErr;
use crate::ip::send::IpSender;
use crate::tcp::defs::{PcbFlags, RttType, SeqType, TcpStatus, IP4_TCP_HEADER_SIZE};
use crate::tcp::timer::{MultiTimer, PcbTimer};
use crate::tcp::usrreq::{ConnectArgs, TcpStack};
use std::net::Ipv4Addr;

pub type PcbIndex = usize;

/// The demultiplexing key: the full 4-tuple. Ordered so it can key the
/// active and time-wait indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PcbKey {
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
}

/// What a PCB points back to: the listener while in SYN_RCVD, otherwise
/// possibly a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbRef {
    None,
    Conn(usize),
    Lis(usize),
}

/// A TCP Protocol Control Block. These are maintained internally within the
/// engine and may survive reset of an associated connection.
#[derive(Debug)]
pub struct TcpPcb {
    pub key: PcbKey,
    pub state: TcpStatus,
    pub flags: PcbFlags,
    pub con: PcbRef,

    // Sender variables.
    pub snd_una: SeqType,
    pub snd_nxt: SeqType,

    // Receiver variables.
    pub rcv_nxt: SeqType,
    pub rcv_ann_wnd: SeqType,

    /// The maximum segment size we will send. Kept between MIN_ALLOWED_MSS
    /// and base_snd_mss once ESTABLISHED; before that it temporarily holds
    /// the interface MSS. Changing it requires fixups of ssthresh, cwnd and
    /// the rtx timer (see pcb_pmtu_changed).
    pub snd_mss: u16,
    /// MSS computed from the interface MTU and the peer's MSS option.
    pub base_snd_mss: u16,

    // Round-trip time and retransmission time management.
    pub rto: RttType,
    pub rtt_test_time: u64,

    /// >= FAST_RTX_DUP_ACKS means fast recovery is in progress.
    pub num_dupack: u8,
    pub snd_wnd_shift: u8,
    pub rcv_wnd_shift: u8,

    pub timers: MultiTimer,
}

impl TcpPcb {
    pub(crate) fn new() -> Self {
        TcpPcb {
            key: PcbKey {
                local_addr: Ipv4Addr::UNSPECIFIED,
                remote_addr: Ipv4Addr::UNSPECIFIED,
                local_port: 0,
                remote_port: 0,
            },
            state: TcpStatus::Closed,
            flags: PcbFlags::empty(),
            con: PcbRef::None,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rcv_ann_wnd: 0,
            snd_mss: 0,
            base_snd_mss: 0,
            rto: 0,
            rtt_test_time: 0,
            num_dupack: 0,
            snd_wnd_shift: 0,
            rcv_wnd_shift: 0,
            timers: MultiTimer::new(),
        }
    }

    pub fn has_flag(&self, flag: PcbFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: PcbFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: PcbFlags) {
        self.flags.remove(flag);
    }

    pub fn has_and_clear_flag(&mut self, flag: PcbFlags) -> bool {
        let has = self.flags.contains(flag);
        self.flags.remove(flag);
        has
    }

    pub fn conn_index(&self) -> Option<usize> {
        match self.con {
            PcbRef::Conn(ci) => Some(ci),
            _ => None,
        }
    }
}

impl<I: IpSender> TcpStack<I> {
    /// Grab a PCB for a new connection: the oldest unreferenced one,
    /// aborting it first if it is not closed. The PCB is left on the
    /// unreferenced list; the caller removes it if the new use is
    /// referenced.
    pub(crate) fn allocate_pcb(&mut self) -> Option<PcbIndex> {
        let i = *self.unrefed.back()?;
        debug_assert!(self.pcb_is_in_unreferenced_list(i));

        if self.pcbs[i].state != TcpStatus::Closed {
            self.pcb_abort_default(i);
        } else {
            self.pcb_assert_closed(i);
        }

        Some(i)
    }

    pub(crate) fn pcb_assert_closed(&self, i: PcbIndex) {
        let pcb = &self.pcbs[i];
        debug_assert!(!pcb.timers.is_set(PcbTimer::Abort));
        debug_assert!(!pcb.timers.is_set(PcbTimer::Output));
        debug_assert!(!pcb.timers.is_set(PcbTimer::Rtx));
        debug_assert!(pcb.state == TcpStatus::Closed);
        debug_assert!(pcb.con == PcbRef::None);
    }

    /// Abort a PCB, sending an RST in all states except SYN_SENT, SYN_RCVD
    /// and TIME_WAIT.
    pub(crate) fn pcb_abort_default(&mut self, i: PcbIndex) {
        let send_rst = !matches!(
            self.pcbs[i].state,
            TcpStatus::SynSent | TcpStatus::SynRcvd | TcpStatus::TimeWait
        );
        self.pcb_abort(i, send_rst);
    }

    pub(crate) fn pcb_abort(&mut self, i: PcbIndex, send_rst: bool) {
        debug_assert!(self.pcbs[i].state != TcpStatus::Closed);

        if send_rst {
            self.pcb_send_rst(i);
        }

        if self.pcbs[i].state == TcpStatus::SynRcvd {
            self.pcb_unlink_lis(i);
        } else {
            // This calls the aborted callback if a connection is attached.
            self.pcb_unlink_con(i, true);
        }

        // If this is called from input processing of this PCB, clear the
        // current-PCB marker so input processing can detect the abort.
        if self.current_pcb == Some(i) {
            self.current_pcb = None;
        }

        // Remove the PCB from the index it is in.
        let key = self.pcbs[i].key;
        if self.pcbs[i].state == TcpStatus::TimeWait {
            let removed = self.index_timewait.remove(&key);
            debug_assert!(removed == Some(i));
        } else {
            let removed = self.index_active.remove(&key);
            debug_assert!(removed == Some(i));
        }

        // Make sure the PCB sits at the eviction end of the LRU.
        self.unrefed_remove(i);
        self.unrefed.push_back(i);

        let pcb = &mut self.pcbs[i];
        pcb.timers.unset_all();
        self.mark_timers_dirty();
        self.pcbs[i].state = TcpStatus::Closed;

        self.pcb_assert_closed(i);
    }

    pub(crate) fn pcb_go_to_time_wait(&mut self, i: PcbIndex) {
        debug_assert!(!matches!(
            self.pcbs[i].state,
            TcpStatus::Closed | TcpStatus::SynRcvd | TcpStatus::TimeWait
        ));

        self.pcb_unlink_con(i, false);

        let key = self.pcbs[i].key;
        let pcb = &mut self.pcbs[i];
        // Do not accept any more acknowledgements.
        pcb.snd_nxt = pcb.snd_una;
        pcb.state = TcpStatus::TimeWait;

        let removed = self.index_active.remove(&key);
        debug_assert!(removed == Some(i));
        let prev = self.index_timewait.insert(key, i);
        debug_assert!(prev.is_none());

        let time_wait = self.cfg.time_wait_time_ticks;
        let now = self.now;
        let pcb = &mut self.pcbs[i];
        pcb.timers.unset(PcbTimer::Output);
        pcb.timers.unset(PcbTimer::Rtx);
        pcb.clear_flag(PcbFlags::OUT_PENDING);
        pcb.timers.set_after(PcbTimer::Abort, now, time_wait);
        self.mark_timers_dirty();
    }

    pub(crate) fn pcb_go_to_fin_wait_2(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state == TcpStatus::FinWait1);

        let pcb = &mut self.pcbs[i];
        pcb.state = TcpStatus::FinWait2;
        pcb.timers.unset(PcbTimer::Output);
        pcb.timers.unset(PcbTimer::Rtx);
        pcb.clear_flag(PcbFlags::OUT_PENDING);
        self.mark_timers_dirty();
    }

    /// Detach any connection from the PCB, delivering the aborted callback.
    /// The PCB is off the unreferenced list for the duration of the
    /// callback, which protects it from being claimed by allocate_pcb from
    /// within; afterwards it joins at the eviction end (`closing`) or the
    /// protected end.
    pub(crate) fn pcb_unlink_con(&mut self, i: PcbIndex, closing: bool) {
        debug_assert!(!matches!(self.pcbs[i].state, TcpStatus::Closed | TcpStatus::SynRcvd));

        if let Some(ci) = self.pcbs[i].conn_index() {
            self.pcbs[i].con = PcbRef::None;
            self.conn_pcb_aborted(ci);
            debug_assert!(self.pcbs[i].con == PcbRef::None);
            if closing {
                self.unrefed.push_back(i);
            } else {
                self.unrefed.push_front(i);
            }
        }
    }

    fn pcb_unlink_lis(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state == TcpStatus::SynRcvd);
        let li = match self.pcbs[i].con {
            PcbRef::Lis(li) => li,
            _ => unreachable!("SYN_RCVD PCB without a listener"),
        };

        let was_accept_pcb = {
            let lis = self.lis_mut(li);
            debug_assert!(lis.num_pcbs > 0);
            lis.num_pcbs -= 1;
            if lis.accept_pcb == Some(i) {
                lis.accept_pcb = None;
                true
            } else {
                false
            }
        };

        // A PCB being accepted was taken off the unreferenced list; put it
        // back since the accept is not happening.
        if was_accept_pcb {
            self.unrefed.push_back(i);
        }

        self.pcbs[i].con = PcbRef::None;
    }

    /// The application has abandoned the connection; the extra state is
    /// gone. Finish the protocol exchange autonomously or abort.
    pub(crate) fn pcb_abandoned(&mut self, i: PcbIndex, rst_needed: bool, rcv_ann_thres: SeqType) {
        debug_assert!(
            self.pcbs[i].state == TcpStatus::SynSent || self.pcbs[i].state.is_active()
        );
        debug_assert!(self.pcbs[i].con == PcbRef::None);

        self.unrefed.push_back(i);

        // The variables for RTT measurement are gone with the connection,
        // and RCV_WND_UPD must imply an attached connection.
        let pcb = &mut self.pcbs[i];
        pcb.clear_flag(PcbFlags::RTT_PENDING);
        pcb.clear_flag(PcbFlags::RCV_WND_UPD);

        // Abort on an unfinished handshake, queued unsent data or received
        // data the application never consumed (RFC 2525 section 2.17).
        if self.pcbs[i].state == TcpStatus::SynSent || rst_needed {
            return self.pcb_abort_default(i);
        }

        // The idle timeout requires an attached connection when it expires.
        if self.pcbs[i].has_flag(PcbFlags::IDLE_TIMER) {
            self.pcbs[i].clear_flag(PcbFlags::IDLE_TIMER);
            self.pcbs[i].timers.unset(PcbTimer::Rtx);
        }

        if self.pcbs[i].state.is_snd_open() {
            self.pcb_end_sending(i);
        }

        // If the FIN has not arrived yet, possibly announce more window to
        // encourage the peer to send its outstanding data and FIN.
        if self.pcbs[i].state.is_accepting_data() {
            self.pcb_update_rcv_wnd_after_abandoned(i, rcv_ann_thres);
        }

        let now = self.now;
        let timeout = self.cfg.abandoned_timeout_ticks;
        self.pcbs[i].timers.set_after(PcbTimer::Abort, now, timeout);
        self.mark_timers_dirty();
    }

    pub(crate) fn pcb_abrt_timer_handler(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state != TcpStatus::Closed);
        self.pcb_abort_default(i);
    }

    /// Whether the PCB owning the current input stack frame was aborted by
    /// a user callback.
    pub(crate) fn pcb_aborted_in_callback(&self, i: PcbIndex) -> bool {
        debug_assert!(self.current_pcb == Some(i) || self.current_pcb.is_none());
        self.current_pcb.is_none()
    }

    /// Whether the current call stack is inside input processing of this
    /// PCB.
    pub(crate) fn pcb_in_input(&self, i: PcbIndex) -> bool {
        self.current_pcb == Some(i)
    }

    /// ISS is the low 32 bits of the platform clock.
    pub(crate) fn make_iss(&self) -> SeqType {
        self.now as SeqType
    }

    pub(crate) fn find_listener(&self, addr: Ipv4Addr, port: u16) -> Option<usize> {
        self.listeners.iter().position(|slot| {
            slot.state.as_ref().is_some_and(|l| l.addr == addr && l.port == port)
        })
    }

    /// Find a listener for an incoming segment, considering wildcard binds.
    pub(crate) fn find_listener_for_rx(&self, local_addr: Ipv4Addr, local_port: u16) -> Option<usize> {
        self.listeners.iter().position(|slot| {
            slot.state.as_ref().is_some_and(|l| {
                l.port == local_port && (l.addr == local_addr || l.addr.is_unspecified())
            })
        })
    }

    /// Abort all SYN_RCVD PCBs of a listener going away (without RST).
    pub(crate) fn unlink_listener(&mut self, li: usize) {
        for i in 0..self.pcbs.len() {
            if self.pcbs[i].state == TcpStatus::SynRcvd && self.pcbs[i].con == PcbRef::Lis(li) {
                self.pcb_abort(i, false);
            }
        }
    }

    /// Set up a PCB for an actively opened connection and send the SYN.
    pub(crate) fn create_connection(
        &mut self,
        ci: usize,
        args: &ConnectArgs,
    ) -> Result<PcbIndex, IpErr> {
        let (local_addr, iface_mtu) = self.ip.select_local_addr(args.addr)?;

        let local_port = self
            .get_ephemeral_port(local_addr, args.addr, args.port)
            .ok_or(IpErr::NoPortAvail)?;

        let iface_mss = iface_mtu - IP4_TCP_HEADER_SIZE;

        let i = self.allocate_pcb().ok_or(IpErr::NoPcbAvail)?;

        // This use is referenced (a connection holds the PCB).
        self.unrefed_remove(i);

        let iss = self.make_iss();

        // The initial receive window is at least one for the SYN and at
        // most 16 bits wide since the SYN has an unscaled window field.
        let rcv_wnd = 1 + u32::from(u16::MAX - 1).min(args.rcv_wnd as u32);

        let rto = self.cfg.initial_rtx_time;
        let rcv_wnd_shift = self.cfg.rcv_wnd_shift;
        let pcb = &mut self.pcbs[i];
        pcb.key = PcbKey {
            local_addr,
            remote_addr: args.addr,
            local_port,
            remote_port: args.port,
        };
        pcb.state = TcpStatus::SynSent;
        pcb.flags = PcbFlags::WND_SCALE; // send the window scale option
        pcb.con = PcbRef::Conn(ci);
        pcb.rcv_nxt = 0; // it is sent in the SYN
        pcb.rcv_ann_wnd = rcv_wnd;
        pcb.snd_una = iss;
        pcb.snd_nxt = iss;
        pcb.snd_mss = iface_mss;
        pcb.base_snd_mss = iface_mss; // finalized when the SYN-ACK arrives
        pcb.rto = rto;
        pcb.num_dupack = 0;
        pcb.snd_wnd_shift = 0;
        pcb.rcv_wnd_shift = rcv_wnd_shift;

        let remote_addr = args.addr;
        let pmtu = self.ip.pmtu_estimate(remote_addr);
        let con = self.conn_mut(ci);
        con.pcb = Some(i);
        con.pmtu = pmtu;

        let key = self.pcbs[i].key;
        let prev = self.index_active.insert(key, i);
        debug_assert!(prev.is_none());

        let now = self.now;
        let syn_sent_timeout = self.cfg.syn_sent_timeout_ticks;
        let rto_ticks = self.pcb_rto_ticks(i);
        let pcb = &mut self.pcbs[i];
        pcb.timers.set_after(PcbTimer::Abort, now, syn_sent_timeout);
        pcb.timers.set_after(PcbTimer::Rtx, now, rto_ticks);
        self.mark_timers_dirty();

        self.pcb_send_syn(i);

        Ok(i)
    }

    /// Allocate an ephemeral port by linear probe from a rotating cursor.
    fn get_ephemeral_port(
        &mut self,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> Option<u16> {
        let first = self.cfg.ephemeral_port_first;
        let last = self.cfg.ephemeral_port_last;
        let num_ports = usize::from(last - first) + 1;

        for _ in 0..num_ports {
            let port = self.next_ephemeral_port;
            self.next_ephemeral_port = if port < last { port + 1 } else { first };

            let key = PcbKey { local_addr, remote_addr, local_port: port, remote_port };
            if self.find_pcb(&key).is_none() {
                return Some(port);
            }
        }

        None
    }

    /// Exactly when a PCB belongs on the unreferenced list.
    pub(crate) fn pcb_is_in_unreferenced_list(&self, i: PcbIndex) -> bool {
        let pcb = &self.pcbs[i];
        match pcb.con {
            PcbRef::Lis(li) => {
                debug_assert!(pcb.state == TcpStatus::SynRcvd);
                self.lis(li).accept_pcb != Some(i)
            }
            PcbRef::Conn(_) => false,
            PcbRef::None => true,
        }
    }

    /// Mark a PCB most recently used, protecting it from eviction.
    pub(crate) fn move_unrefed_pcb_to_front(&mut self, i: PcbIndex) {
        debug_assert!(self.pcb_is_in_unreferenced_list(i));
        if self.unrefed.front() != Some(&i) {
            self.unrefed_remove(i);
            self.unrefed.push_front(i);
        }
    }

    pub(crate) fn unrefed_remove(&mut self, i: PcbIndex) {
        if let Some(pos) = self.unrefed.iter().position(|&x| x == i) {
            self.unrefed.remove(pos);
        }
    }

    /// Demultiplex by 4-tuple: the active index first, then time-wait.
    pub(crate) fn find_pcb(&self, key: &PcbKey) -> Option<PcbIndex> {
        if let Some(&i) = self.index_active.get(key) {
            debug_assert!(!matches!(
                self.pcbs[i].state,
                TcpStatus::Closed | TcpStatus::TimeWait
            ));
            return Some(i);
        }
        if let Some(&i) = self.index_timewait.get(key) {
            debug_assert!(self.pcbs[i].state == TcpStatus::TimeWait);
            return Some(i);
        }
        None
    }
}
