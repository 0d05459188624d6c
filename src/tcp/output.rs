//! TCP output: segmentation, congestion control, RTT estimation and the
//! retransmission, window-probe and output timers.

use crate::buf::{BufRef, BufSeg};
use crate::ip::defs::{IpErr, Ipv4RxInfo, Ipv4Type};
use crate::ip::packet::ChksumAccumulator;
use crate::ip::send::{IpSendParams, IpSender, RetryToken};
use crate::tcp::defs::{
    calc_initial_cwnd, seq_add, seq_diff, seq_mod_gte, seq_mod_lt, PcbFlags, SeqType, TcpStatus,
    FAST_RTX_DUP_ACKS, IP4_TCP_HEADER_SIZE, MIN_ALLOWED_MSS,
};
use crate::tcp::packet::{self, tcp_seq_len, TcpFlags, TcpOptions, TcpSegMeta};
use crate::tcp::pcb::{PcbIndex, PcbKey};
use crate::tcp::timer::PcbTimer;
use crate::tcp::usrreq::TcpStack;

/// How a segment reaches the IP layer: through a route prepared for a burst
/// or routed per datagram.
enum SendRoute<'a, P> {
    Prepared(&'a P),
    Direct,
}

/// Assemble one TCP segment into the scratch buffer and hand it to the IP
/// layer, computing the checksum over the pseudo-header, header and data
/// without copying the data.
#[allow(clippy::too_many_arguments)]
fn build_and_send<I: IpSender>(
    ip: &mut I,
    tx_buf: &mut Vec<u8>,
    route: SendRoute<'_, I::Prepared>,
    key: &PcbKey,
    seq_num: SeqType,
    ack_num: SeqType,
    window_size: u16,
    flags: TcpFlags,
    opts: Option<&TcpOptions>,
    data: (&[u8], &[u8]),
    retry: Option<RetryToken>,
    ttl: u8,
) -> Result<(), IpErr> {
    tx_buf.clear();
    let chksum_at = packet::write_header(
        tx_buf,
        key.local_port,
        key.remote_port,
        seq_num,
        ack_num,
        flags,
        window_size,
        opts,
    );

    let tcp_len = tx_buf.len() + data.0.len() + data.1.len();
    let mut chksum = ChksumAccumulator::new();
    chksum.add_u32(u32::from(key.local_addr));
    chksum.add_u32(u32::from(key.remote_addr));
    chksum.add_u16(u16::from(u8::from(Ipv4Type::TCP)));
    chksum.add_u16(tcp_len as u16);
    chksum.add_bytes(tx_buf);
    chksum.add_bytes(data.0);
    chksum.add_bytes(data.1);
    let sum = chksum.finish();
    tx_buf[chksum_at..chksum_at + 2].copy_from_slice(&sum.to_be_bytes());

    let seg_b = BufSeg::new(data.1);
    let seg_a = BufSeg::with_next(data.0, &seg_b);
    let seg_h = BufSeg::with_next(tx_buf.as_slice(), &seg_a);
    let dgram = BufRef::new(seg_h, 0, tcp_len);

    let params =
        IpSendParams { ttl, protocol: u8::from(Ipv4Type::TCP), dont_fragment: true };
    match route {
        SendRoute::Prepared(prep) => ip.send_prepared(prep, dgram, retry),
        SendRoute::Direct => ip.send(key.local_addr, key.remote_addr, params, dgram, retry),
    }
}

/// snd_mss for a path MTU, bounded by base_snd_mss. Cannot go below
/// MIN_ALLOWED_MSS: base_snd_mss was checked at negotiation and the PMTU
/// estimate never falls below the minimum MTU.
pub(crate) fn calc_snd_mss_from_pmtu(base_snd_mss: u16, pmtu: u16) -> u16 {
    let mtu_mss = pmtu - IP4_TCP_HEADER_SIZE;
    let snd_mss = base_snd_mss.min(mtu_mss);
    debug_assert!(snd_mss >= MIN_ALLOWED_MSS);
    snd_mss
}

impl<I: IpSender> TcpStack<I> {
    /// Send a segment carrying no data, routed per datagram.
    pub(crate) fn send_tcp_nodata(
        &mut self,
        key: &PcbKey,
        seq_num: SeqType,
        ack_num: SeqType,
        window_size: u16,
        flags: TcpFlags,
        opts: Option<&TcpOptions>,
        retry: Option<RetryToken>,
    ) -> Result<(), IpErr> {
        let ttl = self.cfg.tcp_ttl;
        let TcpStack { ref mut ip, ref mut tx_buf, .. } = *self;
        build_and_send(
            ip,
            tx_buf,
            SendRoute::Direct,
            key,
            seq_num,
            ack_num,
            window_size,
            flags,
            opts,
            (&[], &[]),
            retry,
            ttl,
        )
    }

    /// Check if our FIN has been acknowledged.
    pub(crate) fn pcb_fin_acked(&self, i: PcbIndex) -> bool {
        let pcb = &self.pcbs[i];
        pcb.has_flag(PcbFlags::FIN_SENT) && pcb.snd_una == pcb.snd_nxt
    }

    /// Send a SYN or SYN-ACK (in SYN_SENT or SYN_RCVD respectively).
    pub(crate) fn pcb_send_syn(&mut self, i: PcbIndex) {
        let state = self.pcbs[i].state;
        debug_assert!(state.is_synsent_or_rcvd());

        // Include the MSS option. The interface MSS sits in base_snd_mss in
        // SYN_SENT and temporarily in snd_mss in SYN_RCVD.
        let mut opts = TcpOptions {
            mss: Some(if state == TcpStatus::SynSent {
                self.pcbs[i].base_snd_mss
            } else {
                self.pcbs[i].snd_mss
            }),
            wnd_scale: None,
        };
        if self.pcbs[i].has_flag(PcbFlags::WND_SCALE) {
            opts.wnd_scale = Some(self.pcbs[i].rcv_wnd_shift);
        }

        // SYN and SYN-ACK always carry a non-scaled window.
        debug_assert!(self.pcbs[i].rcv_ann_wnd <= u32::from(u16::MAX));
        let window_size = self.pcbs[i].rcv_ann_wnd as u16;

        let flags = TcpFlags::SYN
            | if state == TcpStatus::SynRcvd { TcpFlags::ACK } else { TcpFlags::empty() };

        let key = self.pcbs[i].key;
        let (snd_una, snd_nxt, rcv_nxt) =
            (self.pcbs[i].snd_una, self.pcbs[i].snd_nxt, self.pcbs[i].rcv_nxt);

        let err = self.send_tcp_nodata(
            &key,
            snd_una,
            rcv_nxt,
            window_size,
            flags,
            Some(&opts),
            Some(RetryToken(i as u32)),
        );

        if err.is_ok() {
            if snd_nxt == snd_una {
                // First transmission: start the RTT measurement.
                self.pcb_start_rtt_measurement(i, true);
                self.pcbs[i].snd_nxt = seq_add(snd_una, 1);
            } else {
                // Retransmission: any RTT measurement is void.
                self.pcbs[i].clear_flag(PcbFlags::RTT_PENDING);
            }
        }
    }

    /// Send an empty ACK (which may be a window update).
    pub(crate) fn pcb_send_empty_ack(&mut self, i: PcbIndex) {
        let window_size = self.pcb_ann_wnd(i);
        let key = self.pcbs[i].key;
        let (snd_nxt, rcv_nxt) = (self.pcbs[i].snd_nxt, self.pcbs[i].rcv_nxt);
        let _ = self.send_tcp_nodata(
            &key,
            snd_nxt,
            rcv_nxt,
            window_size,
            TcpFlags::ACK,
            None,
            None,
        );
    }

    pub(crate) fn pcb_send_rst(&mut self, i: PcbIndex) {
        let ack = self.pcbs[i].state != TcpStatus::SynSent;
        let key = self.pcbs[i].key;
        let (snd_nxt, rcv_nxt) = (self.pcbs[i].snd_nxt, self.pcbs[i].rcv_nxt);
        self.send_rst(&key, snd_nxt, ack, rcv_nxt);
    }

    /// RST per RFC 793 for segments not belonging to a known connection.
    pub(crate) fn send_rst_reply(
        &mut self,
        ip_info: &Ipv4RxInfo,
        meta: &TcpSegMeta,
        tcp_data_len: usize,
    ) {
        let (rst_seq_num, rst_ack, rst_ack_num) = if meta.flags.contains(TcpFlags::ACK) {
            (meta.ack_num, false, 0)
        } else {
            (0, true, seq_add(meta.seq_num, tcp_seq_len(meta.flags, tcp_data_len) as SeqType))
        };
        let key = PcbKey {
            local_addr: ip_info.dst_addr,
            remote_addr: ip_info.src_addr,
            local_port: meta.dst_port,
            remote_port: meta.src_port,
        };
        self.send_rst(&key, rst_seq_num, rst_ack, rst_ack_num);
    }

    pub(crate) fn send_rst(
        &mut self,
        key: &PcbKey,
        seq_num: SeqType,
        ack: bool,
        ack_num: SeqType,
    ) {
        let flags = TcpFlags::RST | if ack { TcpFlags::ACK } else { TcpFlags::empty() };
        let _ = self.send_tcp_nodata(key, seq_num, ack_num, 0, flags, None, None);
    }

    /// Ensure an ACK goes out: flag it during input processing, send it
    /// immediately otherwise.
    pub(crate) fn pcb_need_ack(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state != TcpStatus::Closed);
        if self.pcb_in_input(i) {
            self.pcbs[i].set_flag(PcbFlags::ACK_PENDING);
        } else {
            self.pcb_send_empty_ack(i);
        }
    }

    /// The application queued more data.
    pub(crate) fn pcb_snd_buf_extended(&mut self, i: PcbIndex) {
        let state = self.pcbs[i].state;
        debug_assert!(state == TcpStatus::SynSent || state.is_snd_open());
        if state != TcpStatus::SynSent {
            self.pcb_set_output_timer_for_output(i);
        }
    }

    /// Sending was closed; queue the FIN and transition state.
    pub(crate) fn pcb_end_sending(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state.is_snd_open());

        let new_state = if self.pcbs[i].state == TcpStatus::Established {
            TcpStatus::FinWait1
        } else {
            debug_assert!(self.pcbs[i].state == TcpStatus::CloseWait);
            TcpStatus::LastAck
        };
        self.pcbs[i].state = new_state;
        self.pcbs[i].set_flag(PcbFlags::FIN_PENDING);

        self.pcb_push_output(i);
    }

    /// Schedule a pcb_output call soon.
    pub(crate) fn pcb_push_output(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_outstanding(i));

        if self.pcb_in_input(i) {
            self.pcbs[i].set_flag(PcbFlags::OUT_PENDING);
        } else {
            self.pcb_set_output_timer_for_output(i);
        }
    }

    /// Any unacknowledged or unsent data or FIN?
    pub(crate) fn pcb_has_snd_outstanding(&self, i: PcbIndex) -> bool {
        debug_assert!(self.pcbs[i].state.can_output());

        // After close_sending a FIN is outstanding until acked.
        if !self.pcbs[i].state.is_snd_open() {
            return true;
        }

        // Sending still open implies an attached connection.
        let ci = self.pcbs[i].conn_index().expect("send open without connection");
        self.conn(ci).snd.len() > 0
    }

    /// Any data or FIN sent but not acknowledged? Not the same as
    /// snd_una != snd_nxt because of requeuing on retransmission.
    pub(crate) fn pcb_has_snd_unacked(&self, i: PcbIndex) -> bool {
        debug_assert!(self.pcbs[i].state.can_output());

        if let Some(ci) = self.pcbs[i].conn_index() {
            if self.conn(ci).snd.cur > 0 {
                return true;
            }
        }
        !self.pcbs[i].state.is_snd_open() && !self.pcbs[i].has_flag(PcbFlags::FIN_PENDING)
    }

    /// Transmit queued data as permitted.
    ///
    /// With `rtx_or_window_probe` set, sends exactly one segment from the
    /// start of the send buffer, respecting only snd_wnd (not cwnd) and
    /// forcing at least one sequence count; the queue position and
    /// FIN_PENDING are left alone.
    pub(crate) fn pcb_output_active(&mut self, i: PcbIndex, rtx_or_window_probe: bool) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_outstanding(i));
        let ci = self.pcbs[i].conn_index().expect("active output without connection");

        let key = self.pcbs[i].key;
        let state = self.pcbs[i].state;
        let snd_mss = usize::from(self.pcbs[i].snd_mss);

        let (mut cursor, mut rem_wnd, data_threshold, mut fin) = {
            let con = self.conn(ci);
            if rtx_or_window_probe {
                // From the start of the buffer, at least one count, cwnd
                // ignored, FIN allowed whenever sending is closed.
                (0usize, con.snd_wnd.max(1), 0usize, !state.is_snd_open())
            } else {
                debug_assert!(con.cwnd >= u32::from(self.pcbs[i].snd_mss));
                debug_assert!(con.snd.cur <= con.snd.len());
                debug_assert!(con.snd.psh_index <= con.snd.len());

                let full_wnd = con.snd_wnd.min(con.cwnd);
                let rem_wnd = full_wnd.saturating_sub(con.snd.cur as SeqType);

                // Delay only when less than snd_mss remains and none of it
                // is pushed.
                let psh_to_end = con.snd.len() - con.snd.psh_index;
                let data_threshold = psh_to_end.min(snd_mss - 1);

                (con.snd.cur, rem_wnd, data_threshold, self.pcbs[i].has_flag(PcbFlags::FIN_PENDING))
            }
        };

        // Window announcement, ACK number and route are per-burst.
        let window_size = self.pcb_ann_wnd(i);
        let ack_num = self.pcbs[i].rcv_nxt;
        let params = IpSendParams {
            ttl: self.cfg.tcp_ttl,
            protocol: u8::from(Ipv4Type::TCP),
            dont_fragment: true,
        };
        let prepared = self.ip.prepare_send(key.local_addr, key.remote_addr, params);

        let mut send_err = None;
        match prepared {
            Err(e) => {
                if rtx_or_window_probe {
                    return;
                }
                send_err = Some(e);
            }
            Ok(prep) => {
                // Send while there is non-delayable data or a FIN queued and
                // window remains. For rtx_or_window_probe this holds on
                // entry and the loop exits by returning.
                loop {
                    let unsent = self.conn(ci).snd.len() - cursor;
                    if !(unsent > data_threshold || fin) || rem_wnd == 0 {
                        break;
                    }
                    let seg_len = unsent.min(rem_wnd as usize).min(snd_mss);

                    let mut seg_flags = TcpFlags::ACK;
                    let mut seg_fin = false;
                    // A FIN goes out when it is queued, no data follows it,
                    // and the window has room for it.
                    if fin && seg_len == unsent && (rem_wnd as usize) > seg_len {
                        seg_flags |= TcpFlags::FIN | TcpFlags::PSH;
                        seg_fin = true;
                    }
                    let psh_index = self.conn(ci).snd.psh_index;
                    if cursor < psh_index && psh_index <= cursor + seg_len {
                        seg_flags |= TcpFlags::PSH;
                    }

                    let seq_num = seq_add(self.pcbs[i].snd_una, cursor as SeqType);

                    let err = {
                        let TcpStack { ref mut ip, ref mut tx_buf, ref conns, ref cfg, .. } =
                            *self;
                        let con = conns[ci].state.as_ref().unwrap();
                        let data = con.snd.range(cursor, seg_len);
                        build_and_send(
                            ip,
                            tx_buf,
                            SendRoute::Prepared(&prep),
                            &key,
                            seq_num,
                            ack_num,
                            window_size,
                            seg_flags,
                            None,
                            data,
                            Some(RetryToken(i as u32)),
                            cfg.tcp_ttl,
                        )
                    };

                    if let Err(e) = err {
                        // On FragNeeded make sure the path MTU estimate does
                        // not exceed the interface MTU (the interface MTU may
                        // have been lowered). No immediate resend.
                        if e == IpErr::FragNeeded {
                            if let Some(pmtu) = self.ip.handle_local_packet_too_big(key.remote_addr)
                            {
                                self.pcb_pmtu_changed(i, pmtu);
                            }
                        }
                        if rtx_or_window_probe {
                            return;
                        }
                        send_err = Some(e);
                        break;
                    }

                    let seg_seqlen = seg_len + usize::from(seg_fin);
                    debug_assert!(seg_seqlen > 0 && seg_seqlen <= rem_wnd as usize);
                    debug_assert!(seg_seqlen <= unsent + usize::from(fin));

                    if seg_fin {
                        self.pcbs[i].set_flag(PcbFlags::FIN_SENT);
                    }

                    // Void the RTT measurement if this was a retransmission
                    // over the measured sequence number.
                    if self.pcbs[i].has_flag(PcbFlags::RTT_PENDING) {
                        let rtt_test_seq = self.conn(ci).rtt_test_seq;
                        if rtt_test_seq.wrapping_sub(seq_num) < seg_seqlen as SeqType {
                            self.pcbs[i].clear_flag(PcbFlags::RTT_PENDING);
                        }
                    }

                    // Anything new sent?
                    let seg_endseq = seq_add(seq_num, seg_seqlen as SeqType);
                    if seq_mod_lt(self.pcbs[i].snd_nxt, seg_endseq) {
                        if !self.pcbs[i].has_flag(PcbFlags::RTT_PENDING) {
                            self.pcb_start_rtt_measurement(i, false);
                        }
                        self.pcbs[i].snd_nxt = seg_endseq;
                    }

                    if rtx_or_window_probe {
                        return;
                    }

                    let data_sent = if seg_seqlen > unsent {
                        // The FIN went out with the tail of the data.
                        debug_assert!(self.pcbs[i].has_flag(PcbFlags::FIN_PENDING));
                        self.pcbs[i].clear_flag(PcbFlags::FIN_PENDING);
                        fin = false;
                        unsent
                    } else {
                        seg_seqlen
                    };

                    if data_sent > 0 {
                        cursor += data_sent;
                        self.conn_mut(ci).snd.cur = cursor;
                    }
                    rem_wnd -= seg_seqlen as SeqType;

                    // No empty ACK needed after this.
                    self.pcbs[i].clear_flag(PcbFlags::ACK_PENDING);
                }
            }
        }

        if let Some(e) = send_err {
            self.pcb_set_output_timer_for_retry(i, e);
        }

        // Leaving output: the rtx timer may only remain as a true
        // retransmission/probe timer, not the idle timer.
        if self.pcbs[i].has_flag(PcbFlags::IDLE_TIMER) {
            self.pcbs[i].clear_flag(PcbFlags::IDLE_TIMER);
            self.pcbs[i].timers.unset(PcbTimer::Rtx);
            self.mark_timers_dirty();
        }

        // Arm the retransmission timer if there is sent-unacked data, or a
        // zero window calls for probing.
        if !self.pcbs[i].timers.is_set(PcbTimer::Rtx)
            && (self.pcb_has_snd_unacked(i) || self.conn(ci).snd_wnd == 0)
        {
            let now = self.now;
            let rto_ticks = self.pcb_rto_ticks(i);
            self.pcbs[i].timers.set_after(PcbTimer::Rtx, now, rto_ticks);
            self.mark_timers_dirty();
        }
    }

    /// Output for a PCB whose connection was abandoned: only a FIN can be
    /// queued.
    fn pcb_output_abandoned(&mut self, i: PcbIndex, rtx_or_window_probe: bool) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcbs[i].conn_index().is_none());
        // Implied by the connection being gone, see pcb_abandoned.
        debug_assert!(!self.pcbs[i].state.is_snd_open());
        debug_assert!(!self.pcbs[i].has_flag(PcbFlags::IDLE_TIMER));

        if rtx_or_window_probe || self.pcbs[i].has_flag(PcbFlags::FIN_PENDING) {
            let window_size = self.pcb_ann_wnd(i);
            let key = self.pcbs[i].key;
            let (snd_una, rcv_nxt) = (self.pcbs[i].snd_una, self.pcbs[i].rcv_nxt);
            let err = self.send_tcp_nodata(
                &key,
                snd_una,
                rcv_nxt,
                window_size,
                TcpFlags::ACK | TcpFlags::FIN | TcpFlags::PSH,
                None,
                Some(RetryToken(i as u32)),
            );

            if err.is_ok() {
                let pcb = &mut self.pcbs[i];
                pcb.set_flag(PcbFlags::FIN_SENT);
                if pcb.snd_nxt == pcb.snd_una {
                    pcb.snd_nxt = seq_add(pcb.snd_una, 1);
                }
            }

            if rtx_or_window_probe {
                return;
            }

            match err {
                Err(e) => self.pcb_set_output_timer_for_retry(i, e),
                Ok(()) => {
                    self.pcbs[i].clear_flag(PcbFlags::FIN_PENDING);
                    self.pcbs[i].clear_flag(PcbFlags::ACK_PENDING);
                }
            }
        }

        // Same retransmission-timer logic as active output, reduced.
        if !self.pcbs[i].timers.is_set(PcbTimer::Rtx)
            && !self.pcbs[i].has_flag(PcbFlags::FIN_PENDING)
        {
            let now = self.now;
            let rto_ticks = self.pcb_rto_ticks(i);
            self.pcbs[i].timers.set_after(PcbTimer::Rtx, now, rto_ticks);
            self.mark_timers_dirty();
        }
    }

    pub(crate) fn pcb_output(&mut self, i: PcbIndex, rtx_or_window_probe: bool) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_outstanding(i));

        if self.pcbs[i].conn_index().is_some() {
            self.pcb_output_active(i, rtx_or_window_probe);
        } else {
            self.pcb_output_abandoned(i, rtx_or_window_probe);
        }
    }

    pub(crate) fn pcb_output_timer_handler(&mut self, i: PcbIndex) {
        self.pcb_output(i, false);
    }

    pub(crate) fn pcb_rtx_timer_handler(&mut self, i: PcbIndex) {
        // Only armed in SYN_SENT, SYN_RCVD and output-capable states; any
        // transition elsewhere stops it.
        let state = self.pcbs[i].state;
        debug_assert!(state.is_synsent_or_rcvd() || state.can_output());

        // Idle timeout rather than retransmission?
        if self.pcbs[i].has_flag(PcbFlags::IDLE_TIMER) {
            self.pcbs[i].clear_flag(PcbFlags::IDLE_TIMER);

            debug_assert!(state.can_output());
            debug_assert!(!self.pcb_has_snd_unacked(i));
            let ci = self.pcbs[i].conn_index().expect("idle timeout without connection");

            // Collapse cwnd back to the initial window (RFC 5681 section
            // 4.1) and forget accumulated cwnd credit.
            let initial_cwnd = calc_initial_cwnd(self.pcbs[i].snd_mss);
            let reset_to_initial = {
                let con = self.conn_mut(ci);
                if con.cwnd >= initial_cwnd {
                    con.cwnd = initial_cwnd;
                    true
                } else {
                    false
                }
            };
            if reset_to_initial {
                self.pcbs[i].set_flag(PcbFlags::CWND_INIT);
            }
            self.conn_mut(ci).cwnd_acked = 0;
            return;
        }

        let syn_sent_rcvd = state.is_synsent_or_rcvd();
        debug_assert!(syn_sent_rcvd || self.pcb_has_snd_outstanding(i));

        // Spurious expiration after the timer is no longer needed.
        if !syn_sent_rcvd && !self.pcb_has_snd_unacked(i) {
            let wnd_nonzero = match self.pcbs[i].conn_index() {
                Some(ci) => self.conn(ci).snd_wnd != 0,
                None => true,
            };
            if wnd_nonzero {
                return;
            }
        }

        // Exponential backoff, capped.
        let doubled = self.pcbs[i].rto.saturating_mul(2);
        self.pcbs[i].rto = doubled.min(self.cfg.max_rtx_time);
        let now = self.now;
        let rto_ticks = self.pcb_rto_ticks(i);
        self.pcbs[i].timers.set_after(PcbTimer::Rtx, now, rto_ticks);
        self.mark_timers_dirty();

        if syn_sent_rcvd {
            self.pcb_send_syn(i);
            return;
        }

        let abandoned_or_zero_wnd = match self.pcbs[i].conn_index() {
            Some(ci) => self.conn(ci).snd_wnd == 0,
            None => true,
        };
        if abandoned_or_zero_wnd {
            // FIN retransmission or window probe.
            self.pcb_output(i, true);
        } else {
            // Data (or FIN) loss. On the first retransmission of this
            // episode update ssthresh (RFC 5681).
            if !self.pcbs[i].has_flag(PcbFlags::RTX_ACTIVE) {
                self.pcbs[i].set_flag(PcbFlags::RTX_ACTIVE);
                self.pcb_update_ssthresh_for_rtx(i);
            }

            let ci = self.pcbs[i].conn_index().unwrap();
            let snd_mss = SeqType::from(self.pcbs[i].snd_mss);
            let snd_nxt = self.pcbs[i].snd_nxt;
            {
                let con = self.conn_mut(ci);
                con.cwnd = snd_mss;
                con.cwnd_acked = 0;
                con.recover = snd_nxt;
            }
            self.pcbs[i].clear_flag(PcbFlags::CWND_INIT);
            self.pcbs[i].set_flag(PcbFlags::RECOVER);

            // Exit any fast recovery.
            self.pcbs[i].num_dupack = 0;

            self.pcb_requeue_everything(i);
            self.pcb_output_active(i, false);
        }
    }

    pub(crate) fn pcb_requeue_everything(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state.can_output());

        if let Some(ci) = self.pcbs[i].conn_index() {
            self.conn_mut(ci).snd.requeue();
        }
        if !self.pcbs[i].state.is_snd_open() {
            self.pcbs[i].set_flag(PcbFlags::FIN_PENDING);
        }
    }

    /// Called from input when something new is acked, before snd_una and
    /// the send queue are updated.
    pub(crate) fn pcb_output_handle_acked(&mut self, i: PcbIndex, ack_num: SeqType, acked: SeqType) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_outstanding(i));

        self.pcbs[i].clear_flag(PcbFlags::RTX_ACTIVE);

        let ci_opt = self.pcbs[i].conn_index();

        // End of an RTT measurement?
        if self.pcbs[i].has_flag(PcbFlags::RTT_PENDING) {
            // RTT_PENDING outside SYN states implies a connection.
            let ci = ci_opt.expect("RTT measurement without connection");
            if seq_mod_lt(self.conn(ci).rtt_test_seq, ack_num) {
                self.pcb_end_rtt_measurement(i);
                // Allow the next cwnd increase in congestion avoidance.
                self.pcbs[i].clear_flag(PcbFlags::CWND_INCRD);
            }
        }

        let snd_mss = SeqType::from(self.pcbs[i].snd_mss);
        match ci_opt {
            None => {
                self.pcbs[i].num_dupack = 0;
            }
            Some(ci) if self.pcbs[i].num_dupack < FAST_RTX_DUP_ACKS => {
                self.pcbs[i].num_dupack = 0;

                if self.conn(ci).cwnd <= self.conn(ci).ssthresh {
                    // Slow start.
                    self.pcb_increase_cwnd_acked(i, acked);
                } else {
                    // Congestion avoidance: one cwnd increase per RTT.
                    if !self.pcbs[i].has_flag(PcbFlags::CWND_INCRD) {
                        let con = self.conn_mut(ci);
                        con.cwnd_acked = con.cwnd_acked.saturating_add(acked);
                        if con.cwnd_acked >= con.cwnd {
                            let cwnd_acked = con.cwnd_acked;
                            con.cwnd_acked = 0;
                            self.pcb_increase_cwnd_acked(i, cwnd_acked);
                            self.pcbs[i].set_flag(PcbFlags::CWND_INCRD);
                        }
                    }
                }
            }
            Some(ci) => {
                // Fast recovery. There must still be sent-unacked data, or
                // recovery would have ended.
                debug_assert!(self.pcb_has_snd_unacked(i));

                let recover_valid = self.pcbs[i].has_flag(PcbFlags::RECOVER);
                let recover = self.conn(ci).recover;
                if !recover_valid || seq_mod_gte(ack_num, recover) {
                    // Everything up to recover is acked: leave recovery,
                    // deflating cwnd. cwnd >= snd_mss holds because
                    // ssthresh >= snd_mss.
                    let flight_size = seq_diff(self.pcbs[i].snd_nxt, ack_num);
                    let con = self.conn_mut(ci);
                    debug_assert!(con.ssthresh >= snd_mss);
                    con.cwnd = con.ssthresh.min(snd_mss + flight_size.max(snd_mss));
                    self.pcbs[i].num_dupack = 0;
                } else {
                    // Partial ACK: retransmit the first unacked segment,
                    // deflate by the amount acked, and add back one segment
                    // when a full segment was acked.
                    self.pcb_output_active(i, true);

                    let con = self.conn_mut(ci);
                    debug_assert!(con.cwnd >= snd_mss);
                    con.cwnd -= acked.min(con.cwnd - snd_mss);
                    if acked >= snd_mss {
                        con.cwnd = con.cwnd.saturating_add(snd_mss);
                    }
                }
            }
        }

        // If this ACK moves snd_una beyond recover, the variable is no
        // longer meaningful.
        if self.pcbs[i].has_flag(PcbFlags::RECOVER) {
            if let Some(ci) = self.pcbs[i].conn_index() {
                if seq_mod_lt(self.conn(ci).recover, ack_num) {
                    self.pcbs[i].clear_flag(PcbFlags::RECOVER);
                }
            }
        }
    }

    /// The duplicate-ACK count reached the fast-retransmit threshold.
    pub(crate) fn pcb_fast_rtx_dup_acks_received(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_unacked(i));
        debug_assert!(self.pcbs[i].num_dupack == FAST_RTX_DUP_ACKS);

        // With recover still ahead of us, re-entering recovery within the
        // same loss episode is not allowed; leave the counter one short so
        // the next duplicate ACK is a candidate again.
        if self.pcbs[i].has_flag(PcbFlags::RECOVER) {
            self.pcbs[i].num_dupack -= 1;
            return;
        }

        // Retransmit the first unacknowledged segment.
        self.pcb_output(i, true);

        if let Some(ci) = self.pcbs[i].conn_index() {
            let snd_nxt = self.pcbs[i].snd_nxt;
            self.pcbs[i].set_flag(PcbFlags::RECOVER);
            self.conn_mut(ci).recover = snd_nxt;

            self.pcb_update_ssthresh_for_rtx(i);

            let snd_mss = SeqType::from(self.pcbs[i].snd_mss);
            let con = self.conn_mut(ci);
            con.cwnd = con.ssthresh.saturating_add(3 * snd_mss);
            self.pcbs[i].clear_flag(PcbFlags::CWND_INIT);

            // The cwnd inflation may allow sending.
            self.pcbs[i].set_flag(PcbFlags::OUT_PENDING);
        }
    }

    /// An additional duplicate ACK arrived while in fast recovery.
    pub(crate) fn pcb_extra_dup_ack_received(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_unacked(i));
        debug_assert!(self.pcbs[i].num_dupack > FAST_RTX_DUP_ACKS);

        if let Some(ci) = self.pcbs[i].conn_index() {
            let snd_mss = SeqType::from(self.pcbs[i].snd_mss);
            let con = self.conn_mut(ci);
            con.cwnd = con.cwnd.saturating_add(snd_mss);
            self.pcbs[i].set_flag(PcbFlags::OUT_PENDING);
        }
    }

    pub(crate) fn pcb_rto_ticks(&self, i: PcbIndex) -> u64 {
        u64::from(self.pcbs[i].rto)
    }

    pub(crate) fn pcb_end_rtt_measurement(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].has_flag(PcbFlags::RTT_PENDING));
        let ci = self.pcbs[i].conn_index().expect("RTT measurement without connection");

        self.pcbs[i].clear_flag(PcbFlags::RTT_PENDING);

        let time_diff = self.now.saturating_sub(self.pcbs[i].rtt_test_time);
        let this_rtt = time_diff.min(u64::from(u16::MAX)) as u16;

        // RFC 6298 estimators.
        if !self.pcbs[i].has_flag(PcbFlags::RTT_VALID) {
            self.pcbs[i].set_flag(PcbFlags::RTT_VALID);
            let con = self.conn_mut(ci);
            con.rttvar = this_rtt / 2;
            con.srtt = this_rtt;
        } else {
            let con = self.conn_mut(ci);
            let rtt_diff = con.srtt.abs_diff(this_rtt);
            con.rttvar = ((3 * u32::from(con.rttvar) + u32::from(rtt_diff)) / 4) as u16;
            con.srtt = ((7 * u32::from(con.srtt) + u32::from(this_rtt)) / 8) as u16;
        }

        let con = self.conn(ci);
        let var_part = con.rttvar.saturating_mul(4).max(1);
        let base_rto = con.srtt.saturating_add(var_part);
        self.pcbs[i].rto = base_rto.clamp(self.cfg.min_rtx_time, self.cfg.max_rtx_time);
    }

    /// The lower layer reports that a previously failed send is now
    /// expected to succeed (ARP resolution completed).
    pub(crate) fn pcb_send_retry(&mut self, i: PcbIndex) {
        match self.pcbs[i].state {
            // The token may be stale; a closed PCB has nothing to retry.
            TcpStatus::Closed => {}
            TcpStatus::SynSent | TcpStatus::SynRcvd => self.pcb_send_syn(i),
            state if state.can_output() && self.pcb_has_snd_outstanding(i) => {
                self.pcb_output(i, false);
            }
            _ => {}
        }
    }

    /// The path MTU estimate changed; refit snd_mss and the congestion
    /// state. Must not send from here (it can be reached from within the
    /// send path via handle_local_packet_too_big).
    pub(crate) fn pcb_pmtu_changed(&mut self, i: PcbIndex, pmtu: u16) {
        debug_assert!(!matches!(
            self.pcbs[i].state,
            TcpStatus::Closed | TcpStatus::SynRcvd | TcpStatus::TimeWait
        ));
        let ci = match self.pcbs[i].conn_index() {
            Some(ci) => ci,
            None => return,
        };

        self.conn_mut(ci).pmtu = pmtu;

        // In SYN_SENT the PMTU is consumed at the ESTABLISHED transition.
        if self.pcbs[i].state == TcpStatus::SynSent || !self.pcbs[i].state.can_output() {
            return;
        }

        let new_snd_mss = calc_snd_mss_from_pmtu(self.pcbs[i].base_snd_mss, pmtu);
        if new_snd_mss == self.pcbs[i].snd_mss {
            return;
        }
        self.pcbs[i].snd_mss = new_snd_mss;
        let snd_mss = SeqType::from(new_snd_mss);

        // Keep ssthresh and cwnd consistent with the new segment size.
        {
            let con = self.conn_mut(ci);
            if con.ssthresh < snd_mss {
                con.ssthresh = snd_mss;
            }
        }
        if self.pcbs[i].has_flag(PcbFlags::CWND_INIT) {
            self.conn_mut(ci).cwnd = calc_initial_cwnd(new_snd_mss);
        } else {
            let rtx_active = self.pcbs[i].has_flag(PcbFlags::RTX_ACTIVE);
            let con = self.conn_mut(ci);
            if con.cwnd < snd_mss || rtx_active {
                con.cwnd = snd_mss;
            }
        }
    }

    /// Apply a window field from an acceptable ACK.
    pub(crate) fn pcb_update_snd_wnd(&mut self, i: PcbIndex, new_snd_wnd: SeqType) {
        debug_assert!(!matches!(
            self.pcbs[i].state,
            TcpStatus::Closed | TcpStatus::SynSent | TcpStatus::SynRcvd
        ));
        // With snd_wnd_shift <= 14 the wire cannot report MAX_WINDOW or more.
        debug_assert!(new_snd_wnd <= crate::tcp::defs::MAX_WINDOW);

        let ci = match self.pcbs[i].conn_index() {
            Some(ci) => ci,
            None => return,
        };
        if !self.pcbs[i].state.can_output() {
            return;
        }

        let old_snd_wnd = self.conn(ci).snd_wnd;
        if new_snd_wnd == old_snd_wnd {
            return;
        }
        self.conn_mut(ci).snd_wnd = new_snd_wnd;

        if self.pcb_has_snd_outstanding(i) {
            // More may be sendable, or window probing must start.
            self.pcbs[i].set_flag(PcbFlags::OUT_PENDING);

            // On a zero/nonzero transition the armed rtx timer may be of
            // the wrong kind (retransmission vs probe); output will re-arm
            // the right one.
            if (new_snd_wnd == 0) != (old_snd_wnd == 0) {
                self.pcbs[i].timers.unset(PcbTimer::Rtx);
                self.mark_timers_dirty();
            }
        }
    }

    /// Arm the output timer for a deferred output pass.
    fn pcb_set_output_timer_for_output(&mut self, i: PcbIndex) {
        debug_assert!(self.pcbs[i].state.can_output());
        debug_assert!(self.pcb_has_snd_outstanding(i));

        // A retry timer may be pending further out; replace it.
        if self.pcbs[i].has_and_clear_flag(PcbFlags::OUT_RETRY) {
            self.pcbs[i].timers.unset(PcbTimer::Output);
        }

        if !self.pcbs[i].timers.is_set(PcbTimer::Output) {
            let now = self.now;
            let ticks = self.cfg.output_timer_ticks;
            self.pcbs[i].timers.set_after(PcbTimer::Output, now, ticks);
        }
        self.mark_timers_dirty();
    }

    /// Arm the output timer to retry a failed send.
    fn pcb_set_output_timer_for_retry(&mut self, i: PcbIndex, err: IpErr) {
        let after = if err == IpErr::BufferFull {
            self.cfg.output_retry_full_ticks
        } else {
            self.cfg.output_retry_other_ticks
        };
        let now = self.now;
        self.pcbs[i].timers.set_after(PcbTimer::Output, now, after);
        self.pcbs[i].set_flag(PcbFlags::OUT_RETRY);
        self.mark_timers_dirty();
    }

    fn pcb_increase_cwnd_acked(&mut self, i: PcbIndex, acked: SeqType) {
        let snd_mss = SeqType::from(self.pcbs[i].snd_mss);
        let ci = self.pcbs[i].conn_index().expect("cwnd update without connection");
        let cwnd_inc = acked.min(snd_mss);
        let con = self.conn_mut(ci);
        con.cwnd = con.cwnd.saturating_add(cwnd_inc);
        self.pcbs[i].clear_flag(PcbFlags::CWND_INIT);
    }

    /// ssthresh per RFC 5681 equation (4).
    fn pcb_update_ssthresh_for_rtx(&mut self, i: PcbIndex) {
        let half_flight_size = seq_diff(self.pcbs[i].snd_nxt, self.pcbs[i].snd_una) / 2;
        let two_smss = 2 * SeqType::from(self.pcbs[i].snd_mss);
        let ci = self.pcbs[i].conn_index().expect("ssthresh update without connection");
        self.conn_mut(ci).ssthresh = half_flight_size.max(two_smss);
    }

    pub(crate) fn pcb_start_rtt_measurement(&mut self, i: PcbIndex, syn: bool) {
        let now = self.now;
        let pcb = &mut self.pcbs[i];
        pcb.set_flag(PcbFlags::RTT_PENDING);
        pcb.rtt_test_time = now;

        if !syn {
            let snd_nxt = self.pcbs[i].snd_nxt;
            let ci = self.pcbs[i].conn_index().expect("RTT measurement without connection");
            self.conn_mut(ci).rtt_test_seq = snd_nxt;
        }
    }
}
