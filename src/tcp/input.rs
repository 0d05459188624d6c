//! TCP input: segment validation, the per-state machine step, ACK and
//! window processing, data/FIN delivery and the listen path.

use crate::buf::BufRef;
use crate::ip::defs::{is_unicast_src_addr, Ipv4RxInfo};
use crate::ip::icmp::{DestUnreachMeta, ICMP4_CODE_DEST_UNREACH_FRAG_NEEDED};
use crate::ip::send::IpSender;
use crate::tcp::defs::{
    calc_initial_cwnd, calc_snd_mss, seq_add, seq_diff, seq_lte, seq_mod_lt, PcbFlags, SeqType,
    TcpStatus, FAST_RTX_DUP_ACKS, IP4_TCP_HEADER_SIZE, MAX_ACK_BEFORE, MAX_ADDITIONAL_DUP_ACKS,
    MAX_WINDOW, MIN_ABANDON_RCV_WND_INCR,
};
use crate::tcp::output::calc_snd_mss_from_pmtu;
use crate::tcp::packet::{
    self, segment_checksum, tcp_seq_len, TcpFlags, TcpOptions, TcpSegMeta, TCP_HEADER_LEN,
};
use crate::tcp::pcb::{PcbIndex, PcbKey, PcbRef};
use crate::tcp::timer::PcbTimer;
use crate::tcp::usrreq::TcpStack;

/// Results of the basic per-segment processing: the segment's sequence
/// position relative to rcv_nxt after trimming, whether a FIN remains in
/// the trimmed segment, and how much the ACK field newly acknowledges.
struct BasicOut {
    eff_rel_seq: SeqType,
    seg_fin: bool,
    acked: SeqType,
}

impl<I: IpSender> TcpStack<I> {
    /// Entry point for received TCP datagrams (after IP reassembly).
    pub fn recv_ip4_datagram(&mut self, ip_info: &Ipv4RxInfo, dgram: BufRef<'_>) {
        // The destination must be an address of the incoming interface.
        if !self.ip.is_local_addr(ip_info.dst_addr) {
            return;
        }

        let meta = match TcpSegMeta::parse(&dgram) {
            Some(meta) => meta,
            None => return,
        };

        // Verify the checksum over pseudo-header, header and data.
        if segment_checksum(ip_info.src_addr, ip_info.dst_addr, dgram) != 0 {
            log::debug!(
                "Dropping tcp segment with bad checksum. src={} dst={}",
                ip_info.src_addr,
                ip_info.dst_addr
            );
            return;
        }

        // Options live between the base header and the data offset.
        if meta.data_offset < TCP_HEADER_LEN || meta.data_offset > dgram.len() {
            return;
        }
        let opts_buf = dgram.hide_header(TCP_HEADER_LEN).sub_to(meta.data_offset - TCP_HEADER_LEN);
        let opts = packet::parse_options(opts_buf);
        let tcp_data = dgram.hide_header(meta.data_offset);

        let key = PcbKey {
            local_addr: ip_info.dst_addr,
            remote_addr: ip_info.src_addr,
            local_port: meta.dst_port,
            remote_port: meta.src_port,
        };

        if let Some(i) = self.find_pcb(&key) {
            self.pcb_input(i, &meta, &opts, tcp_data);
            self.do_delayed_timer_update();
            return;
        }

        // No PCB. Reject non-unicast sources before replying or matching a
        // listener; existing PCBs have sanity-checked addresses, which is
        // why this check comes after the lookup.
        if !is_unicast_src_addr(ip_info.src_addr) {
            return;
        }

        if let Some(li) = self.find_listener_for_rx(ip_info.dst_addr, meta.dst_port) {
            self.listen_input(li, ip_info, &meta, &opts, tcp_data.len());
            self.do_delayed_timer_update();
            return;
        }

        // "An incoming segment not containing a RST causes a RST to be sent
        // in response." rfc9293
        if !meta.flags.contains(TcpFlags::RST) {
            self.send_rst_reply(ip_info, &meta, tcp_data.len());
        }
    }

    /// ICMP Destination Unreachable concerning a datagram we sent.
    /// `ip_info` and `dgram_initial` describe the embedded original
    /// datagram; only the first 8 bytes of its TCP header may be read.
    pub fn handle_dest_unreach(
        &mut self,
        du_meta: &DestUnreachMeta,
        ip_info: &Ipv4RxInfo,
        dgram_initial: BufRef<'_>,
    ) {
        // Only "fragmentation needed and DF set" is of interest.
        if du_meta.icmp_code != ICMP4_CODE_DEST_UNREACH_FRAG_NEEDED {
            return;
        }

        if !dgram_initial.has_header(8) {
            return;
        }
        let h = dgram_initial.chunk();
        let local_port = u16::from_be_bytes([h[0], h[1]]);
        let remote_port = u16::from_be_bytes([h[2], h[3]]);
        let seq_num = u32::from_be_bytes([h[4], h[5], h[6], h[7]]);

        let key = PcbKey {
            local_addr: ip_info.src_addr,
            remote_addr: ip_info.dst_addr,
            local_port,
            remote_port,
        };
        let i = match self.find_pcb(&key) {
            Some(i) => i,
            None => return,
        };

        // The embedded sequence number must be within the send window of an
        // output-capable, still-attached PCB.
        if !self.pcbs[i].state.can_output()
            || !seq_lte(seq_num, self.pcbs[i].snd_nxt, self.pcbs[i].snd_una)
        {
            return;
        }
        let ci = match self.pcbs[i].conn_index() {
            Some(ci) => ci,
            None => return,
        };

        // Lower the PMTU estimate; nothing to do if it did not drop.
        let new_pmtu = match self.ip.lower_pmtu(key.remote_addr, du_meta.mtu_info()) {
            Some(pmtu) => pmtu,
            None => return,
        };
        self.pcb_pmtu_changed(i, new_pmtu);

        // Retransmit right away if the lost segment was at the front.
        if self.pcb_has_snd_unacked(i)
            && self.conn(ci).snd_wnd > 0
            && seq_num == self.pcbs[i].snd_una
        {
            self.pcb_requeue_everything(i);
            self.pcb_output_active(i, false);
            self.do_delayed_timer_update();
        }
    }

    /// The scaled window value to put into a segment being sent. Lazily
    /// raises rcv_ann_wnd under the RCV_WND_UPD flag.
    pub(crate) fn pcb_ann_wnd(&mut self, i: PcbIndex) -> u16 {
        if self.pcbs[i].state.is_accepting_data()
            && self.pcbs[i].has_and_clear_flag(PcbFlags::RCV_WND_UPD)
        {
            let ann_wnd = self.pcb_calc_wnd_update(i);
            if ann_wnd > self.pcbs[i].rcv_ann_wnd {
                self.pcbs[i].rcv_ann_wnd = ann_wnd;
            }
        }

        // Empty ACKs sent from SYN_SENT carry a scaled window; an unscaled
        // value could be taken for a much larger window than intended.
        let hdr_wnd = self.pcbs[i].rcv_ann_wnd >> self.pcbs[i].rcv_wnd_shift;
        debug_assert!(hdr_wnd <= u32::from(u16::MAX));
        hdr_wnd as u16
    }

    /// The application made more receive buffer available.
    pub(crate) fn pcb_rcv_buf_extended(&mut self, i: PcbIndex) {
        debug_assert!(!matches!(self.pcbs[i].state, TcpStatus::Closed | TcpStatus::SynRcvd));
        debug_assert!(self.pcbs[i].conn_index().is_some());

        if self.pcbs[i].state.is_accepting_data() {
            let ann_wnd = self.pcb_calc_wnd_update(i);
            let ci = self.pcbs[i].conn_index().unwrap();
            let thres = self.conn(ci).rcv_ann_thres;

            if ann_wnd >= self.pcbs[i].rcv_ann_wnd.saturating_add(thres) {
                // Grown past the announcement threshold: announce now.
                self.pcbs[i].rcv_ann_wnd = ann_wnd;
                self.pcbs[i].clear_flag(PcbFlags::RCV_WND_UPD);
                self.pcb_need_ack(i);
            } else if ann_wnd > self.pcbs[i].rcv_ann_wnd {
                // Not worth an immediate ACK; update with the next segment.
                self.pcbs[i].set_flag(PcbFlags::RCV_WND_UPD);
            }
        }
    }

    /// On abandonment, raise the announced window so the peer can finish
    /// sending its data and FIN.
    pub(crate) fn pcb_update_rcv_wnd_after_abandoned(
        &mut self,
        i: PcbIndex,
        rcv_ann_thres: SeqType,
    ) {
        debug_assert!(self.pcbs[i].state.is_accepting_data());

        let mut min_window = rcv_ann_thres.max(MIN_ABANDON_RCV_WND_INCR);

        // Round up to the nearest window that can be advertised.
        let scale_mask = (SeqType::from(1u8) << self.pcbs[i].rcv_wnd_shift) - 1;
        min_window = (min_window + scale_mask) & !scale_mask;
        min_window = min_window.min(self.max_rcv_wnd_ann(i));

        if self.pcbs[i].rcv_ann_wnd < min_window {
            self.pcbs[i].rcv_ann_wnd = min_window;
            self.pcb_need_ack(i);
        }
    }

    /// Initialization done at the transition to ESTABLISHED, once a
    /// connection is attached: finish the SYN RTT measurement, fix snd_mss
    /// from the negotiated MSS and path MTU, and seed the congestion state.
    pub(crate) fn pcb_complete_established_transition(
        &mut self,
        i: PcbIndex,
        pmtu: u16,
        snd_wnd: SeqType,
    ) {
        debug_assert!(self.pcbs[i].state == TcpStatus::Established);
        debug_assert!(self.pcbs[i].conn_index().is_some());

        if self.pcbs[i].has_flag(PcbFlags::RTT_PENDING) {
            self.pcb_end_rtt_measurement(i);
        } else {
            // Retransmissions may have inflated the RTO.
            self.pcbs[i].rto = self.cfg.initial_rtx_time;
        }

        // Recompute the announced window with the next segment; implies an
        // attached connection, which is why it happens here.
        self.pcbs[i].set_flag(PcbFlags::RCV_WND_UPD);

        let snd_mss = calc_snd_mss_from_pmtu(self.pcbs[i].base_snd_mss, pmtu);
        self.pcbs[i].snd_mss = snd_mss;
        self.pcbs[i].snd_una = self.pcbs[i].snd_nxt;
        self.pcbs[i].set_flag(PcbFlags::CWND_INIT);

        let ci = self.pcbs[i].conn_index().unwrap();
        let con = self.conn_mut(ci);
        con.snd_wnd = snd_wnd;
        con.cwnd = calc_initial_cwnd(snd_mss);
        con.ssthresh = MAX_WINDOW;
        con.cwnd_acked = 0;
    }

    /// A SYN arrived for a listener: set up a SYN_RCVD PCB and answer with
    /// a SYN-ACK, or refuse with RST.
    fn listen_input(
        &mut self,
        li: usize,
        ip_info: &Ipv4RxInfo,
        meta: &TcpSegMeta,
        opts: &TcpOptions,
        tcp_data_len: usize,
    ) {
        // For a new connection we expect SYN and no FIN, RST or ACK. A
        // segment with ACK and no RST is refused; others are dropped
        // (including SYN+FIN, though RFC 793 does not say so).
        let basic = meta.flags
            & (TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST | TcpFlags::ACK);
        if basic != TcpFlags::SYN {
            if meta.flags & (TcpFlags::RST | TcpFlags::ACK) == TcpFlags::ACK {
                self.send_rst_reply(ip_info, meta, tcp_data_len);
            }
            return;
        }

        {
            let lis = self.lis(li);
            if lis.num_pcbs >= lis.max_pcbs {
                return self.send_rst_reply(ip_info, meta, tcp_data_len);
            }
        }

        let iface_mss = ip_info.iface_mtu - IP4_TCP_HEADER_SIZE;
        let base_snd_mss = match calc_snd_mss(iface_mss, opts.mss) {
            Some(mss) => mss,
            None => return self.send_rst_reply(ip_info, meta, tcp_data_len),
        };

        let i = match self.allocate_pcb() {
            Some(i) => i,
            None => return self.send_rst_reply(ip_info, meta, tcp_data_len),
        };

        let iss = self.make_iss();

        // The initially advertised window is at most 16 bits wide since the
        // SYN-ACK carries an unscaled window field.
        let rcv_wnd = u32::from(u16::MAX).min(self.lis(li).initial_rcv_wnd);

        let rto = self.cfg.initial_rtx_time;
        let rcv_wnd_shift = self.cfg.rcv_wnd_shift;
        let pcb = &mut self.pcbs[i];
        pcb.key = PcbKey {
            local_addr: ip_info.dst_addr,
            remote_addr: ip_info.src_addr,
            local_port: meta.dst_port,
            remote_port: meta.src_port,
        };
        pcb.state = TcpStatus::SynRcvd;
        pcb.flags = PcbFlags::empty();
        pcb.con = PcbRef::Lis(li);
        pcb.rcv_nxt = seq_add(meta.seq_num, 1);
        pcb.rcv_ann_wnd = rcv_wnd;
        pcb.snd_una = iss;
        pcb.snd_nxt = iss;
        pcb.snd_mss = iface_mss; // the interface MSS, until ESTABLISHED
        pcb.base_snd_mss = base_snd_mss;
        pcb.rto = rto;
        pcb.num_dupack = 0;
        pcb.snd_wnd_shift = 0;
        pcb.rcv_wnd_shift = 0;

        if let Some(ws) = opts.wnd_scale {
            pcb.set_flag(PcbFlags::WND_SCALE);
            pcb.snd_wnd_shift = ws.min(14);
            pcb.rcv_wnd_shift = rcv_wnd_shift;
        }

        self.lis_mut(li).num_pcbs += 1;

        let key = self.pcbs[i].key;
        let prev = self.index_active.insert(key, i);
        debug_assert!(prev.is_none());

        // SYN_RCVD PCBs stay on the unreferenced list; make this one the
        // most recently used.
        self.move_unrefed_pcb_to_front(i);

        let now = self.now;
        let syn_rcvd_timeout = self.cfg.syn_rcvd_timeout_ticks;
        let rto_ticks = self.pcb_rto_ticks(i);
        let pcb = &mut self.pcbs[i];
        pcb.timers.set_after(PcbTimer::Abort, now, syn_rcvd_timeout);
        pcb.timers.set_after(PcbTimer::Rtx, now, rto_ticks);
        self.mark_timers_dirty();

        log::debug!(
            "SYN-RECEIVED PCB created. local={}:{} remote={}:{}",
            key.local_addr,
            key.local_port,
            key.remote_addr,
            key.remote_port
        );

        self.pcb_send_syn(i);
    }

    /// Process a segment for a known PCB. Tracks the owner of the stack
    /// frame so user callbacks that abort the PCB are detected.
    fn pcb_input(&mut self, i: PcbIndex, meta: &TcpSegMeta, opts: &TcpOptions, data: BufRef<'_>) {
        debug_assert!(self.current_pcb.is_none());
        self.current_pcb = Some(i);
        self.pcb_input_core(i, meta, opts, data);
        self.current_pcb = None;
    }

    fn pcb_input_core(
        &mut self,
        i: PcbIndex,
        meta: &TcpSegMeta,
        opts: &TcpOptions,
        mut data: BufRef<'_>,
    ) {
        debug_assert!(self.pcbs[i].state != TcpStatus::Closed);
        debug_assert!(self.current_pcb == Some(i));

        let orig_data_len = data.len();

        let out = match self.pcb_input_basic_processing(i, meta, &mut data) {
            Some(out) => out,
            None => return,
        };

        if self.pcbs[i].state.is_synsent_or_rcvd() {
            // Normally the transition to ESTABLISHED happens in here.
            if !self.pcb_input_syn_sent_rcvd_processing(i, meta, opts, out.acked) {
                return;
            }
            debug_assert!(!self.pcbs[i].state.is_synsent_or_rcvd());
        } else if !self.pcb_input_ack_wnd_processing(i, meta, out.acked, orig_data_len) {
            return;
        }

        if self.pcbs[i].state.is_accepting_data() {
            if !self.pcb_input_rcv_processing(i, out.eff_rel_seq, out.seg_fin, &data) {
                return;
            }
        } else if self.pcbs[i].state == TcpStatus::TimeWait {
            // Reply with an ACK and restart the 2MSL timeout.
            self.pcbs[i].set_flag(PcbFlags::ACK_PENDING);
            let now = self.now;
            let time_wait = self.cfg.time_wait_time_ticks;
            self.pcbs[i].timers.set_after(PcbTimer::Abort, now, time_wait);
            self.mark_timers_dirty();
        }

        // Deferred actions collected during processing.
        if self.pcbs[i].has_and_clear_flag(PcbFlags::OUT_PENDING) {
            debug_assert!(self.pcbs[i].state.can_output());
            debug_assert!(self.pcb_has_snd_outstanding(i));
            self.pcb_output(i, false);
        }

        // OUT_PENDING output clears ACK_PENDING when it sends, so this does
        // not produce a redundant empty ACK.
        if self.pcbs[i].has_and_clear_flag(PcbFlags::ACK_PENDING) {
            self.pcb_send_empty_ack(i);
        }
    }

    /// RST/SYN handling, acceptability, trimming into the window and ACK
    /// validity.
    fn pcb_input_basic_processing(
        &mut self,
        i: PcbIndex,
        meta: &TcpSegMeta,
        data: &mut BufRef<'_>,
    ) -> Option<BasicOut> {
        let rst_syn_ack = meta.flags & (TcpFlags::RST | TcpFlags::SYN | TcpFlags::ACK);
        if rst_syn_ack != TcpFlags::ACK {
            if !self.pcb_uncommon_flags_processing(i, rst_syn_ack, meta, data.len()) {
                return None;
            }
        }

        let snd_una = self.pcbs[i].snd_una;
        let snd_nxt = self.pcbs[i].snd_nxt;
        let rcv_nxt = self.pcbs[i].rcv_nxt;

        if self.pcbs[i].state == TcpStatus::SynSent {
            // Only a SYN is expected; ignore any data or FIN.
            data.truncate(0);

            // The ACK must acknowledge our SYN (RFC 793 p66), which also
            // requires that we have sent it.
            if snd_nxt == snd_una || meta.ack_num != snd_nxt {
                let key = self.pcbs[i].key;
                self.send_rst(&key, meta.ack_num, false, 0);
                return None;
            }

            return Some(BasicOut { eff_rel_seq: 0, seg_fin: false, acked: 1 });
        }

        // The right edge of the receive window: what was announced, or the
        // actual buffer space when that is more.
        let mut rcv_wnd = self.pcbs[i].rcv_ann_wnd;
        if self.pcbs[i].state != TcpStatus::SynRcvd {
            if let Some(ci) = self.pcbs[i].conn_index() {
                let avail_wnd =
                    (self.conn(ci).rcv.free() as u64).min(u64::from(MAX_WINDOW)) as SeqType;
                rcv_wnd = rcv_wnd.max(avail_wnd);
            }
        }

        let mut eff_rel_seq = seq_diff(meta.seq_num, rcv_nxt);
        let mut seg_fin = meta.flags.contains(TcpFlags::FIN);
        let seqlen = data.len() + usize::from(seg_fin);

        if seqlen == 0 {
            // An empty segment is acceptable within or at the right edge of
            // the window; the edge case violates RFC 793 but such segments
            // are normal window updates from a sender we stalled.
            if eff_rel_seq > rcv_wnd {
                self.pcb_send_empty_ack(i);
                return None;
            }
        } else {
            let last_rel_seq = seq_diff(seq_add(eff_rel_seq, seqlen as SeqType), 1);
            let left_edge_in_window = eff_rel_seq < rcv_wnd;
            let right_edge_in_window = last_rel_seq < rcv_wnd;

            if !left_edge_in_window || !right_edge_in_window {
                if left_edge_in_window {
                    // Data past the window: cut it (and any FIN) off.
                    let left_keep = seq_diff(rcv_wnd, eff_rel_seq);
                    debug_assert!(left_keep > 0 && (left_keep as usize) < seqlen);
                    seg_fin = false;
                    data.truncate(left_keep as usize);
                } else if right_edge_in_window {
                    // Already-received data in front: skip over it.
                    let left_trim = eff_rel_seq.wrapping_neg();
                    debug_assert!(left_trim > 0 && (left_trim as usize) < seqlen);
                    eff_rel_seq = 0;
                    data.skip_bytes(left_trim as usize);
                } else {
                    // Entirely outside the window.
                    self.pcb_send_empty_ack(i);
                    return None;
                }
            }
        }

        // ACK acceptability per RFC 5961: new ACKs up to snd_nxt are fine,
        // old ACKs up to MAX.SND.WND behind are ignored, older ones get a
        // challenge ACK.
        let ack_minus_una = seq_diff(meta.ack_num, snd_una);
        let acked = if ack_minus_una <= seq_diff(snd_nxt, snd_una) {
            ack_minus_una
        } else {
            let una_minus_ack = ack_minus_una.wrapping_neg();
            if una_minus_ack > MAX_ACK_BEFORE {
                self.pcb_send_empty_ack(i);
                return None;
            }
            0
        };

        Some(BasicOut { eff_rel_seq, seg_fin, acked })
    }

    /// RST set, SYN set or ACK missing. Returns whether to continue
    /// processing the segment (only for an expected SYN-ACK in SYN_SENT).
    fn pcb_uncommon_flags_processing(
        &mut self,
        i: PcbIndex,
        flags_rst_syn_ack: TcpFlags,
        meta: &TcpSegMeta,
        data_len: usize,
    ) -> bool {
        let mut continue_processing = false;

        if flags_rst_syn_ack.contains(TcpFlags::RST) {
            // RST per RFC 5961.
            if self.pcbs[i].state == TcpStatus::SynSent {
                // Acceptable if it acknowledges our SYN; also allow
                // ack_num == snd_una because we may have sent an empty ACK
                // with seq_num == snd_una.
                if flags_rst_syn_ack.contains(TcpFlags::ACK)
                    && seq_lte(meta.ack_num, self.pcbs[i].snd_nxt, self.pcbs[i].snd_una)
                {
                    self.pcb_abort(i, false);
                }
            } else if meta.seq_num == self.pcbs[i].rcv_nxt {
                self.pcb_abort(i, false);
            } else if seq_diff(meta.seq_num, self.pcbs[i].rcv_nxt) <= self.pcbs[i].rcv_ann_wnd {
                // In-window but not exact: challenge ACK. Checking against
                // rcv_ann_wnd rather than the precise window may ignore an
                // RST still within the actual window, which is harmless.
                self.pcb_send_empty_ack(i);
            }
        } else if flags_rst_syn_ack.contains(TcpFlags::SYN) {
            if self.pcbs[i].state == TcpStatus::SynSent {
                if flags_rst_syn_ack == TcpFlags::SYN | TcpFlags::ACK {
                    // The expected SYN-ACK response.
                    continue_processing = true;
                } else {
                    // SYN without ACK: simultaneous open is not supported,
                    // send RST.
                    let seqlen = tcp_seq_len(meta.flags, data_len);
                    let key = self.pcbs[i].key;
                    self.send_rst(&key, 0, true, seq_add(meta.seq_num, seqlen as SeqType));
                }
            } else if self.pcbs[i].state == TcpStatus::SynRcvd
                && meta.seq_num == seq_diff(self.pcbs[i].rcv_nxt, 1)
            {
                // Retransmitted SYN: answer with the SYN-ACK again and bump
                // the handshake timeout.
                self.pcb_send_syn(i);
                let now = self.now;
                let timeout = self.cfg.syn_rcvd_timeout_ticks;
                self.pcbs[i].timers.set_after(PcbTimer::Abort, now, timeout);
                self.mark_timers_dirty();
            } else {
                // SYN in a synchronized state: challenge ACK (RFC 5961).
                self.pcb_send_empty_ack(i);
            }
        } else {
            // Neither RST, SYN nor ACK: never legitimately sent, drop.
        }

        continue_processing
    }

    /// Handshake completion for SYN_SENT (SYN-ACK received) and SYN_RCVD
    /// (our SYN-ACK acknowledged).
    fn pcb_input_syn_sent_rcvd_processing(
        &mut self,
        i: PcbIndex,
        meta: &TcpSegMeta,
        opts: &TcpOptions,
        acked: SeqType,
    ) -> bool {
        let syn_sent = self.pcbs[i].state == TcpStatus::SynSent;

        // The two states share enough of this processing that one function
        // handles both.
        let mut proceed = true;
        if !syn_sent && seq_mod_lt(meta.seq_num, self.pcbs[i].rcv_nxt) {
            // Sequence numbers before rcv_nxt in SYN_RCVD.
            self.pcb_send_empty_ack(i);
            proceed = false;
        } else if acked == 0 {
            // Our SYN is not acknowledged. In SYN_RCVD, RFC 793 seems to
            // allow ack_num == snd_una, which makes no sense.
            let key = self.pcbs[i].key;
            self.send_rst(&key, meta.ack_num, false, 0);
            proceed = false;
        } else if syn_sent && !meta.flags.contains(TcpFlags::SYN) {
            // In SYN_SENT nothing to do without a SYN.
            proceed = false;
        }

        if !proceed {
            // A SYN_SENT PCB is always referenced and a SYN_RCVD one never
            // is at this point.
            if !syn_sent {
                self.move_unrefed_pcb_to_front(i);
            }
            return false;
        }

        // Only our SYN can have been acknowledged here.
        debug_assert!(self.pcbs[i].snd_nxt == seq_add(self.pcbs[i].snd_una, 1));
        debug_assert!(meta.ack_num == self.pcbs[i].snd_nxt);

        // Handshake timers are done.
        self.pcbs[i].timers.unset(PcbTimer::Abort);
        self.pcbs[i].timers.unset(PcbTimer::Rtx);
        self.mark_timers_dirty();

        // The initial send window. In SYN_SENT the peer's SYN-ACK window is
        // unscaled and snd_wnd_shift is still zero; in SYN_RCVD the
        // handshake-completing ACK is an ordinary segment and the shift
        // negotiated from the SYN applies.
        let snd_wnd = self.pcb_decode_wnd_size(i, meta.window_size);

        if syn_sent {
            debug_assert!(self.pcbs[i].rcv_nxt == 0);
            debug_assert!(self.pcbs[i].rcv_ann_wnd > 0);
            self.pcbs[i].rcv_nxt = seq_add(meta.seq_num, 1);
            self.pcbs[i].rcv_ann_wnd -= 1;

            self.pcbs[i].state = TcpStatus::Established;

            // Bound base_snd_mss by the peer's MSS option.
            match calc_snd_mss(self.pcbs[i].base_snd_mss, opts.mss) {
                Some(mss) => self.pcbs[i].base_snd_mss = mss,
                None => {
                    // After the transition above, the RST is an ACK.
                    self.pcb_abort(i, true);
                    return false;
                }
            }

            // Window scaling applies only if the peer sent the option; the
            // window field above was read before any shift took effect,
            // which is correct for an unscaled SYN-ACK.
            debug_assert!(self.pcbs[i].snd_wnd_shift == 0);
            if let Some(ws) = opts.wnd_scale {
                self.pcbs[i].snd_wnd_shift = ws.min(14);
            } else {
                self.pcbs[i].rcv_wnd_shift = 0;
            }

            let ci = self.pcbs[i].conn_index().expect("SYN_SENT without connection");
            let pmtu = self.conn(ci).pmtu;
            self.pcb_complete_established_transition(i, pmtu, snd_wnd);

            // The SYN-ACK must be acknowledged.
            self.pcbs[i].set_flag(PcbFlags::ACK_PENDING);

            // Data may have been queued while connecting.
            if self.conn(ci).snd.len() > 0 {
                self.pcbs[i].set_flag(PcbFlags::OUT_PENDING);
            }

            // close_sending during the handshake takes effect now.
            if self.conn(ci).snd_closed {
                self.pcb_end_sending(i);
            }

            self.conn_established(ci);
            if self.pcb_aborted_in_callback(i) {
                return false;
            }
            // Possible transitions in the callback (except to CLOSED):
            // ESTABLISHED -> FIN_WAIT_1.
        } else {
            let li = match self.pcbs[i].con {
                PcbRef::Lis(li) => li,
                _ => unreachable!("SYN_RCVD PCB without a listener"),
            };
            debug_assert!(self.lis(li).accept_pcb.is_none());

            // Publish the PCB for accepting and protect it from eviction
            // while the callback runs.
            self.lis_mut(li).accept_pcb = Some(i);
            self.unrefed_remove(i);
            self.accept_snd_wnd = snd_wnd;

            let queued = self.lis(li).queue.is_some();
            self.lis_established(li);
            if self.pcb_aborted_in_callback(i) {
                return false;
            }

            // If the connection was not accepted (or was accepted and
            // already abandoned), the PCB cannot stay in SYN_RCVD: too much
            // has been updated for the transition. A full listen queue
            // refuses quietly, an application refusal resets.
            if self.pcbs[i].state == TcpStatus::SynRcvd || self.pcbs[i].conn_index().is_none() {
                self.pcb_abort(i, !queued);
                return false;
            }
        }

        debug_assert!(matches!(
            self.pcbs[i].state,
            TcpStatus::Established | TcpStatus::FinWait1
        ));
        true
    }

    /// Acknowledgement and window processing for synchronized states.
    fn pcb_input_ack_wnd_processing(
        &mut self,
        i: PcbIndex,
        meta: &TcpSegMeta,
        acked: SeqType,
        orig_data_len: usize,
    ) -> bool {
        debug_assert!(!matches!(
            self.pcbs[i].state,
            TcpStatus::Closed | TcpStatus::SynSent | TcpStatus::SynRcvd
        ));

        // Activity on an unreferenced PCB protects it from eviction.
        if self.pcbs[i].conn_index().is_none() {
            self.move_unrefed_pcb_to_front(i);
        }

        if acked > 0 {
            // Anything newly acked implies output was possible and
            // something was outstanding.
            debug_assert!(self.pcbs[i].state.can_output());
            debug_assert!(self.pcb_has_snd_outstanding(i));
            debug_assert!(acked == seq_diff(meta.ack_num, self.pcbs[i].snd_una));

            // RTT measurement and congestion control come first, while
            // snd_una still marks the old left edge.
            self.pcb_output_handle_acked(i, meta.ack_num, acked);

            self.pcbs[i].snd_una = meta.ack_num;

            let fin_acked = self.pcb_fin_acked(i);
            let data_acked = (acked - SeqType::from(fin_acked)) as usize;

            if data_acked > 0 {
                // A connection must be attached: abandonment with unacked
                // data would have aborted.
                let ci = self.pcbs[i].conn_index().expect("acked data without connection");
                let snd_open = self.pcbs[i].state.is_snd_open();
                {
                    let con = self.conn_mut(ci);
                    debug_assert!(data_acked <= con.snd.len());

                    // snd_wnd is relative to snd_una. Only data counts; once
                    // the FIN is acked the window no longer matters.
                    con.snd_wnd = con.snd_wnd.saturating_sub(data_acked as SeqType);

                    con.snd.consume(data_acked);
                    debug_assert!(snd_open || con.snd.psh_index == con.snd.len());
                }

                self.conn_data_sent(ci, data_acked);
                if self.pcb_aborted_in_callback(i) {
                    return false;
                }
                // Possible transitions in the callback (except to CLOSED):
                // ESTABLISHED -> FIN_WAIT_1, CLOSE_WAIT -> LAST_ACK.
            }

            if fin_acked {
                debug_assert!(matches!(
                    self.pcbs[i].state,
                    TcpStatus::FinWait1 | TcpStatus::Closing | TcpStatus::LastAck
                ));

                if let Some(ci) = self.pcbs[i].conn_index() {
                    self.conn_end_sent(ci);
                    if self.pcb_aborted_in_callback(i) {
                        return false;
                    }
                }

                match self.pcbs[i].state {
                    TcpStatus::FinWait1 => self.pcb_go_to_fin_wait_2(i),
                    TcpStatus::Closing => {
                        self.pcb_go_to_time_wait(i);
                        return false;
                    }
                    _ => {
                        debug_assert!(self.pcbs[i].state == TcpStatus::LastAck);
                        self.pcb_abort(i, false);
                        return false;
                    }
                }
            } else {
                debug_assert!(self.pcbs[i].state.can_output());

                if self.pcb_has_snd_outstanding(i) {
                    // A running retransmission timeout is stale now that
                    // something was acked; output restarts it as needed.
                    self.pcbs[i].timers.unset(PcbTimer::Rtx);
                    self.mark_timers_dirty();
                    self.pcbs[i].set_flag(PcbFlags::OUT_PENDING);
                } else {
                    // Nothing left in flight: run the idle timeout.
                    let now = self.now;
                    let rto_ticks = self.pcb_rto_ticks(i);
                    self.pcbs[i].timers.set_after(PcbTimer::Rtx, now, rto_ticks);
                    self.pcbs[i].set_flag(PcbFlags::IDLE_TIMER);
                    self.pcbs[i].clear_flag(PcbFlags::OUT_PENDING);
                    self.pcbs[i].timers.unset(PcbTimer::Output);
                    self.mark_timers_dirty();
                }
            }
        } else {
            // Duplicate ACK counting (RFC 5681): an empty old ACK at
            // snd_una with an unchanged window while data is in flight.
            if orig_data_len == 0
                && !meta.flags.contains(TcpFlags::FIN)
                && meta.ack_num == self.pcbs[i].snd_una
                && self.pcbs[i].state.can_output()
                && self.pcb_has_snd_unacked(i)
            {
                if let Some(ci) = self.pcbs[i].conn_index() {
                    if self.pcb_decode_wnd_size(i, meta.window_size) == self.conn(ci).snd_wnd
                        && self.pcbs[i].num_dupack < FAST_RTX_DUP_ACKS + MAX_ADDITIONAL_DUP_ACKS
                    {
                        self.pcbs[i].num_dupack += 1;
                        if self.pcbs[i].num_dupack == FAST_RTX_DUP_ACKS {
                            self.pcb_fast_rtx_dup_acks_received(i);
                        } else if self.pcbs[i].num_dupack > FAST_RTX_DUP_ACKS {
                            self.pcb_extra_dup_ack_received(i);
                        }
                    }
                }
            }
        }

        // Window updates, simplified from RFC 793: accept the window of any
        // segment that is not an old ACK (no snd_wl1/snd_wl2 tracking).
        // With equal ACK numbers a reordered old window may win, which is
        // harmless.
        if self.pcbs[i].snd_una == meta.ack_num {
            let new_snd_wnd = self.pcb_decode_wnd_size(i, meta.window_size);
            self.pcb_update_snd_wnd(i, new_snd_wnd);
        }

        true
    }

    /// Deliver received data or FIN, via the out-of-sequence buffer when
    /// needed.
    fn pcb_input_rcv_processing(
        &mut self,
        i: PcbIndex,
        eff_rel_seq: SeqType,
        seg_fin: bool,
        data: &BufRef<'_>,
    ) -> bool {
        debug_assert!(self.pcbs[i].state.is_accepting_data());

        let (rcv_datalen, rcv_fin) = match self.pcbs[i].conn_index() {
            None => {
                // Abandoned: nothing can be received any more except the
                // FIN in sequence.
                if eff_rel_seq != 0 || !data.is_empty() {
                    self.pcb_abort(i, true);
                    return false;
                }
                (0, seg_fin)
            }
            Some(ci)
                if eff_rel_seq == 0 && self.conn(ci).ooseq.is_nothing_buffered() =>
            {
                // Fast path: in sequence with nothing buffered.
                let rcv_datalen = data.len();
                if rcv_datalen > 0 {
                    // No space means the connection never provided buffer
                    // for the window it announced.
                    if self.conn(ci).rcv.free() < rcv_datalen {
                        self.pcb_abort(i, true);
                        return false;
                    }
                    let con = self.conn_mut(ci);
                    con.rcv.write_at(0, *data);
                    con.rcv.commit(rcv_datalen);
                }
                (rcv_datalen, seg_fin)
            }
            Some(ci) => {
                // Out-of-sequence buffering.
                let rcv_nxt = self.pcbs[i].rcv_nxt;
                let eff_seq = seq_add(rcv_nxt, eff_rel_seq);
                let mut need_ack = false;
                let update_ok = self.conn_mut(ci).ooseq.update_for_segment_received(
                    rcv_nxt,
                    eff_seq,
                    data.len(),
                    seg_fin,
                    &mut need_ack,
                );
                if !update_ok {
                    self.pcb_abort(i, true);
                    return false;
                }
                if need_ack {
                    self.pcbs[i].set_flag(PcbFlags::ACK_PENDING);
                }

                if !data.is_empty() {
                    if self.conn(ci).rcv.free() < eff_rel_seq as usize + data.len() {
                        self.pcb_abort(i, true);
                        return false;
                    }
                    self.conn_mut(ci).rcv.write_at(eff_rel_seq as usize, *data);
                }

                // Take whatever became contiguous at rcv_nxt. The data was
                // already written into the buffer when it arrived.
                let (rcv_datalen, rcv_fin) = self.conn_mut(ci).ooseq.shift_available(rcv_nxt);
                if rcv_datalen > 0 {
                    self.conn_mut(ci).rcv.commit(rcv_datalen);
                }
                (rcv_datalen, rcv_fin)
            }
        };

        let rcv_seqlen = rcv_datalen as SeqType + SeqType::from(rcv_fin);
        self.pcb_process_received(i, rcv_seqlen, rcv_datalen)
    }

    /// Advance rcv_nxt, make FIN state transitions and run the data/FIN
    /// callbacks.
    fn pcb_process_received(
        &mut self,
        i: PcbIndex,
        rcv_seqlen: SeqType,
        rcv_datalen: usize,
    ) -> bool {
        if rcv_seqlen == 0 {
            return true;
        }

        {
            let pcb = &mut self.pcbs[i];
            pcb.rcv_nxt = seq_add(pcb.rcv_nxt, rcv_seqlen);
            // The peer may overrun the announced window slightly when a
            // window update is still in flight.
            pcb.rcv_ann_wnd = pcb.rcv_ann_wnd.saturating_sub(rcv_seqlen);
            pcb.set_flag(PcbFlags::ACK_PENDING);
        }

        let fin = rcv_seqlen > rcv_datalen as SeqType;
        if fin {
            let new_state = match self.pcbs[i].state {
                TcpStatus::Established => TcpStatus::CloseWait,
                TcpStatus::FinWait1 => TcpStatus::Closing,
                _ => {
                    debug_assert!(self.pcbs[i].state == TcpStatus::FinWait2);
                    // Hold the final transition until the callbacks have
                    // run, inhibiting window processing from within them.
                    TcpStatus::FinWait2TimeWait
                }
            };
            self.pcbs[i].state = new_state;
        }

        if rcv_datalen > 0 {
            let ci = self.pcbs[i].conn_index().expect("received data without connection");

            // Shrinking rcv_ann_wnd may allow announcing more window under
            // scaling; recompute with the next segment. RCV_WND_UPD must
            // imply an attached connection, hence inside this branch.
            self.pcbs[i].set_flag(PcbFlags::RCV_WND_UPD);

            self.conn_data_received(ci, rcv_datalen);
            if self.pcb_aborted_in_callback(i) {
                return false;
            }
            // Possible transitions in the callback (except to CLOSED):
            // ESTABLISHED -> FIN_WAIT_1, CLOSE_WAIT -> LAST_ACK.
        }

        if fin {
            if let Some(ci) = self.pcbs[i].conn_index() {
                self.conn_end_received(ci);
                if self.pcb_aborted_in_callback(i) {
                    return false;
                }
                // Possible transitions in the callback (except to CLOSED):
                // CLOSE_WAIT -> LAST_ACK.
            }

            if self.pcbs[i].state == TcpStatus::FinWait2TimeWait {
                self.pcb_go_to_time_wait(i);
            }
        }

        true
    }

    /// Apply the peer's window scale to a received window field.
    pub(crate) fn pcb_decode_wnd_size(&self, i: PcbIndex, rx_wnd_size: u16) -> SeqType {
        SeqType::from(rx_wnd_size) << self.pcbs[i].snd_wnd_shift
    }

    /// The maximum window announceable under our window scale.
    fn max_rcv_wnd_ann(&self, i: PcbIndex) -> SeqType {
        SeqType::from(u16::MAX) << self.pcbs[i].rcv_wnd_shift
    }

    /// The window we could announce right now: available buffer space,
    /// bounded and aligned to the scale granularity.
    fn pcb_calc_wnd_update(&self, i: PcbIndex) -> SeqType {
        debug_assert!(self.pcbs[i].state.is_accepting_data());
        let ci = self.pcbs[i].conn_index().expect("window update without connection");

        let max_ann = self.max_rcv_wnd_ann(i);
        let bounded_wnd = (self.conn(ci).rcv.free() as u64).min(u64::from(max_ann)) as SeqType;

        // max_ann doubles as the mask clearing bits below the scale
        // granularity (bounded_wnd <= max_ann).
        bounded_wnd & max_ann
    }
}
