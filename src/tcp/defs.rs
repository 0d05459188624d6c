use bitflags::bitflags;
use std::fmt::{self, Display};

/// TCP sequence numbers and window quantities.
pub type SeqType = u32;

/// Ticks are milliseconds of the platform clock.
pub type TimeTicks = u64;

/// Retransmission times are kept in 16-bit milliseconds, giving a range of
/// 65 seconds which covers MaxRtxTime.
pub type RttType = u16;

/// IPv4 header plus TCP header, without options.
pub const IP4_TCP_HEADER_SIZE: u16 = 40;

/// Minimum MTU that IPv4 requires everyone to handle.
pub const MIN_MTU: u16 = 576;

/// The remote host must not lower the MSS beyond this.
pub const MIN_ALLOWED_MSS: u16 = MIN_MTU - IP4_TCP_HEADER_SIZE;

/// "SendMSS is ... or the default 536 for IPv4, if no MSS Option is
/// received." rfc9293
pub const DEFAULT_MSS: u16 = 536;

/// Maximum theoretically possible send and receive window.
pub const MAX_WINDOW: SeqType = 0x3fff_ffff;

/// Default window update threshold, overridable per connection.
pub const DEFAULT_WND_ANN_THRESHOLD: SeqType = 2700;

/// How old an ACK may be to be considered acceptable (MAX.SND.WND in
/// RFC 5961).
pub const MAX_ACK_BEFORE: SeqType = 0xffff;

/// Number of duplicate ACKs that triggers fast retransmit/recovery.
pub const FAST_RTX_DUP_ACKS: u8 = 3;

/// Maximum additional duplicate ACKs that still inflate cwnd.
pub const MAX_ADDITIONAL_DUP_ACKS: u8 = 32;

/// Minimum receive-window increment when a PCB is abandoned before its FIN
/// has been received.
pub const MIN_ABANDON_RCV_WND_INCR: SeqType = 0xffff;

// Wrap-aware sequence comparisons. A sequence number is "in the past"
// relative to another when their difference has the top bit set.

pub fn seq_add(a: SeqType, n: SeqType) -> SeqType {
    a.wrapping_add(n)
}

pub fn seq_diff(a: SeqType, b: SeqType) -> SeqType {
    a.wrapping_sub(b)
}

/// true if a < b, with both interpreted relative to the reference `r`.
pub fn seq_lt(a: SeqType, b: SeqType, r: SeqType) -> bool {
    a.wrapping_sub(r) < b.wrapping_sub(r)
}

/// true if a <= b, with both interpreted relative to the reference `r`.
pub fn seq_lte(a: SeqType, b: SeqType, r: SeqType) -> bool {
    a.wrapping_sub(r) <= b.wrapping_sub(r)
}

/// true if a < b in modular arithmetic (b no more than 2^31 ahead).
pub fn seq_mod_lt(a: SeqType, b: SeqType) -> bool {
    a.wrapping_sub(b) >= 0x8000_0000
}

/// true if a >= b in modular arithmetic.
pub fn seq_mod_gte(a: SeqType, b: SeqType) -> bool {
    !seq_mod_lt(a, b)
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TcpStatus {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    /// Transient state used when in FIN_WAIT_2 a FIN has just been received
    /// but callbacks have not yet run; it becomes TIME_WAIT before input
    /// processing returns.
    FinWait2TimeWait,
}

impl Display for TcpStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpStatus::Closed => write!(f, "CLOSED"),
            TcpStatus::SynSent => write!(f, "SYN-SENT"),
            TcpStatus::SynRcvd => write!(f, "SYN-RCVD"),
            TcpStatus::Established => write!(f, "ESTABLISHED"),
            TcpStatus::FinWait1 => write!(f, "FIN-WAIT-1"),
            TcpStatus::FinWait2 => write!(f, "FIN-WAIT-2"),
            TcpStatus::Closing => write!(f, "CLOSING"),
            TcpStatus::TimeWait => write!(f, "TIME-WAIT"),
            TcpStatus::CloseWait => write!(f, "CLOSE-WAIT"),
            TcpStatus::LastAck => write!(f, "LAST-ACK"),
            TcpStatus::FinWait2TimeWait => write!(f, "FIN-WAIT-2(TIME-WAIT)"),
        }
    }
}

impl TcpStatus {
    /// States of a live connection past the handshake.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            TcpStatus::Closed | TcpStatus::SynSent | TcpStatus::SynRcvd | TcpStatus::TimeWait
        )
    }

    pub fn is_synsent_or_rcvd(self) -> bool {
        matches!(self, TcpStatus::SynSent | TcpStatus::SynRcvd)
    }

    /// States in which incoming data or FIN is still processed.
    pub fn is_accepting_data(self) -> bool {
        matches!(self, TcpStatus::Established | TcpStatus::FinWait1 | TcpStatus::FinWait2)
    }

    /// States in which data or FIN can be transmitted.
    pub fn can_output(self) -> bool {
        matches!(
            self,
            TcpStatus::Established
                | TcpStatus::FinWait1
                | TcpStatus::Closing
                | TcpStatus::CloseWait
                | TcpStatus::LastAck
        )
    }

    /// States in which the application may still queue data for sending.
    pub fn is_snd_open(self) -> bool {
        matches!(self, TcpStatus::Established | TcpStatus::CloseWait)
    }
}

bitflags! {
    /// Per-PCB state flags (14 bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcbFlags: u16 {
        /// ACK is needed; used in input processing.
        const ACK_PENDING = 1 << 0;
        /// pcb_output should be called at the end of input processing. The
        /// flag implies can_output and pcb_has_snd_outstanding at the point
        /// in pcb_input where it is checked; any change breaking that
        /// implication must clear the flag.
        const OUT_PENDING = 1 << 1;
        /// A FIN was sent at least once and is included in snd_nxt.
        const FIN_SENT = 1 << 2;
        /// A FIN is queued for sending.
        const FIN_PENDING = 1 << 3;
        /// Round-trip time is being measured.
        const RTT_PENDING = 1 << 4;
        /// Round-trip time is not in initial state.
        const RTT_VALID = 1 << 5;
        /// cwnd has been increased by snd_mss this round trip.
        const CWND_INCRD = 1 << 6;
        /// A segment has been retransmitted and not yet acked.
        const RTX_ACTIVE = 1 << 7;
        /// The recover variable is valid (and >= snd_una).
        const RECOVER = 1 << 8;
        /// If the rtx timer is running it is for the idle timeout.
        const IDLE_TIMER = 1 << 9;
        /// Window scaling is used.
        const WND_SCALE = 1 << 10;
        /// Current cwnd is the initial cwnd.
        const CWND_INIT = 1 << 11;
        /// If the output timer is set it is for OutputRetry*Ticks.
        const OUT_RETRY = 1 << 12;
        /// rcv_ann_wnd needs update before sending a segment; implies an
        /// attached connection.
        const RCV_WND_UPD = 1 << 13;
    }
}

/// Engine configuration. Times are in ticks (milliseconds).
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub tcp_ttl: u8,
    pub num_pcbs: usize,
    /// Maximum disjoint out-of-sequence ranges kept per connection (<= 15).
    pub num_oos_segs: u8,
    pub ephemeral_port_first: u16,
    pub ephemeral_port_last: u16,
    /// Window scale shift count sent and used in outgoing ACKs (<= 14).
    pub rcv_wnd_shift: u8,
    pub syn_sent_timeout_ticks: TimeTicks,
    pub syn_rcvd_timeout_ticks: TimeTicks,
    pub time_wait_time_ticks: TimeTicks,
    pub abandoned_timeout_ticks: TimeTicks,
    /// Delay from send-buffer extension to calling pcb_output.
    pub output_timer_ticks: TimeTicks,
    /// Retry delay after sending failed with BufferFull.
    pub output_retry_full_ticks: TimeTicks,
    /// Retry delay after sending failed with another error.
    pub output_retry_other_ticks: TimeTicks,
    pub initial_rtx_time: RttType,
    pub min_rtx_time: RttType,
    pub max_rtx_time: RttType,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            tcp_ttl: 64,
            num_pcbs: 32,
            num_oos_segs: 4,
            ephemeral_port_first: 49152,
            ephemeral_port_last: 65535,
            rcv_wnd_shift: 6,
            syn_sent_timeout_ticks: 30_000,
            syn_rcvd_timeout_ticks: 20_000,
            time_wait_time_ticks: 120_000,
            abandoned_timeout_ticks: 30_000,
            output_timer_ticks: 1,
            output_retry_full_ticks: 100,
            output_retry_other_ticks: 2_000,
            initial_rtx_time: 1_000,
            min_rtx_time: 250,
            max_rtx_time: 60_000,
        }
    }
}

/// Initial congestion window per RFC 5681 section 3.1.
pub fn calc_initial_cwnd(snd_mss: u16) -> SeqType {
    let mss = SeqType::from(snd_mss);
    if snd_mss > 2190 {
        2 * mss
    } else if snd_mss > 1095 {
        3 * mss
    } else {
        4 * mss
    }
}

/// The MSS we may send with: the peer's MSS option (or the 536 default)
/// bounded by the interface MSS. None if that would fall below the minimum
/// we are willing to operate with.
pub fn calc_snd_mss(iface_mss: u16, peer_mss: Option<u16>) -> Option<u16> {
    let mss = iface_mss.min(peer_mss.unwrap_or(DEFAULT_MSS));
    (mss >= MIN_ALLOWED_MSS).then_some(mss)
}
