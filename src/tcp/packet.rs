//! TCP header and options codec.

use crate::buf::BufRef;
use crate::ip::packet::ChksumAccumulator;
use bitflags::bitflags;
use std::net::Ipv4Addr;

pub const TCP_HEADER_LEN: usize = 20;

/// Data offset field position within the offset+flags word.
const TCP_OFFSET_SHIFT: u16 = 12;

/// Largest options block we ever emit: MSS (4) plus NOP-padded WndScale (4).
pub const MAX_TCP_OPTIONS_LEN: usize = 8;

// https://datatracker.ietf.org/doc/html/rfc9293
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Source Port          |       Destination Port        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                        Sequence Number                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Acknowledgment Number                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Data |       |C|E|U|A|P|R|S|F|                               |
// | Offset| Rsrvd |W|C|R|C|S|S|Y|I|            Window             |
// |       |       |R|E|G|K|H|T|N|N|                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Checksum            |         Urgent Pointer        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u16 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
    }
}

impl TcpFlags {
    /// Flags that occupy sequence space.
    pub const SEQ_FLAGS: TcpFlags = TcpFlags::SYN.union(TcpFlags::FIN);
}

/// Sequence length of a segment: data length plus one for SYN or FIN.
pub fn tcp_seq_len(flags: TcpFlags, data_len: usize) -> usize {
    data_len + usize::from(flags.intersects(TcpFlags::SEQ_FLAGS))
}

// https://www.iana.org/assignments/tcp-parameters/tcp-parameters.xhtml
const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;
const TCP_OPT_WND_SCALE: u8 = 3;

/// The TCP options we care about. Anything else is skipped on input and
/// never emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub wnd_scale: Option<u8>,
}

/// Fields of a received TCP header.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegMeta {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    /// Header length in bytes (data offset scaled).
    pub data_offset: usize,
}

impl TcpSegMeta {
    /// Parse the base header out of the first chunk of `dgram`. The data
    /// offset is validated against the datagram length by the caller.
    pub fn parse(dgram: &BufRef<'_>) -> Option<TcpSegMeta> {
        if !dgram.has_header(TCP_HEADER_LEN) {
            return None;
        }
        let h = dgram.chunk();
        let offset_flags = u16::from_be_bytes([h[12], h[13]]);
        Some(TcpSegMeta {
            src_port: u16::from_be_bytes([h[0], h[1]]),
            dst_port: u16::from_be_bytes([h[2], h[3]]),
            seq_num: u32::from_be_bytes([h[4], h[5], h[6], h[7]]),
            ack_num: u32::from_be_bytes([h[8], h[9], h[10], h[11]]),
            flags: TcpFlags::from_bits_truncate(offset_flags & 0x1ff),
            window_size: u16::from_be_bytes([h[14], h[15]]),
            data_offset: usize::from(offset_flags >> TCP_OFFSET_SHIFT) * 4,
        })
    }
}

/// Parse the options block of a received segment. Malformed options
/// terminate parsing; whatever was understood up to that point stands.
pub fn parse_options(mut buf: BufRef<'_>) -> TcpOptions {
    let mut opts = TcpOptions::default();
    while !buf.is_empty() {
        let kind = buf.take_byte();
        if kind == TCP_OPT_END {
            break;
        }
        if kind == TCP_OPT_NOP {
            continue;
        }
        if buf.is_empty() {
            break;
        }
        let length = buf.take_byte();
        if length < 2 {
            break;
        }
        let opt_data_len = usize::from(length - 2);
        if buf.len() < opt_data_len {
            break;
        }
        match kind {
            TCP_OPT_MSS if opt_data_len == 2 => {
                let mut data = [0u8; 2];
                buf.take_bytes(&mut data);
                opts.mss = Some(u16::from_be_bytes(data));
            }
            TCP_OPT_WND_SCALE if opt_data_len == 1 => {
                opts.wnd_scale = Some(buf.take_byte());
            }
            _ => buf.skip_bytes(opt_data_len),
        }
    }
    opts
}

/// Length of the options block we would emit, always a multiple of 4.
pub fn options_len(opts: &TcpOptions) -> usize {
    let mut len = 0;
    if opts.mss.is_some() {
        len += 4;
    }
    if opts.wnd_scale.is_some() {
        len += 4;
    }
    len
}

fn write_options(opts: &TcpOptions, out: &mut Vec<u8>) {
    if let Some(mss) = opts.mss {
        out.push(TCP_OPT_MSS);
        out.push(4);
        out.extend_from_slice(&mss.to_be_bytes());
    }
    if let Some(shift) = opts.wnd_scale {
        // NOP-padded to keep the header 32-bit aligned.
        out.push(TCP_OPT_NOP);
        out.push(TCP_OPT_WND_SCALE);
        out.push(3);
        out.push(shift);
    }
}

/// Append a TCP header (with options, zeroed checksum) to `out`.
/// Returns the index of the checksum field for later patching.
#[allow(clippy::too_many_arguments)]
pub fn write_header(
    out: &mut Vec<u8>,
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: TcpFlags,
    window_size: u16,
    opts: Option<&TcpOptions>,
) -> usize {
    let opts_len = opts.map_or(0, options_len);
    debug_assert!(opts_len % 4 == 0 && opts_len <= MAX_TCP_OPTIONS_LEN);
    let start = out.len();
    let data_offset_words = (TCP_HEADER_LEN + opts_len) / 4;
    let offset_flags = ((data_offset_words as u16) << TCP_OFFSET_SHIFT) | flags.bits();
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&seq_num.to_be_bytes());
    out.extend_from_slice(&ack_num.to_be_bytes());
    out.extend_from_slice(&offset_flags.to_be_bytes());
    out.extend_from_slice(&window_size.to_be_bytes());
    out.extend_from_slice(&[0, 0]); // checksum, patched later
    out.extend_from_slice(&[0, 0]); // urgent pointer
    if let Some(opts) = opts {
        write_options(opts, out);
    }
    start + 16
}

/// Checksum of a full TCP segment (header plus data) under the IPv4
/// pseudo-header. For verification of a received segment this must come out
/// as zero.
pub fn segment_checksum(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, segment: BufRef<'_>) -> u16 {
    let mut chksum = ChksumAccumulator::new();
    chksum.add_u32(u32::from(src_addr));
    chksum.add_u32(u32::from(dst_addr));
    chksum.add_u16(u16::from(u8::from(crate::ip::defs::Ipv4Type::TCP)));
    chksum.add_u16(segment.len() as u16);
    chksum.add_buf(segment);
    chksum.finish()
}
