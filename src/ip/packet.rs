//! IPv4 base-header codec and the internet checksum.

use crate::buf::BufRef;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;

pub const IPV4_FLAG_DF: u16 = 1 << 14;
pub const IPV4_FLAG_MF: u16 = 1 << 13;
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

// https://datatracker.ietf.org/doc/html/rfc791
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Version|  IHL  |Type of Service|          Total Length         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         Identification        |Flags|      Fragment Offset    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Time to Live |    Protocol   |         Header Checksum       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       Source Address                          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Destination Address                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub dscp_ecn: u8,
    pub total_len: u16,
    pub ident: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes (the wire field scaled by 8).
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse the base header. Returns the header and the full header length
    /// (IHL scaled), or None if the packet is malformed.
    pub fn parse(packet: &[u8]) -> Option<(Ipv4Header, usize)> {
        if packet.len() < IPV4_HEADER_LEN {
            return None;
        }
        let version = packet[0] >> 4;
        if version != 4 {
            return None;
        }
        let header_len = ((packet[0] & 0xf) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || packet.len() < header_len {
            return None;
        }
        let total_len = u16::from_be_bytes([packet[2], packet[3]]);
        if (total_len as usize) < header_len {
            return None;
        }
        let flags_frag = u16::from_be_bytes([packet[6], packet[7]]);
        let header = Ipv4Header {
            dscp_ecn: packet[1],
            total_len,
            ident: u16::from_be_bytes([packet[4], packet[5]]),
            dont_fragment: flags_frag & IPV4_FLAG_DF != 0,
            more_fragments: flags_frag & IPV4_FLAG_MF != 0,
            fragment_offset: (flags_frag & IPV4_FRAG_OFFSET_MASK) * 8,
            ttl: packet[8],
            protocol: packet[9],
            checksum: u16::from_be_bytes([packet[10], packet[11]]),
            src_addr: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst_addr: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        };
        Some((header, header_len))
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }

    /// Serialize the base header (no options) with a correct checksum.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= IPV4_HEADER_LEN);
        debug_assert!(self.fragment_offset % 8 == 0);
        out[0] = 0x45;
        out[1] = self.dscp_ecn;
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.ident.to_be_bytes());
        let mut flags_frag = self.fragment_offset / 8;
        if self.dont_fragment {
            flags_frag |= IPV4_FLAG_DF;
        }
        if self.more_fragments {
            flags_frag |= IPV4_FLAG_MF;
        }
        out[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src_addr.octets());
        out[16..20].copy_from_slice(&self.dst_addr.octets());
        let mut chksum = ChksumAccumulator::new();
        chksum.add_bytes(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&chksum.finish().to_be_bytes());
    }

    /// Verify the header checksum over the raw header bytes.
    pub fn verify_checksum(header_bytes: &[u8]) -> bool {
        let mut chksum = ChksumAccumulator::new();
        chksum.add_bytes(header_bytes);
        chksum.finish() == 0
    }
}

/// Accumulator for the 16-bit one's-complement internet checksum.
///
/// Bytes are summed as a big-endian 16-bit word stream; odd-length chunks
/// carry their parity so that checksums over buffer chains with arbitrary
/// segment boundaries come out right.
pub struct ChksumAccumulator {
    sum: u32,
    odd: bool,
}

impl ChksumAccumulator {
    pub fn new() -> Self {
        ChksumAccumulator { sum: 0, odd: false }
    }

    pub fn add_u16(&mut self, word: u16) {
        debug_assert!(!self.odd);
        self.sum += u32::from(word);
    }

    pub fn add_u32(&mut self, word: u32) {
        self.add_u16((word >> 16) as u16);
        self.add_u16(word as u16);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.odd {
                self.sum += u32::from(b);
            } else {
                self.sum += u32::from(b) << 8;
            }
            self.odd = !self.odd;
        }
    }

    pub fn add_buf(&mut self, buf: BufRef<'_>) {
        for chunk in buf.chunks() {
            self.add_bytes(chunk);
        }
    }

    /// Fold the carries and return the one's complement.
    pub fn finish(mut self) -> u16 {
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
        !(self.sum as u16)
    }
}

impl Default for ChksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
