//! IPv4 datagram reassembly.
//!
//! Uses the strategy suggested in RFC 815: holes are described by 4-byte
//! descriptors written in place at the beginnings of the holes themselves,
//! forming a singly-linked list anchored at the slot. A sentinel hole at the
//! buffer tail can never be filled by a fragment, so a non-free slot always
//! has at least one hole.

use crate::buf::BufRef;
use crate::ip::packet::IPV4_HEADER_LEN;
use std::net::Ipv4Addr;

/// Size of the in-place hole descriptor: {hole_size: u16, next_hole: u16}.
const HOLE_DESC_SIZE: u16 = 4;

/// Null link in the hole list; also marks a slot as free.
const REASS_NULL: u16 = u16::MAX;

const TICKS_PER_SECOND: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ReassConfig {
    /// Number of datagrams being reassembled concurrently.
    pub max_entries: usize,
    /// Maximum size of a reassembled datagram.
    pub max_size: u16,
    /// Maximum number of holes in an incompletely reassembled datagram.
    pub max_holes: u8,
    /// Upper bound on the lifetime of an incomplete datagram, additionally
    /// restricted by the TTL of its fragments.
    pub max_time_seconds: u8,
}

impl Default for ReassConfig {
    fn default() -> Self {
        ReassConfig { max_entries: 1, max_size: 1480, max_holes: 10, max_time_seconds: 60 }
    }
}

struct ReassSlot {
    /// Offset in data to the first hole, or REASS_NULL for a free slot.
    first_hole_offset: u16,
    /// The total data length, or 0 if the last fragment was not seen yet.
    data_length: u16,
    /// Tick after which the slot is considered invalid.
    expiration_time: u64,
    /// Copy of the IPv4 base header of the first fragment that arrived.
    header: [u8; IPV4_HEADER_LEN],
    /// Data and holes; the final HOLE_DESC_SIZE bytes only ever hold the
    /// tail sentinel descriptor and cannot contain data.
    data: Box<[u8]>,
}

pub struct Ipv4Reassembly {
    cfg: ReassConfig,
    slots: Vec<ReassSlot>,
    purge_at: u64,
}

impl Ipv4Reassembly {
    pub fn new(cfg: ReassConfig) -> Self {
        assert!(cfg.max_entries > 0);
        assert!(cfg.max_holes >= 1 && cfg.max_holes <= 250);
        assert!(cfg.max_time_seconds >= 5);
        assert!(cfg.max_size <= u16::MAX - HOLE_DESC_SIZE);
        let buf_len = usize::from(cfg.max_size) + usize::from(HOLE_DESC_SIZE);
        let slots = (0..cfg.max_entries)
            .map(|_| ReassSlot {
                first_hole_offset: REASS_NULL,
                data_length: 0,
                expiration_time: 0,
                header: [0; IPV4_HEADER_LEN],
                data: vec![0u8; buf_len].into_boxed_slice(),
            })
            .collect();
        Ipv4Reassembly { cfg, slots, purge_at: 0 }
    }

    /// Process a received fragment and possibly return a complete datagram.
    ///
    /// Must only be called for packets which are not complete datagrams
    /// (more-fragments set or a nonzero fragment offset). The returned
    /// payload reference is valid until the next call.
    ///
    /// Reassembly failures are silent: the slot is invalidated and the
    /// sender is left to retransmit.
    #[allow(clippy::too_many_arguments)]
    pub fn reassemble(
        &mut self,
        now: u64,
        ident: u16,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        proto: u8,
        ttl: u8,
        more_fragments: bool,
        fragment_offset: u16,
        header: &[u8],
        mut dgram: BufRef<'_>,
    ) -> Option<&[u8]> {
        debug_assert!(dgram.len() <= usize::from(u16::MAX));
        debug_assert!(more_fragments || fragment_offset > 0);
        debug_assert!(header.len() >= IPV4_HEADER_LEN);

        if dgram.is_empty() {
            return None;
        }

        let max_size = self.cfg.max_size;
        let buf_len = max_size + HOLE_DESC_SIZE;

        let slot = match self.find_slot(now, ident, src_addr, dst_addr, proto) {
            Some(slot) => slot,
            None => {
                let slot = self.alloc_slot(now, ttl);
                let s = &mut self.slots[slot];
                s.header.copy_from_slice(&header[..IPV4_HEADER_LEN]);
                s.first_hole_offset = 0;
                s.data_length = 0;
                // One hole from the start of data to "infinity": the final
                // descriptor-sized bytes cannot be filled by a fragment, so
                // at least one hole always remains in the list.
                write_hole(&mut s.data, 0, buf_len, REASS_NULL);
                slot
            }
        };

        let s = &mut self.slots[slot];

        // Verify that the fragment fits into the buffer.
        if fragment_offset > max_size || dgram.len() > usize::from(max_size - fragment_offset) {
            s.first_hole_offset = REASS_NULL;
            return None;
        }
        let fragment_end = fragment_offset + dgram.len() as u16;

        // Last-fragment sanity: the first last-fragment fixes the data
        // length; any data beyond that end, or a second last-fragment with a
        // different end, invalidates the slot.
        if !more_fragments {
            if s.data_length != 0 && fragment_end != s.data_length {
                s.first_hole_offset = REASS_NULL;
                return None;
            }
            s.data_length = fragment_end;
        } else if s.data_length != 0 && fragment_end > s.data_length {
            s.first_hole_offset = REASS_NULL;
            return None;
        }

        // Walk the hole list, dismantling every hole the fragment overlaps
        // into up to two residual holes (RFC 815).
        let mut prev_hole_offset = REASS_NULL;
        let mut hole_offset = s.first_hole_offset;
        let mut num_holes: u16 = 0;
        loop {
            debug_assert!(hole_offset <= max_size);
            let (hole_size, next_hole_offset) = read_hole(&s.data, hole_offset);
            debug_assert!(hole_size <= buf_len - hole_offset);
            let hole_end = hole_offset + hole_size;

            // Data was already received beyond the end of a last fragment.
            if !more_fragments && hole_offset > fragment_end {
                s.first_hole_offset = REASS_NULL;
                return None;
            }

            if fragment_offset >= hole_end || fragment_end <= hole_offset {
                // No overlap with this hole.
                prev_hole_offset = hole_offset;
                num_holes += 1;
            } else {
                // Residual hole on the left.
                if fragment_offset > hole_offset {
                    let new_hole_size = fragment_offset - hole_offset;
                    if new_hole_size < HOLE_DESC_SIZE {
                        s.first_hole_offset = REASS_NULL;
                        return None;
                    }
                    // Same place as the old hole; the link to it is intact.
                    write_hole_size(&mut s.data, hole_offset, new_hole_size);
                    prev_hole_offset = hole_offset;
                    num_holes += 1;
                }

                // Residual hole on the right.
                if fragment_end < hole_end {
                    let new_hole_size = hole_end - fragment_end;
                    if new_hole_size < HOLE_DESC_SIZE {
                        s.first_hole_offset = REASS_NULL;
                        return None;
                    }
                    write_hole(&mut s.data, fragment_end, new_hole_size, REASS_NULL);
                    link_prev(s, prev_hole_offset, fragment_end);
                    prev_hole_offset = fragment_end;
                    num_holes += 1;
                }

                link_prev(s, prev_hole_offset, next_hole_offset);
            }

            if next_hole_offset == REASS_NULL {
                break;
            }
            hole_offset = next_hole_offset;
        }

        // The tail sentinel cannot be filled, so a hole always remains.
        debug_assert!(s.first_hole_offset != REASS_NULL);

        // Copy the fragment data into place.
        let off = usize::from(fragment_offset);
        let len = dgram.len();
        dgram.take_bytes(&mut s.data[off..off + len]);

        if s.data_length == 0 || s.first_hole_offset < s.data_length {
            // Not complete. Give up if the hole list grew too long.
            if num_holes > u16::from(self.cfg.max_holes) {
                s.first_hole_offset = REASS_NULL;
            }
            return None;
        }

        // Complete: the only remaining hole is the tail sentinel starting at
        // exactly data_length.
        debug_assert!(s.first_hole_offset == s.data_length);
        debug_assert!({
            let (hole_size, next) = read_hole(&s.data, s.first_hole_offset);
            hole_size == buf_len - s.first_hole_offset && next == REASS_NULL
        });

        s.first_hole_offset = REASS_NULL;
        let data_length = usize::from(s.data_length);
        Some(&self.slots[slot].data[..data_length])
    }

    /// Purge expired slots. Driven periodically by the event loop; matching
    /// also purges lazily, so this only bounds how long stale slots linger.
    pub fn poll(&mut self, now: u64) {
        if now < self.purge_at {
            return;
        }
        self.purge_at = now + u64::from(self.cfg.max_time_seconds) * TICKS_PER_SECOND;
        for slot in &mut self.slots {
            if slot.first_hole_offset != REASS_NULL && slot.expiration_time <= now {
                slot.first_hole_offset = REASS_NULL;
            }
        }
    }

    pub fn next_wake(&self) -> Option<u64> {
        self.slots
            .iter()
            .any(|s| s.first_hole_offset != REASS_NULL)
            .then_some(self.purge_at)
    }

    fn find_slot(
        &mut self,
        now: u64,
        ident: u16,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        proto: u8,
    ) -> Option<usize> {
        let mut found = None;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.first_hole_offset == REASS_NULL {
                continue;
            }
            // Expired slots are freed as we walk past them.
            if slot.expiration_time <= now {
                slot.first_hole_offset = REASS_NULL;
                continue;
            }
            let h = &slot.header;
            if u16::from_be_bytes([h[4], h[5]]) == ident
                && h[9] == proto
                && h[12..16] == src_addr.octets()
                && h[16..20] == dst_addr.octets()
            {
                found = Some(i);
            }
        }
        found
    }

    fn alloc_slot(&mut self, now: u64, ttl: u8) -> usize {
        let mut result = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.first_hole_offset == REASS_NULL {
                result = i;
                break;
            }
            // Otherwise evict the slot closest to expiration.
            if slot.expiration_time < self.slots[result].expiration_time {
                result = i;
            }
        }
        let seconds = ttl.min(self.cfg.max_time_seconds);
        self.slots[result].expiration_time = now + u64::from(seconds) * TICKS_PER_SECOND;
        self.slots[result].data_length = 0;
        result
    }
}

fn read_hole(data: &[u8], offset: u16) -> (u16, u16) {
    let off = usize::from(offset);
    let hole_size = u16::from_be_bytes([data[off], data[off + 1]]);
    let next = u16::from_be_bytes([data[off + 2], data[off + 3]]);
    (hole_size, next)
}

fn write_hole(data: &mut [u8], offset: u16, hole_size: u16, next: u16) {
    let off = usize::from(offset);
    data[off..off + 2].copy_from_slice(&hole_size.to_be_bytes());
    data[off + 2..off + 4].copy_from_slice(&next.to_be_bytes());
}

fn write_hole_size(data: &mut [u8], offset: u16, hole_size: u16) {
    let off = usize::from(offset);
    data[off..off + 2].copy_from_slice(&hole_size.to_be_bytes());
}

fn link_prev(slot: &mut ReassSlot, prev_hole_offset: u16, hole_offset: u16) {
    if prev_hole_offset == REASS_NULL {
        slot.first_hole_offset = hole_offset;
    } else {
        let off = usize::from(prev_hole_offset);
        slot.data[off + 2..off + 4].copy_from_slice(&hole_offset.to_be_bytes());
    }
}
