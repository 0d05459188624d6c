//! Out-of-sequence segment tracking.
//!
//! Keeps up to a configured number of received contiguous ranges of data,
//! possibly followed by a FIN, as a small sorted array. Ranges never touch:
//! touching or intersecting ranges are merged on insert. A FIN is encoded as
//! a zero-length range positioned at its sequence number plus one, which
//! lets the merge logic treat it as never touching preceding data.

use crate::tcp::defs::{seq_add, seq_diff, seq_lt, seq_lte, SeqType};

/// One contiguous region of buffered data, a FIN, or the end marker.
#[derive(Debug, Clone, Copy)]
struct OosSeg {
    start: SeqType,
    end: SeqType,
}

impl OosSeg {
    // An entry with start == end+1 marks the end of the used entries.
    fn make_end() -> OosSeg {
        OosSeg { start: 1, end: 0 }
    }

    fn is_end(self) -> bool {
        self.start == seq_add(self.end, 1)
    }

    // An entry with start == end is a FIN at sequence start-1.
    fn is_fin(self) -> bool {
        self.start == self.end
    }

    fn make_fin(fin_seq: SeqType) -> OosSeg {
        let seg_seq = seq_add(fin_seq, 1);
        OosSeg { start: seg_seq, end: seg_seq }
    }

    fn fin_seq(self) -> SeqType {
        debug_assert!(self.is_fin());
        seq_diff(self.start, 1)
    }

    fn is_end_or_fin(self) -> bool {
        seq_diff(self.start, self.end) <= 1
    }
}

#[derive(Debug)]
pub struct OosBuffer {
    segs: Vec<OosSeg>,
}

impl OosBuffer {
    pub fn new(num_segs: u8) -> Self {
        debug_assert!(num_segs >= 1 && num_segs <= 15);
        let mut segs = vec![OosSeg::make_end(); usize::from(num_segs)];
        segs[0] = OosSeg::make_end();
        OosBuffer { segs }
    }

    pub fn clear(&mut self) {
        self.segs[0] = OosSeg::make_end();
    }

    pub fn is_nothing_buffered(&self) -> bool {
        self.segs[0].is_end()
    }

    fn count(&self) -> usize {
        let mut n = 0;
        while n < self.segs.len() && !self.segs[n].is_end() {
            n += 1;
        }
        n
    }

    /// Record a received segment. `rcv_nxt` is the receive-next before any
    /// update due to this segment. Sets `need_ack` when the segment was out
    /// of sequence or filled a gap. Returns false on FIN inconsistency, in
    /// which case nothing was updated and the connection must be aborted.
    pub fn update_for_segment_received(
        &mut self,
        rcv_nxt: SeqType,
        seg_start: SeqType,
        seg_datalen: usize,
        seg_fin: bool,
        need_ack: &mut bool,
    ) -> bool {
        *need_ack = seg_start != rcv_nxt;

        let seg_end = seq_add(seg_start, seg_datalen as SeqType);
        let num_segs = self.segs.len();
        let mut num = self.count();

        // FIN consistency checks against what is already buffered.
        if num > 0 && self.segs[num - 1].is_fin() {
            let fin_seq = self.segs[num - 1].fin_seq();
            // Data beyond the buffered FIN. (A)
            if seg_datalen > 0 && !seq_lte(seg_end, fin_seq, rcv_nxt) {
                return false;
            }
            // A FIN at a different position.
            if seg_fin && seg_end != fin_seq {
                return false;
            }
        } else if seg_fin && num > 0 && !seq_lte(self.segs[num - 1].end, seg_end, rcv_nxt) {
            // A FIN before already received data.
            return false;
        }

        if seg_datalen > 0 {
            // Skip over ranges strictly before this one. A FIN is never
            // skipped due to check (A) above.
            let mut pos = 0;
            while pos < num && seq_lt(self.segs[pos].end, seg_start, rcv_nxt) {
                pos += 1;
            }

            if pos == num || seq_lt(seg_end, self.segs[pos].start, rcv_nxt) {
                // Insert a new range here. If all slots are used and we are
                // not inserting at the end, discard the rightmost range so
                // that data earlier in sequence space always wins; this
                // guarantees in-sequence progress cannot stall on a full
                // buffer. A buffered FIN may be discarded with it.
                if num == num_segs && pos < num_segs {
                    num -= 1;
                }
                if num < num_segs {
                    if pos < num {
                        *need_ack = true;
                        self.segs.copy_within(pos..num, pos + 1);
                    }
                    self.segs[pos] = OosSeg { start: seg_start, end: seg_end };
                    num += 1;
                }
            } else {
                // The new range intersects or touches [pos], which cannot be
                // a FIN (check (A) would have failed). Merge.
                debug_assert!(!self.segs[pos].is_fin());

                if seq_lt(seg_start, self.segs[pos].start, rcv_nxt) {
                    *need_ack = true;
                    self.segs[pos].start = seg_start;
                }

                if !seq_lte(seg_end, self.segs[pos].end, rcv_nxt) {
                    *need_ack = true;
                    self.segs[pos].end = seg_end;

                    // Absorb any subsequent ranges the extension now touches.
                    let mut merge_pos = pos + 1;
                    while merge_pos < num && !seq_lt(seg_end, self.segs[merge_pos].start, rcv_nxt)
                    {
                        debug_assert!(!self.segs[merge_pos].is_fin());
                        if seq_lte(seg_end, self.segs[merge_pos].end, rcv_nxt) {
                            self.segs[pos].end = self.segs[merge_pos].end;
                            merge_pos += 1;
                            break;
                        }
                        merge_pos += 1;
                    }

                    let num_merged = merge_pos - (pos + 1);
                    if num_merged > 0 {
                        if merge_pos < num {
                            self.segs.copy_within(merge_pos..num, pos + 1);
                        }
                        num -= num_merged;
                    }
                }
            }
        }

        // Remember a FIN if not already buffered and there is space.
        if seg_fin && (num == 0 || !self.segs[num - 1].is_fin()) && num < num_segs {
            self.segs[num] = OosSeg::make_fin(seg_end);
            num += 1;
        }

        if num < num_segs {
            self.segs[num] = OosSeg::make_end();
        }
        debug_assert!(num == self.count());

        true
    }

    /// Shift out any data or FIN now available at `rcv_nxt` (the receive-next
    /// before this update). Returns the length of in-sequence data and
    /// whether a FIN immediately follows it.
    pub fn shift_available(&mut self, rcv_nxt: SeqType) -> (usize, bool) {
        let mut datalen = 0;
        if !self.segs[0].is_end_or_fin() && self.segs[0].start == rcv_nxt {
            let seq_end = self.segs[0].end;
            datalen = seq_diff(seq_end, self.segs[0].start) as usize;

            let mut num = self.count();
            if num > 1 {
                self.segs.copy_within(1..num, 0);
            }
            num -= 1;
            self.segs[num] = OosSeg::make_end();

            // Ranges never touch, so the next one cannot continue at seq_end.
            debug_assert!(
                self.segs[0].is_end_or_fin() || !seq_lte(self.segs[0].start, seq_end, rcv_nxt)
            );
        }

        let fin = self.segs[0].is_fin()
            && self.segs[0].fin_seq() == seq_add(rcv_nxt, datalen as SeqType);
        (datalen, fin)
    }
}
