//! Named timers for a PCB.
//!
//! Each PCB owns three independently settable timers multiplexed onto the
//! event loop's single wakeup deadline. Mutations mark the pool dirty; the
//! engine recomputes the wakeup deadline once per cooperative entry
//! (`do_delayed_timer_update`), so nested updates to the same timer from
//! within callbacks collapse into one.

use crate::tcp::defs::TimeTicks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbTimer {
    /// Aborting the PCB: SYN_SENT/SYN_RCVD handshake timeouts, TIME_WAIT
    /// expiry and the abandonment timeout.
    Abort = 0,
    /// Deferred pcb_output after send-buffer extension, and send retries.
    Output = 1,
    /// Retransmission, window probe and cwnd idle reset.
    Rtx = 2,
}

const NUM_TIMERS: usize = 3;
const ALL_TIMERS: [PcbTimer; NUM_TIMERS] = [PcbTimer::Abort, PcbTimer::Output, PcbTimer::Rtx];

#[derive(Debug)]
pub struct MultiTimer {
    times: [TimeTicks; NUM_TIMERS],
    armed: u8,
    dirty: bool,
}

impl MultiTimer {
    pub fn new() -> Self {
        MultiTimer { times: [0; NUM_TIMERS], armed: 0, dirty: false }
    }

    pub fn is_set(&self, timer: PcbTimer) -> bool {
        self.armed & (1 << timer as u8) != 0
    }

    pub fn set_at(&mut self, timer: PcbTimer, abs_time: TimeTicks) {
        self.times[timer as usize] = abs_time;
        self.armed |= 1 << timer as u8;
        self.dirty = true;
    }

    pub fn set_after(&mut self, timer: PcbTimer, now: TimeTicks, rel_time: TimeTicks) {
        self.set_at(timer, now + rel_time);
    }

    pub fn unset(&mut self, timer: PcbTimer) {
        self.armed &= !(1 << timer as u8);
        self.dirty = true;
    }

    pub fn unset_all(&mut self) {
        self.armed = 0;
        self.dirty = false;
    }

    /// Earliest armed deadline, if any.
    pub fn next_expiry(&self) -> Option<TimeTicks> {
        ALL_TIMERS
            .iter()
            .filter(|&&t| self.is_set(t))
            .map(|&t| self.times[t as usize])
            .min()
    }

    /// Disarm and return one timer due at or before `now`. The handler runs
    /// after this; re-arming from the handler is fine.
    pub fn take_expired(&mut self, now: TimeTicks) -> Option<PcbTimer> {
        for &t in &ALL_TIMERS {
            if self.is_set(t) && self.times[t as usize] <= now {
                self.armed &= !(1 << t as u8);
                self.dirty = true;
                return Some(t);
            }
        }
        None
    }

    /// Clear and report the dirty flag; the caller is responsible for
    /// recomputing the wakeup deadline when it was set.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}

impl Default for MultiTimer {
    fn default() -> Self {
        Self::new()
    }
}
