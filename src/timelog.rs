//! Per-chain frame timestamp ring inspected by the watchdog.
//!
//! Each dispatched frame gets an entry holding its shot, start and end times in
//! nanoseconds since the core's clock epoch; zero means "not recorded yet". On
//! expiry the watchdog walks the entries written since its previous inspection and
//! reports the first whose ordering is impossible.

use std::time::Instant;

/// Entries kept per chain.
pub const TIME_LOG_DEPTH: usize = 16;

/// Monotonic clock shared by every chain of a core.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the epoch, never zero.
    pub fn now_ns(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_nanos();
        u64::try_from(elapsed).unwrap_or(u64::MAX - 1) + 1
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamps of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTimes {
    /// Frame count.
    pub fcount: u64,
    /// Shot issued.
    pub shot_ns: u64,
    /// Frame start observed.
    pub start_ns: u64,
    /// Frame end observed.
    pub end_ns: u64,
}

/// Why a frame was judged stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    /// Started but never ended (or started again after its end).
    StartAfterEnd,
    /// Frame start observed before the shot was issued.
    ShotAfterStart,
}

/// First inconsistent entry found by an inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckReport {
    /// Offending frame.
    pub fcount: u64,
    /// Inconsistency.
    pub reason: StuckReason,
    /// Recorded times.
    pub times: FrameTimes,
}

/// Ring of [`FrameTimes`].
#[derive(Debug, Clone)]
pub struct FrameTimeLog {
    entries: [FrameTimes; TIME_LOG_DEPTH],
    /// Sequence number of the next entry to write.
    head: u64,
    /// Sequence number of the oldest entry not yet inspected.
    checked: u64,
}

impl Default for FrameTimeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTimeLog {
    /// Empty log.
    pub fn new() -> Self {
        Self {
            entries: [FrameTimes::default(); TIME_LOG_DEPTH],
            head: 0,
            checked: 0,
        }
    }

    fn slot_of(seq: u64) -> usize {
        (seq % TIME_LOG_DEPTH as u64) as usize
    }

    fn find_mut(&mut self, fcount: u64) -> Option<&mut FrameTimes> {
        let oldest = self.head.saturating_sub(TIME_LOG_DEPTH as u64);
        let seq = (oldest..self.head)
            .rev()
            .find(|seq| self.entries[Self::slot_of(*seq)].fcount == fcount)?;
        Some(&mut self.entries[Self::slot_of(seq)])
    }

    /// Start a new entry for `fcount` at shot time.
    pub fn record_shot(&mut self, fcount: u64, now_ns: u64) {
        let idx = Self::slot_of(self.head);
        self.entries[idx] = FrameTimes {
            fcount,
            shot_ns: now_ns,
            start_ns: 0,
            end_ns: 0,
        };
        self.head += 1;
        let oldest = self.head.saturating_sub(TIME_LOG_DEPTH as u64);
        if self.checked < oldest {
            self.checked = oldest;
        }
    }

    /// Record frame start. Returns false if `fcount` has no entry.
    pub fn record_start(&mut self, fcount: u64, now_ns: u64) -> bool {
        match self.find_mut(fcount) {
            Some(entry) => {
                entry.start_ns = now_ns;
                true
            }
            None => false,
        }
    }

    /// Record frame end. Returns false if `fcount` has no entry.
    pub fn record_end(&mut self, fcount: u64, now_ns: u64) -> bool {
        match self.find_mut(fcount) {
            Some(entry) => {
                entry.end_ns = now_ns;
                true
            }
            None => false,
        }
    }

    /// Times recorded for `fcount`.
    pub fn get(&self, fcount: u64) -> Option<FrameTimes> {
        let oldest = self.head.saturating_sub(TIME_LOG_DEPTH as u64);
        (oldest..self.head)
            .rev()
            .map(|seq| self.entries[Self::slot_of(seq)])
            .find(|e| e.fcount == fcount)
    }

    /// Check entries written since the previous inspection.
    ///
    /// Unset timestamps are zero, so a frame that started but never ended shows
    /// up as `start > end`. Inspected entries are consumed whether or not they
    /// were stuck.
    pub fn inspect(&mut self) -> Option<StuckReport> {
        let from = self.checked;
        let to = self.head;
        self.checked = to;
        (from..to).find_map(|seq| {
            let times = self.entries[Self::slot_of(seq)];
            let reason = if times.start_ns != 0 && times.shot_ns > times.start_ns {
                StuckReason::ShotAfterStart
            } else if times.start_ns > times.end_ns {
                StuckReason::StartAfterEnd
            } else {
                return None;
            };
            Some(StuckReport {
                fcount: times.fcount,
                reason,
                times,
            })
        })
    }

    /// Entries written since the previous inspection.
    pub fn unchecked(&self) -> u64 {
        self.head - self.checked
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_frames_are_consistent() {
        let mut log = FrameTimeLog::new();
        log.record_shot(1, 10);
        assert!(log.record_start(1, 20));
        assert!(log.record_end(1, 30));
        assert_eq!(log.inspect(), None);
        assert_eq!(log.unchecked(), 0);
    }

    #[test]
    fn start_without_end_is_stuck() {
        let mut log = FrameTimeLog::new();
        log.record_shot(12, 10);
        log.record_start(12, 20);
        let report = log.inspect().unwrap();
        assert_eq!(report.fcount, 12);
        assert_eq!(report.reason, StuckReason::StartAfterEnd);
        assert_eq!(log.inspect(), None);
    }

    #[test]
    fn shot_after_start_is_stuck() {
        let mut log = FrameTimeLog::new();
        log.record_shot(3, 50);
        log.record_start(3, 40);
        log.record_end(3, 60);
        assert_eq!(log.inspect().unwrap().reason, StuckReason::ShotAfterStart);
    }

    #[test]
    fn shot_only_entry_is_not_stuck() {
        let mut log = FrameTimeLog::new();
        log.record_shot(4, 50);
        assert_eq!(log.inspect(), None);
    }

    #[test]
    fn ring_wraps_and_skips_overwritten_entries() {
        let mut log = FrameTimeLog::new();
        for f in 0..(TIME_LOG_DEPTH as u64 + 4) {
            log.record_shot(f, f * 10 + 1);
        }
        assert_eq!(log.unchecked(), TIME_LOG_DEPTH as u64);
        assert!(log.get(0).is_none());
        assert!(log.record_end(TIME_LOG_DEPTH as u64 + 3, 1_000));
        assert!(!log.record_start(1, 5));
    }

    #[test]
    fn clock_never_returns_zero() {
        let clock = Clock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
