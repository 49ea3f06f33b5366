//! Software timers layered over the single hardware tick.
//!
//! A timer holds a remaining tick count (31 bits is all the source
//! protocol needs; we simply use a `u32` and clamp at `i32::MAX as u32`
//! to keep the top-bit-is-a-flag trick, flagged as a Redesign in
//! SPEC_FULL.md, out of the picture entirely) and one of three
//! dispositions on expiry.

use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u32);

/// The largest tick count a timer can be armed with (31-bit max).
pub const MAX_TICKS: u32 = (1u32 << 31) - 1;

/// The largest duration, in milliseconds, `start` accepts before
/// clamping — `2_162_687_832` per distilled spec §4.4's boundary case.
pub const MAX_ARM_MS: u32 = 2_162_687_832;

/// What happens when a timer reaches zero.
#[derive(Clone, Copy)]
pub enum Notify {
    /// No disposition; the timer simply expires.
    None,
    /// Wake `task` if it is currently `Stopped`/`SleepInfinite`/`SleepTimed`.
    Task(TaskId),
    /// Invoke `func`.
    Function(fn()),
}

pub(crate) struct TimerRecord {
    pub id: TimerId,
    pub remaining: u32,
    pub notify: Notify,
    /// The task that armed this timer, if any — used by `erase` to
    /// stop every timer a task owns without a full-list scan.
    pub owner: Option<TaskId>,
}

impl TimerRecord {
    pub(crate) fn new(id: TimerId) -> Self {
        Self {
            id,
            remaining: 0,
            notify: Notify::None,
            owner: None,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.remaining > 0
    }

    /// Subtract `elapsed` ticks, saturating at zero.
    pub(crate) fn tick(&mut self, elapsed: u32) {
        if self.remaining > 0 {
            self.remaining = self.remaining.saturating_sub(elapsed);
            if self.remaining == 0 {
                log::trace!("timer {:?} counted down to zero", self.id);
            }
        }
    }
}

/// Clamp a requested arm duration (already converted to ticks) to the
/// 31-bit maximum, matching the source's "duration beyond
/// 2,162,687,832 ms is clamped" boundary.
pub(crate) fn clamp_ticks(ticks: u64) -> u32 {
    ticks.min(MAX_TICKS as u64) as u32
}
