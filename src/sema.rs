//! Counting semaphores and FIFO mutexes.
//!
//! Per the Design Notes' union-reuse guidance, the source's "a mutex is
//! a semaphore with `max_count == 0`, first field reinterpreted as
//! owner" trick is kept at the *storage* layer (one arena, one record
//! shape) but exposed through two distinct handle types, [`SemId`] and
//! [`MutexId`], so application code can never accidentally `signal` a
//! mutex or `lock` a semaphore.

use alloc::collections::VecDeque;

use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub u32);

/// What kind of record this arena slot holds.
pub(crate) enum Kind {
    Counting { count: u32, max: u32 },
    Mutex { owner: Option<TaskId> },
}

pub(crate) struct SemaphoreRecord {
    pub kind: Kind,
    /// FIFO of tasks blocked on this record (`WaitSem` tasks for a
    /// semaphore, lock-waiters for a mutex).
    pub pending: VecDeque<TaskId>,
}

impl SemaphoreRecord {
    pub(crate) fn counting(max: u32, init: u32) -> Self {
        Self {
            kind: Kind::Counting {
                count: init.min(max),
                max,
            },
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn mutex() -> Self {
        Self {
            kind: Kind::Mutex { owner: None },
            pending: VecDeque::new(),
        }
    }

    /// Outcome of a non-blocking `wait`/decrement attempt.
    pub(crate) fn try_wait(&mut self) -> bool {
        match &mut self.kind {
            Kind::Counting { count, .. } if *count > 0 => {
                *count -= 1;
                log::trace!("semaphore wait succeeded, count now {count}");
                true
            }
            _ => false,
        }
    }

    /// `true` if over-release (no room to increment and nobody was
    /// woken).
    pub(crate) fn signal_is_over_release(&self) -> bool {
        match &self.kind {
            Kind::Counting { count, max } => self.pending.is_empty() && *count >= *max,
            Kind::Mutex { .. } => false,
        }
    }
}
