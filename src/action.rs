//! Actions: broadcast-style wake of every waiter, built as a semaphore
//! used purely in wake-all mode (`max_count` set to the task arena's
//! own capacity, so a broadcast is never capped short; `count == 0`
//! between broadcasts).

use crate::sema::SemId;

/// A broadcast handle. `wait_action` is exactly `wait_sem`; `notify_all`
/// repeatedly signals until the pending FIFO drains, waking every
/// listener in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(pub SemId);
