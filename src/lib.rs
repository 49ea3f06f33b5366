//! A cooperative, single-stack, round-robin real-time kernel core for
//! resource-constrained microcontrollers.
//!
//! There is no preemption, no priority inheritance and no memory
//! protection: every task runs until it calls one of the suspension
//! operations exposed through [`kernel::Cx`], and the scheduler picks
//! the next task in ring order. The only environment-specific surface
//! is [`Port`]: a tick source, an interrupt-claim table, peripheral
//! gating and sleep-mode selection, implemented once per board.
//!
//! Boot sequence for an integrating firmware crate:
//!
//! 1. Implement [`Port`] against the board's timer/interrupt hardware.
//! 2. Call [`Kernel::boot`] with a [`BoardConfig`] and the boxed port.
//! 3. [`Kernel::setup`] each application task, [`Kernel::start`] the
//!    ones that should run immediately.
//! 4. Drive [`Kernel::step`] from the main loop (or from the tick
//!    interrupt directly, on boards with enough headroom).
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod action;
pub mod config;
pub mod critical;
pub mod error;
pub mod global;
pub mod heap;
pub mod kernel;
pub mod port;
pub mod sema;
pub mod task;
pub mod timer;

#[cfg(test)]
mod tests;

pub use action::ActionId;
pub use config::BoardConfig;
pub use critical::Masked;
pub use error::{install_error_hook, ErrorHook, ErrorSign, KernelError};
pub use heap::HeapPtr;
pub use kernel::{Cx, Kernel, StackEnd};
pub use port::{Peripherals, Port, SleepMode};
pub use sema::{MutexId, SemId};
pub use task::{Destructor, Step, Suspend, TaskBody, TaskId, TaskState, WaitCtx};
pub use timer::{Notify, TimerId};
