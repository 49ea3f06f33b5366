//! Global kernel singleton.
//!
//! Interrupt handlers in an integrating firmware crate need to reach
//! the kernel (to `report_irq`, mostly) without a context parameter
//! threaded all the way down from `main`. Same shape as the teacher's
//! own global scheduler slot (`static SCHEDULER: Mutex<Option<Scheduler>>
//! = Mutex::new(None);` in `scheduler/mod.rs`): a single `spin::Mutex`
//! around an `Option`, built with a `const fn` so no lazy-init wrapper
//! is needed, locked for the duration of each access.

use spin::Mutex;

use crate::kernel::Kernel;

static SLOT: Mutex<Option<Kernel>> = Mutex::new(None);

/// Install the booted kernel as the global instance. Firmware calls
/// this once, right after [`Kernel::boot`].
pub fn install(kernel: Kernel) {
    *SLOT.lock() = Some(kernel);
}

/// Run `f` against the global kernel. Panics if [`install`] has not
/// been called yet; safe to call from interrupt context since the
/// lock is a short, non-reentrant spinlock held only for `f`'s
/// duration.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let mut guard = SLOT.lock();
    let kernel = guard.as_mut().expect("global kernel not installed");
    f(kernel)
}
