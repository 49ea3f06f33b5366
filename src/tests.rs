//! End-to-end scenarios driven against a fake, manually-advanced [`Port`],
//! exercising the kernel the way `rtos_test.c` / `task_test.c` /
//! `timers_test.c` / `heap_test.c` / `semaphore_test.c` exercise the
//! original C implementation.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::config::BoardConfig;
use crate::kernel::{Cx, Kernel, StackEnd};
use crate::port::{Peripherals, Port, SleepMode};
use crate::sema::{MutexId, SemId};
use crate::task::{Step, Suspend, TaskBody, TaskId};
use crate::timer::Notify;

struct FakePort {
    tick_accum: u16,
    irq: [bool; 8],
    peripherals: Peripherals,
    interrupts_enabled: bool,
    watchdog_kicks: u32,
    sleep_log: alloc::vec::Vec<SleepMode>,
}

impl FakePort {
    fn new() -> Self {
        Self {
            tick_accum: 0,
            irq: [false; 8],
            peripherals: Peripherals::empty(),
            interrupts_enabled: true,
            watchdog_kicks: 0,
            sleep_log: alloc::vec::Vec::new(),
        }
    }

    fn advance(&mut self, ticks: u16) {
        self.tick_accum += ticks;
    }

    fn raise_irq(&mut self, id: u8) {
        self.irq[id as usize] = true;
    }
}

impl Port for FakePort {
    fn get_monotonic_tick_counter(&mut self) -> u16 {
        core::mem::take(&mut self.tick_accum)
    }

    fn report_irq(&mut self, irq_id: u8) {
        self.irq[irq_id as usize] = true;
    }

    fn claim_irq(&mut self, irq_id: u8) -> bool {
        core::mem::take(&mut self.irq[irq_id as usize])
    }

    fn any_irq_pending(&self) -> bool {
        self.irq.iter().any(|&b| b)
    }

    fn enable(&mut self, peripherals: Peripherals) {
        self.peripherals.insert(peripherals);
    }

    fn disable(&mut self, peripherals: Peripherals) {
        self.peripherals.remove(peripherals);
    }

    fn enabled_peripherals(&self) -> Peripherals {
        self.peripherals
    }

    fn sleep(&mut self, mode: SleepMode) {
        self.sleep_log.push(mode);
    }

    fn kick_watchdog(&mut self) {
        self.watchdog_kicks += 1;
    }

    fn mask_interrupts_save(&mut self) -> bool {
        let was = self.interrupts_enabled;
        self.interrupts_enabled = false;
        was
    }

    fn mask_interrupts_restore(&mut self, was_enabled: bool) {
        self.interrupts_enabled = was_enabled;
    }
}

fn boot_test_kernel() -> Kernel {
    Kernel::boot(Box::new(FakePort::new()), BoardConfig::defaults())
}

/// A port that reports a fixed number of ticks on every
/// `get_monotonic_tick_counter` call, so a scenario can drive time
/// forward simply by calling `step()` the right number of times.
struct OneTickPort {
    inner: FakePort,
    ticks_per_step: u16,
}

impl OneTickPort {
    fn new(ticks_per_step: u16) -> Self {
        Self {
            inner: FakePort::new(),
            ticks_per_step,
        }
    }
}

impl Port for OneTickPort {
    fn get_monotonic_tick_counter(&mut self) -> u16 {
        self.ticks_per_step
    }
    fn report_irq(&mut self, irq_id: u8) {
        self.inner.report_irq(irq_id);
    }
    fn claim_irq(&mut self, irq_id: u8) -> bool {
        self.inner.claim_irq(irq_id)
    }
    fn any_irq_pending(&self) -> bool {
        self.inner.any_irq_pending()
    }
    fn enable(&mut self, peripherals: Peripherals) {
        self.inner.enable(peripherals);
    }
    fn disable(&mut self, peripherals: Peripherals) {
        self.inner.disable(peripherals);
    }
    fn enabled_peripherals(&self) -> Peripherals {
        self.inner.enabled_peripherals()
    }
    fn sleep(&mut self, mode: SleepMode) {
        self.inner.sleep(mode);
    }
    fn kick_watchdog(&mut self) {
        self.inner.kick_watchdog();
    }
    fn mask_interrupts_save(&mut self) -> bool {
        self.inner.mask_interrupts_save()
    }
    fn mask_interrupts_restore(&mut self, was_enabled: bool) {
        self.inner.mask_interrupts_restore(was_enabled);
    }
}

fn boot_one_tick_kernel(ticks_per_step: u16) -> Kernel {
    Kernel::boot(Box::new(OneTickPort::new(ticks_per_step)), BoardConfig::defaults())
}

// ---------------------------------------------------------------------
// Scenario: delay/wake timing
// ---------------------------------------------------------------------

struct CountingBody {
    remaining_delays: u8,
    runs: Arc<AtomicU32>,
}

impl TaskBody for CountingBody {
    fn resume(&mut self, _cx: &mut Cx<'_>) -> Step {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.remaining_delays == 0 {
            return Step::Done;
        }
        self.remaining_delays -= 1;
        Step::Suspend(Suspend::DelayMs(10))
    }
}

#[test]
fn delay_wakes_after_the_requested_ticks_elapse() {
    let mut kernel = boot_one_tick_kernel(1);
    let runs = Arc::new(AtomicU32::new(0));
    let ticks_for_10ms = kernel.config.ms_to_ticks(10).max(1);

    let id = kernel
        .setup(
            Box::new(CountingBody {
                remaining_delays: 1,
                runs: runs.clone(),
            }),
            None,
        )
        .unwrap();
    kernel.start(id);

    kernel.step(); // idle runs first pass, then `id` runs and delays
    kernel.step();
    assert_eq!(runs.load(Ordering::SeqCst), 1, "task ran exactly once before sleeping");

    for _ in 0..ticks_for_10ms {
        kernel.step();
    }
    // give the now-ready task a scheduler pass to actually execute
    kernel.step();
    kernel.step();
    assert_eq!(runs.load(Ordering::SeqCst), 2, "task resumed once its delay elapsed");
}

// ---------------------------------------------------------------------
// Scenario: semaphore FIFO wakeup order
// ---------------------------------------------------------------------

struct WaitOnceBody {
    sem: SemId,
    order: Arc<spin::Mutex<alloc::vec::Vec<u32>>>,
    done: bool,
}

impl TaskBody for WaitOnceBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if self.done {
            return Step::Done;
        }
        if cx.sem_try_wait(self.sem) {
            self.order.lock().push(cx.current().0);
            self.done = true;
            Step::Done
        } else {
            Step::Suspend(Suspend::WaitSem(self.sem))
        }
    }
}

#[test]
fn semaphore_wakes_pending_waiters_in_fifo_order() {
    let mut kernel = boot_one_tick_kernel(0);
    let sem = kernel.sem_init(1, 0).unwrap();
    let order = Arc::new(spin::Mutex::new(alloc::vec::Vec::new()));

    let mut ids = alloc::vec::Vec::new();
    for _ in 0..3 {
        let id = kernel
            .setup(
                Box::new(WaitOnceBody {
                    sem,
                    order: order.clone(),
                    done: false,
                }),
                None,
            )
            .unwrap();
        kernel.start(id);
        ids.push(id);
    }

    // Run enough passes that all three tasks have attempted the
    // semaphore and queued up behind it (plus the idle task).
    for _ in 0..8 {
        kernel.step();
    }
    assert!(order.lock().is_empty(), "nothing signalled yet");

    for _ in 0..3 {
        kernel.sem_signal(sem).unwrap();
        for _ in 0..4 {
            kernel.step();
        }
    }

    let woke: alloc::vec::Vec<u32> = ids.iter().map(|t| t.0).collect();
    assert_eq!(*order.lock(), woke, "waiters woke in the order they queued");
}

// ---------------------------------------------------------------------
// Scenario: mutex ownership transfer, including transfer-on-erase
// ---------------------------------------------------------------------

struct LockOnceBody {
    mutex: MutexId,
    unlock: bool,
    done: bool,
}

impl TaskBody for LockOnceBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if self.done {
            return Step::Done;
        }
        if cx.mutex_try_lock(self.mutex) {
            if self.unlock {
                cx.mutex_unlock(self.mutex).unwrap();
            }
            self.done = true;
            Step::Done
        } else {
            Step::Suspend(Suspend::WaitMutex(self.mutex))
        }
    }
}

#[test]
fn mutex_ownership_transfers_to_the_next_waiter_on_unlock() {
    let mut kernel = boot_one_tick_kernel(0);
    let mutex = kernel.mutex_init().unwrap();

    let holder = kernel
        .setup(
            Box::new(LockOnceBody {
                mutex,
                unlock: false,
                done: false,
            }),
            None,
        )
        .unwrap();
    kernel.start(holder);
    for _ in 0..4 {
        kernel.step();
    }
    assert_eq!(kernel.mutex_owner(mutex), Some(holder));

    let waiter = kernel
        .setup(
            Box::new(LockOnceBody {
                mutex,
                unlock: false,
                done: false,
            }),
            None,
        )
        .unwrap();
    kernel.start(waiter);
    for _ in 0..4 {
        kernel.step();
    }
    assert_eq!(kernel.mutex_owner(mutex), Some(holder), "waiter is still queued");

    // Deleting the holder must release the mutex to the waiter.
    kernel.delete(holder);
    for _ in 0..4 {
        kernel.step();
    }
    assert_eq!(
        kernel.mutex_owner(mutex),
        Some(waiter),
        "erase unlocks every mutex the erased task held"
    );
}

// ---------------------------------------------------------------------
// Scenario: blocking allocation wakes on the next free
// ---------------------------------------------------------------------

struct MallocBody {
    bytes: u16,
    got: Arc<AtomicU32>,
    done: bool,
}

impl TaskBody for MallocBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if self.done {
            return Step::Done;
        }
        match cx.malloc_try(self.bytes) {
            Some(ptr) => {
                self.got.store(ptr + 1, Ordering::SeqCst);
                self.done = true;
                Step::Done
            }
            None => Step::Suspend(Suspend::Malloc(self.bytes)),
        }
    }
}

#[test]
fn blocking_allocation_wakes_once_a_block_is_freed() {
    let mut kernel = boot_one_tick_kernel(0);
    let config = kernel.config.clone();
    let total_blocks = config.heap_block_count as usize;
    let block_size = config.heap_block_size;

    // Exhaust the heap.
    let mut held = alloc::vec::Vec::new();
    for _ in 0..total_blocks {
        held.push(kernel.malloc_try(block_size).unwrap());
    }
    assert_eq!(kernel.heap_free_block_count(), 0);

    let got = Arc::new(AtomicU32::new(0));
    let waiter = kernel
        .setup(
            Box::new(MallocBody {
                bytes: block_size,
                got: got.clone(),
                done: false,
            }),
            None,
        )
        .unwrap();
    kernel.start(waiter);
    for _ in 0..4 {
        kernel.step();
    }
    assert_eq!(got.load(Ordering::SeqCst), 0, "heap is still full");

    let freed_ptr = held.pop().unwrap();
    kernel.free(freed_ptr);
    for _ in 0..4 {
        kernel.step();
    }
    assert!(got.load(Ordering::SeqCst) > 0, "waiter woke once a block was freed");
}

// ---------------------------------------------------------------------
// Boundary: malloc(0) and malloc(too-large) both fail without side effects
// ---------------------------------------------------------------------

#[test]
fn malloc_zero_bytes_always_fails_without_touching_the_heap() {
    let mut kernel = boot_test_kernel();
    let free_before = kernel.heap_free_block_count();

    assert!(kernel.malloc_try(0).is_none());
    assert_eq!(kernel.heap_free_block_count(), free_before, "a zero-byte request marks nothing allocated");
}

#[test]
fn malloc_larger_than_the_whole_arena_always_fails() {
    let mut kernel = boot_test_kernel();
    let config = kernel.config.clone();
    let too_large = config.heap_capacity_bytes() as u32 + config.heap_block_size as u32;
    let free_before = kernel.heap_free_block_count();

    assert!(kernel.malloc_try(too_large.min(u16::MAX as u32) as u16).is_none());
    assert_eq!(
        kernel.heap_free_block_count(),
        free_before,
        "a request that can never fit leaves every block untouched"
    );
}

// ---------------------------------------------------------------------
// Scenario: blocking allocation, partial satisfaction across two frees
// ---------------------------------------------------------------------

struct MallocTwoBody {
    bytes: u16,
    got: Arc<AtomicU32>,
    done: bool,
}

impl TaskBody for MallocTwoBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if self.done {
            return Step::Done;
        }
        match cx.malloc_try(self.bytes) {
            Some(ptr) => {
                self.got.store(ptr + 1, Ordering::SeqCst);
                self.done = true;
                Step::Done
            }
            None => Step::Suspend(Suspend::Malloc(self.bytes)),
        }
    }
}

#[test]
fn blocking_allocation_stays_blocked_until_enough_adjacent_blocks_are_free() {
    let mut kernel = boot_one_tick_kernel(0);
    let config = kernel.config.clone();
    let total_blocks = config.heap_block_count as usize;
    let block_size = config.heap_block_size;
    let two_blocks_bytes = block_size + 1; // needs exactly 2 adjacent blocks

    // Exhaust the heap one block at a time, in order, so the last two
    // allocations are known to be adjacent.
    let mut held = alloc::vec::Vec::new();
    for _ in 0..total_blocks {
        held.push(kernel.malloc_try(block_size).unwrap());
    }
    assert_eq!(kernel.heap_free_block_count(), 0);

    let got = Arc::new(AtomicU32::new(0));
    let waiter = kernel
        .setup(
            Box::new(MallocTwoBody {
                bytes: two_blocks_bytes,
                got: got.clone(),
                done: false,
            }),
            None,
        )
        .unwrap();
    kernel.start(waiter);
    for _ in 0..4 {
        kernel.step();
    }
    assert_eq!(got.load(Ordering::SeqCst), 0, "heap is still full");

    // Free exactly one block: the waiter needs two, so it must stay blocked.
    let last = held.pop().unwrap();
    kernel.free(last);
    for _ in 0..4 {
        kernel.step();
    }
    assert_eq!(got.load(Ordering::SeqCst), 0, "one free block cannot satisfy a two-block request");

    // Free the block adjacent to it: now there is a run of two, and
    // the waiter wakes with that now-adjacent pair.
    let second_to_last = held.pop().unwrap();
    kernel.free(second_to_last);
    for _ in 0..4 {
        kernel.step();
    }
    assert!(
        got.load(Ordering::SeqCst) > 0,
        "waiter woke once the freed blocks formed an adjacent pair"
    );
}

// ---------------------------------------------------------------------
// Boundary: arming past MAX_ARM_MS clamps to the 31-bit tick ceiling
// ---------------------------------------------------------------------

#[test]
fn arming_beyond_the_31_bit_ceiling_clamps_instead_of_overflowing() {
    use crate::timer::MAX_TICKS;

    let mut kernel = boot_test_kernel();
    let id = kernel
        .timer_start(Notify::None, u32::MAX, None)
        .expect("timer arena has room");
    assert_eq!(
        kernel.timer_remaining(id),
        MAX_TICKS,
        "a duration past the 31-bit ceiling stores the maximum tick count, not a wrapped value"
    );
}

// ---------------------------------------------------------------------
// Scenario: join wakes the parent when the child exits
// ---------------------------------------------------------------------

struct ChildBody {
    delays: u8,
}

impl TaskBody for ChildBody {
    fn resume(&mut self, _cx: &mut Cx<'_>) -> Step {
        if self.delays == 0 {
            return Step::Done;
        }
        self.delays -= 1;
        Step::Suspend(Suspend::DelayMs(1))
    }
}

struct ParentBody {
    child: TaskId,
    attached: bool,
    joined: Arc<AtomicU32>,
}

impl TaskBody for ParentBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if !self.attached {
            self.attached = true;
            cx.try_attach_join(self.child);
            return Step::Suspend(Suspend::Join(self.child));
        }
        self.joined.store(1, Ordering::SeqCst);
        Step::Done
    }
}

#[test]
fn parent_wakes_from_join_when_child_exits() {
    let mut kernel = boot_one_tick_kernel(1);
    let child = kernel.setup(Box::new(ChildBody { delays: 1 }), None).unwrap();
    let joined = Arc::new(AtomicU32::new(0));
    let parent = kernel
        .setup(
            Box::new(ParentBody {
                child,
                attached: false,
                joined: joined.clone(),
            }),
            None,
        )
        .unwrap();

    kernel.start(child);
    kernel.start(parent);

    for _ in 0..20 {
        kernel.step();
        if joined.load(Ordering::SeqCst) == 1 {
            break;
        }
    }
    assert_eq!(joined.load(Ordering::SeqCst), 1, "parent observed the child's exit");
}

// ---------------------------------------------------------------------
// Scenario: software timer fires and re-arms for the next period
// ---------------------------------------------------------------------

struct PeriodicBody {
    period_ms: u32,
    fires: Arc<AtomicU32>,
    armed: bool,
}

impl TaskBody for PeriodicBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if !self.armed {
            self.armed = true;
            cx.timer_start(Notify::Task(cx.current()), self.period_ms, true);
            return Step::Suspend(Suspend::SleepForever);
        }
        self.fires.fetch_add(1, Ordering::SeqCst);
        cx.timer_start(Notify::Task(cx.current()), self.period_ms, true);
        Step::Suspend(Suspend::SleepForever)
    }
}

#[test]
fn periodic_timer_wakes_its_owner_every_period() {
    let mut kernel = boot_one_tick_kernel(1);
    let ticks_per_period = kernel.config.ms_to_ticks(5).max(1);
    let fires = Arc::new(AtomicU32::new(0));
    let id = kernel
        .setup(
            Box::new(PeriodicBody {
                period_ms: 5,
                fires: fires.clone(),
                armed: false,
            }),
            None,
        )
        .unwrap();
    kernel.start(id);

    for _ in 0..(ticks_per_period * 3 + 10) {
        kernel.step();
    }
    assert!(fires.load(Ordering::SeqCst) >= 2, "timer re-armed itself at least twice");
}

// ---------------------------------------------------------------------
// Scenario: wait_signal composes delay + masked sample, not a new state
// ---------------------------------------------------------------------

struct WaitSignalBody {
    flag: &'static AtomicU8,
    mask: u8,
    period_ms: u32,
    seen: Arc<AtomicU32>,
}

impl TaskBody for WaitSignalBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if cx.sample_signal(self.flag, self.mask) {
            self.seen.store(1, Ordering::SeqCst);
            return Step::Done;
        }
        if self.period_ms == 0 {
            Step::Suspend(Suspend::Yield)
        } else {
            Step::Suspend(Suspend::DelayMs(self.period_ms))
        }
    }
}

static SIGNAL_FLAG: AtomicU8 = AtomicU8::new(0);

#[test]
fn wait_signal_polls_without_a_dedicated_task_state() {
    let mut kernel = boot_one_tick_kernel(1);
    let seen = Arc::new(AtomicU32::new(0));
    let id = kernel
        .setup(
            Box::new(WaitSignalBody {
                flag: &SIGNAL_FLAG,
                mask: 0b1,
                period_ms: 2,
                seen: seen.clone(),
            }),
            None,
        )
        .unwrap();
    kernel.start(id);

    for _ in 0..5 {
        kernel.step();
    }
    assert_eq!(seen.load(Ordering::SeqCst), 0, "signal not yet set");

    SIGNAL_FLAG.store(0b1, Ordering::Release);
    let ticks_for_period = kernel.config.ms_to_ticks(2).max(1);
    for _ in 0..(ticks_for_period + 4) {
        kernel.step();
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1, "poll observed the signal after the next period");
}

// ---------------------------------------------------------------------
// Scenario: an action's notify_all wakes every waiter, in FIFO order
// ---------------------------------------------------------------------

struct WaitActionBody {
    action: crate::action::ActionId,
    order: Arc<spin::Mutex<alloc::vec::Vec<u32>>>,
    done: bool,
}

impl TaskBody for WaitActionBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        if self.done {
            return Step::Done;
        }
        if cx.sem_try_wait(self.action.0) {
            self.order.lock().push(cx.current().0);
            self.done = true;
            Step::Done
        } else {
            Step::Suspend(Suspend::WaitSem(self.action.0))
        }
    }
}

#[test]
fn action_notify_all_wakes_every_waiter_in_enqueue_order() {
    let mut kernel = boot_one_tick_kernel(0);
    let action = kernel.action_init().unwrap();
    let order = Arc::new(spin::Mutex::new(alloc::vec::Vec::new()));

    let mut ids = alloc::vec::Vec::new();
    for _ in 0..3 {
        let id = kernel
            .setup(
                Box::new(WaitActionBody {
                    action,
                    order: order.clone(),
                    done: false,
                }),
                None,
            )
            .unwrap();
        kernel.start(id);
        ids.push(id);
    }

    // Let all three queue up behind the action before it fires.
    for _ in 0..8 {
        kernel.step();
    }
    assert!(order.lock().is_empty(), "nothing broadcast yet");

    kernel.action_notify_all(action);
    for _ in 0..8 {
        kernel.step();
    }

    let woke: alloc::vec::Vec<u32> = ids.iter().map(|t| t.0).collect();
    assert_eq!(*order.lock(), woke, "every waiter woke, in the order it queued");
}

// ---------------------------------------------------------------------
// Boundary: a corrupted stack sentinel is a fatal, halting error
// ---------------------------------------------------------------------

#[test]
#[should_panic(expected = "fatal kernel error")]
fn corrupted_stack_sentinel_is_fatal() {
    let mut kernel = boot_test_kernel();
    kernel.corrupt_stack_for_test(StackEnd::Down);
    kernel.step();
}

// ---------------------------------------------------------------------
// Invariant: the runnable ring stays a valid doubly linked cycle
// ---------------------------------------------------------------------

#[test]
fn runnable_ring_links_are_always_mutually_consistent() {
    let mut kernel = boot_test_kernel();
    let a = kernel.setup(Box::new(ChildBody { delays: 0 }), None).unwrap();
    let b = kernel.setup(Box::new(ChildBody { delays: 0 }), None).unwrap();
    kernel.start(a);
    kernel.start(b);

    // Both tasks finish almost immediately (`Step::Done`), at which
    // point only the idle task remains; a singleton ring must still
    // point to itself in both directions.
    for _ in 0..6 {
        kernel.step();
    }
    assert_eq!(kernel.current(), kernel.idle_task_id());
}
