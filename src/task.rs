//! Task records and the coroutine contract task bodies implement.
//!
//! A task is realized as an explicit resume-point state machine (see
//! the Design Notes in SPEC_FULL.md): [`TaskBody::resume`] is called
//! once per scheduler pass the task is selected, runs forward from
//! wherever it last left off, and returns a [`Step`] telling the
//! kernel whether it suspended (and on what) or ran to completion.
//! There is no raw "resume address" or shared machine stack to manage;
//! the body's own fields are its persistent local state, taking the
//! place of the source RTOS's per-task "dynamic variables buffer".

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::sema::{MutexId, SemId};
use crate::timer::TimerId;

/// Task identifier; an index into the kernel's task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

/// Task lifecycle state, exactly the state machine in distilled spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Ready,
    Running,
    SleepInfinite,
    SleepTimed,
    Join,
    WaitSem,
    WaitIrq,
}

/// What a task is blocked on, used only when `state` demands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCtx {
    None,
    /// Remaining ticks for a `SleepTimed` task.
    TimedTicks(u32),
    /// The semaphore a `WaitSem` task is enqueued on.
    PendingSem(SemId),
    /// The mutex a `WaitSem` task is enqueued on (mutex lock wait
    /// reuses the `WaitSem` state; distinguished here only so `erase`
    /// knows which pending queue to detach from).
    PendingMutex(MutexId),
    /// The irq id a `WaitIrq` task is waiting for.
    Irq(u8),
}

/// What a task body asked the kernel to suspend it for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// `delay(ms)` with `ms > 0`.
    DelayMs(u32),
    /// `delay(0)` / `infinite_sleep(false)`.
    SleepForever,
    /// Blocking wait on a counting semaphore.
    WaitSem(SemId),
    /// Blocking lock attempt on a mutex.
    WaitMutex(MutexId),
    /// Blocking wait for an irq to be reported.
    WaitIrq(u8),
    /// Attached to `child` as its parent; now waiting for it to exit
    /// or sleep with `wake_parent`.
    Join(TaskId),
    /// Blocking heap allocation request, `n` bytes.
    Malloc(u16),
    /// Cooperative yield: stay `Ready`, just let the round-robin pass.
    Yield,
}

/// What a task body returns from one call to [`TaskBody::resume`].
#[derive(Debug)]
pub enum Step {
    /// The body suspended itself; `self` stays alive, resumed later.
    Suspend(Suspend),
    /// The body ran to completion. The task becomes `Stopped`.
    Done,
}

/// The coroutine contract every task body implements.
///
/// `resume` is called with the kernel's [`crate::kernel::Cx`], which
/// exposes the non-blocking try-operations (`sem_try_wait`,
/// `mutex_try_lock`, `malloc_try`, ...) a body composes into the
/// suspend/retry pattern described in distilled spec §4.1.
pub trait TaskBody {
    fn resume(&mut self, cx: &mut crate::kernel::Cx<'_>) -> Step;
}

/// A destructor invoked when a task is permanently erased (`delete`).
pub type Destructor = Box<dyn FnMut(TaskId)>;

pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub wait: WaitCtx,
    pub body: Box<dyn TaskBody>,
    pub destructor: Option<Destructor>,

    pub parent: Option<TaskId>,
    pub child: Option<TaskId>,

    /// Runnable-ring links; `None` while not in the ring.
    pub ring_prev: Option<TaskId>,
    pub ring_next: Option<TaskId>,

    /// Mutexes currently owned by this task (the "owned-mutex list").
    pub owned_mutexes: Vec<MutexId>,

    /// Software timers whose notify-task target is this task, tracked
    /// here so `erase` can stop them all without scanning the global
    /// timer list from scratch each time.
    pub owned_timers: Vec<TimerId>,
}

impl TaskRecord {
    pub(crate) fn new(id: TaskId, body: Box<dyn TaskBody>, destructor: Option<Destructor>) -> Self {
        log::trace!("task {id:?} record allocated, destructor={}", destructor.is_some());
        Self {
            id,
            state: TaskState::Stopped,
            wait: WaitCtx::None,
            body,
            destructor,
            parent: None,
            child: None,
            ring_prev: None,
            ring_next: None,
            owned_mutexes: Vec::new(),
            owned_timers: Vec::new(),
        }
    }
}
