//! The kernel: task arena, semaphore/mutex arena, timer list, heap, the
//! runnable ring, and the scheduler loop that ties them together.
//!
//! There is deliberately one module boundary for all of this mutable
//! state (per the Design Notes: "keep them behind a single module
//! boundary"), reached only through [`Kernel`] and the [`Cx`] handle
//! task bodies are given while running.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::action::ActionId;
use crate::config::{BoardConfig, IndexPool};
use crate::error::{self, ErrorSign, KernelError};
use crate::heap::{Heap, HeapPtr};
use crate::port::{Port, SleepMode};
use crate::sema::{Kind, MutexId, SemId, SemaphoreRecord};
use crate::task::{Destructor, Step, Suspend, TaskBody, TaskId, TaskRecord, TaskState, WaitCtx};
use crate::timer::{clamp_ticks, Notify, TimerId, TimerRecord, MAX_ARM_MS};

/// Which end of the simulated shared stack failed its sentinel check.
#[derive(Debug, Clone, Copy)]
pub enum StackEnd {
    Up,
    Down,
}

const SENTINEL: u8 = 0xA5;

pub struct Kernel {
    port: Box<dyn Port>,
    pub(crate) config: BoardConfig,

    tasks: Vec<Option<TaskRecord>>,
    task_pool: IndexPool,

    sems: Vec<Option<SemaphoreRecord>>,
    sem_pool: IndexPool,

    timers: Vec<Option<TimerRecord>>,
    timer_pool: IndexPool,

    heap: Heap,
    heap_wait_sem: SemId,
    /// Set when the last `malloc_try` failed to satisfy a well-formed
    /// request; cleared (and reported as a clearance) on the next
    /// `free` that leaves the heap non-empty.
    heap_exhausted: bool,

    /// Pointer into the circular runnable ring; the task it names is
    /// the one that is `Running` (or about to be).
    current: Option<TaskId>,

    sleeping: Vec<TaskId>,
    irq_waiting: Vec<TaskId>,

    idle_task: TaskId,

    /// Simulated shared stack, used only so the sentinel invariant in
    /// distilled spec §8 is actually exercisable from tests.
    stack: Vec<u8>,
}

struct IdleBody;
impl TaskBody for IdleBody {
    fn resume(&mut self, cx: &mut Cx<'_>) -> Step {
        cx.run_idle_policy();
        Step::Suspend(Suspend::Yield)
    }
}

impl Kernel {
    /// Boot sequence: tick source → heap → task lists → idle task.
    /// Application initialisation, watchdog and interrupt enablement
    /// are the integrating firmware's job, not this library's.
    pub fn boot(port: Box<dyn Port>, config: BoardConfig) -> Self {
        let sem_pool = IndexPool::new(config.max_semaphores + 1); // +1 for the heap's own gate
        let heap_wait_sem = SemId(0);
        let mut sems: Vec<Option<SemaphoreRecord>> = Vec::new();
        sems.push(Some(SemaphoreRecord::counting(1, 0)));

        let heap = Heap::new(config.heap_block_count, config.heap_block_size, heap_wait_sem);

        let mut stack = vec![0u8; config.shared_stack_size.max(4) as usize];
        let n = stack.len();
        stack[0] = SENTINEL;
        stack[1] = SENTINEL;
        stack[n - 2] = SENTINEL;
        stack[n - 1] = SENTINEL;

        let mut kernel = Self {
            port,
            config,
            tasks: Vec::new(),
            task_pool: IndexPool::new(0), // replaced below
            sems,
            sem_pool,
            timers: Vec::new(),
            timer_pool: IndexPool::new(0),
            heap,
            heap_wait_sem,
            heap_exhausted: false,
            current: None,
            sleeping: Vec::new(),
            irq_waiting: Vec::new(),
            idle_task: TaskId(0),
            stack,
        };
        kernel.task_pool = IndexPool::new(kernel.config.max_tasks);
        kernel.timer_pool = IndexPool::new(kernel.config.max_timers);

        let idle_id = kernel.setup(Box::new(IdleBody), None).expect("idle task");
        kernel.idle_task = idle_id;
        kernel.start(idle_id);

        log::debug!("kernel booted: idle task {idle_id:?}, tick {}Hz", kernel.config.tick_frequency_hz);
        kernel
    }

    // ---------------------------------------------------------------
    // Arena plumbing
    // ---------------------------------------------------------------

    fn task(&self, id: TaskId) -> &TaskRecord {
        self.tasks[id.0 as usize].as_ref().expect("dead task handle")
    }

    fn task_mut(&mut self, id: TaskId) -> &mut TaskRecord {
        self.tasks[id.0 as usize].as_mut().expect("dead task handle")
    }

    fn sem(&self, id: SemId) -> &SemaphoreRecord {
        self.sems[id.0 as usize].as_ref().expect("dead semaphore handle")
    }

    fn sem_mut(&mut self, id: SemId) -> &mut SemaphoreRecord {
        self.sems[id.0 as usize].as_mut().expect("dead semaphore handle")
    }

    // ---------------------------------------------------------------
    // Task lifecycle (distilled spec §4.1, §4.8)
    // ---------------------------------------------------------------

    pub fn setup(&mut self, body: Box<dyn TaskBody>, destructor: Option<Destructor>) -> Option<TaskId> {
        let idx = match self.task_pool.alloc() {
            Some(idx) => idx,
            None => {
                error::report(ErrorSign::Onset, KernelError::CapacityExhausted, 0);
                return None;
            }
        };
        let id = TaskId(idx);
        let record = TaskRecord::new(id, body, destructor);
        if idx as usize == self.tasks.len() {
            self.tasks.push(Some(record));
        } else {
            self.tasks[idx as usize] = Some(record);
        }
        log::debug!("task {id:?} created");
        Some(id)
    }

    pub fn start(&mut self, id: TaskId) {
        let state = self.task(id).state;
        if matches!(
            state,
            TaskState::Stopped | TaskState::SleepInfinite | TaskState::SleepTimed
        ) {
            if state == TaskState::SleepTimed {
                self.sleeping.retain(|&t| t != id);
            }
            self.ring_insert(id);
        }
    }

    /// `stop` keeps the record around (`erase(permanent=false)`).
    pub fn stop(&mut self, id: TaskId) {
        self.erase(id, false);
    }

    /// `delete` releases the record (`erase(permanent=true)`).
    pub fn delete(&mut self, id: TaskId) {
        self.erase(id, true);
    }

    fn erase(&mut self, id: TaskId, permanent: bool) {
        log::debug!("task {id:?} erased (permanent={permanent})");

        // Wake a joining parent before unlinking anything.
        if let Some(parent) = self.task(id).parent {
            if self.task(parent).child != Some(id) {
                error::report(ErrorSign::Onset, KernelError::ParentChildInconsistency, parent.0);
            }
            self.task_mut(parent).child = None;
            if self.task(parent).state == TaskState::Join {
                self.wake_task(parent);
            }
        }

        // Recursively erase the (at most one) child this task was
        // itself joined to.
        if let Some(child) = self.task(id).child {
            self.erase(child, permanent);
        }
        self.task_mut(id).parent = None;
        self.task_mut(id).child = None;

        // Detach from whatever scheduling set this task currently sits in.
        match self.task(id).state {
            TaskState::Ready | TaskState::Running => self.ring_remove(id),
            TaskState::SleepTimed => self.sleeping.retain(|&t| t != id),
            TaskState::WaitIrq => self.irq_waiting.retain(|&t| t != id),
            TaskState::WaitSem => {
                if let WaitCtx::PendingSem(sem) = self.task(id).wait {
                    self.sem_mut(sem).pending.retain(|&t| t != id);
                } else if let WaitCtx::PendingMutex(mtx) = self.task(id).wait {
                    self.sem_mut(SemId(mtx.0)).pending.retain(|&t| t != id);
                }
            }
            TaskState::Join | TaskState::Stopped | TaskState::SleepInfinite => {}
        }

        // Unlock every mutex this task still owns.
        let owned_mutexes = core::mem::take(&mut self.task_mut(id).owned_mutexes);
        for mtx in owned_mutexes {
            self.mutex_unlock_internal(mtx, id);
        }

        // Stop every timer this task owns.
        let owned_timers = core::mem::take(&mut self.task_mut(id).owned_timers);
        for t in owned_timers {
            self.timer_stop(t, false);
        }

        if let Some(mut d) = self.task_mut(id).destructor.take() {
            d(id);
            self.task_mut(id).destructor = Some(d);
        }

        let rec = self.task_mut(id);
        rec.state = TaskState::Stopped;
        rec.wait = WaitCtx::None;

        if permanent {
            self.tasks[id.0 as usize] = None;
            if self.task_pool.free(id.0) {
                error::report(ErrorSign::Clearance, KernelError::CapacityExhausted, id.0);
            }
        }
    }

    pub fn current(&self) -> TaskId {
        self.current.expect("scheduler not running")
    }

    /// The permanent idle task created at [`Kernel::boot`].
    pub fn idle_task_id(&self) -> TaskId {
        self.idle_task
    }

    // ---------------------------------------------------------------
    // Runnable ring (circular doubly linked list, arena indices)
    // ---------------------------------------------------------------

    fn ring_insert(&mut self, id: TaskId) {
        match self.current {
            None => {
                self.task_mut(id).ring_prev = Some(id);
                self.task_mut(id).ring_next = Some(id);
                self.current = Some(id);
            }
            Some(cur) => {
                let tail = self.task(cur).ring_prev.unwrap();
                self.task_mut(tail).ring_next = Some(id);
                self.task_mut(id).ring_prev = Some(tail);
                self.task_mut(id).ring_next = Some(cur);
                self.task_mut(cur).ring_prev = Some(id);
            }
        }
        self.task_mut(id).state = TaskState::Ready;
    }

    fn ring_remove(&mut self, id: TaskId) {
        let prev = self.task(id).ring_prev;
        let next = self.task(id).ring_next;
        if prev == Some(id) {
            // singleton ring
            self.current = None;
        } else {
            if let Some(p) = prev {
                self.task_mut(p).ring_next = next;
            }
            if let Some(n) = next {
                self.task_mut(n).ring_prev = prev;
            }
            if self.current == Some(id) {
                self.current = next;
            }
        }
        let rec = self.task_mut(id);
        rec.ring_prev = None;
        rec.ring_next = None;
    }

    fn ring_len(&self) -> usize {
        let Some(start) = self.current else { return 0 };
        let mut count = 1;
        let mut node = self.task(start).ring_next.unwrap();
        while node != start {
            count += 1;
            node = self.task(node).ring_next.unwrap();
        }
        count
    }

    /// Wake `id`, detaching it from whatever aux list its current
    /// state implies and re-joining the runnable ring as `Ready`.
    fn wake_task(&mut self, id: TaskId) {
        log::trace!("task {id:?} woken from {:?}", self.task(id).state);
        match self.task(id).state {
            TaskState::SleepTimed => self.sleeping.retain(|&t| t != id),
            TaskState::WaitIrq => self.irq_waiting.retain(|&t| t != id),
            _ => {}
        }
        self.task_mut(id).wait = WaitCtx::None;
        self.ring_insert(id);
    }

    // ---------------------------------------------------------------
    // Scheduler loop (distilled spec §4.5)
    // ---------------------------------------------------------------

    /// Run exactly one scheduler iteration, in the seven steps of
    /// distilled spec §4.5.
    pub fn step(&mut self) {
        log::trace!("scheduler pass: current={:?} ring_len={}", self.current, self.ring_len());
        let prev_current = self.current;

        // 1. Call the current task at its resume point.
        if let Some(id) = self.current {
            self.task_mut(id).state = TaskState::Running;
            let mut body = core::mem::replace(
                &mut self.task_mut(id).body,
                Box::new(NullBody) as Box<dyn TaskBody>,
            );
            let outcome = {
                let mut cx = Cx { kernel: self, current: id };
                body.resume(&mut cx)
            };
            // Put the (possibly-advanced) body back unless the task
            // was permanently deleted out from under us.
            if let Some(rec) = self.tasks[id.0 as usize].as_mut() {
                rec.body = body;
            }
            self.dispatch(id, outcome);

            // 6 (partial). If the task is still where it was (the
            // `Yield` case), explicitly rotate to the next task.
            if self.current == Some(id) {
                self.current = self.task(id).ring_next;
            }
        }
        let _ = prev_current;

        // 2. Validate the simulated shared-stack sentinels.
        self.check_stack_sentinels();

        // 3. Read-and-clear elapsed ticks.
        let elapsed = self.port.get_monotonic_tick_counter();
        if elapsed > 0 {
            // 4. Decrement every armed timer and every sleeping task.
            self.refresh_timers(elapsed as u32);
            self.refresh_sleepers(elapsed as u32);
        }

        // 5. Wake any irq-waiting task whose irq has been reported.
        self.refresh_irq_waiters();

        // 7. Kick the watchdog.
        self.port.kick_watchdog();
    }

    fn dispatch(&mut self, id: TaskId, outcome: Step) {
        log::trace!("task {id:?} dispatch: {outcome:?}");
        match outcome {
            Step::Done => self.stop(id),
            Step::Suspend(Suspend::Yield) => {
                // stays Ready in the ring; nothing to do here.
            }
            Step::Suspend(Suspend::DelayMs(ms)) => {
                let ticks = self.config.ms_to_ticks(ms).max(1);
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::SleepTimed;
                self.task_mut(id).wait = WaitCtx::TimedTicks(ticks);
                self.sleeping.push(id);
            }
            Step::Suspend(Suspend::SleepForever) => {
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::SleepInfinite;
            }
            Step::Suspend(Suspend::WaitSem(sem)) => {
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::WaitSem;
                self.task_mut(id).wait = WaitCtx::PendingSem(sem);
                self.sem_mut(sem).pending.push_back(id);
            }
            Step::Suspend(Suspend::WaitMutex(mtx)) => {
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::WaitSem;
                self.task_mut(id).wait = WaitCtx::PendingMutex(mtx);
                self.sem_mut(SemId(mtx.0)).pending.push_back(id);
            }
            Step::Suspend(Suspend::WaitIrq(irq)) => {
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::WaitIrq;
                self.task_mut(id).wait = WaitCtx::Irq(irq);
                self.irq_waiting.push(id);
            }
            Step::Suspend(Suspend::Join(_child)) => {
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::Join;
            }
            Step::Suspend(Suspend::Malloc(_bytes)) => {
                self.ring_remove(id);
                self.task_mut(id).state = TaskState::WaitSem;
                self.task_mut(id).wait = WaitCtx::PendingSem(self.heap_wait_sem);
                self.sem_mut(self.heap_wait_sem).pending.push_back(id);
            }
        }
    }

    fn refresh_sleepers(&mut self, elapsed: u32) {
        let sleepers = self.sleeping.clone();
        for id in sleepers {
            if let WaitCtx::TimedTicks(remaining) = self.task(id).wait {
                let new_remaining = remaining.saturating_sub(elapsed);
                if new_remaining == 0 {
                    self.wake_task(id);
                } else {
                    self.task_mut(id).wait = WaitCtx::TimedTicks(new_remaining);
                }
            }
        }
    }

    fn refresh_irq_waiters(&mut self) {
        let waiters = self.irq_waiting.clone();
        for id in waiters {
            if let WaitCtx::Irq(irq) = self.task(id).wait {
                if self.port.claim_irq(irq) {
                    self.wake_task(id);
                }
            }
        }
    }

    fn check_stack_sentinels(&mut self) {
        let n = self.stack.len();
        let up_ok = self.stack[0] == SENTINEL && self.stack[1] == SENTINEL;
        let down_ok = self.stack[n - 2] == SENTINEL && self.stack[n - 1] == SENTINEL;
        if !up_ok {
            error::report(ErrorSign::Onset, KernelError::StackOverflowUp, 0);
        } else if !down_ok {
            error::report(ErrorSign::Onset, KernelError::StackOverflowDown, 0);
        }
    }

    /// Deliberately corrupt a stack sentinel, for exercising the
    /// overflow-detection path from tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn corrupt_stack_for_test(&mut self, end: StackEnd) {
        match end {
            StackEnd::Up => self.stack[0] = 0,
            StackEnd::Down => {
                let n = self.stack.len();
                self.stack[n - 1] = 0;
            }
        }
    }

    // ---------------------------------------------------------------
    // Idle task / sleep mode selection (distilled spec §6, §4.5)
    // ---------------------------------------------------------------

    fn choose_sleep_mode(&self) -> SleepMode {
        let peripherals_on = !self.port.enabled_peripherals().is_empty();
        let runnable_beyond_idle = self.ring_len() > 1;
        let irq_pending = self.port.any_irq_pending();

        if irq_pending {
            SleepMode::Run
        } else if runnable_beyond_idle {
            SleepMode::Run
        } else if peripherals_on {
            SleepMode::Idle
        } else {
            SleepMode::Deep
        }
    }

    // ---------------------------------------------------------------
    // Semaphores (distilled spec §4.3)
    // ---------------------------------------------------------------

    pub fn sem_init(&mut self, max: u32, init: u32) -> Option<SemId> {
        let idx = match self.sem_pool.alloc() {
            Some(idx) => idx,
            None => {
                error::report(ErrorSign::Onset, KernelError::CapacityExhausted, 0);
                return None;
            }
        };
        let id = SemId(idx);
        let rec = SemaphoreRecord::counting(max, init);
        self.place_sem(idx, rec);
        log::debug!("semaphore {id:?} created (max={max}, init={init})");
        Some(id)
    }

    fn place_sem(&mut self, idx: u32, rec: SemaphoreRecord) {
        if idx as usize == self.sems.len() {
            self.sems.push(Some(rec));
        } else {
            self.sems[idx as usize] = Some(rec);
        }
    }

    pub fn sem_try_wait(&mut self, id: SemId) -> bool {
        self.sem_mut(id).try_wait()
    }

    pub fn sem_signal(&mut self, id: SemId) -> Result<(), KernelError> {
        let over_release = self.sem(id).signal_is_over_release();
        if over_release {
            error::report(ErrorSign::Onset, KernelError::SemaphoreOverRelease, id.0);
            return Err(KernelError::SemaphoreOverRelease);
        }
        if let Kind::Counting { count, max } = &mut self.sem_mut(id).kind {
            *count = (*count + 1).min(*max);
        }
        if let Some(waiter) = self.sem_mut(id).pending.pop_front() {
            self.wake_task(waiter);
        }
        Ok(())
    }

    pub fn sem_count(&self, id: SemId) -> u32 {
        match self.sem(id).kind {
            Kind::Counting { count, .. } => count,
            Kind::Mutex { .. } => 0,
        }
    }

    // ---------------------------------------------------------------
    // Mutexes (distilled spec §4.3)
    // ---------------------------------------------------------------

    pub fn mutex_init(&mut self) -> Option<MutexId> {
        let idx = match self.sem_pool.alloc() {
            Some(idx) => idx,
            None => {
                error::report(ErrorSign::Onset, KernelError::CapacityExhausted, 0);
                return None;
            }
        };
        self.place_sem(idx, SemaphoreRecord::mutex());
        log::debug!("mutex {:?} created", MutexId(idx));
        Some(MutexId(idx))
    }

    pub fn mutex_try_lock(&mut self, id: MutexId, locker: TaskId) -> bool {
        let sem = SemId(id.0);
        let owned = matches!(self.sem(sem).kind, Kind::Mutex { owner: Some(_) });
        if owned {
            return false;
        }
        if let Kind::Mutex { owner } = &mut self.sem_mut(sem).kind {
            *owner = Some(locker);
        }
        self.task_mut(locker).owned_mutexes.push(id);
        true
    }

    pub fn mutex_unlock(&mut self, id: MutexId, task: TaskId) -> Result<(), KernelError> {
        let sem = SemId(id.0);
        let owner = match self.sem(sem).kind {
            Kind::Mutex { owner } => owner,
            Kind::Counting { .. } => None,
        };
        if owner != Some(task) {
            error::report(ErrorSign::Onset, KernelError::MutexOwnershipViolation, task.0);
            return Err(KernelError::MutexOwnershipViolation);
        }
        self.mutex_unlock_internal(id, task);
        Ok(())
    }

    fn mutex_unlock_internal(&mut self, id: MutexId, owner: TaskId) {
        let sem = SemId(id.0);
        self.task_mut(owner).owned_mutexes.retain(|&m| m != id);
        if let Some(next) = self.sem_mut(sem).pending.pop_front() {
            if let Kind::Mutex { owner } = &mut self.sem_mut(sem).kind {
                *owner = Some(next);
            }
            self.task_mut(next).owned_mutexes.push(id);
            self.wake_task(next);
        } else if let Kind::Mutex { owner } = &mut self.sem_mut(sem).kind {
            *owner = None;
        }
    }

    pub fn mutex_owner(&self, id: MutexId) -> Option<TaskId> {
        match self.sem(SemId(id.0)).kind {
            Kind::Mutex { owner } => owner,
            Kind::Counting { .. } => None,
        }
    }

    // ---------------------------------------------------------------
    // Actions (distilled spec §4.6)
    // ---------------------------------------------------------------

    pub fn action_init(&mut self) -> Option<ActionId> {
        // No more tasks can simultaneously wait on an action than exist
        // in the task arena, so that bound is a safe, always-sufficient
        // `max_count` for the broadcast to never be capacity-limited.
        self.sem_init(self.config.max_tasks as u32, 0).map(ActionId)
    }

    pub fn action_notify_all(&mut self, id: ActionId) {
        while !self.sem(id.0).pending.is_empty() {
            let _ = self.sem_signal(id.0);
        }
    }

    // ---------------------------------------------------------------
    // Timers (distilled spec §4.4)
    // ---------------------------------------------------------------

    pub fn timer_start(&mut self, notify: Notify, ms: u32, owner: Option<TaskId>) -> Option<TimerId> {
        let idx = match self.timer_pool.alloc() {
            Some(idx) => idx,
            None => {
                error::report(ErrorSign::Onset, KernelError::CapacityExhausted, 0);
                return None;
            }
        };
        let id = TimerId(idx);
        let clamped_ms = ms.min(MAX_ARM_MS);
        let ticks = clamp_ticks(self.config.ms_to_ticks(clamped_ms) as u64).max(1);
        let mut rec = TimerRecord::new(id);
        rec.remaining = ticks;
        rec.notify = notify;
        rec.owner = owner;
        if idx as usize == self.timers.len() {
            self.timers.push(Some(rec));
        } else {
            self.timers[idx as usize] = Some(rec);
        }
        if let Some(owner) = owner {
            self.task_mut(owner).owned_timers.push(id);
        }
        log::debug!("timer {id:?} armed for {ticks} ticks (owner={owner:?})");
        Some(id)
    }

    pub fn timer_stop(&mut self, id: TimerId, notify: bool) {
        let Some(slot) = self.timers.get(id.0 as usize) else { return };
        if slot.is_none() {
            return;
        }
        if notify {
            self.fire_timer(id);
        }
        if let Some(rec) = self.timers[id.0 as usize].take() {
            if let Some(owner) = rec.owner {
                if let Some(task) = self.tasks[owner.0 as usize].as_mut() {
                    task.owned_timers.retain(|&t| t != id);
                }
            }
        }
        log::trace!("timer {id:?} stopped");
        if self.timer_pool.free(id.0) {
            error::report(ErrorSign::Clearance, KernelError::CapacityExhausted, id.0);
        }
    }

    pub fn timer_remaining(&self, id: TimerId) -> u32 {
        self.timers[id.0 as usize]
            .as_ref()
            .map(|t| t.remaining)
            .unwrap_or(0)
    }

    fn refresh_timers(&mut self, elapsed: u32) {
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter_map(|t| t.as_ref().map(|t| t.id))
            .collect();
        for id in ids {
            let was_armed = self.timers[id.0 as usize]
                .as_ref()
                .map(|t| t.is_armed())
                .unwrap_or(false);
            if !was_armed {
                continue;
            }
            if let Some(rec) = self.timers[id.0 as usize].as_mut() {
                rec.tick(elapsed);
            }
            let now_armed = self.timers[id.0 as usize]
                .as_ref()
                .map(|t| t.is_armed())
                .unwrap_or(false);
            if was_armed && !now_armed {
                self.fire_timer(id);
                let rearmed = self.timers[id.0 as usize]
                    .as_ref()
                    .map(|t| t.is_armed())
                    .unwrap_or(false);
                if !rearmed {
                    self.timer_stop(id, false);
                }
            }
        }
    }

    fn fire_timer(&mut self, id: TimerId) {
        let notify = match self.timers.get(id.0 as usize).and_then(|t| t.as_ref()) {
            Some(t) => t.notify,
            None => return,
        };
        log::debug!("timer {id:?} fired");
        match notify {
            Notify::None => {}
            Notify::Function(f) => f(),
            Notify::Task(task) => {
                if self.tasks.get(task.0 as usize).and_then(|t| t.as_ref()).is_some() {
                    let state = self.task(task).state;
                    if matches!(
                        state,
                        TaskState::Stopped | TaskState::SleepInfinite | TaskState::SleepTimed
                    ) {
                        self.wake_task(task);
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Heap (distilled spec §4.2)
    // ---------------------------------------------------------------

    pub fn malloc_try(&mut self, bytes: u16) -> Option<HeapPtr> {
        match self.heap.malloc(bytes) {
            Some(ptr) => Some(ptr),
            None => {
                // A request that was never satisfiable (0 bytes, or
                // larger than the whole arena) is a caller error, not
                // the kernel running out of memory; only the latter is
                // worth reporting through the error hook.
                let well_formed = bytes != 0 && self.config.blocks_for(bytes) <= self.heap.block_count();
                if well_formed {
                    self.heap_exhausted = true;
                    error::report(ErrorSign::Onset, KernelError::DynamicMemoryExhaustion, bytes as u32);
                }
                None
            }
        }
    }

    pub fn free(&mut self, ptr: HeapPtr) {
        let freed = self.heap.free(ptr);
        if freed > 0 && self.heap_exhausted && self.heap.free_block_count() > 0 {
            self.heap_exhausted = false;
            error::report(ErrorSign::Clearance, KernelError::DynamicMemoryExhaustion, 0);
        }
        for _ in 0..freed {
            let _ = self.sem_signal(self.heap_wait_sem);
        }
    }

    pub fn heap_payload(&mut self, ptr: HeapPtr, bytes: u16) -> &mut [u8] {
        self.heap.payload(ptr, bytes)
    }

    pub fn heap_free_block_count(&self) -> usize {
        self.heap.free_block_count()
    }

    /// Whether `ptr` looks like a currently-live allocation handle.
    pub fn heap_owns(&self, ptr: HeapPtr) -> bool {
        self.heap.owns(ptr)
    }
}

/// Placeholder body swapped in only for the instant a real body is
/// moved out during `resume`; it is never actually invoked.
struct NullBody;
impl TaskBody for NullBody {
    fn resume(&mut self, _cx: &mut Cx<'_>) -> Step {
        Step::Done
    }
}

/// The handle a task body is given while it runs: every non-blocking
/// try-operation and every "act on another task" operation the public
/// API surface allows.
pub struct Cx<'a> {
    kernel: &'a mut Kernel,
    current: TaskId,
}

impl<'a> Cx<'a> {
    pub fn current(&self) -> TaskId {
        self.current
    }

    pub fn setup(&mut self, body: Box<dyn TaskBody>, destructor: Option<Destructor>) -> Option<TaskId> {
        self.kernel.setup(body, destructor)
    }

    pub fn start(&mut self, task: TaskId) {
        self.kernel.start(task);
    }

    pub fn stop(&mut self, task: Option<TaskId>) {
        self.kernel.stop(task.unwrap_or(self.current));
    }

    pub fn delete(&mut self, task: Option<TaskId>) {
        self.kernel.delete(task.unwrap_or(self.current));
    }

    pub fn sem_init(&mut self, max: u32, init: u32) -> Option<SemId> {
        self.kernel.sem_init(max, init)
    }

    pub fn sem_try_wait(&mut self, id: SemId) -> bool {
        self.kernel.sem_try_wait(id)
    }

    pub fn sem_signal(&mut self, id: SemId) -> Result<(), KernelError> {
        self.kernel.sem_signal(id)
    }

    pub fn mutex_init(&mut self) -> Option<MutexId> {
        self.kernel.mutex_init()
    }

    pub fn mutex_try_lock(&mut self, id: MutexId) -> bool {
        self.kernel.mutex_try_lock(id, self.current)
    }

    pub fn mutex_unlock(&mut self, id: MutexId) -> Result<(), KernelError> {
        self.kernel.mutex_unlock(id, self.current)
    }

    pub fn action_init(&mut self) -> Option<ActionId> {
        self.kernel.action_init()
    }

    pub fn action_notify_all(&mut self, id: ActionId) {
        self.kernel.action_notify_all(id);
    }

    pub fn timer_start(&mut self, notify: Notify, ms: u32, owned_by_current: bool) -> Option<TimerId> {
        let owner = owned_by_current.then_some(self.current);
        self.kernel.timer_start(notify, ms, owner)
    }

    pub fn timer_stop(&mut self, id: TimerId, notify: bool) {
        self.kernel.timer_stop(id, notify);
    }

    pub fn timer_remaining(&self, id: TimerId) -> u32 {
        self.kernel.timer_remaining(id)
    }

    /// Non-blocking allocation try; pair with
    /// `Step::Suspend(Suspend::Malloc(n))` to get the blocking variant
    /// distilled spec §4.2 describes.
    pub fn malloc_try(&mut self, bytes: u16) -> Option<HeapPtr> {
        self.kernel.malloc_try(bytes)
    }

    pub fn free(&mut self, ptr: HeapPtr) {
        self.kernel.free(ptr);
    }

    pub fn heap_payload(&mut self, ptr: HeapPtr, bytes: u16) -> &mut [u8] {
        self.kernel.heap_payload(ptr, bytes)
    }

    pub fn heap_owns(&self, ptr: HeapPtr) -> bool {
        self.kernel.heap_owns(ptr)
    }

    /// Try to claim a reported irq without suspending. Pair with
    /// `Step::Suspend(Suspend::WaitIrq(id))` for the blocking variant.
    pub fn irq_try_claim(&mut self, irq: u8) -> bool {
        self.kernel.port.claim_irq(irq)
    }

    pub fn report_irq(&mut self, irq: u8) {
        self.kernel.port.report_irq(irq);
    }

    /// Sample a polled condition under interrupts masked, per
    /// distilled spec §4.7. Pair the `false` result with
    /// `Step::Suspend(Suspend::DelayMs(period_ms))` (or
    /// `Suspend::Yield` when `period_ms == 0`) to implement
    /// `wait_signal`.
    pub fn sample_signal(&mut self, byte: &core::sync::atomic::AtomicU8, mask: u8) -> bool {
        let _masked = crate::critical::Masked::enter(&mut *self.kernel.port);
        (byte.load(core::sync::atomic::Ordering::Acquire) & mask) == mask
    }

    /// Attempt to attach `child` as the current task's joinee. On
    /// success, returns `true` and the current task should suspend
    /// with `Suspend::Join(child)`. On failure (child already has a
    /// different parent), returns `false`; per distilled spec §4.1.1
    /// the caller should either retry after `Suspend::DelayMs(1)`
    /// (`wait == true`) or simply continue (`wait == false`).
    pub fn try_attach_join(&mut self, child: TaskId) -> bool {
        if self.kernel.task(child).parent.is_some() && self.kernel.task(child).parent != Some(self.current) {
            return false;
        }
        self.kernel.task_mut(self.current).child = Some(child);
        self.kernel.task_mut(child).parent = Some(self.current);
        let child_state = self.kernel.task(child).state;
        if matches!(
            child_state,
            TaskState::Stopped | TaskState::SleepInfinite | TaskState::SleepTimed
        ) {
            self.kernel.wake_task(child);
        }
        true
    }

    /// `infinite_sleep(wake_parent)`: the body should return
    /// `Step::Suspend(Suspend::SleepForever)` right after calling this.
    pub fn maybe_wake_parent(&mut self, wake_parent: bool) {
        if !wake_parent {
            return;
        }
        if let Some(parent) = self.kernel.task(self.current).parent {
            if self.kernel.task(parent).state == TaskState::Join {
                self.kernel.wake_task(parent);
            }
        }
    }

    fn run_idle_policy(&mut self) {
        let mode = self.kernel.choose_sleep_mode();
        self.kernel.port.sleep(mode);
    }
}
