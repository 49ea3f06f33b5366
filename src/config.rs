//! Board configuration.
//!
//! The kernel itself is MCU-agnostic; everything board-specific that the
//! kernel needs to know about (tick frequency, how much memory it is
//! allowed to carve up, how big the shared stack is) is collected here
//! and handed to [`crate::Kernel::boot`] once, at startup.

use alloc::vec::Vec;

/// Board-specific constants the kernel needs at boot.
///
/// Mirrors the "board description" paragraph of the port contract:
/// tick frequency, heap block count and block size, shared stack size,
/// per-task local-frame reserve, startup delay, watchdog period, and the
/// presence of optional subsystems.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Tick source frequency in Hz. The source RTOS this kernel was
    /// modeled after ran at close to 1 kHz (0.9922 ms/tick); boards vary.
    pub tick_frequency_hz: u32,

    /// Number of fixed-size blocks in the heap arena.
    pub heap_block_count: u16,

    /// Size in bytes of each heap block.
    pub heap_block_size: u16,

    /// Size of the shared stack in bytes (informational on hosted
    /// targets; the port layer is the one that actually owns a stack).
    pub shared_stack_size: u16,

    /// Bytes reserved per task switch for the local call frame.
    pub local_frame_reserve: u16,

    /// Startup delay in milliseconds before the scheduler loop begins.
    pub startup_delay_ms: u16,

    /// Watchdog timeout in milliseconds.
    pub watchdog_period_ms: u16,

    /// Upper bound on concurrently live tasks.
    pub max_tasks: usize,

    /// Upper bound on concurrently live semaphores/mutexes/actions.
    pub max_semaphores: usize,

    /// Upper bound on concurrently armed software timers.
    pub max_timers: usize,

    /// Whether the software timer subsystem is compiled in at all.
    pub timers_enabled: bool,
}

impl BoardConfig {
    /// A reasonable default profile, loosely matching the AVR board this
    /// kernel's design was distilled from: ~1 kHz tick, small heap.
    pub fn defaults() -> Self {
        Self {
            tick_frequency_hz: 1008, // matches the source's 0.9922 ms tick
            heap_block_count: 32,
            heap_block_size: 16,
            shared_stack_size: 300,
            local_frame_reserve: 32,
            startup_delay_ms: 0,
            watchdog_period_ms: 2000,
            max_tasks: 16,
            max_semaphores: 16,
            max_timers: 8,
            timers_enabled: true,
        }
    }

    /// Milliseconds-to-ticks conversion table, one entry per bit of a
    /// full 32-bit millisecond value (bit 0 .. bit 31).
    ///
    /// Ported from `__timer_ms_to_ticks_32bits` in the original C RTOS:
    /// rather than multiplying or dividing (expensive on the target
    /// class), the original precomputes, for each power-of-two
    /// millisecond count, how many ticks that represents, and sums the
    /// entries whose bit is set in the requested duration. We compute
    /// the table once here instead of hand-naming 32 constants. All 32
    /// bits of the `u32` input are covered — a table truncated to 31
    /// entries would silently drop bit 31, under-counting every
    /// duration at or above 2^31 ms, `MAX_ARM_MS` among them.
    pub fn ms_bit_to_ticks_table(&self) -> [u32; 32] {
        let mut table = [0u32; 32];
        for (bit, slot) in table.iter_mut().enumerate() {
            let ms: u64 = 1u64 << bit;
            // round to nearest: ticks = floor(ms * f_tick / 1000 + 0.5)
            let scaled = ms * self.tick_frequency_hz as u64 * 2 + 1000;
            *slot = scaled.div_euclid(2000).min(u32::MAX as u64) as u32;
        }
        table
    }

    /// Convert a millisecond duration to ticks using the bit table above.
    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        let table = self.ms_bit_to_ticks_table();
        let mut ticks: u64 = 0;
        for (bit, entry) in table.iter().enumerate() {
            if ms & (1u32 << bit) != 0 {
                ticks += *entry as u64;
            }
        }
        ticks.min(u32::MAX as u64) as u32
    }

    /// Number of heap blocks needed to hold `bytes` bytes.
    pub fn blocks_for(&self, bytes: u16) -> usize {
        if bytes == 0 {
            return 0;
        }
        let size = self.heap_block_size.max(1);
        ((bytes as usize) + (size as usize) - 1) / (size as usize)
    }

    /// Total heap capacity in bytes.
    pub fn heap_capacity_bytes(&self) -> usize {
        self.heap_block_count as usize * self.heap_block_size as usize
    }
}

/// A reusable, bounded free-list used by several arenas (tasks,
/// semaphores, timers): indices are handed out monotonically and
/// recycled once freed, instead of ever shrinking the backing `Vec`.
#[derive(Debug, Default)]
pub(crate) struct IndexPool {
    free: Vec<u32>,
    high_water: u32,
    capacity: usize,
    /// Set when `alloc` last returned `None`; cleared (and reported
    /// back to the caller) the next time `free` hands a slot back.
    exhausted: bool,
}

impl IndexPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            high_water: 0,
            capacity,
            exhausted: false,
        }
    }

    /// Allocate a fresh index, or `None` if the pool is at capacity.
    pub fn alloc(&mut self) -> Option<u32> {
        if let Some(idx) = self.free.pop() {
            return Some(idx);
        }
        if (self.high_water as usize) < self.capacity {
            let idx = self.high_water;
            self.high_water += 1;
            Some(idx)
        } else {
            self.exhausted = true;
            None
        }
    }

    /// Return `idx` to the pool. Returns `true` if this is the first
    /// slot freed since the pool was last observed exhausted, so the
    /// caller can report a clearance alongside the earlier onset.
    pub fn free(&mut self, idx: u32) -> bool {
        self.free.push(idx);
        if self.exhausted {
            self.exhausted = false;
            true
        } else {
            false
        }
    }
}
