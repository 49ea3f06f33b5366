//! Fixed-block heap.
//!
//! An arena of `B` blocks of `S` bytes, plus a `B`-entry marker array:
//! `0` means free, any other value is a tag shared by every block in
//! one contiguous allocated run. `malloc` scans left to right for a
//! run of zeros; `free` clears a run by following its tag until a
//! different value (or the arena edge) is hit. This is a direct port
//! of `__heap_malloc`/`heap_free` in `original_source/rtos/rtOS/src/heap.c`.

use alloc::vec;
use alloc::vec::Vec;

use crate::sema::SemId;

pub struct Heap {
    block_size: u16,
    arena: Vec<u8>,
    markers: Vec<u32>,
    /// The heap's own blocking-allocation gate: capacity-1 counting
    /// semaphore, signalled once per block freed.
    pub(crate) wait_sem: SemId,
}

/// Result of a non-blocking `malloc` attempt.
pub type HeapPtr = u32;

impl Heap {
    pub(crate) fn new(block_count: u16, block_size: u16, wait_sem: SemId) -> Self {
        Self {
            block_size,
            arena: vec![0u8; block_count as usize * block_size as usize],
            markers: vec![0u32; block_count as usize],
            wait_sem,
        }
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.markers.len()
    }

    pub fn free_block_count(&self) -> usize {
        self.markers.iter().filter(|&&m| m == 0).count()
    }

    fn blocks_needed(&self, bytes: u16) -> usize {
        if bytes == 0 {
            return 0;
        }
        let size = self.block_size.max(1) as usize;
        (bytes as usize + size - 1) / size
    }

    /// Non-blocking allocation. Returns the starting block index
    /// (usable as a stable handle for `free`) or `None` if no run of
    /// `k` free blocks exists. `malloc(0)` always returns `None`
    /// without touching any marker.
    pub fn malloc(&mut self, bytes: u16) -> Option<HeapPtr> {
        let k = self.blocks_needed(bytes);
        if k == 0 || k > self.markers.len() {
            return None;
        }

        let mut run_start = None;
        let mut run_len = 0usize;
        for (i, &m) in self.markers.iter().enumerate() {
            if m == 0 {
                if run_len == 0 {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == k {
                    break;
                }
            } else {
                run_len = 0;
                run_start = None;
            }
        }

        let start = match (run_start, run_len == k) {
            (Some(s), true) => s,
            _ => {
                log::warn!("heap: no contiguous run of {k} block(s) for a {bytes}-byte request");
                return None;
            }
        };

        let tag = (start as u32) + 1;
        for m in &mut self.markers[start..start + k] {
            *m = tag;
        }

        let byte_start = start * self.block_size as usize;
        for b in &mut self.arena[byte_start..byte_start + k * self.block_size as usize] {
            *b = 0;
        }

        log::trace!("heap: allocated blocks {start}..{} ({bytes} bytes)", start + k);
        Some(start as u32)
    }

    /// Borrow the bytes backing a previous `malloc` for `bytes` bytes.
    pub fn payload(&mut self, ptr: HeapPtr, bytes: u16) -> &mut [u8] {
        let start = ptr as usize * self.block_size as usize;
        &mut self.arena[start..start + bytes as usize]
    }

    /// Free a previous allocation, returning the number of blocks
    /// released (used by the kernel to signal the waiting semaphore
    /// once per freed block).
    pub fn free(&mut self, ptr: HeapPtr) -> usize {
        let idx = ptr as usize;
        if idx >= self.markers.len() {
            return 0;
        }
        let tag = self.markers[idx];
        if tag == 0 {
            return 0;
        }
        let mut freed = 0;
        for m in self.markers[idx..].iter_mut() {
            if *m != tag {
                break;
            }
            *m = 0;
            freed += 1;
        }
        log::trace!("heap: freed {freed} block(s) starting at {idx}");
        freed
    }

    /// Whether `ptr` looks like a valid, currently-allocated handle
    /// into this heap (distilled spec's `heap_check_if_dynamic_mem`).
    pub fn owns(&self, ptr: HeapPtr) -> bool {
        (ptr as usize) < self.markers.len() && self.markers[ptr as usize] != 0
    }
}
