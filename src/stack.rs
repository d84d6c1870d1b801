//! Stack Slot Allocator.
//!
//! Tasks on one OS thread share that thread's single native stack; a
//! suspended task's only private memory is a byte-exact heap copy of the
//! `[low, high)` range it was using when it last switched out. `low` is
//! wherever its stack pointer had reached; `high` is fixed the moment the
//! task is first activated, to the stack depth of whoever switched into
//! it — there is no separate stack region to pre-allocate, so activation
//! works by fabricating a `StackSlot` that *looks like* a task which just
//! suspended immediately after being entered, then letting it flow through
//! the same restore-and-switch path as any other resume.
//!
//! Correctness does not depend on tracking which suspended ranges overlap:
//! every switch-out unconditionally saves its own exact range and every
//! switch-in unconditionally restores its own exact range, so whichever
//! other suspended tasks' ranges happen to overlap are simply scribbled
//! over in real memory and read back correctly from their own untouched
//! heap copies later. The per-thread index below exists for introspection
//! (`captured_stack_bounds`) and to honor the tie-break rule for equal
//! ranges (creation sequence).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::context;
use crate::error::OperationError;

static SEQ: AtomicU64 = AtomicU64::new(0);

/// A fresh, strictly increasing creation sequence number, used to
/// tie-break stack slots with identical `[low, high)` bounds.
pub(crate) fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

/// A suspended task's captured native-stack bytes.
pub(crate) struct StackSlot {
    buffer: Vec<u8>,
    low: usize,
    high: usize,
    seq: u64,
}

impl StackSlot {
    /// Copy `[low, high)` of the real stack into a fresh heap buffer.
    /// Fails, without touching anything, if the allocation cannot be
    /// satisfied — the caller must abort the switch before transferring
    /// control.
    pub(crate) fn capture(low: usize, high: usize, seq: u64) -> Result<Self, OperationError> {
        debug_assert!(low <= high, "stack range must not be inverted");
        let len = high - low;
        log::trace!("corostack: capturing {len} stack bytes (seq {seq})");
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).map_err(|_| {
            log::debug!("corostack: failed to allocate {len}-byte stack segment");
            OperationError::Resource { size: len }
        })?;
        // Safety: `low..high` is the range the outgoing task itself was
        // just using as live stack memory; reading it here, before any
        // other code runs on this thread, is sound.
        unsafe {
            std::ptr::copy_nonoverlapping(low as *const u8, buffer.as_mut_ptr(), len);
            buffer.set_len(len);
        }
        Ok(StackSlot { buffer, low, high, seq })
    }

    /// Build a slot representing a task that has never run: `seed` is
    /// whatever bytes `context::prime` says must sit at the bottom of its
    /// range. Every supported ISA resumes via a saved `Context` field (`ip`/
    /// `lr`/`ra`) rather than a word read off the stack, so `seed` is always
    /// empty in practice; the parameter exists so a future ISA that does
    /// need stack-resident resume state isn't a `StackSlot` API change.
    pub(crate) fn seed(low: usize, high: usize, seq: u64, seed: Vec<u8>) -> Self {
        debug_assert_eq!(seed.len(), high.saturating_sub(low));
        StackSlot {
            buffer: seed,
            low,
            high,
            seq,
        }
    }

    /// Write the captured bytes back into the same `[low, high)` range of
    /// the real stack, just before switching execution there.
    ///
    /// # Safety
    /// The caller must not be currently executing on any part of
    /// `[low, high)`, i.e. this must run strictly before the context switch
    /// that will make this range live again.
    pub(crate) unsafe fn materialize(&self) {
        if self.buffer.is_empty() {
            return;
        }
        log::trace!(
            "corostack: materializing {} stack bytes at {:#x} (seq {})",
            self.buffer.len(),
            self.low,
            self.seq
        );
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer.as_ptr(), self.low as *mut u8, self.buffer.len());
        }
    }

    pub(crate) fn bounds(&self) -> (usize, usize) {
        (self.low, self.high)
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

/// Read the current native stack pointer, adjusted for whatever the
/// immediately-following call to `context::switch` will itself consume.
#[inline(always)]
pub(crate) fn current_low_bound() -> usize {
    context::current_sp() - context::CALL_RETADDR_BYTES
}

pub(crate) use context::STACK_ALIGNMENT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_and_materialize_round_trip() {
        let mut scratch = [0xAAu8; 64];
        let low = scratch.as_ptr() as usize;
        let high = low + scratch.len();
        let slot = StackSlot::capture(low, high, next_seq()).unwrap();
        assert_eq!(slot.bounds(), (low, high));

        for b in scratch.iter_mut() {
            *b = 0;
        }
        unsafe { slot.materialize() };
        assert!(scratch.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn seed_slot_carries_the_trampoline_seed() {
        let seed_bytes = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let high = 0x1000;
        let low = high - seed_bytes.len();
        let slot = StackSlot::seed(low, high, next_seq(), seed_bytes.clone());
        assert_eq!(slot.bounds(), (low, high));
    }
}
