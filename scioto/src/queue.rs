// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-rank split work queues.
//!
//! Both algorithms share the same ring geometry.  Three monotonically
//! advancing cursors (modulo capacity) partition a fixed array of slots:
//!
//! ```text
//!   free .. vtail .. (reserved) .. tail .. (shared) .. split .. (local) .. head .. free
//! ```
//!
//! * `head`  -- one past the newest local element; owner pushes and pops.
//! * `split` -- boundary between the local and shared halves.
//! * `tail`  -- next stealable element; thieves pop here.
//! * `vtail` -- oldest slot not yet reclaimed (covers in-flight steals).
//!
//! The owner touches its local half without synchronization; thieves only
//! ever operate on `[tail, split)` through the per-algorithm protocol.

pub(crate) mod saws;
pub(crate) mod sdc;

use crate::config::StealMethod;
use crate::error::TryStealError;
use crate::stats::RingStats;
use self::saws::SawsRing;
use self::sdc::SdcRing;

/// Number of elements in `[tail, split)` of a ring of `capacity` slots.
pub(crate) fn shared_span(tail: usize, split: usize, capacity: usize) -> usize {
    if tail == split {
        0
    } else if tail < split {
        split - tail
    } else {
        split + capacity - tail
    }
}

/// Index of the newest local element.
pub(crate) fn ring_head(split: usize, nlocal: usize, capacity: usize) -> usize {
    (split + nlocal + capacity - 1) % capacity
}

/// The queue algorithm behind a task collection, dispatched as a closed
/// sum: the discriminant is fixed at collection creation.
pub(crate) enum SharedQueue {
    Sdc(SdcRing),
    Saws(SawsRing),
}

// === impl SharedQueue ===

impl SharedQueue {
    pub(crate) fn queue_name(&self) -> &'static str {
        match self {
            SharedQueue::Sdc(_) => "Split Deferred-Copy",
            SharedQueue::Saws(_) => "Shmem Atomic Work Stealing",
        }
    }

    /// Collective: reset the ring to empty.
    pub(crate) fn reset(&mut self) {
        match self {
            SharedQueue::Sdc(rb) => rb.reset(),
            SharedQueue::Saws(rb) => rb.reset(),
        }
    }

    /// Owner: push one encoded task slot at the head.
    pub(crate) fn push_head(&mut self, slot: &[u64]) {
        match self {
            SharedQueue::Sdc(rb) => rb.push_head(slot),
            SharedQueue::Saws(rb) => rb.push_head(slot),
        }
    }

    /// Owner: push `n` contiguous slots (a landed steal) at the head.
    pub(crate) fn push_n_head(&mut self, buf: &[u64], n: usize) {
        match self {
            SharedQueue::Sdc(rb) => rb.push_n_head(buf, n),
            SharedQueue::Saws(rb) => rb.push_n_head(buf, n),
        }
    }

    /// Owner: pop the newest local slot into `out`; reacquires from the
    /// shared half when the local half is dry.
    pub(crate) fn pop_head(&mut self, out: &mut [u64]) -> bool {
        match self {
            SharedQueue::Sdc(rb) => rb.pop_head(out),
            SharedQueue::Saws(rb) => rb.pop_head(out),
        }
    }

    /// Thief: steal up to `n` tasks from `proc`'s tail, blocking on the
    /// victim's lock where the algorithm has one.
    pub(crate) fn pop_n_tail(
        &mut self,
        proc: usize,
        n: usize,
        buf: &mut [u64],
        method: StealMethod,
    ) -> Result<usize, TryStealError> {
        match self {
            SharedQueue::Sdc(rb) => rb.pop_n_tail(proc, n, buf, method, false),
            SharedQueue::Saws(rb) => rb.pop_n_tail(proc, n, buf, method),
        }
    }

    /// Thief: abortable variant; returns [`TryStealError::Busy`] instead
    /// of waiting for a contended victim.
    pub(crate) fn try_pop_n_tail(
        &mut self,
        proc: usize,
        n: usize,
        buf: &mut [u64],
        method: StealMethod,
    ) -> Result<usize, TryStealError> {
        match self {
            SharedQueue::Sdc(rb) => rb.pop_n_tail(proc, n, buf, method, true),
            SharedQueue::Saws(rb) => rb.pop_n_tail(proc, n, buf, method),
        }
    }

    /// Cheap remote probe of `proc`'s queue: an estimate of how much work
    /// a steal could find there.
    pub(crate) fn poll_victim(&mut self, proc: usize) -> usize {
        match self {
            SharedQueue::Sdc(rb) => rb.poll_victim(proc),
            SharedQueue::Saws(rb) => rb.poll_victim(proc),
        }
    }

    /// Owner-side maintenance: move local work to the shared half and
    /// reclaim completed steals.
    pub(crate) fn progress(&mut self) {
        match self {
            SharedQueue::Sdc(rb) => rb.progress(),
            SharedQueue::Saws(rb) => rb.progress(),
        }
    }

    /// Owner: publish the whole local half (used before a drain).
    pub(crate) fn release_all(&mut self) {
        match self {
            SharedQueue::Sdc(rb) => rb.release_all(),
            SharedQueue::Saws(rb) => rb.release_all(),
        }
    }

    /// Approximate number of tasks in this rank's queue.
    pub(crate) fn work_avail(&self) -> usize {
        match self {
            SharedQueue::Sdc(rb) => rb.size(),
            SharedQueue::Saws(rb) => rb.size(),
        }
    }

    pub(crate) fn stats(&self) -> &RingStats {
        match self {
            SharedQueue::Sdc(rb) => &rb.stats,
            SharedQueue::Saws(rb) => &rb.stats,
        }
    }
}

impl core::fmt::Debug for SharedQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.queue_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_span_handles_wrap() {
        assert_eq!(shared_span(0, 0, 8), 0);
        assert_eq!(shared_span(2, 5, 8), 3);
        assert_eq!(shared_span(6, 2, 8), 4);
        // full lap is indistinguishable from empty by design; callers
        // track sizes, not just cursors
        assert_eq!(shared_span(3, 3, 8), 0);
    }

    #[test]
    fn ring_head_is_one_before_the_free_region() {
        assert_eq!(ring_head(0, 1, 8), 0);
        assert_eq!(ring_head(0, 8, 8), 7);
        assert_eq!(ring_head(5, 4, 8), 0);
        // empty local region parks head just behind split
        assert_eq!(ring_head(0, 0, 8), 7);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // the two arcs of the ring are complementary
            #[test]
            fn spans_partition_the_ring(cap in 1usize..4096, a in 0usize..4096, b in 0usize..4096) {
                let a = a % cap;
                let b = b % cap;
                if a == b {
                    prop_assert_eq!(shared_span(a, b, cap), 0);
                } else {
                    prop_assert_eq!(shared_span(a, b, cap) + shared_span(b, a, cap), cap);
                }
            }

            // pushing one element advances head to exactly split + nlocal
            #[test]
            fn head_tracks_the_local_region(cap in 1usize..4096, split in 0usize..4096, n in 0usize..4096) {
                let split = split % cap;
                let n = n % cap;
                let head = ring_head(split, n, cap);
                prop_assert!(head < cap);
                prop_assert_eq!((head + 1) % cap, (split + n) % cap);
            }
        }
    }
}
