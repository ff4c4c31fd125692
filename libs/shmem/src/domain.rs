// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::barrier::Barrier;
use crate::collect::{self, ReduceOp, Reducible};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

/// Number of words at the top of every heap reserved for collectives.
pub(crate) const SCRATCH_WORDS: usize = 4096;

/// A word offset into every rank's symmetric heap.
///
/// Produced only by collective allocation, so the same `SymAddr` denotes
/// the same logical object on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymAddr(pub(crate) usize);

impl SymAddr {
    /// The address `words` words past `self`.
    #[must_use]
    pub fn offset(self, words: usize) -> SymAddr {
        SymAddr(self.0 + words)
    }
}

struct Heap {
    words: Box<[AtomicU64]>,
}

impl Heap {
    fn new(words: usize) -> Self {
        let mut v = Vec::with_capacity(words);
        v.resize_with(words, || AtomicU64::new(0));
        Self {
            words: v.into_boxed_slice(),
        }
    }
}

/// A shared symmetric-memory domain: one heap per rank plus the collective
/// machinery (barrier, allocation cursors, reduction scratch).
pub struct Domain {
    num_ranks: usize,
    heap_words: usize,
    heaps: Box<[Heap]>,
    /// Per-rank bump cursors.  Allocation is collective, so the cursors
    /// advance in lock-step; they are per-rank only so that no allocation
    /// ever synchronizes with another rank's.
    cursors: Box<[AtomicUsize]>,
    barrier: Barrier,
}

// === impl Domain ===

impl Domain {
    /// Create a domain of `num_ranks` ranks with `heap_words` words of
    /// symmetric heap each (plus the reserved collective scratch).
    ///
    /// # Panics
    ///
    /// Panics if `num_ranks` is zero.
    #[must_use]
    pub fn new(num_ranks: usize, heap_words: usize) -> Arc<Domain> {
        assert!(num_ranks > 0, "domain needs at least one rank");

        let total = heap_words + SCRATCH_WORDS;
        let heaps = (0..num_ranks).map(|_| Heap::new(total)).collect();
        let cursors = (0..num_ranks).map(|_| AtomicUsize::new(0)).collect();

        tracing::debug!(num_ranks, heap_words, "symmetric domain created");

        Arc::new(Domain {
            num_ranks,
            heap_words,
            heaps,
            cursors,
            barrier: Barrier::new(num_ranks),
        })
    }

    #[must_use]
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Attach the calling worker to `rank`, yielding its process context.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is out of range.
    #[must_use]
    pub fn attach(self: &Arc<Self>, rank: usize) -> Ctx {
        assert!(rank < self.num_ranks, "rank {rank} out of range");
        Ctx {
            domain: self.clone(),
            rank,
        }
    }

    fn word(&self, rank: usize, addr: SymAddr) -> &AtomicU64 {
        &self.heaps[rank].words[addr.0]
    }

    /// Break every rank out of barrier waits; used when a rank dies.
    pub fn poison(&self) {
        self.barrier.poison();
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("num_ranks", &self.num_ranks)
            .field("heap_words", &self.heap_words)
            .finish_non_exhaustive()
    }
}

/// A per-rank handle onto a [`Domain`].  Cheap to clone; all clones share
/// the rank's allocation cursor.
#[derive(Clone)]
pub struct Ctx {
    domain: Arc<Domain>,
    rank: usize,
}

// === impl Ctx ===

impl Ctx {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn num_ranks(&self) -> usize {
        self.domain.num_ranks
    }

    /// Collectively allocate `nwords` words of symmetric heap.
    ///
    /// Every rank must call this with the same argument in the same order;
    /// there is no free.  The returned address is identical on all ranks.
    ///
    /// # Panics
    ///
    /// Panics when the symmetric heap is exhausted.
    pub fn alloc(&self, nwords: usize) -> SymAddr {
        let base = self.domain.cursors[self.rank].fetch_add(nwords, Ordering::Relaxed);
        assert!(
            base + nwords <= self.domain.heap_words,
            "symmetric heap exhausted: {} + {nwords} > {}",
            base,
            self.domain.heap_words
        );
        tracing::trace!(rank = self.rank, base, nwords, "symmetric alloc");
        SymAddr(base)
    }

    /// Block until every rank in the domain has entered the barrier.
    pub fn barrier(&self) {
        self.domain.barrier.wait();
    }

    // --- one-sided word atomics (control traffic, SeqCst) ---

    #[must_use]
    pub fn atomic_fetch(&self, rank: usize, addr: SymAddr) -> u64 {
        self.domain.word(rank, addr).load(Ordering::SeqCst)
    }

    pub fn atomic_set(&self, rank: usize, addr: SymAddr, val: u64) {
        self.domain.word(rank, addr).store(val, Ordering::SeqCst);
    }

    pub fn atomic_swap(&self, rank: usize, addr: SymAddr, val: u64) -> u64 {
        self.domain.word(rank, addr).swap(val, Ordering::SeqCst)
    }

    /// Wrapping fetch-add; signed deltas are passed in two's complement.
    pub fn atomic_fetch_add(&self, rank: usize, addr: SymAddr, val: u64) -> u64 {
        self.domain.word(rank, addr).fetch_add(val, Ordering::SeqCst)
    }

    pub fn atomic_fetch_or(&self, rank: usize, addr: SymAddr, val: u64) -> u64 {
        self.domain.word(rank, addr).fetch_or(val, Ordering::SeqCst)
    }

    pub fn atomic_fetch_and(&self, rank: usize, addr: SymAddr, val: u64) -> u64 {
        self.domain.word(rank, addr).fetch_and(val, Ordering::SeqCst)
    }

    // --- one-sided bulk transfers (payload traffic, relaxed) ---

    /// Non-blocking get: copy `dst.len()` words from `(rank, src)` into
    /// `dst`.  Completion is only guaranteed after [`Ctx::quiet`].
    pub fn get_nbi(&self, rank: usize, src: SymAddr, dst: &mut [u64]) {
        let heap = &self.domain.heaps[rank].words;
        for (i, out) in dst.iter_mut().enumerate() {
            *out = heap[src.0 + i].load(Ordering::Relaxed);
        }
    }

    /// Non-blocking put: copy `src` into `(rank, dst)`.  Completion is
    /// only guaranteed after [`Ctx::quiet`].
    pub fn put_nbi(&self, rank: usize, dst: SymAddr, src: &[u64]) {
        let heap = &self.domain.heaps[rank].words;
        for (i, val) in src.iter().enumerate() {
            heap[dst.0 + i].store(*val, Ordering::Relaxed);
        }
    }

    /// Blocking get (`get_nbi` + `quiet`).
    pub fn get(&self, rank: usize, src: SymAddr, dst: &mut [u64]) {
        self.get_nbi(rank, src, dst);
        self.quiet();
    }

    /// Blocking put (`put_nbi` + `quiet`).
    pub fn put(&self, rank: usize, dst: SymAddr, src: &[u64]) {
        self.put_nbi(rank, dst, src);
        self.quiet();
    }

    /// Fence: order all outstanding non-blocking transfers before any
    /// subsequent operation.
    pub fn quiet(&self) {
        fence(Ordering::SeqCst);
    }

    // --- collectives ---

    /// Collective allreduce over `input`; the combined result is returned
    /// on every rank.
    ///
    /// # Panics
    ///
    /// Panics if `input` does not fit in the reduction scratch region, or
    /// if ranks disagree on `input.len()`.
    pub fn reduce<T: Reducible>(&self, input: &[T], op: ReduceOp) -> Vec<T> {
        collect::reduce(self, input, op)
    }

    pub(crate) fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub(crate) fn scratch_addr(&self) -> SymAddr {
        SymAddr(self.domain.heap_words)
    }

    pub(crate) fn scratch_words(&self) -> usize {
        SCRATCH_WORDS
    }
}

impl core::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ctx")
            .field("rank", &self.rank)
            .field("num_ranks", &self.domain.num_ranks)
            .finish()
    }
}
