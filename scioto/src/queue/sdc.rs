// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Split deferred-copy shared ring buffer.
//!
//! A per-rank spinlock serializes all shared-side mutations.  A thief
//! reserves its block by advancing the victim's `tail` *under the lock*,
//! then drops the lock before copying payload (the deferred copy).  Once
//! the copy has quiesced it accumulates the block size onto the victim's
//! `itail`; the owner reclaims the reserved region whenever
//! `itail == tail`.

use crate::config::StealMethod;
use crate::error::TryStealError;
use crate::mutex::RemoteMutex;
use crate::queue::{ring_head, shared_span};
use crate::stats::RingStats;
use shmem::{Backoff, Ctx, SymAddr};

// symmetric metadata words, in ring order of the cursors they track
const META_TAIL: usize = 0;
const META_SPLIT: usize = 1;
const META_ITAIL: usize = 2;
const META_NLOCAL: usize = 3;
const META_WORDS: usize = 4;

pub(crate) struct SdcRing {
    ctx: Ctx,
    lock: RemoteMutex,
    base: SymAddr,
    capacity: usize,
    slot_words: usize,
    // owner-side cursor cache; split and nlocal are mirrored into the
    // symmetric metadata so thieves can size us up remotely
    nlocal: usize,
    split: usize,
    vtail: usize,
    waiting: bool,
    pub(crate) stats: RingStats,
}

// === impl SdcRing ===

impl SdcRing {
    /// Allocate and reset the ring.  Collective.
    pub(crate) fn create(ctx: Ctx, slot_words: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");

        let lock = RemoteMutex::new(&ctx);
        let base = ctx.alloc(META_WORDS + capacity * slot_words);
        let mut rb = Self {
            ctx,
            lock,
            base,
            capacity,
            slot_words,
            nlocal: 0,
            split: 0,
            vtail: 0,
            waiting: false,
            stats: RingStats::default(),
        };
        rb.reset();
        rb.ctx.barrier();
        tracing::debug!(rank = rb.ctx.rank(), capacity, slot_words, "sdc ring created");
        rb
    }

    pub(crate) fn reset(&mut self) {
        self.nlocal = 0;
        self.split = 0;
        self.vtail = 0;
        self.waiting = false;
        self.stats = RingStats::default();

        let me = self.ctx.rank();
        self.ctx.atomic_set(me, self.base.offset(META_TAIL), 0);
        self.ctx.atomic_set(me, self.base.offset(META_SPLIT), 0);
        self.ctx.atomic_set(me, self.base.offset(META_ITAIL), 0);
        self.ctx.atomic_set(me, self.base.offset(META_NLOCAL), 0);
    }

    fn slot_addr(&self, index: usize) -> SymAddr {
        debug_assert!(index < self.capacity);
        self.base.offset(META_WORDS + index * self.slot_words)
    }

    /// Current tail; thieves advance it under the lock, so the owner must
    /// reread it.
    fn tail(&self) -> usize {
        let raw = self.ctx.atomic_fetch(self.ctx.rank(), self.base.offset(META_TAIL));
        usize::try_from(raw).expect("tail in range")
    }

    fn itail(&self) -> i64 {
        self.ctx
            .atomic_fetch(self.ctx.rank(), self.base.offset(META_ITAIL))
            .cast_signed()
    }

    fn set_split(&mut self, split: usize) {
        self.split = split;
        let raw = u64::try_from(split).expect("split in range");
        self.ctx.atomic_set(self.ctx.rank(), self.base.offset(META_SPLIT), raw);
    }

    fn set_nlocal(&mut self, nlocal: usize) {
        self.nlocal = nlocal;
        let raw = u64::try_from(nlocal).expect("nlocal in range");
        self.ctx.atomic_set(self.ctx.rank(), self.base.offset(META_NLOCAL), raw);
    }

    // --- state queries ---

    pub(crate) fn local_size(&self) -> usize {
        self.nlocal
    }

    pub(crate) fn shared_size(&self) -> usize {
        shared_span(self.tail(), self.split, self.capacity)
    }

    /// Shared plus reserved (not yet reclaimed) elements.
    fn public_size(&self) -> usize {
        shared_span(self.vtail, self.split, self.capacity)
    }

    pub(crate) fn size(&self) -> usize {
        self.local_size() + self.shared_size()
    }

    fn head(&self) -> usize {
        ring_head(self.split, self.nlocal, self.capacity)
    }

    // --- split movement ---

    /// Reclaim the reserved region once every in-flight steal has posted
    /// its completion.  Returns the number of slots reclaimed.
    pub(crate) fn reclaim_space(&mut self) -> usize {
        let tail = self.tail();
        let itail = self.itail();
        let vtail = self.vtail;
        let mut reclaimed = 0;

        if vtail != tail && itail == i64::try_from(tail).expect("tail in range") {
            self.vtail = tail;
            reclaimed = if tail > vtail {
                tail - vtail
            } else {
                self.capacity - vtail + tail
            };
            self.stats.nreclaimed += 1;
        }

        self.stats.nreccalls += 1;
        reclaimed
    }

    /// Make room for `n` more elements, waiting on in-flight steals if
    /// necessary.
    ///
    /// # Panics
    ///
    /// Panics when the queue genuinely holds more than `capacity - n`
    /// live tasks; the ring cannot grow.
    fn ensure_space(&mut self, n: usize) {
        self.stats.nensure += 1;
        if self.capacity - (self.local_size() + self.public_size()) >= n {
            return;
        }

        self.lock.lock(&self.ctx, self.ctx.rank());
        if self.capacity - self.size() < n {
            tracing::error!(
                rank = self.ctx.rank(),
                capacity = self.capacity,
                local = self.local_size(),
                shared = self.shared_size(),
                "queue overflow: no room to push {n} elements"
            );
            panic!("sdc ring out of space for {n} elements");
        }
        self.waiting = true;
        let mut boff = Backoff::new();
        while self.reclaim_space() == 0 {
            boff.spin();
        }
        self.waiting = false;
        self.stats.nwaited += 1;
        self.lock.unlock(&self.ctx, self.ctx.rank());
    }

    /// Move half the local region into the shared one, but only when the
    /// shared side has run dry.
    pub(crate) fn release(&mut self) {
        if self.local_size() > 0 && self.shared_size() == 0 {
            let amount = self.nlocal.div_ceil(2);
            self.set_nlocal(self.nlocal - amount);
            self.set_split((self.split + amount) % self.capacity);
            self.stats.nrelease += 1;
            tracing::trace!(
                rank = self.ctx.rank(),
                amount,
                split = self.split,
                "sdc release"
            );
        }
    }

    /// Publish the entire local region.
    pub(crate) fn release_all(&mut self) {
        let amount = self.nlocal;
        if amount > 0 {
            self.set_nlocal(0);
            self.set_split((self.split + amount) % self.capacity);
            self.stats.nrelease += 1;
        }
    }

    /// Pull back half the surplus of the shared region.  Returns how many
    /// elements moved.
    pub(crate) fn reacquire(&mut self) -> usize {
        let mut amount = 0;

        self.lock.lock(&self.ctx, self.ctx.rank());
        let shared = self.shared_size();
        if shared > self.nlocal {
            let diff = shared - self.nlocal;
            amount = diff.div_ceil(2);
            self.set_nlocal(self.nlocal + amount);
            self.set_split((self.split + self.capacity - amount) % self.capacity);
            self.stats.nreacquire += 1;
            tracing::trace!(
                rank = self.ctx.rank(),
                amount,
                split = self.split,
                "sdc reacquire"
            );
        }
        // local empty here implies the whole queue is empty
        debug_assert!(self.nlocal > 0 || self.shared_size() == 0);
        self.lock.unlock(&self.ctx, self.ctx.rank());

        amount
    }

    /// Owner-side maintenance pass.
    pub(crate) fn progress(&mut self) {
        self.release();
        self.reclaim_space();
        self.stats.nprogress += 1;
    }

    // --- push operations ---

    pub(crate) fn push_head(&mut self, slot: &[u64]) {
        assert!(slot.len() <= self.slot_words, "element wider than a slot");
        self.ensure_space(1);

        let index = (self.head() + 1) % self.capacity;
        self.ctx.put_nbi(self.ctx.rank(), self.slot_addr(index), slot);
        self.set_nlocal(self.nlocal + 1);
    }

    pub(crate) fn push_n_head(&mut self, buf: &[u64], n: usize) {
        assert!(buf.len() >= n * self.slot_words, "push buffer too small");
        self.ensure_space(n);

        let me = self.ctx.rank();
        let first = (self.head() + 1) % self.capacity;

        if first + n <= self.capacity {
            self.ctx
                .put_nbi(me, self.slot_addr(first), &buf[..n * self.slot_words]);
        } else {
            // wraps: split the copy at the end of the ring
            let part = self.capacity - first;
            self.ctx
                .put_nbi(me, self.slot_addr(first), &buf[..part * self.slot_words]);
            self.ctx.put_nbi(
                me,
                self.slot_addr(0),
                &buf[part * self.slot_words..n * self.slot_words],
            );
        }
        self.set_nlocal(self.nlocal + n);
    }

    // --- pop operations ---

    pub(crate) fn pop_head(&mut self, out: &mut [u64]) -> bool {
        if self.nlocal == 0 {
            self.reacquire();
        }

        if self.nlocal > 0 {
            let index = self.head();
            self.ctx
                .get(self.ctx.rank(), self.slot_addr(index), &mut out[..self.slot_words]);
            self.set_nlocal(self.nlocal - 1);
            true
        } else {
            // a miss here means the whole queue is empty
            debug_assert_eq!(self.size(), 0);
            false
        }
    }

    /// Remote probe used by the search loop: the victim's total size.
    pub(crate) fn poll_victim(&mut self, proc: usize) -> usize {
        let mut meta = [0u64; META_WORDS];
        self.ctx.get(proc, self.base, &mut meta);
        let tail = usize::try_from(meta[META_TAIL]).expect("tail in range");
        let split = usize::try_from(meta[META_SPLIT]).expect("split in range");
        let nlocal = usize::try_from(meta[META_NLOCAL]).expect("nlocal in range");
        shared_span(tail, split, self.capacity) + nlocal
    }

    /// Steal up to `n` elements from `proc`'s tail into `buf`.
    ///
    /// With `trylock`, a contended victim aborts the attempt instead of
    /// blocking.
    pub(crate) fn pop_n_tail(
        &mut self,
        proc: usize,
        n: usize,
        buf: &mut [u64],
        method: StealMethod,
        trylock: bool,
    ) -> Result<usize, TryStealError> {
        if trylock {
            if !self.lock.trylock(&self.ctx, proc) {
                return Err(TryStealError::Busy);
            }
        } else {
            self.lock.lock(&self.ctx, proc);
        }

        // consistent snapshot of the victim's shared side
        let mut meta = [0u64; 2];
        self.ctx.get(proc, self.base, &mut meta);
        let tail = usize::try_from(meta[META_TAIL]).expect("tail in range");
        let split = usize::try_from(meta[META_SPLIT]).expect("split in range");
        let shared = shared_span(tail, split, self.capacity);

        let n = match method {
            StealMethod::Half => shared.div_ceil(2).min(n),
            StealMethod::All | StealMethod::Chunk => shared.min(n),
        };

        if n == 0 {
            self.lock.unlock(&self.ctx, proc);
            return Err(TryStealError::Empty);
        }

        // reserve the block by advancing the victim's tail, then drop the
        // lock before copying (deferred copy)
        let new_tail = (tail + n) % self.capacity;
        self.ctx.atomic_set(
            proc,
            self.base.offset(META_TAIL),
            u64::try_from(new_tail).expect("tail in range"),
        );
        self.lock.unlock(&self.ctx, proc);

        let words = n * self.slot_words;
        if tail + n <= self.capacity {
            self.ctx.get_nbi(proc, self.slot_addr(tail), &mut buf[..words]);
        } else {
            let part = self.capacity - tail;
            self.ctx
                .get_nbi(proc, self.slot_addr(tail), &mut buf[..part * self.slot_words]);
            self.ctx
                .get_nbi(proc, self.slot_addr(0), &mut buf[part * self.slot_words..words]);
        }
        self.ctx.quiet();

        // tell the owner the block may be reclaimed; a wrapping steal
        // wraps the intermediate tail with it
        let inc = if new_tail > tail {
            i64::try_from(n).expect("steal size fits")
        } else {
            i64::try_from(n).expect("steal size fits")
                - i64::try_from(self.capacity).expect("capacity fits")
        };
        self.ctx
            .atomic_fetch_add(proc, self.base.offset(META_ITAIL), inc.cast_unsigned());
        self.ctx.quiet();

        self.stats.ngets += 1;
        self.stats.nxfer += u64::try_from(words).expect("transfer size fits");
        tracing::trace!(rank = self.ctx.rank(), victim = proc, stolen = n, "sdc steal");
        Ok(n)
    }
}

impl core::fmt::Debug for SdcRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdcRing")
            .field("rank", &self.ctx.rank())
            .field("capacity", &self.capacity)
            .field("nlocal", &self.nlocal)
            .field("split", &self.split)
            .field("tail", &self.tail())
            .field("vtail", &self.vtail)
            .field("waiting", &self.waiting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(val: u64) -> [u64; 1] {
        [val]
    }

    #[test]
    fn push_pop_is_lifo() {
        shmem::run(1, 1 << 14, |ctx| {
            let mut rb = SdcRing::create(ctx, 1, 500);
            for rep in 0..100 {
                for v in 1..=203u64 {
                    rb.push_head(&slot(v));
                }
                let mut out = [0u64; 1];
                for v in (1..=203u64).rev() {
                    assert!(rb.pop_head(&mut out), "rep {rep}: queue dried early");
                    assert_eq!(out[0], v);
                }
                assert!(!rb.pop_head(&mut out));
            }
        });
    }

    #[test]
    fn release_moves_half_to_shared() {
        shmem::run(1, 1 << 12, |ctx| {
            let mut rb = SdcRing::create(ctx, 1, 64);
            for v in 0..9u64 {
                rb.push_head(&slot(v));
            }
            rb.release();
            assert_eq!(rb.shared_size(), 5);
            assert_eq!(rb.local_size(), 4);

            // shared still populated: release is a no-op
            rb.release();
            assert_eq!(rb.shared_size(), 5);
        });
    }

    #[test]
    fn reacquire_pulls_back_the_surplus() {
        shmem::run(1, 1 << 12, |ctx| {
            let mut rb = SdcRing::create(ctx, 1, 64);
            for v in 0..8u64 {
                rb.push_head(&slot(v));
            }
            rb.release_all();
            assert_eq!(rb.local_size(), 0);
            assert_eq!(rb.shared_size(), 8);

            assert_eq!(rb.reacquire(), 4);
            assert_eq!(rb.local_size(), 4);
            assert_eq!(rb.shared_size(), 4);
        });
    }

    #[test]
    fn steal_half_empties_a_victim() {
        shmem::run(2, 1 << 16, |ctx| {
            let rank = ctx.rank();
            let mut rb = SdcRing::create(ctx.clone(), 1, 500);

            if rank == 0 {
                for v in 1..=203u64 {
                    rb.push_head(&slot(v));
                }
                rb.release_all();
            }
            ctx.barrier();

            if rank == 1 {
                let mut buf = vec![0u64; 500];
                let mut total = 0;
                let mut expected_remaining = 203usize;
                loop {
                    match rb.pop_n_tail(0, 500, &mut buf, StealMethod::Half, false) {
                        Ok(got) => {
                            assert_eq!(got, expected_remaining.div_ceil(2));
                            expected_remaining -= got;
                            total += got;
                        }
                        Err(TryStealError::Empty) => break,
                        Err(TryStealError::Busy) => unreachable!("blocking steal"),
                    }
                }
                assert_eq!(total, 203);
            }
            ctx.barrier();

            if rank == 0 {
                assert_eq!(rb.size(), 0);
                // all steals have posted completions, space is recoverable
                rb.reclaim_space();
                let mut out = [0u64; 1];
                assert!(!rb.pop_head(&mut out));
            }
            ctx.barrier();
        });
    }

    #[test]
    fn wrapping_steals_round_trip() {
        shmem::run(2, 1 << 16, |ctx| {
            let rank = ctx.rank();
            let mut rb = SdcRing::create(ctx.clone(), 2, 16);

            // march the cursors around the ring so steals wrap
            for round in 0..8 {
                if rank == 0 {
                    for v in 0..10u64 {
                        rb.push_head(&[round * 100 + v, v]);
                    }
                    rb.release_all();
                }
                ctx.barrier();

                if rank == 1 {
                    let mut buf = vec![0u64; 10 * 2];
                    let mut got = 0;
                    while got < 10 {
                        if let Ok(n) = rb.pop_n_tail(0, 16, &mut buf, StealMethod::All, false) {
                            for i in 0..n {
                                assert_eq!(buf[2 * i] % 100, buf[2 * i + 1]);
                            }
                            got += n;
                        }
                    }
                    assert_eq!(got, 10);
                }
                ctx.barrier();

                if rank == 0 {
                    // wait until the deferred copies of this round land
                    let mut boff = Backoff::new();
                    while rb.reclaim_space() == 0 {
                        boff.spin();
                    }
                }
                ctx.barrier();
            }
        });
    }
}
