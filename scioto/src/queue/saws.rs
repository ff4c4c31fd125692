// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shmem atomic work-stealing ring buffer.
//!
//! No lock anywhere.  Everything a thief needs rides in one 64-bit word,
//! `steal_val`; a thief claims an *attempt ticket* with a single remote
//! fetch-add and from the pre-add value alone can compute exactly which
//! slots are its to read.  Batch sizes follow the halving ladder: attempt
//! `i` of an epoch with `t` released tasks takes `ceil(remaining / 2)`
//! where `remaining` is what the first `i` attempts left behind.
//!
//! Each release opens an *epoch*.  Per epoch the owner keeps a record of
//! how much was released and where, plus a symmetric `status[]` vector in
//! which attempt `i` posts the number of tasks it actually moved, after
//! its payload reads have quiesced.  The owner advances `tail` only over
//! completed prefixes, and recycles an epoch record only after every
//! claimed attempt of the epoch before it has posted -- that wait, inside
//! reacquire, is the algorithm's sole blocking point.

use crate::config::StealMethod;
use crate::error::TryStealError;
use crate::queue::{ring_head, shared_span};
use crate::stats::RingStats;
use shmem::{Backoff, Ctx, SymAddr};
use static_assertions::const_assert_eq;

/// Epoch records kept per queue: current, last, and one spare covering
/// claims still in flight from two reacquires ago.
const NUM_EPOCHS: usize = 3;

/// Epoch id published while the owner is reacquiring; steals abort.
const EPOCH_DISABLED: u64 = 3;

/// Upper bound on halving-ladder length for any 19-bit task count.
const MAX_STEALS: usize = 24;

/// The 19-bit cursor fields bound the ring size.
pub(crate) const MAX_RING_CAPACITY: usize = (1 << 19) - 1;

mycelium_bitfield::bitfield! {
    /// The authoritative shared state of the current epoch.
    ///
    /// This is the only queue state thieves ever read via atomics, so the
    /// field widths are wire-level invariants.
    #[derive(Eq, PartialEq)]
    pub(crate) struct StealWord<u64> {
        /// Tail index at release time.
        pub(crate) const TAIL = 19;
        /// Number of tasks released into this epoch.
        pub(crate) const ITASKS = 19;
        /// Current epoch id; 3 means steals are disabled.
        pub(crate) const EPOCH = 2;
        /// Count of steal attempts claimed so far.
        pub(crate) const ASTEALS = ..;
    }
}

/// One attempt ticket, as a fetch-add operand.
const ASTEAL_TICKET: u64 = StealWord::ASTEALS.first_bit();

// the declared field widths are a wire-level invariant
const_assert_eq!(ASTEAL_TICKET, 1 << 40);
const_assert_eq!(StealWord::EPOCH.first_bit(), 1 << 38);
const_assert_eq!(StealWord::ITASKS.first_bit(), 1 << 19);
const_assert_eq!(StealWord::TAIL.first_bit(), 1);

fn pack(epoch: usize, itasks: usize, tail: usize) -> u64 {
    StealWord::new()
        .with(StealWord::EPOCH, u64::try_from(epoch).expect("epoch id fits"))
        .with(StealWord::ITASKS, u64::try_from(itasks).expect("itasks fits"))
        .with(StealWord::TAIL, u64::try_from(tail).expect("tail fits"))
        .0
}

struct Unpacked {
    asteals: usize,
    epoch: u64,
    itasks: usize,
    tail: usize,
}

fn unpack(raw: u64) -> Unpacked {
    let word = StealWord(raw);
    Unpacked {
        asteals: usize::try_from(word.get(StealWord::ASTEALS)).expect("asteals fits"),
        epoch: word.get(StealWord::EPOCH),
        itasks: usize::try_from(word.get(StealWord::ITASKS)).expect("itasks fits"),
        tail: usize::try_from(word.get(StealWord::TAIL)).expect("tail fits"),
    }
}

/// Length of the halving ladder that drains `itasks` tasks.
pub(crate) fn max_steals(itasks: usize) -> usize {
    let mut attempts = 0;
    let mut remaining = itasks;
    while remaining > 0 {
        remaining -= remaining.div_ceil(2);
        attempts += 1;
    }
    attempts
}

/// Simulate the first `asteals` attempts of the ladder over `itasks`
/// tasks; returns `(stolen, remaining)`.
pub(crate) fn claimed(itasks: usize, asteals: usize) -> (usize, usize) {
    let mut stolen = 0;
    let mut remaining = itasks;
    for _ in 0..asteals {
        if remaining == 0 {
            break;
        }
        stolen += remaining.div_ceil(2);
        remaining = itasks - stolen;
    }
    (stolen, remaining)
}

/// Owner-side record of one epoch.
#[derive(Debug, Default, Clone, Copy)]
struct Epoch {
    /// Tasks released into the epoch (corrected down to the claimed
    /// amount when the epoch is retired early).
    itasks: usize,
    /// Ring index of the epoch's first slot.
    vtail: usize,
    /// Attempts the epoch is still owed status posts for.
    maxsteals: usize,
    done: bool,
}

/// Per-victim steal hint: an exhausted victim is probed without taking a
/// ticket until observed full again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetHint {
    Full,
    Empty,
}

pub(crate) struct SawsRing {
    ctx: Ctx,
    base: SymAddr,
    capacity: usize,
    slot_words: usize,
    nlocal: usize,
    split: usize,
    tail: usize,
    cur: usize,
    last: usize,
    epochs: [Epoch; NUM_EPOCHS],
    targets: Vec<TargetHint>,
    reclaim_freq: u64,
    push_count: u64,
    pub(crate) stats: RingStats,
}

// === impl SawsRing ===

impl SawsRing {
    /// Allocate and reset the ring.  Collective.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds what the 19-bit cursor fields can
    /// address.
    pub(crate) fn create(ctx: Ctx, slot_words: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        assert!(
            capacity <= MAX_RING_CAPACITY,
            "steal_val tail field limits capacity to {MAX_RING_CAPACITY}"
        );
        debug_assert!(max_steals(capacity) <= MAX_STEALS);

        let base = ctx.alloc(1 + NUM_EPOCHS * MAX_STEALS + capacity * slot_words);
        let nranks = ctx.num_ranks();
        let mut rb = Self {
            ctx,
            base,
            capacity,
            slot_words,
            nlocal: 0,
            split: 0,
            tail: 0,
            cur: 0,
            last: 0,
            epochs: [Epoch::default(); NUM_EPOCHS],
            targets: vec![TargetHint::Full; nranks],
            reclaim_freq: crate::config::reclaim_freq(),
            push_count: 0,
            stats: RingStats::default(),
        };
        rb.reset();
        rb.ctx.barrier();
        tracing::debug!(rank = rb.ctx.rank(), capacity, slot_words, "saws ring created");
        rb
    }

    pub(crate) fn reset(&mut self) {
        self.nlocal = 0;
        self.split = 0;
        self.tail = 0;
        self.cur = 0;
        self.last = NUM_EPOCHS - 1;
        self.epochs = [Epoch::default(); NUM_EPOCHS];
        self.epochs[self.last].done = true;
        self.targets.fill(TargetHint::Full);
        self.push_count = 0;
        self.stats = RingStats::default();

        let me = self.ctx.rank();
        for epoch in 0..NUM_EPOCHS {
            for attempt in 0..MAX_STEALS {
                self.ctx.atomic_set(me, self.status_addr(epoch, attempt), 0);
            }
        }
        // the queue comes up with steals disabled; the first release
        // publishes a live word
        self.ctx
            .atomic_set(me, self.steal_val_addr(), StealWord::EPOCH.raw_mask());
    }

    fn steal_val_addr(&self) -> SymAddr {
        self.base
    }

    fn status_addr(&self, epoch: usize, attempt: usize) -> SymAddr {
        debug_assert!(epoch < NUM_EPOCHS && attempt < MAX_STEALS);
        self.base.offset(1 + epoch * MAX_STEALS + attempt)
    }

    fn slot_addr(&self, index: usize) -> SymAddr {
        debug_assert!(index < self.capacity);
        self.base
            .offset(1 + NUM_EPOCHS * MAX_STEALS + index * self.slot_words)
    }

    fn status(&self, epoch: usize, attempt: usize) -> usize {
        let raw = self.ctx.atomic_fetch(self.ctx.rank(), self.status_addr(epoch, attempt));
        usize::try_from(raw).expect("status fits")
    }

    fn zero_status(&self, epoch: usize) {
        let me = self.ctx.rank();
        for attempt in 0..MAX_STEALS {
            self.ctx.atomic_set(me, self.status_addr(epoch, attempt), 0);
        }
    }

    fn publish(&self, epoch: usize, itasks: usize, tail: usize) {
        self.ctx
            .atomic_set(self.ctx.rank(), self.steal_val_addr(), pack(epoch, itasks, tail));
    }

    // --- state queries ---

    pub(crate) fn local_size(&self) -> usize {
        self.nlocal
    }

    pub(crate) fn shared_size(&self) -> usize {
        shared_span(self.tail, self.split, self.capacity)
    }

    pub(crate) fn size(&self) -> usize {
        self.local_size() + self.shared_size()
    }

    fn head(&self) -> usize {
        ring_head(self.split, self.nlocal, self.capacity)
    }

    // --- split movement ---

    /// Advance `tail` over completed steal prefixes.  Returns the number
    /// of slots freed.
    pub(crate) fn reclaim_space(&mut self) -> usize {
        self.stats.nreccalls += 1;

        // the last epoch must fully complete before tail may cross into
        // the current one
        if !self.epochs[self.last].done {
            let meta = self.epochs[self.last];
            let mut sum = 0;
            for attempt in 0..meta.maxsteals {
                let posted = self.status(self.last, attempt);
                if posted == 0 {
                    return 0;
                }
                sum += posted;
            }
            if sum == meta.itasks {
                self.tail = self.epochs[self.cur].vtail;
                self.epochs[self.last].done = true;
            }
        }

        let meta = self.epochs[self.cur];
        let mut prefix = 0;
        for attempt in 0..meta.maxsteals {
            let posted = self.status(self.cur, attempt);
            if posted == 0 {
                break;
            }
            prefix += posted;
        }
        if prefix == meta.itasks {
            self.epochs[self.cur].done = true;
        }

        let mut reclaimed = 0;
        if self.epochs[self.last].done && prefix > 0 {
            let new_tail = (meta.vtail + prefix) % self.capacity;
            reclaimed = (new_tail + self.capacity - self.tail) % self.capacity;
            self.tail = new_tail;
            if reclaimed > 0 {
                self.stats.nreclaimed += 1;
            }
        }
        reclaimed
    }

    /// # Panics
    ///
    /// Panics when the ring genuinely cannot hold `n` more elements.
    fn ensure_space(&mut self, n: usize) {
        self.stats.nensure += 1;
        if self.capacity - self.size() < n {
            self.reclaim_space();
            if self.capacity - self.size() < n {
                tracing::error!(
                    rank = self.ctx.rank(),
                    capacity = self.capacity,
                    local = self.local_size(),
                    shared = self.shared_size(),
                    "queue overflow: no room to push {n} elements"
                );
                panic!("saws ring out of space for {n} elements");
            }
        }
    }

    /// Open a new epoch over half the local region, but only when the
    /// shared side has run dry.
    pub(crate) fn release(&mut self) {
        if self.local_size() > 0 && self.shared_size() == 0 {
            let nshared = self.nlocal.div_ceil(2);
            self.release_amount(nshared);
        }
    }

    /// Publish the entire local region as one epoch.
    pub(crate) fn release_all(&mut self) {
        assert_eq!(
            self.shared_size(),
            0,
            "release_all extends no epoch; drain the shared side first"
        );
        if self.nlocal > 0 {
            self.release_amount(self.nlocal);
        }
    }

    fn release_amount(&mut self, nshared: usize) {
        self.nlocal -= nshared;
        self.split = (self.split + nshared) % self.capacity;

        self.epochs[self.cur] = Epoch {
            itasks: nshared,
            vtail: self.tail,
            maxsteals: max_steals(nshared),
            done: false,
        };
        self.zero_status(self.cur);
        self.publish(self.cur, nshared, self.tail);
        self.stats.nrelease += 1;

        tracing::trace!(
            rank = self.ctx.rank(),
            nshared,
            split = self.split,
            tail = self.tail,
            epoch = self.cur,
            "saws release"
        );
        debug_assert!(self.tail < self.capacity);
    }

    /// Claw back the unclaimed half of the shared region.
    ///
    /// Returns the number of tasks moved back to the local side; the
    /// caller loops on a zero return.  This is the algorithm's only
    /// blocking point: it waits for every claimed attempt of the previous
    /// epoch to post its status.
    pub(crate) fn reacquire(&mut self) -> usize {
        if self.nlocal != 0 || self.shared_size() == 0 {
            return 0;
        }

        // disable steals and capture the pre-disable claim state
        let pre = self
            .ctx
            .atomic_fetch_or(self.ctx.rank(), self.steal_val_addr(), StealWord::EPOCH.raw_mask());
        let word = unpack(pre);
        debug_assert_eq!(word.epoch, u64::try_from(self.cur).unwrap());
        tracing::trace!(
            rank = self.ctx.rank(),
            asteals = word.asteals,
            itasks = word.itasks,
            tail = word.tail,
            "saws steals disabled"
        );

        // every claimed attempt of the previous epoch must land before
        // its record can be recycled
        if !self.epochs[self.last].done {
            let meta = self.epochs[self.last];
            self.stats.nwaited += 1;
            let mut boff = Backoff::new();
            loop {
                let sum: usize = (0..meta.maxsteals).map(|a| self.status(self.last, a)).sum();
                if sum == meta.itasks {
                    break;
                }
                boff.spin();
            }
            self.epochs[self.last].done = true;
            self.tail = self.epochs[self.cur].vtail;
        }

        let (stolen, remaining) = claimed(word.itasks, word.asteals);
        let amount = remaining.div_ceil(2);

        if amount == 0 {
            // nothing unclaimed; re-enable steals over an empty epoch
            self.publish(self.cur, 0, self.tail);
            return 0;
        }

        self.nlocal += amount;
        self.split = (self.split + self.capacity - amount) % self.capacity;

        // retire the current epoch: it now owes exactly the claimed
        // attempts, no more
        let old_cur = self.cur;
        self.cur = (old_cur + 1) % NUM_EPOCHS;
        self.last = old_cur;

        // advance tail over whatever prefix of the retired epoch already
        // completed
        let retired_vtail = self.epochs[old_cur].vtail;
        let mut prefix = 0;
        for attempt in 0..self.epochs[old_cur].maxsteals {
            let posted = self.status(old_cur, attempt);
            if posted == 0 {
                break;
            }
            prefix += posted;
        }
        if prefix > 0 {
            self.tail = (retired_vtail + prefix) % self.capacity;
        }

        self.epochs[old_cur].itasks = stolen;
        self.epochs[old_cur].maxsteals = word.asteals.min(max_steals(word.itasks));
        self.epochs[old_cur].done = false;

        // the new epoch covers the unclaimed region we did not take
        self.epochs[self.cur] = Epoch {
            itasks: remaining - amount,
            vtail: (retired_vtail + stolen) % self.capacity,
            maxsteals: max_steals(remaining - amount),
            done: false,
        };
        self.zero_status(self.cur);
        self.publish(self.cur, remaining - amount, self.epochs[self.cur].vtail);

        self.stats.nreacquire += 1;
        tracing::trace!(
            rank = self.ctx.rank(),
            amount,
            remaining,
            stolen,
            epoch = self.cur,
            "saws reacquire"
        );
        amount
    }

    /// Owner-side maintenance pass.
    pub(crate) fn progress(&mut self) {
        self.release();
        // advance tail over completed steals so a fully-stolen epoch
        // does not read as phantom shared work
        self.reclaim_space();
        self.stats.nprogress += 1;
    }

    // --- push operations ---

    pub(crate) fn push_head(&mut self, slot: &[u64]) {
        assert!(slot.len() <= self.slot_words, "element wider than a slot");
        // reclaim polling is damped: most pushes skip it, but an
        // apparently-full ring always reclaims before the overflow check
        if self.push_count % self.reclaim_freq == 0 || self.size() >= self.capacity {
            self.ensure_space(1);
        }
        self.push_count += 1;

        let index = (self.head() + 1) % self.capacity;
        self.ctx.put_nbi(self.ctx.rank(), self.slot_addr(index), slot);
        self.nlocal += 1;
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
            let part = self.capacity - first;
            self.ctx
                .put_nbi(me, self.slot_addr(first), &buf[..part * self.slot_words]);
            self.ctx.put_nbi(
                me,
                self.slot_addr(0),
                &buf[part * self.slot_words..n * self.slot_words],
            );
        }
        self.nlocal += n;
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
            self.nlocal -= 1;
            true
        } else {
            false
        }
    }

    /// Remote probe: decode the victim's steal word without claiming a
    /// ticket.
    pub(crate) fn poll_victim(&mut self, proc: usize) -> usize {
        let word = unpack(self.ctx.atomic_fetch(proc, self.steal_val_addr()));
        if word.epoch == EPOCH_DISABLED {
            // the owner is rebalancing; it has work
            return 1;
        }
        if word.asteals >= max_steals(word.itasks) {
            return 0;
        }
        claimed(word.itasks, word.asteals).1
    }

    /// Steal one ladder batch from `proc`'s tail into `buf`.
    ///
    /// The requested count and steal method are advisory only: the batch
    /// size is fixed by the epoch's halving ladder.  There is no lock, so
    /// the abortable and blocking variants coincide.
    pub(crate) fn pop_n_tail(
        &mut self,
        proc: usize,
        _n: usize,
        buf: &mut [u64],
        _method: StealMethod,
    ) -> Result<usize, TryStealError> {
        let word = loop {
            // an exhausted victim is probed without a ticket until it
            // looks full again
            let raw = if self.targets[proc] == TargetHint::Full {
                self.ctx.atomic_fetch_add(proc, self.steal_val_addr(), ASTEAL_TICKET)
            } else {
                self.ctx.atomic_fetch(proc, self.steal_val_addr())
            };
            let word = unpack(raw);

            if word.epoch == EPOCH_DISABLED {
                // victim is reacquiring; any ticket we took is void
                return Err(TryStealError::Busy);
            }
            if word.asteals >= max_steals(word.itasks) {
                self.targets[proc] = TargetHint::Empty;
                return Err(TryStealError::Empty);
            }
            if self.targets[proc] == TargetHint::Empty {
                // it filled back up; go claim a real ticket
                self.targets[proc] = TargetHint::Full;
                continue;
            }
            break word;
        };

        // asteals < maxsteals guarantees the ladder has a batch left
        let (stolen, remaining) = claimed(word.itasks, word.asteals);
        let ntasks = remaining.div_ceil(2);
        debug_assert!(ntasks > 0);

        let start = (word.tail + stolen) % self.capacity;
        let words = ntasks * self.slot_words;
        debug_assert!(buf.len() >= words);

        if start + ntasks <= self.capacity {
            self.ctx.get_nbi(proc, self.slot_addr(start), &mut buf[..words]);
        } else {
            let part = self.capacity - start;
            self.ctx
                .get_nbi(proc, self.slot_addr(start), &mut buf[..part * self.slot_words]);
            self.ctx
                .get_nbi(proc, self.slot_addr(0), &mut buf[part * self.slot_words..words]);
        }
        self.ctx.quiet();

        // post completion for exactly our attempt
        let epoch = usize::try_from(word.epoch).expect("epoch id fits");
        self.ctx.atomic_fetch_add(
            proc,
            self.status_addr(epoch, word.asteals),
            u64::try_from(ntasks).expect("batch fits"),
        );

        self.stats.ngets += 1;
        self.stats.nxfer += u64::try_from(words).expect("transfer size fits");
        tracing::trace!(
            rank = self.ctx.rank(),
            victim = proc,
            stolen = ntasks,
            attempt = word.asteals,
            epoch,
            "saws steal"
        );
        Ok(ntasks)
    }
}

impl core::fmt::Debug for SawsRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SawsRing")
            .field("rank", &self.ctx.rank())
            .field("capacity", &self.capacity)
            .field("nlocal", &self.nlocal)
            .field("split", &self.split)
            .field("tail", &self.tail)
            .field("epoch", &self.cur)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_lengths() {
        assert_eq!(max_steals(0), 0);
        assert_eq!(max_steals(1), 1);
        assert_eq!(max_steals(2), 2);
        assert_eq!(max_steals(5), 3); // 3, 1, 1
        assert_eq!(max_steals(102), 7);
        assert_eq!(max_steals(MAX_RING_CAPACITY), 19);
        assert!(max_steals(MAX_RING_CAPACITY) <= MAX_STEALS);
    }

    #[test]
    fn ladder_simulation_matches_batches() {
        // 13 -> 7, 3, 2, 1
        assert_eq!(claimed(13, 0), (0, 13));
        assert_eq!(claimed(13, 1), (7, 6));
        assert_eq!(claimed(13, 2), (10, 3));
        assert_eq!(claimed(13, 3), (12, 1));
        assert_eq!(claimed(13, 4), (13, 0));
        // over-claiming beyond the ladder is harmless
        assert_eq!(claimed(13, 40), (13, 0));
    }

    #[test]
    fn steal_word_roundtrip() {
        let raw = pack(2, 1234, 56789);
        let word = unpack(raw);
        assert_eq!(word.asteals, 0);
        assert_eq!(word.epoch, 2);
        assert_eq!(word.itasks, 1234);
        assert_eq!(word.tail, 56789);

        let ticketed = unpack(raw + 3 * ASTEAL_TICKET);
        assert_eq!(ticketed.asteals, 3);
        assert_eq!(ticketed.itasks, 1234);
        assert_eq!(ticketed.tail, 56789);
    }

    #[test]
    fn disable_mask_forces_epoch_three() {
        for epoch in 0..NUM_EPOCHS {
            let raw = pack(epoch, 7, 9) | StealWord::EPOCH.raw_mask();
            assert_eq!(unpack(raw).epoch, EPOCH_DISABLED);
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // the full ladder drains every released task, within the
            // attempt bound the status vectors are sized for
            #[test]
            fn ladder_drains_exactly(n in 0usize..(1 << 19)) {
                let attempts = max_steals(n);
                prop_assert!(attempts <= MAX_STEALS);
                let (stolen, remaining) = claimed(n, attempts);
                prop_assert_eq!(stolen, n);
                prop_assert_eq!(remaining, 0);
            }

            // each successive attempt takes the ceiling half of what the
            // previous ones left
            #[test]
            fn batches_follow_the_ladder(n in 1usize..100_000, k in 0usize..24) {
                let (stolen, remaining) = claimed(n, k);
                prop_assert_eq!(stolen + remaining, n);
                if remaining > 0 {
                    let (next_stolen, _) = claimed(n, k + 1);
                    prop_assert_eq!(next_stolen - stolen, remaining.div_ceil(2));
                }
            }

            // every field survives packing next to every other, with any
            // plausible number of tickets stacked on top
            #[test]
            fn packed_word_roundtrips(
                epoch in 0usize..3,
                itasks in 0usize..(1 << 19),
                tail in 0usize..(1 << 19),
                tickets in 0u64..(1 << 20),
            ) {
                let raw = pack(epoch, itasks, tail) + tickets * ASTEAL_TICKET;
                let word = unpack(raw);
                prop_assert_eq!(u64::try_from(word.asteals).unwrap(), tickets);
                prop_assert_eq!(word.epoch, u64::try_from(epoch).unwrap());
                prop_assert_eq!(word.itasks, itasks);
                prop_assert_eq!(word.tail, tail);
            }
        }
    }

    fn slot(val: u64) -> [u64; 1] {
        [val]
    }

    #[test]
    fn push_pop_is_lifo() {
        shmem::run(1, 1 << 14, |ctx| {
            let mut rb = SawsRing::create(ctx, 1, 500);
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
    fn release_publishes_an_epoch() {
        shmem::run(1, 1 << 12, |ctx| {
            let mut rb = SawsRing::create(ctx.clone(), 1, 64);
            for v in 0..9u64 {
                rb.push_head(&slot(v));
            }
            rb.release();
            assert_eq!(rb.shared_size(), 5);
            assert_eq!(rb.local_size(), 4);

            let word = unpack(ctx.atomic_fetch(0, rb.steal_val_addr()));
            assert_eq!(word.itasks, 5);
            assert_eq!(word.asteals, 0);
            assert_eq!(word.tail, 0);
        });
    }

    #[test]
    fn reacquire_takes_half_of_the_unclaimed() {
        shmem::run(1, 1 << 12, |ctx| {
            let mut rb = SawsRing::create(ctx, 1, 64);
            for v in 0..16u64 {
                rb.push_head(&slot(v));
            }
            rb.release_all();
            assert_eq!(rb.local_size(), 0);
            assert_eq!(rb.shared_size(), 16);

            // nothing stolen: owner takes half back
            assert_eq!(rb.reacquire(), 8);
            assert_eq!(rb.local_size(), 8);
            assert_eq!(rb.shared_size(), 8);

            // pops drain the local side, then reacquire again
            let mut out = [0u64; 1];
            let mut drained = 0;
            while rb.pop_head(&mut out) {
                drained += 1;
            }
            assert_eq!(drained, 16);
        });
    }

    #[test]
    fn steal_batches_follow_the_halving_ladder() {
        shmem::run(2, 1 << 16, |ctx| {
            let rank = ctx.rank();
            let mut rb = SawsRing::create(ctx.clone(), 1, 500);

            if rank == 0 {
                for v in 1..=203u64 {
                    rb.push_head(&slot(v));
                }
                rb.release_all();
            }
            ctx.barrier();

            if rank == 1 {
                let mut buf = vec![0u64; 500];
                let mut seen = vec![false; 204];
                let mut remaining = 203usize;
                let mut total = 0;
                loop {
                    match rb.pop_n_tail(0, 500, &mut buf, StealMethod::Half) {
                        Ok(got) => {
                            assert_eq!(got, remaining.div_ceil(2));
                            for s in buf.iter().take(got) {
                                let v = usize::try_from(*s).unwrap();
                                assert!(!seen[v], "task {v} stolen twice");
                                seen[v] = true;
                            }
                            remaining -= got;
                            total += got;
                        }
                        Err(TryStealError::Empty) => break,
                        Err(TryStealError::Busy) => unreachable!("owner is idle"),
                    }
                }
                assert_eq!(total, 203);
            }
            ctx.barrier();

            if rank == 0 {
                // every slot was claimed; completions land and reclaim
                let mut boff = Backoff::new();
                while rb.shared_size() > 0 {
                    rb.reclaim_space();
                    boff.spin();
                }
                assert_eq!(rb.size(), 0);
            }
            ctx.barrier();
        });
    }

    #[test]
    fn empty_hint_short_circuits_until_refilled() {
        shmem::run(2, 1 << 14, |ctx| {
            let rank = ctx.rank();
            let mut rb = SawsRing::create(ctx.clone(), 1, 64);

            if rank == 0 {
                rb.push_head(&slot(42));
                rb.release_all();
            }
            ctx.barrier();

            if rank == 1 {
                let mut buf = vec![0u64; 64];
                assert_eq!(rb.pop_n_tail(0, 64, &mut buf, StealMethod::Half), Ok(1));
                assert_eq!(
                    rb.pop_n_tail(0, 64, &mut buf, StealMethod::Half),
                    Err(TryStealError::Empty)
                );
                assert_eq!(rb.targets[0], TargetHint::Empty);
            }
            ctx.barrier();

            if rank == 0 {
                // drain the completed epoch, then refill
                let mut boff = Backoff::new();
                while rb.shared_size() > 0 {
                    rb.reclaim_space();
                    boff.spin();
                }
                rb.push_head(&slot(77));
                rb.release_all();
            }
            ctx.barrier();

            if rank == 1 {
                let mut buf = vec![0u64; 64];
                // hint flips back to full and the steal claims a ticket
                assert_eq!(rb.pop_n_tail(0, 64, &mut buf, StealMethod::Half), Ok(1));
                assert_eq!(buf[0], 77);
            }
            ctx.barrier();
        });
    }
}
