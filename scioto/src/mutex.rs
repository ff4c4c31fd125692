// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Remote spinlock over one symmetric word per rank.
//!
//! The lock is advisory; its only role in the runtime is to serialize
//! shared-side mutations on SDC queues.  Acquire is a remote atomic swap
//! with linear back-off between attempts; no guard type is returned
//! because the protected state lives on the *victim* rank, not behind a
//! local reference.

use crate::backoff::{self, SPINCOUNT, spin_wait};
use shmem::{Ctx, SymAddr};

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

/// A mutual-exclusion slot replicated on every rank.  Any rank may lock
/// any rank's slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteMutex {
    slot: SymAddr,
}

// === impl RemoteMutex ===

impl RemoteMutex {
    /// Allocate the lock word.  Collective.
    pub(crate) fn new(ctx: &Ctx) -> Self {
        Self { slot: ctx.alloc(1) }
    }

    /// Lock `proc`'s slot, blocking until acquired.
    ///
    /// Between attempts the caller wastes `min(attempts * SPINCOUNT,
    /// MAXSPIN)` spins so a contended victim is not flooded with remote
    /// swaps.  Self-locks skip the back-off.
    pub(crate) fn lock(&self, ctx: &Ctx, proc: usize) {
        tracing::trace!(rank = ctx.rank(), proc, "mutex lock");
        let mut attempts = 0usize;
        while ctx.atomic_swap(proc, self.slot, LOCKED) != UNLOCKED {
            let spins = if ctx.rank() == proc {
                0
            } else {
                backoff::linear(attempts, SPINCOUNT)
            };
            spin_wait(spins);
            attempts += 1;
        }
    }

    /// One swap attempt on `proc`'s slot; `true` when the lock was taken.
    pub(crate) fn trylock(&self, ctx: &Ctx, proc: usize) -> bool {
        tracing::trace!(rank = ctx.rank(), proc, "mutex trylock");
        ctx.atomic_swap(proc, self.slot, LOCKED) == UNLOCKED
    }

    /// Unlock `proc`'s slot.
    ///
    /// Callers must hold the lock; the slot is simply overwritten.
    pub(crate) fn unlock(&self, ctx: &Ctx, proc: usize) {
        tracing::trace!(rank = ctx.rank(), proc, "mutex unlock");
        ctx.atomic_set(proc, self.slot, UNLOCKED);
    }
}
