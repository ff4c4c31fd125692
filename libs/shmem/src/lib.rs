// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-sided symmetric-memory substrate.
//!
//! A [`Domain`] owns one fixed-size heap of 64-bit words per rank.  Because
//! every rank allocates collectively and in the same order, a [`SymAddr`]
//! (a word offset) names the *same logical object* on every rank, and any
//! rank may address `(rank, addr)` pairs with one-sided gets, puts, and
//! word atomics -- no cooperation from the target's worker required.
//!
//! This backend keeps all ranks inside one process (threads as ranks),
//! which is what every test in the workspace runs on.  The operation set
//! and its ordering contract are the substrate interface the runtime is
//! written against:
//!
//! * control words are accessed with the `atomic_*` operations (SeqCst);
//! * bulk payload moves via [`Ctx::get_nbi`]/[`Ctx::put_nbi`] are relaxed
//!   and must be fenced with [`Ctx::quiet`] before any dependent control
//!   write, exactly as a NIC-offloaded `getmem_nbi` would be.

mod backoff;
mod barrier;
mod collect;
mod domain;

pub use backoff::Backoff;
pub use collect::{ReduceOp, Reducible};
pub use domain::{Ctx, Domain, SymAddr};

use std::thread;

/// Spawn `num_ranks` worker threads, attach each to a fresh [`Domain`] with
/// `heap_words` words of symmetric heap per rank, and run `f` on every
/// rank.  Panics in any worker propagate to the caller.
///
/// This is the harness every multi-rank test uses.
pub fn run<F>(num_ranks: usize, heap_words: usize, f: F)
where
    F: Fn(Ctx) + Send + Sync,
{
    let domain = Domain::new(num_ranks, heap_words);

    thread::scope(|s| {
        let mut workers = Vec::with_capacity(num_ranks);

        for rank in 0..num_ranks {
            let ctx = domain.attach(rank);
            let f = &f;
            let worker = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(s, move || {
                    // a rank that dies must not leave its peers spinning
                    // at the next barrier
                    let domain = ctx.domain().clone();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx)));
                    if let Err(panic) = result {
                        domain.poison();
                        std::panic::resume_unwind(panic);
                    }
                })
                .expect("failed to spawn rank");
            workers.push(worker);
        }

        for worker in workers {
            if let Err(panic) = worker.join() {
                std::panic::resume_unwind(panic);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_attaches_every_rank() {
        run(4, 128, |ctx| {
            assert_eq!(ctx.num_ranks(), 4);
            assert!(ctx.rank() < 4);
            ctx.barrier();
        });
    }
}
