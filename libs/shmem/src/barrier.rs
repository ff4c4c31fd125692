// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Backoff;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A reusable sense-reversing spin barrier over all ranks of a domain.
///
/// The leader (the last rank to arrive) resets the arrival count *before*
/// bumping the generation, so arrivals for the next phase can only begin
/// after the reset is visible.
///
/// A panicking rank never reaches its next barrier, which would leave its
/// peers spinning forever; [`Barrier::poison`] breaks them out instead.
pub(crate) struct Barrier {
    num_ranks: usize,
    count: AtomicUsize,
    generation: AtomicUsize,
    poisoned: AtomicBool,
}

// === impl Barrier ===

impl Barrier {
    pub(crate) fn new(num_ranks: usize) -> Self {
        Self {
            num_ranks,
            count: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    pub(crate) fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == self.num_ranks {
            // leader: open the next phase
            self.count.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
        } else {
            let mut boff = Backoff::new();
            while self.generation.load(Ordering::Acquire) == generation {
                assert!(
                    !self.poisoned.load(Ordering::Relaxed),
                    "a peer rank panicked while this rank waited at a barrier"
                );
                boff.spin();
            }
        }
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Barrier")
            .field("num_ranks", &self.num_ranks)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn phases_do_not_overlap() {
        const RANKS: usize = 4;
        const PHASES: usize = 100;

        let barrier = Arc::new(Barrier::new(RANKS));
        let arrivals = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..RANKS)
            .map(|_| {
                let barrier = barrier.clone();
                let arrivals = arrivals.clone();
                thread::spawn(move || {
                    for phase in 0..PHASES {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        barrier.wait();
                        // every rank must have arrived at this phase by now
                        assert!(arrivals.load(Ordering::SeqCst) >= (phase + 1) * RANKS);
                        barrier.wait();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
    }
}
