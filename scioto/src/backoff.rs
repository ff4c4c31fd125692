// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Linear back-off for the remote-contention paths.
//!
//! Both the remote mutex and the steal loop back off *linearly* between
//! attempts (`min(attempts * SPINCOUNT, MAXSPIN)` wasted spins).  The spin
//! is deliberate: contention windows here are sub-microsecond, far below
//! what a sleep could time.  Exponential back-off (see [`shmem::Backoff`])
//! is reserved for waits whose duration is unknown.

use core::hint;

/// Spins per attempt of linear back-off.
pub(crate) const SPINCOUNT: usize = 1000;

/// Cap on linear back-off spins.
pub(crate) const MAXSPIN: usize = 100_000;

/// Waste `spins` spin-loop iterations.
///
/// The progress we are backing off for is made by another rank's thread,
/// so a non-empty wait ends with a scheduler yield to keep oversubscribed
/// hosts live.
#[inline]
pub(crate) fn spin_wait(spins: usize) {
    for _ in 0..spins {
        hint::spin_loop();
    }
    if spins > 0 {
        std::thread::yield_now();
    }
}

/// Linear back-off schedule for the `attempts`-th retry.
#[inline]
pub(crate) fn linear(attempts: usize, per_attempt: usize) -> usize {
    (attempts * per_attempt).min(MAXSPIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_is_capped() {
        assert_eq!(linear(0, SPINCOUNT), 0);
        assert_eq!(linear(1, SPINCOUNT), SPINCOUNT);
        assert_eq!(linear(50, SPINCOUNT), 50_000);
        assert_eq!(linear(1_000_000, SPINCOUNT), MAXSPIN);
    }
}
