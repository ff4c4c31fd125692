// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Internal performance counters and timers.

use std::time::{Duration, Instant};

/// A start/stop accumulating wall-clock timer.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Timer {
    total: Duration,
    last: Option<Instant>,
}

// === impl Timer ===

impl Timer {
    pub(crate) fn start(&mut self) {
        self.last = Some(Instant::now());
    }

    pub(crate) fn stop(&mut self) {
        if let Some(last) = self.last.take() {
            self.total += last.elapsed();
        }
    }

    /// Zero the accumulator and start a fresh measurement (the imbalance
    /// timer tracks only the most recent passive episode).
    pub(crate) fn reset_and_start(&mut self) {
        self.total = Duration::ZERO;
        self.start();
    }

    pub(crate) fn add(&mut self, elapsed: Duration) {
        self.total += elapsed;
    }

    pub(crate) fn read(&self) -> Duration {
        self.total
    }

    pub(crate) fn secs(&self) -> f64 {
        self.total.as_secs_f64()
    }
}

/// Task-collection wide counters.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TcCounters {
    /// Transitions into the passive (searching) state.
    pub passive_count: u64,
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_stolen: u64,
    pub num_steals: u64,
    /// Steal attempts that failed after locking the victim.
    pub failed_steals_locked: u64,
    /// Steal attempts that failed before locking the victim.
    pub failed_steals_unlocked: u64,
    /// Steal attempts aborted by contention.
    pub aborted_steals: u64,
    /// Targets abandoned after exhausting retries.
    pub aborted_targets: u64,
    pub dispersion_attempts_locked: u64,
    pub dispersion_attempts_unlocked: u64,
    /// Calls to the get-buf loop.
    pub getcalls: u64,
    /// Get-buf calls satisfied locally.
    pub getlocal: u64,
}

/// Task-collection wide timers.
#[derive(Debug, Default)]
pub(crate) struct TcTimers {
    pub process: Timer,
    pub passive: Timer,
    pub search: Timer,
    pub dispersion: Timer,
    pub imbalance: Timer,
    pub getbuf: Timer,
    pub add: Timer,
    pub addinplace: Timer,
    pub addfinish: Timer,
    pub progress: Timer,
    pub poptail: Timer,
    pub getsteal: Timer,
    pub getfail: Timer,
}

/// Per-queue counters, owner-maintained.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RingStats {
    /// Local-to-shared transfers.
    pub nrelease: u64,
    /// Shared-to-local transfers.
    pub nreacquire: u64,
    /// Times a push had to wait for reclamation.
    pub nwaited: u64,
    /// Successful reclamations.
    pub nreclaimed: u64,
    /// Reclamation attempts.
    pub nreccalls: u64,
    /// Progress-engine invocations.
    pub nprogress: u64,
    /// Ensure-space invocations.
    pub nensure: u64,
    /// Successful remote steals served from this rank's perspective
    /// (thief side: completed pop-n-tail operations).
    pub ngets: u64,
    /// Words moved by steals.
    pub nxfer: u64,
}

/// Statistics switches, read from the environment once at init.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatsCfg {
    pub disabled: bool,
    pub pernode_disabled: bool,
    pub extended: bool,
    pub unordered: bool,
}

// === impl StatsCfg ===

impl StatsCfg {
    pub(crate) fn from_env() -> Self {
        Self {
            disabled: std::env::var_os("SCIOTO_DISABLE_STATS").is_some(),
            pernode_disabled: std::env::var_os("SCIOTO_DISABLE_PERNODE_STATS").is_some(),
            extended: std::env::var_os("SCIOTO_EXTENDED_STATS").is_some(),
            unordered: std::env::var_os("SCIOTO_UNORDERED_STATS").is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates_across_episodes() {
        let mut t = Timer::default();
        t.start();
        t.stop();
        let first = t.read();
        t.start();
        t.stop();
        assert!(t.read() >= first);

        t.reset_and_start();
        t.stop();
        // reset drops the previously accumulated total
        assert!(t.read() < Duration::from_secs(1));
    }

    #[test]
    fn stopping_an_idle_timer_is_a_no_op() {
        let mut t = Timer::default();
        t.stop();
        assert_eq!(t.read(), Duration::ZERO);
    }
}
