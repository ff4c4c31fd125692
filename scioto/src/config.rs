// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Which queue algorithm backs a task collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Split deferred-copy ring, shared side guarded by a remote spinlock.
    Sdc,
    /// Lock-free split ring driven by a single packed 64-bit atomic word.
    Saws,
}

/// How the next steal victim is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSelection {
    /// Uniformly random over all other ranks.
    Random,
    /// `(last + 1) mod N`.
    RoundRobin,
}

/// How much of a victim's shared region one steal takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealMethod {
    /// Half of what is visible, rounded up.
    Half,
    /// Everything visible.
    All,
    /// At most `chunk_size` tasks.
    Chunk,
}

/// Load-balancer configuration.
///
/// `max_steal_retries < 0` means retry a contended target forever, `0`
/// means never retry it, `> 0` bounds the retries.
#[derive(Debug, Clone)]
pub struct LdbalCfg {
    /// `false` disables the steal loop entirely (static scheduling).
    pub stealing_enabled: bool,
    pub target_selection: TargetSelection,
    pub steal_method: StealMethod,
    /// Use the aborting (`trylock`) steal variant under contention.
    pub steals_can_abort: bool,
    pub max_steal_retries: i32,
    /// Attempt cap before giving up on an intra-node target.
    pub max_steal_attempts_local: u32,
    /// Attempt cap before moving on to the next target.
    pub max_steal_attempts_remote: u32,
    /// Steal volume when `steal_method` is [`StealMethod::Chunk`].
    pub chunk_size: usize,
    /// Percent (0-100) of attempts biased toward intra-node targets.
    pub local_search_factor: u8,
}

// === impl LdbalCfg ===

impl Default for LdbalCfg {
    fn default() -> Self {
        Self {
            stealing_enabled: true,
            target_selection: TargetSelection::Random,
            steal_method: StealMethod::Half,
            steals_can_abort: true,
            max_steal_retries: 5,
            max_steal_attempts_local: 1000,
            max_steal_attempts_remote: 10,
            chunk_size: 1,
            local_search_factor: 75,
        }
    }
}

impl LdbalCfg {
    /// # Panics
    ///
    /// Panics on values no scheduler could run with (a misconfiguration is
    /// a programming error).
    pub(crate) fn validate(&self) {
        assert!(self.chunk_size >= 1, "chunk_size must be at least 1");
        assert!(
            self.local_search_factor <= 100,
            "local_search_factor is a percentage"
        );
    }
}

/// Default damping of owner-side reclaim on SAWS pushes.
const RECLAIM_POLLFREQ: u64 = 20;

/// How often (in pushes) the SAWS owner polls reclaim/ensure, overridable
/// through `GTC_RECLAIM_FREQ`.
pub(crate) fn reclaim_freq() -> u64 {
    std::env::var("GTC_RECLAIM_FREQ")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&v| v > 0)
        .unwrap_or(RECLAIM_POLLFREQ)
}
