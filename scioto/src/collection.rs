// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task collection: a per-rank queue plus everything that drives it.
//!
//! The heart of the system is [`TaskCollection::get_buf`]: drain the local
//! head, then search for a victim, steal from its tail, and between
//! failed attempts keep voting in the termination detector until the
//! collection is provably drained everywhere.

use crate::backoff::{self, SPINCOUNT, spin_wait};
use crate::clod::Clod;
use crate::config::{LdbalCfg, QueueKind, StealMethod, TargetSelection};
use crate::error::TryStealError;
use crate::queue::saws::SawsRing;
use crate::queue::sdc::SdcRing;
use crate::queue::SharedQueue;
use crate::stats::{TcCounters, TcTimers};
use crate::task::{self, Task, TaskClass};
use crate::termination::TerminationDetector;
use shmem::Ctx;

/// Entries per collection in the common local object directory.
const MAX_CLOD_ENTRIES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcState {
    Inactive,
    Searching,
    Stealing,
    Working,
    Terminated,
}

/// Victim-selector state across one search.
#[derive(Debug, Default)]
struct VsState {
    target_retry: bool,
    num_retries: i32,
    last_target: usize,
}

pub(crate) struct TaskCollection {
    ctx: Ctx,
    queue: SharedQueue,
    td: TerminationDetector,
    pub(crate) clod: Clod,
    cfg: LdbalCfg,
    max_body_size: usize,
    slot_words: usize,
    /// Landing area for stolen blocks; sized off the hot path.
    steal_buf: Vec<u64>,
    /// One-slot scratch for encode/decode on add and pop.
    slot_scratch: Vec<u64>,
    /// Scratch descriptor for in-place creation.
    inplace: Task,
    pub(crate) counters: TcCounters,
    pub(crate) timers: TcTimers,
    state: TcState,
    dispersed: bool,
    pub(crate) terminated: bool,
    external_work_avail: bool,
    last_target: usize,
    rng: fastrand::Rng,
}

// === impl TaskCollection ===

impl TaskCollection {
    /// Build a collection over a freshly allocated queue.  Collective.
    pub(crate) fn create(
        ctx: Ctx,
        max_body_size: usize,
        capacity: usize,
        cfg: LdbalCfg,
        qtype: QueueKind,
    ) -> Self {
        cfg.validate();

        let slot_words = task::slot_words(max_body_size);
        let queue = match qtype {
            QueueKind::Sdc => SharedQueue::Sdc(SdcRing::create(ctx.clone(), slot_words, capacity)),
            QueueKind::Saws => {
                SharedQueue::Saws(SawsRing::create(ctx.clone(), slot_words, capacity))
            }
        };

        let steal_slots = match cfg.steal_method {
            StealMethod::Chunk => cfg.chunk_size,
            StealMethod::Half | StealMethod::All => capacity,
        };

        let td = TerminationDetector::create(ctx.clone());
        let rank = ctx.rank();
        let size = ctx.num_ranks();

        let mut tc = Self {
            ctx,
            queue,
            td,
            clod: Clod::new(MAX_CLOD_ENTRIES),
            cfg,
            max_body_size,
            slot_words,
            steal_buf: vec![0; steal_slots * slot_words],
            slot_scratch: vec![0; slot_words],
            inplace: Task::placeholder(),
            counters: TcCounters::default(),
            timers: TcTimers::default(),
            state: TcState::Inactive,
            dispersed: false,
            terminated: false,
            external_work_avail: false,
            last_target: (rank + 1) % size,
            rng: fastrand::Rng::with_seed(0x5C10_70A5 ^ u64::try_from(rank).expect("rank fits")),
        };
        tc.reset_soft();
        tc
    }

    /// Reset everything but the queue allocation.  Collective.
    pub(crate) fn reset(&mut self) {
        self.reset_soft();
        self.td.reset();
        self.queue.reset();
    }

    fn reset_soft(&mut self) {
        self.state = TcState::Inactive;
        self.counters = TcCounters::default();
        self.timers = TcTimers::default();
        self.dispersed = false;
        self.terminated = false;
        self.external_work_avail = false;
        self.last_target = (self.ctx.rank() + 1) % self.ctx.num_ranks();
    }

    pub(crate) fn cfg(&self) -> &LdbalCfg {
        &self.cfg
    }

    pub(crate) fn set_cfg(&mut self, cfg: LdbalCfg) {
        cfg.validate();
        self.cfg = cfg;
    }

    pub(crate) fn queue_name(&self) -> &'static str {
        self.queue.queue_name()
    }

    pub(crate) fn set_state(&mut self, state: TcState) {
        self.state = state;
    }

    /// Approximate number of tasks in the local queue.
    pub(crate) fn tasks_avail(&self) -> usize {
        self.queue.work_avail()
    }

    pub(crate) fn enable_stealing(&mut self) {
        assert!(!self.cfg.stealing_enabled, "stealing already enabled");
        self.cfg.stealing_enabled = true;
    }

    pub(crate) fn disable_stealing(&mut self) {
        assert!(self.cfg.stealing_enabled, "stealing already disabled");
        self.cfg.stealing_enabled = false;
    }

    /// Flag external (out-of-collection) work so termination detection
    /// holds off.  The flag must be stable: once it drops to `false` it
    /// must stay there for the detector to be sound.
    pub(crate) fn set_external_work_avail(&mut self, avail: bool) {
        self.external_work_avail = avail;
    }

    /// Publish the whole local region (drain helpers and tests).
    pub(crate) fn release_all(&mut self) {
        self.queue.release_all();
    }

    /// Owner-side maintenance: balance the split, reclaim finished
    /// steals.
    pub(crate) fn progress(&mut self) {
        self.timers.progress.start();
        self.queue.progress();
        self.timers.progress.stop();
    }

    // --- adding work ---

    /// Copy `task` into this rank's queue.
    ///
    /// `proc` is advisory and must name the calling rank: remote pushes
    /// are disabled by design, load moves only by stealing.
    pub(crate) fn add(&mut self, task: &mut Task, proc: usize) {
        assert_eq!(proc, self.ctx.rank(), "remote task pushes are disabled");
        assert!(
            task.body().len() <= self.max_body_size,
            "task body of {} bytes exceeds queue max of {}",
            task.body().len(),
            self.max_body_size
        );
        assert!(self.state != TcState::Terminated, "collection already drained");

        self.timers.add.start();
        task.set_created_by(self.ctx.rank());
        task::encode_slot(task, &mut self.slot_scratch);
        self.queue.push_head(&self.slot_scratch);
        self.counters.tasks_spawned += 1;
        self.timers.add.stop();
    }

    /// Create a task of `class` directly at the queue head, letting
    /// `fill` write the body in place.
    pub(crate) fn add_inplace<F>(&mut self, class: TaskClass, body_size: usize, fill: F)
    where
        F: FnOnce(&mut [u8]),
    {
        self.timers.addinplace.start();
        let mut inplace = std::mem::replace(&mut self.inplace, Task::placeholder());
        inplace.set_class(class);
        inplace.set_created_by(self.ctx.rank());
        inplace.set_priority(0);
        inplace.resize_body(body_size);
        fill(inplace.body_mut());

        task::encode_slot(&inplace, &mut self.slot_scratch);
        self.queue.push_head(&self.slot_scratch);
        self.counters.tasks_spawned += 1;
        self.inplace = inplace;
        self.timers.addinplace.stop();
    }

    /// Flush outstanding in-place creations.
    pub(crate) fn add_inplace_finish(&mut self) {
        self.timers.addfinish.start();
        self.progress();
        self.timers.addfinish.stop();
    }

    // --- getting work ---

    /// Head-only pop; no load balancing, a miss does not imply global
    /// termination.
    pub(crate) fn get_local_buf(&mut self, priority: i32, task: &mut Task) -> bool {
        let _ = priority; // single priority channel
        if self.queue.pop_head(&mut self.slot_scratch) {
            task::decode_slot(&self.slot_scratch, task);
            true
        } else {
            false
        }
    }

    /// Select the next steal victim.
    ///
    /// A target that aborted us is retried until the retry budget is
    /// spent (`< 0` budget retries forever, `0` never retries).
    fn select_target(&mut self, vs: &mut VsState) -> usize {
        if self.ctx.num_ranks() == 1 {
            return 0;
        }

        if vs.target_retry {
            let budget = self.cfg.max_steal_retries;
            let exhausted = budget == 0 || (budget > 0 && vs.num_retries >= budget);
            if exhausted {
                vs.num_retries = 0;
                self.counters.aborted_targets += 1;
            } else {
                vs.target_retry = false;
                vs.num_retries += 1;
                return vs.last_target;
            }
        }

        let v = match self.cfg.target_selection {
            TargetSelection::Random => {
                let size = self.ctx.num_ranks();
                loop {
                    let v = self.rng.usize(0..size);
                    if v != self.ctx.rank() {
                        break v;
                    }
                }
            }
            TargetSelection::RoundRobin => (vs.last_target + 1) % self.ctx.num_ranks(),
        };
        vs.last_target = v;
        v
    }

    /// How many tasks one steal may request.
    fn steal_request_size(&self) -> usize {
        match self.cfg.steal_method {
            StealMethod::Chunk => self.cfg.chunk_size,
            StealMethod::Half | StealMethod::All => self.steal_buf.len() / self.slot_words,
        }
    }

    /// Blocking steal from `target`'s tail; stolen tasks land on our own
    /// head.
    fn steal_tail(&mut self, target: usize) -> Result<usize, TryStealError> {
        self.steal_tail_inner(target, false)
    }

    /// Abortable variant of [`TaskCollection::steal_tail`].
    fn try_steal_tail(&mut self, target: usize) -> Result<usize, TryStealError> {
        self.steal_tail_inner(target, true)
    }

    fn steal_tail_inner(&mut self, target: usize, abortable: bool) -> Result<usize, TryStealError> {
        let req = self.steal_request_size();
        let method = self.cfg.steal_method;

        let started = std::time::Instant::now();
        let result = if abortable {
            self.queue
                .try_pop_n_tail(target, req, &mut self.steal_buf, method)
        } else {
            self.queue
                .pop_n_tail(target, req, &mut self.steal_buf, method)
        };
        let elapsed = started.elapsed();

        match result {
            Ok(n) => {
                self.timers.getsteal.add(elapsed);
                tracing::debug!(rank = self.ctx.rank(), target, stolen = n, "steal");
                self.queue.push_n_head(&self.steal_buf, n);
                Ok(n)
            }
            Err(e) => {
                self.timers.getfail.add(elapsed);
                Err(e)
            }
        }
    }

    /// Find work: local head first, then steal, voting for termination
    /// between failed attempts.  Returns `false` only on global
    /// termination.
    pub(crate) fn get_buf(&mut self, priority: i32, task: &mut Task) -> bool {
        self.counters.getcalls += 1;
        self.timers.getbuf.start();

        // owner-side maintenance before anything else
        self.progress();

        let mut got_task = self.get_local_buf(priority, task);

        // time dispersion: with work on hand this stops at ~0
        if !self.dispersed {
            self.timers.dispersion.start();
        }

        let mut passive = false;
        let mut searching = false;

        if !got_task && self.cfg.stealing_enabled {
            tracing::trace!(rank = self.ctx.rank(), "searching for work");

            self.timers.passive.start();
            self.timers.imbalance.reset_and_start();
            passive = true;
            self.counters.passive_count += 1;

            let mut vs = VsState {
                last_target: self.last_target,
                ..VsState::default()
            };

            // search until work arrives or the detector proves the end
            while !got_task && !self.terminated {
                self.state = TcState::Searching;
                if !searching {
                    self.timers.search.start();
                    searching = true;
                }

                let victim = self.select_target(&mut vs);

                // one remote probe per target visit
                self.timers.poptail.start();
                let avail = self.queue.poll_victim(victim);
                self.timers.poptail.stop();

                let max_attempts = self.cfg.max_steal_attempts_remote;
                let mut steal_done = false;

                let mut attempt = 0;
                while !steal_done && !self.terminated && attempt < max_attempts {
                    // linear back-off keeps us from flooding the victim
                    spin_wait(backoff::linear(
                        usize::try_from(attempt).expect("attempt fits"),
                        SPINCOUNT,
                    ));

                    if avail > 0 {
                        self.state = TcState::Stealing;
                        if searching {
                            self.timers.search.stop();
                            searching = false;
                        }

                        let outcome = if self.cfg.steals_can_abort {
                            self.try_steal_tail(victim)
                        } else {
                            self.steal_tail(victim)
                        };

                        match outcome {
                            Ok(stolen) => {
                                self.counters.tasks_stolen +=
                                    u64::try_from(stolen).expect("steal count fits");
                                self.counters.num_steals += 1;
                                steal_done = true;
                                self.last_target = victim;
                            }
                            Err(TryStealError::Empty) => {
                                // consistent look, no work left there
                                self.counters.failed_steals_locked += 1;
                                steal_done = true;
                            }
                            Err(TryStealError::Busy) => {
                                if attempt + 1 == max_attempts {
                                    self.counters.aborted_steals += 1;
                                }
                                vs.target_retry = true;
                            }
                        }
                    } else {
                        self.counters.failed_steals_unlocked += 1;
                        steal_done = true;
                    }

                    self.progress();

                    // still nothing anywhere we can see: cast a vote
                    if self.tasks_avail() == 0 && !self.external_work_avail {
                        self.td
                            .set_counters(self.counters.tasks_spawned, self.counters.tasks_completed);
                        self.terminated = self.td.attempt_vote();
                    } else {
                        steal_done = true;
                    }

                    attempt += 1;
                }

                if self.tasks_avail() > 0 {
                    got_task = self.get_local_buf(priority, task);
                }
            }
        } else if got_task {
            self.counters.getlocal += 1;
        }

        if passive {
            self.timers.passive.stop();
            self.timers.imbalance.stop();
        }
        if searching {
            self.timers.search.stop();
        }

        // first successful get ends the dispersion phase
        if !self.dispersed {
            self.timers.dispersion.stop();
            self.dispersed = true;
            self.counters.dispersion_attempts_unlocked = self.counters.failed_steals_unlocked;
            self.counters.dispersion_attempts_locked = self.counters.failed_steals_locked;
        }

        if got_task {
            self.state = TcState::Working;
        }
        self.timers.getbuf.stop();
        got_task
    }

    /// Log this rank's statistics.
    pub(crate) fn log_my_stats(&self) {
        let ct = &self.counters;
        let t = &self.timers;
        let q = self.queue.stats();

        tracing::info!(
            rank = self.ctx.rank(),
            completed = ct.tasks_completed,
            spawned = ct.tasks_spawned,
            stolen = ct.tasks_stolen,
            steals = ct.num_steals,
            steal_fails = ct.failed_steals_locked + ct.failed_steals_unlocked,
            aborted = ct.aborted_steals,
            "tasks"
        );
        tracing::info!(
            rank = self.ctx.rank(),
            process_s = t.process.secs(),
            passive_s = t.passive.secs(),
            search_s = t.search.secs(),
            dispersion_ms = t.dispersion.secs() * 1e3,
            imbalance_ms = t.imbalance.secs() * 1e3,
            passive_count = ct.passive_count,
            "time"
        );
        tracing::info!(
            rank = self.ctx.rank(),
            nrelease = q.nrelease,
            nreacquire = q.nreacquire,
            nreclaimed = q.nreclaimed,
            nwaited = q.nwaited,
            nprogress = q.nprogress,
            ngets = q.ngets,
            nxfer = q.nxfer,
            td_cycles = self.td.num_cycles(),
            "queue"
        );
    }

    pub(crate) fn ring_stats(&self) -> crate::stats::RingStats {
        *self.queue.stats()
    }
}

impl core::fmt::Debug for TaskCollection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskCollection")
            .field("rank", &self.ctx.rank())
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
