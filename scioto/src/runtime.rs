// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-rank process context: handle table, class registry, and the
//! public face of the runtime.
//!
//! There are no hidden singletons; everything a task callback can touch
//! is threaded through the `&mut Runtime` it receives.

use crate::clod::ClodKey;
use crate::collection::{TaskCollection, TcState};
use crate::config::{LdbalCfg, QueueKind};
use crate::stats::StatsCfg;
use crate::task::{ClassRegistry, ExecuteFn, Task, TaskClass};
use shmem::{Ctx, ReduceOp, Reducible};
use std::any::Any;
use std::sync::Arc;

/// Open task collections per process.
const MAX_TC: usize = 10;

/// A portable handle to an open task collection.
///
/// Handles are created collectively in the same order on every rank, so
/// the same handle names the same collection everywhere (and may travel
/// in task bodies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtc(usize);

// === impl Gtc ===

impl Gtc {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }

    /// Rebuild a handle from its index (e.g. out of a task body).  The
    /// handle is validated on first use.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Gtc(index)
    }
}

/// One rank's runtime: rank/size, the open-collection table, and the
/// task class registry.
pub struct Runtime {
    ctx: Ctx,
    tcs: Vec<Option<TaskCollection>>,
    total_tcs: usize,
    classes: ClassRegistry,
    stats_cfg: StatsCfg,
}

// === impl Runtime ===

impl Runtime {
    /// Initialize the runtime on an attached rank.  Collective.
    #[must_use]
    pub fn init(ctx: Ctx) -> Self {
        let rt = Self {
            ctx,
            tcs: (0..MAX_TC).map(|_| None).collect(),
            total_tcs: 0,
            classes: ClassRegistry::default(),
            stats_cfg: StatsCfg::from_env(),
        };
        tracing::debug!(rank = rt.ctx.rank(), size = rt.ctx.num_ranks(), "runtime up");
        rt.barrier();
        rt
    }

    /// Tear down.  Collective; open collections are dropped.
    pub fn fini(mut self) {
        self.barrier();
        self.tcs.clear();
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.ctx.rank()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.ctx.num_ranks()
    }

    pub fn barrier(&self) {
        self.ctx.barrier();
    }

    #[must_use]
    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    fn tc(&self, gtc: Gtc) -> &TaskCollection {
        self.tcs
            .get(gtc.index())
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("invalid task collection handle {}", gtc.index()))
    }

    fn tc_mut(&mut self, gtc: Gtc) -> &mut TaskCollection {
        self.tcs
            .get_mut(gtc.index())
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("invalid task collection handle {}", gtc.index()))
    }

    // --- collection lifecycle ---

    /// Create a task collection.  Collective.
    ///
    /// `max_body` of `None` sizes the queue for the largest registered
    /// task class.  `chunk_size` seeds the default load-balancer config
    /// when `cfg` is `None`.
    pub fn create(
        &mut self,
        max_body: Option<usize>,
        chunk_size: usize,
        capacity: usize,
        cfg: Option<LdbalCfg>,
        qtype: QueueKind,
    ) -> Gtc {
        let cfg = cfg.unwrap_or_else(|| LdbalCfg {
            chunk_size: chunk_size.max(1),
            ..LdbalCfg::default()
        });
        let max_body = max_body.unwrap_or_else(|| self.classes.largest_body_size());

        let tc = TaskCollection::create(self.ctx.clone(), max_body, capacity, cfg, qtype);

        let slot = self
            .tcs
            .iter()
            .position(Option::is_none)
            .expect("task collection table is full");
        self.tcs[slot] = Some(tc);
        self.total_tcs += 1;

        tracing::debug!(rank = self.rank(), handle = slot, "task collection created");
        Gtc(slot)
    }

    /// Destroy a collection and release its handle.  Collective.
    pub fn destroy(&mut self, gtc: Gtc) {
        // validate before releasing the slot
        let _ = self.tc(gtc);
        self.tcs[gtc.index()] = None;
        self.total_tcs -= 1;
        self.barrier();
    }

    /// Reset a collection for reuse, dropping any leftover tasks.
    /// Collective.
    pub fn reset(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).reset();
    }

    #[must_use]
    pub fn queue_name(&self, gtc: Gtc) -> &'static str {
        self.tc(gtc).queue_name()
    }

    /// Log this collection's configuration.
    pub fn print_config(&self, gtc: Gtc) {
        let tc = self.tc(gtc);
        let cfg = tc.cfg();
        tracing::info!(
            handle = gtc.index(),
            queue = tc.queue_name(),
            stealing = cfg.stealing_enabled,
            target_selection = ?cfg.target_selection,
            steal_method = ?cfg.steal_method,
            chunk = cfg.chunk_size,
            aborting = cfg.steals_can_abort,
            "task collection config"
        );
    }

    pub fn ldbal_cfg(&self, gtc: Gtc) -> LdbalCfg {
        self.tc(gtc).cfg().clone()
    }

    pub fn set_ldbal_cfg(&mut self, gtc: Gtc, cfg: LdbalCfg) {
        self.tc_mut(gtc).set_cfg(cfg);
    }

    // --- task classes and descriptors ---

    /// Register a task class.  Collective: every rank must register the
    /// same classes in the same order.
    pub fn task_class_register(&mut self, body_size: usize, execute: ExecuteFn) -> TaskClass {
        self.classes.register(body_size, execute)
    }

    #[must_use]
    pub fn task_create(&mut self, class: TaskClass) -> Task {
        self.classes.create(class)
    }

    pub fn task_destroy(&mut self, task: Task) {
        self.classes.destroy(task);
    }

    #[must_use]
    pub fn task_body_size(&self, class: TaskClass) -> usize {
        self.classes.lookup(class).body_size
    }

    #[must_use]
    pub fn task_class_largest_body_size(&self) -> usize {
        self.classes.largest_body_size()
    }

    // --- adding work ---

    /// Copy `task` into the collection.  Local only: `proc` must be the
    /// calling rank (pushing work to peers is disabled by design).
    pub fn add(&mut self, gtc: Gtc, task: &mut Task, proc: usize) {
        self.tc_mut(gtc).add(task, proc);
    }

    /// Create a task of `class` in place at the queue head; `fill`
    /// writes the body directly into the slot.
    ///
    /// Do not interleave other queue operations between in-place
    /// creations and [`Runtime::task_inplace_create_and_add_finish`].
    pub fn task_inplace_create_and_add<F>(&mut self, gtc: Gtc, class: TaskClass, fill: F)
    where
        F: FnOnce(&mut [u8]),
    {
        let body_size = self.classes.lookup(class).body_size;
        self.tc_mut(gtc).add_inplace(class, body_size, fill);
    }

    /// Complete outstanding in-place creations.
    pub fn task_inplace_create_and_add_finish(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).add_inplace_finish();
    }

    // --- getting and running work ---

    /// Head-only local pop; never steals, a miss does not imply global
    /// termination.
    pub fn get_local_buf(&mut self, gtc: Gtc, priority: i32, task: &mut Task) -> bool {
        self.tc_mut(gtc).get_local_buf(priority, task)
    }

    /// Run one task's class callback and count the completion.
    pub fn execute(&mut self, gtc: Gtc, task: &mut Task) {
        let execute = self.classes.lookup(task.class()).execute;
        execute(self, gtc, task);
        self.tc_mut(gtc).counters.tasks_completed += 1;
    }

    /// Collectively drain the collection: get work (locally or by
    /// stealing), execute it, repeat until global termination.
    pub fn process(&mut self, gtc: Gtc) {
        self.barrier();
        {
            let tc = self.tc_mut(gtc);
            tc.timers.process.start();
            tc.set_state(TcState::Searching);
        }
        tracing::debug!(rank = self.rank(), handle = gtc.index(), "processing");

        let mut xtask = Task::placeholder();
        loop {
            let tc = self.tc_mut(gtc);
            if !tc.get_buf(0, &mut xtask) {
                break;
            }
            self.execute(gtc, &mut xtask);
        }

        let tc = self.tc_mut(gtc);
        tc.set_state(TcState::Terminated);
        tc.timers.process.stop();
        assert_eq!(tc.tasks_avail(), 0, "terminated with work on hand");
    }

    /// Approximate number of tasks in the local queue.
    #[must_use]
    pub fn tasks_avail(&self, gtc: Gtc) -> usize {
        self.tc(gtc).tasks_avail()
    }

    pub fn enable_stealing(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).enable_stealing();
    }

    pub fn disable_stealing(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).disable_stealing();
    }

    /// Flag work that lives outside the collection so termination holds
    /// off until it is gone.
    pub fn set_external_work_avail(&mut self, gtc: Gtc, avail: bool) {
        self.tc_mut(gtc).set_external_work_avail(avail);
    }

    /// Publish this rank's whole local region for stealing.
    pub fn release_all(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).release_all();
    }

    /// Invoke the progress engine by hand.
    pub fn progress(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).progress();
    }

    // --- common local objects ---

    /// Collectively allocate a key and bind this rank's replica of the
    /// object to it.
    pub fn clo_associate(&mut self, gtc: Gtc, obj: Arc<dyn Any + Send + Sync>) -> ClodKey {
        let tc = self.tc_mut(gtc);
        let key = tc.clod.nextfree();
        tc.clod.assign(key, obj);
        key
    }

    /// Rebind `key` to a different local object.
    pub fn clo_assign(&mut self, gtc: Gtc, key: ClodKey, obj: Arc<dyn Any + Send + Sync>) {
        self.tc_mut(gtc).clod.assign(key, obj);
    }

    #[must_use]
    pub fn clo_lookup(&self, gtc: Gtc, key: ClodKey) -> Arc<dyn Any + Send + Sync> {
        self.tc(gtc).clod.lookup(key)
    }

    /// Typed lookup.
    ///
    /// # Panics
    ///
    /// Panics when the stored object is not a `T`.
    #[must_use]
    pub fn clo_lookup_as<T: Any + Send + Sync>(&self, gtc: Gtc, key: ClodKey) -> Arc<T> {
        self.clo_lookup(gtc, key)
            .downcast()
            .unwrap_or_else(|_| panic!("clod object has a different type"))
    }

    /// Reset the directory for reuse.  Collective.
    pub fn clo_reset(&mut self, gtc: Gtc) {
        self.tc_mut(gtc).clod.reset();
    }

    // --- collectives and statistics ---

    /// Typed allreduce over all ranks.
    #[must_use]
    pub fn reduce<T: Reducible>(&self, input: &[T], op: ReduceOp) -> Vec<T> {
        self.ctx.reduce(input, op)
    }

    #[must_use]
    pub fn stats_tasks_completed(&self, gtc: Gtc) -> u64 {
        self.tc(gtc).counters.tasks_completed
    }

    #[must_use]
    pub fn stats_tasks_spawned(&self, gtc: Gtc) -> u64 {
        self.tc(gtc).counters.tasks_spawned
    }

    /// Log per-rank and reduced global statistics.  Collective.
    ///
    /// Controlled by `SCIOTO_DISABLE_STATS`, `SCIOTO_DISABLE_PERNODE_STATS`,
    /// `SCIOTO_EXTENDED_STATS` and `SCIOTO_UNORDERED_STATS`.
    pub fn print_stats(&self, gtc: Gtc) {
        if self.stats_cfg.disabled {
            return;
        }
        self.barrier();

        if !self.stats_cfg.pernode_disabled {
            if self.stats_cfg.unordered {
                self.tc(gtc).log_my_stats();
            } else {
                for rank in 0..self.size() {
                    if rank == self.rank() {
                        self.tc(gtc).log_my_stats();
                    }
                    self.barrier();
                }
            }
        }

        let tc = self.tc(gtc);
        let times = [
            tc.timers.process.secs(),
            tc.timers.passive.secs(),
            tc.timers.search.secs(),
            tc.timers.dispersion.secs(),
            tc.timers.imbalance.secs(),
        ];
        let counts = [
            tc.counters.tasks_completed,
            tc.counters.tasks_stolen,
            tc.counters.num_steals,
            tc.counters.dispersion_attempts_locked + tc.counters.dispersion_attempts_unlocked,
        ];

        let sum_times = self.reduce(&times, ReduceOp::Sum);
        let max_times = self.reduce(&times, ReduceOp::Max);
        let min_times = self.reduce(&times, ReduceOp::Min);
        let sum_counts = self.reduce(&counts, ReduceOp::Sum);

        if self.rank() == 0 {
            let n = f64::from(u32::try_from(self.size()).expect("size fits"));
            let process_avg = sum_times[0] / n;
            tracing::info!(
                queue = tc.queue_name(),
                process_s = process_avg,
                passive_s = sum_times[1] / n,
                search_s = sum_times[2] / n,
                worst_dispersion_ms = max_times[3] * 1e3,
                worst_imbalance_ms = max_times[4] * 1e3,
                best_imbalance_ms = min_times[4] * 1e3,
                "collection summary"
            );
            let completed = sum_counts[0];
            let rate = if process_avg > 0.0 {
                #[expect(clippy::cast_precision_loss, reason = "display only")]
                let c = completed as f64;
                c / process_avg
            } else {
                0.0
            };
            tracing::info!(
                completed,
                stolen = sum_counts[1],
                steals = sum_counts[2],
                dispersion_attempts = sum_counts[3],
                tasks_per_sec = rate,
                "work summary"
            );
        }

        if self.stats_cfg.extended {
            let q = tc.ring_stats();
            let qcounts = [q.ngets, q.nxfer, q.nrelease, q.nreacquire, q.nreclaimed];
            let qsum = self.reduce(&qcounts, ReduceOp::Sum);
            let qmax = self.reduce(&qcounts, ReduceOp::Max);
            if self.rank() == 0 {
                tracing::info!(
                    gets = qsum[0],
                    gets_max = qmax[0],
                    xfer_words = qsum[1],
                    releases = qsum[2],
                    reacquires = qsum[3],
                    reclaims = qsum[4],
                    "queue summary"
                );
            }
        }

        self.barrier();
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.ctx.rank())
            .field("size", &self.ctx.num_ranks())
            .field("open_tcs", &self.total_tcs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clod::ClodKey;
    use crate::config::QueueKind;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn bump(rt: &mut Runtime, gtc: Gtc, task: &mut Task) {
        let counter = rt.clo_lookup_as::<AtomicU64>(gtc, ClodKey::from_body(task.body()));
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn handles_are_dense_and_reused() {
        shmem::run(1, 1 << 16, |ctx| {
            let mut rt = Runtime::init(ctx);
            let a = rt.create(Some(8), 1, 64, None, QueueKind::Sdc);
            let b = rt.create(Some(8), 1, 64, None, QueueKind::Saws);
            assert_eq!(a.index(), 0);
            assert_eq!(b.index(), 1);

            rt.destroy(a);
            let c = rt.create(Some(8), 1, 64, None, QueueKind::Saws);
            assert_eq!(c.index(), 0);
        });
    }

    #[test]
    fn auto_body_size_fits_the_largest_class() {
        shmem::run(1, 1 << 16, |ctx| {
            let mut rt = Runtime::init(ctx);
            rt.task_class_register(8, bump);
            let wide = rt.task_class_register(48, bump);
            let gtc = rt.create(None, 1, 64, None, QueueKind::Saws);

            // a task of the widest class must be addable
            let counter = Arc::new(AtomicU64::new(0));
            let key = rt.clo_associate(gtc, counter);
            let mut task = rt.task_create(wide);
            key.write_to_body(task.body_mut());
            rt.add(gtc, &mut task, 0);
            rt.task_destroy(task);
            assert_eq!(rt.tasks_avail(gtc), 1);
        });
    }

    #[test]
    fn local_get_returns_lifo_and_misses_when_dry() {
        shmem::run(1, 1 << 16, |ctx| {
            let mut rt = Runtime::init(ctx);
            let class = rt.task_class_register(8, bump);
            let gtc = rt.create(None, 1, 64, None, QueueKind::Sdc);

            let counter = Arc::new(AtomicU64::new(0));
            let key = rt.clo_associate(gtc, counter.clone());

            let mut task = rt.task_create(class);
            key.write_to_body(task.body_mut());
            for prio in 0..3 {
                task.set_priority(prio);
                rt.add(gtc, &mut task, 0);
            }
            rt.task_destroy(task);

            let mut out = Task::placeholder();
            for expected in (0..3).rev() {
                assert!(rt.get_local_buf(gtc, 0, &mut out));
                assert_eq!(out.priority(), expected);
                assert_eq!(out.created_by(), 0);
                rt.execute(gtc, &mut out);
            }
            // a miss here says nothing about global termination
            assert!(!rt.get_local_buf(gtc, 0, &mut out));

            assert_eq!(counter.load(Ordering::Relaxed), 3);
            assert_eq!(rt.stats_tasks_completed(gtc), 3);
        });
    }

    #[test]
    fn inplace_create_lands_at_the_head() {
        shmem::run(1, 1 << 16, |ctx| {
            let mut rt = Runtime::init(ctx);
            let class = rt.task_class_register(16, bump);
            let gtc = rt.create(None, 1, 64, None, QueueKind::Saws);

            let counter = Arc::new(AtomicU64::new(0));
            let key = rt.clo_associate(gtc, counter);

            rt.task_inplace_create_and_add(gtc, class, |body| {
                key.write_to_body(body);
                body[8] = 0xEE;
            });
            rt.task_inplace_create_and_add_finish(gtc);

            let mut out = Task::placeholder();
            assert!(rt.get_local_buf(gtc, 0, &mut out));
            assert_eq!(out.class(), class);
            assert_eq!(out.body()[8], 0xEE);
            assert_eq!(rt.stats_tasks_spawned(gtc), 1);
        });
    }

    #[test]
    #[should_panic(expected = "remote task pushes are disabled")]
    fn remote_add_is_rejected() {
        shmem::run(1, 1 << 16, |ctx| {
            let mut rt = Runtime::init(ctx);
            let class = rt.task_class_register(8, bump);
            let gtc = rt.create(None, 1, 64, None, QueueKind::Sdc);
            let mut task = rt.task_create(class);
            rt.add(gtc, &mut task, 5);
        });
    }

    #[test]
    #[should_panic(expected = "invalid task collection handle")]
    fn stale_handles_are_caught() {
        shmem::run(1, 1 << 16, |ctx| {
            let mut rt = Runtime::init(ctx);
            let gtc = rt.create(Some(8), 1, 64, None, QueueKind::Sdc);
            rt.destroy(gtc);
            let _ = rt.tasks_avail(gtc);
        });
    }
}
