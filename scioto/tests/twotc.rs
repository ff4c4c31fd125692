// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Two interleaved task collections.
//!
//! A task tree whose children alternate between two collections: tasks
//! executed from A spawn into B and vice versa.  The collections are
//! processed round-robin until a whole round executes nothing, at which
//! point the full tree must have run.

use scioto::{ClodKey, Gtc, QueueKind, ReduceOp, Runtime, Task};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const NCHILDREN: u32 = 2;
const MAX_DEPTH: u32 = 10;
const BODY_SIZE: usize = 24;

#[derive(Clone, Copy)]
struct TreeTask {
    counter_key: ClodKey,
    level: u32,
    which_tc: u32,
    gtc_a: u32,
    gtc_b: u32,
}

impl TreeTask {
    fn write(self, body: &mut [u8]) {
        self.counter_key.write_to_body(body);
        body[8..12].copy_from_slice(&self.level.to_le_bytes());
        body[12..16].copy_from_slice(&self.which_tc.to_le_bytes());
        body[16..20].copy_from_slice(&self.gtc_a.to_le_bytes());
        body[20..24].copy_from_slice(&self.gtc_b.to_le_bytes());
    }

    fn read(body: &[u8]) -> Self {
        Self {
            counter_key: ClodKey::from_body(body),
            level: u32::from_le_bytes(body[8..12].try_into().unwrap()),
            which_tc: u32::from_le_bytes(body[12..16].try_into().unwrap()),
            gtc_a: u32::from_le_bytes(body[16..20].try_into().unwrap()),
            gtc_b: u32::from_le_bytes(body[20..24].try_into().unwrap()),
        }
    }

    fn target(&self) -> Gtc {
        let index = if self.which_tc == 0 {
            self.gtc_a
        } else {
            self.gtc_b
        };
        Gtc::from_index(usize::try_from(index).unwrap())
    }
}

/// Generate subtasks, alternating between the two collections.
fn task_fn(rt: &mut Runtime, gtc: Gtc, task: &mut Task) {
    let tt = TreeTask::read(task.body());
    let counter = rt.clo_lookup_as::<AtomicU64>(gtc, tt.counter_key);

    if tt.level < MAX_DEPTH {
        for i in 0..NCHILDREN {
            let child = TreeTask {
                level: tt.level + 1,
                which_tc: i % 2,
                ..tt
            };
            child.write(task.body_mut());
            rt.add(child.target(), task, rt.rank());
        }
    }

    counter.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn two_collections_interleave() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();

    shmem::run(4, 1 << 17, |ctx| {
        let mut rt = Runtime::init(ctx);
        let class = rt.task_class_register(BODY_SIZE, task_fn);
        let gtc_a = rt.create(None, 10, 4096, None, QueueKind::Sdc);
        let gtc_b = rt.create(None, 10, 4096, None, QueueKind::Sdc);

        let counter = Arc::new(AtomicU64::new(0));
        let key_a = rt.clo_associate(gtc_a, counter.clone());
        let key_b = rt.clo_associate(gtc_b, counter.clone());
        assert_eq!(key_a, key_b);

        if rt.rank() == 0 {
            let mut task = rt.task_create(class);
            TreeTask {
                counter_key: key_a,
                level: 0,
                which_tc: 0,
                gtc_a: u32::try_from(gtc_a.index()).unwrap(),
                gtc_b: u32::try_from(gtc_b.index()).unwrap(),
            }
            .write(task.body_mut());
            rt.add(gtc_a, &mut task, rt.rank());
            rt.task_destroy(task);
        }

        // alternate until a full round executes nothing
        let mut total = 0u64;
        loop {
            counter.store(0, Ordering::Relaxed);

            rt.process(gtc_a);
            rt.reset(gtc_a);
            rt.process(gtc_b);
            rt.reset(gtc_b);

            let this_iter = rt.reduce(&[counter.load(Ordering::Relaxed)], ReduceOp::Sum)[0];
            total += this_iter;
            if this_iter == 0 {
                break;
            }
        }

        assert_eq!(total, (1u64 << (MAX_DEPTH + 1)) - 1);

        rt.destroy(gtc_b);
        rt.destroy(gtc_a);
    });
}
