// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scioto: a distributed task-parallel runtime for bulk-synchronous jobs.
//!
//! A program launches N cooperating ranks, registers task classes
//! collectively, enqueues tasks into a distributed collection, and then
//! collectively drains the collection with [`Runtime::process`] until a
//! tree-shaped termination detector proves there is no work anywhere.
//!
//! Load is balanced exclusively by *pulling*: each rank owns a split ring
//! buffer whose head side is private and whose tail side is stealable by
//! any other rank through one-sided remote operations.  Two queue
//! algorithms are provided behind one dispatch surface:
//!
//! * [`QueueKind::Sdc`] -- split deferred-copy, a remote spinlock guards
//!   the shared side and thieves drop the lock before copying payload;
//! * [`QueueKind::Saws`] -- lock-free, all shared state a thief needs
//!   rides in a single 64-bit atomic word with epoched completion vectors.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! fn hello(rt: &mut scioto::Runtime, gtc: scioto::Gtc, task: &mut scioto::Task) {
//!     let counter = rt.clo_lookup_as::<AtomicU64>(gtc, scioto::ClodKey::from_body(task.body()));
//!     counter.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! shmem::run(4, 1 << 20, |ctx| {
//!     let mut rt = scioto::Runtime::init(ctx);
//!     let class = rt.task_class_register(8, hello);
//!     let gtc = rt.create(None, 1, 1000, None, scioto::QueueKind::Saws);
//!     let key = rt.clo_associate(gtc, Arc::new(AtomicU64::new(0)));
//!     if rt.rank() == 0 {
//!         let mut task = rt.task_create(class);
//!         key.write_to_body(task.body_mut());
//!         rt.add(gtc, &mut task, rt.rank());
//!         rt.task_destroy(task);
//!     }
//!     rt.process(gtc);
//! });
//! ```

mod backoff;
mod clod;
mod collection;
mod config;
mod error;
mod mutex;
mod queue;
mod runtime;
mod stats;
mod task;
mod termination;

pub use clod::ClodKey;
pub use config::{LdbalCfg, QueueKind, StealMethod, TargetSelection};
pub use error::TryStealError;
pub use runtime::{Gtc, Runtime};
pub use shmem::{Ctx, Domain, ReduceOp};
pub use task::{ExecuteFn, Task, TaskClass};
