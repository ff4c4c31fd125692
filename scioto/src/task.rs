// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task descriptors, task classes, and the fixed-width slot format tasks
//! travel in inside the rings.

use crate::runtime::{Gtc, Runtime};

/// Hard cap on registered task classes per process.
pub(crate) const MAX_TASK_CLASSES: usize = 10;

/// Words of header preceding the body in a ring slot.
pub(crate) const SLOT_HEADER_WORDS: usize = 2;

/// A dense, portable task class id.  All ranks register the same classes
/// in the same order, so the id is valid everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskClass(pub(crate) usize);

/// Execution callback of a task class.
///
/// The callback may add tasks, create them in place, and look up common
/// local objects; it must not block on foreign communication, which would
/// stall termination detection.
pub type ExecuteFn = fn(&mut Runtime, Gtc, &mut Task);

/// A task descriptor: fixed header plus an opaque body.
#[derive(Debug, Clone)]
pub struct Task {
    class: TaskClass,
    created_by: usize,
    priority: i32,
    body: Vec<u8>,
}

// === impl Task ===

impl Task {
    pub(crate) fn new(class: TaskClass, body_size: usize) -> Self {
        Self {
            class,
            created_by: 0,
            priority: 0,
            body: vec![0; body_size],
        }
    }

    /// An empty descriptor used as a receive buffer; `decode_slot` sizes
    /// the body.
    pub(crate) fn placeholder() -> Self {
        Self::new(TaskClass(0), 0)
    }

    #[must_use]
    pub fn class(&self) -> TaskClass {
        self.class
    }

    pub fn set_class(&mut self, class: TaskClass) {
        self.class = class;
    }

    /// Rank that created this task.
    #[must_use]
    pub fn created_by(&self) -> usize {
        self.created_by
    }

    pub(crate) fn set_created_by(&mut self, rank: usize) {
        self.created_by = rank;
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.body
    }

    /// Clear header state for reuse.  Leftover body bytes are kept.
    pub fn reuse(&mut self) {
        self.priority = 0;
    }

    pub(crate) fn resize_body(&mut self, len: usize) {
        self.body.resize(len, 0);
    }
}

/// Descriptor of a registered task class.
pub(crate) struct ClassDesc {
    pub(crate) body_size: usize,
    pub(crate) execute: ExecuteFn,
    /// One-entry pool so create/add/destroy cycles skip the allocator.
    pool: Option<Task>,
}

impl core::fmt::Debug for ClassDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClassDesc")
            .field("body_size", &self.body_size)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// Per-process registry of task classes.
#[derive(Debug, Default)]
pub(crate) struct ClassRegistry {
    classes: Vec<ClassDesc>,
}

// === impl ClassRegistry ===

impl ClassRegistry {
    /// Append a class.  Collective: every rank registers the same classes
    /// in the same order.
    ///
    /// # Panics
    ///
    /// Panics when the registry is full.
    pub(crate) fn register(&mut self, body_size: usize, execute: ExecuteFn) -> TaskClass {
        assert!(
            self.classes.len() < MAX_TASK_CLASSES,
            "task class registry is full"
        );
        let id = TaskClass(self.classes.len());
        self.classes.push(ClassDesc {
            body_size,
            execute,
            pool: None,
        });
        tracing::debug!(class = id.0, body_size, "registered task class");
        id
    }

    /// # Panics
    ///
    /// Panics on an unregistered class id.
    pub(crate) fn lookup(&self, class: TaskClass) -> &ClassDesc {
        assert!(class.0 < self.classes.len(), "invalid task class {}", class.0);
        &self.classes[class.0]
    }

    /// Largest body size over all registered classes.
    ///
    /// # Panics
    ///
    /// Panics if no classes are registered yet.
    pub(crate) fn largest_body_size(&self) -> usize {
        assert!(!self.classes.is_empty(), "no task classes registered");
        self.classes.iter().map(|c| c.body_size).max().unwrap()
    }

    /// Create a descriptor of `class`, reusing the pooled one if present.
    pub(crate) fn create(&mut self, class: TaskClass) -> Task {
        assert!(class.0 < self.classes.len(), "invalid task class {}", class.0);
        let desc = &mut self.classes[class.0];
        match desc.pool.take() {
            Some(mut task) => {
                task.reuse();
                task.set_class(class);
                task
            }
            None => Task::new(class, desc.body_size),
        }
    }

    /// Retire a descriptor; kept in the class pool when there is room.
    pub(crate) fn destroy(&mut self, task: Task) {
        let desc = &mut self.classes[task.class().0];
        if desc.pool.is_none() {
            desc.pool = Some(task);
        }
    }
}

/// Ring slot width in words for a queue with `max_body` byte bodies.
pub(crate) fn slot_words(max_body: usize) -> usize {
    SLOT_HEADER_WORDS + max_body.div_ceil(8)
}

/// Serialize `task` into a ring slot.
///
/// Layout: word 0 holds `class | created_by`, word 1 holds
/// `priority | body_len`, the body rides little-endian in the rest.
///
/// # Panics
///
/// Panics if the slot is too small for the body.
pub(crate) fn encode_slot(task: &Task, dst: &mut [u64]) {
    let body = task.body();
    let body_words = body.len().div_ceil(8);
    assert!(
        SLOT_HEADER_WORDS + body_words <= dst.len(),
        "task body of {} bytes does not fit the slot",
        body.len()
    );

    let class = u64::try_from(task.class().0).expect("class id fits");
    let creator = u64::try_from(task.created_by()).expect("rank fits");
    dst[0] = (class << 32) | creator;

    let prio = u64::from(task.priority().cast_unsigned());
    let len = u64::try_from(body.len()).expect("body length fits");
    dst[1] = (prio << 32) | len;

    for (i, chunk) in body.chunks(8).enumerate() {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        dst[SLOT_HEADER_WORDS + i] = u64::from_le_bytes(word);
    }
}

/// Deserialize a ring slot into `task`, resizing its body.
pub(crate) fn decode_slot(src: &[u64], task: &mut Task) {
    let class = usize::try_from(src[0] >> 32).expect("class id fits");
    let creator = usize::try_from(src[0] & 0xFFFF_FFFF).expect("rank fits");
    let prio = u32::try_from(src[1] >> 32).expect("priority fits").cast_signed();
    let len = usize::try_from(src[1] & 0xFFFF_FFFF).expect("body length fits");

    task.set_class(TaskClass(class));
    task.set_created_by(creator);
    task.set_priority(prio);
    task.resize_body(len);

    let body = task.body_mut();
    for (i, chunk) in body.chunks_mut(8).enumerate() {
        let word = src[SLOT_HEADER_WORDS + i].to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Runtime, _: Gtc, _: &mut Task) {}

    #[test]
    fn registry_assigns_dense_ids() {
        let mut reg = ClassRegistry::default();
        assert_eq!(reg.register(16, noop), TaskClass(0));
        assert_eq!(reg.register(64, noop), TaskClass(1));
        assert_eq!(reg.largest_body_size(), 64);
        assert_eq!(reg.lookup(TaskClass(0)).body_size, 16);
    }

    #[test]
    fn pool_recycles_one_descriptor() {
        let mut reg = ClassRegistry::default();
        let class = reg.register(8, noop);

        let mut task = reg.create(class);
        task.set_priority(3);
        task.body_mut()[0] = 0xAB;
        reg.destroy(task);

        // reuse clears stats but not the body
        let task = reg.create(class);
        assert_eq!(task.priority(), 0);
        assert_eq!(task.body()[0], 0xAB);
    }

    #[test]
    #[should_panic(expected = "invalid task class")]
    fn lookup_of_bogus_class_panics() {
        let reg = ClassRegistry::default();
        reg.lookup(TaskClass(3));
    }

    #[test]
    fn slot_roundtrip_preserves_the_descriptor() {
        let mut task = Task::new(TaskClass(2), 11);
        task.set_created_by(7);
        task.set_priority(-4);
        task.body_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);

        let mut slot = vec![0u64; slot_words(16)];
        encode_slot(&task, &mut slot);

        let mut out = Task::placeholder();
        decode_slot(&slot, &mut out);

        assert_eq!(out.class(), TaskClass(2));
        assert_eq!(out.created_by(), 7);
        assert_eq!(out.priority(), -4);
        assert_eq!(out.body(), task.body());
    }
}
