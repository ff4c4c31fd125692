// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Common local object directory.
//!
//! Keys are allocated collectively (every rank advances `nextfree` in
//! lock-step), so the same [`ClodKey`] names the same *logical* replicated
//! object on every rank, while the stored handle is rank-local.

use std::any::Any;
use std::sync::Arc;

/// A portable key into every rank's local object directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClodKey(pub(crate) usize);

// === impl ClodKey ===

impl ClodKey {
    /// Serialize the key into the leading 8 bytes of a task body.
    ///
    /// # Panics
    ///
    /// Panics if `body` is shorter than 8 bytes.
    pub fn write_to_body(self, body: &mut [u8]) {
        let raw = u64::try_from(self.0).expect("clod key fits in a word");
        body[..8].copy_from_slice(&raw.to_le_bytes());
    }

    /// Recover a key previously stored with [`ClodKey::write_to_body`].
    ///
    /// # Panics
    ///
    /// Panics if `body` is shorter than 8 bytes.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&body[..8]);
        let idx = usize::try_from(u64::from_le_bytes(raw)).expect("clod key fits in usize");
        ClodKey(idx)
    }
}

/// One rank's directory of local object handles.
pub(crate) struct Clod {
    objects: Vec<Option<Arc<dyn Any + Send + Sync>>>,
    nextfree: usize,
}

// === impl Clod ===

impl Clod {
    /// Create a directory of `capacity` slots.  Collective.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            objects: vec![None; capacity],
            nextfree: 0,
        }
    }

    /// Allocate the next key.  Collective: every rank must call in the
    /// same order so keys align across ranks.
    ///
    /// # Panics
    ///
    /// Panics when the directory is full.
    pub(crate) fn nextfree(&mut self) -> ClodKey {
        assert!(
            self.nextfree < self.objects.len(),
            "clod is full ({} entries)",
            self.objects.len()
        );
        let key = ClodKey(self.nextfree);
        self.nextfree += 1;
        key
    }

    /// Bind `key` to a rank-local object handle.
    ///
    /// # Panics
    ///
    /// Panics if `key` was never allocated.
    pub(crate) fn assign(&mut self, key: ClodKey, obj: Arc<dyn Any + Send + Sync>) {
        assert!(key.0 < self.nextfree, "clod key {} not allocated", key.0);
        self.objects[key.0] = Some(obj);
    }

    /// Look up the local handle bound to `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` was never allocated or never assigned on this rank.
    pub(crate) fn lookup(&self, key: ClodKey) -> Arc<dyn Any + Send + Sync> {
        assert!(key.0 < self.nextfree, "clod key {} not allocated", key.0);
        self.objects[key.0]
            .as_ref()
            .unwrap_or_else(|| panic!("clod key {} has no local object", key.0))
            .clone()
    }

    /// Reset the directory for reuse.  Collective.
    pub(crate) fn reset(&mut self) {
        self.objects.fill(None);
        self.nextfree = 0;
    }
}

impl core::fmt::Debug for Clod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Clod")
            .field("capacity", &self.objects.len())
            .field("nextfree", &self.nextfree)
            .finish()
    }
}
