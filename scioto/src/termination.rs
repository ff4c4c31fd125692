// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tree-based termination detection.
//!
//! Ranks form a complete binary tree.  A token carries two counters,
//! tasks spawned and tasks completed.  Leaves vote their counters up the
//! tree; interior nodes merge and forward; the root compares the reduced
//! pair against the previous cycle's.  Two consecutive identical rounds
//! with `spawned == completed` prove quiescence was not transient, and a
//! TERMINATED token is broadcast back down.
//!
//! Token slots live in symmetric memory and are written only by their
//! designated sender: the body rides a non-blocking put, the valid flag
//! is set last with an atomic so a receiver never reads a torn token.

use shmem::{Ctx, SymAddr};

// per-rank token slots, 4 words each: [valid, state, spawned, completed]
const SLOT_WORDS: usize = 4;
const SLOT_PARENT: usize = 0;
const SLOT_LEFT: usize = 1;
const SLOT_RIGHT: usize = 2;

const STATE_ACTIVE: u64 = 0;
const STATE_TERMINATED: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    state: TokenState,
    spawned: u64,
    completed: u64,
}

// === impl Token ===

impl Token {
    fn zero() -> Self {
        Self {
            state: TokenState::Active,
            spawned: 0,
            completed: 0,
        }
    }

    fn state_word(self) -> u64 {
        match self.state {
            TokenState::Active => STATE_ACTIVE,
            TokenState::Terminated => STATE_TERMINATED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Per-rank termination detection state.
pub(crate) struct TerminationDetector {
    ctx: Ctx,
    base: SymAddr,
    procid: usize,
    nproc: usize,
    token: Token,
    direction: Direction,
    have_voted: bool,
    num_cycles: u64,
    last_spawned: u64,
    last_completed: u64,
}

// === impl TerminationDetector ===

impl TerminationDetector {
    /// Allocate the token slots and prime the tree.  Collective.
    pub(crate) fn create(ctx: Ctx) -> Self {
        let base = ctx.alloc(3 * SLOT_WORDS);
        let procid = ctx.rank();
        let nproc = ctx.num_ranks();
        let mut td = Self {
            ctx,
            base,
            procid,
            nproc,
            token: Token::zero(),
            direction: Direction::Up,
            have_voted: false,
            num_cycles: 0,
            last_spawned: 0,
            last_completed: 0,
        };
        td.reset();
        td
    }

    fn parent(&self) -> Option<usize> {
        (self.procid > 0).then(|| (self.procid - 1) / 2)
    }

    fn left_child(&self) -> Option<usize> {
        let child = 2 * self.procid + 1;
        (child < self.nproc).then_some(child)
    }

    fn right_child(&self) -> Option<usize> {
        let child = 2 * self.procid + 2;
        (child < self.nproc).then_some(child)
    }

    fn is_leaf(&self) -> bool {
        self.left_child().is_none() && self.right_child().is_none()
    }

    fn slot_addr(&self, slot: usize) -> SymAddr {
        self.base.offset(slot * SLOT_WORDS)
    }

    /// Deliver `token` into `slot` on `rank`.  Body first, valid flag
    /// last.
    fn send(&self, rank: usize, slot: usize, token: Token) {
        let addr = self.slot_addr(slot);
        self.ctx.put_nbi(
            rank,
            addr.offset(1),
            &[token.state_word(), token.spawned, token.completed],
        );
        self.ctx.quiet();
        self.ctx.atomic_set(rank, addr, 1);
    }

    /// Non-blocking poll of a local slot; consumes the token if present.
    fn try_take(&self, slot: usize) -> Option<Token> {
        let addr = self.slot_addr(slot);
        if self.ctx.atomic_fetch(self.procid, addr) == 0 {
            return None;
        }
        let mut body = [0u64; 3];
        self.ctx.get(self.procid, addr.offset(1), &mut body);
        self.ctx.atomic_set(self.procid, addr, 0);
        Some(Token {
            state: if body[0] == STATE_TERMINATED {
                TokenState::Terminated
            } else {
                TokenState::Active
            },
            spawned: body[1],
            completed: body[2],
        })
    }

    fn peek(&self, slot: usize) -> bool {
        self.ctx.atomic_fetch(self.procid, self.slot_addr(slot)) != 0
    }

    fn pass_up(&self, token: Token) {
        if let Some(parent) = self.parent() {
            let slot = if parent * 2 + 1 == self.procid {
                SLOT_LEFT
            } else {
                SLOT_RIGHT
            };
            self.send(parent, slot, token);
        }
    }

    fn pass_down(&self, token: Token) {
        if let Some(left) = self.left_child() {
            self.send(left, SLOT_PARENT, token);
        }
        if let Some(right) = self.right_child() {
            self.send(right, SLOT_PARENT, token);
        }
    }

    /// Update the vote this rank will cast: `(tasks spawned, tasks
    /// completed)`.
    pub(crate) fn set_counters(&mut self, spawned: u64, completed: u64) {
        self.token.spawned = spawned;
        self.token.completed = completed;
    }

    /// Re-prime the detector so a fresh collection can run.  Collective.
    pub(crate) fn reset(&mut self) {
        self.ctx.barrier();

        self.token = Token::zero();
        self.num_cycles = 0;
        self.direction = Direction::Up;
        self.have_voted = false;
        self.last_spawned = 0;
        self.last_completed = 0;

        for slot in 0..3 {
            let addr = self.slot_addr(slot);
            self.ctx.put(self.procid, addr, &[0; SLOT_WORDS]);
        }

        // leaves start as if a parent token had already arrived
        if self.is_leaf() && self.nproc > 1 {
            self.direction = Direction::Down;
            self.ctx.atomic_set(self.procid, self.slot_addr(SLOT_PARENT), 1);
        }
    }

    /// One non-blocking detection attempt.  Returns `true` once global
    /// termination is certain.
    pub(crate) fn attempt_vote(&mut self) -> bool {
        if self.nproc == 1 {
            // two consecutive identical quiescent observations
            if self.token.spawned == self.last_spawned
                && self.token.completed == self.last_completed
                && self.token.spawned == self.token.completed
            {
                self.token.state = TokenState::Terminated;
            }
            self.last_spawned = self.token.spawned;
            self.last_completed = self.token.completed;
        } else if self.direction == Direction::Down {
            // waiting for the token to come back down from our parent
            if let Some(parent_token) = self.try_take(SLOT_PARENT) {
                if self.is_leaf() {
                    if parent_token.state == TokenState::Terminated {
                        self.token.state = TokenState::Terminated;
                    } else {
                        // leaves reverse the wave and cast the next vote
                        self.pass_up(self.token);
                        self.have_voted = true;
                    }
                } else {
                    if parent_token.state == TokenState::Terminated {
                        self.token.state = TokenState::Terminated;
                    }
                    self.pass_down(parent_token);
                    self.have_voted = false;
                    self.direction = Direction::Up;
                }
            }
        } else {
            // waiting for both children's votes
            let left_ready = self.peek(SLOT_LEFT);
            let right_ready = self.right_child().is_none() || self.peek(SLOT_RIGHT);

            if left_ready && right_ready {
                let left = self.try_take(SLOT_LEFT).unwrap_or_else(Token::zero);
                let right = self.try_take(SLOT_RIGHT).unwrap_or_else(Token::zero);

                let spawned = self.token.spawned + left.spawned + right.spawned;
                let completed = self.token.completed + left.completed + right.completed;

                if self.procid == 0 {
                    // root: compare this cycle's reduction to the last
                    if spawned == self.last_spawned
                        && completed == self.last_completed
                        && spawned == completed
                    {
                        self.token.state = TokenState::Terminated;
                    }
                    self.last_spawned = spawned;
                    self.last_completed = completed;
                    self.num_cycles += 1;

                    let down = Token {
                        state: self.token.state,
                        spawned,
                        completed,
                    };
                    if down.state == TokenState::Terminated {
                        tracing::debug!(
                            cycles = self.num_cycles,
                            spawned,
                            completed,
                            "termination detected"
                        );
                    }
                    self.pass_down(down);
                    self.have_voted = false;
                } else {
                    // interior: merge and vote upward
                    self.pass_up(Token {
                        state: TokenState::Active,
                        spawned,
                        completed,
                    });
                    self.direction = Direction::Down;
                    self.have_voted = true;
                }
            }
        }

        if self.token.state == TokenState::Terminated {
            tracing::trace!(rank = self.procid, "observed termination");
            true
        } else {
            false
        }
    }

    pub(crate) fn num_cycles(&self) -> u64 {
        self.num_cycles
    }
}

impl core::fmt::Debug for TerminationDetector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TerminationDetector")
            .field("rank", &self.procid)
            .field("nproc", &self.nproc)
            .field("direction", &self.direction)
            .field("have_voted", &self.have_voted)
            .field("num_cycles", &self.num_cycles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmem::Backoff;

    #[test]
    fn single_rank_needs_two_quiet_rounds() {
        shmem::run(1, 256, |ctx| {
            let mut td = TerminationDetector::create(ctx);
            td.set_counters(5, 5);
            // first observation arms the comparison, second confirms it
            assert!(!td.attempt_vote());
            assert!(td.attempt_vote());
        });
    }

    #[test]
    fn single_rank_never_terminates_with_outstanding_work() {
        shmem::run(1, 256, |ctx| {
            let mut td = TerminationDetector::create(ctx);
            td.set_counters(5, 3);
            for _ in 0..10 {
                assert!(!td.attempt_vote());
            }
            // catching up restarts the two-round confirmation
            td.set_counters(5, 5);
            assert!(!td.attempt_vote());
            assert!(td.attempt_vote());
        });
    }

    #[test]
    fn all_ranks_agree_on_termination() {
        for ranks in [2, 3, 4, 7, 8] {
            shmem::run(ranks, 1024, |ctx| {
                let mut td = TerminationDetector::create(ctx.clone());
                td.set_counters(7, 7);

                let mut boff = Backoff::new();
                let mut rounds = 0u64;
                while !td.attempt_vote() {
                    rounds += 1;
                    assert!(rounds < 1_000_000, "detector failed to converge");
                    boff.spin();
                }
                // nobody exits until the root has proven quiescence twice
                ctx.barrier();
            });
        }
    }

    #[test]
    fn counter_mismatch_blocks_termination() {
        shmem::run(4, 1024, |ctx| {
            let rank = ctx.rank();
            let mut td = TerminationDetector::create(ctx.clone());

            // rank 2 claims a spawned-but-not-completed task at first
            if rank == 2 {
                td.set_counters(3, 2);
            } else {
                td.set_counters(1, 1);
            }

            for _ in 0..2000 {
                assert!(!td.attempt_vote());
            }
            // nobody may observe balanced counters until every rank is
            // done asserting the mismatch
            ctx.barrier();

            // the task finishes; termination now goes through
            if rank == 2 {
                td.set_counters(3, 3);
            }
            let mut boff = Backoff::new();
            while !td.attempt_vote() {
                boff.spin();
            }
            ctx.barrier();
        });
    }

    #[test]
    fn reset_supports_a_second_round() {
        shmem::run(3, 1024, |ctx| {
            let mut td = TerminationDetector::create(ctx.clone());
            for round in 0..3 {
                td.set_counters(round, round);
                let mut boff = Backoff::new();
                while !td.attempt_vote() {
                    boff.spin();
                }
                ctx.barrier();
                td.reset();
            }
        });
    }
}
