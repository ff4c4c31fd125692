// Copyright 2025 the scioto authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Why a steal attempt came back without tasks.
///
/// Transient conditions only: the search loop counts them and retries,
/// they are never surfaced as hard errors (programming errors abort via
/// assertion instead).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TryStealError {
    /// The victim's shared region is locked by another thief (abortable
    /// steals only).
    Busy,
    /// The victim had no stealable work once we got a consistent look at
    /// its queue.
    Empty,
}

impl fmt::Display for TryStealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryStealError::Busy => f.write_str("victim queue is busy"),
            TryStealError::Empty => f.write_str("victim queue is empty"),
        }
    }
}

impl core::error::Error for TryStealError {}
