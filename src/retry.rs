// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded polling.
//!
//! The review service is eventually consistent: it may accept a project
//! before writing out its metadata ref, and it may acknowledge a group
//! before the group shows up in listings. Every spot that has to wait for
//! the remote side to catch up does so through the same bounded schedule
//! instead of hand-rolling its own sleep loop.

use std::{thread::sleep, time::Duration};
use tracing::debug;

/// Bounded retry schedule: how many attempts to make, and how long to wait
/// between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poll {
    pub attempts: u32,
    pub delay: Duration,
}

impl Poll {
    /// Construct new polling schedule.
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Run `probe` until it yields a value or the schedule is exhausted.
///
/// The probe receives the zero-based attempt number. Sleeps for the
/// schedule's delay between attempts, never after the last one. Returns
/// [`None`] when every attempt came up empty.
pub fn poll<T>(schedule: Poll, mut probe: impl FnMut(u32) -> Option<T>) -> Option<T> {
    for attempt in 0..schedule.attempts {
        if let Some(value) = probe(attempt) {
            return Some(value);
        }

        if attempt + 1 < schedule.attempts {
            debug!(
                "attempt {} of {} came up empty, backing off",
                attempt + 1,
                schedule.attempts
            );
            sleep(schedule.delay);
        }
    }

    None
}
