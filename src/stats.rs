// Copyright (C) 2024, 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Run statistics
//!
//! Counters accumulated by each replay worker and merged by the driver; the
//! totals are surfaced as diagnostics at the end of a run.

use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStatistics {
    /// Hardware buffer overflows encountered
    pub overflows: u64,
    /// Input bytes that could not be decoded
    pub skipped_bytes: u64,
    /// Synthetic lost-synchronization segments emitted
    pub lost_segments: u64,
    /// Tasks whose replay ended before its trace did
    pub incomplete_tasks: u64,
}

impl RunStatistics {
    pub fn merge(&mut self, other: &RunStatistics) {
        self.overflows += other.overflows;
        self.skipped_bytes += other.skipped_bytes;
        self.lost_segments += other.lost_segments;
        self.incomplete_tasks += other.incomplete_tasks;
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} overflows, {} skipped bytes, {} lost segments, {} incomplete tasks",
            self.overflows, self.skipped_bytes, self.lost_segments, self.incomplete_tasks
        )
    }
}
