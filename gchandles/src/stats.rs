use std::{
    ops::AddAssign,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{Generation, config::MAX_GENERATION};

/// What one table scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub handles_visited: usize,
    /// Blocks passed over by the block-level age test.
    pub blocks_skipped: usize,
    /// Clumps passed over by the per-clump age test.
    pub clumps_skipped: usize,
}

impl AddAssign for ScanSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.handles_visited += rhs.handles_visited;
        self.blocks_skipped += rhs.blocks_skipped;
        self.clumps_skipped += rhs.clumps_skipped;
    }
}

/// Counters accumulated by a handle table map across GC cycles.
pub struct HandleStats {
    handles_visited: AtomicU64,
    blocks_skipped: AtomicU64,
    clumps_skipped: AtomicU64,
    cycles: [AtomicU64; MAX_GENERATION as usize + 1],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub handles_visited: u64,
    pub blocks_skipped: u64,
    pub clumps_skipped: u64,
    /// Completed GC cycles indexed by condemned generation, trailing
    /// generations without cycles trimmed.
    pub cycles: Vec<u64>,
}

impl HandleStats {
    pub fn new() -> Self {
        Self {
            handles_visited: AtomicU64::new(0),
            blocks_skipped: AtomicU64::new(0),
            clumps_skipped: AtomicU64::new(0),
            cycles: [const { AtomicU64::new(0) }; MAX_GENERATION as usize + 1],
        }
    }

    pub fn record_scan(&self, summary: &ScanSummary) {
        self.handles_visited
            .fetch_add(summary.handles_visited as u64, Ordering::Relaxed);
        self.blocks_skipped
            .fetch_add(summary.blocks_skipped as u64, Ordering::Relaxed);
        self.clumps_skipped
            .fetch_add(summary.clumps_skipped as u64, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, condemned: Generation) {
        let slot = (condemned as usize).min(self.cycles.len() - 1);
        self.cycles[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut cycles: Vec<u64> = self
            .cycles
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect();
        while cycles.last() == Some(&0) {
            cycles.pop();
        }
        StatsSnapshot {
            handles_visited: self.handles_visited.load(Ordering::Relaxed),
            blocks_skipped: self.blocks_skipped.load(Ordering::Relaxed),
            clumps_skipped: self.clumps_skipped.load(Ordering::Relaxed),
            cycles,
        }
    }
}

impl Default for HandleStats {
    fn default() -> Self {
        Self::new()
    }
}
