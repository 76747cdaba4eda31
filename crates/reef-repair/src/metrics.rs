//! Node operation progress counters.

use std::sync::atomic::{AtomicU64, Ordering};

use reef_types::StreamReason;

#[derive(Debug, Default)]
struct Counter {
    total: AtomicU64,
    finished: AtomicU64,
}

impl Counter {
    fn percentage(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.finished.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// Total and finished range counts per kind of operation.
///
/// Counters only grow; they reset when the process restarts.
#[derive(Debug, Default)]
pub struct NodeOpsMetrics {
    bootstrap: Counter,
    replace: Counter,
    rebuild: Counter,
    decommission: Counter,
    removenode: Counter,
    repair: Counter,
}

impl NodeOpsMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, reason: StreamReason) -> &Counter {
        match reason {
            StreamReason::Bootstrap => &self.bootstrap,
            StreamReason::Replace => &self.replace,
            StreamReason::Rebuild => &self.rebuild,
            StreamReason::Decommission => &self.decommission,
            StreamReason::Removenode => &self.removenode,
            StreamReason::Repair => &self.repair,
        }
    }

    /// Count `n` more ranges to do for `reason`.
    pub fn add_total(&self, reason: StreamReason, n: u64) {
        self.counter(reason).total.fetch_add(n, Ordering::Relaxed);
    }

    /// Count `n` more finished ranges for `reason`.
    pub fn add_finished(&self, reason: StreamReason, n: u64) {
        self.counter(reason).finished.fetch_add(n, Ordering::Relaxed);
    }

    /// Ranges to do for `reason`.
    pub fn total(&self, reason: StreamReason) -> u64 {
        self.counter(reason).total.load(Ordering::Relaxed)
    }

    /// Ranges finished for `reason`.
    pub fn finished(&self, reason: StreamReason) -> u64 {
        self.counter(reason).finished.load(Ordering::Relaxed)
    }

    /// Finished fraction of bootstrap ranges.
    pub fn bootstrap_finished_percentage(&self) -> f64 {
        self.bootstrap.percentage()
    }

    /// Finished fraction of replace ranges.
    pub fn replace_finished_percentage(&self) -> f64 {
        self.replace.percentage()
    }

    /// Finished fraction of rebuild ranges.
    pub fn rebuild_finished_percentage(&self) -> f64 {
        self.rebuild.percentage()
    }

    /// Finished fraction of decommission ranges.
    pub fn decommission_finished_percentage(&self) -> f64 {
        self.decommission.percentage()
    }

    /// Finished fraction of removenode ranges.
    pub fn removenode_finished_percentage(&self) -> f64 {
        self.removenode.percentage()
    }

    /// Finished fraction of regular repair ranges.
    pub fn repair_finished_percentage(&self) -> f64 {
        self.repair.percentage()
    }

    fn all(&self) -> [&Counter; 6] {
        [
            &self.bootstrap,
            &self.replace,
            &self.rebuild,
            &self.decommission,
            &self.removenode,
            &self.repair,
        ]
    }

    /// Ranges to do across every kind.
    pub fn repair_total_ranges_sum(&self) -> u64 {
        self.all()
            .iter()
            .map(|c| c.total.load(Ordering::Relaxed))
            .sum()
    }

    /// Ranges finished across every kind.
    pub fn repair_finished_ranges_sum(&self) -> u64 {
        self.all()
            .iter()
            .map(|c| c.finished.load(Ordering::Relaxed))
            .sum()
    }
}
