//! Repair history: which ranges of which tables finished, and when.
//!
//! Records are written durably to the [`MetaStore`] and mirrored in memory
//! for fast lookups when a node operation decides which ranges it can skip.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use reef_meta::{HistoryRecord, MetaStore};
use reef_types::{RepairUuid, TableId, TokenRange};
use tracing::{debug, info};

use crate::error::RepairError;

#[derive(Debug, Default)]
struct TableHistory {
    ranges: BTreeMap<TokenRange, (RepairUuid, u64)>,
    watermark: u64,
}

#[derive(Debug, Default)]
struct HistoryState {
    tables: HashMap<TableId, TableHistory>,
    jobs: HashMap<RepairUuid, HashSet<(TableId, TokenRange)>>,
}

/// Finished-range bookkeeping for every table.
pub struct RepairHistory {
    meta: Arc<MetaStore>,
    state: Mutex<HistoryState>,
}

impl RepairHistory {
    /// Create an empty history backed by `meta`. Call
    /// [`RepairHistory::load_history`] to hydrate it.
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self {
            meta,
            state: Mutex::new(HistoryState::default()),
        }
    }

    /// Record that `range` of `table_id` finished at `time` (unix millis).
    ///
    /// The record is durable before this returns. Returns the table's
    /// watermark after the update.
    pub fn update_history(
        &self,
        repair_id: RepairUuid,
        table_id: TableId,
        range: TokenRange,
        time: u64,
    ) -> Result<u64, RepairError> {
        self.meta.put_history(&HistoryRecord {
            table_id,
            range,
            repair_id,
            finished_at: time,
        })?;

        let mut state = self.state.lock().expect("lock poisoned");
        let table = state.tables.entry(table_id).or_default();
        table.ranges.insert(range, (repair_id, time));
        table.watermark = table.watermark.max(time);
        let watermark = table.watermark;
        state.jobs.entry(repair_id).or_default().insert((table_id, range));
        debug!(%repair_id, %table_id, %range, watermark, "repair history updated");
        Ok(watermark)
    }

    /// Forget the in-memory bookkeeping of a finished job.
    ///
    /// Durable records are kept.
    pub fn cleanup_history(&self, repair_id: RepairUuid) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(done) = state.jobs.remove(&repair_id) {
            debug!(%repair_id, ranges = done.len(), "cleaned up repair history");
        }
    }

    /// Hydrate in-memory state from durable storage.
    pub fn load_history(&self) -> Result<usize, RepairError> {
        let records = self.meta.list_all_history()?;
        let mut state = self.state.lock().expect("lock poisoned");
        for record in &records {
            let table = state.tables.entry(record.table_id).or_default();
            table
                .ranges
                .insert(record.range, (record.repair_id, record.finished_at));
            table.watermark = table.watermark.max(record.finished_at);
            state
                .jobs
                .entry(record.repair_id)
                .or_default()
                .insert((record.table_id, record.range));
        }
        info!(records = records.len(), "loaded repair history");
        Ok(records.len())
    }

    /// Whether `range` of `table_id` was last finished by `repair_id`.
    pub fn is_repaired(&self, repair_id: RepairUuid, table_id: TableId, range: &TokenRange) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state
            .tables
            .get(&table_id)
            .and_then(|t| t.ranges.get(range))
            .is_some_and(|(id, _)| *id == repair_id)
    }

    /// Finish time recorded for `range` of `table_id`, by any job.
    pub fn finished_at(&self, table_id: TableId, range: &TokenRange) -> Option<u64> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .tables
            .get(&table_id)
            .and_then(|t| t.ranges.get(range))
            .map(|(_, at)| *at)
    }

    /// Latest finish time recorded for the table, 0 when none.
    pub fn watermark(&self, table_id: TableId) -> u64 {
        let state = self.state.lock().expect("lock poisoned");
        state.tables.get(&table_id).map_or(0, |t| t.watermark)
    }

    /// Finished ranges of a table with their finish time, in token order.
    pub fn finished_ranges(&self, table_id: TableId) -> Vec<(TokenRange, u64)> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .tables
            .get(&table_id)
            .map(|t| t.ranges.iter().map(|(r, (_, at))| (*r, *at)).collect())
            .unwrap_or_default()
    }

    /// Ranges a job finished, while its bookkeeping is kept.
    pub fn job_ranges(&self, repair_id: RepairUuid) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state.jobs.get(&repair_id).map_or(0, HashSet::len)
    }
}

impl std::fmt::Debug for RepairHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("lock poisoned");
        f.debug_struct("RepairHistory")
            .field("tables", &state.tables.len())
            .field("jobs", &state.jobs.len())
            .finish()
    }
}
