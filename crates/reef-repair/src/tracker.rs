//! Job status tracking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use reef_types::RepairStatus;
use tokio::sync::watch;
use tracing::debug;

/// Status of every repair job started since process start.
///
/// Entries stay until [`Tracker::remove_finished`] drops them.
#[derive(Debug, Default)]
pub struct Tracker {
    jobs: Mutex<HashMap<i32, watch::Sender<RepairStatus>>>,
}

impl Tracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a job as `Running`.
    pub fn start(&self, id: i32) {
        let (tx, _) = watch::channel(RepairStatus::Running);
        self.jobs.lock().expect("lock poisoned").insert(id, tx);
    }

    /// Set the final status of a job.
    pub fn finish(&self, id: i32, status: RepairStatus) {
        let jobs = self.jobs.lock().expect("lock poisoned");
        if let Some(tx) = jobs.get(&id) {
            tx.send_replace(status);
            debug!(job_id = id, ?status, "repair job finished");
        }
    }

    /// Current status, `None` for unknown jobs.
    pub fn status(&self, id: i32) -> Option<RepairStatus> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        jobs.get(&id).map(|tx| *tx.borrow())
    }

    /// Wait until the job is terminal or `timeout` passes.
    ///
    /// Returns the last known status either way; `None` for unknown jobs.
    pub async fn await_completion(&self, id: i32, timeout: Duration) -> Option<RepairStatus> {
        let mut rx = {
            let jobs = self.jobs.lock().expect("lock poisoned");
            jobs.get(&id)?.subscribe()
        };
        let current = *rx.borrow();
        if current.is_terminal() {
            return Some(current);
        }
        let finished = tokio::time::timeout(timeout, rx.wait_for(RepairStatus::is_terminal))
            .await
            .ok()
            .and_then(|r| r.ok().map(|status| *status));
        Some(finished.unwrap_or_else(|| *rx.borrow()))
    }

    /// Ids of jobs still running, sorted.
    pub fn active(&self) -> Vec<i32> {
        let jobs = self.jobs.lock().expect("lock poisoned");
        let mut ids: Vec<i32> = jobs
            .iter()
            .filter(|(_, tx)| !tx.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Wait until every tracked job is terminal.
    pub async fn wait_all(&self) {
        let receivers: Vec<watch::Receiver<RepairStatus>> = {
            let jobs = self.jobs.lock().expect("lock poisoned");
            jobs.values().map(watch::Sender::subscribe).collect()
        };
        for mut rx in receivers {
            let _ = rx.wait_for(RepairStatus::is_terminal).await;
        }
    }

    /// Drop a terminal job. Returns whether it was dropped.
    pub fn remove_finished(&self, id: i32) -> bool {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        match jobs.get(&id) {
            Some(tx) if tx.borrow().is_terminal() => {
                jobs.remove(&id);
                true
            }
            _ => false,
        }
    }
}
