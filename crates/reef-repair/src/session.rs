//! The master side of a row-level repair session.
//!
//! A session walks its token range in rounds. Each round covers the key
//! interval `(cursor, round_end]`: the master reads and hashes a page, asks
//! the follower for the same interval, computes the difference and moves
//! the rows each side lacks. The cursor then advances to `round_end`.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use reef_net::{RemoteErrorKind, RepairMessage, SessionHeader, Transport};
use reef_store::RowStore;
use reef_types::events::{EventBus, RowsStreamed, SessionFailed};
use reef_types::{DiffAlgorithm, NodeId, RowEntry, RowKey};
use tracing::{debug, warn};

use crate::diff::{DiffPlan, plan_from_digests, plan_from_rows};
use crate::error::RepairError;
use crate::memory::{MemoryPool, RowBuffer, RowWriter};
use crate::meta::{RepairMeta, RepairState};
use crate::row::{RepairRow, RowHasher};
use crate::throttle::Throttle;

/// What a finished session moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Rounds run.
    pub rounds: u64,
    /// Rows pushed to the follower.
    pub rows_sent: u64,
    /// Rows pulled from the follower and written locally.
    pub rows_received: u64,
}

/// Drives one registered master session to completion.
pub struct MasterSession {
    pub(crate) meta: Arc<RepairMeta>,
    pub(crate) store: Arc<dyn RowStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pool: MemoryPool,
    pub(crate) throttle: Arc<Throttle>,
    pub(crate) events: EventBus,
}

impl MasterSession {
    /// Open the session on the follower, run every round and close it.
    ///
    /// On error the session ends `Failed` (or `Aborted` once cancelled) and
    /// a best-effort stop is sent to the follower.
    #[tracing::instrument(
        skip(self),
        fields(peer = %self.meta.peer().fmt_short(), id = self.meta.id(), range = %self.meta.range())
    )]
    pub async fn run(&self) -> Result<SessionOutcome, RepairError> {
        let header = self.meta.header();
        match self.drive(&header).await {
            Ok(outcome) => {
                debug!(
                    rounds = outcome.rounds,
                    sent = outcome.rows_sent,
                    received = outcome.rows_received,
                    "repair session complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.meta.finish_with_error(&err);
                warn!(error = %err, state = ?self.meta.state(), "repair session failed");
                self.events.emit(SessionFailed {
                    peer: self.meta.peer(),
                    repair_meta_id: self.meta.id(),
                    error: err.to_string(),
                });
                let _ = self
                    .transport
                    .request(self.meta.peer(), RepairMessage::RowLevelStop { header })
                    .await;
                Err(err)
            }
        }
    }

    async fn drive(&self, header: &SessionHeader) -> Result<SessionOutcome, RepairError> {
        let start = RepairMessage::RowLevelStart {
            header: *header,
            algorithm: self.meta.algorithm(),
            max_row_buf_size: self.meta.max_row_buf_size(),
            seed: self.meta.seed(),
            master_shard: self.meta.shard_config(),
            reason: self.meta.reason(),
        };
        match self.request(start).await? {
            RepairMessage::Ack => {}
            other => return Err(self.unexpected(other)),
        }

        let outcome = self.rounds(header).await?;

        match self.request(RepairMessage::RowLevelStop { header: *header }).await? {
            RepairMessage::Ack => {}
            other => return Err(self.unexpected(other)),
        }
        self.meta.transition(RepairState::Complete)?;
        Ok(outcome)
    }

    async fn rounds(&self, header: &SessionHeader) -> Result<SessionOutcome, RepairError> {
        let meta = &self.meta;
        let hasher = RowHasher::new(meta.seed());
        let budget = meta.max_row_buf_size();
        let range = meta.range();
        let reason = meta.reason();
        let mut writer = RowWriter::new(
            self.store.clone(),
            meta.table_id(),
            self.pool.clone(),
            budget,
        );
        let mut outcome = SessionOutcome::default();
        let mut cursor: Option<RowKey> = None;

        loop {
            self.check_cancelled()?;
            meta.transition(RepairState::Hashing)?;

            let page = self
                .store
                .read_rows(meta.table_id(), &range, cursor.as_ref(), None, budget)
                .await?;
            let mut round_end = if page.exhausted {
                None
            } else {
                page.rows.last().map(|r| r.key.clone())
            };
            let rows: Vec<RepairRow> = page.rows.into_iter().map(|e| hasher.row(e)).collect();
            let mut local = self.cancellable(RowBuffer::fill(&self.pool, rows)).await?;

            meta.transition(RepairState::ExchangingDiffs)?;
            let (mut plan, pulled) = match meta.algorithm() {
                DiffAlgorithm::HashOnly => {
                    self.exchange_hashes(header, &cursor, &mut round_end, &mut local)
                        .await?
                }
                DiffAlgorithm::FullRow => {
                    self.exchange_full_rows(header, &hasher, &cursor, &mut round_end, &mut local)
                        .await?
                }
            };
            if !reason.pushes_to_followers() {
                plan.push.clear();
            }

            meta.transition(RepairState::Streaming)?;
            local.retain_keys(&plan.push);
            outcome.rows_sent += self.push_rows(header, &plan, &local).await?;
            // The page is released before pulled rows wait for permits, so
            // a session never waits on memory it holds itself.
            local.release();
            if !pulled.is_empty() {
                outcome.rows_received += pulled.len() as u64;
                meta.stats()
                    .rows_received
                    .fetch_add(pulled.len() as u64, Ordering::Relaxed);
                self.cancellable(writer.push(pulled)).await?;
            }
            writer.flush().await?;

            outcome.rounds += 1;
            meta.stats().rounds.fetch_add(1, Ordering::Relaxed);
            match round_end {
                Some(end) => cursor = Some(end),
                None => return Ok(outcome),
            }
        }
    }

    /// `HashOnly` exchange: digests first, then only the rows we lack.
    async fn exchange_hashes(
        &self,
        header: &SessionHeader,
        cursor: &Option<RowKey>,
        round_end: &mut Option<RowKey>,
        local: &mut RowBuffer,
    ) -> Result<(DiffPlan, Vec<RowEntry>), RepairError> {
        let request = RepairMessage::GetRowHashes {
            header: *header,
            after: cursor.clone(),
            until: round_end.clone(),
            max_bytes: self.meta.max_row_buf_size(),
        };
        let (digests, exhausted) = match self.request(request).await? {
            RepairMessage::RowHashes { digests, exhausted } => (digests, exhausted),
            other => return Err(self.unexpected(other)),
        };
        if !exhausted {
            let last = digests
                .last()
                .map(|d| d.key.clone())
                .ok_or_else(|| RepairError::Protocol("empty truncated digest page".into()))?;
            local.truncate_after(&last);
            *round_end = Some(last);
        }

        let plan = plan_from_digests(local.rows(), &digests);
        if plan.pull.is_empty() || !self.meta.reason().pulls_to_master() {
            return Ok((plan, Vec::new()));
        }

        let request = RepairMessage::GetRowDiff {
            header: *header,
            keys: plan.pull.clone(),
        };
        let rows = match self.request(request).await? {
            RepairMessage::RowDiff { rows } => rows,
            other => return Err(self.unexpected(other)),
        };
        for row in &rows {
            if plan.pull.binary_search(&row.key).is_err() {
                return Err(RepairError::Protocol(format!(
                    "peer sent unrequested row {:?}",
                    row.key
                )));
            }
        }
        Ok((plan, rows))
    }

    /// `FullRow` exchange: the follower's whole page in one response.
    async fn exchange_full_rows(
        &self,
        header: &SessionHeader,
        hasher: &RowHasher,
        cursor: &Option<RowKey>,
        round_end: &mut Option<RowKey>,
        local: &mut RowBuffer,
    ) -> Result<(DiffPlan, Vec<RowEntry>), RepairError> {
        let request = RepairMessage::GetFullRows {
            header: *header,
            after: cursor.clone(),
            until: round_end.clone(),
            max_bytes: self.meta.max_row_buf_size(),
        };
        let (rows, exhausted) = match self.request(request).await? {
            RepairMessage::FullRows { rows, exhausted } => (rows, exhausted),
            other => return Err(self.unexpected(other)),
        };
        if !rows.windows(2).all(|w| w[0].key < w[1].key) {
            return Err(RepairError::Protocol("peer rows out of key order".into()));
        }
        // The peer's page is only compared here. Rows kept from it take
        // permits in the writer once the local page is released.
        let remote: Vec<RepairRow> = rows.into_iter().map(|e| hasher.row(e)).collect();
        if !exhausted {
            let last = remote
                .last()
                .map(|r| r.key().clone())
                .ok_or_else(|| RepairError::Protocol("empty truncated row page".into()))?;
            local.truncate_after(&last);
            *round_end = Some(last);
        }

        let plan = plan_from_rows(local.rows(), &remote);
        if !self.meta.reason().pulls_to_master() {
            return Ok((plan, Vec::new()));
        }
        let pulled = plan
            .pull
            .iter()
            .filter_map(|key| {
                remote
                    .binary_search_by(|r| r.key().cmp(key))
                    .ok()
                    .map(|i| remote[i].entry.clone())
            })
            .collect();
        Ok((plan, pulled))
    }

    /// Stream the rows the follower lacks, in batches of at most one page.
    async fn push_rows(
        &self,
        header: &SessionHeader,
        plan: &DiffPlan,
        local: &RowBuffer,
    ) -> Result<u64, RepairError> {
        let budget = self.meta.max_row_buf_size();
        let mut sent = 0u64;
        let mut batch: Vec<RowEntry> = Vec::new();
        let mut batch_bytes = 0u64;

        for key in &plan.push {
            let row = local
                .get(key)
                .ok_or_else(|| RepairError::Protocol(format!("push of unknown row {key:?}")))?;
            let size = row.estimated_size();
            if !batch.is_empty() && batch_bytes + size > budget {
                sent += self.send_batch(header, std::mem::take(&mut batch), batch_bytes).await?;
                batch_bytes = 0;
            }
            batch.push(row.entry.clone());
            batch_bytes += size;
        }
        if !batch.is_empty() {
            sent += self.send_batch(header, batch, batch_bytes).await?;
        }
        Ok(sent)
    }

    async fn send_batch(
        &self,
        header: &SessionHeader,
        rows: Vec<RowEntry>,
        bytes: u64,
    ) -> Result<u64, RepairError> {
        self.cancellable(async {
            self.throttle.acquire(bytes).await;
            Ok(())
        })
        .await?;

        let count = rows.len() as u64;
        let response = self
            .request(RepairMessage::PutRowDiff {
                header: *header,
                rows,
            })
            .await?;
        match response {
            RepairMessage::PutRowDiffAck { applied } if applied == count => {}
            RepairMessage::PutRowDiffAck { applied } => {
                return Err(RepairError::Protocol(format!(
                    "peer applied {applied} of {count} rows"
                )));
            }
            other => return Err(self.unexpected(other)),
        }

        let stats = self.meta.stats();
        stats.rows_sent.fetch_add(count, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.events.emit(RowsStreamed {
            peer: self.meta.peer(),
            table_id: self.meta.table_id(),
            rows: count as usize,
        });
        Ok(count)
    }

    async fn request(&self, msg: RepairMessage) -> Result<RepairMessage, RepairError> {
        let peer = self.meta.peer();
        // In-flight requests run to completion; cancellation is observed
        // at the next round or wait.
        match self.transport.request(peer, msg).await? {
            RepairMessage::Error { kind, message } => {
                Err(remote_error(peer, &self.meta, kind, message))
            }
            other => Ok(other),
        }
    }

    async fn cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, RepairError>>,
    ) -> Result<T, RepairError> {
        tokio::select! {
            _ = self.meta.cancel_token().cancelled() => Err(RepairError::Aborted),
            result = fut => result,
        }
    }

    fn check_cancelled(&self) -> Result<(), RepairError> {
        if self.meta.is_cancelled() {
            return Err(RepairError::Aborted);
        }
        Ok(())
    }

    fn unexpected(&self, msg: RepairMessage) -> RepairError {
        RepairError::Protocol(format!(
            "unexpected {} from {} in state {:?}",
            msg.verb(),
            self.meta.peer().fmt_short(),
            self.meta.state()
        ))
    }
}

/// Map an in-band error reported by `peer` onto a local error.
pub(crate) fn remote_error(
    peer: NodeId,
    meta: &RepairMeta,
    kind: RemoteErrorKind,
    message: String,
) -> RepairError {
    match kind {
        RemoteErrorKind::SchemaMismatch => RepairError::SchemaMismatch {
            peer,
            table_id: meta.table_id(),
        },
        RemoteErrorKind::RepairMetaNotFound => RepairError::RepairMetaNotFound {
            peer,
            id: meta.id(),
        },
        kind => RepairError::Remote {
            peer,
            kind,
            message,
        },
    }
}
