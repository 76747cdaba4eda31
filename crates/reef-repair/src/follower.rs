//! The follower side of the protocol: answers a master's requests.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use reef_net::{MessageHandler, RepairMessage, SessionHeader};
use reef_types::{NodeId, RepairRole, RowEntry, RowKey};
use tracing::{debug, trace};

use crate::error::RepairError;
use crate::memory::{RowBuffer, RowWriter};
use crate::meta::{RepairMeta, RepairMetaParams, RepairState};
use crate::row::{RepairRow, RowHasher};
use crate::service::RepairService;

#[async_trait]
impl MessageHandler for RepairService {
    async fn handle(&self, from: NodeId, msg: RepairMessage) -> RepairMessage {
        let verb = msg.verb();
        match self.handle_message(from, msg).await {
            Ok(response) => response,
            Err(err) => {
                debug!(peer = %from.fmt_short(), verb, error = %err, "repair request failed");
                RepairMessage::error(err.remote_kind(), err.to_string())
            }
        }
    }
}

impl RepairService {
    /// Answer one request from `from`.
    pub async fn handle_message(
        &self,
        from: NodeId,
        msg: RepairMessage,
    ) -> Result<RepairMessage, RepairError> {
        trace!(peer = %from.fmt_short(), verb = msg.verb(), "repair request");
        match msg {
            RepairMessage::RowLevelStart {
                header,
                algorithm,
                max_row_buf_size,
                seed,
                master_shard,
                reason,
            } => {
                if self.shutting_down.load(Ordering::Acquire) {
                    return Err(RepairError::ShuttingDown);
                }
                let schema = self
                    .store()
                    .schema(header.table_id)
                    .await?
                    .ok_or(RepairError::NoSuchTable(header.table_id))?;
                if schema.version != header.schema_version {
                    return Err(RepairError::SchemaMismatch {
                        peer: from,
                        table_id: header.table_id,
                    });
                }
                self.insert_repair_meta(RepairMetaParams {
                    peer: from,
                    src_shard: header.dst_shard,
                    id: header.repair_meta_id,
                    role: RepairRole::Follower,
                    range: header.range,
                    table_id: header.table_id,
                    schema_version: header.schema_version,
                    algorithm,
                    max_row_buf_size,
                    seed,
                    shard_config: master_shard,
                    reason,
                })
                .await?;
                Ok(RepairMessage::Ack)
            }

            RepairMessage::GetRowHashes {
                header,
                after,
                until,
                max_bytes,
            } => {
                let meta = self.follower_session(from, &header).await?;
                // The previous page goes back to the pool before the next
                // one is read.
                meta.page().lock().await.release();
                let (buffer, exhausted) = self.read_page(&meta, after, until, max_bytes).await?;
                let digests = buffer.rows().iter().map(RepairRow::digest).collect();
                // Kept for the GetRowDiff that may follow.
                *meta.page().lock().await = buffer;
                meta.advance_to(RepairState::ExchangingDiffs)?;
                Ok(RepairMessage::RowHashes { digests, exhausted })
            }

            RepairMessage::GetFullRows {
                header,
                after,
                until,
                max_bytes,
            } => {
                let meta = self.follower_session(from, &header).await?;
                meta.page().lock().await.release();
                let (buffer, exhausted) = self.read_page(&meta, after, until, max_bytes).await?;
                let rows = buffer.rows().iter().map(|r| r.entry.clone()).collect();
                meta.advance_to(RepairState::ExchangingDiffs)?;
                Ok(RepairMessage::FullRows { rows, exhausted })
            }

            RepairMessage::GetRowDiff { header, keys } => {
                let meta = self.follower_session(from, &header).await?;
                meta.advance_to(RepairState::ExchangingDiffs)?;
                let mut page = meta.page().lock().await;
                let rows: Vec<RowEntry> = keys
                    .iter()
                    .filter_map(|key| page.get(key).map(|r| r.entry.clone()))
                    .collect();
                page.release();
                Ok(RepairMessage::RowDiff { rows })
            }

            RepairMessage::PutRowDiff { header, rows } => {
                let meta = self.follower_session(from, &header).await?;
                if !meta.reason().pushes_to_followers() {
                    return Err(RepairError::Protocol(format!(
                        "{} session does not accept rows",
                        meta.reason()
                    )));
                }
                if let Some(row) = rows.iter().find(|r| !meta.range().contains(r.key.token)) {
                    return Err(RepairError::Protocol(format!(
                        "row {:?} outside of {}",
                        row.key,
                        meta.range()
                    )));
                }
                meta.advance_to(RepairState::Streaming)?;
                // Pushes follow the diff exchange; the page is no longer needed.
                meta.page().lock().await.release();
                let pool = self.shard(meta.shard()).pool.clone();
                let mut writer = RowWriter::new(self.store().clone(), meta.table_id(), pool, u64::MAX);
                let cancel = meta.cancel_token().clone();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RepairError::Aborted),
                    pushed = writer.push(rows) => pushed?,
                }
                let applied = writer.flush().await?;
                meta.stats().rows_received.fetch_add(applied, Ordering::Relaxed);
                Ok(RepairMessage::PutRowDiffAck { applied })
            }

            RepairMessage::RowLevelStop { header } => {
                let shard = self.shard(header.dst_shard);
                if let Some(meta) = shard
                    .registry
                    .get(from, header.repair_meta_id, RepairRole::Follower)
                    .await?
                {
                    let _ = meta
                        .advance_to(RepairState::Streaming)
                        .and_then(|_| meta.transition(RepairState::Complete));
                    meta.page().lock().await.release();
                }
                shard
                    .registry
                    .remove(from, header.repair_meta_id, RepairRole::Follower, None)
                    .await?;
                Ok(RepairMessage::Ack)
            }

            RepairMessage::UpdateSystemTable {
                repair_id,
                table_id,
                range,
                finished_at,
            } => {
                self.history()
                    .update_history(repair_id, table_id, range, finished_at)?;
                Ok(RepairMessage::UpdateSystemTableAck)
            }

            RepairMessage::FlushHintsBatchlog => {
                self.store().flush_hints_batchlog().await?;
                Ok(RepairMessage::FlushHintsBatchlogAck)
            }

            other => Err(RepairError::Protocol(format!(
                "{} is not a request",
                other.verb()
            ))),
        }
    }

    /// The follower session a master's request refers to.
    async fn follower_session(
        &self,
        from: NodeId,
        header: &SessionHeader,
    ) -> Result<Arc<RepairMeta>, RepairError> {
        let meta = self
            .shard(header.dst_shard)
            .registry
            .get(from, header.repair_meta_id, RepairRole::Follower)
            .await?
            .ok_or(RepairError::RepairMetaNotFound {
                peer: from,
                id: header.repair_meta_id,
            })?;
        if meta.table_id() != header.table_id || meta.range() != header.range {
            return Err(RepairError::Protocol(format!(
                "request for {} does not match session {}",
                header.range,
                meta.range()
            )));
        }
        if meta.schema_version() != header.schema_version {
            return Err(RepairError::SchemaMismatch {
                peer: from,
                table_id: header.table_id,
            });
        }
        Ok(meta)
    }

    /// Read and buffer the session's rows in `(after, until]`.
    async fn read_page(
        &self,
        meta: &RepairMeta,
        after: Option<RowKey>,
        until: Option<RowKey>,
        max_bytes: u64,
    ) -> Result<(RowBuffer, bool), RepairError> {
        meta.advance_to(RepairState::Hashing)?;
        let page = self
            .store()
            .read_rows(
                meta.table_id(),
                &meta.range(),
                after.as_ref(),
                until.as_ref(),
                max_bytes.min(meta.max_row_buf_size()),
            )
            .await?;
        let hasher = RowHasher::new(meta.seed());
        let rows: Vec<RepairRow> = page.rows.into_iter().map(|e| hasher.row(e)).collect();
        let pool = self.shard(meta.shard()).pool.clone();
        let cancel = meta.cancel_token().clone();
        let buffer = tokio::select! {
            _ = cancel.cancelled() => return Err(RepairError::Aborted),
            buffer = RowBuffer::fill(&pool, rows) => buffer?,
        };
        Ok((buffer, page.exhausted))
    }
}
