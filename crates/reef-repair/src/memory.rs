//! Memory accounting for buffered repair rows.
//!
//! Every shard owns one [`MemoryPool`]. A row buffered by a session (read
//! from local storage or received from a peer) holds a [`RowPermit`] sized
//! to its estimated serialized size until it is released. When the pool is
//! exhausted, readers wait: back-pressure, never drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reef_store::RowStore;
use reef_types::{RowEntry, RowKey, TableId};
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::error::RepairError;
use crate::row::RepairRow;

struct PoolInner {
    sem: Semaphore,
    max: u32,
    in_use: AtomicU64,
    peak: AtomicU64,
}

/// Per-shard byte budget for buffered rows.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Create a pool of `max_bytes`, clamped to what a semaphore can count.
    pub fn new(max_bytes: u64) -> Self {
        let max = max_bytes.clamp(1, u32::MAX as u64) as u32;
        Self {
            inner: Arc::new(PoolInner {
                sem: Semaphore::new(max as usize),
                max,
                in_use: AtomicU64::new(0),
                peak: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire one permit per row, in order, as a single wait.
    ///
    /// The total is clamped to the pool maximum; rows beyond the clamp get
    /// empty permits. Fails with [`RepairError::Aborted`] once the pool is
    /// closed.
    pub async fn acquire(&self, sizes: &[u64]) -> Result<Vec<RowPermit>, RepairError> {
        let max = self.inner.max as u64;
        let mut left = sizes.iter().sum::<u64>().min(max);
        let total = left as u32;

        if total > 0 {
            let permit = self
                .inner
                .sem
                .acquire_many(total)
                .await
                .map_err(|_| RepairError::Aborted)?;
            permit.forget();
            let now = self.inner.in_use.fetch_add(total as u64, Ordering::AcqRel) + total as u64;
            self.inner.peak.fetch_max(now, Ordering::AcqRel);
            trace!(bytes = total, in_use = now, "acquired repair memory");
        }

        Ok(sizes
            .iter()
            .map(|size| {
                let n = (*size).min(left);
                left -= n;
                RowPermit {
                    pool: self.inner.clone(),
                    bytes: n as u32,
                }
            })
            .collect())
    }

    /// Make every pending and future acquire fail.
    pub fn close(&self) {
        self.inner.sem.close();
        debug!("repair memory pool closed");
    }

    /// Bytes currently held by permits.
    pub fn in_use(&self) -> u64 {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Highest value [`MemoryPool::in_use`] ever reached.
    pub fn peak(&self) -> u64 {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// Pool size in bytes.
    pub fn max(&self) -> u64 {
        self.inner.max as u64
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("max", &self.inner.max)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Memory held by one buffered row. Returned to the pool on drop.
pub struct RowPermit {
    pool: Arc<PoolInner>,
    bytes: u32,
}

impl RowPermit {
    /// Bytes held.
    pub fn bytes(&self) -> u64 {
        self.bytes as u64
    }
}

impl Drop for RowPermit {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.pool.sem.add_permits(self.bytes as usize);
            self.pool.in_use.fetch_sub(self.bytes as u64, Ordering::AcqRel);
        }
    }
}

/// Rows of one page, in key order, each holding its permit.
#[derive(Default)]
pub struct RowBuffer {
    rows: Vec<RepairRow>,
    permits: Vec<RowPermit>,
}

impl RowBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire permits for `rows` and buffer them.
    pub async fn fill(pool: &MemoryPool, rows: Vec<RepairRow>) -> Result<Self, RepairError> {
        let sizes: Vec<u64> = rows.iter().map(RepairRow::estimated_size).collect();
        let permits = pool.acquire(&sizes).await?;
        Ok(Self { rows, permits })
    }

    /// Buffered rows in key order.
    pub fn rows(&self) -> &[RepairRow] {
        &self.rows
    }

    /// Number of buffered rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a buffered row.
    pub fn get(&self, key: &RowKey) -> Option<&RepairRow> {
        self.rows
            .binary_search_by(|r| r.key().cmp(key))
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Drop every row with a key greater than `key`.
    pub fn truncate_after(&mut self, key: &RowKey) {
        let keep = self.rows.partition_point(|r| r.key() <= key);
        self.rows.truncate(keep);
        // Newest rows go first here; they are re-read next round.
        while self.permits.len() > keep {
            self.permits.pop();
        }
    }

    /// Keep only the rows whose key is in `keys` (sorted), releasing the
    /// others oldest first.
    pub fn retain_keys(&mut self, keys: &[RowKey]) {
        let rows = std::mem::take(&mut self.rows);
        let permits = std::mem::take(&mut self.permits);
        for (row, permit) in rows.into_iter().zip(permits) {
            if keys.binary_search(row.key()).is_ok() {
                self.rows.push(row);
                self.permits.push(permit);
            }
        }
    }

    /// Release every row, oldest first.
    pub fn release(&mut self) {
        self.rows.clear();
        for permit in self.permits.drain(..) {
            drop(permit);
        }
    }
}

impl Drop for RowBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Writes rows received from a peer to local storage.
///
/// Received rows hold permits until flushed. Flushes apply rows in the
/// order they were received and release their permits oldest first.
pub struct RowWriter {
    store: Arc<dyn RowStore>,
    table_id: TableId,
    pool: MemoryPool,
    flush_threshold: u64,
    pending: Vec<RowEntry>,
    permits: Vec<RowPermit>,
    pending_bytes: u64,
    written: u64,
}

impl RowWriter {
    /// Create a writer that flushes once `flush_threshold` bytes are pending.
    pub fn new(
        store: Arc<dyn RowStore>,
        table_id: TableId,
        pool: MemoryPool,
        flush_threshold: u64,
    ) -> Self {
        Self {
            store,
            table_id,
            pool,
            flush_threshold,
            pending: Vec::new(),
            permits: Vec::new(),
            pending_bytes: 0,
            written: 0,
        }
    }

    /// Buffer received rows, flushing when the threshold is reached.
    pub async fn push(&mut self, rows: Vec<RowEntry>) -> Result<(), RepairError> {
        if rows.is_empty() {
            return Ok(());
        }
        let sizes: Vec<u64> = rows.iter().map(RowEntry::estimated_size).collect();
        let permits = self.pool.acquire(&sizes).await?;
        self.pending_bytes += sizes.iter().sum::<u64>();
        self.pending.extend(rows);
        self.permits.extend(permits);
        if self.pending_bytes >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Apply everything pending. Returns the number of rows written.
    pub async fn flush(&mut self) -> Result<u64, RepairError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(&mut self.pending);
        let count = rows.len() as u64;
        self.store.apply(self.table_id, rows).await?;
        for permit in self.permits.drain(..) {
            drop(permit);
        }
        self.pending_bytes = 0;
        self.written += count;
        debug!(table_id = %self.table_id, rows = count, "flushed received rows");
        Ok(count)
    }

    /// Rows written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}
