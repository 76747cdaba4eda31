//! In-memory row storage backend.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use reef_types::{Mutation, RowEntry, RowKey, SchemaVersion, TableId, TokenRange};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{ReadPage, RowStore, TableSchema};

struct Table {
    schema: TableSchema,
    rows: BTreeMap<RowKey, Mutation>,
}

/// In-memory row store backed by a `RwLock<HashMap>` of sorted tables.
///
/// Used by tests and by the daemon's simulation mode.
#[derive(Default)]
pub struct MemoryRowStore {
    tables: RwLock<HashMap<TableId, Table>>,
    fail_writes: AtomicBool,
    hint_flushes: AtomicU64,
}

impl MemoryRowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table and return its schema.
    pub fn create_table(&self, keyspace: &str, name: &str) -> Result<TableSchema, StoreError> {
        self.create_table_with_id(TableId::new_random(), keyspace, name)
    }

    /// Create a table with a fixed id, as when the same schema exists on
    /// several nodes.
    pub fn create_table_with_id(
        &self,
        table_id: TableId,
        keyspace: &str,
        name: &str,
    ) -> Result<TableSchema, StoreError> {
        let mut tables = self.tables.write().expect("lock poisoned");
        if tables
            .values()
            .any(|t| t.schema.keyspace == keyspace && t.schema.name == name)
        {
            return Err(StoreError::TableExists {
                keyspace: keyspace.to_string(),
                name: name.to_string(),
            });
        }
        let schema = TableSchema {
            table_id,
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            version: SchemaVersion::from(*table_id.as_uuid()),
        };
        tables.insert(
            table_id,
            Table {
                schema: schema.clone(),
                rows: BTreeMap::new(),
            },
        );
        debug!(%table_id, keyspace, name, "created table");
        Ok(schema)
    }

    /// Change the schema version of a table.
    pub fn set_schema_version(
        &self,
        table_id: TableId,
        version: SchemaVersion,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().expect("lock poisoned");
        let table = tables
            .get_mut(&table_id)
            .ok_or(StoreError::NoSuchTable(table_id))?;
        table.schema.version = version;
        Ok(())
    }

    /// Write one row, reconciling with the stored version.
    pub fn insert(
        &self,
        table_id: TableId,
        key: impl Into<Bytes>,
        mutation: Mutation,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().expect("lock poisoned");
        let table = tables
            .get_mut(&table_id)
            .ok_or(StoreError::NoSuchTable(table_id))?;
        merge(&mut table.rows, RowKey::new(key), mutation);
        Ok(())
    }

    /// Read the stored version of one row.
    pub fn get(&self, table_id: TableId, key: &[u8]) -> Option<Mutation> {
        let tables = self.tables.read().expect("lock poisoned");
        let key = RowKey::new(Bytes::copy_from_slice(key));
        tables.get(&table_id)?.rows.get(&key).cloned()
    }

    /// Every row of a table whose token lies in `range`, in key order.
    pub fn snapshot(&self, table_id: TableId, range: &TokenRange) -> Vec<RowEntry> {
        let tables = self.tables.read().expect("lock poisoned");
        let Some(table) = tables.get(&table_id) else {
            return Vec::new();
        };
        table
            .rows
            .iter()
            .filter(|(k, _)| range.contains(k.token))
            .map(|(k, m)| RowEntry::new(k.clone(), m.clone()))
            .collect()
    }

    /// Number of rows in a table, tombstones included.
    pub fn row_count(&self, table_id: TableId) -> usize {
        let tables = self.tables.read().expect("lock poisoned");
        tables.get(&table_id).map_or(0, |t| t.rows.len())
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// How many times hints and batchlog were flushed.
    pub fn hint_flushes(&self) -> u64 {
        self.hint_flushes.load(Ordering::Relaxed)
    }
}

fn merge(rows: &mut BTreeMap<RowKey, Mutation>, key: RowKey, mutation: Mutation) {
    match rows.remove(&key) {
        Some(existing) => {
            rows.insert(key, existing.reconcile(mutation));
        }
        None => {
            rows.insert(key, mutation);
        }
    }
}

#[async_trait::async_trait]
impl RowStore for MemoryRowStore {
    async fn keyspaces(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut out: Vec<String> = tables.values().map(|t| t.schema.keyspace.clone()).collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn tables(&self, keyspace: &str) -> Result<Vec<TableSchema>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut out: Vec<TableSchema> = tables
            .values()
            .filter(|t| t.schema.keyspace == keyspace)
            .map(|t| t.schema.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn schema(&self, table_id: TableId) -> Result<Option<TableSchema>, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        Ok(tables.get(&table_id).map(|t| t.schema.clone()))
    }

    async fn read_rows(
        &self,
        table_id: TableId,
        range: &TokenRange,
        after: Option<&RowKey>,
        until: Option<&RowKey>,
        max_bytes: u64,
    ) -> Result<ReadPage, StoreError> {
        let tables = self.tables.read().expect("lock poisoned");
        let table = tables
            .get(&table_id)
            .ok_or(StoreError::NoSuchTable(table_id))?;

        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None if range.is_wrapping() => Bound::Unbounded,
            None => Bound::Included(RowKey {
                token: range.start,
                key: Bytes::new(),
            }),
        };

        let mut page = ReadPage {
            rows: Vec::new(),
            exhausted: true,
        };
        let mut used = 0u64;

        for (key, mutation) in table.rows.range((lower, Bound::Unbounded)) {
            if let Some(until) = until
                && key > until
            {
                break;
            }
            if !range.contains(key.token) {
                if !range.is_wrapping() && key.token > range.end {
                    break;
                }
                continue;
            }
            let entry = RowEntry::new(key.clone(), mutation.clone());
            let size = entry.estimated_size();
            if !page.rows.is_empty() && used + size > max_bytes {
                page.exhausted = false;
                break;
            }
            used += size;
            page.rows.push(entry);
        }

        Ok(page)
    }

    async fn apply(&self, table_id: TableId, rows: Vec<RowEntry>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut tables = self.tables.write().expect("lock poisoned");
        let table = tables
            .get_mut(&table_id)
            .ok_or(StoreError::NoSuchTable(table_id))?;
        let count = rows.len();
        for row in rows {
            merge(&mut table.rows, row.key, row.mutation);
        }
        debug!(%table_id, rows = count, "applied rows");
        Ok(())
    }

    async fn flush_hints_batchlog(&self) -> Result<(), StoreError> {
        self.hint_flushes.fetch_add(1, Ordering::Relaxed);
        debug!("flushed hints and batchlog");
        Ok(())
    }
}
