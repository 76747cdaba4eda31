//! Core trait and types for row storage.

use reef_types::{RowEntry, RowKey, SchemaVersion, TableId, TokenRange};

use crate::error::StoreError;

/// Identity and current schema version of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Stable table identifier.
    pub table_id: TableId,
    /// Keyspace the table belongs to.
    pub keyspace: String,
    /// Table name.
    pub name: String,
    /// Current schema version.
    pub version: SchemaVersion,
}

/// One page of rows read in primary-key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPage {
    /// Rows of the page, sorted by key.
    pub rows: Vec<RowEntry>,
    /// Whether the requested interval holds no rows beyond this page.
    pub exhausted: bool,
}

/// Trait for reading and writing table rows.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait RowStore: Send + Sync {
    /// Names of every keyspace holding at least one table, sorted.
    async fn keyspaces(&self) -> Result<Vec<String>, StoreError>;

    /// Tables of a keyspace. An unknown keyspace has no tables.
    async fn tables(&self, keyspace: &str) -> Result<Vec<TableSchema>, StoreError>;

    /// Look up a table by id. Returns `None` if it does not exist.
    async fn schema(&self, table_id: TableId) -> Result<Option<TableSchema>, StoreError>;

    /// Read rows of `table_id` whose token lies in `range`, with key
    /// strictly greater than `after` and at most `until`, in key order.
    ///
    /// Rows are accumulated while their estimated size fits in `max_bytes`;
    /// a page always holds at least one row when any is available.
    async fn read_rows(
        &self,
        table_id: TableId,
        range: &TokenRange,
        after: Option<&RowKey>,
        until: Option<&RowKey>,
        max_bytes: u64,
    ) -> Result<ReadPage, StoreError>;

    /// Apply rows, reconciling each with the stored version.
    async fn apply(&self, table_id: TableId, rows: Vec<RowEntry>) -> Result<(), StoreError>;

    /// Flush pending hints and batchlog entries so that repair sees them.
    async fn flush_hints_batchlog(&self) -> Result<(), StoreError>;
}
