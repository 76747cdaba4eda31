//! Error types for row storage operations.

use reef_types::TableId;

/// Errors that can occur during row storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested table does not exist.
    #[error("no such table: {0}")]
    NoSuchTable(TableId),

    /// A table with the same keyspace and name already exists.
    #[error("table already exists: {keyspace}.{name}")]
    TableExists {
        /// Keyspace name.
        keyspace: String,
        /// Table name.
        name: String,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
