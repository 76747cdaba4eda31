//! Error types for the metadata store.

/// Errors returned by [`MetaStore`](crate::MetaStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error, including failure to create a temporary directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),

    /// A key in `keyspace` does not have the expected layout.
    #[error("corrupt key in {keyspace}: {len} bytes")]
    CorruptKey {
        /// Keyspace holding the key.
        keyspace: &'static str,
        /// Length of the offending key.
        len: usize,
    },
}
