//! Error types for repair operations.

use reef_net::RemoteErrorKind;
use reef_types::{NodeId, TableId, TokenRange};

use crate::meta::RepairState;

/// Errors that can occur during repair operations.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    /// A session with the same (peer, id) is already registered.
    #[error("repair meta {id} for peer {peer} already exists")]
    DuplicateRepairMeta {
        /// The peer.
        peer: NodeId,
        /// Session id.
        id: u32,
    },

    /// No session with this (peer, id) is registered.
    #[error("repair meta {id} for peer {peer} not found")]
    RepairMetaNotFound {
        /// The peer.
        peer: NodeId,
        /// Session id.
        id: u32,
    },

    /// Another session already covers this (peer, range, table).
    #[error("range {range} of table {table_id} is already being repaired with {peer}")]
    RangeBusy {
        /// The peer.
        peer: NodeId,
        /// The table.
        table_id: TableId,
        /// The range.
        range: TokenRange,
    },

    /// Both sides disagree on the table schema.
    #[error("schema version mismatch for table {table_id} with peer {peer}")]
    SchemaMismatch {
        /// The peer.
        peer: NodeId,
        /// The table.
        table_id: TableId,
    },

    /// The table does not exist locally.
    #[error("no such table: {0}")]
    NoSuchTable(TableId),

    /// The peer sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer reported a failure.
    #[error("peer {peer} failed: {kind:?}: {message}")]
    Remote {
        /// The peer.
        peer: NodeId,
        /// Error class reported by the peer.
        kind: RemoteErrorKind,
        /// Rendered error.
        message: String,
    },

    /// Repair options could not be parsed.
    #[error("invalid repair options: {0}")]
    InvalidOptions(String),

    /// A session state change that the state machine does not allow.
    #[error("invalid repair state transition {from:?} -> {to:?}")]
    InvalidState {
        /// Current state.
        from: RepairState,
        /// Requested state.
        to: RepairState,
    },

    /// The job id is not tracked.
    #[error("unknown repair job {0}")]
    UnknownJob(i32),

    /// The service is shutting down and accepts no new work.
    #[error("repair service is shutting down")]
    ShuttingDown,

    /// The work was cancelled.
    #[error("repair aborted")]
    Aborted,

    /// Failed to talk to a peer.
    #[error("network error: {0}")]
    Net(#[from] reef_net::NetError),

    /// Failed to access row storage.
    #[error("store error: {0}")]
    Store(#[from] reef_store::StoreError),

    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] reef_meta::MetaError),
}

impl RepairError {
    /// The class reported to a peer when this error ends a request.
    pub fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            RepairError::SchemaMismatch { .. } => RemoteErrorKind::SchemaMismatch,
            RepairError::NoSuchTable(_) => RemoteErrorKind::NoSuchTable,
            RepairError::RepairMetaNotFound { .. } => RemoteErrorKind::RepairMetaNotFound,
            RepairError::DuplicateRepairMeta { .. } => RemoteErrorKind::DuplicateRepairMeta,
            RepairError::RangeBusy { .. } => RemoteErrorKind::RangeBusy,
            RepairError::ShuttingDown | RepairError::Aborted => RemoteErrorKind::ShuttingDown,
            RepairError::Store(_) | RepairError::Meta(_) => RemoteErrorKind::Storage,
            _ => RemoteErrorKind::Protocol,
        }
    }
}
