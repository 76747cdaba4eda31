//! Protocol messages for the repair wire protocol.
//!
//! All messages are serialized with postcard and sent as length-prefixed
//! frames (see [`crate::frame`]).

use reef_types::{
    DiffAlgorithm, RepairUuid, RowEntry, RowKey, SchemaVersion, ShardConfig, StreamReason,
    TableId, TokenRange,
};
use serde::{Deserialize, Serialize};

/// Identifies the session a message belongs to.
///
/// Every session message carries it so the follower can route it to the
/// right shard and check it against the registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Session id, unique per master node.
    pub repair_meta_id: u32,
    /// Shard the session lives on at the master. Receivers map it onto
    /// their own shard count.
    pub dst_shard: u32,
    /// The table being repaired.
    pub table_id: TableId,
    /// The token range being repaired.
    pub range: TokenRange,
    /// Schema version the master reads with.
    pub schema_version: SchemaVersion,
}

/// The comparable digest of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDigest {
    /// Primary key.
    pub key: RowKey,
    /// Session-seeded content hash.
    pub hash: u64,
    /// Write timestamp, used to decide which side holds the newer version.
    pub timestamp: i64,
}

/// Error classes reported in-band by a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The follower reads the table with another schema version.
    SchemaMismatch,
    /// The follower does not know the table.
    NoSuchTable,
    /// The referenced session is not registered on the follower.
    RepairMetaNotFound,
    /// The session id is already registered.
    DuplicateRepairMeta,
    /// Another session already covers this (peer, range, table).
    RangeBusy,
    /// The follower is shutting down.
    ShuttingDown,
    /// The follower's storage failed.
    Storage,
    /// The request made no sense in the session's current state.
    Protocol,
}

/// Protocol messages exchanged between reef nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairMessage {
    /// Open a session on the follower (expects [`RepairMessage::Ack`]).
    RowLevelStart {
        /// Session identity and target.
        header: SessionHeader,
        /// Comparison strategy for the session.
        algorithm: DiffAlgorithm,
        /// Per-page byte budget.
        max_row_buf_size: u64,
        /// Seed mixed into every row hash.
        seed: u64,
        /// Shard layout of the master.
        master_shard: ShardConfig,
        /// Why data is moving.
        reason: StreamReason,
    },

    /// Ask for the digests of the follower's rows in `(after, until]`.
    GetRowHashes {
        /// Session header.
        header: SessionHeader,
        /// Exclusive lower key bound, `None` for the range start.
        after: Option<RowKey>,
        /// Inclusive upper key bound, `None` for the range end.
        until: Option<RowKey>,
        /// Page byte budget.
        max_bytes: u64,
    },

    /// Response to [`RepairMessage::GetRowHashes`].
    RowHashes {
        /// Digests in key order.
        digests: Vec<RowDigest>,
        /// Whether the follower holds no further rows up to `until`.
        exhausted: bool,
    },

    /// Ask for the follower's full rows in `(after, until]`.
    GetFullRows {
        /// Session header.
        header: SessionHeader,
        /// Exclusive lower key bound.
        after: Option<RowKey>,
        /// Inclusive upper key bound.
        until: Option<RowKey>,
        /// Page byte budget.
        max_bytes: u64,
    },

    /// Response to [`RepairMessage::GetFullRows`].
    FullRows {
        /// Rows in key order.
        rows: Vec<RowEntry>,
        /// Whether the follower holds no further rows up to `until`.
        exhausted: bool,
    },

    /// Ask for specific rows of the follower's current page.
    GetRowDiff {
        /// Session header.
        header: SessionHeader,
        /// Keys the master needs.
        keys: Vec<RowKey>,
    },

    /// Response to [`RepairMessage::GetRowDiff`].
    RowDiff {
        /// Requested rows that the follower holds.
        rows: Vec<RowEntry>,
    },

    /// Stream rows to the follower (expects [`RepairMessage::PutRowDiffAck`]).
    ///
    /// The follower applies the rows to storage before acknowledging.
    PutRowDiff {
        /// Session header.
        header: SessionHeader,
        /// Rows to apply.
        rows: Vec<RowEntry>,
    },

    /// Acknowledgement that streamed rows were applied.
    PutRowDiffAck {
        /// Number of rows applied.
        applied: u64,
    },

    /// Tear the session down on the follower.
    RowLevelStop {
        /// Session header.
        header: SessionHeader,
    },

    /// Record a finished range in the follower's repair history.
    UpdateSystemTable {
        /// Job or node operation that finished the range.
        repair_id: RepairUuid,
        /// The table.
        table_id: TableId,
        /// The range.
        range: TokenRange,
        /// Completion time, unix millis.
        finished_at: u64,
    },

    /// Response to [`RepairMessage::UpdateSystemTable`].
    UpdateSystemTableAck,

    /// Ask the follower to flush hints and batchlog before repair starts.
    FlushHintsBatchlog,

    /// Response to [`RepairMessage::FlushHintsBatchlog`].
    FlushHintsBatchlogAck,

    /// Generic success response.
    Ack,

    /// In-band failure response.
    Error {
        /// Error class.
        kind: RemoteErrorKind,
        /// Rendered error.
        message: String,
    },
}

impl RepairMessage {
    /// Short verb name for logs and counters.
    pub fn verb(&self) -> &'static str {
        match self {
            RepairMessage::RowLevelStart { .. } => "row_level_start",
            RepairMessage::GetRowHashes { .. } => "get_row_hashes",
            RepairMessage::RowHashes { .. } => "row_hashes",
            RepairMessage::GetFullRows { .. } => "get_full_rows",
            RepairMessage::FullRows { .. } => "full_rows",
            RepairMessage::GetRowDiff { .. } => "get_row_diff",
            RepairMessage::RowDiff { .. } => "row_diff",
            RepairMessage::PutRowDiff { .. } => "put_row_diff",
            RepairMessage::PutRowDiffAck { .. } => "put_row_diff_ack",
            RepairMessage::RowLevelStop { .. } => "row_level_stop",
            RepairMessage::UpdateSystemTable { .. } => "update_system_table",
            RepairMessage::UpdateSystemTableAck => "update_system_table_ack",
            RepairMessage::FlushHintsBatchlog => "flush_hints_batchlog",
            RepairMessage::FlushHintsBatchlogAck => "flush_hints_batchlog_ack",
            RepairMessage::Ack => "ack",
            RepairMessage::Error { .. } => "error",
        }
    }

    /// The session header, for session messages.
    pub fn header(&self) -> Option<&SessionHeader> {
        match self {
            RepairMessage::RowLevelStart { header, .. }
            | RepairMessage::GetRowHashes { header, .. }
            | RepairMessage::GetFullRows { header, .. }
            | RepairMessage::GetRowDiff { header, .. }
            | RepairMessage::PutRowDiff { header, .. }
            | RepairMessage::RowLevelStop { header } => Some(header),
            _ => None,
        }
    }

    /// Build an in-band error response.
    pub fn error(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        RepairMessage::Error {
            kind,
            message: message.into(),
        }
    }
}
