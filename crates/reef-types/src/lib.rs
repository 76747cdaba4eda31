//! Shared types and identifiers for reef.
//!
//! This crate defines the vocabulary used across the reef workspace:
//! identifiers ([`NodeId`], [`TableId`], [`SchemaVersion`]), ring positions
//! ([`Token`], [`TokenRange`]), row data ([`RowKey`], [`Mutation`],
//! [`RowEntry`]), repair enums ([`RepairRole`], [`DiffAlgorithm`],
//! [`StreamReason`], [`RepairStatus`]), cluster members ([`Member`]) and
//! configuration ([`RepairConfig`]).

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Identifier for a cluster node (an RPC endpoint).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create an ID by hashing arbitrary data with BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters, for compact log lines.
    pub fn fmt_short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.fmt_short())
    }
}

/// Error returned when parsing a [`NodeId`] from hex fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNodeIdError(String);

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id {:?}: expected 64 hex characters", self.0)
    }
}

impl std::error::Error for ParseNodeIdError {}

impl std::str::FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseNodeIdError(s.to_string());
        if s.len() != 64 || !s.is_ascii() {
            return Err(err());
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| err())?;
        }
        Ok(Self(bytes))
    }
}

macro_rules! define_uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Return the wrapped UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_uuid_id!(
    /// Identifier of a table, stable across schema changes.
    TableId
);

define_uuid_id!(
    /// Version of a table schema. Both sides of a session must agree on it.
    SchemaVersion
);

define_uuid_id!(
    /// Identifier of a repair job or node operation, used as the history key.
    RepairUuid
);

// ---------------------------------------------------------------------------
// Ring positions
// ---------------------------------------------------------------------------

/// A position on the partitioner ring.
///
/// `Token::MIN` is reserved as the ring origin and is never produced by
/// [`Token::of`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct Token(pub i64);

impl Token {
    /// The ring origin. Never owned by any key.
    pub const MIN: Token = Token(i64::MIN);
    /// The last position on the ring.
    pub const MAX: Token = Token(i64::MAX);

    /// Partition a key onto the ring: first 8 bytes of `blake3(key)`.
    pub fn of(key: &[u8]) -> Self {
        let hash = blake3::hash(key);
        let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
        match i64::from_le_bytes(bytes) {
            i64::MIN => Token(i64::MIN + 1),
            v => Token(v),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A half-open token range `(start, end]`.
///
/// A range with `start >= end` wraps around the ring origin. Ranges handed
/// out by the ring never wrap; use [`TokenRange::split_wrapping`] to split one that
/// does.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct TokenRange {
    /// Exclusive lower bound.
    pub start: Token,
    /// Inclusive upper bound.
    pub end: Token,
}

impl TokenRange {
    /// Create a range `(start, end]`.
    pub fn new(start: Token, end: Token) -> Self {
        Self { start, end }
    }

    /// The whole ring.
    pub fn full() -> Self {
        Self::new(Token::MIN, Token::MAX)
    }

    /// Whether this range crosses the ring origin.
    pub fn is_wrapping(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `token` falls inside the range.
    pub fn contains(&self, token: Token) -> bool {
        if self.is_wrapping() {
            token > self.start || token <= self.end
        } else {
            token > self.start && token <= self.end
        }
    }

    /// The part of two non-wrapping ranges they have in common.
    pub fn intersection(&self, other: &TokenRange) -> Option<TokenRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| TokenRange::new(start, end))
    }

    /// Split a wrapping range at the ring origin. Non-wrapping ranges are
    /// returned unchanged.
    pub fn split_wrapping(&self) -> Vec<TokenRange> {
        if !self.is_wrapping() {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(2);
        if self.start != Token::MAX {
            out.push(TokenRange::new(self.start, Token::MAX));
        }
        if self.end != Token::MIN {
            out.push(TokenRange::new(Token::MIN, self.end));
        }
        out
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Row data
// ---------------------------------------------------------------------------

/// Primary key of a row: its token first, then the raw partition key.
///
/// The derived ordering is the primary-key order both sides of a repair
/// session read in.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    /// Ring position of the key.
    pub token: Token,
    /// Raw partition key bytes.
    pub key: Bytes,
}

impl RowKey {
    /// Build a key, computing its token.
    pub fn new(key: impl Into<Bytes>) -> Self {
        let key = key.into();
        Self {
            token: Token::of(&key),
            key,
        }
    }

    /// Serialized size estimate in bytes.
    pub fn estimated_size(&self) -> u64 {
        8 + self.key.len() as u64
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({}, {:?})", self.token, String::from_utf8_lossy(&self.key))
    }
}

/// A versioned cell value. `value == None` is a deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mutation {
    /// Write timestamp (microseconds, client supplied).
    pub timestamp: i64,
    /// The written value, or `None` for a deletion.
    pub value: Option<Bytes>,
}

impl Mutation {
    /// A live write.
    pub fn live(timestamp: i64, value: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
        }
    }

    /// A deletion.
    pub fn tombstone(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }

    /// Whether this mutation deletes the row.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Order two versions of a row. `Greater` means `self` wins.
    ///
    /// Higher timestamp wins; on a tie a tombstone wins, then the larger value.
    pub fn compare_version(&self, other: &Mutation) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| match (&self.value, &other.value) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }

    /// Merge two versions, keeping the winner.
    pub fn reconcile(self, other: Mutation) -> Mutation {
        if other.compare_version(&self) == Ordering::Greater {
            other
        } else {
            self
        }
    }

    /// Serialized size estimate in bytes.
    pub fn estimated_size(&self) -> u64 {
        9 + self.value.as_ref().map_or(0, |v| v.len() as u64)
    }
}

/// A row as it travels on the wire: key plus mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEntry {
    /// Primary key.
    pub key: RowKey,
    /// Row content.
    pub mutation: Mutation,
}

impl RowEntry {
    /// Build a row entry.
    pub fn new(key: RowKey, mutation: Mutation) -> Self {
        Self { key, mutation }
    }

    /// Serialized size estimate in bytes, used to size memory permits.
    pub fn estimated_size(&self) -> u64 {
        self.key.estimated_size() + self.mutation.estimated_size()
    }
}

// ---------------------------------------------------------------------------
// Repair enums
// ---------------------------------------------------------------------------

/// Which side of a repair session a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairRole {
    /// Initiates the session and drives the rounds.
    Master,
    /// Answers the master's requests.
    Follower,
}

/// Row comparison strategy, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffAlgorithm {
    /// Exchange per-row hashes, then fetch only the rows that differ.
    HashOnly,
    /// Exchange full rows in one round trip per page.
    FullRow,
}

impl DiffAlgorithm {
    /// Name used in options and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffAlgorithm::HashOnly => "hash_only",
            DiffAlgorithm::FullRow => "full_row",
        }
    }

    /// Parse a name produced by [`DiffAlgorithm::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hash_only" => Some(DiffAlgorithm::HashOnly),
            "full_row" => Some(DiffAlgorithm::FullRow),
            _ => None,
        }
    }
}

/// Why data is being moved. Threaded through to the streaming step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamReason {
    /// Regular anti-entropy repair.
    Repair,
    /// A node joining the ring.
    Bootstrap,
    /// The local node leaving the ring.
    Decommission,
    /// A dead node being removed from the ring.
    Removenode,
    /// Re-streaming all local ranges, optionally from one datacenter.
    Rebuild,
    /// A node taking over a dead node's tokens.
    Replace,
}

impl StreamReason {
    /// Whether rows missing on the master are pulled from followers.
    pub fn pulls_to_master(&self) -> bool {
        !matches!(self, StreamReason::Decommission)
    }

    /// Whether rows missing on followers are pushed from the master.
    pub fn pushes_to_followers(&self) -> bool {
        matches!(self, StreamReason::Repair | StreamReason::Decommission)
    }
}

impl fmt::Display for StreamReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamReason::Repair => "repair",
            StreamReason::Bootstrap => "bootstrap",
            StreamReason::Decommission => "decommission",
            StreamReason::Removenode => "removenode",
            StreamReason::Rebuild => "rebuild",
            StreamReason::Replace => "replace",
        };
        f.write_str(s)
    }
}

/// Status of a tracked repair job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairStatus {
    /// Still in progress.
    Running,
    /// Every range finished.
    Successful,
    /// At least one range failed, or the job was aborted.
    Failed,
}

impl RepairStatus {
    /// Whether the job has left `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RepairStatus::Running)
    }
}

/// Shard layout of the node that created a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardConfig {
    /// The shard the session lives on.
    pub shard: u32,
    /// Number of shards on that node.
    pub shard_count: u32,
    /// Partitioner sharding parameter of that node.
    pub ignore_msb: u32,
}

// ---------------------------------------------------------------------------
// Cluster types
// ---------------------------------------------------------------------------

/// A member of the cluster as seen by gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique identifier for this node.
    pub node_id: NodeId,
    /// Current liveness.
    pub state: MemberState,
    /// Incarnation number, incremented on each restart.
    pub generation: u64,
}

/// Liveness of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Node is responsive.
    Alive,
    /// Node has been declared unreachable.
    Dead,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs of the repair service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Number of shards (independent registries and memory pools).
    pub shard_count: u32,
    /// Memory budget per shard for buffered rows, in bytes.
    pub max_repair_memory: u64,
    /// Per-session page budget, in bytes.
    pub max_row_buf_size: u64,
    /// Default comparison strategy.
    pub algorithm: DiffAlgorithm,
    /// Ranges repaired concurrently within one job.
    pub range_parallelism: usize,
    /// Streaming bandwidth limit in bytes per second. 0 disables throttling.
    pub max_bandwidth: u64,
    /// Replicas per token range.
    pub replication_factor: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            max_repair_memory: 64 * 1024 * 1024,
            max_row_buf_size: 1024 * 1024,
            algorithm: DiffAlgorithm::HashOnly,
            range_parallelism: 16,
            max_bandwidth: 0,
            replication_factor: 3,
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
