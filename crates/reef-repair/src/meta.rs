//! Repair session state: [`RepairMeta`] and its state machine.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use reef_net::SessionHeader;
use reef_types::{
    DiffAlgorithm, NodeId, RepairRole, SchemaVersion, ShardConfig, StreamReason, TableId,
    TokenRange,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RepairError;
use crate::memory::RowBuffer;

/// Lifecycle of a repair session.
///
/// Rounds cycle `Hashing -> ExchangingDiffs -> Streaming -> Hashing` until
/// the range is exhausted, then `Streaming -> Complete`. `Failed` and
/// `Aborted` are reachable from any non-terminal state. Terminal states
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairState {
    /// Registered, nothing exchanged yet.
    Init,
    /// Reading and hashing a page.
    Hashing,
    /// Comparing the two sides of a round.
    ExchangingDiffs,
    /// Moving differing rows.
    Streaming,
    /// The whole range was reconciled.
    Complete,
    /// An error ended the session.
    Failed,
    /// The session was cancelled.
    Aborted,
}

impl RepairState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RepairState::Complete | RepairState::Failed | RepairState::Aborted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RepairState) -> bool {
        use RepairState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Init, Hashing)
                | (Hashing, ExchangingDiffs)
                | (ExchangingDiffs, Streaming)
                | (Streaming, Hashing)
                | (Streaming, Complete)
                | (_, Failed)
                | (_, Aborted)
        )
    }

    fn next_in_cycle(&self) -> Option<RepairState> {
        match self {
            RepairState::Init => Some(RepairState::Hashing),
            RepairState::Hashing => Some(RepairState::ExchangingDiffs),
            RepairState::ExchangingDiffs => Some(RepairState::Streaming),
            RepairState::Streaming => Some(RepairState::Hashing),
            _ => None,
        }
    }
}

/// Everything needed to register a session.
#[derive(Debug, Clone)]
pub struct RepairMetaParams {
    /// The other side of the session.
    pub peer: NodeId,
    /// Shard the session was created on at the master.
    pub src_shard: u32,
    /// Session id, unique per master.
    pub id: u32,
    /// Our role.
    pub role: RepairRole,
    /// Token range being repaired.
    pub range: TokenRange,
    /// Table being repaired.
    pub table_id: TableId,
    /// Schema version both sides must agree on.
    pub schema_version: SchemaVersion,
    /// Comparison strategy.
    pub algorithm: DiffAlgorithm,
    /// Per-page byte budget.
    pub max_row_buf_size: u64,
    /// Hash seed.
    pub seed: u64,
    /// Shard layout of the master.
    pub shard_config: ShardConfig,
    /// Why data is moving.
    pub reason: StreamReason,
}

/// Per-session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Rounds completed.
    pub rounds: AtomicU64,
    /// Rows sent to the peer.
    pub rows_sent: AtomicU64,
    /// Rows received from the peer and written locally.
    pub rows_received: AtomicU64,
    /// Bytes sent to the peer.
    pub bytes_sent: AtomicU64,
}

/// One active repair session between this node and a peer.
///
/// Identity is `(peer, id)`. Owned by the registry of the shard it was
/// created on; cancelled when removed.
pub struct RepairMeta {
    params: RepairMetaParams,
    shard: u32,
    state: std::sync::Mutex<RepairState>,
    cancel: CancellationToken,
    /// Follower page kept between the row request and the diff request.
    page: Mutex<RowBuffer>,
    stats: SessionStats,
}

impl RepairMeta {
    /// Create a session on local shard `shard`.
    pub fn new(params: RepairMetaParams, shard: u32, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            params,
            shard,
            state: std::sync::Mutex::new(RepairState::Init),
            cancel,
            page: Mutex::new(RowBuffer::new()),
            stats: SessionStats::default(),
        })
    }

    /// The other side of the session.
    pub fn peer(&self) -> NodeId {
        self.params.peer
    }

    /// Session id.
    pub fn id(&self) -> u32 {
        self.params.id
    }

    /// Our role.
    pub fn role(&self) -> RepairRole {
        self.params.role
    }

    /// Token range.
    pub fn range(&self) -> TokenRange {
        self.params.range
    }

    /// Table.
    pub fn table_id(&self) -> TableId {
        self.params.table_id
    }

    /// Schema version.
    pub fn schema_version(&self) -> SchemaVersion {
        self.params.schema_version
    }

    /// Comparison strategy.
    pub fn algorithm(&self) -> DiffAlgorithm {
        self.params.algorithm
    }

    /// Per-page byte budget.
    pub fn max_row_buf_size(&self) -> u64 {
        self.params.max_row_buf_size
    }

    /// Hash seed.
    pub fn seed(&self) -> u64 {
        self.params.seed
    }

    /// Shard layout of the master.
    pub fn shard_config(&self) -> ShardConfig {
        self.params.shard_config
    }

    /// Shard the master created the session on.
    pub fn src_shard(&self) -> u32 {
        self.params.src_shard
    }

    /// Local shard holding the session.
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Why data is moving.
    pub fn reason(&self) -> StreamReason {
        self.params.reason
    }

    /// Registration parameters.
    pub fn params(&self) -> &RepairMetaParams {
        &self.params
    }

    /// Session cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Follower page buffer.
    pub fn page(&self) -> &Mutex<RowBuffer> {
        &self.page
    }

    /// Counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Header of every message the master sends for this session.
    pub fn header(&self) -> SessionHeader {
        SessionHeader {
            repair_meta_id: self.params.id,
            dst_shard: self.shard,
            table_id: self.params.table_id,
            range: self.params.range,
            schema_version: self.params.schema_version,
        }
    }

    /// Current state.
    pub fn state(&self) -> RepairState {
        *self.state.lock().expect("lock poisoned")
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&self, next: RepairState) -> Result<(), RepairError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.can_transition_to(next) {
            return Err(RepairError::InvalidState {
                from: *state,
                to: next,
            });
        }
        debug!(peer = %self.params.peer.fmt_short(), id = self.params.id, from = ?*state, to = ?next, "repair state");
        *state = next;
        Ok(())
    }

    /// Walk the round cycle forward until `target` is reached.
    ///
    /// Used by followers, whose state follows the requests they receive.
    pub fn advance_to(&self, target: RepairState) -> Result<(), RepairError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if *state == target {
            return Ok(());
        }
        if target.is_terminal() {
            if !state.can_transition_to(target) {
                return Err(RepairError::InvalidState {
                    from: *state,
                    to: target,
                });
            }
            *state = target;
            return Ok(());
        }
        let from = *state;
        let mut cur = *state;
        // At most one full cycle.
        for _ in 0..4 {
            match cur.next_in_cycle() {
                Some(next) => {
                    cur = next;
                    if cur == target {
                        *state = cur;
                        return Ok(());
                    }
                }
                None => break,
            }
        }
        Err(RepairError::InvalidState { from, to: target })
    }

    /// Move to `Failed` or `Aborted` unless already terminal.
    pub fn finish_with_error(&self, err: &RepairError) {
        let next = if matches!(err, RepairError::Aborted) || self.is_cancelled() {
            RepairState::Aborted
        } else {
            RepairState::Failed
        };
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.is_terminal() {
            *state = next;
        }
    }
}

impl std::fmt::Debug for RepairMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairMeta")
            .field("peer", &self.params.peer)
            .field("id", &self.params.id)
            .field("role", &self.params.role)
            .field("range", &self.params.range)
            .field("table_id", &self.params.table_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
