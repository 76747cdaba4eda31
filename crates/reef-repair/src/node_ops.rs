//! Membership operations that move data with row-level repair.
//!
//! Each operation computes the token ranges it affects from the ring,
//! resolves the neighbors to sync each range with, and hands both to
//! [`RepairService::sync_data_using_repair`] once per keyspace. A range
//! recorded under the same ops uuid is skipped, so re-running an
//! interrupted operation with the same uuid resumes it.

use std::collections::HashMap;
use std::sync::Arc;

use reef_topology::Ring;
use reef_types::{NodeId, RepairUuid, StreamReason, Token, TokenRange};
use tracing::{info, warn};

use crate::error::RepairError;
use crate::service::RepairService;

type Neighbors = HashMap<TokenRange, Vec<NodeId>>;

impl RepairService {
    /// Pull the data of the ranges the local node takes over when joining
    /// `ring` with `tokens`.
    pub async fn bootstrap_with_repair(
        self: &Arc<Self>,
        ring: &Ring,
        tokens: Vec<Token>,
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        let local = self.local_node();
        let rf = self.config().replication_factor;
        let mut new_ring = ring.clone();
        let (dc, rack) = self.local_location();
        new_ring.add_node_with_tokens(local, &dc, &rack, tokens);

        let mut ranges = Vec::new();
        let mut neighbors = Neighbors::new();
        for range in new_ring.ranges_for(&local, rf) {
            let old: Vec<NodeId> = ring
                .replicas(&range, rf)
                .into_iter()
                .filter(|n| *n != local)
                .collect();
            ranges.push(range);
            neighbors.insert(range, old);
        }
        self.run_node_op(StreamReason::Bootstrap, ranges, neighbors, ops_uuid)
            .await
    }

    /// Push the local node's data to the nodes that replicate its ranges
    /// once it leaves `ring`.
    pub async fn decommission_with_repair(
        self: &Arc<Self>,
        ring: &Ring,
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        let local = self.local_node();
        let rf = self.config().replication_factor;
        let mut new_ring = ring.clone();
        new_ring.remove_node(&local);

        let mut ranges = Vec::new();
        let mut neighbors = Neighbors::new();
        for range in ring.ranges_for(&local, rf) {
            let old = ring.replicas(&range, rf);
            let gained: Vec<NodeId> = new_ring
                .replicas(&range, rf)
                .into_iter()
                .filter(|n| !old.contains(n) && *n != local)
                .collect();
            if gained.is_empty() {
                continue;
            }
            ranges.push(range);
            neighbors.insert(range, gained);
        }
        self.run_node_op(StreamReason::Decommission, ranges, neighbors, ops_uuid)
            .await
    }

    /// Pull the ranges the local node gains when `leaving` is removed from
    /// `ring`, from the replicas that remain.
    pub async fn removenode_with_repair(
        self: &Arc<Self>,
        ring: &Ring,
        leaving: NodeId,
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        let local = self.local_node();
        let rf = self.config().replication_factor;
        let mut new_ring = ring.clone();
        new_ring.remove_node(&leaving);

        let mut ranges = Vec::new();
        let mut neighbors = Neighbors::new();
        for range in ring.ranges() {
            let old = ring.replicas(&range, rf);
            if old.contains(&local) || !new_ring.replicas(&range, rf).contains(&local) {
                continue;
            }
            let sources: Vec<NodeId> = old.into_iter().filter(|n| *n != leaving).collect();
            ranges.push(range);
            neighbors.insert(range, sources);
        }
        self.run_node_op(StreamReason::Removenode, ranges, neighbors, ops_uuid)
            .await
    }

    /// Re-stream every local range from the other replicas, only from
    /// `source_dc` when given.
    pub async fn rebuild_with_repair(
        self: &Arc<Self>,
        ring: &Ring,
        source_dc: Option<&str>,
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        let local = self.local_node();
        let rf = self.config().replication_factor;

        let mut ranges = Vec::new();
        let mut neighbors = Neighbors::new();
        for range in ring.ranges_for(&local, rf) {
            let sources: Vec<NodeId> = ring
                .replicas(&range, rf)
                .into_iter()
                .filter(|n| *n != local)
                .filter(|n| source_dc.is_none_or(|dc| self.snitch().get_datacenter(n) == dc))
                .collect();
            ranges.push(range);
            neighbors.insert(range, sources);
        }
        self.run_node_op(StreamReason::Rebuild, ranges, neighbors, ops_uuid)
            .await
    }

    /// Take over the tokens of `replaced` and pull their data from the
    /// remaining replicas, skipping `ignore_nodes`.
    pub async fn replace_with_repair(
        self: &Arc<Self>,
        ring: &Ring,
        replaced: NodeId,
        ignore_nodes: &[NodeId],
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        let local = self.local_node();
        let rf = self.config().replication_factor;
        let mut new_ring = ring.clone();
        let (dc, rack) = self.local_location();
        if !new_ring.replace_node(&replaced, local, &dc, &rack) {
            warn!(replaced = %replaced.fmt_short(), "replaced node owns no tokens");
        }

        let mut ranges = Vec::new();
        let mut neighbors = Neighbors::new();
        for range in new_ring.ranges_for(&local, rf) {
            let sources: Vec<NodeId> = ring
                .replicas(&range, rf)
                .into_iter()
                .filter(|n| *n != replaced && *n != local && !ignore_nodes.contains(n))
                .collect();
            ranges.push(range);
            neighbors.insert(range, sources);
        }
        self.run_node_op(StreamReason::Replace, ranges, neighbors, ops_uuid)
            .await
    }

    fn local_location(&self) -> (String, String) {
        let local = self.local_node();
        (
            self.snitch().get_datacenter(&local),
            self.snitch().get_rack(&local),
        )
    }

    /// Sync every keyspace, then drop the operation's bookkeeping.
    async fn run_node_op(
        self: &Arc<Self>,
        reason: StreamReason,
        ranges: Vec<TokenRange>,
        neighbors: Neighbors,
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        info!(%reason, %ops_uuid, ranges = ranges.len(), "node operation started");
        let result = async {
            for keyspace in self.store().keyspaces().await? {
                self.sync_data_using_repair(
                    &keyspace,
                    ranges.clone(),
                    neighbors.clone(),
                    reason,
                    ops_uuid,
                )
                .await?;
            }
            Ok(())
        }
        .await;

        self.finish_node_ops(ops_uuid);
        self.history().cleanup_history(ops_uuid);
        match &result {
            Ok(()) => info!(%reason, %ops_uuid, "node operation finished"),
            Err(err) => warn!(%reason, %ops_uuid, error = %err, "node operation failed"),
        }
        result
    }
}
