//! The repair service: session registries, jobs and gossip wiring.
//!
//! [`RepairService`] owns one registry actor and one memory pool per
//! shard. It starts repair jobs (`do_repair_start`), runs the ranges of
//! node operations (`sync_data_using_repair`), answers follower requests
//! (see the [`MessageHandler`](reef_net::MessageHandler) impl) and drops
//! sessions of peers that gossip reports dead or removed.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use reef_cluster::{ClusterState, EndpointEvent};
use reef_meta::MetaStore;
use reef_net::{RepairMessage, Transport};
use reef_store::{RowStore, TableSchema};
use reef_topology::{ApplicationState, EndpointSnitch, Ring};
use reef_types::events::{EventBus, RangeRepaired, RepairJobFinished, RepairJobStarted};
use reef_types::{
    DiffAlgorithm, NodeId, RepairConfig, RepairRole, RepairStatus, RepairUuid, ShardConfig,
    StreamReason, TableId, TokenRange, unix_millis,
};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RepairError;
use crate::history::RepairHistory;
use crate::memory::MemoryPool;
use crate::meta::{RepairMeta, RepairMetaParams};
use crate::metrics::NodeOpsMetrics;
use crate::options::RepairOptions;
use crate::registry::RegistryHandle;
use crate::session::{MasterSession, SessionOutcome};
use crate::throttle::Throttle;
use crate::tracker::Tracker;

/// Partitioner sharding parameter advertised to followers.
const IGNORE_MSB_BITS: u32 = 12;

/// Passes over the peers of one range: the first sync and one re-sync.
const MAX_PASSES: usize = 2;

pub(crate) struct Shard {
    pub(crate) registry: RegistryHandle,
    pub(crate) pool: MemoryPool,
}

/// A (range, neighbors) pair to repair for every table of a job.
#[derive(Debug, Clone)]
struct RangeUnit {
    range: TokenRange,
    neighbors: Vec<NodeId>,
}

/// Everything a job's range tasks share.
struct JobSpec {
    repair_id: RepairUuid,
    keyspace: String,
    tables: Vec<TableSchema>,
    units: Vec<RangeUnit>,
    reason: StreamReason,
    algorithm: DiffAlgorithm,
    parallelism: usize,
    /// Stop at the first failed range (node operations).
    fail_fast: bool,
    /// Skip ranges already recorded under `repair_id` (resumption).
    skip_repaired: bool,
    flush_hints: bool,
}

impl JobSpec {
    fn range_count(&self) -> usize {
        self.units.len() * self.tables.len()
    }
}

/// Row-level repair service of one node.
pub struct RepairService {
    config: RepairConfig,
    local_node: NodeId,
    store: Arc<dyn RowStore>,
    meta_store: Arc<MetaStore>,
    cluster: Arc<ClusterState>,
    snitch: Arc<dyn EndpointSnitch>,
    transport: Arc<dyn Transport>,
    pub(crate) shards: Vec<Shard>,
    throttle: Arc<Throttle>,
    events: EventBus,
    /// Parent of every job, node operation and session token.
    root: CancellationToken,
    /// Stops the registry actors and the gossip listener.
    actors: CancellationToken,
    jobs: Mutex<HashMap<i32, CancellationToken>>,
    node_ops: Mutex<HashMap<RepairUuid, CancellationToken>>,
    next_job_id: AtomicI32,
    pub(crate) shutting_down: AtomicBool,
    tracker: Tracker,
    history: RepairHistory,
    metrics: NodeOpsMetrics,
}

impl RepairService {
    /// Create the service and spawn its per-shard registry actors.
    ///
    /// Must be called from within a tokio runtime. Loads the repair
    /// history from `meta_store`.
    pub fn new(
        config: RepairConfig,
        store: Arc<dyn RowStore>,
        meta_store: Arc<MetaStore>,
        cluster: Arc<ClusterState>,
        snitch: Arc<dyn EndpointSnitch>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, RepairError> {
        let shard_count = config.shard_count.max(1);
        let actors = CancellationToken::new();
        let shards = (0..shard_count)
            .map(|shard| Shard {
                registry: RegistryHandle::spawn(shard, actors.clone()),
                pool: MemoryPool::new(config.max_repair_memory),
            })
            .collect();

        let history = RepairHistory::new(meta_store.clone());
        history.load_history()?;

        info!(
            node = %cluster.local_node_id().fmt_short(),
            shards = shard_count,
            max_repair_memory = config.max_repair_memory,
            snitch = snitch.name(),
            "repair service started"
        );

        Ok(Arc::new(Self {
            local_node: cluster.local_node_id(),
            throttle: Throttle::new(config.max_bandwidth),
            config,
            store,
            meta_store,
            cluster,
            snitch,
            transport,
            shards,
            events: EventBus::new(),
            root: CancellationToken::new(),
            actors,
            jobs: Mutex::new(HashMap::new()),
            node_ops: Mutex::new(HashMap::new()),
            next_job_id: AtomicI32::new(1),
            shutting_down: AtomicBool::new(false),
            tracker: Tracker::new(),
            history,
            metrics: NodeOpsMetrics::new(),
        }))
    }

    // ----- Accessors -----

    /// This node.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Service configuration.
    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Event bus for job, range and session notifications.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Repair history.
    pub fn history(&self) -> &RepairHistory {
        &self.history
    }

    /// Node operation progress counters.
    pub fn metrics(&self) -> &NodeOpsMetrics {
        &self.metrics
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Memory pool of a shard.
    pub fn memory_pool(&self, shard: u32) -> Option<&MemoryPool> {
        self.shards.get(shard as usize).map(|s| &s.pool)
    }

    pub(crate) fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub(crate) fn shard(&self, shard: u32) -> &Shard {
        &self.shards[(shard % self.shard_count()) as usize]
    }

    /// Shard a master session for `range` lives on.
    pub fn shard_for_range(&self, range: &TokenRange) -> u32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&range.start.0.to_le_bytes());
        hasher.update(&range.end.0.to_le_bytes());
        let bytes: [u8; 8] = hasher.finalize().as_bytes()[..8]
            .try_into()
            .unwrap_or([0; 8]);
        (u64::from_le_bytes(bytes) % self.shard_count() as u64) as u32
    }

    fn ensure_running(&self) -> Result<(), RepairError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RepairError::ShuttingDown);
        }
        Ok(())
    }

    // ----- Session registry -----

    /// Register a session.
    ///
    /// Follower sessions go to shard `src_shard % shard_count`, master
    /// sessions to the shard of their range. Fails with
    /// [`RepairError::DuplicateRepairMeta`] or [`RepairError::RangeBusy`].
    pub async fn insert_repair_meta(
        &self,
        params: RepairMetaParams,
    ) -> Result<Arc<RepairMeta>, RepairError> {
        self.register(params, &self.root).await
    }

    async fn register(
        &self,
        params: RepairMetaParams,
        parent: &CancellationToken,
    ) -> Result<Arc<RepairMeta>, RepairError> {
        self.ensure_running()?;
        let shard = match params.role {
            RepairRole::Follower => params.src_shard % self.shard_count(),
            RepairRole::Master => self.shard_for_range(&params.range),
        };
        let meta = RepairMeta::new(params, shard, parent.child_token());
        self.shard(shard).registry.insert(meta.clone()).await?;
        Ok(meta)
    }

    /// Look up a session opened by `peer` with id `id`.
    pub async fn get_repair_meta(&self, peer: NodeId, id: u32) -> Result<Arc<RepairMeta>, RepairError> {
        for shard in &self.shards {
            if let Some(meta) = shard.registry.get(peer, id, RepairRole::Follower).await? {
                return Ok(meta);
            }
        }
        Err(RepairError::RepairMetaNotFound { peer, id })
    }

    /// Remove the session `(peer, id)` if it covers `(table_id, range)`.
    ///
    /// Idempotent. Returns whether a session was removed.
    pub async fn remove_repair_meta(
        &self,
        peer: NodeId,
        id: u32,
        keyspace: &str,
        table_id: TableId,
        range: TokenRange,
    ) -> Result<bool, RepairError> {
        for shard in &self.shards {
            if shard
                .registry
                .remove(peer, id, RepairRole::Follower, Some((table_id, range)))
                .await?
            {
                debug!(peer = %peer.fmt_short(), id, keyspace, %table_id, %range, "removed repair meta");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove every session with `peer`. Returns how many were removed.
    pub async fn remove_repair_meta_for_peer(&self, peer: NodeId) -> Result<usize, RepairError> {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.registry.remove_for_peer(peer).await?;
        }
        Ok(removed)
    }

    /// Remove every session. Returns how many were removed.
    pub async fn remove_all_repair_meta(&self) -> Result<usize, RepairError> {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.registry.remove_all().await?;
        }
        Ok(removed)
    }

    /// Allocate a session id from shard 0.
    pub async fn get_next_repair_meta_id(&self) -> Result<u32, RepairError> {
        self.shards[0].registry.next_id().await
    }

    /// Every registered session on every shard.
    pub async fn repair_metas(&self) -> Result<Vec<Arc<RepairMeta>>, RepairError> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.registry.list().await?);
        }
        Ok(all)
    }

    // ----- Repair jobs -----

    /// Validate `options`, resolve ranges and neighbors, and start a repair
    /// job of `keyspace` in the background. Returns the job id.
    pub async fn do_repair_start(
        self: &Arc<Self>,
        keyspace: &str,
        options: HashMap<String, String>,
    ) -> Result<i32, RepairError> {
        self.ensure_running()?;
        let opts = RepairOptions::parse(&options)?;

        let mut tables = self.store.tables(keyspace).await?;
        if !opts.column_families.is_empty() {
            for name in &opts.column_families {
                if !tables.iter().any(|t| &t.name == name) {
                    return Err(RepairError::InvalidOptions(format!(
                        "unknown table '{keyspace}.{name}'"
                    )));
                }
            }
            tables.retain(|t| opts.column_families.contains(&t.name));
        }

        let ring = self.cluster.ring().await;
        let rf = self.config.replication_factor;
        let ranges = match (&opts.ranges, opts.primary_range) {
            (Some(ranges), _) => local_pieces(ranges, &ring.ranges_for(&self.local_node, rf)),
            (None, true) => ring.primary_ranges(&self.local_node),
            (None, false) => ring.ranges_for(&self.local_node, rf),
        };
        let units: Vec<RangeUnit> = ranges
            .into_iter()
            .map(|range| RangeUnit {
                neighbors: self.repair_neighbors(&ring, &range, &opts),
                range,
            })
            .collect();

        let spec = JobSpec {
            repair_id: RepairUuid::new_random(),
            keyspace: keyspace.to_string(),
            tables,
            units,
            reason: StreamReason::Repair,
            algorithm: opts.algorithm.unwrap_or(self.config.algorithm),
            parallelism: opts.parallelism.unwrap_or(self.config.range_parallelism),
            fail_fast: false,
            skip_repaired: false,
            flush_hints: opts.flush_hints,
        };

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root.child_token();
        self.tracker.start(id);
        self.jobs.lock().expect("lock poisoned").insert(id, cancel.clone());
        self.metrics.add_total(spec.reason, spec.range_count() as u64);
        self.events.emit(RepairJobStarted {
            job_id: id,
            keyspace: spec.keyspace.clone(),
            ranges: spec.range_count(),
        });
        info!(
            job_id = id,
            keyspace,
            ranges = spec.units.len(),
            tables = spec.tables.len(),
            algorithm = spec.algorithm.as_str(),
            "repair job started"
        );

        if spec.range_count() == 0 {
            self.finish_job(id, spec.repair_id, RepairStatus::Successful);
            return Ok(id);
        }

        let service = self.clone();
        tokio::spawn(async move {
            let repair_id = spec.repair_id;
            let status = match service.run_job(Arc::new(spec), cancel).await {
                Ok(()) => RepairStatus::Successful,
                Err(err) => {
                    error!(job_id = id, error = %err, "repair job failed");
                    RepairStatus::Failed
                }
            };
            service.finish_job(id, repair_id, status);
        });

        Ok(id)
    }

    fn finish_job(&self, id: i32, repair_id: RepairUuid, status: RepairStatus) {
        self.jobs.lock().expect("lock poisoned").remove(&id);
        self.history.cleanup_history(repair_id);
        self.tracker.finish(id, status);
        self.events.emit(RepairJobFinished { job_id: id, status });
        info!(job_id = id, ?status, "repair job finished");
    }

    /// Neighbors of `range` for a repair job, after the job's filters.
    ///
    /// `range` must lie inside a single ring range.
    fn repair_neighbors(&self, ring: &Ring, range: &TokenRange, opts: &RepairOptions) -> Vec<NodeId> {
        ring.replicas(range, self.config.replication_factor)
            .into_iter()
            .filter(|n| *n != self.local_node)
            .filter(|n| {
                opts.data_centers.is_empty()
                    || opts.data_centers.contains(&self.snitch.get_datacenter(n))
            })
            .filter(|n| opts.hosts.is_empty() || opts.hosts.contains(n))
            .collect()
    }

    /// Status of a job.
    pub fn get_status(&self, id: i32) -> Result<RepairStatus, RepairError> {
        self.tracker.status(id).ok_or(RepairError::UnknownJob(id))
    }

    /// Wait for a job to finish. On timeout returns the last known status.
    pub async fn await_completion(&self, id: i32, timeout: Duration) -> Result<RepairStatus, RepairError> {
        self.tracker
            .await_completion(id, timeout)
            .await
            .ok_or(RepairError::UnknownJob(id))
    }

    /// Ids of running jobs.
    pub fn get_active_repairs(&self) -> Vec<i32> {
        self.tracker.active()
    }

    /// Forget a finished job. Running jobs are kept.
    pub fn remove_finished_job(&self, id: i32) -> bool {
        self.tracker.remove_finished(id)
    }

    /// Cancel every running job and node operation.
    pub fn abort_all(&self) {
        let jobs: Vec<(i32, CancellationToken)> = self
            .jobs
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(id, t)| (*id, t.clone()))
            .collect();
        for (id, token) in &jobs {
            token.cancel();
            info!(job_id = id, "repair job aborted");
        }
        let ops: Vec<CancellationToken> = self
            .node_ops
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        for token in &ops {
            token.cancel();
        }
        info!(jobs = jobs.len(), node_ops = ops.len(), "aborted all repairs");
    }

    /// Cancel the ranges of one node operation. Returns whether it was running.
    pub fn abort_repair_node_ops(&self, ops_uuid: RepairUuid) -> bool {
        let token = self
            .node_ops
            .lock()
            .expect("lock poisoned")
            .get(&ops_uuid)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                info!(%ops_uuid, "node operation repair aborted");
                true
            }
            None => false,
        }
    }

    /// Stop the service.
    ///
    /// Rejects new work, aborts everything, fails pending memory waits,
    /// drops every session and waits for tracked jobs to end.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("repair service shutting down");
        self.abort_all();
        self.root.cancel();
        for shard in &self.shards {
            shard.pool.close();
        }
        if let Err(err) = self.remove_all_repair_meta().await {
            warn!(error = %err, "failed to remove repair sessions on shutdown");
        }
        self.tracker.wait_all().await;
        self.actors.cancel();
        info!("repair service stopped");
    }

    // ----- Node operations -----

    pub(crate) fn node_ops_token(&self, ops_uuid: RepairUuid) -> CancellationToken {
        self.node_ops
            .lock()
            .expect("lock poisoned")
            .entry(ops_uuid)
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    pub(crate) fn finish_node_ops(&self, ops_uuid: RepairUuid) {
        self.node_ops.lock().expect("lock poisoned").remove(&ops_uuid);
    }

    /// Repair `ranges` of `keyspace` with the given neighbors for a node
    /// operation.
    ///
    /// Ranges already recorded under `ops_uuid` are skipped. The first
    /// failing range cancels the others and its error is returned.
    pub async fn sync_data_using_repair(
        self: &Arc<Self>,
        keyspace: &str,
        ranges: Vec<TokenRange>,
        neighbors: HashMap<TokenRange, Vec<NodeId>>,
        reason: StreamReason,
        ops_uuid: RepairUuid,
    ) -> Result<(), RepairError> {
        self.ensure_running()?;
        let tables = self.store.tables(keyspace).await?;
        if tables.is_empty() || ranges.is_empty() {
            debug!(keyspace, %reason, "nothing to sync");
            return Ok(());
        }

        let units = ranges
            .into_iter()
            .map(|range| RangeUnit {
                neighbors: neighbors.get(&range).cloned().unwrap_or_default(),
                range,
            })
            .collect();
        let spec = JobSpec {
            repair_id: ops_uuid,
            keyspace: keyspace.to_string(),
            tables,
            units,
            reason,
            algorithm: self.config.algorithm,
            parallelism: self.config.range_parallelism,
            fail_fast: true,
            skip_repaired: true,
            flush_hints: false,
        };
        self.metrics.add_total(reason, spec.range_count() as u64);
        info!(
            keyspace,
            %reason,
            %ops_uuid,
            ranges = spec.units.len(),
            tables = spec.tables.len(),
            "syncing data using repair"
        );
        let cancel = self.node_ops_token(ops_uuid);
        self.run_job(Arc::new(spec), cancel).await
    }

    // ----- Job execution -----

    async fn run_job(
        self: &Arc<Self>,
        spec: Arc<JobSpec>,
        parent: CancellationToken,
    ) -> Result<(), RepairError> {
        let cancel = parent.child_token();
        if spec.flush_hints {
            self.flush_hints(&spec).await?;
        }

        let limit = Arc::new(Semaphore::new(spec.parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for unit in &spec.units {
            for table in &spec.tables {
                let service = self.clone();
                let spec = spec.clone();
                let limit = limit.clone();
                let cancel = cancel.clone();
                let table = table.clone();
                let unit = unit.clone();
                tasks.spawn(async move {
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => return Err(RepairError::Aborted),
                        permit = limit.acquire_owned() => permit.map_err(|_| RepairError::Aborted)?,
                    };
                    service.repair_range(&spec, &table, &unit, &cancel).await
                });
            }
        }

        let mut first_error: Option<RepairError> = None;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(RepairError::Protocol(format!("range task panicked: {e}"))));
            if let Err(err) = result {
                failed += 1;
                if spec.fail_fast && first_error.is_none() {
                    cancel.cancel();
                }
                // Keep the root cause over the aborts it triggered.
                let replace = match &first_error {
                    None => true,
                    Some(RepairError::Aborted) => !matches!(err, RepairError::Aborted),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => {
                warn!(keyspace = %spec.keyspace, reason = %spec.reason, failed, error = %err, "repair ranges failed");
                Err(err)
            }
        }
    }

    async fn flush_hints(&self, spec: &JobSpec) -> Result<(), RepairError> {
        let peers: BTreeSet<NodeId> = spec
            .units
            .iter()
            .flat_map(|u| u.neighbors.iter().copied())
            .collect();
        for peer in peers {
            match self.transport.request(peer, RepairMessage::FlushHintsBatchlog).await? {
                RepairMessage::FlushHintsBatchlogAck => {}
                RepairMessage::Error { kind, message } => {
                    return Err(RepairError::Remote { peer, kind, message });
                }
                other => {
                    return Err(RepairError::Protocol(format!(
                        "unexpected {} to flush_hints_batchlog",
                        other.verb()
                    )));
                }
            }
        }
        debug!(keyspace = %spec.keyspace, "flushed hints on neighbors");
        Ok(())
    }

    /// Reconcile one (table, range) with all of its neighbors, then record it.
    async fn repair_range(
        &self,
        spec: &JobSpec,
        table: &TableSchema,
        unit: &RangeUnit,
        cancel: &CancellationToken,
    ) -> Result<(), RepairError> {
        let range = unit.range;
        if spec.skip_repaired && self.history.is_repaired(spec.repair_id, table.table_id, &range) {
            debug!(table = %table.name, %range, "range already repaired, skipping");
            self.metrics.add_finished(spec.reason, 1);
            return Ok(());
        }
        if unit.neighbors.is_empty() {
            debug!(table = %table.name, %range, "range has no neighbors");
            self.metrics.add_finished(spec.reason, 1);
            return Ok(());
        }

        // Pass 1 syncs every peer; pass 2 re-syncs the peers synced before
        // the last one that sent us rows, so they get those rows too.
        let mut peers: Vec<NodeId> = unit.neighbors.clone();
        let mut moved = 0u64;
        for pass in 0..MAX_PASSES {
            let mut last_sender = None;
            for (i, peer) in peers.iter().enumerate() {
                let outcome = self.sync_with_peer(spec, table, range, *peer, cancel).await?;
                moved += outcome.rows_sent + outcome.rows_received;
                if outcome.rows_received > 0 {
                    last_sender = Some(i);
                }
            }
            match last_sender {
                Some(i) if i > 0 && spec.reason.pushes_to_followers() => {
                    debug!(table = %table.name, %range, pass, resync = i, "re-syncing earlier peers");
                    peers.truncate(i);
                }
                _ => break,
            }
        }

        // A range that was already in sync keeps its recorded time, so the
        // watermark only moves when data did.
        let finished_at = match self.history.finished_at(table.table_id, &range) {
            Some(previous) if moved == 0 => previous,
            _ => unix_millis(),
        };
        self.history
            .update_history(spec.repair_id, table.table_id, range, finished_at)?;
        for peer in &unit.neighbors {
            let msg = RepairMessage::UpdateSystemTable {
                repair_id: spec.repair_id,
                table_id: table.table_id,
                range,
                finished_at,
            };
            match self.transport.request(*peer, msg).await {
                Ok(RepairMessage::UpdateSystemTableAck) => {}
                Ok(other) => {
                    warn!(peer = %peer.fmt_short(), response = other.verb(), "peer did not record repair history")
                }
                Err(err) => {
                    warn!(peer = %peer.fmt_short(), error = %err, "failed to send repair history")
                }
            }
        }
        self.events.emit(RangeRepaired {
            table_id: table.table_id,
            range,
            reason: spec.reason,
        });
        self.metrics.add_finished(spec.reason, 1);
        info!(table = %table.name, %range, reason = %spec.reason, "range repaired");
        Ok(())
    }

    /// Run one master session with `peer` and unregister it afterwards.
    async fn sync_with_peer(
        &self,
        spec: &JobSpec,
        table: &TableSchema,
        range: TokenRange,
        peer: NodeId,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, RepairError> {
        if cancel.is_cancelled() {
            return Err(RepairError::Aborted);
        }
        let id = self.get_next_repair_meta_id().await?;
        let shard = self.shard_for_range(&range);
        let params = RepairMetaParams {
            peer,
            src_shard: shard,
            id,
            role: RepairRole::Master,
            range,
            table_id: table.table_id,
            schema_version: table.version,
            algorithm: spec.algorithm,
            max_row_buf_size: self.config.max_row_buf_size,
            seed: rand::random(),
            shard_config: ShardConfig {
                shard,
                shard_count: self.shard_count(),
                ignore_msb: IGNORE_MSB_BITS,
            },
            reason: spec.reason,
        };
        let meta = self.register(params, cancel).await?;
        let session = MasterSession {
            meta: meta.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            pool: self.shard(shard).pool.clone(),
            throttle: self.throttle.clone(),
            events: self.events.clone(),
        };
        let result = session.run().await;
        if let Err(err) = self
            .shard(shard)
            .registry
            .remove(peer, id, RepairRole::Master, None)
            .await
        {
            debug!(error = %err, "could not unregister master session");
        }
        result
    }

    // ----- Gossip -----

    /// React to a membership change.
    ///
    /// A dead or removed peer loses its sessions; location and address
    /// changes are saved for use after a restart.
    pub async fn on_endpoint_event(&self, event: &EndpointEvent) {
        match event {
            EndpointEvent::Dead(node) | EndpointEvent::Removed(node) => {
                match self.remove_repair_meta_for_peer(*node).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!(peer = %node.fmt_short(), removed, "dropped repair sessions of departed peer")
                    }
                    Err(err) => warn!(peer = %node.fmt_short(), error = %err, "failed to drop repair sessions"),
                }
                if matches!(event, EndpointEvent::Removed(_))
                    && let Err(err) = self.meta_store.remove_peer(node)
                {
                    warn!(peer = %node.fmt_short(), error = %err, "failed to forget removed peer");
                }
            }
            EndpointEvent::Changed { node, state, value } => {
                let result = match state {
                    ApplicationState::Dc | ApplicationState::Rack => {
                        let dc = self.snitch.get_datacenter(node);
                        let rack = self.snitch.get_rack(node);
                        self.meta_store.put_peer_location(node, &dc, &rack)
                    }
                    ApplicationState::InternalIp => self.meta_store.put_preferred_ip(node, value),
                };
                if let Err(err) = result {
                    warn!(peer = %node.fmt_short(), error = %err, "failed to save peer info");
                }
            }
            EndpointEvent::Joined(_) | EndpointEvent::Alive(_) => {}
        }
    }

    /// Feed cluster events into [`RepairService::on_endpoint_event`] until
    /// the service shuts down.
    pub fn spawn_gossip_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.cluster.subscribe();
        let cancel = self.actors.clone();
        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("repair gossip listener shutting down");
                        break;
                    }
                    event = rx.recv() => match event {
                        Ok(event) => match service.upgrade() {
                            Some(service) => service.on_endpoint_event(&event).await,
                            None => break,
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "repair gossip listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    pub(crate) fn snitch(&self) -> &Arc<dyn EndpointSnitch> {
        &self.snitch
    }

    pub(crate) fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }
}

/// Split requested ranges along the ring ranges in `owned`, keeping only
/// the pieces inside them.
fn local_pieces(requested: &[TokenRange], owned: &[TokenRange]) -> Vec<TokenRange> {
    let mut pieces: Vec<TokenRange> = requested
        .iter()
        .flat_map(TokenRange::split_wrapping)
        .flat_map(|r| owned.iter().filter_map(move |o| r.intersection(o)))
        .collect();
    pieces.sort();
    pieces.dedup();
    pieces
}

impl std::fmt::Debug for RepairService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairService")
            .field("local_node", &self.local_node)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}
