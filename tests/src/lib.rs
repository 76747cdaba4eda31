//! Shared test harness for reef integration tests.
//!
//! Provides [`IntegrationCluster`]: N nodes, each with its own row store,
//! meta store, cluster view and snitch, connected through a
//! [`LocalNetwork`]. Every node holds the same table `ks.t`.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reef_cluster::ClusterState;
use reef_meta::MetaStore;
use reef_net::{LocalNetwork, MessageHandler};
use reef_repair::RepairService;
use reef_store::MemoryRowStore;
use reef_topology::{
    ApplicationState, EndpointSnitch, PropertyFileSnitch, Ring, SnitchProperties,
};
use reef_types::{
    Member, MemberState, Mutation, NodeId, RepairConfig, RowEntry, TableId, Token, TokenRange,
};

/// Keyspace every test table lives in.
pub const KEYSPACE: &str = "ks";
/// Name of the shared table.
pub const TABLE: &str = "t";
/// Vnodes per node.
pub const VNODES: u16 = 8;

/// One node of the cluster.
pub struct TestNode {
    pub id: NodeId,
    pub dc: String,
    pub service: Arc<RepairService>,
    pub store: Arc<MemoryRowStore>,
    pub meta: Arc<MetaStore>,
    pub cluster: Arc<ClusterState>,
}

/// An in-process reef cluster.
pub struct IntegrationCluster {
    pub network: Arc<LocalNetwork>,
    pub config: RepairConfig,
    pub table_id: TableId,
    ring: Ring,
    nodes: Vec<TestNode>,
}

/// Deterministic node id for index `i`.
pub fn node_id(i: usize) -> NodeId {
    NodeId::from_data(format!("reef-test-node-{i}").as_bytes())
}

/// Default config for integration tests: small pages, two shards.
pub fn test_config(replication_factor: usize) -> RepairConfig {
    RepairConfig {
        shard_count: 2,
        max_repair_memory: 4 * 1024 * 1024,
        max_row_buf_size: 4096,
        range_parallelism: 4,
        replication_factor,
        ..RepairConfig::default()
    }
}

impl IntegrationCluster {
    /// `n` nodes in one datacenter.
    pub async fn new(n: usize, config: RepairConfig) -> Self {
        let dcs = vec!["dc1"; n];
        Self::with_dcs(&dcs, config).await
    }

    /// One node per entry of `dcs`, placed in that datacenter.
    pub async fn with_dcs(dcs: &[&str], config: RepairConfig) -> Self {
        let mut ring = Ring::new();
        for (i, dc) in dcs.iter().enumerate() {
            ring.add_node(node_id(i), dc, "rack1", VNODES);
        }

        let mut cluster = Self {
            network: LocalNetwork::new(),
            config,
            table_id: TableId::new_random(),
            ring,
            nodes: Vec::new(),
        };
        for (i, dc) in dcs.iter().enumerate() {
            cluster.spawn_node(node_id(i), dc).await;
        }
        for node in &cluster.nodes {
            cluster.publish_locations(node).await;
        }
        cluster
    }

    /// Start a node that is not on the ring yet (joining or replacing).
    pub async fn add_node(&mut self, id: NodeId, dc: &str) -> usize {
        self.spawn_node(id, dc).await;
        let index = self.nodes.len() - 1;
        for i in 0..self.nodes.len() {
            self.publish_locations(&self.nodes[i]).await;
        }
        index
    }

    async fn spawn_node(&mut self, id: NodeId, dc: &str) {
        let store = Arc::new(MemoryRowStore::new());
        store
            .create_table_with_id(self.table_id, KEYSPACE, TABLE)
            .expect("create table");
        let meta = Arc::new(MetaStore::open_temporary().expect("meta store"));
        let cluster = ClusterState::new(id);
        cluster.set_ring(self.ring.clone()).await;

        let props = SnitchProperties::parse(&format!("dc={dc}\nrack=rack1\n")).expect("props");
        let snitch: Arc<dyn EndpointSnitch> = Arc::new(
            PropertyFileSnitch::from_properties(id, &props)
                .expect("snitch")
                .with_gossip(cluster.clone()),
        );

        let service = RepairService::new(
            self.config.clone(),
            store.clone(),
            meta.clone(),
            cluster.clone(),
            snitch,
            Arc::new(self.network.transport(id)),
        )
        .expect("repair service");
        let handler: Arc<dyn MessageHandler> = service.clone();
        self.network.register(id, Arc::downgrade(&handler)).await;

        self.nodes.push(TestNode {
            id,
            dc: dc.to_string(),
            service,
            store,
            meta,
            cluster,
        });
    }

    /// Make every node's gossip view know `node` and its datacenter.
    async fn publish_locations(&self, node: &TestNode) {
        for other in &self.nodes {
            if other.cluster.get_member(&node.id).await.is_none() {
                other
                    .cluster
                    .add_member(Member {
                        node_id: node.id,
                        state: MemberState::Alive,
                        generation: 1,
                    })
                    .await;
            }
            other
                .cluster
                .set_application_state(node.id, ApplicationState::Dc, &node.dc)
                .await
                .expect("member exists");
        }
    }

    /// The ring the cluster was started with.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Node by index.
    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    /// Node by id.
    pub fn node_by_id(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .expect("node in cluster")
    }

    /// Number of nodes, ring members or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Make a node unreachable.
    pub async fn kill_node(&self, i: usize) {
        self.network.set_down(self.nodes[i].id, true).await;
    }

    /// Make a node reachable again.
    pub async fn revive_node(&self, i: usize) {
        self.network.set_down(self.nodes[i].id, false).await;
    }

    /// Write a row on node `i` only.
    pub fn write(&self, i: usize, key: &str, timestamp: i64, value: &str) {
        self.nodes[i]
            .store
            .insert(
                self.table_id,
                key.as_bytes().to_vec(),
                Mutation::live(timestamp, value.as_bytes().to_vec()),
            )
            .expect("insert");
    }

    /// Write a row on every replica of its token, as a consistent cluster would.
    pub fn write_replicated(&self, key: &str, timestamp: i64, value: &str) {
        for owner in self.owners(key) {
            if let Some(i) = self.nodes.iter().position(|n| n.id == owner) {
                self.write(i, key, timestamp, value);
            }
        }
    }

    /// Replicas of `key` on the initial ring.
    pub fn owners(&self, key: &str) -> Vec<NodeId> {
        self.ring
            .owners(Token::of(key.as_bytes()), self.config.replication_factor)
    }

    /// Write `count` consistent rows with seeded values. Returns their keys.
    pub fn seed_replicated(&self, count: usize, seed: u64) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|i| {
                let key = format!("row-{i:06}");
                let value = format!("{:016x}", rng.random::<u64>());
                self.write_replicated(&key, 1, &value);
                key
            })
            .collect()
    }

    /// Every row node `i` holds, in key order.
    pub fn rows(&self, i: usize) -> Vec<RowEntry> {
        self.nodes[i]
            .store
            .snapshot(self.table_id, &TokenRange::full())
    }

    /// Keys node `i` holds.
    pub fn keys(&self, i: usize) -> BTreeSet<String> {
        self.rows(i)
            .into_iter()
            .map(|r| String::from_utf8_lossy(&r.key.key).into_owned())
            .collect()
    }

    /// Whether node `i` holds `key`.
    pub fn has(&self, i: usize, key: &str) -> bool {
        self.nodes[i]
            .store
            .get(self.table_id, key.as_bytes())
            .is_some()
    }

    /// Shut every node down.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.service.shutdown().await;
        }
    }
}

/// Range of `ring` containing `key`'s token.
pub fn range_of(ring: &Ring, key: &str) -> TokenRange {
    let token = Token::of(key.as_bytes());
    ring.ranges()
        .into_iter()
        .find(|r| r.contains(token))
        .expect("ring covers every token")
}
