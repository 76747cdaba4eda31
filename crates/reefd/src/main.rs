//! `reefd`: the reef repair daemon.
//!
//! # Usage
//!
//! ```text
//! reefd check-snitch rackdc.properties     # validate a snitch properties file
//! reefd history                            # show recorded repair history
//! reefd peers                              # show saved peers and their location
//! reefd simulate -n 3 --rows 5000          # repair an in-process cluster
//! reefd simulate --op bootstrap            # run a node operation instead
//! ```

mod config;
mod telemetry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reef_cluster::ClusterState;
use reef_meta::MetaStore;
use reef_net::{LocalNetwork, MessageHandler};
use reef_repair::RepairService;
use reef_store::MemoryRowStore;
use reef_topology::{PropertyFileSnitch, Ring, SimpleSnitch, SnitchProperties, vnode_tokens};
use reef_types::{
    Member, MemberState, Mutation, NodeId, RepairConfig, RepairStatus, RepairUuid, TableId,
    TokenRange,
};
use tracing::info;

use config::CliConfig;
use telemetry::TelemetryConfig;

const SIM_KEYSPACE: &str = "sim";
const SIM_VNODES: u16 = 16;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "reefd", version, about = "Reef anti-entropy repair daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "REEF_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a snitch properties file and print its canonical form.
    CheckSnitch {
        /// Properties file; defaults to `[snitch] properties_file`.
        file: Option<PathBuf>,
    },

    /// Show the repair history recorded in the local meta store.
    History {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Show the peers saved in the local meta store, located by the
    /// configured snitch.
    Peers {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Run a repair or node operation on an in-process cluster.
    Simulate {
        /// Number of nodes.
        #[arg(short, long, default_value = "3")]
        nodes: u8,

        /// Rows written to the cluster.
        #[arg(long, default_value = "1000")]
        rows: usize,

        /// Fraction of rows that differ between replicas.
        #[arg(long, default_value = "0.1")]
        divergence: f64,

        /// Seed for the generated data.
        #[arg(long, default_value = "42")]
        seed: u64,

        /// What to run.
        #[arg(long, value_enum, default_value = "repair")]
        op: SimOp,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SimOp {
    Repair,
    Bootstrap,
    Decommission,
    Removenode,
    Rebuild,
    Replace,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&TelemetryConfig {
        level: config.log.level.clone(),
    });

    match cli.command {
        Commands::CheckSnitch { file } => cmd_check_snitch(&config, file),
        Commands::History { data_dir } => cmd_history(config, data_dir),
        Commands::Peers { data_dir } => cmd_peers(config, data_dir),
        Commands::Simulate {
            nodes,
            rows,
            divergence,
            seed,
            op,
        } => {
            if nodes < 2 {
                bail!("simulate needs at least 2 nodes");
            }
            if !(0.0..=1.0).contains(&divergence) {
                bail!("divergence must be between 0 and 1");
            }
            let repair = config.repair_config()?;
            cmd_simulate(repair, nodes, rows, divergence, seed, op).await
        }
    }
}

// -----------------------------------------------------------------------
// reefd check-snitch
// -----------------------------------------------------------------------

fn cmd_check_snitch(config: &CliConfig, file: Option<PathBuf>) -> Result<()> {
    let path = file
        .or_else(|| config.snitch.properties_file.clone())
        .context("no properties file given and none configured in [snitch]")?;
    let props = SnitchProperties::load(&path)
        .with_context(|| format!("invalid snitch properties in {}", path.display()))?;
    let snitch = PropertyFileSnitch::from_properties(config.node_id(), &props)?;

    println!("{}: ok", path.display());
    println!("  dc:           {}", snitch.local_dc());
    println!("  rack:         {}", snitch.local_rack());
    println!("  prefer_local: {}", props.prefer_local());
    println!();
    print!("{}", props.serialize());
    Ok(())
}

// -----------------------------------------------------------------------
// reefd history
// -----------------------------------------------------------------------

fn cmd_history(mut config: CliConfig, data_dir: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = data_dir {
        config.node.data_dir = dir;
    }
    let meta_dir = config.meta_dir();
    if !meta_dir.exists() {
        println!("No meta store at {}.", meta_dir.display());
        return Ok(());
    }
    let meta = MetaStore::open(&meta_dir).context("failed to open meta store")?;
    let records = meta.list_all_history()?;
    if records.is_empty() {
        println!("No repair history recorded.");
        return Ok(());
    }

    let mut by_table: HashMap<TableId, Vec<_>> = HashMap::new();
    for record in records {
        by_table.entry(record.table_id).or_default().push(record);
    }
    let mut tables: Vec<_> = by_table.into_iter().collect();
    tables.sort_by_key(|(id, _)| *id.as_uuid());

    for (table_id, mut records) in tables {
        records.sort_by_key(|r| r.range);
        let watermark = records.iter().map(|r| r.finished_at).max().unwrap_or(0);
        println!("table {table_id}: {} ranges, watermark {watermark}", records.len());
        for record in records {
            println!(
                "  {:<44} {:>15}  {}",
                record.range.to_string(),
                record.finished_at,
                record.repair_id
            );
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// reefd peers
// -----------------------------------------------------------------------

fn cmd_peers(mut config: CliConfig, data_dir: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = data_dir {
        config.node.data_dir = dir;
    }
    let meta_dir = config.meta_dir();
    if !meta_dir.exists() {
        println!("No meta store at {}.", meta_dir.display());
        return Ok(());
    }
    let meta = MetaStore::open(&meta_dir).context("failed to open meta store")?;
    let snitch = config.snitch(Some(&meta))?;
    let peers = meta.list_peers()?;
    if peers.is_empty() {
        println!("No peers saved.");
        return Ok(());
    }

    println!("{} peers (snitch: {})", peers.len(), snitch.name());
    for (node, info) in peers {
        println!(
            "  {}  dc={}  rack={}  ip={}",
            node.fmt_short(),
            snitch.get_datacenter(&node),
            snitch.get_rack(&node),
            info.preferred_ip.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// reefd simulate
// -----------------------------------------------------------------------

struct SimNode {
    id: NodeId,
    service: Arc<RepairService>,
    store: Arc<MemoryRowStore>,
}

struct Simulation {
    network: Arc<LocalNetwork>,
    table_id: TableId,
    nodes: Vec<SimNode>,
}

impl Simulation {
    async fn start(config: &RepairConfig, ids: &[NodeId], ring: &Ring) -> Result<Self> {
        let network = LocalNetwork::new();
        let table_id = TableId::new_random();
        let mut sim = Self {
            network,
            table_id,
            nodes: Vec::new(),
        };
        for id in ids {
            sim.add_node(config, *id, ids, ring).await?;
        }
        Ok(sim)
    }

    async fn add_node(
        &mut self,
        config: &RepairConfig,
        id: NodeId,
        members: &[NodeId],
        ring: &Ring,
    ) -> Result<()> {
        let store = Arc::new(MemoryRowStore::new());
        store.create_table_with_id(self.table_id, SIM_KEYSPACE, "rows")?;
        let cluster = ClusterState::new(id);
        for member in members.iter().chain(std::iter::once(&id)) {
            cluster
                .add_member(Member {
                    node_id: *member,
                    state: MemberState::Alive,
                    generation: 1,
                })
                .await;
        }
        cluster.set_ring(ring.clone()).await;

        let service = RepairService::new(
            config.clone(),
            store.clone(),
            Arc::new(MetaStore::open_temporary()?),
            cluster,
            Arc::new(SimpleSnitch),
            Arc::new(self.network.transport(id)),
        )?;
        let handler: Arc<dyn MessageHandler> = service.clone();
        self.network.register(id, Arc::downgrade(&handler)).await;
        self.nodes.push(SimNode { id, service, store });
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<&SimNode> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .context("unknown simulated node")
    }

    /// Write `rows` rows, letting a `divergence` share of them differ per node.
    fn seed_rows(&self, on: &[NodeId], rows: usize, divergence: f64, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..rows {
            let key = format!("row-{i:08}");
            let value: u64 = rng.random();
            for id in on {
                let node = self.node(*id)?;
                let timestamp = if rng.random_bool(divergence) {
                    if rng.random_bool(0.5) {
                        continue;
                    }
                    rng.random_range(2..10)
                } else {
                    1
                };
                node.store.insert(
                    self.table_id,
                    key.clone().into_bytes(),
                    Mutation::live(timestamp, format!("{value:x}-{timestamp}").into_bytes()),
                )?;
            }
        }
        Ok(())
    }

    fn rows_on(&self, id: NodeId) -> Result<usize> {
        Ok(self.node(id)?.store.row_count(self.table_id))
    }

    fn diverging_nodes(&self) -> usize {
        let Some(first) = self.nodes.first() else {
            return 0;
        };
        let expected = first.store.snapshot(self.table_id, &TokenRange::full());
        self.nodes[1..]
            .iter()
            .filter(|n| n.store.snapshot(self.table_id, &TokenRange::full()) != expected)
            .count()
    }
}

async fn cmd_simulate(
    config: RepairConfig,
    nodes: u8,
    rows: usize,
    divergence: f64,
    seed: u64,
    op: SimOp,
) -> Result<()> {
    let ids: Vec<NodeId> = (0..nodes)
        .map(|i| NodeId::from_data(format!("sim-node-{i}").as_bytes()))
        .collect();
    let mut ring = Ring::new();
    for id in &ids {
        ring.add_node(*id, "datacenter1", "rack1", SIM_VNODES);
    }

    println!("Reef simulation");
    println!("  op:          {op:?}");
    println!("  nodes:       {nodes}");
    println!("  rows:        {rows}");
    println!("  divergence:  {divergence}");
    println!("  algorithm:   {}", config.algorithm.as_str());
    println!("  rf:          {}", config.replication_factor);
    println!();

    let mut sim = Simulation::start(&config, &ids, &ring).await?;
    let ops_uuid = RepairUuid::new_random();
    let start = Instant::now();

    let target = match op {
        SimOp::Repair => {
            sim.seed_rows(&ids, rows, divergence, seed)?;
            let node = sim.node(ids[0])?;
            let job = node
                .service
                .do_repair_start(SIM_KEYSPACE, HashMap::new())
                .await?;
            let status = node
                .service
                .await_completion(job, Duration::from_secs(3600))
                .await?;
            if status != RepairStatus::Successful {
                bail!("repair job {job} ended {status:?}");
            }
            println!("Diverging nodes after repair: {}", sim.diverging_nodes());
            ids[0]
        }
        SimOp::Bootstrap => {
            let joining = NodeId::from_data(b"sim-node-joining");
            sim.seed_rows(&ids, rows, divergence, seed)?;
            sim.add_node(&config, joining, &ids, &ring).await?;
            let node = sim.node(joining)?;
            node.service
                .bootstrap_with_repair(&ring, vnode_tokens(&joining, SIM_VNODES), ops_uuid)
                .await?;
            joining
        }
        SimOp::Decommission => {
            sim.seed_rows(&ids, rows, divergence, seed)?;
            let leaving = sim.node(ids[0])?;
            leaving.service.decommission_with_repair(&ring, ops_uuid).await?;
            ids[1]
        }
        SimOp::Removenode => {
            let leaving = ids[ids.len() - 1];
            sim.seed_rows(&ids, rows, divergence, seed)?;
            sim.network.set_down(leaving, true).await;
            let node = sim.node(ids[0])?;
            node.service
                .removenode_with_repair(&ring, leaving, ops_uuid)
                .await?;
            ids[0]
        }
        SimOp::Rebuild => {
            sim.seed_rows(&ids[1..], rows, divergence, seed)?;
            let node = sim.node(ids[0])?;
            node.service.rebuild_with_repair(&ring, None, ops_uuid).await?;
            ids[0]
        }
        SimOp::Replace => {
            let replaced = ids[ids.len() - 1];
            let replacement = NodeId::from_data(b"sim-node-replacement");
            sim.seed_rows(&ids, rows, divergence, seed)?;
            sim.network.set_down(replaced, true).await;
            sim.add_node(&config, replacement, &ids, &ring).await?;
            let node = sim.node(replacement)?;
            node.service
                .replace_with_repair(&ring, replaced, &[], ops_uuid)
                .await?;
            replacement
        }
    };

    let elapsed = start.elapsed();
    let node = sim.node(target)?;
    let metrics = node.service.metrics();
    info!(?op, elapsed_ms = elapsed.as_millis() as u64, "simulation finished");

    println!("Finished in {:.2}s", elapsed.as_secs_f64());
    println!("  rows on {}:     {}", target.fmt_short(), sim.rows_on(target)?);
    println!("  row_level_start:  {}", sim.network.sent("row_level_start"));
    println!("  get_row_hashes:   {}", sim.network.sent("get_row_hashes"));
    println!("  get_full_rows:    {}", sim.network.sent("get_full_rows"));
    println!("  get_row_diff:     {}", sim.network.sent("get_row_diff"));
    println!("  put_row_diff:     {}", sim.network.sent("put_row_diff"));
    println!(
        "  ranges:           {}/{}",
        metrics.repair_finished_ranges_sum(),
        metrics.repair_total_ranges_sum()
    );
    for (shard, pool) in (0..node.service.shard_count())
        .filter_map(|s| node.service.memory_pool(s).map(|p| (s, p)))
    {
        println!("  shard {shard} peak memory: {} / {}", pool.peak(), pool.max());
    }

    for node in &sim.nodes {
        node.service.shutdown().await;
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
