//! Repair jobs started through `do_repair_start` on a multi-node cluster.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reef_integration_tests::{IntegrationCluster, KEYSPACE, range_of, test_config};
use reef_types::events::{RepairJobFinished, RepairJobStarted};
use reef_types::{Mutation, RepairStatus, TableId, Token, TokenRange};

const WAIT: Duration = Duration::from_secs(30);

fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn repair(cluster: &IntegrationCluster, node: usize, pairs: &[(&str, &str)]) -> RepairStatus {
    let service = &cluster.node(node).service;
    let id = service
        .do_repair_start(KEYSPACE, options(pairs))
        .await
        .unwrap();
    service.await_completion(id, WAIT).await.unwrap()
}

/// Write each key to a random subset of its replicas with random versions.
fn seed_random(cluster: &IntegrationCluster, rows: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..rows {
        let key = format!("rand-{i:05}");
        for owner in cluster.owners(&key) {
            if rng.random_bool(0.6) {
                let idx = (0..cluster.len())
                    .find(|n| cluster.node(*n).id == owner)
                    .unwrap();
                let ts = rng.random_range(1..10);
                cluster.write(idx, &key, ts, &format!("v{ts}"));
            }
        }
    }
}

/// Every replica of every key holds the same version.
fn assert_replicas_agree(cluster: &IntegrationCluster, table: TableId) {
    let mut seen: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
    for i in 0..cluster.len() {
        for row in cluster.node(i).store.snapshot(table, &TokenRange::full()) {
            seen.entry(row.key.key.to_vec()).or_default().push(i);
        }
    }
    for (key, holders) in seen {
        let key_str = String::from_utf8_lossy(&key).into_owned();
        let owners = cluster.owners(&key_str);
        assert_eq!(holders.len(), owners.len(), "{key_str} not on every replica");
        let first = cluster.node(holders[0]).store.get(table, &key).unwrap();
        for h in &holders[1..] {
            assert_eq!(
                cluster.node(*h).store.get(table, &key).unwrap(),
                first,
                "{key_str} differs"
            );
        }
    }
}

#[tokio::test]
async fn test_repair_on_every_node_converges_cluster() {
    let cluster = IntegrationCluster::new(5, test_config(3)).await;
    seed_random(&cluster, 500, 11);

    for i in 0..cluster.len() {
        assert_eq!(repair(&cluster, i, &[]).await, RepairStatus::Successful);
    }
    assert_replicas_agree(&cluster, cluster.table_id);

    // Everything agrees, so a second pass moves no rows.
    cluster.network.reset_counters();
    for i in 0..cluster.len() {
        assert_eq!(repair(&cluster, i, &[]).await, RepairStatus::Successful);
    }
    assert_eq!(cluster.network.sent("put_row_diff"), 0);
    assert_eq!(cluster.network.sent("get_row_diff"), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_primary_range_repair_on_every_node_converges() {
    let cluster = IntegrationCluster::new(4, test_config(3)).await;
    seed_random(&cluster, 400, 12);

    for i in 0..cluster.len() {
        let status = repair(
            &cluster,
            i,
            &[("primaryRange", "true"), ("algorithm", "full_row")],
        )
        .await;
        assert_eq!(status, RepairStatus::Successful);
    }
    assert_replicas_agree(&cluster, cluster.table_id);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_repair_covers_every_table_unless_filtered() {
    let cluster = IntegrationCluster::new(3, test_config(3)).await;
    let other = TableId::new_random();
    for i in 0..cluster.len() {
        cluster
            .node(i)
            .store
            .create_table_with_id(other, KEYSPACE, "u")
            .unwrap();
    }
    cluster.write(0, "in-t", 1, "a");
    cluster
        .node(1)
        .store
        .insert(other, b"in-u".to_vec(), Mutation::live(1, b"b".to_vec()))
        .unwrap();

    // Only table `t` is repaired.
    assert_eq!(
        repair(&cluster, 2, &[("columnFamilies", "t")]).await,
        RepairStatus::Successful
    );
    assert!(cluster.has(2, "in-t"));
    assert!(cluster.node(2).store.get(other, b"in-u").is_none());

    // Both tables.
    assert_eq!(repair(&cluster, 2, &[]).await, RepairStatus::Successful);
    for i in 0..cluster.len() {
        assert!(cluster.has(i, "in-t"));
        assert!(cluster.node(i).store.get(other, b"in-u").is_some());
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_explicit_ranges_limit_the_job() {
    let cluster = IntegrationCluster::new(3, test_config(3)).await;
    let range = range_of(cluster.ring(), "inside");
    let outside = (0..)
        .map(|i| format!("outside-{i}"))
        .find(|k| !range.contains(Token::of(k.as_bytes())))
        .unwrap();
    cluster.write(0, "inside", 1, "a");
    cluster.write(0, &outside, 1, "a");
    let arg = format!("{}:{}", range.start, range.end);

    assert_eq!(
        repair(&cluster, 0, &[("ranges", &arg)]).await,
        RepairStatus::Successful
    );
    assert!(cluster.has(1, "inside"));
    assert!(cluster.has(2, "inside"));
    assert!(!cluster.has(1, &outside));
    assert!(!cluster.has(2, &outside));

    let finished = cluster.node(0).service.history().finished_ranges(cluster.table_id);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, range);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_data_centers_option_limits_neighbors() {
    let cluster = IntegrationCluster::with_dcs(&["dc1", "dc1", "dc2"], test_config(3)).await;
    cluster.write(0, "k", 1, "a");

    assert_eq!(
        repair(&cluster, 0, &[("dataCenters", "dc1")]).await,
        RepairStatus::Successful
    );
    assert!(cluster.has(1, "k"));
    assert!(!cluster.has(2, "k"));

    assert_eq!(
        repair(&cluster, 0, &[("dataCenters", "dc1,dc2")]).await,
        RepairStatus::Successful
    );
    assert!(cluster.has(2, "k"));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_job_events_are_published() {
    let cluster = IntegrationCluster::new(2, test_config(2)).await;
    cluster.write(0, "k", 1, "a");

    let events = cluster.node(0).service.events();
    let mut started = events.subscribe::<RepairJobStarted>();
    let mut finished = events.subscribe::<RepairJobFinished>();

    let status = repair(&cluster, 0, &[]).await;
    assert_eq!(status, RepairStatus::Successful);

    let started = started.try_recv().unwrap();
    assert_eq!(started.keyspace, KEYSPACE);
    assert!(started.ranges > 0);
    let finished = tokio::time::timeout(WAIT, finished.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.job_id, started.job_id);
    assert_eq!(finished.status, RepairStatus::Successful);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_jobs_on_different_nodes() {
    let cluster = IntegrationCluster::new(3, test_config(3)).await;
    seed_random(&cluster, 300, 13);

    let mut ids = Vec::new();
    for i in 0..cluster.len() {
        let id = cluster
            .node(i)
            .service
            .do_repair_start(KEYSPACE, HashMap::new())
            .await
            .unwrap();
        ids.push((i, id));
    }
    // Overlapping ranges may be refused while another node holds them;
    // those jobs fail and are retried below.
    let mut retry = Vec::new();
    for (i, id) in ids {
        let status = cluster.node(i).service.await_completion(id, WAIT).await.unwrap();
        if status == RepairStatus::Failed {
            retry.push(i);
        }
    }
    for i in retry {
        assert_eq!(repair(&cluster, i, &[]).await, RepairStatus::Successful);
    }
    // A final pass from one node reconciles whatever the retries raced on.
    assert_eq!(repair(&cluster, 0, &[]).await, RepairStatus::Successful);
    assert_replicas_agree(&cluster, cluster.table_id);
    cluster.shutdown().await;
}
