//! Node operations moving data with row-level repair across a cluster.

use std::collections::BTreeSet;
use std::time::Duration;

use reef_integration_tests::{IntegrationCluster, VNODES, node_id, test_config};
use reef_repair::RepairError;
use reef_topology::{Ring, vnode_tokens};
use reef_types::events::RowsStreamed;
use reef_types::{NodeId, RepairUuid, StreamReason, Token};

const WAIT: Duration = Duration::from_secs(30);

/// Keys among `keys` that `node` replicates on `ring`.
fn owned_keys(ring: &Ring, node: &NodeId, keys: &[String], rf: usize) -> BTreeSet<String> {
    keys.iter()
        .filter(|k| ring.owners(Token::of(k.as_bytes()), rf).contains(node))
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_bootstrap_pulls_exactly_the_new_ranges() {
    let mut cluster = IntegrationCluster::new(3, test_config(2)).await;
    let keys = cluster.seed_replicated(300, 1);

    let joining = node_id(10);
    let j = cluster.add_node(joining, "dc1").await;
    let tokens = vnode_tokens(&joining, VNODES);
    let mut new_ring = cluster.ring().clone();
    new_ring.add_node_with_tokens(joining, "dc1", "rack1", tokens.clone());

    let ops = RepairUuid::new_random();
    cluster
        .node(j)
        .service
        .bootstrap_with_repair(cluster.ring(), tokens, ops)
        .await
        .unwrap();

    let expected = owned_keys(&new_ring, &joining, &keys, 2);
    assert!(!expected.is_empty());
    assert_eq!(cluster.keys(j), expected);

    // Bootstrap only pulls: existing replicas are untouched.
    assert_eq!(cluster.network.sent("put_row_diff"), 0);
    let metrics = cluster.node(j).service.metrics();
    assert!(metrics.total(StreamReason::Bootstrap) > 0);
    assert_eq!(metrics.bootstrap_finished_percentage(), 1.0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_resumes_with_same_uuid() {
    let mut cluster = IntegrationCluster::new(3, test_config(2)).await;
    cluster.seed_replicated(200, 2);

    let joining = node_id(10);
    let j = cluster.add_node(joining, "dc1").await;
    let tokens = vnode_tokens(&joining, VNODES);
    let service = &cluster.node(j).service;
    let ops = RepairUuid::new_random();

    service
        .bootstrap_with_repair(cluster.ring(), tokens.clone(), ops)
        .await
        .unwrap();
    let watermark = service.history().watermark(cluster.table_id);
    assert!(watermark > 0);

    cluster.network.reset_counters();
    service
        .bootstrap_with_repair(cluster.ring(), tokens.clone(), ops)
        .await
        .unwrap();
    assert_eq!(cluster.network.sent("row_level_start"), 0);
    assert_eq!(service.history().watermark(cluster.table_id), watermark);

    // A different operation id repairs every range again.
    service
        .bootstrap_with_repair(cluster.ring(), tokens, RepairUuid::new_random())
        .await
        .unwrap();
    assert!(cluster.network.sent("row_level_start") > 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_bootstrap_can_be_rerun() {
    let mut cluster = IntegrationCluster::new(3, test_config(3)).await;
    let keys = cluster.seed_replicated(150, 3);

    let joining = node_id(10);
    let j = cluster.add_node(joining, "dc1").await;
    let tokens = vnode_tokens(&joining, VNODES);
    let ops = RepairUuid::new_random();

    cluster.kill_node(1).await;
    let result = cluster
        .node(j)
        .service
        .bootstrap_with_repair(cluster.ring(), tokens.clone(), ops)
        .await;
    assert!(result.is_err());

    cluster.revive_node(1).await;
    cluster
        .node(j)
        .service
        .bootstrap_with_repair(cluster.ring(), tokens.clone(), ops)
        .await
        .unwrap();

    let mut new_ring = cluster.ring().clone();
    new_ring.add_node_with_tokens(joining, "dc1", "rack1", tokens);
    assert_eq!(cluster.keys(j), owned_keys(&new_ring, &joining, &keys, 3));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_decommission_pushes_to_new_replicas() {
    let cluster = IntegrationCluster::new(4, test_config(2)).await;
    let keys = cluster.seed_replicated(300, 4);

    let leaving = cluster.node(0).id;
    let mut new_ring = cluster.ring().clone();
    new_ring.remove_node(&leaving);

    cluster
        .node(0)
        .service
        .decommission_with_repair(cluster.ring(), RepairUuid::new_random())
        .await
        .unwrap();

    for key in &keys {
        for owner in new_ring.owners(Token::of(key.as_bytes()), 2) {
            let i = (0..cluster.len())
                .find(|i| cluster.node(*i).id == owner)
                .unwrap();
            assert!(cluster.has(i, key), "{key} missing on new replica {i}");
        }
    }
    // Decommission only pushes.
    assert_eq!(cluster.network.sent("get_row_diff"), 0);
    assert!(cluster.network.sent("put_row_diff") > 0);
    assert_eq!(
        cluster
            .node(0)
            .service
            .metrics()
            .decommission_finished_percentage(),
        1.0
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_removenode_restores_replication() {
    let cluster = IntegrationCluster::new(4, test_config(2)).await;
    let keys = cluster.seed_replicated(300, 5);

    let leaving = cluster.node(3).id;
    cluster.kill_node(3).await;
    let mut new_ring = cluster.ring().clone();
    new_ring.remove_node(&leaving);

    let ops = RepairUuid::new_random();
    for i in 0..3 {
        cluster
            .node(i)
            .service
            .removenode_with_repair(cluster.ring(), leaving, ops)
            .await
            .unwrap();
    }

    for i in 0..3 {
        let id = cluster.node(i).id;
        let expected = owned_keys(&new_ring, &id, &keys, 2);
        assert!(
            expected.is_subset(&cluster.keys(i)),
            "node {i} is missing rows it now replicates"
        );
    }
    cluster.shutdown().await;
}

/// Write `keys` to every replica except node `skip`.
fn write_except(cluster: &IntegrationCluster, keys: &[String], skip: usize) {
    for key in keys {
        for owner in cluster.owners(key) {
            let i = (0..cluster.len())
                .find(|i| cluster.node(*i).id == owner)
                .unwrap();
            if i != skip {
                cluster.write(i, key, 1, "v");
            }
        }
    }
}

#[tokio::test]
async fn test_rebuild_from_one_datacenter() {
    let cluster =
        IntegrationCluster::with_dcs(&["dc1", "dc1", "dc2", "dc2"], test_config(2)).await;
    let rebuilt = cluster.node(0).id;
    let dc2: Vec<NodeId> = vec![cluster.node(2).id, cluster.node(3).id];

    let keys: Vec<String> = (0..300).map(|i| format!("rebuild-{i:04}")).collect();
    write_except(&cluster, &keys, 0);
    assert!(cluster.keys(0).is_empty());

    cluster
        .node(0)
        .service
        .rebuild_with_repair(cluster.ring(), Some("dc2"), RepairUuid::new_random())
        .await
        .unwrap();

    let expected: BTreeSet<String> = keys
        .iter()
        .filter(|k| {
            let owners = cluster.owners(k);
            owners.contains(&rebuilt) && owners.iter().any(|o| dc2.contains(o))
        })
        .cloned()
        .collect();
    assert!(!expected.is_empty());
    assert_eq!(cluster.keys(0), expected);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rebuild_from_all_datacenters() {
    let cluster = IntegrationCluster::with_dcs(&["dc1", "dc2", "dc2"], test_config(2)).await;
    let keys: Vec<String> = (0..200).map(|i| format!("rebuild-{i:04}")).collect();
    write_except(&cluster, &keys, 0);
    let expected = owned_keys(cluster.ring(), &cluster.node(0).id, &keys, 2);

    cluster
        .node(0)
        .service
        .rebuild_with_repair(cluster.ring(), None, RepairUuid::new_random())
        .await
        .unwrap();
    assert_eq!(cluster.keys(0), expected);
    assert_eq!(
        cluster.node(0).service.metrics().rebuild_finished_percentage(),
        1.0
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replace_takes_over_dead_node_data() {
    let mut cluster = IntegrationCluster::new(4, test_config(3)).await;
    cluster.seed_replicated(300, 7);

    let replaced = cluster.node(3).id;
    cluster.kill_node(3).await;
    let replacement = node_id(20);
    let r = cluster.add_node(replacement, "dc1").await;

    cluster
        .node(r)
        .service
        .replace_with_repair(cluster.ring(), replaced, &[], RepairUuid::new_random())
        .await
        .unwrap();

    assert!(!cluster.rows(3).is_empty());
    assert_eq!(cluster.rows(r), cluster.rows(3));
    assert_eq!(
        cluster.node(r).service.metrics().replace_finished_percentage(),
        1.0
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replace_skips_ignored_nodes() {
    let mut cluster = IntegrationCluster::new(4, test_config(3)).await;
    cluster.seed_replicated(200, 8);

    let replaced = cluster.node(3).id;
    let ignored = cluster.node(2).id;
    cluster.kill_node(3).await;
    // An ignored node is never contacted, even when unreachable.
    cluster.kill_node(2).await;
    let r = cluster.add_node(node_id(20), "dc1").await;

    cluster
        .node(r)
        .service
        .replace_with_repair(cluster.ring(), replaced, &[ignored], RepairUuid::new_random())
        .await
        .unwrap();
    assert!(!cluster.keys(r).is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_abort_node_ops_stops_decommission() {
    let mut config = test_config(2);
    config.max_bandwidth = 20_000;
    config.range_parallelism = 1;
    let cluster = IntegrationCluster::new(3, config).await;
    let value = "d".repeat(1000);
    for i in 0..600 {
        cluster.write(0, &format!("big-{i:04}"), 1, &value);
    }

    let service = cluster.node(0).service.clone();
    let mut streamed = service.events().subscribe::<RowsStreamed>();
    let ops = RepairUuid::new_random();
    let ring = cluster.ring().clone();
    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.decommission_with_repair(&ring, ops).await })
    };

    tokio::time::timeout(WAIT, streamed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(service.abort_repair_node_ops(ops));

    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(RepairError::Aborted)));
    // The operation's bookkeeping is gone once it returns.
    assert!(!service.abort_repair_node_ops(ops));
    cluster.shutdown().await;
}
