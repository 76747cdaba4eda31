//! Repair history surviving a restart of the repair service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reef_integration_tests::{IntegrationCluster, KEYSPACE, VNODES, node_id, test_config};
use reef_repair::RepairService;
use reef_topology::{SimpleSnitch, vnode_tokens};
use reef_types::{RepairStatus, RepairUuid};

const WAIT: Duration = Duration::from_secs(30);

/// A fresh service for node `i` over the same stores, as after a restart.
fn restart(cluster: &IntegrationCluster, i: usize) -> Arc<RepairService> {
    let node = cluster.node(i);
    RepairService::new(
        cluster.config.clone(),
        node.store.clone(),
        node.meta.clone(),
        node.cluster.clone(),
        Arc::new(SimpleSnitch),
        Arc::new(cluster.network.transport(node.id)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_history_reloaded_after_restart() {
    let cluster = IntegrationCluster::new(3, test_config(3)).await;
    cluster.seed_replicated(100, 21);
    cluster.write(0, "extra", 7, "x");

    let service = &cluster.node(0).service;
    let id = service
        .do_repair_start(KEYSPACE, HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        service.await_completion(id, WAIT).await.unwrap(),
        RepairStatus::Successful
    );

    let table = cluster.table_id;
    let finished = service.history().finished_ranges(table);
    let watermark = service.history().watermark(table);
    assert_eq!(finished.len(), cluster.ring().ranges().len());
    assert!(watermark > 0);

    let restarted = restart(&cluster, 0);
    assert_eq!(restarted.history().finished_ranges(table), finished);
    assert_eq!(restarted.history().watermark(table), watermark);
    restarted.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_followers_record_history() {
    let cluster = IntegrationCluster::new(3, test_config(3)).await;
    cluster.write(0, "k", 1, "v");

    let service = &cluster.node(0).service;
    let id = service
        .do_repair_start(KEYSPACE, HashMap::new())
        .await
        .unwrap();
    service.await_completion(id, WAIT).await.unwrap();

    let table = cluster.table_id;
    let master = service.history().finished_ranges(table);
    for i in 1..3 {
        let follower = cluster.node(i);
        assert_eq!(follower.service.history().finished_ranges(table), master);
        assert_eq!(
            follower.meta.list_history(&table).unwrap().len(),
            master.len()
        );
        let restarted = restart(&cluster, i);
        assert_eq!(restarted.history().finished_ranges(table), master);
        restarted.shutdown().await;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_op_resumes_after_restart() {
    let mut cluster = IntegrationCluster::new(3, test_config(2)).await;
    cluster.seed_replicated(150, 22);

    let joining = node_id(10);
    let j = cluster.add_node(joining, "dc1").await;
    let tokens = vnode_tokens(&joining, VNODES);
    let ops = RepairUuid::new_random();

    cluster
        .node(j)
        .service
        .bootstrap_with_repair(cluster.ring(), tokens.clone(), ops)
        .await
        .unwrap();
    let rows = cluster.rows(j);

    let restarted = restart(&cluster, j);
    cluster.network.reset_counters();
    restarted
        .bootstrap_with_repair(cluster.ring(), tokens, ops)
        .await
        .unwrap();
    assert_eq!(cluster.network.sent("row_level_start"), 0);
    assert_eq!(cluster.rows(j), rows);
    restarted.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_regular_repair_ignores_recorded_history() {
    let cluster = IntegrationCluster::new(2, test_config(2)).await;
    cluster.write(0, "k", 1, "v");

    let service = &cluster.node(0).service;
    for _ in 0..2 {
        cluster.network.reset_counters();
        let id = service
            .do_repair_start(KEYSPACE, HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            service.await_completion(id, WAIT).await.unwrap(),
            RepairStatus::Successful
        );
        // Each job gets a fresh id, so every range is compared again.
        assert!(cluster.network.sent("row_level_start") > 0);
    }
    cluster.shutdown().await;
}
