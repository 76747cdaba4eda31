//! Chaos test: repair verbs failing at random.
//!
//! 5-node cluster. Background writers keep diverging the replicas while
//! background repairs run from random nodes. A chaos task keeps toggling
//! which repair verbs the network drops. After the chaos period no session
//! may be left behind, and one clean round of repairs must converge every
//! replica.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reef_integration_tests::{IntegrationCluster, KEYSPACE, test_config};
use reef_types::{RepairStatus, TokenRange};
use tokio::time;

const WAIT: Duration = Duration::from_secs(60);

/// Verbs the chaos task may drop. `row_level_stop` always gets through so
/// failed sessions can be closed on the follower.
const FLAKY_VERBS: &[&str] = &[
    "row_level_start",
    "get_row_hashes",
    "get_full_rows",
    "get_row_diff",
    "put_row_diff",
    "update_system_table",
];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_verbs_then_clean_repair_converges() {
    // --- Setup ---
    let c = Arc::new(IntegrationCluster::new(5, test_config(3)).await);
    c.seed_replicated(200, 31);

    let stop = Arc::new(AtomicBool::new(false));
    let write_count = Arc::new(AtomicUsize::new(0));
    let jobs_ok = Arc::new(AtomicUsize::new(0));
    let jobs_failed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    // --- Background writers (2 tasks) ---
    for writer_id in 0..2u64 {
        let cluster = c.clone();
        let stop = stop.clone();
        let wc = write_count.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(100 + writer_id);
            let mut idx = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let key = format!("chaos-w{writer_id}-{}", rng.random_range(0..300));
                // Each write lands on one replica only.
                let owners = cluster.owners(&key);
                let owner = owners[rng.random_range(0..owners.len())];
                let i = (0..cluster.len())
                    .find(|i| cluster.node(*i).id == owner)
                    .unwrap();
                idx += 1;
                cluster.write(i, &key, idx, &format!("w{writer_id}-{idx}"));
                wc.fetch_add(1, Ordering::Relaxed);
                time::sleep(Duration::from_millis(5)).await;
            }
        }));
    }

    // --- Background repairs (2 tasks) ---
    for repairer_id in 0..2u64 {
        let cluster = c.clone();
        let stop = stop.clone();
        let ok = jobs_ok.clone();
        let failed = jobs_failed.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(200 + repairer_id);
            while !stop.load(Ordering::Relaxed) {
                let node = rng.random_range(0..cluster.len());
                let service = &cluster.node(node).service;
                let id = match service.do_repair_start(KEYSPACE, HashMap::new()).await {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                match service.await_completion(id, WAIT).await {
                    Ok(RepairStatus::Successful) => ok.fetch_add(1, Ordering::Relaxed),
                    _ => failed.fetch_add(1, Ordering::Relaxed),
                };
                service.remove_finished_job(id);
            }
        }));
    }

    // --- Chaos: toggle dropped verbs ---
    let mut rng = StdRng::seed_from_u64(32);
    let chaos_start = time::Instant::now();
    let chaos_duration = Duration::from_secs(8);
    while chaos_start.elapsed() < chaos_duration {
        let verb = FLAKY_VERBS[rng.random_range(0..FLAKY_VERBS.len())];
        c.network.set_failing(verb, true).await;
        time::sleep(Duration::from_millis(rng.random_range(50..300))).await;
        c.network.set_failing(verb, false).await;
        time::sleep(Duration::from_millis(rng.random_range(50..200))).await;
    }

    // --- Stop background tasks ---
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.await.unwrap();
    }
    for verb in FLAKY_VERBS {
        c.network.set_failing(verb, false).await;
    }

    let writes = write_count.load(Ordering::Relaxed);
    let ok = jobs_ok.load(Ordering::Relaxed);
    let failed = jobs_failed.load(Ordering::Relaxed);
    eprintln!("chaos phase: {writes} writes, {ok} repairs ok, {failed} failed");
    assert!(writes > 0);
    assert!(ok + failed > 0);

    // --- No session outlives its job ---
    for i in 0..c.len() {
        let service = &c.node(i).service;
        assert!(service.get_active_repairs().is_empty());
        assert!(
            service.repair_metas().await.unwrap().is_empty(),
            "node {i} leaked repair sessions"
        );
    }

    // --- Clean round ---
    for i in 0..c.len() {
        let service = &c.node(i).service;
        let id = service
            .do_repair_start(KEYSPACE, HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            service.await_completion(id, WAIT).await.unwrap(),
            RepairStatus::Successful,
            "clean repair on node {i} failed"
        );
    }

    // --- Every replica agrees ---
    let table = c.table_id;
    let mut versions: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
    for i in 0..c.len() {
        for row in c.node(i).store.snapshot(table, &TokenRange::full()) {
            versions.entry(row.key.key.to_vec()).or_default().push(i);
        }
    }
    for (key, holders) in versions {
        let key_str = String::from_utf8_lossy(&key).into_owned();
        assert_eq!(holders.len(), c.owners(&key_str).len(), "{key_str} under-replicated");
        let first = c.node(holders[0]).store.get(table, &key);
        for h in &holders[1..] {
            assert_eq!(c.node(*h).store.get(table, &key), first, "{key_str} differs");
        }
    }

    c.shutdown().await;
}
