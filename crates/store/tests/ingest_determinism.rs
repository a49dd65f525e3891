#![forbid(unsafe_code)]

use std::time::Duration;

use relay_core::{Cluster, Delta, Item, ItemKey};
use relay_store::spawn_ingest;

fn cluster(name: &str, group: &str) -> Delta {
    Delta::applied(Item::Cluster(Cluster::new(name, [("location-group", group)])))
}

async fn run_sequence(seq: &[Delta]) -> Vec<(String, String)> {
    let (tx, backend) = spawn_ingest(128);
    for d in seq.iter().cloned() {
        let _ = tx.send(d).await;
    }
    drop(tx);
    // Let ingest flush final snapshot
    tokio::time::sleep(Duration::from_millis(30)).await;
    let snap = backend.current();
    snap.clusters().map(|c| (c.name.clone(), c.labels["location-group"].clone())).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deterministic_across_runs() {
    let seq = vec![
        cluster("cluster1", "edge"),
        cluster("cluster2", "edge"),
        cluster("cluster3", "core"),
        // duplicates and relabels
        cluster("cluster2", "core"),
        cluster("cluster2", "core"),
        Delta::deleted(ItemKey::Cluster("cluster3".into())),
        cluster("cluster4", "edge"),
    ];

    let c1 = run_sequence(&seq).await;
    let c2 = run_sequence(&seq).await;
    assert_eq!(c1, c2, "snapshot view must be deterministic across runs");
    assert_eq!(
        c1,
        vec![
            ("cluster1".to_string(), "edge".to_string()),
            ("cluster2".to_string(), "core".to_string()),
            ("cluster4".to_string(), "edge".to_string()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_see_changes_and_resync_is_silent() {
    let (tx, backend) = spawn_ingest(64);
    let mut changes = backend.subscribe();

    tx.send(cluster("cluster1", "edge")).await.unwrap();
    let batch = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert!(backend.wait_for_epoch(1, Duration::from_secs(2)).await);

    // Full resync redelivers the same item: no new epoch, no change batch.
    tx.send(cluster("cluster1", "edge")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(backend.current().epoch, 1);
    assert!(changes.try_recv().is_err());
}
