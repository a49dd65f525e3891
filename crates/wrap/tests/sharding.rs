#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use relay_core::ObjectId;
use relay_wrap::shard;
use serde_json::{json, Value as Json};

fn objects(n: usize, payload: usize) -> Vec<(ObjectId, Json)> {
    (0..n)
        .map(|i| {
            let name = format!("app-{:02}", i);
            (
                ObjectId::new("", "ConfigMap", "demo", &name),
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": name, "namespace": "demo"},
                    "data": {"blob": "x".repeat(payload + i * 7)}
                }),
            )
        })
        .collect()
}

#[test]
fn ten_objects_split_and_each_lands_once() {
    let objs = objects(10, 200);
    let plan = shard("cluster1", objs.clone(), 1000).unwrap();
    assert!(plan.shards.len() > 1);
    assert!(plan.rejected.is_empty());

    let mut seen = BTreeSet::new();
    for (i, s) in plan.shards.iter().enumerate() {
        assert_eq!(s.index as usize, i);
        assert!(s.body.len() <= 1000, "shard {} is {} bytes", i, s.body.len());
        for id in &s.objects {
            assert!(seen.insert(id.clone()), "{} appears twice", id);
        }
    }
    let all: BTreeSet<ObjectId> = objs.into_iter().map(|(id, _)| id).collect();
    assert_eq!(seen, all);
}

#[test]
fn same_input_gives_same_shards() {
    let mut reversed = objects(10, 150);
    reversed.reverse();
    let a = shard("cluster1", objects(10, 150), 900).unwrap();
    let b = shard("cluster1", reversed, 900).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.digests(), b.digests());
}

#[test]
fn smaller_limit_never_means_fewer_shards() {
    let objs = objects(10, 120);
    let mut last = 0;
    for max in [20_000, 4000, 2000, 1200, 800, 600, 500] {
        let plan = shard("cluster1", objs.clone(), max).unwrap();
        assert!(plan.rejected.is_empty(), "max {} rejected {:?}", max, plan.rejected);
        assert!(plan.shards.len() >= last, "max {} gave {} shards after {}", max, plan.shards.len(), last);
        last = plan.shards.len();
    }
    assert!(last > 1);
}

#[test]
fn oversized_object_is_reported_not_dropped_silently() {
    let mut objs = objects(3, 50);
    objs.push((
        ObjectId::new("", "ConfigMap", "demo", "huge"),
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "huge"}, "data": {"blob": "y".repeat(5000)}}),
    ));
    let plan = shard("cluster1", objs, 1000).unwrap();
    assert_eq!(plan.rejected.len(), 1);
    assert_eq!(plan.rejected[0].id.name, "huge");
    assert!(plan.rejected[0].size > 1000);
    let placed: usize = plan.shards.iter().map(|s| s.objects.len()).sum();
    assert_eq!(placed, 3);
    assert_eq!(plan.shard_of(&ObjectId::new("", "ConfigMap", "demo", "huge")), None);
}

#[test]
fn changing_one_object_changes_only_its_shard_digest() {
    let objs = objects(10, 200);
    let before = shard("cluster1", objs.clone(), 1000).unwrap();
    let mut edited = objs;
    edited[9].1["data"]["extra"] = json!("z");
    let after = shard("cluster1", edited, 1000).unwrap();
    let last = before.shards.len() as u32 - 1;
    let (b, a) = (before.digests(), after.digests());
    assert_eq!(b.len(), a.len());
    for (i, d) in &b {
        if *i == last {
            assert_ne!(d, &a[i]);
        } else {
            assert_eq!(d, &a[i]);
        }
    }
}
