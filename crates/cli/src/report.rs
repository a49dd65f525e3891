//! Offline reports over a loaded snapshot. Printing stays in `main`.

use std::collections::BTreeMap;

use relay_core::{ObjectId, RelayResult};
use relay_resolve::{explain, resolve_all, PolicyMatch, Placement, Resolution};
use relay_status::{reduce, SingletonState};
use relay_store::Snapshot;
use relay_wrap::{prepare, shard, ShardPlan};
use serde_json::{json, Value as Json};
use tracing::warn;

/// Merged placement of every well-formed policy; malformed ones are logged and skipped.
pub fn offline_placement(snap: &Snapshot) -> Placement {
    let mut bindings = Vec::new();
    let mut wanted = Vec::new();
    for (name, r) in resolve_all(snap) {
        match r {
            Ok(r) => {
                wanted.extend(r.wanted());
                bindings.push((name, r.binding()));
            }
            Err(e) => warn!(policy = %name, error = %e, "policy skipped"),
        }
    }
    Placement::merge(bindings.iter().map(|(n, b)| (n.as_str(), b))).with_wanted(&wanted)
}

pub fn resolve_json(results: &BTreeMap<String, RelayResult<Resolution>>) -> Json {
    let out: serde_json::Map<String, Json> = results
        .iter()
        .map(|(name, r)| {
            let v = match r {
                Ok(r) => json!({ "binding": r.binding() }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            (name.clone(), v)
        })
        .collect();
    Json::Object(out)
}

/// Shards `cluster` would receive, at `max_bytes` per shard.
pub fn shard_preview(snap: &Snapshot, cluster: &str, max_bytes: usize) -> RelayResult<ShardPlan> {
    let placement = offline_placement(snap);
    let objects: Vec<_> = placement
        .objects_for(cluster)
        .filter_map(|id| snap.object(id).map(|o| (id.clone(), prepare(o, snap.transforms_for(o)))))
        .collect();
    shard(cluster, objects, max_bytes)
}

pub fn shard_json(plan: &ShardPlan) -> Json {
    let shards: Vec<_> = plan
        .shards
        .iter()
        .map(|s| {
            json!({
                "index": s.index,
                "objects": s.objects.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "bytes": s.body.len(),
                "digest": s.digest(),
            })
        })
        .collect();
    let rejected: Vec<_> = plan.rejected.iter().map(|r| json!({ "object": r.id.to_string(), "bytes": r.size })).collect();
    json!({ "cluster": plan.cluster, "maxBytes": plan.max_bytes, "shards": shards, "rejected": rejected })
}

pub struct Explanation {
    pub id: ObjectId,
    pub matches: Vec<PolicyMatch>,
    pub destinations: Vec<String>,
    pub state: SingletonState,
}

pub fn explain_object(snap: &Snapshot, id: &ObjectId) -> Explanation {
    let placement = offline_placement(snap);
    let destinations = placement.destinations(id);
    Explanation {
        id: id.clone(),
        matches: explain(snap, id),
        state: reduce(placement.wants_singleton(id), &destinations),
        destinations: destinations.into_iter().collect(),
    }
}

pub fn render_state(state: &SingletonState) -> String {
    match state {
        SingletonState::Disabled => "disabled".to_string(),
        SingletonState::Mirroring { cluster } => format!("mirroring from {}", cluster),
        SingletonState::Suppressed => "suppressed".to_string(),
    }
}

impl Explanation {
    pub fn to_json(&self) -> Json {
        let policies: Vec<_> = self
            .matches
            .iter()
            .map(|m| json!({ "policy": m.policy, "tests": m.tests.to_vec(), "clusters": m.clusters, "wantSingleton": m.want_singleton }))
            .collect();
        json!({
            "object": self.id.to_string(),
            "policies": policies,
            "destinations": self.destinations,
            "singleton": render_state(&self.state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::load_items;

    const WORLD: &str = r#"
apiVersion: control.relay.dev/v1alpha1
kind: BindingPolicy
metadata: {name: web}
spec:
  clusterSelectors:
  - matchLabels: {env: prod}
  downsync:
  - objectSelectors:
    - matchLabels: {app: web}
  wantSingletonReportedState: true
---
apiVersion: control.relay.dev/v1alpha1
kind: BindingPolicy
metadata: {name: nowhere}
spec:
  clusterSelectors:
  - matchLabels: {env: mars}
  downsync:
  - objectNames: [lonely]
  wantSingletonReportedState: true
---
apiVersion: control.relay.dev/v1alpha1
kind: BindingPolicy
metadata: {name: typo}
spec:
  clusterSelectors:
  - matchExpressions: [{key: env, operator: Equals, values: [prod]}]
---
apiVersion: v1
kind: List
items:
- apiVersion: cluster.open-cluster-management.io/v1
  kind: ManagedCluster
  metadata: {name: c1, labels: {env: prod}}
- apiVersion: cluster.open-cluster-management.io/v1
  kind: ManagedCluster
  metadata: {name: c2, labels: {env: dev}}
- apiVersion: apps/v1
  kind: Deployment
  metadata: {name: front, namespace: web, labels: {app: web}}
  spec: {replicas: 2, template: {metadata: {labels: {app: web}}}}
- apiVersion: v1
  kind: ConfigMap
  metadata: {name: settings, namespace: web, labels: {app: web}}
  data: {color: blue}
- apiVersion: v1
  kind: ConfigMap
  metadata: {name: lonely, namespace: web}
"#;

    fn world() -> Snapshot { Snapshot::from_items(load_items(WORLD, "ManagedCluster").unwrap()) }

    fn id(s: &str) -> ObjectId { s.parse().unwrap() }

    #[test]
    fn resolve_report_shows_bindings_and_errors() {
        let out = resolve_json(&resolve_all(&world()));
        assert!(out["typo"]["error"].as_str().unwrap().contains("spec"), "{out}");
        assert!(out["web"]["binding"].is_object(), "{out}");
        let pairs = out["web"]["binding"].to_string();
        assert!(pairs.contains("front") && pairs.contains("settings"), "{pairs}");
        assert!(out["nowhere"].get("error").is_none());
    }

    #[test]
    fn shard_preview_honors_the_byte_limit() {
        let snap = world();
        let roomy = shard_preview(&snap, "c1", 1_000_000).unwrap();
        assert_eq!(roomy.shards.len(), 1);
        assert_eq!(roomy.shards[0].objects.len(), 2);
        assert!(shard_preview(&snap, "c2", 1_000_000).unwrap().shards.is_empty());

        let limit = roomy.shards[0].body.len() - 1;
        let tight = shard_preview(&snap, "c1", limit).unwrap();
        assert_eq!(tight.max_bytes, limit);
        assert_eq!(tight.shards.len(), 2, "one shard per object once both no longer fit together");
        assert!(tight.rejected.is_empty());
        assert!(tight.shards.iter().all(|s| s.body.len() <= limit));

        let out = shard_json(&tight);
        assert_eq!(out["cluster"], "c1");
        assert_eq!(out["maxBytes"], limit);
        assert_eq!(out["shards"][1]["index"], 1);
        assert_eq!(out["shards"][0]["objects"][0], "core/ConfigMap/web/settings");
        assert_eq!(out["shards"][1]["objects"][0], "apps/Deployment/web/front");
        assert_eq!(out["shards"][0]["digest"].as_str().unwrap().len(), 64);
        assert!(out["rejected"].as_array().unwrap().is_empty());
    }

    #[test]
    fn explain_reports_policies_destinations_and_singleton_state() {
        let snap = world();
        let front = explain_object(&snap, &id("apps/Deployment/web/front"));
        assert_eq!(front.destinations, vec!["c1".to_string()]);
        assert_eq!(front.state, SingletonState::Mirroring { cluster: "c1".into() });
        let out = front.to_json();
        assert_eq!(out["object"], "apps/Deployment/web/front");
        assert_eq!(out["policies"][0]["policy"], "web");
        assert_eq!(out["singleton"], "mirroring from c1");

        let lonely = explain_object(&snap, &id("core/ConfigMap/web/lonely"));
        assert!(lonely.destinations.is_empty());
        assert_eq!(lonely.state, SingletonState::Suppressed, "wanted with no destination");
        assert_eq!(lonely.to_json()["singleton"], "suppressed");
    }
}
