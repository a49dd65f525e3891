//! Delivery of shards to destination clusters.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use relay_core::{ObjectId, RelayError, RelayResult};
use relay_kubehub::{api_error, is_not_found, transport_resource, FIELD_MANAGER, MANAGED_BY_LABEL};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::Shard;

pub const DIGEST_ANNOTATION: &str = "relay.dev/digest";

/// Moves bundles to a cluster and reads back what its agent reports.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, cluster: &str, shard: &Shard) -> RelayResult<()>;
    /// Removing an absent shard is not an error.
    async fn retract(&self, cluster: &str, index: u32) -> RelayResult<()>;
    /// Shard index → digest of what is currently delivered.
    async fn delivered(&self, cluster: &str) -> RelayResult<BTreeMap<u32, String>>;
    /// Status reported by the cluster for each delivered object.
    async fn collect_status(&self, cluster: &str) -> RelayResult<BTreeMap<ObjectId, Json>>;
}

#[derive(Default)]
struct MemoryState {
    shards: BTreeMap<String, BTreeMap<u32, Shard>>,
    reported: BTreeMap<String, BTreeMap<ObjectId, Json>>,
    deliveries: u64,
}

/// In-process transport. `report_status` plays the role of a cluster agent.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn report_status(&self, cluster: &str, id: &ObjectId, status: Json) {
        self.lock().reported.entry(cluster.to_string()).or_default().insert(id.clone(), status);
    }

    /// Objects currently delivered to `cluster`, across all its shards.
    pub fn objects_on(&self, cluster: &str) -> Vec<ObjectId> {
        let st = self.lock();
        let mut out: Vec<ObjectId> =
            st.shards.get(cluster).into_iter().flat_map(|m| m.values()).flat_map(|s| s.objects.iter().cloned()).collect();
        out.sort();
        out
    }

    pub fn shards_on(&self, cluster: &str) -> Vec<Shard> {
        self.lock().shards.get(cluster).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// Successful `deliver` calls so far.
    pub fn deliveries(&self) -> u64 { self.lock().deliveries }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn deliver(&self, cluster: &str, shard: &Shard) -> RelayResult<()> {
        let mut st = self.lock();
        st.shards.entry(cluster.to_string()).or_default().insert(shard.index, shard.clone());
        st.deliveries += 1;
        Ok(())
    }

    async fn retract(&self, cluster: &str, index: u32) -> RelayResult<()> {
        if let Some(m) = self.lock().shards.get_mut(cluster) {
            m.remove(&index);
        }
        Ok(())
    }

    async fn delivered(&self, cluster: &str) -> RelayResult<BTreeMap<u32, String>> {
        let st = self.lock();
        Ok(st.shards.get(cluster).map(|m| m.iter().map(|(i, s)| (*i, s.digest())).collect()).unwrap_or_default())
    }

    async fn collect_status(&self, cluster: &str) -> RelayResult<BTreeMap<ObjectId, Json>> {
        let st = self.lock();
        let present: Vec<&ObjectId> =
            st.shards.get(cluster).into_iter().flat_map(|m| m.values()).flat_map(|s| s.objects.iter()).collect();
        let reported = st.reported.get(cluster);
        // Agents only report on what they hold.
        Ok(present
            .into_iter()
            .filter_map(|id| reported.and_then(|r| r.get(id)).map(|v| (id.clone(), v.clone())))
            .collect())
    }
}

/// One `WrappedWorkload` per shard, in the namespace named after the cluster.
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, cluster: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), cluster, &transport_resource())
    }
}

pub fn shard_name(index: u32) -> String { format!("relay-shard-{}", index) }

fn selector() -> String { format!("{}={}", MANAGED_BY_LABEL, FIELD_MANAGER) }

/// The applied manifest for one shard.
pub fn wrapped_manifest(cluster: &str, shard: &Shard) -> RelayResult<Json> {
    let ar = transport_resource();
    Ok(json!({
        "apiVersion": ar.api_version,
        "kind": ar.kind,
        "metadata": {
            "name": shard_name(shard.index),
            "namespace": cluster,
            "labels": { MANAGED_BY_LABEL: FIELD_MANAGER },
            "annotations": { DIGEST_ANNOTATION: shard.digest() },
        },
        "spec": {
            "shard": shard.index,
            "objects": shard.object_bodies()?,
        }
    }))
}

fn shard_index(obj: &DynamicObject) -> Option<u32> {
    obj.data.pointer("/spec/shard").and_then(|v| v.as_u64()).and_then(|v| u32::try_from(v).ok())
}

/// `status.objects` entries are `{object: ObjectId, status: {...}}`.
pub fn reported_statuses(obj: &DynamicObject) -> BTreeMap<ObjectId, Json> {
    let Some(Json::Array(entries)) = obj.data.pointer("/status/objects") else { return BTreeMap::new() };
    entries
        .iter()
        .filter_map(|e| {
            let id: ObjectId = serde_json::from_value(e.get("object")?.clone()).ok()?;
            Some((id, e.get("status")?.clone()))
        })
        .collect()
}

#[async_trait]
impl Transport for KubeTransport {
    async fn deliver(&self, cluster: &str, shard: &Shard) -> RelayResult<()> {
        let manifest = wrapped_manifest(cluster, shard)?;
        let name = shard_name(shard.index);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api(cluster)
            .patch(&name, &pp, &Patch::Apply(&manifest))
            .await
            .map_err(|e| api_error(&format!("{}/{}", cluster, name), e))?;
        debug!(cluster, shard = shard.index, bytes = shard.body.len(), "shard applied");
        Ok(())
    }

    async fn retract(&self, cluster: &str, index: u32) -> RelayResult<()> {
        let name = shard_name(index);
        match self.api(cluster).delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(api_error(&format!("{}/{}", cluster, name), e)),
        }
    }

    async fn delivered(&self, cluster: &str) -> RelayResult<BTreeMap<u32, String>> {
        let list = self.api(cluster).list(&ListParams::default().labels(&selector())).await;
        let list = match list {
            Ok(l) => l,
            // No namespace yet: nothing delivered.
            Err(e) if is_not_found(&e) => return Ok(BTreeMap::new()),
            Err(e) => return Err(api_error(cluster, e)),
        };
        let mut out = BTreeMap::new();
        for obj in list.items.iter() {
            let Some(index) = shard_index(obj) else {
                return Err(RelayError::Malformed(format!("{}: wrapped workload {:?} has no spec.shard", cluster, obj.metadata.name)));
            };
            let digest = obj.metadata.annotations.as_ref().and_then(|a| a.get(DIGEST_ANNOTATION)).cloned().unwrap_or_default();
            out.insert(index, digest);
        }
        Ok(out)
    }

    async fn collect_status(&self, cluster: &str) -> RelayResult<BTreeMap<ObjectId, Json>> {
        let list = match self.api(cluster).list(&ListParams::default().labels(&selector())).await {
            Ok(l) => l,
            Err(e) if is_not_found(&e) => return Ok(BTreeMap::new()),
            Err(e) => return Err(api_error(cluster, e)),
        };
        Ok(list.items.iter().flat_map(reported_statuses).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard;

    fn plan() -> crate::ShardPlan {
        let objs = ["a", "b"].map(|n| {
            (
                ObjectId::new("", "ConfigMap", "ns", n),
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": n, "namespace": "ns"}}),
            )
        });
        shard("c1", objs, 10_000).unwrap()
    }

    #[test]
    fn manifest_carries_objects_and_digest() {
        let p = plan();
        let m = wrapped_manifest("c1", &p.shards[0]).unwrap();
        assert_eq!(m["kind"], "WrappedWorkload");
        assert_eq!(m["metadata"]["namespace"], "c1");
        assert_eq!(m["metadata"]["name"], "relay-shard-0");
        assert_eq!(m["metadata"]["annotations"][DIGEST_ANNOTATION], json!(p.shards[0].digest()));
        assert_eq!(m["spec"]["objects"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn status_entries_parse_and_skip_garbage() {
        let ar = transport_resource();
        let obj = DynamicObject::new("relay-shard-0", &ar).within("c1").data(json!({
            "spec": {"shard": 0, "objects": []},
            "status": {"objects": [
                {"object": {"group": "", "kind": "ConfigMap", "namespace": "ns", "name": "a"}, "status": {"phase": "Ready"}},
                {"object": "nonsense", "status": {}},
                {"object": {"group": "", "kind": "ConfigMap", "namespace": "ns", "name": "b"}}
            ]}
        }));
        let got = reported_statuses(&obj);
        assert_eq!(got.len(), 1);
        assert_eq!(got[&ObjectId::new("", "ConfigMap", "ns", "a")], json!({"phase": "Ready"}));
        assert_eq!(shard_index(&obj), Some(0));
    }

    #[tokio::test]
    async fn memory_transport_reports_only_held_objects() {
        let t = MemoryTransport::new();
        let p = plan();
        t.deliver("c1", &p.shards[0]).await.unwrap();
        let a = ObjectId::new("", "ConfigMap", "ns", "a");
        t.report_status("c1", &a, json!({"ok": true}));
        t.report_status("c2", &a, json!({"ok": false}));
        assert_eq!(t.collect_status("c1").await.unwrap().len(), 1);
        assert!(t.collect_status("c2").await.unwrap().is_empty());
        assert_eq!(t.delivered("c1").await.unwrap(), p.digests());
        t.retract("c1", 0).await.unwrap();
        t.retract("c1", 7).await.unwrap();
        assert!(t.collect_status("c1").await.unwrap().is_empty());
        assert!(t.objects_on("c1").is_empty());
    }
}
