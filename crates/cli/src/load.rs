//! Offline input: multi-document YAML holding policies, clusters, transforms and workload objects.

use anyhow::{anyhow, Context, Result};
use relay_core::{Cluster, CustomTransform, Item, Policy, WorkloadObject};
use relay_kubehub::{CONTROL_GROUP, POLICY_KIND, TRANSFORM_KIND};
use serde::Deserialize;
use serde_json::Value as Json;

fn max_yaml_bytes() -> usize {
    std::env::var("RELAY_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("RELAY_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut n = 0usize;
    walk(v, &mut n, max);
    n >= max
}

/// Split a YAML stream into JSON documents; `kind: List` is flattened.
pub fn parse_documents(yaml: &str) -> Result<Vec<Json>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    let mut nodes = 0usize;
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).with_context(|| format!("converting YAML document {} to JSON", i))?;
        let budget = max_yaml_nodes().saturating_sub(nodes);
        if json_node_budget_exceeded(&json, budget) {
            return Err(anyhow!("YAML input too complex (>{} nodes)", max_yaml_nodes()));
        }
        nodes += count_nodes(&json);
        match json.get("kind").and_then(|k| k.as_str()) {
            Some(k) if k.ends_with("List") && json.get("items").map(|v| v.is_array()).unwrap_or(false) => {
                if let Some(Json::Array(items)) = json.get("items") {
                    out.extend(items.iter().cloned());
                }
            }
            _ => out.push(json),
        }
    }
    Ok(out)
}

fn count_nodes(v: &Json) -> usize {
    1 + match v {
        Json::Object(map) => map.values().map(count_nodes).sum(),
        Json::Array(arr) => arr.iter().map(count_nodes).sum(),
        _ => 0,
    }
}

/// Classify one document by `apiVersion`/`kind`. `cluster_kind` is the kind
/// (not the full GVK) that names a destination cluster.
pub fn item_from_doc(doc: Json, cluster_kind: &str) -> Result<Item> {
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing apiVersion"))?;
    let kind = doc.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing kind"))?;
    let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    let item = match (group, kind) {
        (CONTROL_GROUP, k) if k == POLICY_KIND => Item::Policy(Policy::from_json(&doc)?),
        (CONTROL_GROUP, k) if k == TRANSFORM_KIND => Item::Transform(CustomTransform::from_json(&doc)?),
        (_, k) if k == cluster_kind => Item::Cluster(Cluster::from_json(&doc)?),
        _ => Item::Object(WorkloadObject::from_json(doc)?),
    };
    Ok(item)
}

pub fn load_items(yaml: &str, cluster_kind: &str) -> Result<Vec<Item>> {
    parse_documents(yaml)?
        .into_iter()
        .enumerate()
        .map(|(i, doc)| item_from_doc(doc, cluster_kind).with_context(|| format!("document {}", i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ItemKey;

    const INPUT: &str = r#"
apiVersion: control.relay.dev/v1alpha1
kind: BindingPolicy
metadata:
  name: nginx
spec:
  clusterSelectors:
  - matchLabels: {env: prod}
  downsync:
  - objectSelectors:
    - matchLabels: {app: nginx}
---
apiVersion: cluster.open-cluster-management.io/v1
kind: ManagedCluster
metadata:
  name: c1
  labels: {env: prod}
---
apiVersion: v1
kind: List
items:
- apiVersion: apps/v1
  kind: Deployment
  metadata: {name: nginx, namespace: web, labels: {app: nginx}}
- apiVersion: control.relay.dev/v1alpha1
  kind: CustomTransform
  metadata: {name: strip}
  spec: {apiGroup: apps, resource: deployments, remove: ["$.spec.replicas"]}
---
"#;

    #[test]
    fn documents_are_classified() {
        let items = load_items(INPUT, "ManagedCluster").unwrap();
        let keys: Vec<ItemKey> = items.iter().map(Item::key).collect();
        assert_eq!(keys.len(), 4);
        assert!(matches!(&keys[0], ItemKey::Policy(n) if n == "nginx"));
        assert!(matches!(&keys[1], ItemKey::Cluster(n) if n == "c1"));
        assert!(matches!(&keys[2], ItemKey::Object(id) if id.namespace == "web" && id.group == "apps"));
        assert!(matches!(&keys[3], ItemKey::Transform(n) if n == "strip"));
    }

    #[test]
    fn errors_name_the_document() {
        let e = load_items("kind: Foo\nmetadata:\n  name: x\n", "ManagedCluster").unwrap_err();
        assert!(format!("{:#}", e).contains("missing apiVersion"), "{:#}", e);
        let e = load_items("---\napiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", "ManagedCluster").unwrap_err();
        assert!(format!("{:#}", e).contains("document 0"), "{:#}", e);
    }

    #[test]
    fn node_budget_counts_early_exit() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": null}});
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(json_node_budget_exceeded(&v, 3));
        assert_eq!(count_nodes(&v), 7);
    }
}
