//! Relay resolve: compute what each policy selects.
//!
//! Object and cluster matching are independent axes; a policy's binding is the
//! full cross product of the two matched sets. [`Placement`] merges the bindings
//! of every policy into per-cluster and per-object views, collapsing duplicate
//! (object, cluster) pairs.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use relay_core::{matches_any, BindingSpec, Cluster, ItemKey, ObjectId, Policy, RelayResult, WorkloadObject};
use relay_store::{Change, ChangeKind, Snapshot};
use smallvec::SmallVec;
use tracing::debug;

pub fn cluster_matches(policy: &Policy, cluster: &Cluster) -> bool {
    matches_any(&policy.spec.cluster_selectors, &cluster.labels)
}

/// OR across the policy's tests. A policy without tests selects nothing.
pub fn object_matches(policy: &Policy, obj: &WorkloadObject) -> bool {
    policy.spec.downsync.iter().any(|t| t.matches(&obj.id.name, &obj.labels))
}

pub fn matched_clusters(policy: &Policy, snap: &Snapshot) -> BTreeSet<String> {
    snap.clusters().filter(|c| cluster_matches(policy, c)).map(|c| c.name.clone()).collect()
}

pub fn matched_objects(policy: &Policy, snap: &Snapshot) -> BTreeSet<ObjectId> {
    snap.objects().filter(|o| object_matches(policy, o)).map(|o| o.id.clone()).collect()
}

/// Outcome of resolving one policy against a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub policy: String,
    pub objects: BTreeSet<ObjectId>,
    pub clusters: BTreeSet<String>,
    pub want_singleton: bool,
}

impl Resolution {
    pub fn binding(&self) -> BindingSpec { BindingSpec::cross(&self.objects, &self.clusters, self.want_singleton) }

    /// Objects this policy asks singleton status for. Independent of the
    /// cluster set: with no destinations the answer is still "wanted".
    pub fn wanted(&self) -> BTreeSet<ObjectId> {
        if self.want_singleton { self.objects.clone() } else { BTreeSet::new() }
    }
}

/// Resolve a policy. Invalid selectors are `Malformed`; nothing else fails.
pub fn resolve(policy: &Policy, snap: &Snapshot) -> RelayResult<Resolution> {
    policy.validate()?;
    let clusters = matched_clusters(policy, snap);
    let objects = matched_objects(policy, snap);
    metrics::counter!("resolve_total", 1u64);
    debug!(policy = %policy.name, epoch = snap.epoch, objects = objects.len(), clusters = clusters.len(), "policy resolved");
    Ok(Resolution {
        policy: policy.name.clone(),
        objects,
        clusters,
        want_singleton: policy.spec.want_singleton_reported_state,
    })
}

/// Resolve every policy in the snapshot, keyed by policy name.
pub fn resolve_all(snap: &Snapshot) -> BTreeMap<String, RelayResult<Resolution>> {
    snap.policies().map(|p| (p.name.clone(), resolve(p, snap))).collect()
}

// ---- merged placement ----

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPlacement {
    pub clusters: BTreeSet<String>,
    pub policies: BTreeSet<String>,
    /// Some binding that includes the object asked for singleton reported state.
    pub want_singleton: bool,
}

/// Union of all bindings: the authoritative destination sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    per_cluster: BTreeMap<String, BTreeSet<ObjectId>>,
    per_object: BTreeMap<ObjectId, ObjectPlacement>,
    /// Objects some policy wants singleton status for, including ones with no destination.
    wanted: BTreeSet<ObjectId>,
}

impl Placement {
    pub fn merge<'a>(bindings: impl IntoIterator<Item = (&'a str, &'a BindingSpec)>) -> Self {
        let mut out = Placement::default();
        for (policy, spec) in bindings {
            for b in &spec.bindings {
                if b.clusters.is_empty() { continue; }
                let entry = out.per_object.entry(b.object.clone()).or_default();
                entry.policies.insert(policy.to_string());
                entry.want_singleton |= spec.want_singleton_reported_state;
                if spec.want_singleton_reported_state {
                    out.wanted.insert(b.object.clone());
                }
                for c in &b.clusters {
                    entry.clusters.insert(c.clone());
                    out.per_cluster.entry(c.clone()).or_default().insert(b.object.clone());
                }
            }
        }
        out
    }

    /// Add objects wanted by policies whose bindings carry no pairs for them.
    pub fn with_wanted<'a>(mut self, ids: impl IntoIterator<Item = &'a ObjectId>) -> Self {
        self.wanted.extend(ids.into_iter().cloned());
        self
    }

    pub fn wants_singleton(&self, id: &ObjectId) -> bool { self.wanted.contains(id) }

    /// Every object whose singleton status the engine is responsible for.
    pub fn singleton_objects(&self) -> impl Iterator<Item = &ObjectId> + '_ { self.wanted.iter() }

    pub fn destinations(&self, id: &ObjectId) -> BTreeSet<String> {
        self.per_object.get(id).map(|p| p.clusters.clone()).unwrap_or_default()
    }

    pub fn objects_for(&self, cluster: &str) -> impl Iterator<Item = &ObjectId> + '_ {
        self.per_cluster.get(cluster).into_iter().flat_map(|s| s.iter())
    }

    pub fn object(&self, id: &ObjectId) -> Option<&ObjectPlacement> { self.per_object.get(id) }

    /// Destination count over the union of all policies.
    pub fn destination_count(&self, id: &ObjectId) -> usize { self.per_object.get(id).map(|p| p.clusters.len()).unwrap_or(0) }

    pub fn clusters(&self) -> impl Iterator<Item = &String> + '_ { self.per_cluster.keys() }
    pub fn objects(&self) -> impl Iterator<Item = (&ObjectId, &ObjectPlacement)> + '_ { self.per_object.iter() }
}

// ---- change dispatch ----

/// Which work a change in the index invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affects {
    Policy(String),
    AllPolicies,
    /// Only bundles carrying this object need rebuilding (payload changed, labels did not).
    Bundles(ObjectId),
    AllBundles,
}

/// Conservative mapping: any object or cluster that may change selection recomputes every policy.
pub fn affects(change: &Change) -> Affects {
    match (&change.key, change.kind) {
        (ItemKey::Policy(name), _) => Affects::Policy(name.clone()),
        (ItemKey::Object(id), ChangeKind::Updated { selection: false }) => Affects::Bundles(id.clone()),
        (ItemKey::Object(_), _) | (ItemKey::Cluster(_), _) => Affects::AllPolicies,
        (ItemKey::Transform(_), _) => Affects::AllBundles,
    }
}

// ---- explain ----

/// Why a policy selects an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMatch {
    pub policy: String,
    /// Indices of the downsync tests that matched.
    pub tests: SmallVec<[usize; 4]>,
    pub clusters: BTreeSet<String>,
    pub want_singleton: bool,
}

pub fn explain(snap: &Snapshot, id: &ObjectId) -> Vec<PolicyMatch> {
    let Some(obj) = snap.object(id) else { return Vec::new(); };
    snap.policies()
        .filter_map(|p| {
            let tests: SmallVec<[usize; 4]> = p
                .spec
                .downsync
                .iter()
                .enumerate()
                .filter(|(_, t)| t.matches(&obj.id.name, &obj.labels))
                .map(|(i, _)| i)
                .collect();
            if tests.is_empty() { return None; }
            Some(PolicyMatch {
                policy: p.name.clone(),
                tests,
                clusters: matched_clusters(p, snap),
                want_singleton: p.spec.want_singleton_reported_state,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{DownsyncTest, LabelSelector, ObjectBinding, PolicySpec};

    fn spec(pairs: &[(&str, &[&str])], want: bool) -> BindingSpec {
        BindingSpec {
            bindings: pairs
                .iter()
                .map(|(o, cs)| ObjectBinding {
                    object: ObjectId::new("apps", "Deployment", "ns", o),
                    clusters: cs.iter().map(|c| c.to_string()).collect(),
                })
                .collect(),
            want_singleton_reported_state: want,
        }
    }

    #[test]
    fn merge_unions_pairs_idempotently() {
        let a = spec(&[("nginx", &["c1", "c2"])], false);
        let b = spec(&[("nginx", &["c1", "c2"]), ("api", &["c2"])], true);
        let p = Placement::merge([("a", &a), ("b", &b)]);
        let nginx = ObjectId::new("apps", "Deployment", "ns", "nginx");
        assert_eq!(p.destination_count(&nginx), 2);
        assert_eq!(p.object(&nginx).unwrap().policies.len(), 2);
        assert!(p.object(&nginx).unwrap().want_singleton);
        assert_eq!(p.objects_for("c2").count(), 2);
        assert_eq!(p.objects_for("c1").count(), 1);
        assert_eq!(p.objects_for("nowhere").count(), 0);
    }

    #[test]
    fn wanted_objects_survive_an_empty_cluster_set() {
        let nginx = ObjectId::new("apps", "Deployment", "ns", "nginx");
        let api = ObjectId::new("apps", "Deployment", "ns", "api");
        let nowhere = Resolution {
            policy: "p".into(),
            objects: [nginx.clone()].into_iter().collect(),
            clusters: BTreeSet::new(),
            want_singleton: true,
        };
        assert!(nowhere.binding().is_empty());
        let shared = spec(&[("api", &["c1"])], true);
        let wanted = nowhere.wanted();
        let p = Placement::merge([("p", &nowhere.binding()), ("q", &shared)]).with_wanted(&wanted);
        assert!(p.wants_singleton(&nginx));
        assert!(p.destinations(&nginx).is_empty());
        assert_eq!(p.destination_count(&nginx), 0);
        assert!(p.wants_singleton(&api), "bindings with pairs feed the wanted set too");
        assert_eq!(p.singleton_objects().count(), 2);
        assert!(Resolution { want_singleton: false, ..nowhere }.wanted().is_empty());
    }

    #[test]
    fn dispatch_classification() {
        let id = ObjectId::new("", "ConfigMap", "ns", "c");
        let ch = |key, kind| Change { key, kind };
        assert_eq!(affects(&ch(ItemKey::Policy("p".into()), ChangeKind::Removed)), Affects::Policy("p".into()));
        assert_eq!(affects(&ch(ItemKey::Object(id.clone()), ChangeKind::Updated { selection: false })), Affects::Bundles(id.clone()));
        assert_eq!(affects(&ch(ItemKey::Object(id), ChangeKind::Added)), Affects::AllPolicies);
        assert_eq!(affects(&ch(ItemKey::Cluster("c1".into()), ChangeKind::Updated { selection: true })), Affects::AllPolicies);
        assert_eq!(affects(&ch(ItemKey::Transform("t".into()), ChangeKind::Added)), Affects::AllBundles);
    }

    #[test]
    fn policy_without_tests_selects_nothing() {
        let p = Policy::new(
            "empty",
            PolicySpec { cluster_selectors: vec![LabelSelector::default()], downsync: vec![], want_singleton_reported_state: false },
        );
        let obj = WorkloadObject::from_json(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "ns"}
        }))
        .unwrap();
        assert!(!object_matches(&p, &obj));
        let with_empty_test = Policy::new(
            "t",
            PolicySpec { downsync: vec![DownsyncTest::default()], ..Default::default() },
        );
        assert!(!object_matches(&with_empty_test, &obj), "a test with no names and no selectors is false");
    }
}
