//! Relay core types: workload envelopes, policies, bindings and index deltas.

#![forbid(unsafe_code)]

pub mod error;
pub mod selector;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use error::{RelayError, RelayResult};
pub use selector::{matches_any, LabelSelector, Operator, Requirement, SelectorError};

pub type Labels = BTreeMap<String, String>;

pub mod prelude {
    pub use super::{
        BindingSpec, Cluster, Condition, ConditionTarget, CustomTransform, Delta, DeltaKind, DownsyncTest, Item,
        ItemKey, LabelSelector, Labels, ObjectBinding, ObjectId, Policy, PolicySpec, RelayError, RelayResult,
        WorkloadObject,
    };
}

// ---- identities ----

/// Identity of a workload object: group/kind/namespace/name.
/// `namespace` is empty for cluster-scoped kinds, `group` is empty for the core group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ObjectId {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self { group: group.to_string(), kind: kind.to_string(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn is_namespaced(&self) -> bool { !self.namespace.is_empty() }
}

/// Renders as `group/kind/namespace/name` with `core` and `-` standing in for empty parts.
impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = if self.group.is_empty() { "core" } else { &self.group };
        let ns = if self.namespace.is_empty() { "-" } else { &self.namespace };
        write!(f, "{}/{}/{}/{}", g, self.kind, ns, self.name)
    }
}

impl FromStr for ObjectId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [group, kind, ns, name] if !kind.is_empty() && !name.is_empty() => {
                let group = if *group == "core" { "" } else { group };
                let ns = if *ns == "-" { "" } else { ns };
                Ok(ObjectId::new(group, kind, ns, name))
            }
            _ => Err(RelayError::Malformed(format!("invalid object id {:?} (expect group/kind/namespace/name)", s))),
        }
    }
}

// ---- envelopes ----

fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

fn required_name(v: &Json, what: &str) -> RelayResult<String> {
    meta_str(v, "name")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RelayError::Malformed(format!("{} missing metadata.name", what)))
}

/// Extract `metadata.labels`, skipping non-string values.
pub fn labels_of(v: &Json) -> Labels {
    v.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// A workload object as seen by the engine: a typed envelope around an opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadObject {
    pub id: ObjectId,
    pub api_version: String,
    /// Lower-case plural the apiserver serves this kind under.
    pub resource: String,
    pub labels: Labels,
    pub resource_version: String,
    pub payload: Arc<Json>,
}

impl WorkloadObject {
    pub fn from_json(v: Json) -> RelayResult<Self> {
        let api_version = v
            .get("apiVersion")
            .and_then(|s| s.as_str())
            .ok_or_else(|| RelayError::Malformed("object missing apiVersion".into()))?
            .to_string();
        let kind = v
            .get("kind")
            .and_then(|s| s.as_str())
            .ok_or_else(|| RelayError::Malformed("object missing kind".into()))?
            .to_string();
        let group = api_version.split_once('/').map(|(g, _)| g.to_string()).unwrap_or_default();
        let name = required_name(&v, "object")?;
        let namespace = meta_str(&v, "namespace").unwrap_or("").to_string();
        let resource_version = meta_str(&v, "resourceVersion").unwrap_or("").to_string();
        let labels = labels_of(&v);
        let resource = plural_of(&kind);
        Ok(Self {
            id: ObjectId { group, kind, namespace, name },
            api_version,
            resource,
            labels,
            resource_version,
            payload: Arc::new(v),
        })
    }

    /// Replace the guessed plural with the one discovery reported.
    pub fn with_resource(mut self, plural: impl Into<String>) -> Self {
        self.resource = plural.into();
        self
    }
}

/// A destination cluster's inventory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
}

impl Cluster {
    pub fn new<'a>(name: &str, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self { name: name.to_string(), labels: labels.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }
    }

    pub fn from_json(v: &Json) -> RelayResult<Self> {
        Ok(Self { name: required_name(v, "cluster")?, labels: labels_of(v) })
    }
}

// ---- policies ----

/// One object-match test. Name membership OR any selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownsyncTest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_selectors: Vec<LabelSelector>,
}

impl DownsyncTest {
    pub fn matches(&self, name: &str, labels: &Labels) -> bool {
        self.object_names.iter().any(|n| n == name) || matches_any(&self.object_selectors, labels)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub cluster_selectors: Vec<LabelSelector>,
    #[serde(default)]
    pub downsync: Vec<DownsyncTest>,
    #[serde(default)]
    pub want_singleton_reported_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub generation: Option<i64>,
    pub spec: PolicySpec,
    /// Set when the stored spec could not be decoded. Such a policy is still
    /// indexed so it can carry a condition; it selects nothing.
    pub invalid: Option<String>,
}

impl Policy {
    pub fn new(name: &str, spec: PolicySpec) -> Self {
        Self { name: name.to_string(), generation: None, spec, invalid: None }
    }

    /// Only a missing name is an error. An undecodable spec yields a policy
    /// that fails [`Policy::validate`].
    pub fn from_json(v: &Json) -> RelayResult<Self> {
        let name = required_name(v, "policy")?;
        let generation = v.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64());
        let (spec, invalid) = match v.get("spec") {
            Some(s) => match serde_json::from_value(s.clone()) {
                Ok(spec) => (spec, None),
                Err(e) => (PolicySpec::default(), Some(format!("spec: {}", e))),
            },
            None => (PolicySpec::default(), None),
        };
        Ok(Self { name, generation, spec, invalid })
    }

    /// Check every selector; the error names the offending path.
    pub fn validate(&self) -> RelayResult<()> {
        if let Some(msg) = &self.invalid {
            return Err(RelayError::Malformed(msg.clone()));
        }
        for (i, s) in self.spec.cluster_selectors.iter().enumerate() {
            s.validate().map_err(|e| RelayError::Malformed(format!("spec.clusterSelectors[{}]: {}", i, e)))?;
        }
        for (i, t) in self.spec.downsync.iter().enumerate() {
            for (j, s) in t.object_selectors.iter().enumerate() {
                s.validate()
                    .map_err(|e| RelayError::Malformed(format!("spec.downsync[{}].objectSelectors[{}]: {}", i, j, e)))?;
            }
        }
        Ok(())
    }
}

/// Field-removal rule applied to matching objects before they are wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomTransform {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_group: String,
    pub resource: String,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl CustomTransform {
    pub fn from_json(v: &Json) -> RelayResult<Self> {
        let name = required_name(v, "transform")?;
        let spec = v.get("spec").cloned().ok_or_else(|| RelayError::Malformed(format!("transform {} missing spec", name)))?;
        let mut t: CustomTransform =
            serde_json::from_value(spec).map_err(|e| RelayError::Malformed(format!("transform {}: {}", name, e)))?;
        t.name = name;
        Ok(t)
    }

    /// `resource` may name the kind or the object's served plural.
    pub fn applies_to(&self, obj: &WorkloadObject) -> bool {
        self.api_group == obj.id.group
            && (self.resource.eq_ignore_ascii_case(&obj.id.kind) || self.resource == obj.resource)
    }
}

fn plural_of(kind: &str) -> String {
    let k = kind.to_ascii_lowercase();
    if k.ends_with('s') || k.ends_with('x') || k.ends_with("ch") || k.ends_with("sh") {
        format!("{}es", k)
    } else if k.ends_with('y') && !k.ends_with("ay") && !k.ends_with("ey") && !k.ends_with("oy") {
        format!("{}ies", &k[..k.len() - 1])
    } else {
        format!("{}s", k)
    }
}

// ---- bindings ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectBinding {
    pub object: ObjectId,
    pub clusters: BTreeSet<String>,
}

/// Resolved object → destination-set mapping of one policy. Kept sorted by object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    #[serde(default)]
    pub bindings: Vec<ObjectBinding>,
    #[serde(default)]
    pub want_singleton_reported_state: bool,
}

impl BindingSpec {
    /// Every object bound to every cluster. No clusters means no bindings.
    pub fn cross(objects: &BTreeSet<ObjectId>, clusters: &BTreeSet<String>, want_singleton: bool) -> Self {
        let bindings = if clusters.is_empty() {
            Vec::new()
        } else {
            objects.iter().map(|o| ObjectBinding { object: o.clone(), clusters: clusters.clone() }).collect()
        };
        Self { bindings, want_singleton_reported_state: want_singleton }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (ObjectId, String)>, want_singleton: bool) -> Self {
        let mut by_obj: BTreeMap<ObjectId, BTreeSet<String>> = BTreeMap::new();
        for (o, c) in pairs {
            by_obj.entry(o).or_default().insert(c);
        }
        Self {
            bindings: by_obj.into_iter().map(|(object, clusters)| ObjectBinding { object, clusters }).collect(),
            want_singleton_reported_state: want_singleton,
        }
    }

    /// Sort, merge duplicate objects and drop empty destination sets.
    pub fn normalized(self) -> Self {
        let want = self.want_singleton_reported_state;
        Self::from_pairs(self.bindings.into_iter().flat_map(|b| {
            let o = b.object;
            b.clusters.into_iter().map(move |c| (o.clone(), c))
        }), want)
    }

    pub fn is_empty(&self) -> bool { self.bindings.iter().all(|b| b.clusters.is_empty()) }

    pub fn pairs(&self) -> impl Iterator<Item = (&ObjectId, &str)> + '_ {
        self.bindings.iter().flat_map(|b| b.clusters.iter().map(move |c| (&b.object, c.as_str())))
    }

    pub fn pair_count(&self) -> usize { self.bindings.iter().map(|b| b.clusters.len()).sum() }

    pub fn clusters(&self) -> BTreeSet<String> {
        self.bindings.iter().flat_map(|b| b.clusters.iter().cloned()).collect()
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectId> + '_ { self.bindings.iter().map(|b| &b.object) }

    pub fn destinations_of(&self, id: &ObjectId) -> Option<&BTreeSet<String>> {
        self.bindings.binary_search_by(|b| b.object.cmp(id)).ok().map(|i| &self.bindings[i].clusters)
    }
}

// ---- conditions ----

/// Kubernetes-style condition used to report malformed input on the offending resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn failing(type_: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: "False".to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionTarget {
    Policy(String),
    Object(ObjectId),
}

// ---- index deltas ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// Identity of anything the candidate index holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemKey {
    Policy(String),
    Object(ObjectId),
    Cluster(String),
    Transform(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Policy(Policy),
    Object(WorkloadObject),
    Cluster(Cluster),
    Transform(CustomTransform),
}

impl Item {
    pub fn key(&self) -> ItemKey {
        match self {
            Item::Policy(p) => ItemKey::Policy(p.name.clone()),
            Item::Object(o) => ItemKey::Object(o.id.clone()),
            Item::Cluster(c) => ItemKey::Cluster(c.name.clone()),
            Item::Transform(t) => ItemKey::Transform(t.name.clone()),
        }
    }
}

/// One change notification from a watch. `item` is `None` for deletions.
#[derive(Debug, Clone)]
pub struct Delta {
    pub key: ItemKey,
    pub kind: DeltaKind,
    pub item: Option<Item>,
}

impl Delta {
    pub fn applied(item: Item) -> Self { Self { key: item.key(), kind: DeltaKind::Applied, item: Some(item) } }

    pub fn deleted(key: ItemKey) -> Self { Self { key, kind: DeltaKind::Deleted, item: None } }
}
