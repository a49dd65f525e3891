//! Relay bind: persist each policy's resolved binding with minimal writes.
//!
//! Writes are optimistic: an update carries the resource version it was
//! computed against and a conflict re-reads before trying again.

#![forbid(unsafe_code)]

pub mod kube_store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use metrics::counter;
use relay_core::{BindingSpec, ObjectId, RelayError, RelayResult};
use serde::Serialize;
use tracing::{debug, info};

pub use crate::kube_store::KubeBindingStore;

/// A binding as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBinding {
    pub spec: BindingSpec,
    pub resource_version: String,
}

/// Storage for Binding objects, one per policy name.
///
/// `create` fails with `Conflict` when the name exists; `update` fails with
/// `Conflict` on a stale resource version and `NotFound` when the binding is gone.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn get(&self, name: &str) -> RelayResult<Option<StoredBinding>>;
    async fn create(&self, name: &str, spec: &BindingSpec) -> RelayResult<StoredBinding>;
    async fn update(&self, name: &str, spec: &BindingSpec, resource_version: &str) -> RelayResult<StoredBinding>;
    /// Returns false when there was nothing to delete.
    async fn delete(&self, name: &str) -> RelayResult<bool>;
    async fn list(&self) -> RelayResult<Vec<(String, StoredBinding)>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindingDiff {
    pub added: Vec<(ObjectId, String)>,
    pub removed: Vec<(ObjectId, String)>,
    pub singleton_changed: bool,
}

impl BindingDiff {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() && !self.singleton_changed }

    /// Clusters whose delivered set may have changed.
    pub fn touched_clusters(&self) -> BTreeSet<String> {
        self.added.iter().chain(self.removed.iter()).map(|(_, c)| c.clone()).collect()
    }

    pub fn touched_objects(&self) -> BTreeSet<ObjectId> {
        self.added.iter().chain(self.removed.iter()).map(|(o, _)| o.clone()).collect()
    }
}

/// Pair-level difference between two bindings.
pub fn diff(old: &BindingSpec, new: &BindingSpec) -> BindingDiff {
    let before: BTreeSet<(&ObjectId, &str)> = old.pairs().collect();
    let after: BTreeSet<(&ObjectId, &str)> = new.pairs().collect();
    let own = |(o, c): &(&ObjectId, &str)| ((*o).clone(), c.to_string());
    BindingDiff {
        added: after.difference(&before).map(own).collect(),
        removed: before.difference(&after).map(own).collect(),
        singleton_changed: old.want_singleton_reported_state != new.want_singleton_reported_state,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Transition actually applied, relative to the last state read.
    pub diff: BindingDiff,
    pub written: bool,
    pub attempts: u32,
}

/// Make the stored binding `name` equal `desired`, writing only on difference.
pub async fn reconcile(
    store: &dyn BindingStore,
    name: &str,
    desired: &BindingSpec,
    max_attempts: u32,
) -> RelayResult<ReconcileOutcome> {
    let max_attempts = max_attempts.max(1);
    let desired = &desired.clone().normalized();
    for attempt in 1..=max_attempts {
        let result = match store.get(name).await? {
            None => store.create(name, desired).await.map(|_| diff(&BindingSpec::default(), desired)),
            Some(cur) => {
                if cur.spec == *desired {
                    return Ok(ReconcileOutcome { diff: BindingDiff::default(), written: false, attempts: attempt });
                }
                let d = diff(&cur.spec, desired);
                store.update(name, desired, &cur.resource_version).await.map(|_| d)
            }
        };
        match result {
            Ok(diff) => {
                counter!("binding_writes_total", 1u64);
                debug!(binding = %name, added = diff.added.len(), removed = diff.removed.len(), attempt, "binding written");
                return Ok(ReconcileOutcome { diff, written: true, attempts: attempt });
            }
            // Concurrent writer or concurrent delete: re-read and go again.
            Err(RelayError::Conflict(msg)) | Err(RelayError::NotFound(msg)) => {
                counter!("binding_conflicts_total", 1u64);
                debug!(binding = %name, attempt, reason = %msg, "binding write raced; retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(RelayError::Transient(format!("binding {}: write conflicts persisted after {} attempts", name, max_attempts)))
}

/// Delete the binding, returning what it held so callers can retract deliveries.
pub async fn retract(store: &dyn BindingStore, name: &str) -> RelayResult<Option<BindingSpec>> {
    let Some(cur) = store.get(name).await? else { return Ok(None); };
    if store.delete(name).await? {
        counter!("binding_writes_total", 1u64);
        info!(binding = %name, pairs = cur.spec.pair_count(), "binding retracted");
    }
    Ok(Some(cur.spec))
}

/// Process-local store with injectable conflicts; used by tests and offline runs.
#[derive(Default)]
pub struct InMemoryBindingStore {
    items: Mutex<BTreeMap<String, StoredBinding>>,
    rv: AtomicU64,
    conflicts: AtomicU32,
    writes: AtomicU64,
}

impl InMemoryBindingStore {
    pub fn new() -> Self { Self::default() }

    /// Fail the next `n` updates with `Conflict`, bumping the stored version as a rival writer would.
    pub fn inject_conflicts(&self, n: u32) { self.conflicts.store(n, Ordering::SeqCst); }

    /// Successful create/update/delete calls so far.
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::SeqCst) }

    pub fn snapshot(&self) -> BTreeMap<String, BindingSpec> {
        self.lock().iter().map(|(k, v)| (k.clone(), v.spec.clone())).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredBinding>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_rv(&self) -> String { (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string() }
}

#[async_trait]
impl BindingStore for InMemoryBindingStore {
    async fn get(&self, name: &str) -> RelayResult<Option<StoredBinding>> { Ok(self.lock().get(name).cloned()) }

    async fn create(&self, name: &str, spec: &BindingSpec) -> RelayResult<StoredBinding> {
        let mut items = self.lock();
        if items.contains_key(name) {
            return Err(RelayError::Conflict(format!("binding {} already exists", name)));
        }
        let stored = StoredBinding { spec: spec.clone().normalized(), resource_version: self.next_rv() };
        items.insert(name.to_string(), stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn update(&self, name: &str, spec: &BindingSpec, resource_version: &str) -> RelayResult<StoredBinding> {
        let mut items = self.lock();
        let Some(cur) = items.get_mut(name) else {
            return Err(RelayError::NotFound(format!("binding {}", name)));
        };
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            cur.resource_version = self.next_rv();
        }
        if cur.resource_version != resource_version {
            return Err(RelayError::Conflict(format!(
                "binding {}: resourceVersion {} is stale (now {})",
                name, resource_version, cur.resource_version
            )));
        }
        *cur = StoredBinding { spec: spec.clone().normalized(), resource_version: self.next_rv() };
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(cur.clone())
    }

    async fn delete(&self, name: &str) -> RelayResult<bool> {
        let removed = self.lock().remove(name).is_some();
        if removed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn list(&self) -> RelayResult<Vec<(String, StoredBinding)>> {
        Ok(self.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: &str) -> ObjectId { ObjectId::new("apps", "Deployment", "ns", n) }

    fn spec(pairs: &[(&str, &str)], want: bool) -> BindingSpec {
        BindingSpec::from_pairs(pairs.iter().map(|(o, c)| (id(o), c.to_string())), want)
    }

    #[test]
    fn diff_reports_pairs_both_ways() {
        let old = spec(&[("a", "c1"), ("a", "c2"), ("b", "c1")], false);
        let new = spec(&[("a", "c1"), ("b", "c1"), ("b", "c3")], true);
        let d = diff(&old, &new);
        assert_eq!(d.added, vec![(id("b"), "c3".to_string())]);
        assert_eq!(d.removed, vec![(id("a"), "c2".to_string())]);
        assert!(d.singleton_changed);
        assert_eq!(d.touched_clusters().into_iter().collect::<Vec<_>>(), vec!["c2", "c3"]);
        assert!(diff(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn reconcile_skips_identical_writes() {
        let store = InMemoryBindingStore::new();
        let want = spec(&[("a", "c1")], false);
        let first = reconcile(&store, "p", &want, 3).await.unwrap();
        assert!(first.written);
        assert_eq!(first.diff.added.len(), 1);
        let again = reconcile(&store, "p", &want, 3).await.unwrap();
        assert!(!again.written);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn reconcile_retries_through_conflicts() {
        let store = InMemoryBindingStore::new();
        reconcile(&store, "p", &spec(&[("a", "c1")], false), 3).await.unwrap();
        store.inject_conflicts(2);
        let out = reconcile(&store, "p", &spec(&[("a", "c2")], false), 5).await.unwrap();
        assert!(out.written);
        assert_eq!(out.attempts, 3);
        assert_eq!(store.snapshot()["p"], spec(&[("a", "c2")], false));
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_as_transient() {
        let store = InMemoryBindingStore::new();
        reconcile(&store, "p", &spec(&[("a", "c1")], false), 3).await.unwrap();
        store.inject_conflicts(10);
        let err = reconcile(&store, "p", &spec(&[("a", "c2")], false), 3).await.unwrap_err();
        assert!(matches!(err, RelayError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn retract_returns_previous_contents() {
        let store = InMemoryBindingStore::new();
        assert_eq!(retract(&store, "p").await.unwrap(), None);
        reconcile(&store, "p", &spec(&[("a", "c1")], false), 3).await.unwrap();
        let held = retract(&store, "p").await.unwrap().unwrap();
        assert_eq!(held.pair_count(), 1);
        assert!(store.get("p").await.unwrap().is_none());
    }
}
