//! Relay store: the candidate index.
//!
//! Deltas from the watch adapters are coalesced per key, applied to an
//! [`IndexBuilder`], and published as immutable [`Snapshot`]s. Every applied
//! batch also yields the list of [`Change`]s it caused, broadcast to
//! subscribers so the engine can enqueue work. The index is a cache: rebuilding
//! it from a full relist converges to the same snapshot.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use relay_core::{Cluster, CustomTransform, Delta, DeltaKind, Item, ItemKey, ObjectId, Policy, WorkloadObject};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

/// Coalescing queue keyed by item identity with FIFO order and a soft capacity.
pub struct Coalescer {
    map: FxHashMap<ItemKey, Delta>,
    order: VecDeque<ItemKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Queue a delta, replacing any pending delta for the same key in place.
    /// Returns true once the queue reached capacity and should be drained.
    pub fn push(&mut self, d: Delta) -> bool {
        let key = d.key.clone();
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
        self.map.len() >= self.cap
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// What a delta did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    /// `selection` is true when the update can change which policies select the item
    /// (labels for objects and clusters, anything for policies and transforms).
    Updated { selection: bool },
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: ItemKey,
    pub kind: ChangeKind,
}

pub type ChangeBatch = Arc<Vec<Change>>;

/// Frozen view of the index. Point lookups and ordered enumeration.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub epoch: u64,
    policies: BTreeMap<String, Arc<Policy>>,
    objects: BTreeMap<ObjectId, Arc<WorkloadObject>>,
    clusters: BTreeMap<String, Arc<Cluster>>,
    transforms: BTreeMap<String, Arc<CustomTransform>>,
}

impl Snapshot {
    /// Build a snapshot directly from items (offline tooling and tests).
    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Self {
        let mut b = IndexBuilder::new();
        b.apply(items.into_iter().map(Delta::applied).collect());
        (*b.freeze()).clone()
    }

    pub fn policy(&self, name: &str) -> Option<&Arc<Policy>> { self.policies.get(name) }
    pub fn object(&self, id: &ObjectId) -> Option<&Arc<WorkloadObject>> { self.objects.get(id) }
    pub fn cluster(&self, name: &str) -> Option<&Arc<Cluster>> { self.clusters.get(name) }

    pub fn policies(&self) -> impl Iterator<Item = &Arc<Policy>> + '_ { self.policies.values() }
    pub fn objects(&self) -> impl Iterator<Item = &Arc<WorkloadObject>> + '_ { self.objects.values() }
    pub fn clusters(&self) -> impl Iterator<Item = &Arc<Cluster>> + '_ { self.clusters.values() }
    pub fn transforms(&self) -> impl Iterator<Item = &Arc<CustomTransform>> + '_ { self.transforms.values() }

    pub fn policy_names(&self) -> impl Iterator<Item = &String> + '_ { self.policies.keys() }
    pub fn cluster_names(&self) -> impl Iterator<Item = &String> + '_ { self.clusters.keys() }

    pub fn transforms_for<'a>(&'a self, obj: &'a WorkloadObject) -> impl Iterator<Item = &'a CustomTransform> + 'a {
        self.transforms.values().map(|t| t.as_ref()).filter(move |t| t.applies_to(obj))
    }

    pub fn len(&self) -> (usize, usize, usize) { (self.policies.len(), self.objects.len(), self.clusters.len()) }
}

/// Builds snapshots from deltas and reports the resulting changes.
#[derive(Default)]
pub struct IndexBuilder {
    epoch: u64,
    policies: BTreeMap<String, Arc<Policy>>,
    objects: BTreeMap<ObjectId, Arc<WorkloadObject>>,
    clusters: BTreeMap<String, Arc<Cluster>>,
    transforms: BTreeMap<String, Arc<CustomTransform>>,
}

fn upsert<K: Ord + Clone, V>(
    map: &mut BTreeMap<K, Arc<V>>,
    key: K,
    value: V,
    same: impl Fn(&V, &V) -> bool,
    selection: impl Fn(&V, &V) -> bool,
) -> Option<ChangeKind> {
    match map.get(&key) {
        None => {
            map.insert(key, Arc::new(value));
            Some(ChangeKind::Added)
        }
        Some(old) if same(old, &value) => None,
        Some(old) => {
            let sel = selection(old, &value);
            map.insert(key, Arc::new(value));
            Some(ChangeKind::Updated { selection: sel })
        }
    }
}

fn same_object(a: &WorkloadObject, b: &WorkloadObject) -> bool {
    if !a.resource_version.is_empty() && a.resource_version == b.resource_version {
        return a.labels == b.labels;
    }
    a == b
}

impl IndexBuilder {
    pub fn new() -> Self { Self::default() }

    /// Apply a batch of deltas. Redelivered items equal to what is held produce no change.
    pub fn apply(&mut self, batch: Vec<Delta>) -> Vec<Change> {
        let mut changes = Vec::new();
        for d in batch {
            let key = d.key.clone();
            let kind = match (d.kind, d.item) {
                (DeltaKind::Applied, Some(Item::Policy(p))) => {
                    upsert(&mut self.policies, p.name.clone(), p, |a, b| a == b, |_, _| true)
                }
                (DeltaKind::Applied, Some(Item::Object(o))) => {
                    upsert(&mut self.objects, o.id.clone(), o, same_object, |a, b| a.labels != b.labels)
                }
                (DeltaKind::Applied, Some(Item::Cluster(c))) => {
                    upsert(&mut self.clusters, c.name.clone(), c, |a, b| a == b, |a, b| a.labels != b.labels)
                }
                (DeltaKind::Applied, Some(Item::Transform(t))) => {
                    upsert(&mut self.transforms, t.name.clone(), t, |a, b| a == b, |_, _| true)
                }
                (DeltaKind::Applied, None) => {
                    debug!(key = ?key, "applied delta without item; ignoring");
                    None
                }
                (DeltaKind::Deleted, _) => {
                    let existed = match &key {
                        ItemKey::Policy(n) => self.policies.remove(n).is_some(),
                        ItemKey::Object(id) => self.objects.remove(id).is_some(),
                        ItemKey::Cluster(n) => self.clusters.remove(n).is_some(),
                        ItemKey::Transform(n) => self.transforms.remove(n).is_some(),
                    };
                    existed.then_some(ChangeKind::Removed)
                }
            };
            if let Some(kind) = kind {
                changes.push(Change { key, kind });
            }
        }
        if !changes.is_empty() {
            self.epoch = self.epoch.saturating_add(1);
        }
        changes
    }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn freeze(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            epoch: self.epoch,
            policies: self.policies.clone(),
            objects: self.objects.clone(),
            clusters: self.clusters.clone(),
            transforms: self.transforms.clone(),
        })
    }
}

/// Handle for readers to access the current snapshot and subscribe to changes.
#[derive(Clone)]
pub struct IndexHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
    changes_tx: broadcast::Sender<ChangeBatch>,
}

impl IndexHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Change batches published after this call. A receiver that falls behind gets
    /// `Lagged` and must treat everything as changed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> { self.changes_tx.subscribe() }

    /// Wait until the published epoch reaches `min` or the timeout elapses.
    pub async fn wait_for_epoch(&self, min: u64, timeout: Duration) -> bool {
        let mut rx = self.epoch_rx.clone();
        let fut = async {
            while *rx.borrow_and_update() < min {
                if rx.changed().await.is_err() { return false; }
            }
            true
        };
        tokio::time::timeout(timeout, fut).await.unwrap_or(false)
    }
}

fn publish(
    builder: &mut IndexBuilder,
    batch: Vec<Delta>,
    snap: &ArcSwap<Snapshot>,
    epoch_tx: &watch::Sender<u64>,
    changes_tx: &broadcast::Sender<ChangeBatch>,
) {
    let n = batch.len();
    let changes = builder.apply(batch);
    metrics::counter!("index_deltas_total", n as u64);
    if changes.is_empty() {
        return;
    }
    let next = builder.freeze();
    let epoch = next.epoch;
    let (p, o, c) = next.len();
    metrics::gauge!("index_policies", p as f64);
    metrics::gauge!("index_objects", o as f64);
    metrics::gauge!("index_clusters", c as f64);
    snap.store(next);
    debug!(epoch, changes = changes.len(), "index snapshot published");
    // No subscribers is fine; they resync on attach.
    let _ = changes_tx.send(Arc::new(changes));
    let _ = epoch_tx.send(epoch);
}

/// Spawn the ingest loop consuming deltas and swapping snapshots.
/// Returns a sender for deltas and a handle for reads.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<Delta>, IndexHandle) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (changes_tx, _) = broadcast::channel::<ChangeBatch>(cap.max(16));
    let snap_clone = Arc::clone(&snap);
    let changes = changes_tx.clone();

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = IndexBuilder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => {
                            if coalescer.push(d) {
                                publish(&mut builder, coalescer.drain_ready(), &snap_clone, &epoch_tx, &changes);
                            }
                        }
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                publish(&mut builder, batch, &snap_clone, &epoch_tx, &changes);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !coalescer.is_empty() {
                        publish(&mut builder, coalescer.drain_ready(), &snap_clone, &epoch_tx, &changes);
                    }
                }
            }
        }
        info!("ingest loop stopped");
    });

    (tx, IndexHandle { snap, epoch_rx, changes_tx })
}
