//! Relay wrap: build per-cluster bundles of cleaned objects, bounded in size.
//!
//! A bundle body is compact JSON `{"cluster":..,"shard":..,"objects":[..]}`.
//! Sizes are accounted exactly: envelope bytes for the shard index plus each
//! object's serialized length plus the separating commas.

#![forbid(unsafe_code)]

pub mod clean;
pub mod transport;

use std::collections::BTreeMap;

use relay_core::{CustomTransform, ObjectId, RelayError, RelayResult, WorkloadObject};
use serde::Serialize;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub use clean::{apply_transforms, clean_object};
pub use transport::{KubeTransport, MemoryTransport, Transport};

/// Clean and transform one object into the body that gets wrapped.
pub fn prepare<'a>(obj: &WorkloadObject, transforms: impl IntoIterator<Item = &'a CustomTransform>) -> Json {
    let mut body = clean_object(&obj.payload);
    apply_transforms(&mut body, transforms);
    body
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub objects: Vec<ObjectId>,
    /// Serialized bundle; `body.len()` never exceeds the plan's limit.
    pub body: Vec<u8>,
}

impl Shard {
    pub fn digest(&self) -> String { hex::encode(Sha256::digest(&self.body)) }

    /// Object bodies carried by this shard, in order.
    pub fn object_bodies(&self) -> RelayResult<Vec<Json>> {
        let env: Json = serde_json::from_slice(&self.body)?;
        match env.get("objects") {
            Some(Json::Array(items)) => Ok(items.clone()),
            _ => Err(RelayError::Internal(format!("shard {} body has no objects array", self.index))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub id: ObjectId,
    /// Bytes the object alone would need in a fresh shard.
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardPlan {
    pub cluster: String,
    pub max_bytes: usize,
    pub shards: Vec<Shard>,
    pub rejected: Vec<Rejected>,
}

impl ShardPlan {
    /// Shard index → sha256 of its body.
    pub fn digests(&self) -> BTreeMap<u32, String> { self.shards.iter().map(|s| (s.index, s.digest())).collect() }

    pub fn total_bytes(&self) -> usize { self.shards.iter().map(|s| s.body.len()).sum() }

    pub fn shard_of(&self, id: &ObjectId) -> Option<u32> {
        self.shards.iter().find(|s| s.objects.contains(id)).map(|s| s.index)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    cluster: &'a str,
    shard: u32,
    objects: [(); 0],
}

/// Envelope bytes with the closing `]}` split off.
fn envelope_head(cluster: &str, index: u32) -> RelayResult<Vec<u8>> {
    let mut head = serde_json::to_vec(&Envelope { cluster, shard: index, objects: [] })?;
    head.truncate(head.len().saturating_sub(2));
    Ok(head)
}

const ENVELOPE_TAIL: &[u8] = b"]}";

struct Open {
    index: u32,
    head: Vec<u8>,
    ids: Vec<ObjectId>,
    items: Vec<Vec<u8>>,
    size: usize,
}

impl Open {
    fn new(cluster: &str, index: u32) -> RelayResult<Self> {
        let head = envelope_head(cluster, index)?;
        let size = head.len() + ENVELOPE_TAIL.len();
        Ok(Self { index, head, ids: Vec::new(), items: Vec::new(), size })
    }

    fn cost(&self, len: usize) -> usize { self.size + len + usize::from(!self.items.is_empty()) }

    fn push(&mut self, id: ObjectId, bytes: Vec<u8>) {
        self.size = self.cost(bytes.len());
        self.ids.push(id);
        self.items.push(bytes);
    }

    fn close(self) -> Shard {
        let mut body = Vec::with_capacity(self.size);
        body.extend_from_slice(&self.head);
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(item);
        }
        body.extend_from_slice(ENVELOPE_TAIL);
        debug_assert_eq!(body.len(), self.size);
        Shard { index: self.index, objects: self.ids, body }
    }
}

/// Pack `objects` for one cluster into shards of at most `max_bytes`.
///
/// Objects are taken in `ObjectId` order and packed greedily, so identical
/// input always yields identical shards. An object too large even for an
/// empty shard is reported in `rejected` and left out.
pub fn shard(cluster: &str, objects: impl IntoIterator<Item = (ObjectId, Json)>, max_bytes: usize) -> RelayResult<ShardPlan> {
    let mut objects: Vec<(ObjectId, Json)> = objects.into_iter().collect();
    objects.sort_by(|a, b| a.0.cmp(&b.0));
    objects.dedup_by(|a, b| a.0 == b.0);

    let mut plan = ShardPlan { cluster: cluster.to_string(), max_bytes, ..Default::default() };
    let mut open = Open::new(cluster, 0)?;
    for (id, body) in objects {
        let bytes = serde_json::to_vec(&body)?;
        if open.cost(bytes.len()) <= max_bytes {
            open.push(id, bytes);
            continue;
        }
        let fresh = if open.items.is_empty() { Open::new(cluster, open.index)? } else { Open::new(cluster, open.index + 1)? };
        let needed = fresh.cost(bytes.len());
        if needed > max_bytes {
            warn!(cluster, object = %id, size = needed, max_bytes, "object too large to wrap");
            metrics::counter!("objects_rejected_total", 1u64);
            plan.rejected.push(Rejected { id, size: needed });
            continue;
        }
        let full = std::mem::replace(&mut open, fresh);
        if !full.items.is_empty() {
            plan.shards.push(full.close());
        }
        open.push(id, bytes);
    }
    if !open.items.is_empty() {
        plan.shards.push(open.close());
    }

    metrics::gauge!("shard_count", plan.shards.len() as f64, "cluster" => cluster.to_string());
    for s in &plan.shards {
        metrics::histogram!("wrapped_bytes", s.body.len() as f64);
    }
    debug!(cluster, shards = plan.shards.len(), rejected = plan.rejected.len(), bytes = plan.total_bytes(), "sharded");
    Ok(plan)
}
