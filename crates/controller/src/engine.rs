//! The reconcile engine: dispatch index changes to keys and run workers.
//!
//! Three kinds of work exist. A policy key re-resolves one policy and writes its
//! binding. A destination key rebuilds and delivers one cluster's shards from the
//! merged placement. A singleton key brings one object's status in line with its
//! lone destination. Each handler reads current state and converges; replaying a
//! key is always safe.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use relay_bind::{reconcile, retract, BindingStore};
use relay_core::{BindingSpec, Condition, ConditionTarget, ObjectId, RelayError, RelayResult};
use relay_resolve::{affects, resolve, Affects, Placement};
use relay_status::{
    reduce, sync_singleton as converge_status, SingletonState, StatusAction, StatusWriter, READY_CONDITION,
    WRAPPED_CONDITION,
};
use relay_store::{IndexHandle, Snapshot};
use relay_wrap::{prepare, shard, Transport};
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::queue::WorkQueue;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkKey {
    Policy(String),
    Destination(String),
    Singleton(ObjectId),
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::Policy(n) => write!(f, "policy/{}", n),
            WorkKey::Destination(c) => write!(f, "destination/{}", c),
            WorkKey::Singleton(id) => write!(f, "singleton/{}", id),
        }
    }
}

/// External collaborators the engine writes through.
#[derive(Clone)]
pub struct Sinks {
    pub bindings: Arc<dyn BindingStore>,
    pub transport: Arc<dyn Transport>,
    pub status: Arc<dyn StatusWriter>,
}

/// Per-policy outputs the placement is merged from.
#[derive(Default)]
struct Held {
    bindings: BTreeMap<String, BindingSpec>,
    /// Objects each policy wants singleton status for, whether or not it has destinations.
    wanted: BTreeMap<String, BTreeSet<ObjectId>>,
}

impl Held {
    fn placement(&self) -> Placement {
        Placement::merge(self.bindings.iter().map(|(k, v)| (k.as_str(), v))).with_wanted(self.wanted.values().flatten())
    }
}

#[derive(Default)]
struct Memory {
    /// Targets the engine has put a failing condition on.
    conditions: FxHashSet<(ConditionTarget, &'static str)>,
    /// Objects whose current status the engine wrote.
    mirrored: FxHashSet<ObjectId>,
    /// Last status each cluster reported, per object.
    reported: BTreeMap<String, BTreeMap<ObjectId, Json>>,
    /// Objects rejected as too large, per cluster.
    too_large: BTreeMap<String, BTreeSet<ObjectId>>,
}

pub struct Engine {
    cfg: EngineConfig,
    index: IndexHandle,
    sinks: Sinks,
    queue: WorkQueue<WorkKey>,
    /// Bindings as last written, per policy. Source of the merged placement.
    bindings: RwLock<Held>,
    placement: ArcSwap<Placement>,
    memory: Mutex<Memory>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, index: IndexHandle, sinks: Sinks) -> Arc<Self> {
        let backoff = Backoff::new(Duration::from_millis(cfg.backoff_base_ms), Duration::from_secs(cfg.backoff_max_secs));
        let queue = WorkQueue::new(cfg.queue_cap, backoff);
        Arc::new(Self {
            cfg,
            index,
            sinks,
            queue,
            bindings: RwLock::new(Held::default()),
            placement: ArcSwap::from_pointee(Placement::default()),
            memory: Mutex::new(Memory::default()),
        })
    }

    pub fn queue(&self) -> &WorkQueue<WorkKey> { &self.queue }

    pub fn placement(&self) -> Arc<Placement> { self.placement.load_full() }

    /// Bindings as the engine last wrote them.
    pub fn bindings(&self) -> BTreeMap<String, BindingSpec> { self.read_held().bindings.clone() }

    fn read_held(&self) -> std::sync::RwLockReadGuard<'_, Held> { self.bindings.read().unwrap_or_else(|e| e.into_inner()) }

    fn known_policies(&self) -> Vec<String> {
        let held = self.read_held();
        held.bindings.keys().chain(held.wanted.keys()).cloned().collect()
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, Memory> { self.memory.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Replace one policy's binding and wanted set; returns the previous pair.
    fn set_binding(
        &self,
        policy: &str,
        spec: Option<BindingSpec>,
        wanted: BTreeSet<ObjectId>,
    ) -> (BindingSpec, BTreeSet<ObjectId>) {
        let mut held = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        let before = match spec {
            Some(s) => held.bindings.insert(policy.to_string(), s),
            None => held.bindings.remove(policy),
        };
        let before_wanted = if wanted.is_empty() {
            held.wanted.remove(policy)
        } else {
            held.wanted.insert(policy.to_string(), wanted)
        };
        self.placement.store(Arc::new(held.placement()));
        (before.unwrap_or_default(), before_wanted.unwrap_or_default())
    }

    /// Load stored bindings and queue everything once. Bindings whose policy is
    /// gone are retracted by their policy key.
    pub async fn seed(&self) -> RelayResult<()> {
        let stored = self.sinks.bindings.list().await?;
        let n = stored.len();
        {
            let mut held = self.bindings.write().unwrap_or_else(|e| e.into_inner());
            for (name, b) in stored {
                held.bindings.insert(name, b.spec);
            }
            self.placement.store(Arc::new(held.placement()));
        }
        info!(bindings = n, "seeded from stored bindings");
        self.enqueue_all();
        Ok(())
    }

    /// Queue every policy, destination and singleton the engine knows of.
    pub fn enqueue_all(&self) {
        let snap = self.index.current();
        let placement = self.placement();
        let known: BTreeSet<String> = self.known_policies().into_iter().collect();
        for name in snap.policy_names().chain(known.iter()) {
            self.queue.add(WorkKey::Policy(name.clone()));
        }
        for cluster in snap.cluster_names().chain(placement.clusters()) {
            self.queue.add(WorkKey::Destination(cluster.clone()));
        }
        let mirrored: Vec<ObjectId> = self.memory().mirrored.iter().cloned().collect();
        for id in placement.singleton_objects().cloned().chain(mirrored) {
            self.queue.add(WorkKey::Singleton(id));
        }
    }

    /// Translate one batch of index changes into work.
    pub fn dispatch(&self, changes: &[relay_store::Change]) {
        let mut all_policies = false;
        let mut all_bundles = false;
        for change in changes {
            match affects(change) {
                Affects::Policy(name) => {
                    self.queue.add(WorkKey::Policy(name));
                }
                Affects::AllPolicies => all_policies = true,
                Affects::AllBundles => all_bundles = true,
                Affects::Bundles(id) => {
                    let placement = self.placement();
                    if let Some(p) = placement.object(&id) {
                        for c in &p.clusters {
                            self.queue.add(WorkKey::Destination(c.clone()));
                        }
                    }
                }
            }
        }
        if all_policies {
            let snap = self.index.current();
            let known = self.known_policies();
            for name in snap.policy_names().cloned().chain(known) {
                self.queue.add(WorkKey::Policy(name));
            }
        }
        if all_bundles {
            for c in self.placement().clusters() {
                self.queue.add(WorkKey::Destination(c.clone()));
            }
        }
    }

    /// Run one key. Errors are classified by the caller.
    pub async fn sync(&self, key: &WorkKey) -> RelayResult<()> {
        match key {
            WorkKey::Policy(name) => self.sync_policy(name).await,
            WorkKey::Destination(cluster) => self.sync_destination(cluster).await,
            WorkKey::Singleton(id) => self.sync_singleton(id).await,
        }
    }

    async fn sync_policy(&self, name: &str) -> RelayResult<()> {
        let snap = self.index.current();
        let Some(policy) = snap.policy(name).cloned() else {
            let held = retract(self.sinks.bindings.as_ref(), name).await?;
            let (before, before_wanted) = self.set_binding(name, None, BTreeSet::new());
            self.forget_condition(&ConditionTarget::Policy(name.to_string()), READY_CONDITION);
            let gone = held.unwrap_or_default();
            self.fan_out(&before, &BindingSpec::default());
            self.fan_out(&gone, &BindingSpec::default());
            for o in before_wanted {
                self.queue.add(WorkKey::Singleton(o));
            }
            debug!(policy = %name, "policy gone; binding retracted");
            return Ok(());
        };
        let resolution = match resolve(&policy, &snap) {
            Ok(r) => r,
            Err(RelayError::Malformed(msg)) => {
                // Keep the previous binding; nothing changes until the policy does.
                warn!(policy = %name, error = %msg, "policy rejected");
                let cond = Condition::failing(READY_CONDITION, "InvalidSelector", msg).with_generation(policy.generation);
                self.report_condition(ConditionTarget::Policy(name.to_string()), READY_CONDITION, Some(cond)).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let desired = resolution.binding();
        let outcome = reconcile(self.sinks.bindings.as_ref(), name, &desired, self.cfg.conflict_attempts).await?;
        let wanted = resolution.wanted();
        let (before, before_wanted) = self.set_binding(name, Some(desired.clone()), wanted.clone());
        self.fan_out(&before, &desired);
        for o in before_wanted.symmetric_difference(&wanted) {
            self.queue.add(WorkKey::Singleton(o.clone()));
        }
        for (o, c) in outcome.diff.added.iter().chain(outcome.diff.removed.iter()) {
            self.queue.add(WorkKey::Destination(c.clone()));
            self.queue.add(WorkKey::Singleton(o.clone()));
        }
        self.report_condition(ConditionTarget::Policy(name.to_string()), READY_CONDITION, None).await?;
        if outcome.written {
            info!(
                policy = %name,
                objects = resolution.objects.len(),
                clusters = resolution.clusters.len(),
                added = outcome.diff.added.len(),
                removed = outcome.diff.removed.len(),
                "binding updated"
            );
        }
        Ok(())
    }

    /// Queue the destinations and singletons whose inputs differ between two bindings.
    fn fan_out(&self, before: &BindingSpec, after: &BindingSpec) {
        let d = relay_bind::diff(before, after);
        for c in d.touched_clusters() {
            self.queue.add(WorkKey::Destination(c));
        }
        for o in d.touched_objects() {
            self.queue.add(WorkKey::Singleton(o));
        }
        if d.singleton_changed {
            for o in before.objects().chain(after.objects()) {
                self.queue.add(WorkKey::Singleton(o.clone()));
            }
        }
    }

    async fn sync_destination(&self, cluster: &str) -> RelayResult<()> {
        let snap = self.index.current();
        let placement = self.placement();
        let objects = bundle_inputs(&snap, placement.objects_for(cluster));
        let plan = shard(cluster, objects, self.cfg.max_wrapped_bytes)?;

        let rejected: BTreeSet<ObjectId> = plan.rejected.iter().map(|r| r.id.clone()).collect();
        let previously = self.memory().too_large.insert(cluster.to_string(), rejected.clone()).unwrap_or_default();
        for r in &plan.rejected {
            let msg = format!(
                "object needs {} bytes in a bundle for cluster {}; the limit is {}",
                r.size, cluster, self.cfg.max_wrapped_bytes
            );
            let cond = Condition::failing(WRAPPED_CONDITION, "ObjectTooLarge", msg);
            self.report_condition(ConditionTarget::Object(r.id.clone()), WRAPPED_CONDITION, Some(cond)).await?;
        }
        for id in previously.difference(&rejected) {
            if !self.too_large_anywhere(id) {
                self.report_condition(ConditionTarget::Object(id.clone()), WRAPPED_CONDITION, None).await?;
            }
        }

        let delivered = self.sinks.transport.delivered(cluster).await?;
        let wanted = plan.digests();
        let mut sent = 0usize;
        for s in &plan.shards {
            if delivered.get(&s.index) != wanted.get(&s.index) {
                self.sinks.transport.deliver(cluster, s).await?;
                sent += 1;
            }
        }
        let mut dropped = 0usize;
        for index in delivered.keys().filter(|i| !wanted.contains_key(i)) {
            self.sinks.transport.retract(cluster, *index).await?;
            dropped += 1;
        }
        if sent > 0 || dropped > 0 {
            info!(cluster, shards = plan.shards.len(), sent, dropped, rejected = plan.rejected.len(), "destination synced");
        }
        Ok(())
    }

    fn too_large_anywhere(&self, id: &ObjectId) -> bool { self.memory().too_large.values().any(|s| s.contains(id)) }

    async fn sync_singleton(&self, id: &ObjectId) -> RelayResult<()> {
        let snap = self.index.current();
        if snap.object(id).is_none() {
            self.memory().mirrored.remove(id);
            return Ok(());
        }
        let placement = self.placement();
        let state = reduce(placement.wants_singleton(id), &placement.destinations(id));
        let (reported, previously) = {
            let mem = self.memory();
            let reported = match &state {
                SingletonState::Mirroring { cluster } => mem.reported.get(cluster).and_then(|m| m.get(id)).cloned(),
                _ => None,
            };
            (reported, mem.mirrored.contains(id))
        };
        let action = converge_status(self.sinks.status.as_ref(), id, &state, reported.as_ref(), previously).await?;
        let mut mem = self.memory();
        match action {
            StatusAction::Write(_) => {
                mem.mirrored.insert(id.clone());
            }
            StatusAction::Clear => {
                mem.mirrored.remove(id);
            }
            StatusAction::Keep => {}
        }
        Ok(())
    }

    /// Poll every cluster that mirrors some object; queue objects whose report changed.
    pub async fn poll_status(&self) -> RelayResult<usize> {
        let placement = self.placement();
        let mut by_cluster: BTreeMap<String, BTreeSet<ObjectId>> = BTreeMap::new();
        for (id, p) in placement.objects() {
            if let SingletonState::Mirroring { cluster } = reduce(p.want_singleton, &p.clusters) {
                by_cluster.entry(cluster).or_default().insert(id.clone());
            }
        }
        let mut changed = 0;
        for (cluster, ids) in by_cluster {
            let fresh = match tokio::time::timeout(self.cfg.op_timeout(), self.sinks.transport.collect_status(&cluster)).await {
                Ok(r) => r?,
                Err(_) => return Err(RelayError::Transient(format!("collect_status {}: timed out", cluster))),
            };
            let fresh: BTreeMap<ObjectId, Json> = fresh.into_iter().filter(|(id, _)| ids.contains(id)).collect();
            let old = self.memory().reported.insert(cluster.clone(), fresh.clone()).unwrap_or_default();
            for id in &ids {
                if old.get(id) != fresh.get(id) {
                    self.queue.add(WorkKey::Singleton(id.clone()));
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn report_condition(&self, target: ConditionTarget, type_: &'static str, cond: Option<Condition>) -> RelayResult<()> {
        let key = (target, type_);
        let had = self.memory().conditions.contains(&key);
        if cond.is_none() && !had {
            return Ok(());
        }
        self.sinks.status.set_condition(&key.0, type_, cond.as_ref()).await?;
        let mut mem = self.memory();
        if cond.is_some() {
            mem.conditions.insert(key);
        } else {
            mem.conditions.remove(&key);
        }
        Ok(())
    }

    fn forget_condition(&self, target: &ConditionTarget, type_: &'static str) {
        self.memory().conditions.remove(&(target.clone(), type_));
    }

    /// Process one key with timeout and retry classification.
    async fn work(&self, key: WorkKey) {
        let res = match tokio::time::timeout(self.cfg.op_timeout(), self.sync(&key)).await {
            Ok(r) => r,
            Err(_) => Err(RelayError::Transient(format!("{}: timed out after {:?}", key, self.cfg.op_timeout()))),
        };
        match res {
            Ok(()) => self.queue.forget(&key),
            Err(e) if e.is_retryable() => {
                let delay = self.queue.retry(key.clone());
                metrics::counter!("sync_errors_total", 1u64, "kind" => e.kind());
                warn!(key = %key, error = %e, ?delay, "sync failed; will retry");
            }
            Err(e) => {
                // Malformed or gone: wait for the input to change.
                self.queue.forget(&key);
                metrics::counter!("sync_errors_total", 1u64, "kind" => e.kind());
                warn!(key = %key, error = %e, "sync failed; not retrying");
            }
        }
        self.queue.done(&key);
    }

    /// Start workers and background loops. They stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker in 0..self.cfg.workers.max(1) {
            let me = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                loop {
                    match me.queue.next().await {
                        Some(key) => me.work(key).await,
                        None => break,
                    }
                }
                debug!(worker, "worker stopped");
            }));
        }

        let me = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut rx = me.index.subscribe();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    batch = rx.recv() => match batch {
                        Ok(changes) => me.dispatch(&changes),
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "change feed lagged; resyncing everything");
                            me.enqueue_all();
                        }
                        Err(RecvError::Closed) => {
                            error!("change feed closed");
                            break;
                        }
                    }
                }
            }
        }));

        let me = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(me.cfg.resync_interval());
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        debug!("periodic resync");
                        me.enqueue_all();
                    }
                }
            }
        }));

        let me = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(me.cfg.status_poll_interval());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = me.poll_status().await {
                            warn!(error = %e, "status poll failed");
                        }
                    }
                }
            }
        }));

        let me = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            cancel.cancelled().await;
            me.queue.shutdown();
            info!("engine stopping");
        }));
        handles
    }

    /// Seed, start, and run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> RelayResult<()> {
        self.seed().await?;
        let handles = self.start(cancel);
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "engine task panicked");
            }
        }
        Ok(())
    }
}

/// Cleaned, transformed bodies for the objects bound to one cluster.
fn bundle_inputs<'a>(snap: &Snapshot, ids: impl Iterator<Item = &'a ObjectId>) -> Vec<(ObjectId, Json)> {
    ids.filter_map(|id| snap.object(id).map(|obj| (id.clone(), prepare(obj, snap.transforms_for(obj)))))
        .collect()
}
