//! Relay kubehub: kube clients, discovery and watch adapters.
//!
//! Watches turn `DynamicObject` events into index [`Delta`]s. Each watch keeps
//! the set of keys it has reported so a relist can emit deletions for objects
//! that vanished while the stream was disconnected.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use relay_core::{Cluster, CustomTransform, Delta, Item, ItemKey, ObjectId, Policy, RelayError, WorkloadObject};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const CONTROL_GROUP: &str = "control.relay.dev";
pub const CONTROL_VERSION: &str = "v1alpha1";
pub const POLICY_KIND: &str = "BindingPolicy";
pub const BINDING_KIND: &str = "Binding";
pub const TRANSFORM_KIND: &str = "CustomTransform";
pub const TRANSPORT_GROUP: &str = "transport.relay.dev";
pub const TRANSPORT_VERSION: &str = "v1alpha1";
pub const WRAPPED_KIND: &str = "WrappedWorkload";
pub const DEFAULT_CLUSTER_GVK: &str = "cluster.open-cluster-management.io/v1/ManagedCluster";
/// Label stamped on everything the engine writes.
pub const MANAGED_BY_LABEL: &str = "relay.dev/managed-by";
pub const FIELD_MANAGER: &str = "relay";

pub fn control_gvk_key(kind: &str) -> String { format!("{}/{}/{}", CONTROL_GROUP, CONTROL_VERSION, kind) }

pub fn control_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(CONTROL_GROUP, CONTROL_VERSION, kind), plural)
}

pub fn transport_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(TRANSPORT_GROUP, TRANSPORT_VERSION, WRAPPED_KIND),
        "wrappedworkloads",
    )
}

/// Build a client for a kubeconfig context, or the inferred default.
pub async fn client_for(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(ctx) => kube::Config::from_kubeconfig(&kube::config::KubeConfigOptions {
            context: Some(ctx.to_string()),
            ..Default::default()
        })
        .await
        .with_context(|| format!("loading kubeconfig context {}", ctx))?,
        None => kube::Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Group/kind → preferred served resource, discovered once and cached.
pub struct ApiCatalog {
    client: Client,
    cache: Mutex<FxHashMap<(String, String), (ApiResource, bool)>>,
}

impl ApiCatalog {
    pub fn new(client: Client) -> Self { Self { client, cache: Mutex::new(FxHashMap::default()) } }

    pub fn client(&self) -> Client { self.client.clone() }

    pub async fn resolve(&self, group: &str, kind: &str) -> Result<(ApiResource, bool)> {
        let key = (group.to_string(), kind.to_string());
        if let Some(hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned() {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut found = None;
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        for g in discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                let entry = (ar.clone(), matches!(caps.scope, Scope::Namespaced));
                if ar.group == group && ar.kind == kind {
                    found = Some(entry.clone());
                }
                cache.insert((ar.group.clone(), ar.kind.clone()), entry);
            }
        }
        found.ok_or_else(|| anyhow!("no served resource for group {:?} kind {}", group, kind))
    }

    /// Api handle for one object's collection (namespaced when the kind is).
    pub async fn api_for(&self, id: &ObjectId) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(&id.group, &id.kind).await?;
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), &id.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

/// Map a client error onto the engine taxonomy. 409 and 404 keep their meaning;
/// validation rejections are malformed; everything else is infrastructure trouble.
pub fn api_error(what: &str, e: kube::Error) -> RelayError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => RelayError::Conflict(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => RelayError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
            RelayError::Malformed(format!("{}: {}", what, ae.message))
        }
        other => RelayError::Transient(format!("{}: {}", what, other)),
    }
}

pub fn is_not_found(e: &kube::Error) -> bool { matches!(e, kube::Error::Api(ae) if ae.code == 404) }

pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Which index collection a watch feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Policy,
    Workload,
    Cluster,
    Transform,
}

#[derive(Debug, Clone)]
pub struct WatchSource {
    pub gvk_key: String,
    pub role: Role,
    pub namespace: Option<String>,
}

impl WatchSource {
    pub fn new(gvk_key: impl Into<String>, role: Role) -> Self { Self { gvk_key: gvk_key.into(), role, namespace: None } }
}

fn to_json(obj: &DynamicObject, ar: &ApiResource) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    // Watch events may omit type meta; fill it from the resource.
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| serde_json::Value::String(ar.api_version.clone()));
        map.entry("kind").or_insert_with(|| serde_json::Value::String(ar.kind.clone()));
    }
    Ok(raw)
}

pub fn item_from(role: Role, obj: &DynamicObject, ar: &ApiResource) -> Result<Item> {
    let raw = to_json(obj, ar)?;
    let item = match role {
        Role::Policy => Item::Policy(Policy::from_json(&raw)?),
        Role::Workload => Item::Object(WorkloadObject::from_json(raw)?.with_resource(ar.plural.clone())),
        Role::Cluster => Item::Cluster(Cluster::from_json(&raw)?),
        Role::Transform => Item::Transform(CustomTransform::from_json(&raw)?),
    };
    Ok(item)
}

pub fn key_from(role: Role, obj: &DynamicObject, ar: &ApiResource) -> Result<ItemKey> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok(match role {
        Role::Policy => ItemKey::Policy(name),
        Role::Cluster => ItemKey::Cluster(name),
        Role::Transform => ItemKey::Transform(name),
        Role::Workload => ItemKey::Object(ObjectId {
            group: ar.group.clone(),
            kind: ar.kind.clone(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name,
        }),
    })
}

/// Tracks reported keys so relists can emit deletions.
#[derive(Default)]
pub struct SeenKeys {
    keys: FxHashSet<ItemKey>,
}

impl SeenKeys {
    pub fn applied(&mut self, key: ItemKey) { self.keys.insert(key); }

    pub fn deleted(&mut self, key: &ItemKey) { self.keys.remove(key); }

    /// Replace the known set, returning keys that disappeared.
    pub fn relisted(&mut self, now: FxHashSet<ItemKey>) -> Vec<ItemKey> {
        let mut gone: Vec<ItemKey> = self.keys.difference(&now).cloned().collect();
        gone.sort();
        self.keys = now;
        gone
    }
}

/// Start list+watch for a source and send deltas into the provided channel.
/// Watch errors are retried with the runtime's default backoff; bad items are skipped.
pub async fn start_watcher(client: Client, source: WatchSource, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let gvk = parse_gvk_key(&source.gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = match (namespaced, source.namespace.as_deref()) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
        _ => Api::all_with(client.clone(), &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(gvk = %source.gvk_key, role = ?source.role, ns = ?source.namespace, "watcher started");
    let mut seen = SeenKeys::default();
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                metrics::counter!("watch_errors_total", 1u64, "gvk" => source.gvk_key.clone());
                warn!(gvk = %source.gvk_key, error = %e, "watch error; backing off");
                continue;
            }
        };
        match ev {
            Event::Applied(o) => match item_from(source.role, &o, &ar) {
                Ok(item) => {
                    seen.applied(item.key());
                    if delta_tx.send(Delta::applied(item)).await.is_err() { break; }
                }
                Err(e) => skip(&source, &o, e),
            },
            Event::Deleted(o) => match key_from(source.role, &o, &ar) {
                Ok(key) => {
                    seen.deleted(&key);
                    if delta_tx.send(Delta::deleted(key)).await.is_err() { break; }
                }
                Err(e) => skip(&source, &o, e),
            },
            Event::Restarted(list) => {
                debug!(gvk = %source.gvk_key, count = list.len(), "watch restart");
                let mut now = FxHashSet::default();
                let mut items = Vec::with_capacity(list.len());
                for o in list.iter() {
                    match item_from(source.role, o, &ar) {
                        Ok(item) => {
                            now.insert(item.key());
                            items.push(item);
                        }
                        Err(e) => skip(&source, o, e),
                    }
                }
                for key in seen.relisted(now) {
                    if delta_tx.send(Delta::deleted(key)).await.is_err() { return Ok(()); }
                }
                for item in items {
                    if delta_tx.send(Delta::applied(item)).await.is_err() { return Ok(()); }
                }
            }
        }
    }
    warn!(gvk = %source.gvk_key, "watcher stream ended");
    Ok(())
}

fn skip(source: &WatchSource, o: &DynamicObject, e: anyhow::Error) {
    metrics::counter!("watch_skipped_total", 1u64, "gvk" => source.gvk_key.clone());
    warn!(gvk = %source.gvk_key, name = ?o.metadata.name, error = %e, "skipping unreadable object");
}
