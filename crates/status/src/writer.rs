//! Where mirrored status and conditions get written.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
};
use relay_core::{Condition, ConditionTarget, ObjectId, RelayResult};
use relay_kubehub::{api_error, control_resource, is_not_found, ApiCatalog, POLICY_KIND};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::{merge_patch, upsert_condition};

#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn current_status(&self, id: &ObjectId) -> RelayResult<Option<Json>>;
    /// `None` removes the status entirely.
    async fn write_status(&self, id: &ObjectId, status: Option<&Json>) -> RelayResult<()>;
    /// Set (or with `None`, remove) the condition of type `type_` on a policy or object.
    async fn set_condition(&self, target: &ConditionTarget, type_: &str, condition: Option<&Condition>) -> RelayResult<()>;
}

/// Object conditions live inside `status.conditions`, as on a real object;
/// policy conditions are kept on their own.
#[derive(Default)]
struct Written {
    status: BTreeMap<ObjectId, Json>,
    policy_conditions: BTreeMap<String, Vec<Json>>,
    writes: u64,
}

fn object_conditions(status: Option<&Json>) -> Vec<Json> {
    match status.and_then(|s| s.get("conditions")) {
        Some(Json::Array(list)) => list.clone(),
        _ => Vec::new(),
    }
}

#[derive(Default)]
pub struct MemoryStatusWriter {
    inner: Mutex<Written>,
}

impl MemoryStatusWriter {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Written> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn status_of(&self, id: &ObjectId) -> Option<Json> { self.lock().status.get(id).cloned() }

    /// Pretend someone else already wrote a status.
    pub fn seed_status(&self, id: &ObjectId, status: Json) { self.lock().status.insert(id.clone(), status); }

    pub fn conditions_of(&self, target: &ConditionTarget) -> Vec<Json> {
        let w = self.lock();
        match target {
            ConditionTarget::Policy(name) => w.policy_conditions.get(name).cloned().unwrap_or_default(),
            ConditionTarget::Object(id) => object_conditions(w.status.get(id)),
        }
    }

    pub fn writes(&self) -> u64 { self.lock().writes }
}

#[async_trait]
impl StatusWriter for MemoryStatusWriter {
    async fn current_status(&self, id: &ObjectId) -> RelayResult<Option<Json>> { Ok(self.status_of(id)) }

    async fn write_status(&self, id: &ObjectId, status: Option<&Json>) -> RelayResult<()> {
        let mut w = self.lock();
        match status {
            Some(v) => w.status.insert(id.clone(), v.clone()),
            None => w.status.remove(id),
        };
        w.writes += 1;
        Ok(())
    }

    async fn set_condition(&self, target: &ConditionTarget, type_: &str, condition: Option<&Condition>) -> RelayResult<()> {
        let mut w = self.lock();
        match target {
            ConditionTarget::Policy(name) => {
                let list = w.policy_conditions.entry(name.clone()).or_default();
                if !upsert_condition(list, type_, condition)? {
                    return Ok(());
                }
            }
            ConditionTarget::Object(id) => {
                let mut list = object_conditions(w.status.get(id));
                if !upsert_condition(&mut list, type_, condition)? {
                    return Ok(());
                }
                let mut map = match w.status.remove(id) {
                    Some(Json::Object(m)) => m,
                    _ => serde_json::Map::new(),
                };
                if list.is_empty() {
                    map.remove("conditions");
                } else {
                    map.insert("conditions".into(), Json::Array(list));
                }
                if !map.is_empty() {
                    w.status.insert(id.clone(), Json::Object(map));
                }
            }
        }
        w.writes += 1;
        Ok(())
    }
}

/// Merge-patches the `status` subresource. Objects that are gone are skipped.
pub struct KubeStatusWriter {
    catalog: ApiCatalog,
}

impl KubeStatusWriter {
    pub fn new(catalog: ApiCatalog) -> Self { Self { catalog } }

    async fn api_for_target(&self, target: &ConditionTarget) -> RelayResult<(Api<DynamicObject>, String)> {
        match target {
            ConditionTarget::Policy(name) => {
                let ar = control_resource(POLICY_KIND, "bindingpolicies");
                Ok((Api::all_with(self.catalog.client(), &ar), name.clone()))
            }
            ConditionTarget::Object(id) => Ok((self.catalog.api_for(id).await?, id.name.clone())),
        }
    }

    async fn patch_status(&self, api: &Api<DynamicObject>, name: &str, patch: &Json) -> RelayResult<()> {
        match api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(name, "status target gone; skipping");
                Ok(())
            }
            Err(e) => Err(api_error(name, e)),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn current_status(&self, id: &ObjectId) -> RelayResult<Option<Json>> {
        let api = self.catalog.api_for(id).await?;
        let obj = api.get_opt(&id.name).await.map_err(|e| api_error(&id.to_string(), e))?;
        Ok(obj.and_then(|o| o.data.get("status").cloned()).filter(|s| !s.is_null()))
    }

    async fn write_status(&self, id: &ObjectId, status: Option<&Json>) -> RelayResult<()> {
        let api = self.catalog.api_for(id).await?;
        let patch = match status {
            Some(want) => {
                let current = self.current_status(id).await?.unwrap_or(Json::Null);
                json!({ "status": merge_patch(&current, want) })
            }
            None => json!({ "status": null }),
        };
        self.patch_status(&api, &id.name, &patch).await
    }

    async fn set_condition(&self, target: &ConditionTarget, type_: &str, condition: Option<&Condition>) -> RelayResult<()> {
        let (api, name) = self.api_for_target(target).await?;
        let Some(obj) = api.get_opt(&name).await.map_err(|e| api_error(&name, e))? else { return Ok(()) };
        let mut list = match obj.data.pointer("/status/conditions") {
            Some(Json::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        if !upsert_condition(&mut list, type_, condition)? {
            return Ok(());
        }
        self.patch_status(&api, &name, &json!({ "status": { "conditions": list } })).await
    }
}
