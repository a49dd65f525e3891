//! Binding objects stored as cluster-scoped `control.relay.dev/v1alpha1` Bindings.

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use relay_core::{BindingSpec, RelayResult};
use relay_kubehub::{api_error, control_resource, is_not_found, BINDING_KIND, FIELD_MANAGER, MANAGED_BY_LABEL};

use crate::{BindingStore, StoredBinding};

pub struct KubeBindingStore {
    api: Api<DynamicObject>,
    ar: ApiResource,
}

impl KubeBindingStore {
    pub fn new(client: Client) -> Self {
        let ar = control_resource(BINDING_KIND, "bindings");
        Self { api: Api::all_with(client, &ar), ar }
    }

    fn to_object(&self, name: &str, spec: &BindingSpec, resource_version: Option<&str>) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &self.ar).data(serde_json::json!({ "spec": spec }));
        obj.metadata.resource_version = resource_version.map(str::to_string);
        obj.metadata.labels = Some([(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string())].into_iter().collect());
        obj
    }
}

fn from_object(obj: &DynamicObject) -> RelayResult<StoredBinding> {
    let spec = match obj.data.get("spec") {
        Some(v) => serde_json::from_value::<BindingSpec>(v.clone())?.normalized(),
        None => BindingSpec::default(),
    };
    Ok(StoredBinding { spec, resource_version: obj.metadata.resource_version.clone().unwrap_or_default() })
}

#[async_trait]
impl BindingStore for KubeBindingStore {
    async fn get(&self, name: &str) -> RelayResult<Option<StoredBinding>> {
        let found = self.api.get_opt(name).await.map_err(|e| api_error(name, e))?;
        found.as_ref().map(from_object).transpose()
    }

    async fn create(&self, name: &str, spec: &BindingSpec) -> RelayResult<StoredBinding> {
        let obj = self.to_object(name, spec, None);
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let created = self.api.create(&pp, &obj).await.map_err(|e| api_error(name, e))?;
        from_object(&created)
    }

    async fn update(&self, name: &str, spec: &BindingSpec, resource_version: &str) -> RelayResult<StoredBinding> {
        let obj = self.to_object(name, spec, Some(resource_version));
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let replaced = self.api.replace(name, &pp, &obj).await.map_err(|e| api_error(name, e))?;
        from_object(&replaced)
    }

    async fn delete(&self, name: &str) -> RelayResult<bool> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(name, e)),
        }
    }

    async fn list(&self) -> RelayResult<Vec<(String, StoredBinding)>> {
        let lp = ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, FIELD_MANAGER));
        let list = self.api.list(&lp).await.map_err(|e| api_error("list bindings", e))?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            let Some(name) = obj.metadata.name.clone() else { continue; };
            out.push((name, from_object(obj)?));
        }
        Ok(out)
    }
}
