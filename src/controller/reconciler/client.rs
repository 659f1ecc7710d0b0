//! Access to the reconciled objects themselves.

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use serde_json::{Value, json};

/// Reads and writes on the primary resource
#[async_trait]
pub trait ResourceClient: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` when the object no longer exists
    async fn get(&self, namespace: Option<&str>, name: &str)
        -> Result<Option<DynamicObject>, kube::Error>;

    /// Replace `status.conditions`, leaving other status fields untouched
    async fn patch_conditions(
        &self,
        namespace: Option<&str>,
        name: &str,
        conditions: Value,
    ) -> Result<(), kube::Error>;

    /// Set `metadata.finalizers`, guarded by the object's resource version
    async fn set_finalizers(
        &self,
        obj: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<DynamicObject, kube::Error>;
}

#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl std::fmt::Debug for KubeResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceClient")
            .field("resource", &self.resource.plural)
            .field("namespaced", &self.namespaced)
            .finish_non_exhaustive()
    }
}

impl KubeResourceClient {
    #[must_use]
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        Self {
            client,
            resource,
            namespaced,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &self.resource)
            }
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        self.api(namespace).get_opt(name).await
    }

    async fn patch_conditions(
        &self,
        namespace: Option<&str>,
        name: &str,
        conditions: Value,
    ) -> Result<(), kube::Error> {
        let patch = json!({ "status": { "conditions": conditions } });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        obj: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<DynamicObject, kube::Error> {
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": obj.metadata.resource_version,
            }
        });
        self.api(obj.metadata.namespace.as_deref())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    }
}
