//! Object store seam between the reconcile engine and the API server
//!
//! Everything the engine reads or writes goes through [`ObjectStore`], keyed
//! by (kind, namespace, name). `KubeStore` is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::crd::NVMesh;
use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "nvmesh-operator";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the object does not exist
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Full update; `metadata.resourceVersion` must carry the version that was read
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str)
        -> Result<()>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Change notifications for a single named object
    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<BoxStream<'static, Result<DynamicObject>>>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<NVMesh>>;

    /// Writes metadata and spec of the cluster object
    async fn replace_cluster(&self, cluster: &NVMesh) -> Result<NVMesh>;

    /// Replaces the status sub-resource as a whole, failing with a conflict
    /// on a stale resourceVersion
    async fn replace_cluster_status(&self, cluster: &NVMesh) -> Result<NVMesh>;
}

/// GroupVersionKind of a typed k8s-openapi resource
pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// GroupVersionKind recorded in an object's TypeMeta
pub fn object_gvk(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::ConfigError(format!(
            "object {} has no apiVersion/kind",
            obj.metadata.name.clone().unwrap_or_default()
        ))
    })?;
    Ok(gvk_from_types(types))
}

pub fn gvk_from_types(types: &TypeMeta) -> GroupVersionKind {
    match types.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &types.kind),
        None => GroupVersionKind::gvk("", &types.api_version, &types.kind),
    }
}

pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object into a typed one; TypeMeta must match `K`
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Mutate a dynamic object through its typed representation
pub fn with_typed<K, F>(obj: &mut DynamicObject, mutate: F) -> Result<()>
where
    K: Serialize + DeserializeOwned,
    F: FnOnce(&mut K) -> Result<()>,
{
    let mut typed: K = from_dynamic(obj)?;
    mutate(&mut typed)?;
    *obj = to_dynamic(&typed)?;
    Ok(())
}

/// [`ObjectStore`] backed by the Kubernetes API with a discovery cache
pub struct KubeStore {
    client: Client,
    kinds: Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kinds: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(found) = self.kinds.lock().await.get(&key) {
            return Ok(found.clone());
        }

        let resolved = match discovery::pinned_kind(&self.client, gvk).await {
            Ok(resolved) => resolved,
            Err(kube::Error::Discovery(_)) => return Err(Error::NoKindMatch(gvk.kind.clone())),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::NoKindMatch(gvk.kind.clone()))
            }
            Err(e) => return Err(Error::KubeError(e)),
        };

        debug!("Discovered {} as {}", key, resolved.0.plural);
        self.kinds.lock().await.insert(key, resolved.clone());
        Ok(resolved)
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (resource, capabilities) = self.resolve(gvk).await?;
        Ok(match (&capabilities.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn cluster_api(&self, namespace: &str) -> Api<NVMesh> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(gvk, namespace).await?;
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let gvk = object_gvk(obj)?;
        let api = self.api(&gvk, obj.metadata.namespace.as_deref()).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let gvk = object_gvk(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let api = self.api(&gvk, obj.metadata.namespace.as_deref()).await?;
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let api = self.api(gvk, namespace).await?;
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(gvk, namespace).await?;
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<BoxStream<'static, Result<DynamicObject>>> {
        let api = self.api(gvk, namespace).await?;
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        Ok(watcher(api, config)
            .default_backoff()
            .applied_objects()
            .map_err(Error::from)
            .boxed())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<NVMesh>> {
        Ok(self.cluster_api(namespace).get_opt(name).await?)
    }

    async fn replace_cluster(&self, cluster: &NVMesh) -> Result<NVMesh> {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        Ok(self
            .cluster_api(&namespace)
            .replace(&name, &PostParams::default(), cluster)
            .await?)
    }

    async fn replace_cluster_status(&self, cluster: &NVMesh) -> Result<NVMesh> {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        // a full PUT: keys missing from the body are cleared on the server
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .cluster_api(&namespace)
            .replace_status(&name, &params, serde_json::to_vec(cluster)?)
            .await?)
    }
}
