//! In-memory collaborators for exercising the control loop without a cluster

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::api::DynamicObject;
use kube::core::{ErrorResponse, GroupVersionKind};
use kube::ResourceExt;
use serde_json::json;
use tempfile::TempDir;

use super::database::{DatabaseError, GlobalSettings, HiddenSettings, SettingsDatabase};
use super::events::{EventPublisher, EventType};
use super::options::OperatorOptions;
use super::reconciler::ControllerState;
use super::store::{object_gvk, ObjectStore};
use crate::crd::NVMesh;
use crate::error::{Error, Result};

type Key = (String, String, String);

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(kind: &str, name: &str) -> Error {
    api_error(404, "NotFound", format!("{kind} {name} not found"))
}

fn key(kind: &str, namespace: Option<&str>, name: &str) -> Key {
    (
        kind.to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

/// `a`, `a=b` and comma separated combinations of both
fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|value| value == v),
            None => labels.contains_key(term),
        })
}

/// Object store over a map, counting the writes it receives
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    cluster: Mutex<Option<NVMesh>>,
    versions: AtomicU64,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
    /// Status writes fail with a server error while set
    pub fail_status: AtomicBool,
}

impl FakeStore {
    fn objects(&self) -> MutexGuard<'_, BTreeMap<Key, DynamicObject>> {
        self.objects.lock().unwrap()
    }

    fn next_version(&self) -> Option<String> {
        Some((self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    pub fn with_cluster(cluster: NVMesh) -> Self {
        let store = Self::default();
        store.set_cluster(cluster);
        store
    }

    pub fn set_cluster(&self, mut cluster: NVMesh) {
        cluster.metadata.resource_version = self.next_version();
        *self.cluster.lock().unwrap() = Some(cluster);
    }

    pub fn cluster(&self) -> Option<NVMesh> {
        self.cluster.lock().unwrap().clone()
    }

    /// Seed an object without counting it as a write
    pub fn insert(&self, mut obj: DynamicObject) {
        let gvk = object_gvk(&obj).unwrap();
        obj.metadata.resource_version = self.next_version();
        let key = key(&gvk.kind, obj.metadata.namespace.as_deref(), &obj.name_any());
        self.objects().insert(key, obj);
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.objects().get(&key(kind, namespace, name)).cloned()
    }

    pub fn names_of(&self, kind: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|(k, _, _)| k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Mark every job as succeeded
    pub fn complete_jobs(&self) {
        for ((kind, _, _), obj) in self.objects().iter_mut() {
            if kind == "Job" {
                obj.data["status"] = json!({ "succeeded": 1 });
            }
        }
    }

    /// Mark one job as succeeded
    pub fn complete_job(&self, name: &str) {
        for ((kind, _, job), obj) in self.objects().iter_mut() {
            if kind == "Job" && job == name {
                obj.data["status"] = json!({ "succeeded": 1 });
            }
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.object(&gvk.kind, namespace, name))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let gvk = object_gvk(obj)?;
        let key = key(&gvk.kind, obj.metadata.namespace.as_deref(), &obj.name_any());
        let mut objects = self.objects();
        if objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} {} already exists", gvk.kind, obj.name_any()),
            ));
        }
        let mut stored = obj.clone();
        stored.metadata.resource_version = self.next_version();
        objects.insert(key, stored.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let gvk = object_gvk(obj)?;
        let name = obj.name_any();
        let key = key(&gvk.kind, obj.metadata.namespace.as_deref(), &name);
        let mut objects = self.objects();
        let Some(current) = objects.get(&key) else {
            return Err(not_found(&gvk.kind, &name));
        };
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(api_error(409, "Conflict", format!("{} {} changed", gvk.kind, name)));
        }
        let mut stored = obj.clone();
        stored.metadata.resource_version = self.next_version();
        objects.insert(key, stored.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()> {
        match self.objects().remove(&key(&gvk.kind, namespace, name)) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(not_found(&gvk.kind, name)),
        }
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .objects()
            .iter()
            .filter(|((kind, ns, _), _)| {
                *kind == gvk.kind && namespace.map_or(true, |wanted| ns == wanted)
            })
            .map(|(_, obj)| obj)
            .filter(|obj| matches_selector(obj, label_selector))
            .cloned()
            .collect())
    }

    async fn watch(
        &self,
        _gvk: &GroupVersionKind,
        _namespace: Option<&str>,
        _name: &str,
    ) -> Result<BoxStream<'static, Result<DynamicObject>>> {
        Ok(stream::empty().boxed())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<NVMesh>> {
        Ok(self.cluster().filter(|c| {
            c.namespace().as_deref() == Some(namespace) && c.name_any() == name
        }))
    }

    async fn replace_cluster(&self, cluster: &NVMesh) -> Result<NVMesh> {
        let mut guard = self.cluster.lock().unwrap();
        let Some(current) = guard.as_mut() else {
            return Err(not_found("NVMesh", &cluster.name_any()));
        };
        current.metadata = cluster.metadata.clone();
        current.metadata.resource_version = self.next_version();
        current.spec = cluster.spec.clone();
        let stored = current.clone();

        // the API server drops an object once its last finalizer is gone
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            *guard = None;
        }
        Ok(stored)
    }

    async fn replace_cluster_status(&self, cluster: &NVMesh) -> Result<NVMesh> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(api_error(500, "InternalError", "status write failed".to_string()));
        }
        let mut guard = self.cluster.lock().unwrap();
        let Some(current) = guard.as_mut() else {
            return Err(not_found("NVMesh", &cluster.name_any()));
        };
        if cluster.metadata.resource_version != current.metadata.resource_version {
            return Err(api_error(409, "Conflict", "NVMesh changed".to_string()));
        }
        // the stored status is exactly what the request body carried
        let body = serde_json::to_value(cluster)?;
        current.status = match body.get("status") {
            Some(status) => serde_json::from_value(status.clone())?,
            None => None,
        };
        current.metadata.resource_version = self.next_version();
        Ok(current.clone())
    }
}

/// Settings database answering with a fixed result
pub struct FakeDatabase {
    pub settings: Mutex<Option<GlobalSettings>>,
    pub updates: Mutex<Vec<HiddenSettings>>,
}

impl FakeDatabase {
    /// A database whose settings already match the cluster defaults
    pub fn initialized() -> Self {
        Self {
            settings: Mutex::new(Some(GlobalSettings {
                hidden: HiddenSettings {
                    auto_evict_missing_drive: true,
                    auto_format_drive: true,
                },
            })),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// A database without a globalSettings document
    pub fn empty() -> Self {
        Self {
            settings: Mutex::new(None),
            updates: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SettingsDatabase for FakeDatabase {
    async fn global_settings(&self, _uri: &str) -> Result<GlobalSettings, DatabaseError> {
        self.settings
            .lock()
            .unwrap()
            .clone()
            .ok_or(DatabaseError::NoDocument)
    }

    async fn update_hidden_settings(
        &self,
        _uri: &str,
        hidden: HiddenSettings,
    ) -> Result<(), DatabaseError> {
        self.updates.lock().unwrap().push(hidden);
        Ok(())
    }
}

/// Records published events as `(type, reason, message)`
#[derive(Default)]
pub struct FakeEvents {
    pub published: Mutex<Vec<(EventType, String, String)>>,
}

#[async_trait]
impl EventPublisher for FakeEvents {
    async fn publish(
        &self,
        _cluster: &NVMesh,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((event_type, reason.to_string(), message.to_string()));
        Ok(())
    }
}

/// Controller state over fakes; the resources directory starts out empty
pub struct TestHarness {
    pub store: Arc<FakeStore>,
    pub database: Arc<FakeDatabase>,
    pub events: Arc<FakeEvents>,
    pub state: ControllerState,
    pub resources: TempDir,
}

impl TestHarness {
    pub fn new(store: FakeStore, database: FakeDatabase) -> Self {
        let resources = tempfile::tempdir().unwrap();
        let store = Arc::new(store);
        let database = Arc::new(database);
        let events = Arc::new(FakeEvents::default());
        let options = OperatorOptions {
            resources_dir: resources.path().to_path_buf(),
            ..Default::default()
        };
        let (state, _triggers) =
            ControllerState::new(store.clone(), database.clone(), events.clone(), options);
        Self {
            store,
            database,
            events,
            state,
            resources,
        }
    }

    /// Write a manifest file under `<resources>/<dir>/<file>`
    pub fn add_manifest(&self, dir: &str, file: &str, contents: &str) {
        let dir = self.resources.path().join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), contents).unwrap();
    }
}

/// An NVMesh object in namespace `nvmesh`
pub fn test_cluster(name: &str) -> NVMesh {
    let mut cluster = NVMesh::new(name, Default::default());
    cluster.metadata.namespace = Some("nvmesh".to_string());
    cluster.metadata.uid = Some(format!("uid-{name}"));
    cluster.metadata.generation = Some(1);
    cluster
}
