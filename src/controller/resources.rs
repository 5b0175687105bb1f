//! Idempotent create/update/remove of single managed objects
//!
//! Objects come from the manifest templates of a component (or are built in
//! code), get stamped with the cluster namespace, labels and owner
//! reference, and are then handed to the component hooks before being
//! compared against the live object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::manifests;
use super::reconciler::ControllerState;
use super::store::object_gvk;
use crate::crd::NVMesh;
use crate::error::{Error, Result};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "nvmesh-operator";
pub const CLUSTER_NAME_LABEL: &str = "nvmesh.excelero.com/cluster-name";

/// Kinds that live outside any namespace
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "CSIDriver",
    "ClusterRole",
    "ClusterRoleBinding",
    "StorageClass",
    "CustomResourceDefinition",
    "SecurityContextConstraints",
];

/// Kinds only some distributions serve; a missing kind is not an error
pub const PLATFORM_KINDS: &[&str] = &["SecurityContextConstraints"];

/// Labels stamped on every object the operator manages
pub fn standard_labels(cluster: &NVMesh) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cluster: &NVMesh) -> OwnerReference {
    OwnerReference {
        api_version: NVMesh::api_version(&()).to_string(),
        kind: NVMesh::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

pub type InitFn = fn(&NVMesh, &mut DynamicObject) -> Result<()>;
pub type CompareFn = fn(&NVMesh, &DynamicObject, &DynamicObject) -> bool;

/// When a live object is replaced by the desired one
#[derive(Clone, Copy)]
pub enum UpdatePolicy {
    Never,
    /// Update when any of these JSON pointers differs; a path missing from
    /// the desired object is not compared
    Fields(&'static [&'static str]),
    Custom(CompareFn),
}

/// Customization registered by a component for one (kind, name)
#[derive(Clone, Copy)]
pub struct ObjectHook {
    pub kind: &'static str,
    /// Object name, or `*` for every object of the kind
    pub name: &'static str,
    pub init: Option<InitFn>,
    pub update: UpdatePolicy,
}

impl ObjectHook {
    fn matches(&self, kind: &str, name: &str) -> bool {
        self.kind == kind && (self.name == "*" || self.name == name)
    }
}

fn kind_and_name(obj: &DynamicObject) -> (&str, String) {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    (kind, obj.name_any())
}

/// Per-component customization of the objects it manages
pub trait ObjectHooks: Send + Sync {
    fn hooks(&self) -> &'static [ObjectHook] {
        &[]
    }

    fn find_hook(&self, obj: &DynamicObject) -> Option<&'static ObjectHook> {
        let (kind, name) = kind_and_name(obj);
        self.hooks().iter().find(|hook| hook.matches(kind, &name))
    }

    /// Fill the version-dependent fields of a freshly loaded template
    fn init_object(&self, cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
        match self.find_hook(obj).and_then(|hook| hook.init) {
            Some(init) => init(cluster, obj),
            None => Ok(()),
        }
    }

    /// Whether the live object has drifted from the desired one
    fn should_update(&self, cluster: &NVMesh, desired: &DynamicObject, found: &DynamicObject) -> bool {
        match self.find_hook(desired).map(|hook| hook.update) {
            Some(UpdatePolicy::Fields(paths)) => fields_differ(desired, found, paths),
            Some(UpdatePolicy::Custom(compare)) => compare(cluster, desired, found),
            Some(UpdatePolicy::Never) | None => false,
        }
    }
}

/// Objects that are created as-is and never updated
pub struct NoHooks;

impl ObjectHooks for NoHooks {}

pub fn fields_differ(desired: &DynamicObject, found: &DynamicObject, paths: &[&str]) -> bool {
    paths.iter().any(|path| match desired.data.pointer(path) {
        Some(expected) => found.data.pointer(path) != Some(expected),
        None => false,
    })
}

/// What a single ensure call did to the live store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
    Removed,
    Absent,
    /// The kind is not served by this cluster
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedObject {
    pub kind: String,
    pub name: String,
    pub applied: Applied,
}

fn object_namespace(cluster: &NVMesh, kind: &str) -> Option<String> {
    if is_cluster_scoped(kind) {
        None
    } else {
        cluster.namespace()
    }
}

/// Create `obj` if absent, or replace it when the hooks report drift
#[instrument(skip(ctx, cluster, obj, hooks), fields(object = %obj.name_any()))]
pub async fn ensure_exists<H: ObjectHooks + ?Sized>(
    ctx: &ControllerState,
    cluster: &NVMesh,
    mut obj: DynamicObject,
    hooks: &H,
) -> Result<Applied> {
    let gvk = object_gvk(&obj)?;
    if PLATFORM_KINDS.contains(&gvk.kind.as_str()) && !ctx.options.openshift {
        debug!("Not on OpenShift, skipping {} {}", gvk.kind, obj.name_any());
        return Ok(Applied::Unsupported);
    }
    let namespace = object_namespace(cluster, &gvk.kind);
    obj.metadata.namespace = namespace.clone();
    obj.labels_mut().extend(standard_labels(cluster));

    hooks.init_object(cluster, &mut obj)?;

    if namespace.is_some() {
        obj.metadata.owner_references = Some(vec![owner_reference(cluster)]);
    }

    let name = obj.name_any();
    let found = match ctx.store.get(&gvk, namespace.as_deref(), &name).await {
        Ok(found) => found,
        Err(e) if e.is_no_kind_match() && PLATFORM_KINDS.contains(&gvk.kind.as_str()) => {
            debug!("{} is not served by this cluster, skipping {}", gvk.kind, name);
            return Ok(Applied::Unsupported);
        }
        Err(e) => return Err(e),
    };

    match found {
        None => match ctx.store.create(&obj).await {
            Ok(_) => {
                info!("Created {} {}", gvk.kind, name);
                Ok(Applied::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!("{} {} was created concurrently", gvk.kind, name);
                Ok(Applied::Unchanged)
            }
            Err(e) => Err(e),
        },
        Some(found) => {
            if !hooks.should_update(cluster, &obj, &found) {
                debug!("{} {} is up to date", gvk.kind, name);
                return Ok(Applied::Unchanged);
            }

            obj.metadata.resource_version = found.metadata.resource_version.clone();
            if gvk.kind == "Service" {
                carry_cluster_ip(&mut obj, &found);
            }

            ctx.store.replace(&obj).await?;
            info!("Updated {} {}", gvk.kind, name);
            Ok(Applied::Updated)
        }
    }
}

/// The API server rejects a Service update that clears the allocated IP
fn carry_cluster_ip(desired: &mut DynamicObject, found: &DynamicObject) {
    let Some(cluster_ip) = found.data.pointer("/spec/clusterIP").cloned() else {
        return;
    };
    if let Some(spec) = desired.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("clusterIP".to_string(), cluster_ip);
    }
}

/// Delete `obj` if it exists
#[instrument(skip(ctx, cluster, obj), fields(object = %obj.name_any()))]
pub async fn ensure_removed(
    ctx: &ControllerState,
    cluster: &NVMesh,
    obj: &DynamicObject,
) -> Result<Applied> {
    let gvk = object_gvk(obj)?;
    let namespace = object_namespace(cluster, &gvk.kind);
    let name = obj.name_any();

    let found = match ctx.store.get(&gvk, namespace.as_deref(), &name).await {
        Ok(found) => found,
        Err(e) if e.is_no_kind_match() => return Ok(Applied::Unsupported),
        Err(e) => return Err(e),
    };
    if found.is_none() {
        return Ok(Applied::Absent);
    }

    match ctx.store.delete(&gvk, namespace.as_deref(), &name).await {
        Ok(()) => {
            info!("Removed {} {}", gvk.kind, name);
            Ok(Applied::Removed)
        }
        Err(e) if e.is_not_found() => Ok(Applied::Absent),
        Err(e) => Err(e),
    }
}

/// Create (or remove) every object templated under `dir`
///
/// All objects are processed even when some fail; every failure is logged
/// and the first one is returned.
pub async fn reconcile_manifests<H: ObjectHooks + ?Sized>(
    ctx: &ControllerState,
    cluster: &NVMesh,
    hooks: &H,
    dir: &str,
    recursive: bool,
    remove: bool,
) -> Result<Vec<AppliedObject>> {
    let root = ctx.options.resources_dir.join(dir);
    if !root.is_dir() {
        debug!("No manifests under {}", root.display());
        return Ok(Vec::new());
    }
    let mut applied = Vec::new();
    let mut errors: Vec<Error> = Vec::new();

    for file in manifests::list_manifest_files(&root, recursive)? {
        let parsed = manifests::load_file(&file)?;
        if let Some(parse_error) = parsed.error {
            warn!("{}", parse_error);
            errors.push(parse_error.into());
        }

        for obj in parsed.objects {
            let (kind, name) = kind_and_name(&obj);
            let kind = kind.to_string();
            let result = if remove {
                ensure_removed(ctx, cluster, &obj).await
            } else {
                ensure_exists(ctx, cluster, obj, hooks).await
            };
            match result {
                Ok(outcome) => applied.push(AppliedObject {
                    kind,
                    name,
                    applied: outcome,
                }),
                Err(e) => {
                    error!("Failed to reconcile {} {} from {}: {}", kind, name, file.display(), e);
                    errors.push(e);
                }
            }
        }
    }

    if errors.len() > 1 {
        warn!("{} errors while reconciling {}", errors.len(), dir);
    }
    match errors.into_iter().next() {
        Some(first) => Err(first),
        None => Ok(applied),
    }
}
