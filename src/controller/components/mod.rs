//! Component drivers for the three NVMesh subsystems
//!
//! A driver owns a directory of manifest templates, decides whether its
//! assets should exist at all, and customizes the objects it manages through
//! its [`ObjectHooks`] table.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PersistentVolumeClaimSpec, Volume, VolumeMount,
};

use super::outcome::Outcome;
use super::reconciler::ControllerState;
use super::resources::ObjectHooks;
use crate::crd::NVMesh;
use crate::error::Result;

pub mod csi;
pub mod management;
pub mod nvmesh_core;

pub use csi::CsiDriver;
pub use management::ManagementDriver;
pub use nvmesh_core::CoreDriver;

pub const ENV_KEEP_RUNNING: &str = "KEEP_RUNNING_WHEN_FINISHED";

#[async_trait]
pub trait Component: ObjectHooks {
    fn name(&self) -> &'static str;

    /// Create or remove the component assets for one reconcile cycle
    async fn reconcile(&self, cluster: &NVMesh, ctx: &ControllerState) -> Result<Outcome>;
}

/// Drivers in the order they are reconciled
pub fn all() -> [&'static dyn Component; 3] {
    [&ManagementDriver, &CoreDriver, &CsiDriver]
}

/// Set `name` to `value`, replacing an existing entry
pub fn set_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }),
    }
}

pub fn add_keep_running_env(cluster: &NVMesh, container: &mut Container) {
    if cluster.spec.debug.containers_keep_running_after_failure {
        set_env(container, ENV_KEEP_RUNNING, "true");
    }
}

/// Mount a host directory into `container`, adding the pod volume
pub fn mount_host_path(
    volumes: &mut Option<Vec<Volume>>,
    container: &mut Container,
    volume_name: &str,
    path: &str,
) {
    volumes.get_or_insert_with(Vec::new).push(Volume {
        name: volume_name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    });
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: volume_name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        });
}

/// Copy the user supplied parts of a claim onto a volume claim template
pub fn override_claim_spec(target: &mut PersistentVolumeClaimSpec, source: &PersistentVolumeClaimSpec) {
    if source.storage_class_name.is_some() {
        target.storage_class_name = source.storage_class_name.clone();
    }
    if source.selector.is_some() {
        target.selector = source.selector.clone();
    }
    if let Some(resources) = &source.resources {
        let target_resources = target.resources.get_or_insert_with(Default::default);
        if resources.requests.is_some() {
            target_resources.requests = resources.requests.clone();
        }
        if resources.limits.is_some() {
            target_resources.limits = resources.limits.clone();
        }
    }
}
