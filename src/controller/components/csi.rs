//! NVMesh CSI driver: controller stateful set, node daemon set and the
//! endpoint of the management servers it talks to

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, Subject};
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::instrument;

use super::{add_keep_running_env, Component};
use crate::controller::jobs::image_pull_policy;
use crate::controller::outcome::Outcome;
use crate::controller::reconciler::ControllerState;
use crate::controller::resources::{reconcile_manifests, ObjectHook, ObjectHooks, UpdatePolicy};
use crate::controller::store::with_typed;
use crate::crd::NVMesh;
use crate::error::{Error, Result};

pub const CSI_ASSETS: &str = "csi";
pub const CSI_CONTROLLER: &str = "nvmesh-csi-controller";
pub const CSI_NODE_DRIVER: &str = "nvmesh-csi-node-driver";
pub const CSI_SERVICE_ACCOUNT: &str = "nvmesh-csi";

const CSI_DRIVER_IMAGE: &str = "nvmesh-csi-driver";
const CSI_DEFAULT_REGISTRY: &str = "excelero";
const MANAGEMENT_GUI_SERVICE: &str = "nvmesh-management-gui";

static HOOKS: &[ObjectHook] = &[
    ObjectHook {
        kind: "StatefulSet",
        name: CSI_CONTROLLER,
        init: Some(init_controller),
        update: UpdatePolicy::Fields(&["/spec/template/spec/containers/0/image", "/spec/replicas"]),
    },
    ObjectHook {
        kind: "DaemonSet",
        name: CSI_NODE_DRIVER,
        init: Some(init_node_driver),
        update: UpdatePolicy::Fields(&[
            "/spec/template/spec/containers/0/image",
            "/spec/template/spec/containers/0/imagePullPolicy",
        ]),
    },
    ObjectHook {
        kind: "ConfigMap",
        name: "*",
        init: Some(init_config_map),
        update: UpdatePolicy::Never,
    },
    ObjectHook {
        kind: "RoleBinding",
        name: "*",
        init: Some(init_role_binding),
        update: UpdatePolicy::Never,
    },
    ObjectHook {
        kind: "ClusterRoleBinding",
        name: "*",
        init: Some(init_cluster_role_binding),
        update: UpdatePolicy::Never,
    },
];

pub struct CsiDriver;

impl ObjectHooks for CsiDriver {
    fn hooks(&self) -> &'static [ObjectHook] {
        HOOKS
    }
}

#[async_trait]
impl Component for CsiDriver {
    fn name(&self) -> &'static str {
        "csi"
    }

    #[instrument(skip(self, cluster, ctx), fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &NVMesh, ctx: &ControllerState) -> Result<Outcome> {
        let disabled = cluster.spec.csi.disabled;
        reconcile_manifests(ctx, cluster, self, CSI_ASSETS, true, disabled).await?;
        Ok(Outcome::Done)
    }
}

pub fn csi_image(cluster: &NVMesh) -> String {
    let registry = match cluster.spec.csi.image_registry.as_str() {
        "" => CSI_DEFAULT_REGISTRY,
        registry => registry,
    };
    format!("{}/{}:{}", registry, CSI_DRIVER_IMAGE, cluster.spec.csi.version)
}

fn require_version(cluster: &NVMesh) -> Result<()> {
    if cluster.spec.csi.version.is_empty() {
        return Err(Error::MissingField(
            "NVMesh CSI Driver Version (NVMesh.Spec.CSI.Version)".to_string(),
        ));
    }
    Ok(())
}

fn init_driver_pod(cluster: &NVMesh, pod: &mut PodSpec) {
    pod.service_account_name = Some(CSI_SERVICE_ACCOUNT.to_string());
    if let Some(container) = pod.containers.first_mut() {
        container.image = Some(csi_image(cluster));
        container.image_pull_policy = Some(image_pull_policy(cluster).to_string());
        add_keep_running_env(cluster, container);
    }
}

fn init_controller(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    require_version(cluster)?;
    with_typed::<StatefulSet, _>(obj, |ss| {
        if let Some(spec) = ss.spec.as_mut() {
            spec.replicas = Some(cluster.spec.csi.controller_replicas);
            if let Some(pod) = spec.template.spec.as_mut() {
                init_driver_pod(cluster, pod);
            }
        }
        Ok(())
    })
}

fn init_node_driver(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    require_version(cluster)?;
    with_typed::<DaemonSet, _>(obj, |ds| {
        if let Some(pod) = ds.spec.as_mut().and_then(|s| s.template.spec.as_mut()) {
            init_driver_pod(cluster, pod);
        }
        Ok(())
    })
}

fn init_config_map(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    with_typed::<ConfigMap, _>(obj, |cm| {
        let data = cm.data.get_or_insert_with(BTreeMap::new);
        data.insert("management.protocol".to_string(), "https".to_string());
        data.insert(
            "management.servers".to_string(),
            format!("{MANAGEMENT_GUI_SERVICE}.{namespace}.svc.cluster.local:4000"),
        );
        Ok(())
    })
}

/// Bind the CSI service account of this cluster's namespace
fn bind_subjects(cluster: &NVMesh, subjects: &mut Option<Vec<Subject>>) {
    let namespace = cluster.namespace();
    let Some(subjects) = subjects.as_mut() else {
        return;
    };
    for subject in subjects.iter_mut() {
        subject.namespace = namespace.clone();
    }
    if let Some(first) = subjects.first_mut() {
        first.name = CSI_SERVICE_ACCOUNT.to_string();
    }
}

fn init_role_binding(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    with_typed::<RoleBinding, _>(obj, |rb| {
        bind_subjects(cluster, &mut rb.subjects);
        Ok(())
    })
}

fn init_cluster_role_binding(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    with_typed::<ClusterRoleBinding, _>(obj, |crb| {
        bind_subjects(cluster, &mut crb.subjects);
        Ok(())
    })
}
