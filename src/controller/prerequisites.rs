//! Service account and RBAC every NVMesh pod and operator job runs with

use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::{DynamicObject, ObjectMeta};
use kube::ResourceExt;
use tracing::instrument;

use super::jobs::{CLUSTER_SERVICE_ACCOUNT, REGISTRY_CRED_SECRET};
use super::reconciler::ControllerState;
use super::resources::{ensure_exists, ensure_removed, NoHooks};
use super::store::to_dynamic;
use crate::crd::NVMesh;
use crate::error::Result;

pub const CLUSTER_ROLE: &str = "nvmesh-cluster-role";
pub const CLUSTER_ROLE_BINDING: &str = "nvmesh-cluster-rb";

fn metadata(cluster: &NVMesh, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: cluster.namespace(),
        ..Default::default()
    }
}

pub fn service_account(cluster: &NVMesh) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(cluster, CLUSTER_SERVICE_ACCOUNT),
        image_pull_secrets: Some(vec![LocalObjectReference {
            name: Some(REGISTRY_CRED_SECRET.to_string()),
        }]),
        ..Default::default()
    }
}

/// Lets NVMesh pods use the privileged SecurityContextConstraints on OpenShift
pub fn role(cluster: &NVMesh) -> Role {
    Role {
        metadata: metadata(cluster, CLUSTER_ROLE),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["security.openshift.io".to_string()]),
            resources: Some(vec!["securitycontextconstraints".to_string()]),
            resource_names: Some(vec!["privileged".to_string()]),
            verbs: vec!["use".to_string()],
            ..Default::default()
        }]),
    }
}

pub fn role_binding(cluster: &NVMesh) -> RoleBinding {
    RoleBinding {
        metadata: metadata(cluster, CLUSTER_ROLE_BINDING),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: CLUSTER_SERVICE_ACCOUNT.to_string(),
            namespace: cluster.namespace(),
            ..Default::default()
        }]),
    }
}

fn objects(cluster: &NVMesh) -> Result<[DynamicObject; 3]> {
    Ok([
        to_dynamic(&service_account(cluster))?,
        to_dynamic(&role(cluster))?,
        to_dynamic(&role_binding(cluster))?,
    ])
}

#[instrument(skip(ctx, cluster), fields(name = %cluster.name_any()))]
pub async fn ensure_prerequisites(ctx: &ControllerState, cluster: &NVMesh) -> Result<()> {
    for obj in objects(cluster)? {
        ensure_exists(ctx, cluster, obj, &NoHooks).await?;
    }
    Ok(())
}

#[instrument(skip(ctx, cluster), fields(name = %cluster.name_any()))]
pub async fn remove_prerequisites(ctx: &ControllerState, cluster: &NVMesh) -> Result<()> {
    for obj in objects(cluster)? {
        ensure_removed(ctx, cluster, &obj).await?;
    }
    Ok(())
}
