//! Tear-down of an NVMesh cluster before its object is allowed to go away
//!
//! Workloads are removed first so no node still uses the storage, then the
//! management database is wiped and removed, and finally every node runs an
//! uninstall job that removes the NVMesh software from the host.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::components::csi::CSI_ASSETS;
use super::components::management::{mongo_connection, MANAGEMENT_ASSETS, MONGO_INSTANCE_IMAGE};
use super::components::nvmesh_core::CORE_ASSETS;
use super::components::{Component, CoreDriver, CsiDriver, ManagementDriver};
use super::jobs::{
    self, add_env, add_host_path_mount, core_image, job_container, match_node, new_job, sanitize,
    set_privileged, DATABASE_JOB_BACKOFF_LIMIT, DEFAULT_BACKOFF_LIMIT,
};
use super::outcome::Outcome;
use super::prerequisites;
use super::reconciler::ControllerState;
use super::resources::reconcile_manifests;
use super::store::gvk_of;
use super::tasks::{run_stages, Sequence, Stage};
use crate::crd::NVMesh;
use crate::error::Result;

/// Ledger key of the uninstall sequence
pub const UNINSTALL_OPERATION: &str = "uninstall";

pub const CLEAR_DB_JOB: &str = "nvmesh-clear-db-job";
const UNINSTALL_JOB_PREFIX: &str = "n-uninstall-";
const UNINSTALL_IMAGE: &str = "nvmesh-uninstall-job";

pub const COMPONENT_LABEL: &str = "nvmesh.excelero.com/component";
/// Pods that must be gone before the database is cleared
pub const WORKLOAD_COMPONENTS: [&str; 4] = ["client", "target", "mcs-agent", "csi-node-driver"];
const UNINSTALL_HOST_PATHS: [&str; 3] = ["/opt", "/etc/opt", "/var/log"];

const WORKLOADS_POLL: Duration = Duration::from_secs(1);
const JOB_POLL: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UninstallStage {
    RemoveAllWorkloads,
    WaitForWorkloadsToFinish,
    ClearDb,
    WaitForClearDbToFinish,
    RemoveMongo,
    UninstallClusterNodes,
    DeleteClusterServiceAccount,
}

impl Stage for UninstallStage {
    fn key(&self) -> &'static str {
        match self {
            UninstallStage::RemoveAllWorkloads => "removeAllWorkloads",
            UninstallStage::WaitForWorkloadsToFinish => "waitForWorkloadsToFinish",
            UninstallStage::ClearDb => "clearDB",
            UninstallStage::WaitForClearDbToFinish => "waitForClearDBToFinish",
            UninstallStage::RemoveMongo => "removeMongo",
            UninstallStage::UninstallClusterNodes => "uninstallClusterNodes",
            UninstallStage::DeleteClusterServiceAccount => "deleteClusterServiceAccount",
        }
    }
}

pub struct Uninstall;

pub fn uninstall_job_name(node: &str) -> String {
    format!("{}{}", UNINSTALL_JOB_PREFIX, sanitize(node))
}

pub fn clear_db_job(cluster: &NVMesh) -> Job {
    let mut container = job_container(cluster, CLEAR_DB_JOB, core_image(cluster, MONGO_INSTANCE_IMAGE));
    container.command = Some(vec!["mongo".to_string()]);
    container.args = Some(vec![
        format!("{}/management", mongo_connection(cluster)),
        "--eval".to_string(),
        "db.dropDatabase()".to_string(),
    ]);
    new_job(
        cluster,
        CLEAR_DB_JOB,
        PodSpec::default(),
        container,
        DATABASE_JOB_BACKOFF_LIMIT,
    )
}

pub fn uninstall_node_job(cluster: &NVMesh, node: &str) -> Job {
    let name = uninstall_job_name(node);
    let mut pod = PodSpec {
        node_name: Some(node.to_string()),
        node_selector: Some(match_node(node)),
        ..Default::default()
    };
    let mut container = job_container(cluster, &name, core_image(cluster, UNINSTALL_IMAGE));
    for path in UNINSTALL_HOST_PATHS {
        add_host_path_mount(&mut pod, &mut container, path);
    }
    add_env(&mut container, "KEEP_DOWNLOAD_CACHE", "false");
    set_privileged(&mut container);

    new_job(cluster, &name, pod, container, DEFAULT_BACKOFF_LIMIT)
}

async fn remaining_workload_pods(ctx: &ControllerState, cluster: &NVMesh) -> Result<usize> {
    let namespace = cluster.namespace();
    let mut count = 0;
    for component in WORKLOAD_COMPONENTS {
        let selector = format!("{COMPONENT_LABEL}={component}");
        count += ctx
            .store
            .list(&gvk_of::<Pod>(), namespace.as_deref(), &selector)
            .await?
            .len();
    }
    Ok(count)
}

async fn uninstall_nodes(ctx: &ControllerState, cluster: &NVMesh) -> Result<Outcome> {
    let nodes = jobs::cluster_nodes(ctx, false).await?;
    info!("Uninstalling {} nodes", nodes.len());

    for node in &nodes {
        if let Err(e) = jobs::ensure_job(ctx, cluster, &uninstall_node_job(cluster, node)).await {
            warn!("Uninstall failed on node {}: {}", node, e);
        }
    }

    for node in &nodes {
        let name = uninstall_job_name(node);
        let outcome = jobs::wait_for_job(ctx, cluster, &name, JOB_POLL).await?;
        if !outcome.is_done() {
            return Ok(outcome);
        }
        info!("Job {} finished", name);
    }

    for node in &nodes {
        jobs::delete_job(ctx, cluster, &uninstall_job_name(node)).await?;
    }
    Ok(Outcome::Done)
}

#[async_trait]
impl Sequence for Uninstall {
    type Stage = UninstallStage;

    const STAGES: &'static [UninstallStage] = &[
        UninstallStage::RemoveAllWorkloads,
        UninstallStage::WaitForWorkloadsToFinish,
        UninstallStage::ClearDb,
        UninstallStage::WaitForClearDbToFinish,
        UninstallStage::RemoveMongo,
        UninstallStage::UninstallClusterNodes,
        UninstallStage::DeleteClusterServiceAccount,
    ];

    async fn run(
        &self,
        stage: UninstallStage,
        cluster: &NVMesh,
        ctx: &ControllerState,
    ) -> Result<Outcome> {
        match stage {
            UninstallStage::RemoveAllWorkloads => {
                let workloads: [(&dyn Component, &str); 3] = [
                    (&CoreDriver, CORE_ASSETS),
                    (&CsiDriver, CSI_ASSETS),
                    (&ManagementDriver, MANAGEMENT_ASSETS),
                ];
                for (component, dir) in workloads {
                    info!("Removing {} workloads", component.name());
                    reconcile_manifests(ctx, cluster, component, dir, true, true).await?;
                }
            }
            UninstallStage::WaitForWorkloadsToFinish => {
                let remaining = remaining_workload_pods(ctx, cluster).await?;
                if remaining > 0 {
                    info!("Waiting for all workloads to finish. Found {} pods", remaining);
                    return Ok(Outcome::RequeueAfter(WORKLOADS_POLL));
                }
            }
            UninstallStage::ClearDb => {
                jobs::ensure_job(ctx, cluster, &clear_db_job(cluster)).await?;
            }
            UninstallStage::WaitForClearDbToFinish => {
                match jobs::wait_for_job(ctx, cluster, CLEAR_DB_JOB, JOB_POLL).await {
                    Ok(Outcome::RequeueAfter(delay)) => return Ok(Outcome::RequeueAfter(delay)),
                    Ok(Outcome::Done) => {}
                    Err(e) => warn!(
                        "Unable to clear the MongoDB database of {} in namespace {}: {}",
                        cluster.name_any(),
                        cluster.namespace().unwrap_or_default(),
                        e
                    ),
                }
                jobs::delete_job(ctx, cluster, CLEAR_DB_JOB).await?;
            }
            UninstallStage::RemoveMongo => ManagementDriver.remove_mongo(cluster, ctx).await?,
            UninstallStage::UninstallClusterNodes => return uninstall_nodes(ctx, cluster).await,
            UninstallStage::DeleteClusterServiceAccount => {
                prerequisites::remove_prerequisites(ctx, cluster).await?
            }
        }
        Ok(Outcome::Done)
    }
}

/// Drive the uninstall sequence; `Done` once the cluster may be deleted
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any()))]
pub async fn uninstall_cluster(cluster: &mut NVMesh, ctx: &ControllerState) -> Result<Outcome> {
    if cluster.spec.operator.skip_uninstall {
        info!("spec.operator.skipUninstall is set, skipping uninstall");
        return Ok(Outcome::Done);
    }

    let outcome = run_stages(&Uninstall, UNINSTALL_OPERATION, cluster, ctx).await?;
    if outcome.is_done() {
        cluster.spec.core.disabled = true;
        cluster.spec.csi.disabled = true;
        cluster.spec.management.disabled = true;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NVMeshSpec;

    fn cluster() -> NVMesh {
        let mut spec = NVMeshSpec::default();
        spec.core.image_registry = "registry.excelero.com".to_string();
        spec.core.image_version_tag = "0.7.1".to_string();
        let mut cluster = NVMesh::new("cluster", spec);
        cluster.metadata.namespace = Some("nvmesh".to_string());
        cluster
    }

    #[test]
    fn test_clear_db_job() {
        let job = clear_db_job(&cluster());
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(1));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("registry.excelero.com/nvmesh-mongo-instance:0.7.1")
        );
        assert_eq!(
            container.args.clone().unwrap(),
            vec![
                "mongo-svc.nvmesh.svc.cluster.local:27017/management",
                "--eval",
                "db.dropDatabase()"
            ]
        );
    }

    #[test]
    fn test_uninstall_job_runs_on_its_node() {
        let job = uninstall_node_job(&cluster(), "node-2.lab");
        assert_eq!(job.name_any(), "n-uninstall-node-2-lab");

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.node_name.as_deref(), Some("node-2.lab"));
        let container = &pod.containers[0];
        let mounts: Vec<_> = container
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(mounts, vec!["/opt", "/etc/opt", "/var/log"]);
        assert_eq!(
            container.env.as_ref().unwrap()[0].value.as_deref(),
            Some("false")
        );
    }

    #[test]
    fn test_stage_keys_are_unique() {
        let mut keys: Vec<_> = Uninstall::STAGES.iter().map(|s| s.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), Uninstall::STAGES.len());
    }
}
