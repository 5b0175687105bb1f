//! Batch jobs run by the operator for out-of-band work (log collection,
//! database init/clear, node uninstall)
//!
//! Job names are deterministic, so creating one that already exists is a
//! no-op and a re-entered stage simply picks the same job up again.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, LocalObjectReference, Node, Pod, PodSpec,
    PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::components::mount_host_path;
use super::outcome::Outcome;
use super::reconciler::ControllerState;
use super::resources::{self, standard_labels, NoHooks};
use super::store::{from_dynamic, gvk_of, to_dynamic};
use crate::crd::NVMesh;
use crate::error::{Error, Result};

pub const CLUSTER_SERVICE_ACCOUNT: &str = "nvmesh-cluster";
pub const REGISTRY_CRED_SECRET: &str = "excelero-registry-cred";
pub const JOB_NAME_LABEL: &str = "job-name";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub const CLIENT_NODE_LABEL: &str = "nvmesh.excelero.com/nvmesh-client";
pub const TARGET_NODE_LABEL: &str = "nvmesh.excelero.com/nvmesh-target";
pub const MANAGEMENT_NODE_LABEL: &str = "nvmesh.excelero.com/nvmesh-management";

pub const DEFAULT_BACKOFF_LIMIT: i32 = 3;
/// Database jobs are not worth retrying more than once
pub const DATABASE_JOB_BACKOFF_LIMIT: i32 = 1;

/// Node names may contain dots, job names may not
pub fn sanitize(name: &str) -> String {
    name.replace('.', "-")
}

pub fn image_pull_policy(cluster: &NVMesh) -> &'static str {
    if cluster.spec.debug.image_pull_policy_always {
        "Always"
    } else {
        "IfNotPresent"
    }
}

/// `<core registry>/<image>:<core image tag>`
pub fn core_image(cluster: &NVMesh, image: &str) -> String {
    format!(
        "{}/{}:{}",
        cluster.spec.core.image_registry, image, cluster.spec.core.image_version_tag
    )
}

/// `<namespace>_<name>`, the cluster name reported by log collectors
pub fn cluster_display_name(cluster: &NVMesh) -> String {
    format!(
        "{}_{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// The single container of a job pod, named after the job
pub fn job_container(cluster: &NVMesh, name: &str, image: String) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image),
        image_pull_policy: Some(image_pull_policy(cluster).to_string()),
        ..Default::default()
    }
}

/// Wrap `pod` and `container` into a one-completion Job
pub fn new_job(
    cluster: &NVMesh,
    name: &str,
    mut pod: PodSpec,
    container: Container,
    backoff_limit: i32,
) -> Job {
    let mut labels = standard_labels(cluster);
    labels.insert(JOB_NAME_LABEL.to_string(), name.to_string());

    pod.service_account_name = Some(CLUSTER_SERVICE_ACCOUNT.to_string());
    pod.image_pull_secrets = Some(vec![LocalObjectReference {
        name: Some(REGISTRY_CRED_SECRET.to_string()),
    }]);
    pod.restart_policy = Some("OnFailure".to_string());
    pod.containers = vec![container];

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(backoff_limit),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume name derived from a host path: `/var/log/NVMesh` -> `var-log-nvmesh`
pub fn host_path_volume_name(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "-").to_lowercase()
}

pub fn add_host_path_mount(pod: &mut PodSpec, container: &mut Container, path: &str) {
    mount_host_path(&mut pod.volumes, container, &host_path_volume_name(path), path);
}

pub fn add_config_map_mount(
    pod: &mut PodSpec,
    container: &mut Container,
    config_map: &str,
    path: &str,
) {
    let name = format!("config-map-vol-{config_map}");
    pod.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: name.clone(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name,
            mount_path: path.to_string(),
            ..Default::default()
        });
}

pub fn set_privileged(container: &mut Container) {
    container
        .security_context
        .get_or_insert_with(SecurityContext::default)
        .privileged = Some(true);
}

pub fn add_env(container: &mut Container, name: &str, value: &str) {
    container.env.get_or_insert_with(Vec::new).push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}

pub fn match_node(node: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())])
}

/// Create the job unless a job of that name exists already
pub async fn ensure_job(ctx: &ControllerState, cluster: &NVMesh, job: &Job) -> Result<()> {
    let obj = to_dynamic(job)?;
    resources::ensure_exists(ctx, cluster, obj, &NoHooks).await?;
    Ok(())
}

/// Completion check on the job status
///
/// `Ok(true)` when finished, `Ok(false)` while running, an error once the job
/// failed.
pub fn job_completed(job: &Job) -> Result<bool> {
    let name = job.name_any();
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    let Some(status) = job.status.as_ref() else {
        return Ok(false);
    };

    if status.failed.unwrap_or(0) > 0 {
        return Err(Error::JobFailed {
            name,
            reason: "one or more pods failed".to_string(),
        });
    }
    if status.succeeded.unwrap_or(0) >= completions {
        return Ok(true);
    }
    if status.active.unwrap_or(0) > 0 {
        return Ok(false);
    }
    if let Some(condition) = status.conditions.as_ref().and_then(|c| c.first()) {
        if condition.type_ == "Failed" {
            return Err(Error::JobFailed {
                name,
                reason: condition.message.clone().unwrap_or_default(),
            });
        }
    }
    Ok(false)
}

/// `Done` once the job succeeded, a requeue after `poll` while it runs
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn wait_for_job(
    ctx: &ControllerState,
    cluster: &NVMesh,
    name: &str,
    poll: Duration,
) -> Result<Outcome> {
    let namespace = cluster.namespace();
    let obj = ctx
        .store
        .get(&gvk_of::<Job>(), namespace.as_deref(), name)
        .await?
        .ok_or_else(|| Error::JobNotFound(name.to_string()))?;
    let job: Job = from_dynamic(&obj)?;

    if job_completed(&job)? {
        debug!("Job {} finished", name);
        return Ok(Outcome::Done);
    }

    info!("Waiting for {} to finish", name);
    if cluster.spec.debug.debug_jobs {
        log_job_pods(ctx, cluster, name).await?;
    }
    Ok(Outcome::RequeueAfter(poll))
}

async fn job_pods(ctx: &ControllerState, namespace: Option<&str>, name: &str) -> Result<Vec<Pod>> {
    let selector = format!("{JOB_NAME_LABEL}={name}");
    ctx.store
        .list(&gvk_of::<Pod>(), namespace, &selector)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}

async fn log_job_pods(ctx: &ControllerState, cluster: &NVMesh, name: &str) -> Result<()> {
    for pod in job_pods(ctx, cluster.namespace().as_deref(), name).await? {
        let status = pod.status.unwrap_or_default();
        info!(
            "Job {} pod {} phase: {} reason: {} message: {}",
            name,
            pod.metadata.name.unwrap_or_default(),
            status.phase.unwrap_or_default(),
            status.reason.unwrap_or_default(),
            status.message.unwrap_or_default()
        );
    }
    Ok(())
}

/// Delete the job and the pods it left behind
pub async fn delete_job(ctx: &ControllerState, cluster: &NVMesh, name: &str) -> Result<()> {
    let namespace = cluster.namespace();
    let namespace = namespace.as_deref();

    match ctx.store.delete(&gvk_of::<Job>(), namespace, name).await {
        Ok(()) => debug!("Deleted job {}", name),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    for pod in job_pods(ctx, namespace, name).await? {
        let pod_name = pod.name_any();
        match ctx.store.delete(&gvk_of::<Pod>(), namespace, &pod_name).await {
            Ok(()) => debug!("Deleted pod {} of job {}", pod_name, name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Names of the nodes running NVMesh clients or targets, plus the
/// management nodes when `include_management` is set
pub async fn cluster_nodes(ctx: &ControllerState, include_management: bool) -> Result<Vec<String>> {
    let mut labels = vec![CLIENT_NODE_LABEL, TARGET_NODE_LABEL];
    if include_management {
        labels.push(MANAGEMENT_NODE_LABEL);
    }

    let mut nodes = BTreeSet::new();
    for label in labels {
        for node in ctx.store.list(&gvk_of::<Node>(), None, label).await? {
            nodes.insert(node.name_any());
        }
    }
    Ok(nodes.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn job_with_status(status: JobStatus) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("collect-db".to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                completions: Some(1),
                ..Default::default()
            }),
            status: Some(status),
        }
    }

    #[test]
    fn test_job_completed_states() {
        let running = job_with_status(JobStatus {
            active: Some(1),
            ..Default::default()
        });
        assert!(!job_completed(&running).unwrap());

        let done = job_with_status(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert!(job_completed(&done).unwrap());

        let failed = job_with_status(JobStatus {
            failed: Some(1),
            ..Default::default()
        });
        assert!(matches!(job_completed(&failed), Err(Error::JobFailed { .. })));
    }

    #[test]
    fn test_job_failed_condition_carries_message() {
        let job = job_with_status(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                message: Some("BackoffLimitExceeded".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        match job_completed(&job) {
            Err(Error::JobFailed { name, reason }) => {
                assert_eq!(name, "collect-db");
                assert_eq!(reason, "BackoffLimitExceeded");
            }
            other => panic!("expected a failed job, got {other:?}"),
        }
    }

    #[test]
    fn test_host_path_volume_name() {
        assert_eq!(host_path_volume_name("/var/log/NVMesh"), "var-log-nvmesh");
        assert_eq!(
            host_path_volume_name("/opt/nvmesh-operator/logs"),
            "opt-nvmesh-operator-logs"
        );
    }

    #[test]
    fn test_sanitize_node_name() {
        assert_eq!(sanitize("worker-1.example.com"), "worker-1-example-com");
    }
}
