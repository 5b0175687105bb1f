//! `collect-logs` action: dump the management database, the component
//! ConfigMaps and the logs of every cluster node into the host logs directory,
//! optionally uploading the bundle to S3

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, PodSpec, SecretKeySelector};
use kube::ResourceExt;
use tracing::{info, instrument};

use super::actions::ActionHandler;
use super::components::management::{mongo_connection, MANAGEMENT_CONFIG_MAP};
use super::components::nvmesh_core::CORE_CONFIG_MAP;
use super::jobs::{
    self, add_config_map_mount, add_env, add_host_path_mount, cluster_display_name, core_image,
    job_container, match_node, new_job, sanitize, set_privileged, DEFAULT_BACKOFF_LIMIT,
};
use super::outcome::Outcome;
use super::reconciler::ControllerState;
use super::tasks::{run_stages, Sequence, Stage};
use crate::crd::{ClusterAction, NVMesh};
use crate::error::Result;

pub const COLLECT_LOGS_ACTION: &str = "collect-logs";
pub const UPLOAD_TO_S3_ARG: &str = "upload-to-s3";

const COLLECTOR_IMAGE: &str = "nvmesh-logs-collector";
const COLLECT_DB_JOB: &str = "collect-db";
const COLLECT_CONFIG_MAPS_JOB: &str = "collect-config-maps";
const COLLECT_NODE_LOGS_JOB_PREFIX: &str = "collect-logs";

const CSI_CONFIG_MAP: &str = "nvmesh-csi-config";
const S3_SECRET: &str = "s3-bucket-secrets";
pub const LOGS_SAVE_PATH: &str = "/opt/nvmesh-operator/logs";

const NODE_LOG_PATHS: [&str; 3] = ["/var/opt/NVMesh", "/var/log/NVMesh", "/opt/NVMesh"];
const JOB_POLL: Duration = Duration::from_secs(3);
const TERMINATION_GRACE_SECONDS: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectLogsStage {
    CollectDb,
    CollectConfigMaps,
    CollectNodeLogs,
    WaitForJobsToFinish,
    DeleteJobs,
}

impl Stage for CollectLogsStage {
    fn key(&self) -> &'static str {
        match self {
            CollectLogsStage::CollectDb => "CollectDB",
            CollectLogsStage::CollectConfigMaps => "CollectConfigMaps",
            CollectLogsStage::CollectNodeLogs => "CollectLogs",
            CollectLogsStage::WaitForJobsToFinish => "WaitForJobsToFinish",
            CollectLogsStage::DeleteJobs => "DeleteJobs",
        }
    }
}

/// One run of the collect-logs action with its arguments
pub struct CollectLogs {
    action: ClusterAction,
}

impl CollectLogs {
    pub fn new(action: ClusterAction) -> Self {
        Self { action }
    }

    fn container(&self, cluster: &NVMesh, name: &str, command: &str, args: &[&str]) -> Container {
        let mut container = job_container(cluster, name, core_image(cluster, COLLECTOR_IMAGE));
        container.command = Some(vec![command.to_string()]);
        container.args = Some(args.iter().map(|a| a.to_string()).collect());
        set_privileged(&mut container);
        container
    }

    /// Arguments and environment shared by every collector job
    fn finish_container(&self, cluster: &NVMesh, container: &mut Container) {
        add_env(container, "CLUSTER_NAME", &cluster_display_name(cluster));

        if let Some(bucket) = self.action.arg(UPLOAD_TO_S3_ARG) {
            container
                .args
                .get_or_insert_with(Vec::new)
                .push("--upload-to-s3".to_string());
            add_s3_credentials(container, bucket);
        }
        if cluster.spec.debug.collect_logs_jobs_run_forever {
            container
                .args
                .get_or_insert_with(Vec::new)
                .push("--debug".to_string());
        }
    }

    pub fn collect_db_job(&self, cluster: &NVMesh) -> Job {
        let mut pod = PodSpec {
            termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
            ..Default::default()
        };
        let mut container =
            self.container(cluster, COLLECT_DB_JOB, "sudo", &["-E", "/init.sh", "--db-dump"]);
        add_env(
            &mut container,
            "MONGO_URI",
            &format!("mongodb://{}/management", mongo_connection(cluster)),
        );
        self.finish_container(cluster, &mut container);
        add_host_path_mount(&mut pod, &mut container, LOGS_SAVE_PATH);

        new_job(cluster, COLLECT_DB_JOB, pod, container, DEFAULT_BACKOFF_LIMIT)
    }

    pub fn collect_config_maps_job(&self, cluster: &NVMesh) -> Job {
        let mut pod = PodSpec {
            termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
            ..Default::default()
        };
        let mut container = self.container(
            cluster,
            COLLECT_CONFIG_MAPS_JOB,
            "/bin/bash",
            &["-c", "/init.sh --config-maps"],
        );
        self.finish_container(cluster, &mut container);
        add_host_path_mount(&mut pod, &mut container, LOGS_SAVE_PATH);
        for config_map in [MANAGEMENT_CONFIG_MAP, CORE_CONFIG_MAP, CSI_CONFIG_MAP] {
            add_config_map_mount(
                &mut pod,
                &mut container,
                config_map,
                &format!("/config-maps/{config_map}"),
            );
        }

        new_job(cluster, COLLECT_CONFIG_MAPS_JOB, pod, container, DEFAULT_BACKOFF_LIMIT)
    }

    pub fn collect_node_logs_job(&self, cluster: &NVMesh, node: &str) -> Job {
        let name = node_job_name(node);
        // host network keeps the node hostname, host PID exposes the toma process
        let mut pod = PodSpec {
            host_network: Some(true),
            host_pid: Some(true),
            node_selector: Some(match_node(node)),
            ..Default::default()
        };
        let mut container =
            self.container(cluster, &name, "sudo", &["-E", "/init.sh", "--node-logs"]);
        self.finish_container(cluster, &mut container);
        for path in NODE_LOG_PATHS.iter().chain([&LOGS_SAVE_PATH]) {
            add_host_path_mount(&mut pod, &mut container, path);
        }

        new_job(cluster, &name, pod, container, DEFAULT_BACKOFF_LIMIT)
    }

    async fn wait_for_jobs(&self, cluster: &NVMesh, ctx: &ControllerState) -> Result<Outcome> {
        for name in job_names(ctx, cluster).await? {
            let outcome = jobs::wait_for_job(ctx, cluster, &name, JOB_POLL).await?;
            if !outcome.is_done() {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Done)
    }
}

pub fn node_job_name(node: &str) -> String {
    format!("{}-{}", COLLECT_NODE_LOGS_JOB_PREFIX, sanitize(node))
}

/// Every job the action creates, in the order they are waited on
async fn job_names(ctx: &ControllerState, cluster: &NVMesh) -> Result<Vec<String>> {
    let mut names = vec![
        COLLECT_DB_JOB.to_string(),
        COLLECT_CONFIG_MAPS_JOB.to_string(),
    ];
    let nodes = jobs::cluster_nodes(ctx, true).await?;
    names.extend(nodes.iter().map(|node| node_job_name(node)));
    Ok(names)
}

fn add_s3_credentials(container: &mut Container, bucket: &str) {
    let from_secret = |name: &str, key: &str| EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(S3_SECRET.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    };

    let env = container.env.get_or_insert_with(Vec::new);
    env.push(from_secret("S3_KEY_ID", "AWS_ACCESS_KEY_ID"));
    env.push(from_secret("S3_KEY_SECRET", "AWS_SECRET_ACCESS_KEY"));
    add_env(container, "S3_BUCKET_NAME", bucket);
}

#[async_trait]
impl Sequence for CollectLogs {
    type Stage = CollectLogsStage;

    const STAGES: &'static [CollectLogsStage] = &[
        CollectLogsStage::CollectDb,
        CollectLogsStage::CollectConfigMaps,
        CollectLogsStage::CollectNodeLogs,
        CollectLogsStage::WaitForJobsToFinish,
        CollectLogsStage::DeleteJobs,
    ];

    async fn run(
        &self,
        stage: CollectLogsStage,
        cluster: &NVMesh,
        ctx: &ControllerState,
    ) -> Result<Outcome> {
        match stage {
            CollectLogsStage::CollectDb => {
                jobs::ensure_job(ctx, cluster, &self.collect_db_job(cluster)).await?;
            }
            CollectLogsStage::CollectConfigMaps => {
                jobs::ensure_job(ctx, cluster, &self.collect_config_maps_job(cluster)).await?;
            }
            CollectLogsStage::CollectNodeLogs => {
                let nodes = jobs::cluster_nodes(ctx, true).await?;
                info!("Collecting logs from {} nodes", nodes.len());
                for node in &nodes {
                    jobs::ensure_job(ctx, cluster, &self.collect_node_logs_job(cluster, node))
                        .await?;
                }
            }
            CollectLogsStage::WaitForJobsToFinish => return self.wait_for_jobs(cluster, ctx).await,
            CollectLogsStage::DeleteJobs => {
                for name in job_names(ctx, cluster).await? {
                    jobs::delete_job(ctx, cluster, &name).await?;
                }
            }
        }
        Ok(Outcome::Done)
    }
}

/// Dispatch target of the `collect-logs` action
pub struct CollectLogsAction;

#[async_trait]
impl ActionHandler for CollectLogsAction {
    #[instrument(skip(self, action, cluster, ctx), fields(name = %cluster.name_any()))]
    async fn handle(
        &self,
        action: &ClusterAction,
        cluster: &mut NVMesh,
        ctx: &ControllerState,
    ) -> Result<Outcome> {
        let sequence = CollectLogs::new(action.clone());
        run_stages(&sequence, &action.name, cluster, ctx).await
    }
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

    fn container(job: &Job) -> Container {
        job.spec.clone().unwrap().template.spec.unwrap().containers.remove(0)
    }

    fn env_names(container: &Container) -> Vec<String> {
        container
            .env
            .iter()
            .flatten()
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn test_db_job_without_upload() {
        let sequence = CollectLogs::new(ClusterAction::new(COLLECT_LOGS_ACTION));
        let job = sequence.collect_db_job(&cluster());

        assert_eq!(job.name_any(), "collect-db");
        let container = container(&job);
        assert_eq!(
            container.image.as_deref(),
            Some("registry.excelero.com/nvmesh-logs-collector:0.7.1")
        );
        assert_eq!(
            container.args.clone().unwrap(),
            vec!["-E", "/init.sh", "--db-dump"]
        );
        assert_eq!(env_names(&container), vec!["MONGO_URI", "CLUSTER_NAME"]);
        let env = container.env.unwrap();
        assert_eq!(
            env[0].value.as_deref(),
            Some("mongodb://mongo-svc.nvmesh.svc.cluster.local:27017/management")
        );
        assert_eq!(env[1].value.as_deref(), Some("nvmesh_cluster"));
    }

    #[test]
    fn test_upload_to_s3_adds_credentials() {
        let mut action = ClusterAction::new(COLLECT_LOGS_ACTION);
        action
            .args
            .insert(UPLOAD_TO_S3_ARG.to_string(), "support-bucket".to_string());
        let mut cluster = cluster();
        cluster.spec.debug.collect_logs_jobs_run_forever = true;

        let job = CollectLogs::new(action).collect_config_maps_job(&cluster);

        let container = container(&job);
        assert_eq!(
            container.args.clone().unwrap(),
            vec!["-c", "/init.sh --config-maps", "--upload-to-s3", "--debug"]
        );
        assert_eq!(
            env_names(&container),
            vec!["CLUSTER_NAME", "S3_KEY_ID", "S3_KEY_SECRET", "S3_BUCKET_NAME"]
        );
        let mounts: Vec<_> = container
            .volume_mounts
            .unwrap()
            .into_iter()
            .map(|m| m.mount_path)
            .collect();
        assert_eq!(
            mounts,
            vec![
                "/opt/nvmesh-operator/logs",
                "/config-maps/nvmesh-mgmt-config",
                "/config-maps/nvmesh-core-config",
                "/config-maps/nvmesh-csi-config",
            ]
        );
    }

    #[test]
    fn test_node_job_is_pinned_to_node() {
        let sequence = CollectLogs::new(ClusterAction::new(COLLECT_LOGS_ACTION));
        let job = sequence.collect_node_logs_job(&cluster(), "worker-1.lab");

        assert_eq!(job.name_any(), "collect-logs-worker-1-lab");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        assert_eq!(pod.host_pid, Some(true));
        assert_eq!(
            pod.node_selector.unwrap()["kubernetes.io/hostname"],
            "worker-1.lab"
        );
        assert_eq!(pod.volumes.unwrap().len(), 4);
        assert_eq!(
            pod.containers[0].security_context.as_ref().unwrap().privileged,
            Some(true)
        );
    }
}
