//! NVMesh core: the MCS/agent, target and client daemon sets and the shared
//! `nvmesh.conf` configuration

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{info, instrument};

use super::{add_keep_running_env, mount_host_path, Component};
use crate::controller::jobs::{core_image, image_pull_policy};
use crate::controller::outcome::Outcome;
use crate::controller::reconciler::ControllerState;
use crate::controller::resources::{reconcile_manifests, ObjectHook, ObjectHooks, UpdatePolicy};
use crate::controller::store::{from_dynamic, with_typed};
use crate::crd::{NVMesh, DEFAULT_FILE_SERVER_ADDRESS};
use crate::error::Result;

pub const CORE_ASSETS: &str = "core";
pub const CORE_CONFIG_MAP: &str = "nvmesh-core-config";
pub const ENV_NVMESH_VERSION: &str = "NVMESH_VERSION";

const NVMESH_CONF_KEY: &str = "nvmesh.conf";
const FILE_SERVER_ADDRESS_KEY: &str = "fileServer.address";
const FILE_SERVER_SKIP_CERT_KEY: &str = "fileServer.skipCheckCertificate";

const DAEMON_SETS: [&str; 3] = ["nvmesh-mcs-agent", "nvmesh-target", "nvmesh-client"];

static HOOKS: &[ObjectHook] = &[
    ObjectHook {
        kind: "DaemonSet",
        name: DAEMON_SETS[0],
        init: Some(init_daemon_set),
        update: UpdatePolicy::Custom(daemon_set_drifted),
    },
    ObjectHook {
        kind: "DaemonSet",
        name: DAEMON_SETS[1],
        init: Some(init_daemon_set),
        update: UpdatePolicy::Custom(daemon_set_drifted),
    },
    ObjectHook {
        kind: "DaemonSet",
        name: DAEMON_SETS[2],
        init: Some(init_daemon_set),
        update: UpdatePolicy::Custom(daemon_set_drifted),
    },
    ObjectHook {
        kind: "ConfigMap",
        name: CORE_CONFIG_MAP,
        init: Some(init_config_map),
        update: UpdatePolicy::Fields(&[
            "/data/nvmesh.conf",
            "/data/fileServer.address",
            "/data/fileServer.skipCheckCertificate",
        ]),
    },
];

pub struct CoreDriver;

impl ObjectHooks for CoreDriver {
    fn hooks(&self) -> &'static [ObjectHook] {
        HOOKS
    }
}

#[async_trait]
impl Component for CoreDriver {
    fn name(&self) -> &'static str {
        "core"
    }

    #[instrument(skip(self, cluster, ctx), fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &NVMesh, ctx: &ControllerState) -> Result<Outcome> {
        let disabled = cluster.spec.core.disabled;
        reconcile_manifests(ctx, cluster, self, CORE_ASSETS, true, disabled).await?;
        Ok(Outcome::Done)
    }
}

/// Image of a core container, by container name
fn container_image(container: &str) -> Option<&'static str> {
    match container {
        "mcs" | "agent" => Some("nvmesh-mcs"),
        "toma" => Some("nvmesh-toma"),
        "tracer" => Some("nvmesh-tracer"),
        "driver-container" => Some("nvmesh-driver-container"),
        _ => None,
    }
}

fn init_daemon_set(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    let tcp_only = cluster.spec.core.tcp_only;

    with_typed::<DaemonSet, _>(obj, |ds| {
        let Some(pod) = ds.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
            return Ok(());
        };
        let volumes = &mut pod.volumes;

        for container in pod.containers.iter_mut() {
            if let Some(image) = container_image(&container.name) {
                container.image = Some(core_image(cluster, image));
            }
            container.image_pull_policy = Some(image_pull_policy(cluster).to_string());

            if !tcp_only {
                match container.name.as_str() {
                    "toma" => mount_host_path(volumes, container, "etc-libibverbs", "/etc/libibverbs.d/"),
                    "driver-container" => {
                        mount_host_path(volumes, container, "etc-infiniband", "/etc/infiniband")
                    }
                    _ => {}
                }
            }

            for env in container.env.iter_mut().flatten() {
                if env.name == ENV_NVMESH_VERSION {
                    env.value = Some(cluster.spec.core.version.clone());
                }
            }
            add_keep_running_env(cluster, container);
        }
        Ok(())
    })
}

/// Containers are compared by position against the desired template
fn daemon_set_drifted(cluster: &NVMesh, desired: &DynamicObject, found: &DynamicObject) -> bool {
    let (Ok(desired), Ok(found)) = (
        from_dynamic::<DaemonSet>(desired),
        from_dynamic::<DaemonSet>(found),
    ) else {
        return true;
    };
    let containers = |ds: &DaemonSet| {
        ds.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.clone())
            .unwrap_or_default()
    };
    let expected = containers(&desired);

    for (index, container) in containers(&found).iter().enumerate() {
        let expected_image = expected.get(index).and_then(|c| c.image.as_ref());
        if container.image.as_ref() != expected_image {
            info!(
                "Image mismatch on DaemonSet {} container {} expected: {:?} found: {:?}",
                found.name_any(),
                container.name,
                expected_image,
                container.image
            );
            return true;
        }

        let version = container
            .env
            .iter()
            .flatten()
            .find(|e| e.name == ENV_NVMESH_VERSION)
            .map(|e| e.value.clone().unwrap_or_default());
        if let Some(version) = version {
            if version != cluster.spec.core.version {
                info!(
                    "Core version requires update on DaemonSet {} container {} expected: {} found: {}",
                    found.name_any(),
                    container.name,
                    cluster.spec.core.version,
                    version
                );
                return true;
            }
        }
    }
    false
}

/// `key=value` lines of `nvmesh.conf`; values keep any `=` after the first
pub fn parse_conf(conf: &str) -> BTreeMap<String, String> {
    conf.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

pub fn render_conf(conf: &BTreeMap<String, String>) -> String {
    conf.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn quoted(value: &str) -> String {
    format!("\"{value}\"")
}

/// Stateful set pod addresses of every management replica
pub fn management_servers(cluster: &NVMesh) -> String {
    let namespace = cluster.namespace().unwrap_or_default();
    (0..cluster.spec.management.replicas)
        .map(|i| {
            format!("nvmesh-management-{i}.nvmesh-management-ws.{namespace}.svc.cluster.local:4001")
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn init_config_map(cluster: &NVMesh, obj: &mut DynamicObject) -> Result<()> {
    let core = &cluster.spec.core;
    let file_server = cluster.spec.operator.file_server.clone().unwrap_or_default();

    with_typed::<ConfigMap, _>(obj, |cm| {
        let data = cm.data.get_or_insert_with(BTreeMap::new);

        let address = if file_server.address.is_empty() {
            DEFAULT_FILE_SERVER_ADDRESS.to_string()
        } else {
            file_server.address.clone()
        };
        data.insert(FILE_SERVER_ADDRESS_KEY.to_string(), address);
        data.insert(
            FILE_SERVER_SKIP_CERT_KEY.to_string(),
            file_server.skip_check_certificate.to_string(),
        );

        let mut conf = parse_conf(data.get(NVMESH_CONF_KEY).map(String::as_str).unwrap_or_default());
        conf.insert("MANAGEMENT_SERVERS".to_string(), quoted(&management_servers(cluster)));

        if core.tcp_only {
            conf.insert("IPV4_ONLY".to_string(), quoted("Yes"));
            conf.insert("TCP_ENABLED".to_string(), quoted("Yes"));
            conf.insert("CONFIGURED_NICS".to_string(), quoted(&core.configured_nics));
        }
        if core.azure_optimized {
            conf.insert("CLOUD_OPTIMIZED".to_string(), quoted("Yes"));
            // NVMe SMART queries are slow on Azure
            conf.insert("TOMA_CLOUD_MODE".to_string(), quoted("Yes"));
            conf.insert("AGENT_CLOUD_MODE".to_string(), quoted("Yes"));
        }

        data.insert(NVMESH_CONF_KEY.to_string(), render_conf(&conf));
        Ok(())
    })
}
