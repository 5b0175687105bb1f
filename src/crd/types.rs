//! Shared types for the NVMesh CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE_REGISTRY: &str = "registry.excelero.com";
pub const DEFAULT_FILE_SERVER_ADDRESS: &str = "https://repo.excelero.com/nvmesh/operator_binaries";

/// NVMesh core storage node daemons (MCS/agent, target and client drivers)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NVMeshCore {
    /// NVMesh core software version, exported to the containers as NVMESH_VERSION
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub image_registry: String,

    #[serde(default)]
    pub image_version_tag: String,

    #[serde(default)]
    pub disabled: bool,

    /// Comma separated NICs used when running over TCP only
    #[serde(default, rename = "configuredNICs", skip_serializing_if = "String::is_empty")]
    pub configured_nics: String,

    #[serde(default)]
    pub tcp_only: bool,

    #[serde(default)]
    pub azure_optimized: bool,
}

/// MongoDB backing the management servers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoDBCluster {
    /// MongoDB is deployed outside of the operator; `address` must be set
    #[serde(default)]
    pub external: bool,

    /// Deploy MongoDB through the MongoDB community operator
    #[serde(default)]
    pub use_operator: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub data_volume_claim: Option<PersistentVolumeClaimSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NVMeshManagement {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub image_registry: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default, rename = "mongoDB")]
    pub mongo_db: MongoDBCluster,

    /// External IPs of the management GUI service
    #[serde(default, rename = "externalIPs", skip_serializing_if = "Vec::is_empty")]
    pub external_ips: Vec<String>,

    #[serde(default, rename = "noSSL")]
    pub no_ssl: bool,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub backups_volume_claim: Option<PersistentVolumeClaimSpec>,

    #[serde(default)]
    pub disable_auto_format_drives: bool,

    #[serde(default)]
    pub disable_auto_evict_missing_drives: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NVMeshCsi {
    #[serde(default)]
    pub controller_replicas: i32,

    #[serde(default)]
    pub version: String,

    /// Registry of the CSI driver image, defaults to `excelero`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_registry: String,

    #[serde(default)]
    pub disabled: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorFileServerSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default)]
    pub skip_check_certificate: bool,
}

/// Knobs consumed by the operator itself rather than the deployed components
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NVMeshOperatorSpec {
    #[serde(default)]
    pub ignore_volume_attachment_on_delete: bool,

    #[serde(default)]
    pub ignore_persistent_volumes_on_delete: bool,

    /// Remove the finalizer without running the uninstall jobs
    #[serde(default)]
    pub skip_uninstall: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_server: Option<OperatorFileServerSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugOptions {
    #[serde(default)]
    pub image_pull_policy_always: bool,

    #[serde(default)]
    pub containers_keep_running_after_failure: bool,

    #[serde(default)]
    pub collect_logs_jobs_run_forever: bool,

    /// Log the pods of jobs the operator is waiting on
    #[serde(default)]
    pub debug_jobs: bool,
}

/// A one-shot operation requested by the user, e.g. `collect-logs`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAction {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

impl ClusterAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// Progress of a single stage in the actions ledger
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TaskState {
    /// Never persisted; absence of a ledger entry reads as this value
    #[default]
    NotStarted,
    TaskStarted,
    TaskFinished,
}

/// Operation name -> stage key -> state
pub type ActionsLedger = BTreeMap<String, BTreeMap<String, TaskState>>;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReconcileState {
    #[default]
    Success,
    Failure,
}

/// Outcome of the latest reconcile cycle; `last_update` drives the error backoff
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStatus {
    /// RFC3339 timestamp of the latest status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,

    /// Error text of the latest failed cycle; empty after a success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReconcileState>,
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
