//! NVMesh Custom Resource Definition
//!
//! One NVMesh object describes a whole storage cluster: the core daemons on
//! every storage node, the management servers with their MongoDB, and the
//! CSI driver.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ActionsLedger, ClusterAction, Condition, DebugOptions, NVMeshCore, NVMeshCsi,
    NVMeshManagement, NVMeshOperatorSpec, ReconcileStatus, DEFAULT_IMAGE_REGISTRY,
};

/// Structured validation error for `NVMeshSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.message, self.field, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "nvmesh.excelero.com",
    version = "v1",
    kind = "NVMesh",
    plural = "nvmeshes",
    namespaced,
    status = "NVMeshStatus",
    shortname = "nvm",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reconcile","type":"string","jsonPath":".status.reconcileStatus.status"}"#,
    printcolumn = r#"{"name":"Web UI","type":"string","jsonPath":".status.WebUIURL"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NVMeshSpec {
    #[serde(default)]
    pub core: NVMeshCore,

    #[serde(default)]
    pub management: NVMeshManagement,

    #[serde(default)]
    pub csi: NVMeshCsi,

    #[serde(default)]
    pub operator: NVMeshOperatorSpec,

    #[serde(default)]
    pub debug: DebugOptions,

    /// One-shot operations, processed in order and removed once complete
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ClusterAction>,
}

impl NVMeshSpec {
    /// Fill in the fields the user left empty. Applied in memory on every cycle.
    pub fn apply_defaults(&mut self, default_core_image_tag: &str) {
        if self.core.image_registry.is_empty() {
            self.core.image_registry = DEFAULT_IMAGE_REGISTRY.to_string();
        }
        if self.core.image_version_tag.is_empty() {
            self.core.image_version_tag = default_core_image_tag.to_string();
        }
        if self.management.image_registry.is_empty() {
            self.management.image_registry = DEFAULT_IMAGE_REGISTRY.to_string();
        }
        if self.csi.controller_replicas == 0 {
            self.csi.controller_replicas = 1;
        }
        if self.management.replicas == 0 {
            self.management.replicas = 1;
        }
    }

    /// Cross-field rules the OpenAPI schema cannot express
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        let mongo = &self.management.mongo_db;

        if mongo.external && mongo.address.is_empty() {
            return Err(SpecValidationError::new(
                "spec.management.mongoDB.address",
                "Missing MongoDB address for externally deployed MongoDB cluster.",
                "When MongoDB is deployed manually its connection address must be set in \
                 spec.management.mongoDB.address, e.g. \"mongo-svc.default.svc.cluster.local:27017\"",
            ));
        }

        if mongo.external && mongo.use_operator {
            return Err(SpecValidationError::new(
                "spec.management.mongoDB.useOperator",
                "MongoDB cannot be both external and operator-managed.",
                "Use mongoDB.external with mongoDB.address for an existing MongoDB cluster, \
                 or mongoDB.useOperator to let the operator deploy one",
            ));
        }

        for (index, action) in self.actions.iter().enumerate() {
            if action.name.is_empty() {
                return Err(SpecValidationError::new(
                    format!("spec.actions[{index}].name"),
                    "Action name must not be empty.",
                    "Set the action name, e.g. \"collect-logs\"",
                ));
            }
            if let Some(bucket) = action.arg("upload-to-s3") {
                if bucket.trim().is_empty() {
                    return Err(SpecValidationError::new(
                        format!("spec.actions[{index}].args.upload-to-s3"),
                        "upload-to-s3 requires a bucket name.",
                        "Set the S3 bucket name as the value of the upload-to-s3 argument",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Address of the management GUI on its first external IP
    pub fn web_ui_url(&self) -> String {
        match self.management.external_ips.first() {
            Some(address) => {
                let protocol = if self.management.no_ssl {
                    "http"
                } else {
                    "https"
                };
                format!("{protocol}://{address}:4000")
            }
            None => String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NVMeshStatus {
    #[serde(default, rename = "WebUIURL", skip_serializing_if = "String::is_empty")]
    pub web_ui_url: String,

    #[serde(default)]
    pub reconcile_status: ReconcileStatus,

    /// `Ready` is `True` after a successful cycle. After a failed one it is
    /// `False` with reason `ReconcileFailed` and the error text as message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Durable stage ledger of actions and of the uninstall sequence
    #[serde(default, skip_serializing_if = "ActionsLedger::is_empty")]
    pub actions_status: ActionsLedger,
}
