//! Process-wide operator settings, populated from the command line

use std::path::PathBuf;

/// Defaults of the `run` subcommand flags
pub const DEFAULT_RESOURCES_DIR: &str = "resources";
pub const DEFAULT_CORE_IMAGE_TAG: &str = "tag-not-set";

#[derive(Clone, Debug)]
pub struct OperatorOptions {
    /// Root of the per-component manifest templates
    pub resources_dir: PathBuf,

    /// Core image tag used when `spec.core.imageVersionTag` is empty
    pub default_core_image_tag: String,

    /// Running on OpenShift; SecurityContextConstraints are served
    pub openshift: bool,

    /// The operator runs outside the cluster and reaches MongoDB on localhost
    pub development: bool,

    /// Restrict the watch to one namespace
    pub namespace: Option<String>,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            resources_dir: PathBuf::from(DEFAULT_RESOURCES_DIR),
            default_core_image_tag: DEFAULT_CORE_IMAGE_TAG.to_string(),
            openshift: false,
            development: false,
            namespace: None,
        }
    }
}
