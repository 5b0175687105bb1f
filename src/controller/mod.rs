//! Controller module for NVMesh reconciliation
//! This module contains the control loop, the component drivers and the
//! resumable operations (actions and uninstall) it drives.

pub mod actions;
pub mod collect_logs;
pub mod components;
pub mod conditions;
pub mod database;
pub mod events;
pub mod finalizers;
pub mod jobs;
pub mod manifests;
pub mod node_labels;
pub mod options;
pub mod outcome;
pub mod prerequisites;
mod reconciler;
pub mod resources;
#[cfg(test)]
mod resources_test;
pub mod status;
pub mod store;
pub mod tasks;
#[cfg(test)]
pub(crate) mod test_support;
pub mod uninstall;
pub mod watchers;

pub use finalizers::CLUSTER_FINALIZER;
pub use options::OperatorOptions;
pub use outcome::Outcome;
pub use reconciler::{error_policy, reconcile, reconcile_cluster, run_controller, ControllerState};
pub use store::{KubeStore, ObjectStore};
