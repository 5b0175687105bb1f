//! nvmesh-operator: Kubernetes operator for NVMesh storage clusters
//!
//! Deploys the NVMesh core daemons, the management servers with their
//! MongoDB and the CSI driver, and keeps them converged with the `NVMesh`
//! custom resource.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};
