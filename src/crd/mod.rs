//! Custom Resource Definitions for the NVMesh operator

mod nvmesh;
pub mod types;

#[cfg(test)]
mod tests;

pub use nvmesh::{NVMesh, NVMeshSpec, NVMeshStatus, SpecValidationError};
pub use types::*;
