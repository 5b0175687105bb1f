//! Deletion guard of the NVMesh cluster object
//!
//! The finalizer token keeps the object around until the uninstall sequence
//! has torn the cluster down. Deletion is refused while NVMesh volumes are
//! still attached or provisioned, unless the matching ignore flag is set.

use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::outcome::Outcome;
use super::reconciler::ControllerState;
use super::store::{from_dynamic, gvk_of};
use super::uninstall::uninstall_cluster;
use crate::crd::NVMesh;
use crate::error::{Error, Result};

pub const CLUSTER_FINALIZER: &str = "cluster.finalizers.nvmesh.excelero.com";
pub const CSI_DRIVER_NAME: &str = "nvmesh-csi.excelero.com";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// Not being deleted; carry on with the reconcile cycle
    Continue,
    /// Uninstall still in flight
    Requeue(Duration),
    /// Deleted or about to be; nothing else to do
    Stop,
}

pub fn has_finalizer(cluster: &NVMesh) -> bool {
    cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
}

fn is_deleting(cluster: &NVMesh) -> bool {
    cluster.metadata.deletion_timestamp.is_some()
}

async fn persist_metadata(ctx: &ControllerState, cluster: &mut NVMesh) -> Result<()> {
    let stored = ctx.store.replace_cluster(cluster).await?;
    cluster.metadata = stored.metadata;
    Ok(())
}

/// Describe the NVMesh volume attachments, `None` when there are none
pub fn describe_attachments(attachments: &[VolumeAttachment]) -> Option<String> {
    let ours: Vec<_> = attachments
        .iter()
        .filter(|va| {
            va.spec.attacher == CSI_DRIVER_NAME
                && va.status.as_ref().is_some_and(|s| s.attached)
        })
        .collect();
    if ours.is_empty() {
        return None;
    }

    let details: Vec<String> = ours
        .iter()
        .map(|va| {
            format!(
                "pvc: {} on node: {}",
                va.spec.source.persistent_volume_name.as_deref().unwrap_or_default(),
                va.spec.node_name
            )
        })
        .collect();
    Some(format!(
        "Found {} attachments: {}",
        ours.len(),
        details.join(", ")
    ))
}

/// Describe the persistent volumes provisioned by the NVMesh CSI driver
pub fn describe_persistent_volumes(volumes: &[PersistentVolume]) -> Option<String> {
    let names: Vec<String> = volumes
        .iter()
        .filter(|pv| {
            pv.spec
                .as_ref()
                .and_then(|s| s.csi.as_ref())
                .is_some_and(|csi| csi.driver == CSI_DRIVER_NAME)
        })
        .map(|pv| pv.name_any())
        .collect();
    if names.is_empty() {
        return None;
    }
    Some(format!(
        "Found {} NVMesh PersistentVolumes: {}",
        names.len(),
        names.join(", ")
    ))
}

async fn verify_no_volume_attachments(ctx: &ControllerState) -> Result<()> {
    let attachments = ctx
        .store
        .list(&gvk_of::<VolumeAttachment>(), None, "")
        .await?
        .iter()
        .map(from_dynamic)
        .collect::<Result<Vec<VolumeAttachment>>>()?;

    match describe_attachments(&attachments) {
        Some(found) => Err(Error::DeletionBlocked(format!(
            "Cannot delete NVMesh cluster while volumes are attached. {found}"
        ))),
        None => Ok(()),
    }
}

async fn verify_no_persistent_volumes(ctx: &ControllerState) -> Result<()> {
    let volumes = ctx
        .store
        .list(&gvk_of::<PersistentVolume>(), None, "")
        .await?
        .iter()
        .map(from_dynamic)
        .collect::<Result<Vec<PersistentVolume>>>()?;

    match describe_persistent_volumes(&volumes) {
        Some(found) => Err(Error::DeletionBlocked(format!(
            "Cannot delete NVMesh cluster while NVMesh PersistentVolumes are provisioned. {found}"
        ))),
        None => Ok(()),
    }
}

/// Add the finalizer to live clusters; uninstall and release deleted ones
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn handle_finalizer(cluster: &mut NVMesh, ctx: &ControllerState) -> Result<FinalizerOutcome> {
    if !is_deleting(cluster) {
        if !has_finalizer(cluster) {
            cluster.finalizers_mut().push(CLUSTER_FINALIZER.to_string());
            persist_metadata(ctx, cluster).await?;
            info!("Added finalizer to {}", cluster.name_any());
        }
        return Ok(FinalizerOutcome::Continue);
    }

    if !has_finalizer(cluster) {
        return Ok(FinalizerOutcome::Stop);
    }

    let operator = &cluster.spec.operator;
    if !operator.ignore_volume_attachment_on_delete {
        verify_no_volume_attachments(ctx).await?;
    }
    if !operator.ignore_persistent_volumes_on_delete {
        verify_no_persistent_volumes(ctx).await?;
    }

    if let Outcome::RequeueAfter(delay) = uninstall_cluster(cluster, ctx).await? {
        match ctx.store.replace_cluster_status(cluster).await {
            Ok(stored) => cluster.metadata = stored.metadata,
            Err(e) => warn!("Failed to persist uninstall progress: {}", e),
        }
        return Ok(FinalizerOutcome::Requeue(delay));
    }

    cluster.finalizers_mut().retain(|f| f != CLUSTER_FINALIZER);
    persist_metadata(ctx, cluster).await?;
    info!("Removed finalizer from {}", cluster.name_any());
    Ok(FinalizerOutcome::Stop)
}
