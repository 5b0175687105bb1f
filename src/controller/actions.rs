//! Dispatch of the one-shot operations listed in `spec.actions`
//!
//! Actions run one at a time, in the order they are listed. An action stays
//! in `spec.actions` until its handler reports completion; its stage ledger in
//! `status.actionsStatus` is garbage-collected on the cycle after removal.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::collect_logs::{CollectLogsAction, COLLECT_LOGS_ACTION};
use super::outcome::Outcome;
use super::reconciler::ControllerState;
use super::uninstall::UNINSTALL_OPERATION;
use crate::crd::{ClusterAction, NVMesh};
use crate::error::{Error, Result};

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// `Outcome::Done` once the action finished and may be removed
    async fn handle(
        &self,
        action: &ClusterAction,
        cluster: &mut NVMesh,
        ctx: &ControllerState,
    ) -> Result<Outcome>;
}

/// Handler registered for an action name
pub fn handler(name: &str) -> Option<&'static dyn ActionHandler> {
    match name {
        COLLECT_LOGS_ACTION => Some(&CollectLogsAction),
        _ => None,
    }
}

pub fn has_pending_actions(cluster: &NVMesh) -> bool {
    !cluster.spec.actions.is_empty()
}

/// Run the first listed action; remove it from `spec.actions` once it completes
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn handle_actions(cluster: &mut NVMesh, ctx: &ControllerState) -> Result<Outcome> {
    let Some(action) = cluster.spec.actions.first().cloned() else {
        return Ok(Outcome::Done);
    };
    let handler = handler(&action.name).ok_or_else(|| Error::UnknownAction(action.name.clone()))?;

    let outcome = handler.handle(&action, cluster, ctx).await?;
    if !outcome.is_done() {
        return Ok(outcome);
    }

    info!("Action {} completed", action.name);
    cluster.spec.actions.remove(0);
    match ctx.store.replace_cluster(cluster).await {
        Ok(stored) => cluster.metadata = stored.metadata,
        // still listed in the stored spec; the finished ledger makes the rerun a no-op
        Err(e) => warn!("Failed to remove completed action {}: {}", action.name, e),
    }
    Ok(Outcome::Done)
}

/// Drop ledger entries whose action is no longer listed
///
/// The uninstall ledger is kept; it belongs to the deletion path, not to an
/// action. Returns whether anything was removed.
pub fn remove_stale_ledger_entries(cluster: &mut NVMesh) -> bool {
    let listed: Vec<String> = cluster.spec.actions.iter().map(|a| a.name.clone()).collect();
    let Some(status) = cluster.status.as_mut() else {
        return false;
    };

    let before = status.actions_status.len();
    status
        .actions_status
        .retain(|operation, _| operation == UNINSTALL_OPERATION || listed.contains(operation));
    let removed = before - status.actions_status.len();
    if removed > 0 {
        info!("Removed {} stale action status entries", removed);
    }
    removed > 0
}
