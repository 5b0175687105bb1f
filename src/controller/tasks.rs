//! Resumable multi-stage operations driven by the actions ledger
//!
//! Each operation (an action such as `collect-logs`, or `uninstall`) owns a
//! ledger entry in `status.actionsStatus` mapping stage keys to their
//! progress. The ledger is persisted with the status, so a stage that
//! finished in an earlier cycle is never run again and a stage that was
//! interrupted is re-entered from its start.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use super::outcome::Outcome;
use super::reconciler::ControllerState;
use crate::crd::{ActionsLedger, NVMesh, TaskState};
use crate::error::Result;

/// Ledger key recording that every stage of an operation finished
pub const OPERATION_COMPLETE_KEY: &str = "ActionComplete";

pub trait Stage: Copy + Debug + Send + Sync + 'static {
    /// Key of the stage in the ledger
    fn key(&self) -> &'static str;
}

/// A fixed, ordered list of stages
///
/// Stage bodies must tolerate being re-entered after a partial run: create
/// only if absent, check before waiting.
#[async_trait]
pub trait Sequence: Send + Sync {
    type Stage: Stage;

    const STAGES: &'static [Self::Stage];

    /// `Outcome::RequeueAfter` leaves the stage unfinished
    async fn run(&self, stage: Self::Stage, cluster: &NVMesh, ctx: &ControllerState)
        -> Result<Outcome>;
}

pub fn stage_state(ledger: &ActionsLedger, operation: &str, key: &str) -> TaskState {
    ledger
        .get(operation)
        .and_then(|stages| stages.get(key))
        .copied()
        .unwrap_or_default()
}

/// Record progress of a stage; a finished stage never goes back
pub fn mark_stage(ledger: &mut ActionsLedger, operation: &str, key: &str, state: TaskState) {
    let stages = ledger.entry(operation.to_string()).or_default();
    let current = stages.get(key).copied().unwrap_or_default();
    if current == TaskState::TaskFinished || state == TaskState::NotStarted {
        return;
    }
    stages.insert(key.to_string(), state);
}

pub fn is_operation_complete(ledger: &ActionsLedger, operation: &str) -> bool {
    stage_state(ledger, operation, OPERATION_COMPLETE_KEY) == TaskState::TaskFinished
}

fn ledger_mut(cluster: &mut NVMesh) -> &mut ActionsLedger {
    &mut cluster.status.get_or_insert_with(Default::default).actions_status
}

fn ledger(cluster: &NVMesh) -> Option<&ActionsLedger> {
    cluster.status.as_ref().map(|s| &s.actions_status)
}

/// Run the stages of `sequence` that have not finished yet, in order
///
/// Returns `Outcome::Done` once the whole operation is complete, or the
/// requeue requested by the stage that is still in flight. An error leaves
/// the failing stage started but unfinished.
pub async fn run_stages<S: Sequence>(
    sequence: &S,
    operation: &str,
    cluster: &mut NVMesh,
    ctx: &ControllerState,
) -> Result<Outcome> {
    if ledger(cluster).is_some_and(|l| is_operation_complete(l, operation)) {
        return Ok(Outcome::Done);
    }

    for stage in S::STAGES {
        let key = stage.key();
        if ledger(cluster).is_some_and(|l| stage_state(l, operation, key) == TaskState::TaskFinished)
        {
            continue;
        }

        debug!("{} {}: running stage {}", cluster.name_any(), operation, key);
        mark_stage(ledger_mut(cluster), operation, key, TaskState::TaskStarted);

        match sequence.run(*stage, cluster, ctx).await? {
            Outcome::RequeueAfter(delay) => {
                info!("{} stage {} not finished, will retry", operation, key);
                return Ok(Outcome::RequeueAfter(delay));
            }
            Outcome::Done => {
                mark_stage(ledger_mut(cluster), operation, key, TaskState::TaskFinished);
                info!("{} stage {} done", operation, key);
            }
        }
    }

    mark_stage(
        ledger_mut(cluster),
        operation,
        OPERATION_COMPLETE_KEY,
        TaskState::TaskFinished,
    );
    Ok(Outcome::Done)
}
