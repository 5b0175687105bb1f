//! Status writes at the end of a reconcile cycle, and the error backoff
//!
//! Backoff needs no attempt counter: a failure that follows another failure
//! waits twice as long as the gap since the previous status write.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{error, info, instrument, warn};

use super::conditions::{
    set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_TYPE_READY,
};
use super::events::EventType;
use super::outcome::Outcome;
use super::reconciler::ControllerState;
use crate::crd::{NVMesh, NVMeshStatus, ReconcileState, ReconcileStatus};
use crate::error::{Error, Result};

pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Fallback when the status itself cannot be written
const STATUS_WRITE_RETRY: Duration = Duration::from_secs(1);
const STATUS_CONFLICT_RETRIES: usize = 5;

/// Delay before retrying a failed cycle, given the status of the previous one
pub fn next_retry_interval(previous: &ReconcileStatus, now: DateTime<Utc>) -> Duration {
    if previous.status != Some(ReconcileState::Failure) {
        return MIN_RETRY_INTERVAL;
    }
    let Some(last_update) = previous
        .last_update
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    else {
        return MIN_RETRY_INTERVAL;
    };

    let since = (now - last_update.with_timezone(&Utc))
        .to_std()
        .unwrap_or_default();
    (since * 2).clamp(MIN_RETRY_INTERVAL, MAX_RETRY_INTERVAL)
}

fn status_mut(cluster: &mut NVMesh) -> &mut NVMeshStatus {
    cluster.status.get_or_insert_with(Default::default)
}

/// Write the status sub-resource, re-reading the object on conflicts
///
/// A cluster that is gone already needs no status.
pub async fn persist_status(ctx: &ControllerState, cluster: &mut NVMesh) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    for _ in 0..STATUS_CONFLICT_RETRIES {
        match ctx.store.replace_cluster_status(cluster).await {
            Ok(stored) => {
                cluster.metadata.resource_version = stored.metadata.resource_version;
                return Ok(());
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_conflict() => {
                warn!("Conflict writing status of {}, retrying", name);
                match ctx.store.get_cluster(&namespace, &name).await? {
                    Some(latest) => cluster.metadata.resource_version = latest.metadata.resource_version,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::ConfigError(format!(
        "status of {name} still conflicting after {STATUS_CONFLICT_RETRIES} attempts"
    )))
}

/// Record a successful cycle and hand back the requested requeue
#[instrument(skip(ctx, cluster), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn manage_success(
    ctx: &ControllerState,
    cluster: &mut NVMesh,
    outcome: Outcome,
    cycle: u64,
) -> Action {
    let generation = cluster.metadata.generation;
    let web_ui_url = cluster.spec.web_ui_url();

    let status = status_mut(cluster);
    status.web_ui_url = web_ui_url;
    status.reconcile_status = ReconcileStatus {
        last_update: Some(Utc::now().to_rfc3339()),
        reason: String::new(),
        status: Some(ReconcileState::Success),
    };
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_TRUE,
        "ReconcileSucceeded",
        "",
        generation,
    );

    if let Err(e) = persist_status(ctx, cluster).await {
        error!("Failed to update status of {}: {}", cluster.name_any(), e);
        return Action::requeue(STATUS_WRITE_RETRY);
    }

    info!(
        "Reconcile Success. Cycle #: {}, Generation: {}",
        cycle,
        generation.unwrap_or_default()
    );
    outcome.into_action()
}

/// Record a failed cycle and compute when to try again
#[instrument(skip(ctx, cluster, err), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn manage_error(ctx: &ControllerState, cluster: &mut NVMesh, err: &Error) -> Action {
    let message = err.to_string();
    error!("Reconcile failed: {}", message);

    if let Err(e) = ctx
        .events
        .publish(cluster, EventType::Warning, "ProcessingError", &message)
        .await
    {
        warn!("Failed to record event: {}", e);
    }

    let now = Utc::now();
    let generation = cluster.metadata.generation;
    let status = status_mut(cluster);
    let retry = next_retry_interval(&status.reconcile_status, now);

    status.reconcile_status = ReconcileStatus {
        last_update: Some(now.to_rfc3339()),
        reason: message.clone(),
        status: Some(ReconcileState::Failure),
    };
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_READY,
        CONDITION_STATUS_FALSE,
        "ReconcileFailed",
        &message,
        generation,
    );

    if let Err(e) = persist_status(ctx, cluster).await {
        error!("Failed to update status of {}: {}", cluster.name_any(), e);
        return Action::requeue(STATUS_WRITE_RETRY);
    }

    info!("Retrying in {:?}", retry);
    Action::requeue(retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn previous(state: ReconcileState, at: DateTime<Utc>) -> ReconcileStatus {
        ReconcileStatus {
            last_update: Some(at.to_rfc3339()),
            reason: String::new(),
            status: Some(state),
        }
    }

    #[test]
    fn test_repeated_failure_doubles_gap() {
        let now = Utc::now();
        let last = previous(ReconcileState::Failure, now - ChronoDuration::seconds(10));
        assert_eq!(next_retry_interval(&last, now), Duration::from_secs(20));
    }

    #[test]
    fn test_fresh_failure_retries_after_one_second() {
        let now = Utc::now();
        let last = previous(ReconcileState::Success, now - ChronoDuration::seconds(600));
        assert_eq!(next_retry_interval(&last, now), Duration::from_secs(1));
        assert_eq!(
            next_retry_interval(&ReconcileStatus::default(), now),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_backoff_capped_at_six_hours() {
        let now = Utc::now();
        let last = previous(ReconcileState::Failure, now - ChronoDuration::hours(5));
        assert_eq!(next_retry_interval(&last, now), MAX_RETRY_INTERVAL);
    }

    #[test]
    fn test_unparseable_timestamp_falls_back() {
        let last = ReconcileStatus {
            last_update: Some("yesterday".to_string()),
            reason: String::new(),
            status: Some(ReconcileState::Failure),
        };
        assert_eq!(next_retry_interval(&last, Utc::now()), MIN_RETRY_INTERVAL);
    }
}
