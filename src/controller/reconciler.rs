//! Control loop of the NVMesh operator
//!
//! One cycle fetches the cluster object, applies defaults, validates it,
//! then walks prerequisites, the finalizer, the component drivers, stale
//! ledger cleanup and pending actions. Every step is safe to re-enter: the
//! loop relies on requeues rather than in-process retries.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::{predicates, watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use super::actions::{handle_actions, has_pending_actions, remove_stale_ledger_entries};
use super::components;
use super::database::{MongoSettingsDatabase, SettingsDatabase};
use super::events::{EventPublisher, KubeEventPublisher};
use super::finalizers::{handle_finalizer, FinalizerOutcome};
use super::node_labels;
use super::options::OperatorOptions;
use super::outcome::Outcome;
use super::prerequisites::ensure_prerequisites;
use super::status::{manage_error, manage_success};
use super::store::{KubeStore, ObjectStore};
use super::watchers::WatcherRegistry;
use crate::crd::NVMesh;
use crate::error::{Error, Result};

/// Requeue that starts a fresh cycle right after the status write
const FRESH_CYCLE: Duration = Duration::from_secs(1);

/// Shared state for the controller
pub struct ControllerState {
    pub store: Arc<dyn ObjectStore>,
    pub database: Arc<dyn SettingsDatabase>,
    pub events: Arc<dyn EventPublisher>,
    pub options: OperatorOptions,
    pub watchers: WatcherRegistry,
    cycles: AtomicU64,
}

impl ControllerState {
    /// The receiver yields clusters whose ad-hoc watched objects changed
    pub fn new(
        store: Arc<dyn ObjectStore>,
        database: Arc<dyn SettingsDatabase>,
        events: Arc<dyn EventPublisher>,
        options: OperatorOptions,
    ) -> (Self, UnboundedReceiver<ObjectRef<NVMesh>>) {
        let (watchers, receiver) = WatcherRegistry::new();
        let state = Self {
            store,
            database,
            events,
            options,
            watchers,
            cycles: AtomicU64::new(0),
        };
        (state, receiver)
    }

    fn next_cycle(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the controller
pub async fn run_controller(client: Client, options: OperatorOptions) -> Result<()> {
    let namespace = options.namespace.clone();
    let clusters: Api<NVMesh> = scoped_api(&client, namespace.as_deref());

    info!("Starting NVMesh controller");

    // Verify CRD exists
    match clusters.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("NVMesh CRD is available"),
        Err(e) => {
            error!("NVMesh CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("NVMesh CRD not installed".to_string()));
        }
    }

    let (state, watch_triggers) = ControllerState::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(MongoSettingsDatabase),
        Arc::new(KubeEventPublisher::new(client.clone())),
        options,
    );
    let state = Arc::new(state);

    // only spec changes (generation bumps) of the cluster object trigger a cycle
    let (reader, writer) = reflector::store();
    let stream = watcher(clusters, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    // nodes that lose their NVMesh labels are uninstalled on the side
    let node_listener = node_labels::spawn_node_listener(client.clone(), reader.clone(), state.clone());

    let ns = namespace.as_deref();
    Controller::for_stream(stream, reader)
        // Watch owned resources for changes
        .owns::<StatefulSet>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<DaemonSet>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<Deployment>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<Service>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<ConfigMap>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<ServiceAccount>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<Role>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<RoleBinding>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<Job>(scoped_api(&client, ns), watcher::Config::default())
        .reconcile_on(watch_triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    node_listener.abort();
    Ok(())
}

/// The main reconciliation function
///
/// Called whenever the NVMesh spec changes, an owned object changes, a
/// watched object changes or the requeue timer expires.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile(obj: Arc<NVMesh>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();

    let Some(cluster) = ctx.store.get_cluster(&namespace, &name).await? else {
        debug!("NVMesh {}/{} is gone, nothing to do", namespace, name);
        return Ok(Action::await_change());
    };

    Ok(reconcile_cluster(cluster, &ctx).await)
}

/// One reconcile cycle on a freshly read cluster object
pub async fn reconcile_cluster(mut cluster: NVMesh, ctx: &ControllerState) -> Action {
    let cycle = ctx.next_cycle();
    info!(
        "Reconciling NVMesh {}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    );

    cluster
        .spec
        .apply_defaults(&ctx.options.default_core_image_tag);

    if let Err(e) = cluster.spec.validate() {
        warn!("Validation failed for {}: {}", cluster.name_any(), e);
        return manage_error(ctx, &mut cluster, &Error::ValidationError(e.to_string())).await;
    }

    let stopped = ctx.watchers.stop_for(&ObjectRef::from_obj(&cluster));
    if stopped > 0 {
        debug!("Stopped {} watch listeners", stopped);
    }

    if let Err(e) = ensure_prerequisites(ctx, &cluster).await {
        return manage_error(ctx, &mut cluster, &e).await;
    }

    match handle_finalizer(&mut cluster, ctx).await {
        Ok(FinalizerOutcome::Continue) => {}
        Ok(FinalizerOutcome::Stop) => return Action::await_change(),
        Ok(FinalizerOutcome::Requeue(delay)) => {
            return manage_success(ctx, &mut cluster, Outcome::RequeueAfter(delay), cycle).await
        }
        Err(e) => return manage_error(ctx, &mut cluster, &e).await,
    }

    let (outcome, errors) = reconcile_components(&cluster, ctx).await;
    if let Some(first) = errors.first() {
        return manage_error(ctx, &mut cluster, first).await;
    }
    if !outcome.is_done() {
        return manage_success(ctx, &mut cluster, outcome, cycle).await;
    }

    if remove_stale_ledger_entries(&mut cluster) {
        return manage_success(ctx, &mut cluster, Outcome::RequeueAfter(FRESH_CYCLE), cycle).await;
    }

    if has_pending_actions(&cluster) {
        match handle_actions(&mut cluster, ctx).await {
            Ok(Outcome::Done) => {}
            Ok(outcome) => return manage_success(ctx, &mut cluster, outcome, cycle).await,
            Err(e) => return manage_error(ctx, &mut cluster, &e).await,
        }
    }

    manage_success(ctx, &mut cluster, Outcome::Done, cycle).await
}

/// Run every driver; collect all errors and the shortest requeue
async fn reconcile_components(cluster: &NVMesh, ctx: &ControllerState) -> (Outcome, Vec<Error>) {
    let mut outcome = Outcome::Done;
    let mut errors = Vec::new();

    for component in components::all() {
        match component.reconcile(cluster, ctx).await {
            Ok(result) => outcome = outcome.merge(result),
            Err(e) => {
                error!("Component {} failed: {}", component.name(), e);
                errors.push(e);
            }
        }
    }
    (outcome, errors)
}

/// Error policy for the controller
pub fn error_policy(node: Arc<NVMesh>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", node.name_any(), error);

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
