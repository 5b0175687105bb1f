//! Node uninstall when a node stops carrying the NVMesh role labels
//!
//! A node that drops both the client and the target label no longer runs
//! NVMesh, so its host is cleaned by an uninstall job. The watch task only
//! diffs labels and sends node names over a channel; a separate task drives
//! the jobs through the shared controller state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{self, UnboundedSender};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::reflector::Store;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::jobs::{self, CLIENT_NODE_LABEL, TARGET_NODE_LABEL};
use super::outcome::Outcome;
use super::reconciler::ControllerState;
use super::uninstall::{uninstall_job_name, uninstall_node_job};
use crate::crd::NVMesh;
use crate::error::Result;

const JOB_POLL: Duration = Duration::from_secs(3);

fn has_role(labels: &BTreeMap<String, String>) -> bool {
    labels.contains_key(CLIENT_NODE_LABEL) || labels.contains_key(TARGET_NODE_LABEL)
}

/// `old` carried a role label and `new` carries none
pub fn left_cluster(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> bool {
    has_role(old) && !has_role(new)
}

/// Last seen labels per node
#[derive(Default)]
pub struct NodeLabelTracker {
    labels: HashMap<String, BTreeMap<String, String>>,
}

impl NodeLabelTracker {
    /// Record the node; true when this update took away its last role label
    pub fn observe(&mut self, node: &Node) -> bool {
        let current = node.labels().clone();
        let left = self
            .labels
            .get(&node.name_any())
            .is_some_and(|previous| left_cluster(previous, &current));
        self.labels.insert(node.name_any(), current);
        left
    }

    pub fn forget(&mut self, node: &Node) {
        self.labels.remove(&node.name_any());
    }
}

/// Send the name of every node that leaves the cluster to `departures`
pub async fn forward_departures<S>(events: S, departures: UnboundedSender<String>)
where
    S: Stream<Item = std::result::Result<watcher::Event<Node>, watcher::Error>>,
{
    let mut tracker = NodeLabelTracker::default();
    let mut events = std::pin::pin!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                if !tracker.observe(&node) {
                    continue;
                }
                info!("NVMesh client and target labels removed from node {}", node.name_any());
                if departures.unbounded_send(node.name_any()).is_err() {
                    break;
                }
            }
            Ok(watcher::Event::Delete(node)) => {
                debug!("Node {} deleted", node.name_any());
                tracker.forget(&node);
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => warn!("Node watch failed: {}", e),
        }
    }
}

/// The live cluster whose namespace and images the node uninstall uses
pub fn uninstalling_cluster(clusters: &[Arc<NVMesh>], default_core_image_tag: &str) -> Option<NVMesh> {
    let mut live: Vec<&Arc<NVMesh>> = clusters
        .iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .collect();
    live.sort_by_key(|c| (c.namespace(), c.name_any()));

    let mut cluster = NVMesh::clone(live.first()?);
    cluster.spec.apply_defaults(default_core_image_tag);
    Some(cluster)
}

/// One step of a node uninstall: `Done` once its job finished and was removed
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn uninstall_node(ctx: &ControllerState, cluster: &NVMesh, node: &str) -> Result<Outcome> {
    let name = uninstall_job_name(node);
    jobs::ensure_job(ctx, cluster, &uninstall_node_job(cluster, node)).await?;

    let outcome = jobs::wait_for_job(ctx, cluster, &name, JOB_POLL).await?;
    if outcome.is_done() {
        jobs::delete_job(ctx, cluster, &name).await?;
        info!("Node {} uninstalled", node);
    }
    Ok(outcome)
}

async fn drive_uninstall(ctx: Arc<ControllerState>, cluster: NVMesh, node: String) {
    loop {
        match uninstall_node(&ctx, &cluster, &node).await {
            Ok(Outcome::Done) => return,
            Ok(Outcome::RequeueAfter(delay)) => tokio::time::sleep(delay).await,
            Err(e) if e.is_retriable() => {
                warn!("Uninstall of node {} interrupted: {}", node, e);
                tokio::time::sleep(JOB_POLL).await;
            }
            Err(e) => {
                warn!("Failed to uninstall node {}: {}", node, e);
                if let Err(e) = jobs::delete_job(&ctx, &cluster, &uninstall_job_name(&node)).await {
                    warn!("Failed to delete uninstall job of node {}: {}", node, e);
                }
                return;
            }
        }
    }
}

/// Watch node labels and uninstall the nodes that leave the NVMesh cluster
pub fn spawn_node_listener(
    client: Client,
    clusters: Store<NVMesh>,
    ctx: Arc<ControllerState>,
) -> JoinHandle<()> {
    let nodes: Api<Node> = Api::all(client);
    let events = watcher(nodes, watcher::Config::default()).default_backoff();
    let (departures, mut departed) = mpsc::unbounded();

    tokio::spawn(async move {
        let dispatch = async move {
            while let Some(node) = departed.next().await {
                let Some(cluster) =
                    uninstalling_cluster(&clusters.state(), &ctx.options.default_core_image_tag)
                else {
                    warn!("Node {} left, but there is no NVMesh cluster to uninstall it with", node);
                    continue;
                };
                tokio::spawn(drive_uninstall(ctx.clone(), cluster, node));
            }
        };
        futures::join!(forward_departures(events, departures), dispatch);
    })
}
