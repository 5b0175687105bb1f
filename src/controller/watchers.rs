//! Ad-hoc watches on objects the controller does not own directly
//!
//! Listeners never touch cluster state. They only push the owning NVMesh
//! reference into the channel the controller consumes via `reconcile_on`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crd::NVMesh;
use crate::error::Result;

type Handles = HashMap<ObjectRef<NVMesh>, Vec<JoinHandle<()>>>;

/// Watch listeners grouped by the NVMesh object that registered them
pub struct WatcherRegistry {
    handles: Mutex<Handles>,
    trigger: UnboundedSender<ObjectRef<NVMesh>>,
}

impl WatcherRegistry {
    /// The receiver yields the owners whose watched objects changed
    pub fn new() -> (Self, UnboundedReceiver<ObjectRef<NVMesh>>) {
        let (trigger, receiver) = mpsc::unbounded();
        let registry = Self {
            handles: Mutex::new(HashMap::new()),
            trigger,
        };
        (registry, receiver)
    }

    fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a listener on `stream` on behalf of `owner`
    pub fn register(
        &self,
        owner: ObjectRef<NVMesh>,
        mut stream: BoxStream<'static, Result<DynamicObject>>,
    ) {
        let trigger = self.trigger.clone();
        let target = owner.clone();

        let handle = tokio::spawn(async move {
            // the first event is the state at registration time
            let mut last_seen: Option<Option<String>> = None;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(obj) => {
                        let version = obj.metadata.resource_version.clone();
                        let changed = matches!(&last_seen, Some(seen) if *seen != version);
                        last_seen = Some(version);
                        if !changed {
                            continue;
                        }
                        debug!(
                            "Watched object {} changed, requesting reconcile of {}",
                            obj.name_any(),
                            target
                        );
                        if trigger.unbounded_send(target.clone()).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Watch on behalf of {} failed: {}", target, e),
                }
            }
        });

        self.handles().entry(owner).or_default().push(handle);
    }

    /// Abort every listener registered by `owner`; returns how many were stopped
    pub fn stop_for(&self, owner: &ObjectRef<NVMesh>) -> usize {
        let stopped = self.handles().remove(owner).unwrap_or_default();
        for handle in &stopped {
            handle.abort();
        }
        if !stopped.is_empty() {
            debug!("Stopped {} watchers of {}", stopped.len(), owner);
        }
        stopped.len()
    }

    pub fn active(&self, owner: &ObjectRef<NVMesh>) -> usize {
        self.handles().get(owner).map(Vec::len).unwrap_or(0)
    }
}

impl Drop for WatcherRegistry {
    fn drop(&mut self) {
        for handle in self.handles().values().flatten() {
            handle.abort();
        }
    }
}
