//! Node Manager
//!
//! Slave-side reactor for one device on one member. Watches the device's
//! operational record and keeps the local actor's proxy mount point in step
//! with it:
//! - record deleted, or not `connected` → unregister
//! - `connected` and owned by this member → unregister (the owner mounts
//!   the live session directly)
//! - `connected` and owned elsewhere → ask the owner's master actor, found
//!   through the actor directory in whichever process runs it, for a mount
//!   point, retrying with backoff until it answers
//!
//! A new connection generation (host, port or owner) unregisters the old
//! mount before the new one is requested.

use super::TopologySetup;
use crate::actors::device::{AskForMasterMountPoint, UnregisterSlaveMountPoint};
use crate::actors::DeviceActor;
use crate::observability::RetryTracker;
use crate::proxy::MasterHandle;
use fleetmount_core::datastore::{DataTreeChange, Modification};
use fleetmount_core::{DeviceError, LogicalStore, MountKey, NodeStatus};
use kameo::actor::ActorRef;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub struct NodeManager {
    actor: ActorRef<DeviceActor>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NodeManager {
    pub fn spawn(setup: Arc<TopologySetup>, actor: ActorRef<DeviceActor>) -> Self {
        let cancel = CancellationToken::new();
        let reactor = Reactor {
            setup,
            actor: actor.clone(),
            cancel: cancel.clone(),
            current: None,
            request: None,
        };
        Self {
            actor,
            cancel,
            task: Some(tokio::spawn(reactor.run())),
        }
    }

    /// Stops watching, cancels pending mount requests and unregisters the
    /// local mount point. Idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "Node manager task panicked");
        }
        if let Err(e) = self.actor.tell(UnregisterSlaveMountPoint).send().await {
            debug!(error = %e, "Slave actor gone before unregistering");
        }
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Reactor {
    setup: Arc<TopologySetup>,
    actor: ActorRef<DeviceActor>,
    cancel: CancellationToken,
    /// Generation the local mount was requested for.
    current: Option<MountKey>,
    /// Cancels the in-flight mount request.
    request: Option<CancellationToken>,
}

impl Reactor {
    async fn run(mut self) {
        let key = self.setup.node_key();
        let data_store = self.setup.services().data_store.clone();

        let mut changes = match data_store.watch(LogicalStore::Operational, &key).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(device = %self.setup.device_id(), error = %e, "Failed to watch operational status");
                return;
            }
        };

        match data_store.get(LogicalStore::Operational, &key).await {
            Ok(initial) => self.apply(initial).await,
            Err(e) => warn!(device = %self.setup.device_id(), error = %e, "Failed to read operational status"),
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = changes.recv() => {
                    let Some(batch) = batch else {
                        debug!(device = %self.setup.device_id(), "Operational watch closed");
                        break;
                    };
                    // Only the last change to this exact key matters.
                    let last = batch
                        .into_iter()
                        .filter(|change| change.key == key)
                        .last();
                    if let Some(DataTreeChange { modification, .. }) = last {
                        let value = match modification {
                            Modification::Write(value) => Some(value),
                            Modification::Delete => None,
                        };
                        self.apply(value).await;
                    }
                }
            }
        }

        self.cancel_request();
    }

    async fn apply(&mut self, value: Option<Value>) {
        let status = match value.map(serde_json::from_value::<NodeStatus>).transpose() {
            Ok(status) => status,
            Err(e) => {
                warn!(device = %self.setup.device_id(), error = %e, "Ignoring malformed operational status");
                return;
            }
        };

        let wanted = status
            .as_ref()
            .and_then(NodeStatus::mount_key)
            .filter(|key| &key.master != self.setup.member());

        if wanted == self.current {
            trace!(device = %self.setup.device_id(), "Operational status unchanged for mounting");
            return;
        }

        if self.current.take().is_some() {
            self.unregister().await;
        }

        let Some(key) = wanted else {
            // Not connected, or owned here. Make sure no stale proxy survives.
            self.unregister().await;
            return;
        };

        info!(
            device = %self.setup.device_id(),
            master = %key.master,
            address = %format!("{}:{}", key.host, key.port),
            "Requesting slave mount point"
        );
        self.current = Some(key.clone());
        self.request_mount(key);
    }

    async fn unregister(&mut self) {
        self.cancel_request();
        if let Err(e) = self.actor.tell(UnregisterSlaveMountPoint).send().await {
            debug!(device = %self.setup.device_id(), error = %e, "Slave actor gone before unregistering");
        }
    }

    fn cancel_request(&mut self) {
        if let Some(request) = self.request.take() {
            request.cancel();
        }
    }

    fn request_mount(&mut self, key: MountKey) {
        self.cancel_request();
        let cancel = self.cancel.child_token();
        self.request = Some(cancel.clone());

        let setup = self.setup.clone();
        tokio::spawn(async move {
            let mut tracker = RetryTracker::new(setup.services().mount_retry.clone());
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = ask_for_mount_point(&setup, &key) => result,
                };
                let error = match result {
                    Ok(()) => {
                        debug!(device = %setup.device_id(), master = %key.master, "Master accepted mount request");
                        return;
                    }
                    Err(e) => e,
                };

                let Some(delay) = tracker.record_failure() else {
                    warn!(device = %setup.device_id(), master = %key.master, error = %error, "Giving up on mount request");
                    return;
                };
                debug!(
                    device = %setup.device_id(),
                    master = %key.master,
                    error = %error,
                    retry_in = ?delay,
                    "Mount request failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
    }
}

async fn ask_for_mount_point(setup: &TopologySetup, key: &MountKey) -> Result<(), DeviceError> {
    let device = setup.device_id();
    let owner = setup
        .services()
        .directory
        .lookup(&key.master, &device.name)
        .await
        .ok_or_else(|| DeviceError::MasterUnreachable {
            device: device.to_string(),
            reason: format!("no actor for {} on {}", device.name, key.master),
        })?;

    let handle = MasterHandle::new(device.clone(), owner, setup.ask_timeout());
    let request = AskForMasterMountPoint {
        slave: setup.member().clone(),
    };
    handle.ask("mount-request", request).await
}
