//! Remote Device Connector
//!
//! Owner-side session lifecycle for one device:
//! 1. Publish `connecting`
//! 2. Connect, retrying per the node's reconnect policy
//! 3. Register the session's schema sources and resolve them
//! 4. Initialize the master actor and register the owner-local mount point
//! 5. Publish `connected` with this member as master
//!
//! Exhausted attempts, or a session whose schema does not resolve, publish
//! `unable-to-connect`. `stop` undoes every step that completed.

use super::TopologySetup;
use crate::actors::device::{CreateInitialMasterActorData, DropMasterData};
use crate::actors::DeviceActor;
use crate::mount::{MountPoint, MountRegistration, MountRole};
use crate::observability::{events, RetryPolicy, RetryTracker};
use crate::schema::RegistrationScope;
use async_trait::async_trait;
use fleetmount_core::device::{DeviceSession, SessionHandle};
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{DeviceError, LogicalStore, NodeStatus, SchemaError, SchemaSource, SourceIdentifier};
use kameo::actor::ActorRef;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Schema texts delivered with a session.
struct SessionSchemaSources {
    sources: Vec<SchemaSource>,
}

#[async_trait]
impl SchemaSourceProvider for SessionSchemaSources {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
        self.sources
            .iter()
            .find(|source| &source.id == id)
            .cloned()
            .ok_or_else(|| SchemaError::MissingSource(id.clone()))
    }
}

/// What a successful connection left behind.
struct LiveSession {
    handle: Box<dyn SessionHandle>,
    scope: RegistrationScope,
    mount: MountRegistration,
}

pub struct RemoteDeviceConnector {
    setup: Arc<TopologySetup>,
    master: ActorRef<DeviceActor>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    live: Arc<Mutex<Option<LiveSession>>>,
}

impl RemoteDeviceConnector {
    /// Starts connecting in the background.
    pub fn start(setup: Arc<TopologySetup>, master: ActorRef<DeviceActor>) -> Self {
        let cancel = CancellationToken::new();
        let live = Arc::new(Mutex::new(None));
        let task = tokio::spawn(connect_device(
            setup.clone(),
            master.clone(),
            cancel.clone(),
            live.clone(),
        ));
        Self {
            setup,
            master,
            cancel,
            task: Some(task),
            live,
        }
    }

    /// Stops connecting, closes the session and withdraws everything it
    /// published. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(device = %self.setup.device_id(), error = %e, "Connector task panicked");
            }
        } else {
            return;
        }

        let device = self.setup.device_id().clone();
        if let Some(live) = self.live.lock().await.take() {
            live.mount.close();
            live.scope.close();
            if let Err(e) = self.master.ask(DropMasterData).send().await {
                debug!(device = %device, error = %e, "Master actor gone before dropping data");
            }
            live.handle.close().await;
        }

        let services = self.setup.services();
        if let Err(e) = services
            .data_store
            .delete(LogicalStore::Operational, &self.setup.node_key())
            .await
        {
            warn!(device = %device, error = %e, "Failed to remove operational status");
        }
        info!(device = %device, member = %services.member, "Device connector stopped");
    }
}

async fn publish(setup: &TopologySetup, status: NodeStatus) {
    let value = match serde_json::to_value(&status) {
        Ok(value) => value,
        Err(e) => {
            error!(device = %setup.device_id(), error = %e, "Failed to encode node status");
            return;
        }
    };
    if let Err(e) = setup
        .services()
        .data_store
        .put(LogicalStore::Operational, &setup.node_key(), value)
        .await
    {
        warn!(device = %setup.device_id(), status = %status.connection_status, error = %e, "Failed to publish node status");
    }
}

async fn connect_device(
    setup: Arc<TopologySetup>,
    master: ActorRef<DeviceActor>,
    cancel: CancellationToken,
    live: Arc<Mutex<Option<LiveSession>>>,
) {
    let config = setup.node_config();
    publish(&setup, NodeStatus::connecting(config)).await;

    let Some(session) = connect_with_retry(&setup, &cancel).await else {
        return;
    };

    match mount_session(&setup, &master, session).await {
        Ok((session, capabilities)) => {
            *live.lock().await = Some(session);
            if cancel.is_cancelled() {
                return;
            }
            let member = setup.member().clone();
            events::device_connected(
                &setup.device_id().name,
                &setup.device_id().address(),
                member.as_str(),
                capabilities.len(),
            );
            publish(&setup, NodeStatus::connected(config, member, capabilities)).await;
        }
        Err(e) => {
            error!(device = %setup.device_id(), error = %e, "Device session could not be mounted");
            publish(&setup, NodeStatus::unable_to_connect(config, e.to_string())).await;
        }
    }
}

async fn connect_with_retry(setup: &TopologySetup, cancel: &CancellationToken) -> Option<DeviceSession> {
    let device = setup.device_id();
    let config = setup.node_config();
    let connector = setup.services().connector.clone();
    let mut tracker = RetryTracker::new(RetryPolicy::reconnect(config));

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return None,
            attempt = tokio::time::timeout(config.connection_timeout(), connector.connect(device, config)) => attempt,
        };
        let error = match attempt {
            Ok(Ok(session)) => return Some(session),
            Ok(Err(e)) => e,
            Err(_) => DeviceError::ConnectionFailed(format!(
                "{}: no session within {}ms",
                device.address(),
                config.connection_timeout_millis
            )),
        };

        match tracker.record_failure() {
            Some(delay) => {
                debug!(device = %device, error = %error, retry_in = ?delay, "Connection attempt failed");
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                let attempts = tracker.retries() + 1;
                events::device_connection_failed(&device.name, &device.address(), attempts, &error.to_string());
                publish(setup, NodeStatus::unable_to_connect(config, error.to_string())).await;
                return None;
            }
        }
    }
}

/// Registers the session's sources, resolves them and hands the services to
/// the master actor. On failure the session is closed again.
async fn mount_session(
    setup: &TopologySetup,
    master: &ActorRef<DeviceActor>,
    session: DeviceSession,
) -> Result<(LiveSession, Vec<String>), DeviceError> {
    let device = setup.device_id().clone();
    let resources = setup.schema_resources();
    let scope = resources.registry.scope();
    let provider = Arc::new(SessionSchemaSources {
        sources: session.schema_sources,
    });
    for id in &session.source_ids {
        scope.register(id.clone(), provider.clone());
    }

    let registry: Arc<dyn SchemaSourceProvider> = Arc::new(resources.registry.clone());
    let schema = match resources.resolver.resolve(registry.clone(), &session.source_ids).await {
        Ok(schema) => schema,
        Err(e) => {
            scope.close();
            session.handle.close().await;
            return Err(DeviceError::Operation(format!("schema resolution failed: {e}")));
        }
    };

    let initialized = master
        .ask(CreateInitialMasterActorData {
            data_broker: session.data_broker.clone(),
            data_tree: session.data_tree.clone(),
            source_ids: session.source_ids.clone(),
            services: session.services.clone(),
            schema_provider: registry.clone(),
        })
        .send()
        .await;
    if let Err(e) = initialized {
        scope.close();
        session.handle.close().await;
        return Err(DeviceError::MasterUnreachable {
            device: device.to_string(),
            reason: e.to_string(),
        });
    }

    let mount = MountPoint {
        device_id: device.clone(),
        role: MountRole::Master,
        master: setup.member().clone(),
        schema,
        data_broker: session.data_broker,
        data_tree: session.data_tree,
        rpc: session.services.rpc,
        actions: session.services.actions,
        schema_provider: registry,
    };
    let mount = match setup.services().mount_points.register(mount) {
        Ok(mount) => mount,
        Err(e) => {
            if let Err(e) = master.ask(DropMasterData).send().await {
                debug!(device = %setup.device_id(), error = %e, "Failed to drop master data after mount failure");
            }
            scope.close();
            session.handle.close().await;
            return Err(DeviceError::Operation(e.to_string()));
        }
    };

    Ok((
        LiveSession {
            handle: session.handle,
            scope,
            mount,
        },
        session.capabilities,
    ))
}
