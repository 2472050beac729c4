//! Topology Context
//!
//! Singleton candidate for one device on one member. While this member owns
//! the device the context runs the connector (master role); otherwise it runs
//! a node manager (slave role). Both roles share one device actor, kept in
//! the member's actor directory for the lifetime of the context.

use super::connector::RemoteDeviceConnector;
use super::node_manager::NodeManager;
use super::TopologySetup;
use crate::actors::device::RefreshSetupMasterActorData;
use crate::actors::DeviceActor;
use crate::observability::{events, metrics};
use async_trait::async_trait;
use fleetmount_core::cluster::SingletonCandidate;
use kameo::actor::ActorRef;
use std::sync::Arc;
use strum::Display;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ContextState {
    Idle,
    Active,
    Closed,
}

struct Inner {
    setup: Arc<TopologySetup>,
    state: ContextState,
    actor: ActorRef<DeviceActor>,
    connector: Option<RemoteDeviceConnector>,
    node_manager: Option<NodeManager>,
}

impl Inner {
    async fn stop_node_manager(&mut self) {
        if let Some(mut node_manager) = self.node_manager.take() {
            node_manager.close().await;
        }
    }

    async fn stop_connector(&mut self) {
        if let Some(mut connector) = self.connector.take() {
            connector.stop().await;
        }
    }

    fn start_node_manager(&mut self) {
        self.node_manager = Some(NodeManager::spawn(self.setup.clone(), self.actor.clone()));
    }

    fn start_connector(&mut self) {
        self.connector = Some(RemoteDeviceConnector::start(self.setup.clone(), self.actor.clone()));
    }

    async fn refresh_actor(&self) {
        let refreshed = self
            .actor
            .ask(RefreshSetupMasterActorData {
                setup: self.setup.clone(),
                device_id: self.setup.device_id().clone(),
            })
            .send()
            .await;
        if let Err(e) = refreshed {
            warn!(device = %self.setup.device_id(), error = %e, "Failed to refresh device actor");
        }
    }
}

pub struct TopologyContext {
    identifier: String,
    node_id: String,
    inner: Mutex<Inner>,
}

impl TopologyContext {
    /// Spawns (or reuses) the device actor and starts in the slave role.
    pub async fn create(setup: Arc<TopologySetup>) -> Arc<Self> {
        let services = setup.services().clone();
        let node_id = setup.device_id().name.clone();
        let actor = services
            .directory
            .get_or_spawn(&services.member, &node_id, || DeviceActor::new(setup.clone()))
            .await;

        let mut inner = Inner {
            setup,
            state: ContextState::Idle,
            actor,
            connector: None,
            node_manager: None,
        };
        inner.start_node_manager();

        events::context_created(&node_id, services.member.as_str());
        Arc::new(Self {
            identifier: format!("{}/{}", services.topology_id, node_id),
            node_id,
            inner: Mutex::new(inner),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn state(&self) -> ContextState {
        self.inner.lock().await.state
    }

    pub async fn setup(&self) -> Arc<TopologySetup> {
        self.inner.lock().await.setup.clone()
    }

    /// Applies a changed configuration. An owner re-opens the session with
    /// the new parameters; a slave restarts its node manager.
    pub async fn refresh(&self, setup: Arc<TopologySetup>) {
        let mut inner = self.inner.lock().await;
        if inner.state == ContextState::Closed {
            debug!(node_id = %self.node_id, "Ignoring refresh of closed context");
            return;
        }

        info!(
            node_id = %self.node_id,
            state = %inner.state,
            address = %setup.device_id().address(),
            "Refreshing topology context"
        );
        inner.setup = setup;
        if inner.state == ContextState::Active {
            inner.stop_connector().await;
            inner.refresh_actor().await;
            inner.start_connector();
        } else {
            inner.stop_node_manager().await;
            inner.refresh_actor().await;
            inner.start_node_manager();
        }
    }

    /// Stops both roles, removes the actor from the directory and stops it.
    /// Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ContextState::Closed {
            return;
        }
        inner.state = ContextState::Closed;
        inner.stop_connector().await;
        inner.stop_node_manager().await;

        let services = inner.setup.services().clone();
        services.directory.remove(&services.member, &self.node_id).await;
        if let Err(e) = inner.actor.stop_gracefully().await {
            debug!(node_id = %self.node_id, error = %e, "Device actor already stopped");
        }
        events::actor_stopped("DeviceActor", &self.node_id, "context closed", services.member.as_str());
        events::context_closed(&self.node_id, services.member.as_str());
    }
}

#[async_trait]
impl SingletonCandidate for TopologyContext {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn instantiate(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != ContextState::Idle {
            debug!(node_id = %self.node_id, state = %inner.state, "Ignoring mastership grant");
            return;
        }

        // The owner serves the live session, never a proxy to itself.
        inner.stop_node_manager().await;

        let services = inner.setup.services().clone();
        let setup = inner.setup.clone();
        inner.actor = services
            .directory
            .get_or_spawn(&services.member, &self.node_id, || DeviceActor::new(setup))
            .await;
        inner.start_connector();
        inner.state = ContextState::Active;

        events::mastership_gained(&self.node_id, services.member.as_str());
        metrics::record_mastership_change("gained");
    }

    async fn close_instance(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != ContextState::Active {
            return;
        }

        inner.stop_connector().await;
        inner.state = ContextState::Idle;
        inner.start_node_manager();

        let member = inner.setup.member().clone();
        events::mastership_lost(&self.node_id, member.as_str());
        metrics::record_mastership_change("lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, TestCluster};
    use fleetmount_core::{LogicalStore, NodeConfig};
    use std::time::Duration;

    fn config() -> NodeConfig {
        NodeConfig::new("127.0.0.1", 1234)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_instantiate_mounts_and_close_instance_unmounts() {
        let cluster = TestCluster::new();
        let setup = Arc::new(cluster.setup("member-1", "node-1", config()));
        let context = TopologyContext::create(setup).await;
        assert_eq!(context.identifier(), "topology-netconf/node-1");
        assert_eq!(context.state().await, ContextState::Idle);

        context.instantiate().await;
        assert_eq!(context.state().await, ContextState::Active);

        let member = cluster.member("member-1");
        let mounts = member.mount_points.clone();
        assert!(eventually(Duration::from_secs(2), || {
            let mounts = mounts.clone();
            async move { mounts.get("node-1").is_some() }
        })
        .await);

        context.close_instance().await;
        assert_eq!(context.state().await, ContextState::Idle);
        assert!(member.mount_points.is_empty());
        assert_eq!(cluster.connector().open_sessions(), 0);

        context.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_idempotent_and_removes_actor() {
        let cluster = TestCluster::new();
        let setup = Arc::new(cluster.setup("member-1", "node-1", config()));
        let context = TopologyContext::create(setup.clone()).await;
        context.instantiate().await;

        let member = cluster.member("member-1");
        let mounts = member.mount_points.clone();
        assert!(eventually(Duration::from_secs(2), || {
            let mounts = mounts.clone();
            async move { mounts.get("node-1").is_some() }
        })
        .await);

        context.close().await;
        context.close().await;
        assert_eq!(context.state().await, ContextState::Closed);
        assert!(member.directory.lookup(&member.member, "node-1").await.is_none());
        assert!(member.mount_points.is_empty());
        assert!(cluster
            .data_store()
            .get(LogicalStore::Operational, &setup.node_key())
            .await
            .unwrap()
            .is_none());

        // A late grant after close does nothing.
        context.instantiate().await;
        assert_eq!(context.state().await, ContextState::Closed);
        assert_eq!(cluster.connector().open_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_reopens_session_with_new_address() {
        let cluster = TestCluster::new();
        let setup = Arc::new(cluster.setup("member-1", "node-1", config()));
        let context = TopologyContext::create(setup).await;
        context.instantiate().await;

        let member = cluster.member("member-1");
        let mounts = member.mount_points.clone();
        assert!(eventually(Duration::from_secs(2), || {
            let mounts = mounts.clone();
            async move { mounts.get("node-1").is_some_and(|m| m.device_id.port == 1234) }
        })
        .await);

        let updated = Arc::new(cluster.setup("member-1", "node-1", NodeConfig::new("127.0.0.1", 9876)));
        context.refresh(updated).await;
        assert_eq!(context.state().await, ContextState::Active);

        let mounts = member.mount_points.clone();
        assert!(eventually(Duration::from_secs(2), || {
            let mounts = mounts.clone();
            async move { mounts.get("node-1").is_some_and(|m| m.device_id.port == 9876) }
        })
        .await);
        assert_eq!(member.mount_points.stats().unregistered, 1);
        assert_eq!(context.setup().await.device_id().port, 9876);

        context.close().await;
    }
}
