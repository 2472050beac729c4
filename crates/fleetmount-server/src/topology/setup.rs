//! Topology Setup
//!
//! `MemberServices` holds the long-lived handles of one cluster member.
//! `TopologySetup` is the immutable per-device snapshot built from a
//! configuration record; a configuration change replaces it wholesale.

use crate::cluster::ActorDirectory;
use crate::mount::MountPointService;
use crate::observability::RetryPolicy;
use crate::schema::{SchemaResourceManager, SchemaResources};
use fleetmount_core::cluster::ClusterSingletonProvider;
use fleetmount_core::datastore::{node_key, DataStore};
use fleetmount_core::device::DeviceConnector;
use fleetmount_core::{DeviceId, MemberId, NodeConfig, SetupError};
use std::sync::Arc;
use std::time::Duration;

/// Services shared by every device context on one member.
pub struct MemberServices {
    pub member: MemberId,
    pub topology_id: String,
    pub data_store: Arc<dyn DataStore>,
    pub singleton: Arc<dyn ClusterSingletonProvider>,
    pub directory: ActorDirectory,
    pub connector: Arc<dyn DeviceConnector>,
    pub schema_resources: Arc<SchemaResourceManager>,
    pub mount_points: MountPointService,
    /// Open write transactions idle this long are cancelled by the master.
    pub write_tx_idle_timeout: Option<Duration>,
    /// Same for read transactions.
    pub read_tx_idle_timeout: Option<Duration>,
    /// Backoff between mount requests while the owner is not ready.
    pub mount_retry: RetryPolicy,
    pub registration_attempts: u32,
}

impl MemberServices {
    pub fn node_key(&self, node_id: &str) -> String {
        node_key(&self.topology_id, node_id)
    }
}

#[derive(Clone)]
pub struct TopologySetup {
    services: Arc<MemberServices>,
    device_id: DeviceId,
    node_config: NodeConfig,
}

impl TopologySetup {
    pub fn builder() -> TopologySetupBuilder {
        TopologySetupBuilder::default()
    }

    pub fn services(&self) -> &Arc<MemberServices> {
        &self.services
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn node_config(&self) -> &NodeConfig {
        &self.node_config
    }

    pub fn member(&self) -> &MemberId {
        &self.services.member
    }

    pub fn ask_timeout(&self) -> Duration {
        self.node_config.ask_timeout()
    }

    /// Key of this device in both the configuration and operational stores.
    pub fn node_key(&self) -> String {
        self.services.node_key(&self.device_id.name)
    }

    pub fn schema_resources(&self) -> Arc<SchemaResources> {
        self.services
            .schema_resources
            .resources(self.node_config.schema_cache_directory.as_deref())
    }
}

#[derive(Default)]
pub struct TopologySetupBuilder {
    services: Option<Arc<MemberServices>>,
    node_id: Option<String>,
    node_config: Option<NodeConfig>,
}

impl TopologySetupBuilder {
    pub fn services(mut self, services: Arc<MemberServices>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn node_config(mut self, node_config: NodeConfig) -> Self {
        self.node_config = Some(node_config);
        self
    }

    /// The device identity is derived from the node id and the configured address.
    pub fn build(self) -> Result<TopologySetup, SetupError> {
        let services = self.services.ok_or(SetupError::MissingField("services"))?;
        let node_id = self
            .node_id
            .filter(|id| !id.is_empty())
            .ok_or(SetupError::MissingField("node id"))?;
        let node_config = self.node_config.ok_or(SetupError::MissingField("node config"))?;
        if node_config.host.is_empty() {
            return Err(SetupError::MissingField("host"));
        }

        Ok(TopologySetup {
            device_id: node_config.device_id(&node_id),
            services,
            node_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;

    #[test]
    fn test_builder_validates() {
        let cluster = TestCluster::new();
        let services = cluster.member("member-1");

        let err = TopologySetup::builder()
            .node_id("node-1")
            .node_config(NodeConfig::new("127.0.0.1", 1234))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, SetupError::MissingField("services"));

        let err = TopologySetup::builder()
            .services(services.clone())
            .node_id("node-1")
            .node_config(NodeConfig::new("", 1234))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, SetupError::MissingField("host"));

        let setup = TopologySetup::builder()
            .services(services)
            .node_id("node-1")
            .node_config(NodeConfig::new("127.0.0.1", 1234))
            .build()
            .unwrap();
        assert_eq!(setup.device_id(), &DeviceId::new("node-1", "127.0.0.1", 1234));
        assert_eq!(setup.node_key(), "topology/topology-netconf/node/node-1");
    }
}
