//! Topology Manager
//!
//! Watches the configuration records of one topology and keeps one
//! `TopologyContext` per device, each registered as a cluster singleton
//! candidate.
//!
//! Per record:
//! - new → build setup and context, register (bounded retries)
//! - changed → refresh the live context
//! - unchanged → ignore
//! - deleted → close the registration, then the context

use super::context::TopologyContext;
use super::{MemberServices, TopologySetup};
use crate::observability::{events, metrics};
use fleetmount_core::cluster::SingletonRegistration;
use fleetmount_core::datastore::{node_id_from_key, nodes_prefix, ChangeStream, DataTreeChange, Modification};
use fleetmount_core::{LogicalStore, NodeConfig};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before re-establishing a failed configuration watch.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

struct LiveContext {
    context: Arc<TopologyContext>,
    registration: Box<dyn SingletonRegistration>,
    /// Raw record the context was built from.
    config: Value,
}

pub struct TopologyManager {
    services: Arc<MemberServices>,
    contexts: BTreeMap<String, LiveContext>,
    closed: bool,
}

impl TopologyManager {
    pub fn new(services: Arc<MemberServices>) -> Self {
        Self {
            services,
            contexts: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn context(&self, node_id: &str) -> Option<Arc<TopologyContext>> {
        self.contexts.get(node_id).map(|live| live.context.clone())
    }

    /// Applies one change batch in order.
    pub async fn apply(&mut self, batch: Vec<DataTreeChange>) {
        for change in batch {
            let Some(node_id) = node_id_from_key(&self.services.topology_id, &change.key) else {
                continue;
            };
            let node_id = node_id.to_string();
            match change.modification {
                Modification::Write(value) => self.put(&node_id, value).await,
                Modification::Delete => self.remove(&node_id).await,
            }
        }
        metrics::set_contexts_active(self.contexts.len());
    }

    /// Reconciles with a full listing: unlisted contexts are removed, listed
    /// records are applied as writes.
    pub async fn resync(&mut self, records: Vec<(String, Value)>) {
        let mut listed = BTreeSet::new();
        let mut writes = Vec::with_capacity(records.len());
        for (key, value) in records {
            if let Some(node_id) = node_id_from_key(&self.services.topology_id, &key) {
                listed.insert(node_id.to_string());
                writes.push((node_id.to_string(), value));
            }
        }

        let stale: Vec<String> = self
            .contexts
            .keys()
            .filter(|node_id| !listed.contains(*node_id))
            .cloned()
            .collect();
        for node_id in stale {
            self.remove(&node_id).await;
        }
        for (node_id, value) in writes {
            self.put(&node_id, value).await;
        }

        info!(
            topology = %self.services.topology_id,
            contexts = self.contexts.len(),
            "Topology resynchronized"
        );
        metrics::set_contexts_active(self.contexts.len());
    }

    async fn put(&mut self, node_id: &str, value: Value) {
        if self.closed {
            return;
        }
        if self.contexts.get(node_id).is_some_and(|live| live.config == value) {
            debug!(node_id = %node_id, "Configuration unchanged");
            return;
        }

        let setup = match self.build_setup(node_id, &value) {
            Ok(setup) => Arc::new(setup),
            Err(reason) => {
                warn!(node_id = %node_id, reason = %reason, "Ignoring invalid node configuration");
                return;
            }
        };

        if let Some(live) = self.contexts.get_mut(node_id) {
            live.context.refresh(setup).await;
            live.config = value;
            return;
        }

        let context = TopologyContext::create(setup).await;
        match self.register(&context) {
            Some(registration) => {
                info!(node_id = %node_id, member = %self.services.member, "Device context registered");
                self.contexts.insert(
                    node_id.to_string(),
                    LiveContext {
                        context,
                        registration,
                        config: value,
                    },
                );
            }
            None => context.close().await,
        }
    }

    fn build_setup(&self, node_id: &str, value: &Value) -> Result<TopologySetup, String> {
        let config: NodeConfig = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        TopologySetup::builder()
            .services(self.services.clone())
            .node_id(node_id)
            .node_config(config)
            .build()
            .map_err(|e| e.to_string())
    }

    /// Registers `context` with the same instance on every attempt.
    fn register(&self, context: &Arc<TopologyContext>) -> Option<Box<dyn SingletonRegistration>> {
        let max_attempts = self.services.registration_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.services.singleton.register(context.clone()) {
                Ok(registration) => return Some(registration),
                Err(e) => {
                    events::singleton_registration_failed(context.node_id(), attempt, max_attempts, &e.to_string());
                    metrics::record_registration_failure();
                }
            }
        }
        error!(
            node_id = %context.node_id(),
            attempts = max_attempts,
            "Giving up on singleton registration"
        );
        None
    }

    async fn remove(&mut self, node_id: &str) {
        let Some(live) = self.contexts.remove(node_id) else {
            debug!(node_id = %node_id, "Delete for unknown device");
            return;
        };
        live.registration.close().await;
        live.context.close().await;
        info!(node_id = %node_id, member = %self.services.member, "Device context removed");
    }

    /// Closes every registration and context in node id order. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let node_ids: Vec<String> = self.contexts.keys().cloned().collect();
        for node_id in node_ids {
            self.remove(&node_id).await;
        }
        metrics::set_contexts_active(0);
        info!(topology = %self.services.topology_id, member = %self.services.member, "Topology manager closed");
    }
}

/// Handle to a running topology manager.
pub struct TopologyManagerHandle {
    ready: Arc<AtomicBool>,
    contexts: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TopologyManagerHandle {
    /// Whether the initial listing has been applied.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.load(Ordering::Relaxed)
    }

    /// Stops watching and closes every context. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        if let Err(e) = task.await {
            error!(error = %e, "Topology manager task panicked");
        }
    }
}

pub fn spawn_topology_manager(services: Arc<MemberServices>) -> TopologyManagerHandle {
    let ready = Arc::new(AtomicBool::new(false));
    let contexts = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(
        TopologyManager::new(services),
        ready.clone(),
        contexts.clone(),
        cancel.clone(),
    ));
    TopologyManagerHandle {
        ready,
        contexts,
        cancel,
        task: tokio::sync::Mutex::new(Some(task)),
    }
}

async fn run(
    mut manager: TopologyManager,
    ready: Arc<AtomicBool>,
    contexts: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let prefix = nodes_prefix(&manager.services.topology_id);
    info!(prefix = %prefix, member = %manager.services.member, "Starting topology manager");

    'watch: while !cancel.is_cancelled() {
        // Watch before listing so no change between the two is missed.
        let Some(mut changes) = establish(&mut manager, &prefix).await else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
            }
        };
        contexts.store(manager.len(), Ordering::Relaxed);
        ready.store(true, Ordering::Release);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'watch,
                batch = changes.recv() => {
                    let Some(batch) = batch else {
                        warn!(prefix = %prefix, "Configuration watch ended, re-establishing");
                        continue 'watch;
                    };
                    manager.apply(batch).await;
                    contexts.store(manager.len(), Ordering::Relaxed);
                }
            }
        }
    }

    manager.close().await;
    contexts.store(0, Ordering::Relaxed);
    ready.store(false, Ordering::Release);
}

/// Opens the watch and applies the current listing.
async fn establish(manager: &mut TopologyManager, prefix: &str) -> Option<ChangeStream> {
    let data_store = manager.services.data_store.clone();
    let changes = match data_store.watch(LogicalStore::Configuration, prefix).await {
        Ok(changes) => changes,
        Err(e) => {
            error!(prefix = %prefix, error = %e, "Failed to watch configuration");
            return None;
        }
    };
    match data_store.list(LogicalStore::Configuration, prefix).await {
        Ok(records) => manager.resync(records).await,
        Err(e) => {
            error!(prefix = %prefix, error = %e, "Failed to list configuration");
            return None;
        }
    }
    Some(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountRole;
    use crate::testing::{eventually, wait_until, FlakySingletonProvider, TestCluster};
    use fleetmount_core::datastore::node_key;
    use fleetmount_core::device::{DataBroker, ReadTransaction, WriteTransaction};
    use fleetmount_core::{ConnectionStatus, DataPath, MemberId, NodeStatus};
    use serde_json::json;

    const TOPOLOGY: &str = "topology-netconf";
    const IDENTIFIER: &str = "topology-netconf/node-1";

    fn record(port: u16) -> Value {
        serde_json::to_value(NodeConfig::new("127.0.0.1", port)).unwrap()
    }

    fn write(node_id: &str, value: Value) -> Vec<DataTreeChange> {
        vec![DataTreeChange {
            key: node_key(TOPOLOGY, node_id),
            modification: Modification::Write(value),
        }]
    }

    fn delete(node_id: &str) -> Vec<DataTreeChange> {
        vec![DataTreeChange {
            key: node_key(TOPOLOGY, node_id),
            modification: Modification::Delete,
        }]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_then_delete_releases_everything() {
        let cluster = TestCluster::new();
        let services = cluster.member("member-1");
        let mut manager = TopologyManager::new(services.clone());

        manager.apply(write("node-1", record(1234))).await;
        assert_eq!(manager.len(), 1);

        let mounts = services.mount_points.clone();
        assert!(eventually(Duration::from_secs(2), || {
            let mounts = mounts.clone();
            async move { mounts.get("node-1").is_some() }
        })
        .await);
        assert_eq!(cluster.singleton().registrants(IDENTIFIER), 1);

        manager.apply(delete("node-1")).await;
        assert!(manager.is_empty());
        assert_eq!(cluster.singleton().registrants(IDENTIFIER), 0);
        assert!(services.mount_points.is_empty());
        assert_eq!(services.directory.len().await, 0);
        assert_eq!(cluster.connector().open_sessions(), 0);

        let setup = cluster.setup("member-1", "node-1", NodeConfig::new("127.0.0.1", 1234));
        assert_eq!(setup.schema_resources().registry.registration_count(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_record_is_ignored() {
        let cluster = TestCluster::new();
        let mut manager = TopologyManager::new(cluster.member("member-1"));

        manager.apply(write("node-1", record(1234))).await;
        let context = manager.context("node-1").unwrap();
        manager.apply(write("node-1", record(1234))).await;

        assert!(Arc::ptr_eq(&context, &manager.context("node-1").unwrap()));
        assert_eq!(context.setup().await.device_id().port, 1234);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_changed_record_refreshes_same_context() {
        let cluster = TestCluster::new();
        let mut manager = TopologyManager::new(cluster.member("member-1"));

        manager.apply(write("node-1", record(1234))).await;
        let context = manager.context("node-1").unwrap();
        manager.apply(write("node-1", record(9876))).await;

        assert!(Arc::ptr_eq(&context, &manager.context("node-1").unwrap()));
        assert_eq!(context.setup().await.device_id().port, 9876);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_invalid_record_is_skipped() {
        let cluster = TestCluster::new();
        let mut manager = TopologyManager::new(cluster.member("member-1"));

        manager.apply(write("node-1", json!({"port": "not-a-port"}))).await;
        manager.apply(write("node-2", json!({"host": "", "port": 830}))).await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_registration_succeeds_on_third_attempt() {
        let cluster = TestCluster::new();
        let flaky = Arc::new(FlakySingletonProvider::new(
            2,
            cluster.singleton().provider_for(MemberId::new("member-1")),
        ));
        let cluster = cluster.with_singleton(flaky.clone());
        let mut manager = TopologyManager::new(cluster.member("member-1"));

        manager.apply(write("node-1", record(1234))).await;
        assert_eq!(flaky.calls(), 3);
        assert_eq!(manager.len(), 1);
        assert_eq!(cluster.singleton().registrants(IDENTIFIER), 1);
        manager.close().await;
    }

    #[tokio::test]
    async fn test_registration_failing_closes_context() {
        let cluster = TestCluster::new();
        let flaky = Arc::new(FlakySingletonProvider::new(
            u32::MAX,
            cluster.singleton().provider_for(MemberId::new("member-1")),
        ));
        let cluster = cluster.with_singleton(flaky.clone());
        let services = cluster.member("member-1");
        let mut manager = TopologyManager::new(services.clone());

        manager.apply(write("node-1", record(1234))).await;
        assert_eq!(flaky.calls(), 3);
        assert!(manager.is_empty());
        assert_eq!(services.directory.len().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let cluster = TestCluster::new();
        let mut manager = TopologyManager::new(cluster.member("member-1"));
        manager.apply(write("node-b", record(1234))).await;
        manager.apply(write("node-a", record(1235))).await;

        manager.close().await;
        manager.close().await;
        assert!(manager.is_empty());
        assert_eq!(cluster.singleton().registrants("topology-netconf/node-a"), 0);
        assert_eq!(cluster.singleton().registrants("topology-netconf/node-b"), 0);

        // Closed managers accept no new work.
        manager.apply(write("node-c", record(1236))).await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_resync_removes_unlisted() {
        let cluster = TestCluster::new();
        let mut manager = TopologyManager::new(cluster.member("member-1"));
        manager.apply(write("node-1", record(1234))).await;
        manager.apply(write("node-2", record(1235))).await;

        manager
            .resync(vec![(node_key(TOPOLOGY, "node-2"), record(1235))])
            .await;
        assert!(manager.context("node-1").is_none());
        assert!(manager.context("node-2").is_some());
        manager.close().await;
    }

    async fn operational(cluster: &TestCluster) -> Option<NodeStatus> {
        cluster
            .data_store()
            .get(LogicalStore::Operational, &node_key(TOPOLOGY, "node-1"))
            .await
            .unwrap()
            .map(|value| serde_json::from_value(value).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_members_mount_and_follow_port_change() {
        let cluster = TestCluster::new();
        let first = spawn_topology_manager(cluster.member("member-1"));
        let second = spawn_topology_manager(cluster.member("member-2"));
        assert!(wait_until(Duration::from_secs(2), || first.is_ready() && second.is_ready()).await);

        let key = node_key(TOPOLOGY, "node-1");
        cluster
            .data_store()
            .put(LogicalStore::Configuration, &key, record(1234))
            .await
            .unwrap();

        // Election picks one owner, which publishes itself.
        let view = cluster.clone();
        assert!(eventually(Duration::from_secs(5), || {
            let view = view.clone();
            async move {
                operational(&view)
                    .await
                    .is_some_and(|s| s.connection_status == ConnectionStatus::Connected)
            }
        })
        .await);
        let status = operational(&cluster).await.unwrap();
        let owner = status.master_member.clone().unwrap();
        let slave_name = if owner.as_str() == "member-1" { "member-2" } else { "member-1" };
        let owner_services = cluster.member(owner.as_str());
        let slave_services = cluster.member(slave_name);

        let owner_mounts = owner_services.mount_points.clone();
        let slave_mounts = slave_services.mount_points.clone();
        assert!(eventually(Duration::from_secs(5), || {
            let slave_mounts = slave_mounts.clone();
            async move { slave_mounts.get("node-1").is_some() }
        })
        .await);
        assert_eq!(owner_mounts.get("node-1").unwrap().role, MountRole::Master);
        let mount = slave_mounts.get("node-1").unwrap();
        assert_eq!(mount.role, MountRole::Slave);
        assert_eq!(mount.master, owner);

        // Write, read back and delete through the slave's proxy broker.
        let path: DataPath = "/interfaces/eth0".parse().unwrap();
        let tx = mount.data_broker.new_read_write_transaction().await.unwrap();
        tx.put(LogicalStore::Configuration, &path, json!({"mtu": 9000}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let tx = mount.data_broker.new_read_only_transaction().await.unwrap();
        assert_eq!(
            tx.read(LogicalStore::Configuration, &path).await.unwrap(),
            Some(json!({"mtu": 9000}))
        );
        tx.close().await;

        let tx = mount.data_broker.new_write_only_transaction().await.unwrap();
        tx.delete(LogicalStore::Configuration, &path).await.unwrap();
        tx.commit().await.unwrap();
        let tx = mount.data_broker.new_read_only_transaction().await.unwrap();
        assert!(!tx.exists(LogicalStore::Configuration, &path).await.unwrap());
        tx.close().await;
        drop(mount);

        // Move the device; the slave remounts against the new session.
        let unregistered_before = slave_services.mount_points.stats().unregistered;
        cluster
            .data_store()
            .put(LogicalStore::Configuration, &key, record(9876))
            .await
            .unwrap();

        let slave_mounts = slave_services.mount_points.clone();
        assert!(eventually(Duration::from_secs(5), || {
            let slave_mounts = slave_mounts.clone();
            let path = path.clone();
            async move {
                let Some(mount) = slave_mounts.get("node-1") else {
                    return false;
                };
                if mount.device_id.port != 9876 {
                    return false;
                }
                match mount.data_broker.new_read_only_transaction().await {
                    Ok(tx) => {
                        let readable = tx.exists(LogicalStore::Configuration, &path).await.is_ok();
                        tx.close().await;
                        readable
                    }
                    Err(_) => false,
                }
            }
        })
        .await);
        assert!(slave_services.mount_points.stats().unregistered > unregistered_before);
        let status = operational(&cluster).await.unwrap();
        assert_eq!(status.port, 9876);
        assert_eq!(status.master_member, Some(owner));

        first.shutdown().await;
        second.shutdown().await;
        first.shutdown().await;
        assert!(cluster.member("member-1").mount_points.is_empty());
        assert!(cluster.member("member-2").mount_points.is_empty());
        assert_eq!(cluster.connector().open_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slave_in_another_process_mounts() {
        let cluster = TestCluster::new();
        let other_process = cluster.peer_process();
        let first = spawn_topology_manager(cluster.member("member-1"));
        let second = spawn_topology_manager(other_process.member("member-2"));
        assert!(wait_until(Duration::from_secs(2), || first.is_ready() && second.is_ready()).await);

        cluster
            .data_store()
            .put(LogicalStore::Configuration, &node_key(TOPOLOGY, "node-1"), record(1234))
            .await
            .unwrap();

        let view = cluster.clone();
        assert!(eventually(Duration::from_secs(5), || {
            let view = view.clone();
            async move {
                operational(&view)
                    .await
                    .is_some_and(|s| s.connection_status == ConnectionStatus::Connected)
            }
        })
        .await);
        let owner = operational(&cluster).await.unwrap().master_member.unwrap();
        let slave_services = if owner.as_str() == "member-1" {
            other_process.member("member-2")
        } else {
            cluster.member("member-1")
        };
        // The owner's actor is only in its own process's directory.
        assert!(slave_services
            .directory
            .lookup_local(&owner, "node-1")
            .await
            .is_none());

        let slave_mounts = slave_services.mount_points.clone();
        assert!(eventually(Duration::from_secs(5), || {
            let slave_mounts = slave_mounts.clone();
            async move { slave_mounts.get("node-1").is_some() }
        })
        .await);
        let mount = slave_mounts.get("node-1").unwrap();
        assert_eq!(mount.role, MountRole::Slave);
        assert_eq!(mount.master, owner);

        let path: DataPath = "/interfaces/eth1".parse().unwrap();
        let tx = mount.data_broker.new_write_only_transaction().await.unwrap();
        tx.put(LogicalStore::Configuration, &path, json!({"mtu": 1500}))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let tx = mount.data_broker.new_read_only_transaction().await.unwrap();
        assert_eq!(
            tx.read(LogicalStore::Configuration, &path).await.unwrap(),
            Some(json!({"mtu": 1500}))
        );
        tx.close().await;
        drop(mount);

        first.shutdown().await;
        second.shutdown().await;
        assert_eq!(cluster.connector().open_sessions(), 0);
    }
}
