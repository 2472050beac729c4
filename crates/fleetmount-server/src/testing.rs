//! Test fixtures: a cluster built from the in-memory adapters, plus
//! scriptable fakes and polling helpers.

use crate::actors::DeviceActor;
use crate::cluster::{ActorDirectory, ActorEndpoint, ActorRegistry, LocalSingletonService};
use crate::config::DEFAULT_TOPOLOGY_ID;
use crate::datastore::MemoryDataStore;
use crate::device::SimulatedConnector;
use crate::mount::MountPointService;
use crate::observability::RetryPolicy;
use crate::schema::{RepositorySchemaResolver, SchemaResourceManager};
use crate::topology::{MemberServices, TopologySetup};
use async_trait::async_trait;
use fleetmount_core::cluster::{ClusterSingletonProvider, SingletonCandidate, SingletonRegistration};
use fleetmount_core::datastore::DataStore;
use fleetmount_core::schema::{SchemaResolver, SchemaSourceProvider};
use fleetmount_core::{
    EffectiveSchemaContext, MemberId, NodeConfig, RegistrationError, SchemaError, SourceIdentifier,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use kameo::actor::ActorRef;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Members of one process sharing a datastore, an election table, an actor
/// directory and a device connector. Each member gets its own mount points
/// and schema resources on first use.
///
/// [`TestCluster::peer_process`] stands in for a second server process: it
/// shares the datastore, the election table and the actor registry, but has
/// its own directory and members.
#[derive(Clone)]
pub struct TestCluster {
    data_store: Arc<MemoryDataStore>,
    singleton: LocalSingletonService,
    singleton_override: Option<Arc<dyn ClusterSingletonProvider>>,
    registry: Arc<LoopbackRegistry>,
    directory: ActorDirectory,
    connector: Arc<SimulatedConnector>,
    resolver: Arc<dyn SchemaResolver>,
    write_tx_idle_timeout: Option<Duration>,
    read_tx_idle_timeout: Option<Duration>,
    members: Arc<Mutex<HashMap<String, Arc<MemberServices>>>>,
}

impl TestCluster {
    pub fn new() -> Self {
        let registry = Arc::new(LoopbackRegistry::default());
        Self {
            data_store: Arc::new(MemoryDataStore::new()),
            singleton: LocalSingletonService::new(),
            singleton_override: None,
            directory: ActorDirectory::with_registry(DEFAULT_TOPOLOGY_ID, registry.clone()),
            registry,
            connector: Arc::new(SimulatedConnector::new()),
            resolver: Arc::new(RepositorySchemaResolver::new()),
            write_tx_idle_timeout: None,
            read_tx_idle_timeout: None,
            members: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another process joined to the same cluster.
    pub fn peer_process(&self) -> Self {
        Self {
            directory: ActorDirectory::with_registry(DEFAULT_TOPOLOGY_ID, self.registry.clone()),
            members: Arc::new(Mutex::new(HashMap::new())),
            ..self.clone()
        }
    }

    pub fn with_write_tx_idle_timeout(mut self, timeout: Duration) -> Self {
        self.write_tx_idle_timeout = Some(timeout);
        self
    }

    pub fn with_read_tx_idle_timeout(mut self, timeout: Duration) -> Self {
        self.read_tx_idle_timeout = Some(timeout);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SchemaResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Every member registers through `provider` instead of the shared table.
    pub fn with_singleton(mut self, provider: Arc<dyn ClusterSingletonProvider>) -> Self {
        self.singleton_override = Some(provider);
        self
    }

    pub fn member(&self, name: &str) -> Arc<MemberServices> {
        let mut members = self.members.lock().unwrap();
        members
            .entry(name.to_string())
            .or_insert_with(|| {
                let member = MemberId::new(name);
                let singleton: Arc<dyn ClusterSingletonProvider> = match &self.singleton_override {
                    Some(provider) => provider.clone(),
                    None => self.singleton.provider_for(member.clone()),
                };
                Arc::new(MemberServices {
                    member,
                    topology_id: DEFAULT_TOPOLOGY_ID.to_string(),
                    data_store: self.data_store.clone(),
                    singleton,
                    directory: self.directory.clone(),
                    connector: self.connector.clone(),
                    schema_resources: Arc::new(SchemaResourceManager::new(self.resolver.clone())),
                    mount_points: MountPointService::new(),
                    write_tx_idle_timeout: self.write_tx_idle_timeout,
                    read_tx_idle_timeout: self.read_tx_idle_timeout,
                    mount_retry: RetryPolicy::new(None, Duration::from_millis(10), 2.0, Duration::from_millis(100)),
                    registration_attempts: 3,
                })
            })
            .clone()
    }

    pub fn setup(&self, member: &str, node_id: &str, config: NodeConfig) -> TopologySetup {
        TopologySetup::builder()
            .services(self.member(member))
            .node_id(node_id)
            .node_config(config)
            .build()
            .unwrap()
    }

    pub fn data_store(&self) -> Arc<dyn DataStore> {
        self.data_store.clone()
    }

    pub fn connector(&self) -> Arc<SimulatedConnector> {
        self.connector.clone()
    }

    pub fn singleton(&self) -> &LocalSingletonService {
        &self.singleton
    }

    pub fn registry(&self) -> &Arc<LoopbackRegistry> {
        &self.registry
    }
}

/// In-memory name service shared by every [`TestCluster`] of one test.
/// Hands out the registered actor itself, so asks stay in-process.
#[derive(Default)]
pub struct LoopbackRegistry {
    actors: Mutex<HashMap<String, ActorRef<DeviceActor>>>,
}

impl LoopbackRegistry {
    pub fn len(&self) -> usize {
        self.actors.lock().unwrap().len()
    }
}

#[async_trait]
impl ActorRegistry for LoopbackRegistry {
    async fn register(&self, name: &str, actor: &ActorRef<DeviceActor>) -> anyhow::Result<()> {
        self.actors.lock().unwrap().insert(name.to_string(), actor.clone());
        Ok(())
    }

    async fn lookup(&self, name: &str) -> anyhow::Result<Option<ActorEndpoint>> {
        let actors = self.actors.lock().unwrap();
        Ok(actors
            .get(name)
            .filter(|actor| actor.is_alive())
            .cloned()
            .map(ActorEndpoint::Local))
    }

    async fn unregister(&self, name: &str) {
        self.actors.lock().unwrap().remove(name);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Async variant of [`wait_until`].
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Resolver answering from a script, one entry per call. Once the script
/// runs out every call fails as unresolvable. A gated call takes its entry
/// on arrival but only answers once its gate is notified.
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Result<EffectiveSchemaContext, SchemaError>>>,
    calls: AtomicUsize,
    answered: AtomicUsize,
    gates: Mutex<HashMap<usize, Arc<Notify>>>,
}

impl ScriptedResolver {
    pub fn new(script: Vec<Result<EffectiveSchemaContext, SchemaError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            answered: AtomicUsize::new(0),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Holds call number `call` (1-based) until the returned gate is
    /// notified.
    pub fn gate_call(&self, call: usize) -> Arc<Notify> {
        self.gates.lock().unwrap().entry(call).or_default().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Calls that returned, as opposed to being dropped while gated.
    pub fn answered(&self) -> usize {
        self.answered.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SchemaResolver for ScriptedResolver {
    async fn resolve(
        &self,
        _provider: Arc<dyn SchemaSourceProvider>,
        source_ids: &[SourceIdentifier],
    ) -> Result<EffectiveSchemaContext, SchemaError> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel) + 1;
        let next = self.script.lock().unwrap().pop_front();
        let gate = self.gates.lock().unwrap().get(&call).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.answered.fetch_add(1, Ordering::AcqRel);
        next.unwrap_or_else(|| {
            Err(SchemaError::Unresolvable {
                id: source_ids
                    .first()
                    .cloned()
                    .unwrap_or_else(|| SourceIdentifier::new("unknown", None)),
                reason: "script exhausted".to_string(),
            })
        })
    }
}

/// Rejects the first `failures` registrations, then delegates.
pub struct FlakySingletonProvider {
    failures: u32,
    delegate: Arc<dyn ClusterSingletonProvider>,
    calls: AtomicU32,
}

impl FlakySingletonProvider {
    pub fn new(failures: u32, delegate: Arc<dyn ClusterSingletonProvider>) -> Self {
        Self {
            failures,
            delegate,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Acquire)
    }
}

impl ClusterSingletonProvider for FlakySingletonProvider {
    fn register(
        &self,
        candidate: Arc<dyn SingletonCandidate>,
    ) -> Result<Box<dyn SingletonRegistration>, RegistrationError> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel);
        if call < self.failures {
            return Err(RegistrationError::Failed {
                identifier: candidate.identifier().to_string(),
                reason: format!("scripted failure {}", call + 1),
            });
        }
        self.delegate.register(candidate)
    }
}
