//! Actor Directory
//!
//! Resolves `(member, node)` to the device actor a member runs for a node.
//! Actors spawned in this process are found in the local table; everything
//! else goes through the [`ActorRegistry`], which in a deployed cluster is
//! the kameo actor swarm.

use super::endpoint::ActorEndpoint;
use crate::actors::DeviceActor;
use crate::observability::events;
use async_trait::async_trait;
use fleetmount_core::MemberId;
use kameo::actor::RemoteActorRef;
use kameo::error::RegistryError;
use kameo::prelude::*;
use kameo::remote::ActorSwarm;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

type Key = (MemberId, String);

/// Name service shared between processes.
#[async_trait]
pub trait ActorRegistry: Send + Sync {
    async fn register(&self, name: &str, actor: &ActorRef<DeviceActor>) -> anyhow::Result<()>;

    async fn lookup(&self, name: &str) -> anyhow::Result<Option<ActorEndpoint>>;

    async fn unregister(&self, name: &str);
}

/// Registry backed by the bootstrapped [`ActorSwarm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmRegistry;

#[async_trait]
impl ActorRegistry for SwarmRegistry {
    async fn register(&self, name: &str, actor: &ActorRef<DeviceActor>) -> anyhow::Result<()> {
        actor.register(name).await?;
        Ok(())
    }

    async fn lookup(&self, name: &str) -> anyhow::Result<Option<ActorEndpoint>> {
        match RemoteActorRef::<DeviceActor>::lookup(name).await {
            Ok(found) => Ok(found.map(ActorEndpoint::Remote)),
            Err(RegistryError::SwarmNotBootstrapped) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn unregister(&self, name: &str) {
        let Some(swarm) = ActorSwarm::get() else {
            return;
        };
        if let Err(e) = swarm.unregister(name.to_string()).await {
            debug!(name, error = %e, "Failed to unregister actor name");
        }
    }
}

#[derive(Clone, Default)]
pub struct ActorDirectory {
    actors: Arc<RwLock<HashMap<Key, ActorRef<DeviceActor>>>>,
    namespace: String,
    registry: Option<Arc<dyn ActorRegistry>>,
}

impl ActorDirectory {
    /// Directory that only knows actors spawned through it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that publishes its actors under `namespace` and falls back
    /// to `registry` for actors of other processes.
    pub fn with_registry(namespace: impl Into<String>, registry: Arc<dyn ActorRegistry>) -> Self {
        Self {
            actors: Arc::default(),
            namespace: namespace.into(),
            registry: Some(registry),
        }
    }

    /// Registry name of the actor `member` runs for `node_id`.
    pub fn actor_name(&self, member: &MemberId, node_id: &str) -> String {
        format!("fleetmount/{}/{}/{}", self.namespace, member, node_id)
    }

    /// Live actor for `node_id` on `member`, local or remote.
    pub async fn lookup(&self, member: &MemberId, node_id: &str) -> Option<ActorEndpoint> {
        if let Some(local) = self.lookup_local(member, node_id).await {
            return Some(ActorEndpoint::Local(local));
        }

        let registry = self.registry.as_ref()?;
        let name = self.actor_name(member, node_id);
        match registry.lookup(&name).await {
            Ok(found) => found,
            Err(e) => {
                debug!(name = %name, error = %e, "Actor lookup failed");
                None
            }
        }
    }

    /// Live actor spawned in this process for `node_id` on `member`.
    pub async fn lookup_local(&self, member: &MemberId, node_id: &str) -> Option<ActorRef<DeviceActor>> {
        let actors = self.actors.read().await;
        actors
            .get(&(member.clone(), node_id.to_string()))
            .filter(|actor_ref| actor_ref.is_alive())
            .cloned()
    }

    /// Returns the live actor for the key, spawning and publishing one from
    /// `create` if absent.
    pub async fn get_or_spawn(
        &self,
        member: &MemberId,
        node_id: &str,
        create: impl FnOnce() -> DeviceActor,
    ) -> ActorRef<DeviceActor> {
        let mut actors = self.actors.write().await;
        let key = (member.clone(), node_id.to_string());
        if let Some(existing) = actors.get(&key).filter(|actor_ref| actor_ref.is_alive()) {
            debug!(node_id = %node_id, member = %member, "Reusing device actor");
            return existing.clone();
        }

        let actor_ref = DeviceActor::spawn(create());
        events::actor_spawned("DeviceActor", node_id, member.as_str());
        actors.insert(key, actor_ref.clone());
        drop(actors);

        if let Some(registry) = &self.registry {
            let name = self.actor_name(member, node_id);
            // Unreachable from other processes, still usable locally.
            if let Err(e) = registry.register(&name, &actor_ref).await {
                warn!(name = %name, error = %e, "Failed to publish device actor");
            }
        }
        actor_ref
    }

    pub async fn remove(&self, member: &MemberId, node_id: &str) -> Option<ActorRef<DeviceActor>> {
        let removed = self
            .actors
            .write()
            .await
            .remove(&(member.clone(), node_id.to_string()));
        if let (Some(_), Some(registry)) = (&removed, &self.registry) {
            registry.unregister(&self.actor_name(member, node_id)).await;
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.actors.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoopbackRegistry, TestCluster};
    use fleetmount_core::NodeConfig;

    fn actor(cluster: &TestCluster, member: &str) -> DeviceActor {
        DeviceActor::new(Arc::new(cluster.setup(member, "node-1", NodeConfig::new("127.0.0.1", 1234))))
    }

    #[tokio::test]
    async fn test_names_are_scoped_by_topology() {
        let directory = ActorDirectory::with_registry("topology-netconf", Arc::new(LoopbackRegistry::default()));
        assert_eq!(
            directory.actor_name(&MemberId::new("member-1"), "node-1"),
            "fleetmount/topology-netconf/member-1/node-1"
        );
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_registry() {
        let cluster = TestCluster::new();
        let registry = Arc::new(LoopbackRegistry::default());
        let here = ActorDirectory::with_registry("t", registry.clone());
        let there = ActorDirectory::with_registry("t", registry.clone());
        let member = MemberId::new("member-1");

        let spawned = there.get_or_spawn(&member, "node-1", || actor(&cluster, "member-1")).await;
        assert_eq!(registry.len(), 1);

        assert!(here.lookup_local(&member, "node-1").await.is_none());
        let found = here.lookup(&member, "node-1").await;
        assert!(matches!(&found, Some(ActorEndpoint::Local(r)) if r.id() == spawned.id()));

        there.remove(&member, "node-1").await;
        assert_eq!(registry.len(), 0);
        assert!(here.lookup(&member, "node-1").await.is_none());
    }

    #[tokio::test]
    async fn test_local_directory_never_consults_a_registry() {
        let cluster = TestCluster::new();
        let directory = ActorDirectory::new();
        let member = MemberId::new("member-1");

        let first = directory.get_or_spawn(&member, "node-1", || actor(&cluster, "member-1")).await;
        let again = directory.get_or_spawn(&member, "node-1", || actor(&cluster, "member-1")).await;
        assert_eq!(first.id(), again.id());
        assert!(directory.lookup(&member, "node-1").await.is_some_and(|e| e.is_local()));
        assert!(directory.lookup(&MemberId::new("member-2"), "node-1").await.is_none());
    }

    #[tokio::test]
    async fn test_swarm_registry_without_swarm_finds_nothing() {
        assert!(SwarmRegistry.lookup("fleetmount/t/member-1/node-1").await.unwrap().is_none());
    }
}
