//! Cluster plumbing: actor routing and singleton election.

pub mod directory;
pub mod endpoint;
pub mod etcd;
pub mod singleton;
pub mod swarm;

pub use directory::{ActorDirectory, ActorRegistry, SwarmRegistry};
pub use endpoint::{ActorEndpoint, AskFailure};
pub use etcd::EtcdSingletonProvider;
pub use singleton::{LocalSingletonProvider, LocalSingletonService};
