//! Datastore Backends
//!
//! - `memory`: process-local store for single-node runs and tests
//! - `etcd`: shared store for multi-process clusters

pub mod etcd;
pub mod memory;

pub use etcd::EtcdDataStore;
pub use memory::MemoryDataStore;
