//! Datastore Contract
//!
//! Key/value view of the configuration and operational stores with
//! prefix watches. Keys are plain strings; `node_key` builds the layout
//! shared by the topology manager and the node managers.

use crate::error::DataStoreError;
use crate::identity::LogicalStore;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// One modification inside a change batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    Write(Value),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataTreeChange {
    pub key: String,
    pub modification: Modification,
}

/// Receives change batches for one watch. Dropping it ends the watch.
pub type ChangeStream = mpsc::UnboundedReceiver<Vec<DataTreeChange>>;

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn put(&self, store: LogicalStore, key: &str, value: Value) -> Result<(), DataStoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, store: LogicalStore, key: &str) -> Result<bool, DataStoreError>;

    async fn get(&self, store: LogicalStore, key: &str) -> Result<Option<Value>, DataStoreError>;

    /// All records whose key starts with `prefix`, sorted by key.
    async fn list(&self, store: LogicalStore, prefix: &str) -> Result<Vec<(String, Value)>, DataStoreError>;

    /// Delivers changes made after the watch is established.
    async fn watch(&self, store: LogicalStore, prefix: &str) -> Result<ChangeStream, DataStoreError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), DataStoreError>;
}

/// Key of one device record: `topology/{topology_id}/node/{node_id}`.
pub fn node_key(topology_id: &str, node_id: &str) -> String {
    format!("{}{node_id}", nodes_prefix(topology_id))
}

pub fn nodes_prefix(topology_id: &str) -> String {
    format!("topology/{topology_id}/node/")
}

/// Node id of a key directly below `nodes_prefix`, `None` for anything else.
pub fn node_id_from_key<'a>(topology_id: &str, key: &'a str) -> Option<&'a str> {
    let prefix = nodes_prefix(topology_id);
    let node_id = key.strip_prefix(prefix.as_str())?;
    if node_id.is_empty() || node_id.contains('/') {
        return None;
    }
    Some(node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_layout() {
        let key = node_key("topology-netconf", "node-1");
        assert_eq!(key, "topology/topology-netconf/node/node-1");
        assert_eq!(node_id_from_key("topology-netconf", &key), Some("node-1"));
    }

    #[test]
    fn test_node_id_from_foreign_keys() {
        assert_eq!(node_id_from_key("t", "topology/other/node/n"), None);
        assert_eq!(node_id_from_key("t", "topology/t/node/"), None);
        assert_eq!(node_id_from_key("t", "topology/t/node/n/extra"), None);
    }
}
