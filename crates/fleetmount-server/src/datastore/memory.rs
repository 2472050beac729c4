//! In-memory Datastore
//!
//! Shared by every member of an in-process cluster (tests, single-node
//! deployments). Writes that do not change a record produce no notification.

use async_trait::async_trait;
use fleetmount_core::datastore::{ChangeStream, DataStore, DataTreeChange, Modification};
use fleetmount_core::{DataStoreError, LogicalStore};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

struct Watcher {
    store: LogicalStore,
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<DataTreeChange>>,
}

#[derive(Default)]
struct Inner {
    trees: HashMap<LogicalStore, BTreeMap<String, Value>>,
    watchers: Vec<Watcher>,
}

impl Inner {
    /// Delivers one change to every matching watcher, dropping closed ones.
    fn notify(&mut self, store: LogicalStore, change: DataTreeChange) {
        self.watchers.retain(|watcher| {
            if watcher.store != store || !change.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(vec![change.clone()]).is_ok()
        });
    }
}

#[derive(Default)]
pub struct MemoryDataStore {
    inner: Mutex<Inner>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records in `store`.
    pub fn len(&self, store: LogicalStore) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.trees.get(&store).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, store: LogicalStore) -> bool {
        self.len(store) == 0
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn put(&self, store: LogicalStore, key: &str, value: Value) -> Result<(), DataStoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let tree = inner.trees.entry(store).or_default();
        if tree.get(key) == Some(&value) {
            trace!(store = %store, key = %key, "Skipping unchanged write");
            return Ok(());
        }
        tree.insert(key.to_string(), value.clone());
        inner.notify(
            store,
            DataTreeChange {
                key: key.to_string(),
                modification: Modification::Write(value),
            },
        );
        Ok(())
    }

    async fn delete(&self, store: LogicalStore, key: &str) -> Result<bool, DataStoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = inner
            .trees
            .get_mut(&store)
            .and_then(|tree| tree.remove(key))
            .is_some();
        if removed {
            inner.notify(
                store,
                DataTreeChange {
                    key: key.to_string(),
                    modification: Modification::Delete,
                },
            );
        }
        Ok(removed)
    }

    async fn get(&self, store: LogicalStore, key: &str) -> Result<Option<Value>, DataStoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.trees.get(&store).and_then(|tree| tree.get(key)).cloned())
    }

    async fn list(&self, store: LogicalStore, prefix: &str) -> Result<Vec<(String, Value)>, DataStoreError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tree) = inner.trees.get(&store) else {
            return Ok(Vec::new());
        };
        Ok(tree
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn watch(&self, store: LogicalStore, prefix: &str) -> Result<ChangeStream, DataStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.watchers.push(Watcher {
            store,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), DataStoreError> {
        Ok(())
    }
}
