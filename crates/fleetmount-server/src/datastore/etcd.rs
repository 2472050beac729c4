//! Etcd Datastore
//!
//! Records are JSON documents under `{namespace}{config|oper}/{key}`.
//! Watches survive broken streams by resuming from the last seen revision.

use crate::config::ServerConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, EventType, GetOptions, WatchOptions};
use fleetmount_core::datastore::{ChangeStream, DataStore, DataTreeChange, Modification};
use fleetmount_core::{DataStoreError, LogicalStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};

pub struct EtcdDataStore {
    client: Arc<RwLock<Client>>,
    namespace: String,
    reconnect_delay: Duration,
}

impl EtcdDataStore {
    /// Connect to etcd with exponential backoff
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let backoff = ExponentialBackoff {
            initial_interval: config.etcd_backoff_initial,
            max_interval: config.etcd_backoff_max,
            max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
            ..Default::default()
        };
        let endpoints = config.etcd_endpoints.clone();

        let client = retry(backoff, || async {
            Client::connect(&endpoints, None).await.map_err(|e| {
                warn!(error = %e, "etcd connection failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to etcd after retries: {e}"))?;

        info!(endpoints = ?config.etcd_endpoints, namespace = %config.etcd_namespace, "Connected to etcd datastore");
        Ok(Self::with_client(
            Arc::new(RwLock::new(client)),
            &config.etcd_namespace,
            config.reconnect_delay,
        ))
    }

    pub fn with_client(client: Arc<RwLock<Client>>, namespace: &str, reconnect_delay: Duration) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            reconnect_delay,
        }
    }

    /// Shared client, also used by the etcd singleton provider.
    pub fn client(&self) -> Arc<RwLock<Client>> {
        self.client.clone()
    }

    fn store_prefix(&self, store: LogicalStore) -> String {
        store_prefix(&self.namespace, store)
    }
}

fn store_prefix(namespace: &str, store: LogicalStore) -> String {
    let segment = match store {
        LogicalStore::Configuration => "config",
        LogicalStore::Operational => "oper",
    };
    format!("{namespace}{segment}/")
}

fn backend(e: etcd_client::Error) -> DataStoreError {
    DataStoreError::Backend(e.to_string())
}

fn decode(key: &str, bytes: &[u8]) -> Result<Value, DataStoreError> {
    serde_json::from_slice(bytes).map_err(|e| DataStoreError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl DataStore for EtcdDataStore {
    async fn put(&self, store: LogicalStore, key: &str, value: Value) -> Result<(), DataStoreError> {
        let full_key = format!("{}{key}", self.store_prefix(store));
        let encoded = serde_json::to_vec(&value).map_err(|e| DataStoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let mut client = self.client.write().await;
        let current = client.get(full_key.as_str(), None).await.map_err(backend)?;
        if current.kvs().first().is_some_and(|kv| kv.value() == encoded.as_slice()) {
            trace!(key = %full_key, "Skipping unchanged write");
            return Ok(());
        }
        client.put(full_key, encoded, None).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, store: LogicalStore, key: &str) -> Result<bool, DataStoreError> {
        let full_key = format!("{}{key}", self.store_prefix(store));
        let mut client = self.client.write().await;
        let resp = client.delete(full_key, None).await.map_err(backend)?;
        Ok(resp.deleted() > 0)
    }

    async fn get(&self, store: LogicalStore, key: &str) -> Result<Option<Value>, DataStoreError> {
        let full_key = format!("{}{key}", self.store_prefix(store));
        let mut client = self.client.write().await;
        let resp = client.get(full_key, None).await.map_err(backend)?;
        resp.kvs().first().map(|kv| decode(key, kv.value())).transpose()
    }

    async fn list(&self, store: LogicalStore, prefix: &str) -> Result<Vec<(String, Value)>, DataStoreError> {
        let store_prefix = self.store_prefix(store);
        let full_prefix = format!("{store_prefix}{prefix}");
        let resp = {
            let mut client = self.client.write().await;
            client
                .get(full_prefix, Some(GetOptions::new().with_prefix()))
                .await
                .map_err(backend)?
        };

        let mut records = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let full_key = kv.key_str().map_err(backend)?;
            let Some(key) = full_key.strip_prefix(store_prefix.as_str()) else {
                continue;
            };
            match decode(key, kv.value()) {
                Ok(value) => records.push((key.to_string(), value)),
                Err(e) => warn!(error = %e, "Skipping undecodable record"),
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    async fn watch(&self, store: LogicalStore, prefix: &str) -> Result<ChangeStream, DataStoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Fail fast if etcd is unreachable when the watch is requested.
        let client = {
            let mut client = self.client.write().await;
            client.status().await.map_err(backend)?;
            client.clone()
        };
        tokio::spawn(run_watch(
            client,
            self.store_prefix(store),
            prefix.to_string(),
            self.reconnect_delay,
            tx,
        ));
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), DataStoreError> {
        let mut client = self.client.write().await;
        client.status().await.map_err(backend)?;
        Ok(())
    }
}

/// Forwards etcd watch events until the receiving side is dropped.
async fn run_watch(
    mut client: Client,
    store_prefix: String,
    prefix: String,
    reconnect_delay: Duration,
    tx: mpsc::UnboundedSender<Vec<DataTreeChange>>,
) {
    let full_prefix = format!("{store_prefix}{prefix}");
    let mut next_revision: Option<i64> = None;

    loop {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = next_revision {
            options = options.with_start_revision(revision);
        }

        let (_watcher, mut stream) = match client.watch(full_prefix.as_str(), Some(options)).await {
            Ok(watch) => watch,
            Err(e) => {
                error!(error = %e, prefix = %full_prefix, "Failed to establish watch");
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(reconnect_delay) => continue,
                }
            }
        };
        debug!(prefix = %full_prefix, revision = ?next_revision, "Watch established");

        loop {
            let message = tokio::select! {
                _ = tx.closed() => {
                    debug!(prefix = %full_prefix, "Watch receiver dropped");
                    return;
                }
                message = stream.message() => message,
            };

            match message {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        warn!(prefix = %full_prefix, "Watch cancelled by server");
                        break;
                    }
                    if let Some(header) = resp.header() {
                        next_revision = Some(header.revision() + 1);
                    }

                    let batch: Vec<DataTreeChange> = resp
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let kv = event.kv()?;
                            let key = kv.key_str().ok()?.strip_prefix(store_prefix.as_str())?.to_string();
                            let modification = match event.event_type() {
                                EventType::Put => Modification::Write(decode(&key, kv.value()).ok()?),
                                EventType::Delete => Modification::Delete,
                            };
                            Some(DataTreeChange { key, modification })
                        })
                        .collect();

                    if !batch.is_empty() && tx.send(batch).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    warn!(prefix = %full_prefix, "Watch stream closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, prefix = %full_prefix, "Watch stream error");
                    break;
                }
            }
        }

        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}
