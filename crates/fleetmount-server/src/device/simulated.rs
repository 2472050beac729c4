//! Simulated Devices
//!
//! In-process stand-in for the device wire protocol. Each node name maps to
//! one persistent simulated device, so data written through one session is
//! visible to the next. Connections to host `unreachable` or port 0 are
//! refused.

use super::tree;
use async_trait::async_trait;
use fleetmount_core::device::{
    ActionService, DataBroker, DeviceConnector, DeviceDataTreeService, DeviceSession, ReadTransaction,
    ReadWriteTransaction, RemoteDeviceServices, RpcService, SessionHandle, WriteTransaction,
};
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{
    DataPath, DataTreeIdentifier, DeviceError, DeviceId, LogicalStore, NodeConfig, NormalizedNode, QName, RpcError,
    RpcResult, SchemaError, SchemaSource, SourceIdentifier,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Host name the simulated connector always refuses.
pub const UNREACHABLE_HOST: &str = "unreachable";

const BASE_CAPABILITY: &str = "urn:ietf:params:netconf:base:1.1";

pub fn default_schema_sources() -> Vec<SchemaSource> {
    ["sim-device", "sim-interfaces"]
        .into_iter()
        .map(|name| {
            SchemaSource::new(
                SourceIdentifier::new(name, Some("2024-01-01")),
                format!("module {name} {{\n  namespace \"urn:fleetmount:{name}\";\n  revision 2024-01-01;\n}}\n"),
            )
        })
        .collect()
}

#[derive(Debug)]
struct DeviceState {
    running: Value,
    operational: Value,
    candidate: Option<Value>,
    locked: bool,
}

struct DeviceInner {
    id: DeviceId,
    state: Mutex<DeviceState>,
    sources: Vec<SchemaSource>,
}

/// One simulated device. Clones share state.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<DeviceInner>,
}

impl SimulatedDevice {
    pub fn new(id: DeviceId) -> Arc<Self> {
        Self::with_sources(id, default_schema_sources())
    }

    pub fn with_sources(id: DeviceId, sources: Vec<SchemaSource>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(DeviceInner {
                id,
                state: Mutex::new(DeviceState {
                    running: json!({}),
                    operational: json!({"status": {"uptime": 0}}),
                    candidate: None,
                    locked: false,
                }),
                sources,
            }),
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.inner.id
    }

    pub fn source_ids(&self) -> Vec<SourceIdentifier> {
        self.inner.sources.iter().map(|source| source.id.clone()).collect()
    }

    /// Current running configuration.
    pub async fn running(&self) -> Value {
        self.inner.state.lock().await.running.clone()
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.state.lock().await.locked
    }
}

fn writable(store: LogicalStore) -> Result<(), DeviceError> {
    match store {
        LogicalStore::Configuration => Ok(()),
        LogicalStore::Operational => Err(DeviceError::Unsupported("writes to the operational store".into())),
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put(DataPath, Value),
    Merge(DataPath, Value),
    Delete(DataPath),
}

impl WriteOp {
    fn apply(&self, root: &mut Value) {
        match self {
            Self::Put(path, data) => tree::put(root, path, data.clone()),
            Self::Merge(path, data) => tree::merge(root, path, data.clone()),
            Self::Delete(path) => {
                tree::delete(root, path);
            }
        }
    }
}

/// Transaction buffering configuration writes until commit.
struct SimTransaction {
    device: SimulatedDevice,
    ops: Mutex<Vec<WriteOp>>,
    finished: AtomicBool,
}

impl SimTransaction {
    fn new(device: SimulatedDevice) -> Self {
        Self {
            device,
            ops: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    async fn buffer(&self, store: LogicalStore, op: WriteOp) -> Result<(), DeviceError> {
        writable(store)?;
        if self.finished.load(Ordering::Acquire) {
            return Err(DeviceError::Operation("transaction already finished".into()));
        }
        self.ops.lock().await.push(op);
        Ok(())
    }
}

#[async_trait]
impl ReadTransaction for SimTransaction {
    async fn read(&self, store: LogicalStore, path: &DataPath) -> Result<Option<NormalizedNode>, DeviceError> {
        let state = self.device.inner.state.lock().await;
        if store == LogicalStore::Operational {
            return Ok(tree::get(&state.operational, path).cloned());
        }
        // Reads see this transaction's own pending writes.
        let mut view = state.running.clone();
        drop(state);
        for op in self.ops.lock().await.iter() {
            op.apply(&mut view);
        }
        Ok(tree::get(&view, path).cloned())
    }

    async fn exists(&self, store: LogicalStore, path: &DataPath) -> Result<bool, DeviceError> {
        Ok(self.read(store, path).await?.is_some_and(|node| !node.is_null()))
    }

    async fn close(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

#[async_trait]
impl WriteTransaction for SimTransaction {
    async fn put(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.buffer(store, WriteOp::Put(path.clone(), data)).await
    }

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.buffer(store, WriteOp::Merge(path.clone(), data)).await
    }

    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        self.buffer(store, WriteOp::Delete(path.clone())).await
    }

    async fn cancel(&self) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ops.lock().await.clear();
        true
    }

    async fn commit(&self) -> Result<(), DeviceError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::Operation("transaction already finished".into()));
        }
        let ops = std::mem::take(&mut *self.ops.lock().await);
        let mut state = self.device.inner.state.lock().await;
        if state.locked {
            return Err(DeviceError::Operation("configuration is locked".into()));
        }
        for op in &ops {
            op.apply(&mut state.running);
        }
        debug!(device = %self.device.inner.id, ops = ops.len(), "Simulated commit applied");
        Ok(())
    }
}

#[async_trait]
impl DataBroker for SimulatedDevice {
    async fn new_read_only_transaction(&self) -> Result<Box<dyn ReadTransaction>, DeviceError> {
        Ok(Box::new(SimTransaction::new(self.clone())))
    }

    async fn new_write_only_transaction(&self) -> Result<Box<dyn WriteTransaction>, DeviceError> {
        Ok(Box::new(SimTransaction::new(self.clone())))
    }

    async fn new_read_write_transaction(&self) -> Result<Box<dyn ReadWriteTransaction>, DeviceError> {
        Ok(Box::new(SimTransaction::new(self.clone())))
    }

    fn create_transaction_chain(&self) -> Result<Arc<dyn DataBroker>, DeviceError> {
        Ok(Arc::new(self.clone()))
    }
}

impl SimulatedDevice {
    async fn edit(
        &self,
        store: LogicalStore,
        edit: impl FnOnce(&mut Value) -> Result<(), DeviceError> + Send,
    ) -> Result<(), DeviceError> {
        writable(store)?;
        let mut state = self.inner.state.lock().await;
        let DeviceState { running, candidate, .. } = &mut *state;
        let candidate = candidate.get_or_insert_with(|| running.clone());
        edit(candidate)
    }
}

#[async_trait]
impl DeviceDataTreeService for SimulatedDevice {
    async fn lock(&self) -> Result<(), DeviceError> {
        let mut state = self.inner.state.lock().await;
        if state.locked {
            return Err(DeviceError::Operation("lock denied: configuration already locked".into()));
        }
        state.locked = true;
        Ok(())
    }

    async fn unlock(&self) -> Result<(), DeviceError> {
        let mut state = self.inner.state.lock().await;
        if !state.locked {
            return Err(DeviceError::Operation("unlock failed: configuration is not locked".into()));
        }
        state.locked = false;
        Ok(())
    }

    async fn discard_changes(&self) -> Result<(), DeviceError> {
        self.inner.state.lock().await.candidate = None;
        Ok(())
    }

    async fn get(&self, path: &DataPath, fields: &[DataPath]) -> Result<Option<NormalizedNode>, DeviceError> {
        let state = self.inner.state.lock().await;
        let mut combined = state.running.clone();
        tree::merge(&mut combined, &DataPath::root(), state.operational.clone());
        Ok(tree::get(&combined, path).map(|node| tree::select(node, fields)))
    }

    async fn get_config(&self, path: &DataPath, fields: &[DataPath]) -> Result<Option<NormalizedNode>, DeviceError> {
        let state = self.inner.state.lock().await;
        Ok(tree::get(&state.running, path).map(|node| tree::select(node, fields)))
    }

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.edit(store, |candidate| {
            tree::merge(candidate, path, data);
            Ok(())
        })
        .await
    }

    async fn replace(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.edit(store, |candidate| {
            tree::put(candidate, path, data);
            Ok(())
        })
        .await
    }

    async fn create(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.edit(store, |candidate| {
            if tree::exists(candidate, path) {
                return Err(DeviceError::Operation(format!("data exists at {path}")));
            }
            tree::put(candidate, path, data);
            Ok(())
        })
        .await
    }

    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        self.edit(store, |candidate| {
            if tree::delete(candidate, path) {
                Ok(())
            } else {
                Err(DeviceError::Operation(format!("data missing at {path}")))
            }
        })
        .await
    }

    async fn remove(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        self.edit(store, |candidate| {
            tree::delete(candidate, path);
            Ok(())
        })
        .await
    }

    async fn commit(&self) -> Result<(), DeviceError> {
        let mut state = self.inner.state.lock().await;
        if let Some(candidate) = state.candidate.take() {
            state.running = candidate;
        }
        Ok(())
    }
}

#[async_trait]
impl RpcService for SimulatedDevice {
    async fn invoke_rpc(&self, name: &QName, input: Option<NormalizedNode>) -> Result<RpcResult, DeviceError> {
        match name.as_str() {
            "sim:echo" => Ok(RpcResult::success(input)),
            "sim:fail" => Ok(RpcResult::with_errors(vec![RpcError {
                tag: "operation-failed".into(),
                message: "simulated failure".into(),
            }])),
            _ => Err(DeviceError::RpcFailed {
                name: name.clone(),
                message: "unknown rpc".into(),
            }),
        }
    }
}

#[async_trait]
impl ActionService for SimulatedDevice {
    async fn invoke_action(
        &self,
        name: &QName,
        target: &DataTreeIdentifier,
        _input: Option<NormalizedNode>,
    ) -> Result<RpcResult, DeviceError> {
        if name.as_str() != "sim:reset" {
            return Err(DeviceError::ActionFailed {
                name: name.clone(),
                message: "unknown action".into(),
            });
        }
        let mut state = self.inner.state.lock().await;
        let root = match target.store {
            LogicalStore::Configuration => &mut state.running,
            LogicalStore::Operational => &mut state.operational,
        };
        let existed = tree::delete(root, &target.path);
        Ok(RpcResult::success(Some(json!({
            "reset": target.path.to_string(),
            "existed": existed,
        }))))
    }
}

#[async_trait]
impl SchemaSourceProvider for SimulatedDevice {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
        self.inner
            .sources
            .iter()
            .find(|source| &source.id == id)
            .cloned()
            .ok_or_else(|| SchemaError::MissingSource(id.clone()))
    }
}

struct SimSessionHandle {
    device: DeviceId,
    closed: AtomicBool,
    open_sessions: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionHandle for SimSessionHandle {
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.open_sessions.fetch_sub(1, Ordering::AcqRel);
            debug!(device = %self.device, "Simulated session closed");
        }
    }
}

/// Connector handing out sessions to simulated devices.
#[derive(Default)]
pub struct SimulatedConnector {
    devices: StdMutex<HashMap<String, Arc<SimulatedDevice>>>,
    sources: Option<Vec<SchemaSource>>,
    open_sessions: Arc<AtomicUsize>,
    connect_attempts: AtomicUsize,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema sources advertised by devices created from now on.
    pub fn with_schema_sources(mut self, sources: Vec<SchemaSource>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn device(&self, name: &str) -> Option<Arc<SimulatedDevice>> {
        self.devices().get(name).cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Acquire)
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SimulatedDevice>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeviceConnector for SimulatedConnector {
    async fn connect(&self, device: &DeviceId, _config: &NodeConfig) -> Result<DeviceSession, DeviceError> {
        self.connect_attempts.fetch_add(1, Ordering::AcqRel);
        if device.host == UNREACHABLE_HOST || device.port == 0 {
            return Err(DeviceError::ConnectionFailed(format!(
                "{}: connection refused",
                device.address()
            )));
        }

        let simulated = self
            .devices()
            .entry(device.name.clone())
            .or_insert_with(|| {
                let sources = self.sources.clone().unwrap_or_else(default_schema_sources);
                SimulatedDevice::with_sources(device.clone(), sources)
            })
            .clone();

        self.open_sessions.fetch_add(1, Ordering::AcqRel);
        let source_ids = simulated.source_ids();
        let mut capabilities = vec![BASE_CAPABILITY.to_string()];
        capabilities.extend(source_ids.iter().map(ToString::to_string));
        info!(device = %device, address = %device.address(), "Simulated session opened");

        Ok(DeviceSession {
            capabilities,
            source_ids,
            schema_sources: simulated.inner.sources.clone(),
            data_broker: simulated.clone(),
            data_tree: simulated.clone(),
            services: RemoteDeviceServices {
                rpc: simulated.clone(),
                actions: Some(simulated.clone()),
            },
            handle: Box::new(SimSessionHandle {
                device: device.clone(),
                closed: AtomicBool::new(false),
                open_sessions: self.open_sessions.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_id() -> DeviceId {
        DeviceId::new("node-1", "127.0.0.1", 1234)
    }

    fn path(s: &str) -> DataPath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_refuses_unreachable_hosts() {
        let connector = SimulatedConnector::new();
        let config = NodeConfig::new(UNREACHABLE_HOST, 830);
        let err = connector
            .connect(&DeviceId::new("n", UNREACHABLE_HOST, 830), &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::ConnectionFailed(_)));
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let connector = SimulatedConnector::new();
        let session = connector
            .connect(&device_id(), &NodeConfig::new("127.0.0.1", 1234))
            .await
            .unwrap();
        assert_eq!(session.source_ids.len(), 2);
        assert!(session.capabilities.contains(&BASE_CAPABILITY.to_string()));
        assert_eq!(connector.open_sessions(), 1);

        session.handle.close().await;
        session.handle.close().await;
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_write_transaction_reads_own_writes() {
        let device = SimulatedDevice::new(device_id());
        let tx = device.new_read_write_transaction().await.unwrap();
        tx.put(LogicalStore::Configuration, &path("/system/hostname"), json!("r1"))
            .await
            .unwrap();
        assert_eq!(
            tx.read(LogicalStore::Configuration, &path("/system/hostname")).await.unwrap(),
            Some(json!("r1"))
        );
        assert_eq!(device.running().await, json!({}));

        tx.commit().await.unwrap();
        assert_eq!(device.running().await, json!({"system": {"hostname": "r1"}}));
        assert!(!tx.cancel().await);
    }

    #[tokio::test]
    async fn test_operational_writes_rejected() {
        let device = SimulatedDevice::new(device_id());
        let tx = device.new_write_only_transaction().await.unwrap();
        let err = tx
            .put(LogicalStore::Operational, &path("/status"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported(_)));
        assert!(tx.cancel().await);
    }

    #[tokio::test]
    async fn test_candidate_editing() {
        let device = SimulatedDevice::new(device_id());
        device.lock().await.unwrap();
        assert!(DeviceDataTreeService::lock(device.as_ref()).await.is_err());

        DeviceDataTreeService::create(device.as_ref(), LogicalStore::Configuration, &path("/a"), json!(1))
            .await
            .unwrap();
        assert!(
            DeviceDataTreeService::create(device.as_ref(), LogicalStore::Configuration, &path("/a"), json!(2))
                .await
                .is_err()
        );
        assert!(device.get_config(&path("/a"), &[]).await.unwrap().is_none());

        DeviceDataTreeService::commit(device.as_ref()).await.unwrap();
        assert_eq!(device.get_config(&path("/a"), &[]).await.unwrap(), Some(json!(1)));

        DeviceDataTreeService::remove(device.as_ref(), LogicalStore::Configuration, &path("/missing"))
            .await
            .unwrap();
        assert!(
            DeviceDataTreeService::delete(device.as_ref(), LogicalStore::Configuration, &path("/missing"))
                .await
                .is_err()
        );
        device.discard_changes().await.unwrap();
        device.unlock().await.unwrap();
        assert!(!device.is_locked().await);
    }

    #[tokio::test]
    async fn test_rpcs_and_actions() {
        let device = SimulatedDevice::new(device_id());
        let echoed = device
            .invoke_rpc(&QName::new("sim:echo"), Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(echoed.output, Some(json!({"x": 1})));

        let failed = device.invoke_rpc(&QName::new("sim:fail"), None).await.unwrap();
        assert!(!failed.is_success());
        assert!(device.invoke_rpc(&QName::new("sim:nope"), None).await.is_err());

        let target = DataTreeIdentifier {
            store: LogicalStore::Operational,
            path: path("/status"),
        };
        let reset = device
            .invoke_action(&QName::new("sim:reset"), &target, None)
            .await
            .unwrap();
        assert_eq!(reset.output.unwrap()["existed"], json!(true));
    }
}
