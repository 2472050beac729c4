//! Device Service Contracts
//!
//! What a device session offers once connected. The same traits are
//! implemented by the real session on the owner and by the proxies on every
//! other member, so callers cannot tell the two apart.

use crate::error::DeviceError;
use crate::identity::{DataPath, DeviceId, LogicalStore, QName, SourceIdentifier};
use crate::model::{DataTreeIdentifier, NodeConfig, NormalizedNode, RpcResult, SchemaSource};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait ReadTransaction: Send + Sync {
    async fn read(&self, store: LogicalStore, path: &DataPath) -> Result<Option<NormalizedNode>, DeviceError>;

    async fn exists(&self, store: LogicalStore, path: &DataPath) -> Result<bool, DeviceError>;

    /// Releases the transaction without committing anything.
    async fn close(&self);
}

#[async_trait]
pub trait WriteTransaction: Send + Sync {
    async fn put(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError>;

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError>;

    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError>;

    /// Returns `false` when the transaction was already committed or cancelled.
    async fn cancel(&self) -> bool;

    async fn commit(&self) -> Result<(), DeviceError>;
}

pub trait ReadWriteTransaction: ReadTransaction + WriteTransaction {}

impl<T> ReadWriteTransaction for T where T: ReadTransaction + WriteTransaction + ?Sized {}

/// Transaction factory for a device's data tree.
#[async_trait]
pub trait DataBroker: Send + Sync {
    async fn new_read_only_transaction(&self) -> Result<Box<dyn ReadTransaction>, DeviceError>;

    async fn new_write_only_transaction(&self) -> Result<Box<dyn WriteTransaction>, DeviceError>;

    async fn new_read_write_transaction(&self) -> Result<Box<dyn ReadWriteTransaction>, DeviceError>;

    /// Chains order their transactions one after another.
    fn create_transaction_chain(&self) -> Result<Arc<dyn DataBroker>, DeviceError>;
}

/// Low-level device data-tree operations (candidate editing, locking).
#[async_trait]
pub trait DeviceDataTreeService: Send + Sync {
    async fn lock(&self) -> Result<(), DeviceError>;

    async fn unlock(&self) -> Result<(), DeviceError>;

    async fn discard_changes(&self) -> Result<(), DeviceError>;

    async fn get(&self, path: &DataPath, fields: &[DataPath]) -> Result<Option<NormalizedNode>, DeviceError>;

    async fn get_config(&self, path: &DataPath, fields: &[DataPath]) -> Result<Option<NormalizedNode>, DeviceError>;

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError>;

    async fn replace(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError>;

    /// Fails if data already exists at `path`.
    async fn create(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError>;

    /// Fails if no data exists at `path`.
    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError>;

    /// Like `delete`, but a missing node is not an error.
    async fn remove(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError>;

    async fn commit(&self) -> Result<(), DeviceError>;
}

#[async_trait]
pub trait RpcService: Send + Sync {
    async fn invoke_rpc(&self, name: &QName, input: Option<NormalizedNode>) -> Result<RpcResult, DeviceError>;
}

#[async_trait]
pub trait ActionService: Send + Sync {
    async fn invoke_action(
        &self,
        name: &QName,
        target: &DataTreeIdentifier,
        input: Option<NormalizedNode>,
    ) -> Result<RpcResult, DeviceError>;
}

/// Operation services a device exposes next to its data tree.
#[derive(Clone)]
pub struct RemoteDeviceServices {
    pub rpc: Arc<dyn RpcService>,
    pub actions: Option<Arc<dyn ActionService>>,
}

/// Handle keeping the underlying connection open.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn close(&self);
}

/// Everything a successful connection yields.
pub struct DeviceSession {
    pub capabilities: Vec<String>,
    pub source_ids: Vec<SourceIdentifier>,
    /// Texts for `source_ids`, served to slaves by the master.
    pub schema_sources: Vec<SchemaSource>,
    pub data_broker: Arc<dyn DataBroker>,
    pub data_tree: Arc<dyn DeviceDataTreeService>,
    pub services: RemoteDeviceServices,
    pub handle: Box<dyn SessionHandle>,
}

/// Opens device sessions. The wire protocol lives behind this trait.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, device: &DeviceId, config: &NodeConfig) -> Result<DeviceSession, DeviceError>;
}
