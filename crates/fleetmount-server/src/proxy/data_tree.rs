//! Device data-tree proxy.

use super::MasterHandle;
use crate::actors::device::{
    CommitRequest, CreateEditConfigRequest, DeleteEditConfigRequest, DiscardChangesRequest, GetConfigRequest,
    GetRequest, LockRequest, MergeEditConfigRequest, PutEditConfigRequest, RemoveEditConfigRequest, UnlockRequest,
};
use async_trait::async_trait;
use fleetmount_core::device::DeviceDataTreeService;
use fleetmount_core::{DataPath, DeviceError, LogicalStore, NormalizedNode};

pub struct ProxyDataTreeService {
    handle: MasterHandle,
}

impl ProxyDataTreeService {
    pub fn new(handle: MasterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl DeviceDataTreeService for ProxyDataTreeService {
    async fn lock(&self) -> Result<(), DeviceError> {
        self.handle.ask("lock", LockRequest).await
    }

    async fn unlock(&self) -> Result<(), DeviceError> {
        self.handle.ask("unlock", UnlockRequest).await
    }

    async fn discard_changes(&self) -> Result<(), DeviceError> {
        self.handle.ask("discard-changes", DiscardChangesRequest).await
    }

    async fn get(&self, path: &DataPath, fields: &[DataPath]) -> Result<Option<NormalizedNode>, DeviceError> {
        let request = GetRequest {
            path: path.clone(),
            fields: fields.to_vec(),
        };
        self.handle.ask("get", request).await
    }

    async fn get_config(&self, path: &DataPath, fields: &[DataPath]) -> Result<Option<NormalizedNode>, DeviceError> {
        let request = GetConfigRequest {
            path: path.clone(),
            fields: fields.to_vec(),
        };
        self.handle.ask("get-config", request).await
    }

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        let request = MergeEditConfigRequest {
            store,
            path: path.clone(),
            data,
        };
        self.handle.ask("edit-merge", request).await
    }

    async fn replace(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        let request = PutEditConfigRequest {
            store,
            path: path.clone(),
            data,
        };
        self.handle.ask("edit-replace", request).await
    }

    async fn create(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        let request = CreateEditConfigRequest {
            store,
            path: path.clone(),
            data,
        };
        self.handle.ask("edit-create", request).await
    }

    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        let request = DeleteEditConfigRequest {
            store,
            path: path.clone(),
        };
        self.handle.ask("edit-delete", request).await
    }

    async fn remove(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        let request = RemoveEditConfigRequest {
            store,
            path: path.clone(),
        };
        self.handle.ask("edit-remove", request).await
    }

    async fn commit(&self) -> Result<(), DeviceError> {
        self.handle
            .ask("commit", CommitRequest)
            .await
            .map_err(|e| DeviceError::commit_failed(&self.handle.device_id, e))
    }
}
