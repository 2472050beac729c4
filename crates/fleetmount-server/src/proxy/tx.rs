//! Transaction proxy bound to one master-side transaction id.

use super::MasterHandle;
use crate::actors::device::{
    CancelRequest, DeleteRequest, ExistsRequest, MergeRequest, PutRequest, ReadRequest, SubmitRequest,
};
use async_trait::async_trait;
use fleetmount_core::device::{ReadTransaction, WriteTransaction};
use fleetmount_core::{DataPath, DeviceError, LogicalStore, NormalizedNode, TransactionId};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Submitted,
    Cancelled,
}

pub struct ProxyTransaction {
    handle: MasterHandle,
    id: TransactionId,
    state: Mutex<TxState>,
}

impl ProxyTransaction {
    pub fn new(handle: MasterHandle, id: TransactionId) -> Self {
        Self {
            handle,
            id,
            state: Mutex::new(TxState::Open),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        match *self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            TxState::Open => Ok(()),
            _ => Err(DeviceError::TransactionClosed(self.id)),
        }
    }

    /// Moves an open transaction to `next`; `false` if it was already closed.
    fn finish(&self, next: TxState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != TxState::Open {
            return false;
        }
        *state = next;
        true
    }
}

/// A proxy dropped while still open cancels its master-side transaction,
/// so abandoned proxies do not pin transactions on the master.
impl Drop for ProxyTransaction {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if *state != TxState::Open {
            return;
        }
        *state = TxState::Cancelled;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(device = %self.handle.device_id, tx = %self.id, "No runtime to cancel dropped transaction");
            return;
        };
        let handle = self.handle.clone();
        let tx = self.id;
        runtime.spawn(async move {
            if let Err(e) = handle.ask::<_, bool>("cancel", CancelRequest { tx }).await {
                debug!(device = %handle.device_id, tx = %tx, error = %e, "Failed to cancel dropped transaction");
            }
        });
    }
}

#[async_trait]
impl ReadTransaction for ProxyTransaction {
    async fn read(&self, store: LogicalStore, path: &DataPath) -> Result<Option<NormalizedNode>, DeviceError> {
        self.ensure_open()?;
        let request = ReadRequest {
            tx: self.id,
            store,
            path: path.clone(),
        };
        self.handle
            .ask("read", request)
            .await
            .map_err(|e| DeviceError::read_failed(&self.handle.device_id, store, path, e))
    }

    async fn exists(&self, store: LogicalStore, path: &DataPath) -> Result<bool, DeviceError> {
        self.ensure_open()?;
        let request = ExistsRequest {
            tx: self.id,
            store,
            path: path.clone(),
        };
        self.handle
            .ask("exists", request)
            .await
            .map_err(|e| DeviceError::read_failed(&self.handle.device_id, store, path, e))
    }

    async fn close(&self) {
        if !self.finish(TxState::Cancelled) {
            return;
        }
        if let Err(e) = self.handle.ask::<_, bool>("cancel", CancelRequest { tx: self.id }).await {
            warn!(device = %self.handle.device_id, tx = %self.id, error = %e, "Failed to close remote transaction");
        }
    }
}

#[async_trait]
impl WriteTransaction for ProxyTransaction {
    async fn put(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let request = PutRequest {
            tx: self.id,
            store,
            path: path.clone(),
            data,
        };
        self.handle.ask("put", request).await
    }

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let request = MergeRequest {
            tx: self.id,
            store,
            path: path.clone(),
            data,
        };
        self.handle.ask("merge", request).await
    }

    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let request = DeleteRequest {
            tx: self.id,
            store,
            path: path.clone(),
        };
        self.handle.ask("delete", request).await
    }

    async fn cancel(&self) -> bool {
        if !self.finish(TxState::Cancelled) {
            return false;
        }
        if let Err(e) = self.handle.ask::<_, bool>("cancel", CancelRequest { tx: self.id }).await {
            warn!(device = %self.handle.device_id, tx = %self.id, error = %e, "Failed to cancel remote transaction");
        }
        true
    }

    async fn commit(&self) -> Result<(), DeviceError> {
        if !self.finish(TxState::Submitted) {
            return Err(DeviceError::TransactionClosed(self.id));
        }
        self.handle
            .ask("submit", SubmitRequest { tx: self.id })
            .await
            .map_err(|e| DeviceError::commit_failed(&self.handle.device_id, e))
    }
}
