//! Data broker proxy: opens transactions on the master.

use super::{MasterHandle, ProxyTransaction};
use crate::actors::device::{NewReadTransactionRequest, NewReadWriteTransactionRequest, NewWriteTransactionRequest};
use async_trait::async_trait;
use fleetmount_core::device::{DataBroker, ReadTransaction, ReadWriteTransaction, WriteTransaction};
use fleetmount_core::DeviceError;
use std::sync::Arc;

pub struct ProxyDataBroker {
    handle: MasterHandle,
}

impl ProxyDataBroker {
    pub fn new(handle: MasterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl DataBroker for ProxyDataBroker {
    async fn new_read_only_transaction(&self) -> Result<Box<dyn ReadTransaction>, DeviceError> {
        let id = self.handle.ask("new-read-tx", NewReadTransactionRequest).await?;
        Ok(Box::new(ProxyTransaction::new(self.handle.clone(), id)))
    }

    async fn new_write_only_transaction(&self) -> Result<Box<dyn WriteTransaction>, DeviceError> {
        let id = self.handle.ask("new-write-tx", NewWriteTransactionRequest).await?;
        Ok(Box::new(ProxyTransaction::new(self.handle.clone(), id)))
    }

    async fn new_read_write_transaction(&self) -> Result<Box<dyn ReadWriteTransaction>, DeviceError> {
        let id = self
            .handle
            .ask("new-read-write-tx", NewReadWriteTransactionRequest)
            .await?;
        Ok(Box::new(ProxyTransaction::new(self.handle.clone(), id)))
    }

    fn create_transaction_chain(&self) -> Result<Arc<dyn DataBroker>, DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "transaction chains on proxied device {}",
            self.handle.device_id
        )))
    }
}
