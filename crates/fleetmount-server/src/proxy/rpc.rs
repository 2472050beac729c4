//! RPC and action proxies.

use super::MasterHandle;
use crate::actors::device::{InvokeActionMessage, InvokeRpcMessage};
use async_trait::async_trait;
use fleetmount_core::device::{ActionService, RpcService};
use fleetmount_core::{DataTreeIdentifier, DeviceError, NormalizedNode, QName, RpcResult};
use tracing::debug;

pub struct ProxyRpcService {
    handle: MasterHandle,
}

impl ProxyRpcService {
    pub fn new(handle: MasterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl RpcService for ProxyRpcService {
    async fn invoke_rpc(&self, name: &QName, input: Option<NormalizedNode>) -> Result<RpcResult, DeviceError> {
        debug!(device = %self.handle.device_id, rpc = %name, "Forwarding rpc to master");
        let request = InvokeRpcMessage {
            name: name.clone(),
            input,
        };
        self.handle.ask("rpc", request).await
    }
}

pub struct ProxyActionService {
    handle: MasterHandle,
}

impl ProxyActionService {
    pub fn new(handle: MasterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ActionService for ProxyActionService {
    async fn invoke_action(
        &self,
        name: &QName,
        target: &DataTreeIdentifier,
        input: Option<NormalizedNode>,
    ) -> Result<RpcResult, DeviceError> {
        debug!(device = %self.handle.device_id, action = %name, path = %target.path, "Forwarding action to master");
        let request = InvokeActionMessage {
            name: name.clone(),
            target: target.clone(),
            input,
        };
        self.handle.ask("action", request).await
    }
}
