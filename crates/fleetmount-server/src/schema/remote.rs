//! Schema source provider backed by a master actor.

use crate::actors::device::YangTextSchemaSourceRequest;
use crate::cluster::ActorEndpoint;
use crate::proxy::MasterHandle;
use async_trait::async_trait;
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{DeviceError, DeviceId, SchemaError, SchemaSource, SourceIdentifier};
use std::time::Duration;

/// Fetches schema text from the master of one device. Registered in a
/// slave's registration scope for every source the master advertised.
#[derive(Clone)]
pub struct ProxySchemaSourceProvider {
    handle: MasterHandle,
}

impl ProxySchemaSourceProvider {
    pub fn new(device_id: DeviceId, master: impl Into<ActorEndpoint>, timeout: Duration) -> Self {
        Self {
            handle: MasterHandle::new(device_id, master, timeout),
        }
    }
}

#[async_trait]
impl SchemaSourceProvider for ProxySchemaSourceProvider {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
        let request = YangTextSchemaSourceRequest { source_id: id.clone() };
        match self.handle.ask("schema-source", request).await {
            Ok(source) => Ok(source),
            Err(DeviceError::MissingSchemaSource(missing)) => Err(SchemaError::MissingSource(missing)),
            Err(cause) => Err(SchemaError::SourceUnavailable { id: id.clone(), cause }),
        }
    }
}
