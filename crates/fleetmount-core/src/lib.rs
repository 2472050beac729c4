//! Fleetmount Core
//!
//! Identity, model, error types and the contracts of every external
//! collaborator (device sessions, cluster singleton election, datastore,
//! schema resolution) used by the fleetmount server.

pub mod cluster;
pub mod datastore;
pub mod device;
pub mod error;
pub mod identity;
pub mod model;
pub mod schema;

pub use error::{DataStoreError, DeviceError, MountError, RegistrationError, SchemaError, SetupError};
pub use identity::{DataPath, DeviceId, LogicalStore, MemberId, QName, SourceIdentifier, TransactionId};
pub use model::{
    ConnectionStatus, Credentials, DataTreeIdentifier, EffectiveSchemaContext, MountKey, NodeConfig, NodeStatus,
    NormalizedNode, RpcError, RpcResult, SchemaSource,
};
