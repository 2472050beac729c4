//! DeviceActor Message Types
//!
//! Control messages drive the master and slave roles; the data-tree, RPC and
//! action requests are what proxies send to a master.

use crate::topology::TopologySetup;
use fleetmount_core::device::{DataBroker, DeviceDataTreeService, RemoteDeviceServices};
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{
    DataPath, DataTreeIdentifier, DeviceId, EffectiveSchemaContext, LogicalStore, MemberId, NormalizedNode, QName,
    SchemaError, SourceIdentifier, TransactionId,
};
use kameo::Reply;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Control
// ============================================================================

/// Hands the live device services to a freshly elected master.
pub struct CreateInitialMasterActorData {
    pub data_broker: Arc<dyn DataBroker>,
    pub data_tree: Arc<dyn DeviceDataTreeService>,
    pub source_ids: Vec<SourceIdentifier>,
    pub services: RemoteDeviceServices,
    /// Serves `YangTextSchemaSourceRequest`s from slaves.
    pub schema_provider: Arc<dyn SchemaSourceProvider>,
}

#[derive(Debug, Clone, Reply)]
pub struct MasterActorDataInitialized {
    pub device: DeviceId,
}

/// Replaces the actor's setup snapshot and device identity. Services a
/// master already holds are kept.
pub struct RefreshSetupMasterActorData {
    pub setup: Arc<TopologySetup>,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Reply)]
pub struct SetupRefreshed {
    pub device: DeviceId,
}

/// Releases the services of a master that lost ownership. Open transactions
/// are cancelled.
#[derive(Debug, Clone)]
pub struct DropMasterData;

/// Sent by a slave's node manager to the owner's actor. An initialized master
/// answers by pushing `RegisterMountPoint` to the actor `slave` runs for the
/// same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForMasterMountPoint {
    pub slave: MemberId,
}

/// Pushed by a master to a slave actor. The slave reaches the master through
/// its actor directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMountPoint {
    pub source_ids: Vec<SourceIdentifier>,
    pub master: MemberId,
}

/// Outcome of one background schema resolution, sent by the actor to itself.
pub struct SchemaResolved {
    pub generation: u64,
    pub attempt: u32,
    pub result: Result<EffectiveSchemaContext, SchemaError>,
}

#[derive(Debug, Clone)]
pub struct UnregisterSlaveMountPoint;

/// Number of transactions the master holds open.
#[derive(Debug, Clone)]
pub struct GetOpenTransactions;

/// Query the slave-side mount state.
#[derive(Debug, Clone)]
pub struct GetMountState;

#[derive(Debug, Clone, PartialEq, Eq, Reply)]
pub enum MountState {
    Idle,
    Resolving { attempt: u32 },
    Mounted { master: MemberId },
    Failed { reason: String },
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YangTextSchemaSourceRequest {
    pub source_id: SourceIdentifier,
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReadTransactionRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWriteTransactionRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReadWriteTransactionRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub tx: TransactionId,
    pub store: LogicalStore,
    pub path: DataPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsRequest {
    pub tx: TransactionId,
    pub store: LogicalStore,
    pub path: DataPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub tx: TransactionId,
    pub store: LogicalStore,
    pub path: DataPath,
    pub data: NormalizedNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub tx: TransactionId,
    pub store: LogicalStore,
    pub path: DataPath,
    pub data: NormalizedNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub tx: TransactionId,
    pub store: LogicalStore,
    pub path: DataPath,
}

/// Cancels a write transaction or closes a read transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub tx: TransactionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tx: TransactionId,
}

/// Scheduled by the master itself to enforce the idle timeouts.
#[derive(Debug, Clone)]
pub struct TransactionIdleCheck {
    pub tx: TransactionId,
}

// ============================================================================
// Device data tree
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscardChangesRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub path: DataPath,
    pub fields: Vec<DataPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigRequest {
    pub path: DataPath,
    pub fields: Vec<DataPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeEditConfigRequest {
    pub store: LogicalStore,
    pub path: DataPath,
    pub data: NormalizedNode,
}

/// Replaces the data at `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutEditConfigRequest {
    pub store: LogicalStore,
    pub path: DataPath,
    pub data: NormalizedNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEditConfigRequest {
    pub store: LogicalStore,
    pub path: DataPath,
    pub data: NormalizedNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteEditConfigRequest {
    pub store: LogicalStore,
    pub path: DataPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveEditConfigRequest {
    pub store: LogicalStore,
    pub path: DataPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest;

// ============================================================================
// RPCs and actions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRpcMessage {
    pub name: QName,
    pub input: Option<NormalizedNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeActionMessage {
    pub name: QName,
    pub target: DataTreeIdentifier,
    pub input: Option<NormalizedNode>,
}
