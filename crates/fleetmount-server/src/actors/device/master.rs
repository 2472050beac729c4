//! Master Role
//!
//! Handlers that require the live device services. Every request received
//! before `CreateInitialMasterActorData` or after `DropMasterData` fails with
//! `NotMaster`.

use super::messages::*;
use super::DeviceActor;
use crate::topology::MemberServices;
use fleetmount_core::device::{
    DataBroker, DeviceDataTreeService, ReadTransaction, ReadWriteTransaction, RemoteDeviceServices, WriteTransaction,
};
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{
    DataPath, DeviceError, LogicalStore, NormalizedNode, RpcResult, SchemaError, SchemaSource, SourceIdentifier,
    TransactionId,
};
use kameo::actor::ActorRef;
use kameo::message::{Context, Message};
use kameo::remote_message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

enum TxHandle {
    Read(Box<dyn ReadTransaction>),
    Write(Box<dyn WriteTransaction>),
    ReadWrite(Box<dyn ReadWriteTransaction>),
}

impl TxHandle {
    fn idle_timeout(&self, services: &MemberServices) -> Option<Duration> {
        match self {
            Self::Read(_) => services.read_tx_idle_timeout,
            Self::Write(_) | Self::ReadWrite(_) => services.write_tx_idle_timeout,
        }
    }

    async fn read(&self, store: LogicalStore, path: &DataPath) -> Result<Option<NormalizedNode>, DeviceError> {
        match self {
            Self::Read(tx) => tx.read(store, path).await,
            Self::ReadWrite(tx) => tx.read(store, path).await,
            Self::Write(_) => Err(DeviceError::Unsupported("read on a write-only transaction".into())),
        }
    }

    async fn exists(&self, store: LogicalStore, path: &DataPath) -> Result<bool, DeviceError> {
        match self {
            Self::Read(tx) => tx.exists(store, path).await,
            Self::ReadWrite(tx) => tx.exists(store, path).await,
            Self::Write(_) => Err(DeviceError::Unsupported("exists on a write-only transaction".into())),
        }
    }

    fn writer(&self) -> Result<WriteHandle<'_>, DeviceError> {
        match self {
            Self::Write(tx) => Ok(WriteHandle::Write(tx.as_ref())),
            Self::ReadWrite(tx) => Ok(WriteHandle::ReadWrite(tx.as_ref())),
            Self::Read(_) => Err(DeviceError::Unsupported("write on a read-only transaction".into())),
        }
    }

    /// Releases the transaction without committing.
    async fn abandon(&self) -> bool {
        match self {
            Self::Read(tx) => {
                tx.close().await;
                true
            }
            Self::Write(tx) => tx.cancel().await,
            Self::ReadWrite(tx) => tx.cancel().await,
        }
    }

    async fn commit(&self) -> Result<(), DeviceError> {
        match self.writer()? {
            WriteHandle::Write(tx) => tx.commit().await,
            WriteHandle::ReadWrite(tx) => tx.commit().await,
        }
    }
}

enum WriteHandle<'a> {
    Write(&'a dyn WriteTransaction),
    ReadWrite(&'a dyn ReadWriteTransaction),
}

impl WriteHandle<'_> {
    async fn put(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        match self {
            Self::Write(tx) => tx.put(store, path, data).await,
            Self::ReadWrite(tx) => tx.put(store, path, data).await,
        }
    }

    async fn merge(&self, store: LogicalStore, path: &DataPath, data: NormalizedNode) -> Result<(), DeviceError> {
        match self {
            Self::Write(tx) => tx.merge(store, path, data).await,
            Self::ReadWrite(tx) => tx.merge(store, path, data).await,
        }
    }

    async fn delete(&self, store: LogicalStore, path: &DataPath) -> Result<(), DeviceError> {
        match self {
            Self::Write(tx) => tx.delete(store, path).await,
            Self::ReadWrite(tx) => tx.delete(store, path).await,
        }
    }
}

struct OpenTransaction {
    handle: TxHandle,
    /// First failed write; a submit after it is turned into a cancel.
    failure: Option<DeviceError>,
    last_activity: Instant,
}

impl OpenTransaction {
    fn new(handle: TxHandle) -> Self {
        Self {
            handle,
            failure: None,
            last_activity: Instant::now(),
        }
    }

    fn record(&mut self, result: Result<(), DeviceError>) -> Result<(), DeviceError> {
        self.last_activity = Instant::now();
        if let Err(e) = &result {
            self.failure.get_or_insert_with(|| e.clone());
        }
        result
    }
}

pub(super) struct MasterState {
    source_ids: Vec<SourceIdentifier>,
    schema_provider: Arc<dyn SchemaSourceProvider>,
    data_broker: Arc<dyn DataBroker>,
    data_tree: Arc<dyn DeviceDataTreeService>,
    services: RemoteDeviceServices,
    transactions: HashMap<TransactionId, OpenTransaction>,
    next_tx: u64,
    /// First failed edit since the last commit or discard.
    edit_failure: Option<DeviceError>,
}

impl MasterState {
    fn transaction(&mut self, tx: TransactionId) -> Result<&mut OpenTransaction, DeviceError> {
        self.transactions
            .get_mut(&tx)
            .ok_or(DeviceError::UnknownTransaction(tx))
    }

    /// Stores `handle` and returns its id with the idle timeout that applies.
    fn open(&mut self, handle: TxHandle, services: &MemberServices) -> (TransactionId, Option<Duration>) {
        self.next_tx += 1;
        let id = TransactionId(self.next_tx);
        let idle_timeout = handle.idle_timeout(services);
        self.transactions.insert(id, OpenTransaction::new(handle));
        (id, idle_timeout)
    }

    fn record_edit(&mut self, result: Result<(), DeviceError>) -> Result<(), DeviceError> {
        if let Err(e) = &result {
            self.edit_failure.get_or_insert_with(|| e.clone());
        }
        result
    }

    async fn release(self) {
        for (id, tx) in self.transactions {
            debug!(tx = %id, "Abandoning open transaction");
            tx.handle.abandon().await;
        }
    }
}

impl DeviceActor {
    /// Opens a transaction from `handle` and schedules its idle check.
    fn open_transaction(&mut self, actor_ref: &ActorRef<Self>, handle: TxHandle) -> Result<TransactionId, DeviceError> {
        let services = self.setup.services().clone();
        let (id, idle_timeout) = self.master_state()?.open(handle, &services);
        if let Some(timeout) = idle_timeout {
            schedule_idle_check(actor_ref, id, timeout);
        }
        Ok(id)
    }
}

fn schedule_idle_check(actor_ref: &ActorRef<DeviceActor>, tx: TransactionId, after: Duration) {
    let weak = actor_ref.downgrade();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        if let Some(actor_ref) = weak.upgrade() {
            if let Err(e) = actor_ref.tell(TransactionIdleCheck { tx }).send().await {
                debug!(tx = %tx, error = %e, "Device actor gone before idle check");
            }
        }
    });
}

fn schema_to_device_error(err: SchemaError) -> DeviceError {
    match err {
        SchemaError::MissingSource(id) => DeviceError::MissingSchemaSource(id),
        SchemaError::SourceUnavailable { cause, .. } => cause,
        other => DeviceError::Operation(other.to_string()),
    }
}

// ============================================================================
// Control
// ============================================================================

impl Message<CreateInitialMasterActorData> for DeviceActor {
    type Reply = MasterActorDataInitialized;

    async fn handle(
        &mut self,
        msg: CreateInitialMasterActorData,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let previous = self.master.replace(MasterState {
            source_ids: msg.source_ids,
            schema_provider: msg.schema_provider,
            data_broker: msg.data_broker,
            data_tree: msg.data_tree,
            services: msg.services,
            transactions: HashMap::new(),
            next_tx: 0,
            edit_failure: None,
        });
        if let Some(previous) = previous {
            previous.release().await;
        }
        // The owner serves the session itself.
        if self.slave.reset() {
            debug!(device = %self.device_id, "Withdrew slave mount point on becoming master");
        }

        info!(device = %self.device_id, member = %self.member(), "Master actor initialized");
        MasterActorDataInitialized {
            device: self.device_id.clone(),
        }
    }
}

impl Message<RefreshSetupMasterActorData> for DeviceActor {
    type Reply = SetupRefreshed;

    async fn handle(
        &mut self,
        msg: RefreshSetupMasterActorData,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(device = %msg.device_id, previous = %self.device_id.address(), "Refreshing actor setup");
        self.setup = msg.setup;
        self.device_id = msg.device_id;
        SetupRefreshed {
            device: self.device_id.clone(),
        }
    }
}

impl Message<DropMasterData> for DeviceActor {
    type Reply = ();

    async fn handle(&mut self, _msg: DropMasterData, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if let Some(master) = self.master.take() {
            info!(device = %self.device_id, open_transactions = master.transactions.len(), "Dropping master data");
            master.release().await;
        }
    }
}

#[remote_message("180ea596-b8fe-4b1b-ac20-34ce1d531b99")]
impl Message<AskForMasterMountPoint> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(
        &mut self,
        msg: AskForMasterMountPoint,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let source_ids = match &self.master {
            Some(master) => master.source_ids.clone(),
            None => {
                debug!(device = %self.device_id, "Mount point requested before master initialization");
                return Err(DeviceError::not_master(&self.device_id));
            }
        };

        let slave = self
            .setup
            .services()
            .directory
            .lookup(&msg.slave, &self.device_id.name)
            .await
            .ok_or_else(|| DeviceError::MasterUnreachable {
                device: self.device_id.to_string(),
                reason: format!("no slave actor for {} on {}", self.device_id.name, msg.slave),
            })?;

        let register = RegisterMountPoint {
            source_ids,
            master: self.member().clone(),
        };
        slave.tell(register).await.map_err(|e| DeviceError::MasterUnreachable {
            device: self.device_id.to_string(),
            reason: format!("slave actor unreachable: {e}"),
        })
    }
}

#[remote_message("1b46742c-49fb-4d6e-b142-1ef61c973c54")]
impl Message<YangTextSchemaSourceRequest> for DeviceActor {
    type Reply = Result<SchemaSource, DeviceError>;

    async fn handle(
        &mut self,
        msg: YangTextSchemaSourceRequest,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let provider = self.master_state()?.schema_provider.clone();
        provider
            .get_source(&msg.source_id)
            .await
            .map_err(schema_to_device_error)
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[remote_message("de689f69-87bb-4a4d-b10f-303570540772")]
impl Message<NewReadTransactionRequest> for DeviceActor {
    type Reply = Result<TransactionId, DeviceError>;

    async fn handle(
        &mut self,
        _msg: NewReadTransactionRequest,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let tx = self.master_state()?.data_broker.new_read_only_transaction().await?;
        self.open_transaction(&ctx.actor_ref(), TxHandle::Read(tx))
    }
}

#[remote_message("ebdc42ee-2d11-4682-b0f2-e8eb5aab6137")]
impl Message<NewWriteTransactionRequest> for DeviceActor {
    type Reply = Result<TransactionId, DeviceError>;

    async fn handle(
        &mut self,
        _msg: NewWriteTransactionRequest,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let tx = self.master_state()?.data_broker.new_write_only_transaction().await?;
        self.open_transaction(&ctx.actor_ref(), TxHandle::Write(tx))
    }
}

#[remote_message("f88ccba2-89b9-450e-8c21-f648cdec26fc")]
impl Message<NewReadWriteTransactionRequest> for DeviceActor {
    type Reply = Result<TransactionId, DeviceError>;

    async fn handle(
        &mut self,
        _msg: NewReadWriteTransactionRequest,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let tx = self.master_state()?.data_broker.new_read_write_transaction().await?;
        self.open_transaction(&ctx.actor_ref(), TxHandle::ReadWrite(tx))
    }
}

#[remote_message("1e7074a4-ead0-4957-a077-862a1225d360")]
impl Message<ReadRequest> for DeviceActor {
    type Reply = Result<Option<NormalizedNode>, DeviceError>;

    async fn handle(&mut self, msg: ReadRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let tx = self.master_state()?.transaction(msg.tx)?;
        tx.last_activity = Instant::now();
        tx.handle.read(msg.store, &msg.path).await
    }
}

#[remote_message("bb8055f7-b181-4aa7-bf2e-2fde90af8761")]
impl Message<ExistsRequest> for DeviceActor {
    type Reply = Result<bool, DeviceError>;

    async fn handle(&mut self, msg: ExistsRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let tx = self.master_state()?.transaction(msg.tx)?;
        tx.last_activity = Instant::now();
        tx.handle.exists(msg.store, &msg.path).await
    }
}

#[remote_message("343ca70d-926b-4565-889f-f423b940abe4")]
impl Message<PutRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: PutRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let tx = self.master_state()?.transaction(msg.tx)?;
        let result = tx.handle.writer()?.put(msg.store, &msg.path, msg.data).await;
        tx.record(result)
    }
}

#[remote_message("d1fee867-4d46-452e-84ae-d2200bf613c8")]
impl Message<MergeRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: MergeRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let tx = self.master_state()?.transaction(msg.tx)?;
        let result = tx.handle.writer()?.merge(msg.store, &msg.path, msg.data).await;
        tx.record(result)
    }
}

#[remote_message("b41615c7-4106-4996-ab4a-1c681b7b3ff0")]
impl Message<DeleteRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: DeleteRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let tx = self.master_state()?.transaction(msg.tx)?;
        let result = tx.handle.writer()?.delete(msg.store, &msg.path).await;
        tx.record(result)
    }
}

#[remote_message("44640fb8-0244-44e8-bceb-1cd3fe87f21e")]
impl Message<CancelRequest> for DeviceActor {
    type Reply = Result<bool, DeviceError>;

    async fn handle(&mut self, msg: CancelRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        let tx = master
            .transactions
            .remove(&msg.tx)
            .ok_or(DeviceError::UnknownTransaction(msg.tx))?;
        Ok(tx.handle.abandon().await)
    }
}

#[remote_message("6cb8567a-9a25-4237-a734-8f42395e2654")]
impl Message<SubmitRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: SubmitRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let device = self.device_id.clone();
        let master = self.master_state()?;
        let tx = master
            .transactions
            .remove(&msg.tx)
            .ok_or(DeviceError::UnknownTransaction(msg.tx))?;

        if let Some(failure) = tx.failure {
            warn!(device = %device, tx = %msg.tx, error = %failure, "Cancelling submit after failed write");
            tx.handle.abandon().await;
            return Err(DeviceError::commit_failed(&device, failure));
        }
        tx.handle
            .commit()
            .await
            .map_err(|e| DeviceError::commit_failed(&device, e))
    }
}

impl Message<TransactionIdleCheck> for DeviceActor {
    type Reply = ();

    async fn handle(&mut self, msg: TransactionIdleCheck, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let services = self.setup.services().clone();
        let Some(master) = self.master.as_mut() else {
            return;
        };
        let Some(tx) = master.transactions.get(&msg.tx) else {
            return;
        };
        let Some(timeout) = tx.handle.idle_timeout(&services) else {
            return;
        };

        let idle = tx.last_activity.elapsed();
        if idle < timeout {
            schedule_idle_check(&ctx.actor_ref(), msg.tx, timeout - idle);
            return;
        }
        if let Some(tx) = master.transactions.remove(&msg.tx) {
            warn!(device = %self.device_id, tx = %msg.tx, idle_secs = idle.as_secs(), "Releasing idle transaction");
            tx.handle.abandon().await;
        }
    }
}

impl Message<GetOpenTransactions> for DeviceActor {
    type Reply = usize;

    async fn handle(&mut self, _msg: GetOpenTransactions, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.master.as_ref().map_or(0, |master| master.transactions.len())
    }
}

// ============================================================================
// Device data tree
// ============================================================================

#[remote_message("3c378a94-ef67-4e8f-982f-7d757d78bb03")]
impl Message<LockRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, _msg: LockRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.master_state()?.data_tree.lock().await
    }
}

#[remote_message("a1fb938a-0e98-45cb-ae47-cfd2a277322a")]
impl Message<UnlockRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, _msg: UnlockRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.master_state()?.data_tree.unlock().await
    }
}

#[remote_message("469a0217-175f-4dd2-8e2d-d27692be4c4e")]
impl Message<DiscardChangesRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, _msg: DiscardChangesRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        master.edit_failure = None;
        master.data_tree.discard_changes().await
    }
}

#[remote_message("268d2e72-349e-4943-a739-2f5e812af31f")]
impl Message<GetRequest> for DeviceActor {
    type Reply = Result<Option<NormalizedNode>, DeviceError>;

    async fn handle(&mut self, msg: GetRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.master_state()?.data_tree.get(&msg.path, &msg.fields).await
    }
}

#[remote_message("aede3aa2-a718-49b7-b001-fcb948a9b93a")]
impl Message<GetConfigRequest> for DeviceActor {
    type Reply = Result<Option<NormalizedNode>, DeviceError>;

    async fn handle(&mut self, msg: GetConfigRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.master_state()?.data_tree.get_config(&msg.path, &msg.fields).await
    }
}

#[remote_message("d2fb4cfb-18fb-4bf2-823b-ec9c61864ac5")]
impl Message<MergeEditConfigRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: MergeEditConfigRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        let result = master.data_tree.merge(msg.store, &msg.path, msg.data).await;
        master.record_edit(result)
    }
}

#[remote_message("80048335-1a59-41ab-ba9b-fa8e1d500386")]
impl Message<PutEditConfigRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: PutEditConfigRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        let result = master.data_tree.replace(msg.store, &msg.path, msg.data).await;
        master.record_edit(result)
    }
}

#[remote_message("0a23f7e7-ed2b-4488-ab4a-6f29f655f094")]
impl Message<CreateEditConfigRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: CreateEditConfigRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        let result = master.data_tree.create(msg.store, &msg.path, msg.data).await;
        master.record_edit(result)
    }
}

#[remote_message("35dfcd1a-3992-4809-a94c-4d8fae101870")]
impl Message<DeleteEditConfigRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: DeleteEditConfigRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        let result = master.data_tree.delete(msg.store, &msg.path).await;
        master.record_edit(result)
    }
}

#[remote_message("68cfaa61-45da-4aec-83f5-b1aa3d5114de")]
impl Message<RemoveEditConfigRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, msg: RemoveEditConfigRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let master = self.master_state()?;
        let result = master.data_tree.remove(msg.store, &msg.path).await;
        master.record_edit(result)
    }
}

#[remote_message("27003e9b-d52e-4c89-8e8c-a95d36c46298")]
impl Message<CommitRequest> for DeviceActor {
    type Reply = Result<(), DeviceError>;

    async fn handle(&mut self, _msg: CommitRequest, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let device = self.device_id.clone();
        let master = self.master_state()?;
        if let Some(failure) = master.edit_failure.take() {
            warn!(device = %device, error = %failure, "Discarding changes after failed edit");
            if let Err(e) = master.data_tree.discard_changes().await {
                warn!(device = %device, error = %e, "Discard after failed edit also failed");
            }
            return Err(DeviceError::commit_failed(&device, failure));
        }
        master
            .data_tree
            .commit()
            .await
            .map_err(|e| DeviceError::commit_failed(&device, e))
    }
}

// ============================================================================
// RPCs and actions
// ============================================================================

#[remote_message("76d00317-2dda-471f-a8cd-7f3a3b4eb689")]
impl Message<InvokeRpcMessage> for DeviceActor {
    type Reply = Result<RpcResult, DeviceError>;

    async fn handle(&mut self, msg: InvokeRpcMessage, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let rpc = self.master_state()?.services.rpc.clone();
        rpc.invoke_rpc(&msg.name, msg.input).await
    }
}

#[remote_message("cbf0f0f3-4409-410d-87de-8d3274ad22f0")]
impl Message<InvokeActionMessage> for DeviceActor {
    type Reply = Result<RpcResult, DeviceError>;

    async fn handle(&mut self, msg: InvokeActionMessage, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let actions = self
            .master_state()?
            .services
            .actions
            .clone()
            .ok_or_else(|| DeviceError::Unsupported("actions on this device".into()))?;
        actions.invoke_action(&msg.name, &msg.target, msg.input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;
    use crate::testing::TestCluster;
    use fleetmount_core::{DeviceId, MemberId, QName};
    use kameo::error::SendError;
    use kameo::Actor;
    use serde_json::json;

    fn path(s: &str) -> DataPath {
        s.parse().unwrap()
    }

    async fn spawn_master(device: &Arc<SimulatedDevice>) -> ActorRef<DeviceActor> {
        let cluster = TestCluster::new();
        let setup = cluster.setup("member-1", "node-1", fleetmount_core::NodeConfig::new("127.0.0.1", 1234));
        let actor_ref = DeviceActor::spawn(DeviceActor::new(Arc::new(setup)));
        let initialized = actor_ref
            .ask(CreateInitialMasterActorData {
                data_broker: device.clone(),
                data_tree: device.clone(),
                source_ids: device.source_ids(),
                services: RemoteDeviceServices {
                    rpc: device.clone(),
                    actions: Some(device.clone()),
                },
                schema_provider: device.clone(),
            })
            .send()
            .await;
        assert!(initialized.is_ok());
        actor_ref
    }

    fn handler_error<M, T>(result: Result<T, SendError<M, DeviceError>>) -> DeviceError {
        match result {
            Err(SendError::HandlerError(e)) => e,
            Ok(_) => panic!("expected a handler error, got a reply"),
            Err(_) => panic!("expected a handler error, got a send failure"),
        }
    }

    #[tokio::test]
    async fn test_uninitialized_actor_is_not_master() {
        let cluster = TestCluster::new();
        let setup = cluster.setup("member-1", "node-1", fleetmount_core::NodeConfig::new("127.0.0.1", 1234));
        let actor_ref = DeviceActor::spawn(DeviceActor::new(Arc::new(setup)));

        let err = handler_error(actor_ref.ask(NewReadTransactionRequest).send().await);
        assert_eq!(err, DeviceError::not_master(&DeviceId::new("node-1", "127.0.0.1", 1234)));
    }

    #[tokio::test]
    async fn test_transaction_round_trip() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let master = spawn_master(&device).await;

        let tx = master.ask(NewReadWriteTransactionRequest).send().await.unwrap();
        master
            .ask(PutRequest {
                tx,
                store: LogicalStore::Configuration,
                path: path("/system"),
                data: json!({"hostname": "r1"}),
            })
            .send()
            .await
            .unwrap();
        master.ask(SubmitRequest { tx }).send().await.unwrap();
        assert_eq!(device.running().await, json!({"system": {"hostname": "r1"}}));

        let err = handler_error(master.ask(SubmitRequest { tx }).send().await);
        assert_eq!(err, DeviceError::UnknownTransaction(tx));
    }

    #[tokio::test]
    async fn test_failed_write_aborts_submit() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let master = spawn_master(&device).await;

        let tx = master.ask(NewWriteTransactionRequest).send().await.unwrap();
        master
            .ask(PutRequest {
                tx,
                store: LogicalStore::Configuration,
                path: path("/a"),
                data: json!(1),
            })
            .send()
            .await
            .unwrap();
        let _ = master
            .ask(PutRequest {
                tx,
                store: LogicalStore::Operational,
                path: path("/b"),
                data: json!(2),
            })
            .send()
            .await;

        let err = handler_error(master.ask(SubmitRequest { tx }).send().await);
        assert!(matches!(err, DeviceError::CommitFailed { .. }));
        assert!(matches!(err.root_cause(), DeviceError::Unsupported(_)));
        assert_eq!(device.running().await, json!({}));
    }

    #[tokio::test]
    async fn test_failed_edit_aborts_commit() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let master = spawn_master(&device).await;

        master
            .ask(MergeEditConfigRequest {
                store: LogicalStore::Configuration,
                path: path("/a"),
                data: json!(1),
            })
            .send()
            .await
            .unwrap();
        let _ = master
            .ask(DeleteEditConfigRequest {
                store: LogicalStore::Configuration,
                path: path("/missing"),
            })
            .send()
            .await;
        let err = handler_error(master.ask(CommitRequest).send().await);
        assert!(matches!(err, DeviceError::CommitFailed { .. }));
        assert_eq!(device.running().await, json!({}));

        // The failure does not stick to the next edit cycle.
        master
            .ask(MergeEditConfigRequest {
                store: LogicalStore::Configuration,
                path: path("/a"),
                data: json!(1),
            })
            .send()
            .await
            .unwrap();
        master.ask(CommitRequest).send().await.unwrap();
        assert_eq!(device.running().await, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_drop_master_data_releases_services() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let master = spawn_master(&device).await;

        let result = master
            .ask(InvokeRpcMessage {
                name: QName::new("sim:echo"),
                input: Some(json!({"ping": 1})),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(result.output, Some(json!({"ping": 1})));

        master.tell(DropMasterData).send().await.unwrap();
        let err = handler_error(
            master
                .ask(InvokeRpcMessage {
                    name: QName::new("sim:echo"),
                    input: None,
                })
                .send()
                .await,
        );
        assert!(matches!(err, DeviceError::NotMaster { .. }));
    }

    #[tokio::test]
    async fn test_schema_source_requests() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let master = spawn_master(&device).await;

        let id = SourceIdentifier::new("sim-device", Some("2024-01-01"));
        let source = master
            .ask(YangTextSchemaSourceRequest { source_id: id.clone() })
            .send()
            .await
            .unwrap();
        assert_eq!(source.id, id);

        let missing = SourceIdentifier::new("absent", None);
        let err = handler_error(
            master
                .ask(YangTextSchemaSourceRequest {
                    source_id: missing.clone(),
                })
                .send()
                .await,
        );
        assert_eq!(err, DeviceError::MissingSchemaSource(missing));
    }

    #[tokio::test]
    async fn test_idle_write_transaction_is_cancelled() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let cluster = TestCluster::new().with_write_tx_idle_timeout(Duration::from_millis(50));
        let setup = cluster.setup("member-1", "node-1", fleetmount_core::NodeConfig::new("127.0.0.1", 1234));
        let master = DeviceActor::spawn(DeviceActor::new(Arc::new(setup)));
        let initialized = master
            .ask(CreateInitialMasterActorData {
                data_broker: device.clone(),
                data_tree: device.clone(),
                source_ids: device.source_ids(),
                services: RemoteDeviceServices {
                    rpc: device.clone(),
                    actions: None,
                },
                schema_provider: device.clone(),
            })
            .send()
            .await;
        assert!(initialized.is_ok());

        let tx = master.ask(NewWriteTransactionRequest).send().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = handler_error(
            master
                .ask(DeleteRequest {
                    tx,
                    store: LogicalStore::Configuration,
                    path: path("/a"),
                })
                .send()
                .await,
        );
        assert_eq!(err, DeviceError::UnknownTransaction(tx));
    }

    async fn initialize(actor_ref: &ActorRef<DeviceActor>, device: &Arc<SimulatedDevice>) {
        let initialized = actor_ref
            .ask(CreateInitialMasterActorData {
                data_broker: device.clone(),
                data_tree: device.clone(),
                source_ids: device.source_ids(),
                services: RemoteDeviceServices {
                    rpc: device.clone(),
                    actions: None,
                },
                schema_provider: device.clone(),
            })
            .send()
            .await;
        assert!(initialized.is_ok());
    }

    #[tokio::test]
    async fn test_idle_read_transaction_is_released() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let cluster = TestCluster::new().with_read_tx_idle_timeout(Duration::from_millis(50));
        let setup = cluster.setup("member-1", "node-1", fleetmount_core::NodeConfig::new("127.0.0.1", 1234));
        let master = DeviceActor::spawn(DeviceActor::new(Arc::new(setup)));
        initialize(&master, &device).await;

        let tx = master.ask(NewReadTransactionRequest).send().await.unwrap();
        // Write transactions are not bound by the read timeout.
        let write_tx = master.ask(NewWriteTransactionRequest).send().await.unwrap();
        assert_eq!(master.ask(GetOpenTransactions).send().await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(master.ask(GetOpenTransactions).send().await.unwrap(), 1);
        let err = handler_error(
            master
                .ask(ReadRequest {
                    tx,
                    store: LogicalStore::Operational,
                    path: path("/system"),
                })
                .send()
                .await,
        );
        assert_eq!(err, DeviceError::UnknownTransaction(tx));
        assert!(master.ask(CancelRequest { tx: write_tx }).send().await.is_ok());
    }

    #[tokio::test]
    async fn test_mount_point_request_pushes_to_slave() {
        let device = SimulatedDevice::new(DeviceId::new("node-1", "127.0.0.1", 1234));
        let cluster = TestCluster::new();
        let config = fleetmount_core::NodeConfig::new("127.0.0.1", 1234);
        let (owner, other) = (MemberId::new("member-1"), MemberId::new("member-2"));

        let master_setup = Arc::new(cluster.setup("member-1", "node-1", config.clone()));
        let master = cluster
            .member("member-1")
            .directory
            .get_or_spawn(&owner, "node-1", || DeviceActor::new(master_setup))
            .await;
        initialize(&master, &device).await;
        let slave_setup = Arc::new(cluster.setup("member-2", "node-1", config));
        let slave = cluster
            .member("member-2")
            .directory
            .get_or_spawn(&other, "node-1", || DeviceActor::new(slave_setup))
            .await;

        let err = handler_error(
            master
                .ask(AskForMasterMountPoint {
                    slave: MemberId::new("member-3"),
                })
                .send()
                .await,
        );
        assert!(matches!(err, DeviceError::MasterUnreachable { .. }));

        master
            .ask(AskForMasterMountPoint { slave: other })
            .send()
            .await
            .unwrap();
        let mounted = crate::testing::eventually(Duration::from_secs(2), || {
            let slave = slave.clone();
            async move { matches!(slave.ask(GetMountState).send().await, Ok(MountState::Mounted { .. })) }
        })
        .await;
        assert!(mounted);
        assert_eq!(
            slave.ask(GetMountState).send().await.unwrap(),
            MountState::Mounted { master: owner }
        );
    }
}
