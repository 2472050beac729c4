//! Slave Role
//!
//! A slave actor learns its master from `RegisterMountPoint`, looks the
//! master's actor up in the directory, makes the master's schema sources
//! resolvable through a scope of its own, resolves them off the actor loop
//! and, on success, registers a mount point whose services are proxies to
//! the master.
//!
//! Every registration bumps a generation counter. Resolution results carry
//! the generation they were started for; anything older than the current one
//! is discarded, so at most one mount point and one registration scope exist
//! per actor.

use super::messages::*;
use super::DeviceActor;
use crate::cluster::ActorEndpoint;
use crate::mount::{MountPoint, MountRegistration, MountRole};
use crate::observability::{events, metrics};
use crate::proxy::{MasterHandle, ProxyActionService, ProxyDataBroker, ProxyDataTreeService, ProxyRpcService};
use crate::schema::{ProxySchemaSourceProvider, RegistrationScope};
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{EffectiveSchemaContext, MemberId, SourceIdentifier};
use kameo::actor::ActorRef;
use kameo::message::{Context, Message};
use kameo::remote_message;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolution attempts made after the first one failed on an ask timeout.
const ASK_TIMEOUT_RETRIES: u32 = 1;

struct PendingMount {
    master: ActorEndpoint,
    master_member: MemberId,
    source_ids: Vec<SourceIdentifier>,
}

pub(super) struct SlaveState {
    generation: u64,
    pending: Option<PendingMount>,
    scope: Option<Arc<RegistrationScope>>,
    mount: Option<MountRegistration>,
    state: MountState,
    /// Cancelled whenever in-flight resolutions become stale.
    cancel: CancellationToken,
}

impl Default for SlaveState {
    fn default() -> Self {
        Self {
            generation: 0,
            pending: None,
            scope: None,
            mount: None,
            state: MountState::Idle,
            cancel: CancellationToken::new(),
        }
    }
}

impl SlaveState {
    /// Withdraws the mount point and schema registrations and invalidates any
    /// in-flight resolution. Returns whether a mount point was closed.
    pub(super) fn reset(&mut self) -> bool {
        self.generation += 1;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.pending = None;
        self.state = MountState::Idle;

        let unmounted = match self.mount.take() {
            Some(mount) => {
                mount.close();
                true
            }
            None => false,
        };
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
        unmounted
    }

    fn fail(&mut self, reason: String) {
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
        self.pending = None;
        self.state = MountState::Failed { reason };
    }
}

impl DeviceActor {
    fn spawn_resolution(&self, actor_ref: ActorRef<Self>, attempt: u32) {
        let (Some(pending), Some(scope)) = (&self.slave.pending, &self.slave.scope) else {
            return;
        };
        let generation = self.slave.generation;
        let cancel = self.slave.cancel.clone();
        let source_ids = pending.source_ids.clone();
        let provider: Arc<dyn SchemaSourceProvider> = scope.clone();
        let resolver = self.setup.schema_resources().resolver.clone();
        let device = self.device_id.clone();
        let weak = actor_ref.downgrade();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = resolver.resolve(provider, &source_ids) => result,
            };
            let Some(actor_ref) = weak.upgrade() else {
                return;
            };
            let resolved = SchemaResolved {
                generation,
                attempt,
                result,
            };
            if let Err(e) = actor_ref.tell(resolved).send().await {
                debug!(device = %device, error = %e, "Slave actor gone before schema resolution finished");
            }
        });
    }

    fn mount_proxies(&mut self, schema: EffectiveSchemaContext) {
        let (Some(pending), Some(scope)) = (self.slave.pending.take(), self.slave.scope.clone()) else {
            return;
        };
        let handle = MasterHandle::new(self.device_id.clone(), pending.master, self.setup.ask_timeout());
        let mount = MountPoint {
            device_id: self.device_id.clone(),
            role: MountRole::Slave,
            master: pending.master_member.clone(),
            schema,
            data_broker: Arc::new(ProxyDataBroker::new(handle.clone())),
            data_tree: Arc::new(ProxyDataTreeService::new(handle.clone())),
            rpc: Arc::new(ProxyRpcService::new(handle.clone())),
            actions: Some(Arc::new(ProxyActionService::new(handle))),
            schema_provider: scope,
        };

        match self.setup.services().mount_points.register(mount) {
            Ok(registration) => {
                info!(device = %self.device_id, master = %pending.master_member, "Slave mount point registered");
                metrics::record_schema_resolution("success");
                self.slave.mount = Some(registration);
                self.slave.state = MountState::Mounted {
                    master: pending.master_member,
                };
            }
            Err(e) => {
                warn!(device = %self.device_id, error = %e, "Slave mount point registration failed");
                self.slave.fail(e.to_string());
            }
        }
    }
}

#[remote_message("d4d2b3aa-6675-4733-be23-9578ee7a8ffb")]
impl Message<RegisterMountPoint> for DeviceActor {
    type Reply = ();

    async fn handle(&mut self, msg: RegisterMountPoint, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.master.is_some() {
            debug!(device = %self.device_id, master = %msg.master, "Ignoring mount point push while holding the session");
            return;
        }
        if self.slave.reset() {
            debug!(device = %self.device_id, "Replacing existing slave mount point");
        }

        let directory = &self.setup.services().directory;
        let Some(master) = directory.lookup(&msg.master, &self.device_id.name).await else {
            warn!(device = %self.device_id, master = %msg.master, "Master actor not found for mount point push");
            self.slave.fail(format!("no master actor for {} on {}", self.device_id.name, msg.master));
            return;
        };

        let scope = Arc::new(self.setup.schema_resources().attempt_scope());
        let provider = Arc::new(ProxySchemaSourceProvider::new(
            self.device_id.clone(),
            master.clone(),
            self.setup.ask_timeout(),
        ));
        for id in &msg.source_ids {
            scope.register(id.clone(), provider.clone());
        }

        info!(
            device = %self.device_id,
            master = %msg.master,
            remote = !master.is_local(),
            sources = msg.source_ids.len(),
            "Resolving schema for slave mount point"
        );
        self.slave.scope = Some(scope);
        self.slave.pending = Some(PendingMount {
            master,
            master_member: msg.master,
            source_ids: msg.source_ids,
        });
        self.slave.state = MountState::Resolving { attempt: 0 };
        self.spawn_resolution(ctx.actor_ref(), 0);
    }
}

impl Message<SchemaResolved> for DeviceActor {
    type Reply = ();

    async fn handle(&mut self, msg: SchemaResolved, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if msg.generation != self.slave.generation || self.slave.pending.is_none() {
            debug!(
                device = %self.device_id,
                generation = msg.generation,
                current = self.slave.generation,
                "Discarding stale schema resolution"
            );
            return;
        }

        match msg.result {
            Ok(schema) => self.mount_proxies(schema),
            Err(e) if e.is_ask_timeout() && msg.attempt < ASK_TIMEOUT_RETRIES => {
                let attempt = msg.attempt + 1;
                events::schema_resolution_failed(&self.device_id.name, msg.attempt, true, &e.to_string());
                metrics::record_schema_resolution("retried");
                self.slave.state = MountState::Resolving { attempt };
                self.spawn_resolution(ctx.actor_ref(), attempt);
            }
            Err(e) => {
                events::schema_resolution_failed(&self.device_id.name, msg.attempt, false, &e.to_string());
                metrics::record_schema_resolution("failed");
                self.slave.fail(e.to_string());
            }
        }
    }
}

impl Message<UnregisterSlaveMountPoint> for DeviceActor {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: UnregisterSlaveMountPoint,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.slave.reset() {
            info!(device = %self.device_id, "Slave mount point unregistered");
        }
    }
}

impl Message<GetMountState> for DeviceActor {
    type Reply = MountState;

    async fn handle(&mut self, _msg: GetMountState, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.slave.state.clone()
    }
}
