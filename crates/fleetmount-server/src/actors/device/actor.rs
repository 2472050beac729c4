//! DeviceActor Implementation
//!
//! One actor type serves both roles a member can play for a device. On the
//! elected owner it is the master: it holds the live device services and
//! answers proxy requests. On every other member it is the slave endpoint of
//! the node manager: it receives `RegisterMountPoint` pushes, resolves the
//! schema and owns the local proxy mount point.

use super::master::MasterState;
use super::slave::SlaveState;
use crate::topology::TopologySetup;
use fleetmount_core::{DeviceError, DeviceId, MemberId};
use kameo::{Actor, RemoteActor};
use std::sync::Arc;

#[derive(Actor, RemoteActor)]
#[remote_actor(id = "fleetmount::DeviceActor")]
pub struct DeviceActor {
    /// Routing key of the device; replaced by `RefreshSetupMasterActorData`.
    pub(super) device_id: DeviceId,
    pub(super) setup: Arc<TopologySetup>,
    /// Present while this actor holds the device services.
    pub(super) master: Option<MasterState>,
    pub(super) slave: SlaveState,
}

impl DeviceActor {
    pub fn new(setup: Arc<TopologySetup>) -> Self {
        Self {
            device_id: setup.device_id().clone(),
            setup,
            master: None,
            slave: SlaveState::default(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub(super) fn member(&self) -> &MemberId {
        self.setup.member()
    }

    pub(super) fn master_state(&mut self) -> Result<&mut MasterState, DeviceError> {
        self.master
            .as_mut()
            .ok_or_else(|| DeviceError::not_master(&self.device_id))
    }
}
