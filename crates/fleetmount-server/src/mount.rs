//! Mount Point Service
//!
//! Per-member registry of device mount points. A mount point bundles the
//! schema context and every service of one device, either the live session
//! (master role) or the proxies (slave role). At most one mount point per
//! device name exists on a member at any time.

use crate::observability::{events, metrics};
use fleetmount_core::device::{ActionService, DataBroker, DeviceDataTreeService, RpcService};
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{DeviceId, EffectiveSchemaContext, MemberId, MountError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MountRole {
    Master,
    Slave,
}

#[derive(Clone)]
pub struct MountPoint {
    pub device_id: DeviceId,
    pub role: MountRole,
    pub master: MemberId,
    pub schema: EffectiveSchemaContext,
    pub data_broker: Arc<dyn DataBroker>,
    pub data_tree: Arc<dyn DeviceDataTreeService>,
    pub rpc: Arc<dyn RpcService>,
    pub actions: Option<Arc<dyn ActionService>>,
    pub schema_provider: Arc<dyn SchemaSourceProvider>,
}

/// Serializable view of a mount point.
#[derive(Debug, Clone, Serialize)]
pub struct MountSummary {
    pub node_id: String,
    pub address: String,
    pub role: MountRole,
    pub master: MemberId,
    pub modules: Vec<String>,
    pub actions: bool,
}

impl MountPoint {
    pub fn summary(&self) -> MountSummary {
        MountSummary {
            node_id: self.device_id.name.clone(),
            address: self.device_id.address(),
            role: self.role,
            master: self.master.clone(),
            modules: self.schema.modules.iter().map(ToString::to_string).collect(),
            actions: self.actions.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MountStats {
    pub registered: u64,
    pub unregistered: u64,
    pub active: usize,
}

struct Entry {
    token: u64,
    mount: MountPoint,
}

#[derive(Default)]
struct Inner {
    mounts: Mutex<BTreeMap<String, Entry>>,
    next_token: AtomicU64,
    registered: AtomicU64,
    unregistered: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MountPointService {
    inner: Arc<Inner>,
}

impl MountPointService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `mount`; fails if the device already has a mount point here.
    pub fn register(&self, mount: MountPoint) -> Result<MountRegistration, MountError> {
        let name = mount.device_id.name.clone();
        let role = mount.role;
        let master = mount.master.clone();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut mounts = self.mounts();
            if mounts.contains_key(&name) {
                return Err(MountError::AlreadyMounted(name));
            }
            mounts.insert(name.clone(), Entry { token, mount });
        }

        self.inner.registered.fetch_add(1, Ordering::Relaxed);
        metrics::record_mount_registered(&role.to_string());
        events::mount_registered(&name, &role.to_string(), master.as_str());

        Ok(MountRegistration {
            service: Arc::downgrade(&self.inner),
            name,
            role,
            token,
            closed: Mutex::new(false),
        })
    }

    pub fn get(&self, node_id: &str) -> Option<MountPoint> {
        self.mounts().get(node_id).map(|entry| entry.mount.clone())
    }

    pub fn list(&self) -> Vec<MountSummary> {
        self.mounts().values().map(|entry| entry.mount.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.mounts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MountStats {
        MountStats {
            registered: self.inner.registered.load(Ordering::Relaxed),
            unregistered: self.inner.unregistered.load(Ordering::Relaxed),
            active: self.len(),
        }
    }

    fn mounts(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.inner.mounts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live mount point. Closing (or dropping) it removes the mount point.
pub struct MountRegistration {
    service: Weak<Inner>,
    name: String,
    role: MountRole,
    token: u64,
    closed: Mutex<bool>,
}

impl MountRegistration {
    pub fn node_id(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> MountRole {
        self.role
    }

    /// Idempotent.
    pub fn close(&self) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return;
            }
            *closed = true;
        }

        let Some(inner) = self.service.upgrade() else {
            return;
        };
        let removed = {
            let mut mounts = inner.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            match mounts.get(&self.name) {
                Some(entry) if entry.token == self.token => mounts.remove(&self.name).is_some(),
                _ => false,
            }
        };
        if removed {
            inner.unregistered.fetch_add(1, Ordering::Relaxed);
            metrics::record_mount_unregistered(&self.role.to_string());
            events::mount_unregistered(&self.name, &self.role.to_string(), "closed");
        }
    }
}

impl Drop for MountRegistration {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;

    fn mount_point(name: &str, role: MountRole) -> MountPoint {
        let device = SimulatedDevice::new(DeviceId::new(name, "127.0.0.1", 1234));
        MountPoint {
            device_id: DeviceId::new(name, "127.0.0.1", 1234),
            role,
            master: MemberId::new("member-1"),
            schema: EffectiveSchemaContext::default(),
            data_broker: device.clone(),
            data_tree: device.clone(),
            rpc: device.clone(),
            actions: Some(device.clone()),
            schema_provider: device,
        }
    }

    #[test]
    fn test_single_mount_per_device() {
        let service = MountPointService::new();
        let registration = service.register(mount_point("node-1", MountRole::Master)).unwrap();
        let err = service.register(mount_point("node-1", MountRole::Slave)).err().unwrap();
        assert_eq!(err, MountError::AlreadyMounted("node-1".into()));

        registration.close();
        registration.close();
        assert!(service.is_empty());

        let again = service.register(mount_point("node-1", MountRole::Slave)).unwrap();
        assert_eq!(again.role(), MountRole::Slave);
        assert_eq!(service.get("node-1").unwrap().role, MountRole::Slave);
        assert_eq!(
            service.stats(),
            MountStats {
                registered: 2,
                unregistered: 1,
                active: 1
            }
        );
    }

    #[test]
    fn test_drop_unregisters() {
        let service = MountPointService::new();
        {
            let _registration = service.register(mount_point("node-1", MountRole::Master)).unwrap();
            assert_eq!(service.list().len(), 1);
        }
        assert!(service.get("node-1").is_none());
    }
}
