//! Application State
//!
//! Shared state passed to all API handlers.

use crate::mount::MountPointService;
use crate::observability::MetricsState;
use crate::topology::TopologyManagerHandle;
use fleetmount_core::datastore::DataStore;
use fleetmount_core::MemberId;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub member: MemberId,
    pub data_store: Arc<dyn DataStore>,
    pub mount_points: MountPointService,
    pub topology: Arc<TopologyManagerHandle>,
    pub metrics_state: Option<MetricsState>,
}
