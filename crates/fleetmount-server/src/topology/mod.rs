//! Topology Module
//!
//! Turns configuration records into device contexts and drives each context
//! through the owner and slave roles.
//!
//! - `manager`: watches the configuration store, one context per device
//! - `context`: singleton candidate switching between the two roles
//! - `connector`: owner role, the live device session
//! - `node_manager`: slave role, proxy mount points
//! - `setup`: immutable per-device snapshot and member-wide services

mod connector;
mod context;
mod manager;
mod node_manager;
mod setup;

pub use connector::RemoteDeviceConnector;
pub use context::{ContextState, TopologyContext};
pub use manager::{spawn_topology_manager, TopologyManager, TopologyManagerHandle};
pub use node_manager::NodeManager;
pub use setup::{MemberServices, TopologySetup, TopologySetupBuilder};
