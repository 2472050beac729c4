//! Device actor: master and slave roles for one device on one member.

mod actor;
mod master;
pub mod messages;
mod slave;

pub use actor::DeviceActor;
pub use messages::*;
