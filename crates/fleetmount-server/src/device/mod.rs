//! Device Sessions
//!
//! The wire protocol is out of scope for this server; `simulated` provides
//! the connector used by the binary and the tests.

pub mod simulated;
pub mod tree;

pub use simulated::{default_schema_sources, SimulatedConnector, SimulatedDevice, UNREACHABLE_HOST};
