//! Proxy Services
//!
//! Slave-side implementations of the device service contracts. Each call is
//! forwarded to the master actor with a bounded ask; the master replies with
//! the device's own result or error.

mod ask;
mod data_broker;
mod data_tree;
mod rpc;
mod tx;

pub use ask::MasterHandle;
pub use data_broker::ProxyDataBroker;
pub use data_tree::ProxyDataTreeService;
pub use rpc::{ProxyActionService, ProxyRpcService};
pub use tx::ProxyTransaction;
