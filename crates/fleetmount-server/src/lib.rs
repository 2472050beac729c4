//! Fleetmount Server Library
//!
//! Clustered device-mount coordination: one elected owner per device holds
//! the live session, every other member mounts proxies to it.

pub mod actors;
pub mod api;
pub mod cluster;
pub mod config;
pub mod datastore;
pub mod device;
pub mod mount;
pub mod observability;
pub mod proxy;
pub mod schema;
pub mod topology;
pub mod version;

#[cfg(test)]
pub mod testing;
