//! Cluster Singleton Contracts
//!
//! Election is delegated: a provider guarantees that at most one registered
//! candidate per identifier is active cluster-wide and drives it through
//! `instantiate` / `close_instance`.

use crate::error::RegistrationError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SingletonCandidate: Send + Sync {
    /// Cluster-wide identity the candidate competes for.
    fn identifier(&self) -> &str;

    /// Called when this member becomes the owner.
    async fn instantiate(&self);

    /// Called when this member gives up ownership.
    async fn close_instance(&self);
}

/// Live candidate registration. Closing gives up ownership if held.
#[async_trait]
pub trait SingletonRegistration: Send + Sync {
    /// Idempotent.
    async fn close(&self);
}

pub trait ClusterSingletonProvider: Send + Sync {
    fn register(
        &self,
        candidate: Arc<dyn SingletonCandidate>,
    ) -> Result<Box<dyn SingletonRegistration>, RegistrationError>;
}
