//! Etcd Singleton Provider
//!
//! Elects one owner per candidate identifier with etcd's election API. Each
//! registration runs a driver task that:
//! 1. Grants a lease and keeps it alive
//! 2. Campaigns under `{namespace}election/{identifier}`
//! 3. Instantiates the candidate once elected
//! 4. Closes the instance when the lease is lost or the registration closes
//!
//! A lost lease sends the driver back to step 1 after `retry_delay`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use etcd_client::{Client, LeaseKeepAliveStream, LeaseKeeper, LeaderKey, ResignOptions};
use fleetmount_core::cluster::{ClusterSingletonProvider, SingletonCandidate, SingletonRegistration};
use fleetmount_core::{MemberId, RegistrationError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct EtcdSingletonProvider {
    client: Arc<RwLock<Client>>,
    namespace: String,
    member: MemberId,
    lease_ttl: i64,
    retry_delay: Duration,
    registered: Arc<Mutex<HashSet<String>>>,
}

impl EtcdSingletonProvider {
    pub fn new(
        client: Arc<RwLock<Client>>,
        namespace: &str,
        member: MemberId,
        lease_ttl: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            member,
            lease_ttl: i64::try_from(lease_ttl.as_secs()).unwrap_or(i64::MAX).max(1),
            retry_delay,
            registered: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn election_name(&self, identifier: &str) -> String {
        election_name(&self.namespace, identifier)
    }
}

fn election_name(namespace: &str, identifier: &str) -> String {
    format!("{namespace}election/{identifier}")
}

impl ClusterSingletonProvider for EtcdSingletonProvider {
    fn register(
        &self,
        candidate: Arc<dyn SingletonCandidate>,
    ) -> Result<Box<dyn SingletonRegistration>, RegistrationError> {
        let identifier = candidate.identifier().to_string();
        {
            let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
            if !registered.insert(identifier.clone()) {
                return Err(RegistrationError::AlreadyRegistered(identifier));
            }
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            self.registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&identifier);
            RegistrationError::Failed {
                identifier: identifier.clone(),
                reason: e.to_string(),
            }
        })?;

        let cancel = CancellationToken::new();
        let driver = ElectionDriver {
            client: self.client.clone(),
            election: self.election_name(&identifier),
            member: self.member.clone(),
            lease_ttl: self.lease_ttl,
            retry_delay: self.retry_delay,
            candidate,
            cancel: cancel.clone(),
            identifier: identifier.clone(),
            registered: self.registered.clone(),
        };
        let task = handle.spawn(driver.run());

        Ok(Box::new(EtcdRegistration {
            identifier,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        }))
    }
}

struct ElectionDriver {
    client: Arc<RwLock<Client>>,
    election: String,
    member: MemberId,
    lease_ttl: i64,
    retry_delay: Duration,
    candidate: Arc<dyn SingletonCandidate>,
    cancel: CancellationToken,
    identifier: String,
    registered: Arc<Mutex<HashSet<String>>>,
}

enum Term {
    /// The registration was closed.
    Cancelled,
    /// Lease or campaign failed; try again.
    Lost,
}

impl ElectionDriver {
    async fn run(self) {
        loop {
            match self.term().await {
                Ok(Term::Cancelled) => break,
                Ok(Term::Lost) => {
                    warn!(election = %self.election, member = %self.member, "Election lease lost");
                }
                Err(e) => {
                    error!(election = %self.election, member = %self.member, error = %e, "Election attempt failed");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identifier);
        debug!(election = %self.election, member = %self.member, "Election driver stopped");
    }

    /// One lease lifetime: campaign, serve while elected, step down.
    async fn term(&self) -> Result<Term> {
        // Cloned so a blocked campaign never holds the shared client lock.
        let mut client = self.client.read().await.clone();

        let lease = client.lease_grant(self.lease_ttl, None).await?;
        let lease_id = lease.id();
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        debug!(election = %self.election, lease_id, ttl = self.lease_ttl, "Lease granted");

        let keepalive = keep_lease_alive(keeper, stream, self.lease_ttl);
        tokio::pin!(keepalive);

        let mut campaign_client = client.clone();
        let leader = tokio::select! {
            _ = self.cancel.cancelled() => {
                revoke(&mut client, lease_id).await;
                return Ok(Term::Cancelled);
            }
            lost = &mut keepalive => {
                warn!(election = %self.election, reason = %lost, "Lease expired while campaigning");
                return Ok(Term::Lost);
            }
            resp = campaign_client.campaign(self.election.as_str(), self.member.as_str(), lease_id) => {
                resp?.leader().cloned().ok_or_else(|| anyhow!("campaign returned no leader key"))?
            }
        };

        info!(election = %self.election, member = %self.member, "Elected singleton owner");
        self.candidate.instantiate().await;

        let term = tokio::select! {
            _ = self.cancel.cancelled() => Term::Cancelled,
            lost = &mut keepalive => {
                warn!(election = %self.election, reason = %lost, "Lease expired while owning");
                Term::Lost
            }
        };

        self.candidate.close_instance().await;
        resign(&mut client, leader).await;
        revoke(&mut client, lease_id).await;
        Ok(term)
    }
}

/// Refreshes the lease every `ttl / 3` seconds. Returns only once the lease
/// can no longer be kept, with the reason.
async fn keep_lease_alive(mut keeper: LeaseKeeper, mut stream: LeaseKeepAliveStream, ttl: i64) -> String {
    let period = Duration::from_secs(u64::try_from(ttl / 3).unwrap_or(0).max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = keeper.keep_alive().await {
            return format!("keep-alive request failed: {e}");
        }
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => {}
            Ok(Some(_)) => return "lease expired".to_string(),
            Ok(None) => return "keep-alive stream closed".to_string(),
            Err(e) => return format!("keep-alive stream failed: {e}"),
        }
    }
}

async fn resign(client: &mut Client, leader: LeaderKey) {
    if let Err(e) = client.resign(Some(ResignOptions::new().with_leader(leader))).await {
        warn!(error = %e, "Failed to resign election");
    }
}

async fn revoke(client: &mut Client, lease_id: i64) {
    if let Err(e) = client.lease_revoke(lease_id).await {
        debug!(lease_id, error = %e, "Failed to revoke lease");
    }
}

struct EtcdRegistration {
    identifier: String,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SingletonRegistration for EtcdRegistration {
    async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            error!(singleton = %self.identifier, error = %e, "Election driver panicked");
        }
    }
}

impl Drop for EtcdRegistration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_name() {
        assert_eq!(election_name("/fleetmount/", "topology-netconf/r1"), "/fleetmount/election/topology-netconf/r1");
    }
}
