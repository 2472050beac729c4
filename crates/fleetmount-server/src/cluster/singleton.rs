//! In-process singleton election.
//!
//! Every member of a single-process cluster obtains its provider from one
//! shared `LocalSingletonService`. The first live registrant per identifier
//! owns it; closing the owner's registration hands ownership to the next
//! registrant in arrival order. Transitions for one identifier run one at a
//! time, so a successor is never instantiated before the previous owner's
//! `close_instance` has returned.

use async_trait::async_trait;
use fleetmount_core::cluster::{ClusterSingletonProvider, SingletonCandidate, SingletonRegistration};
use fleetmount_core::{MemberId, RegistrationError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

struct Entry {
    token: u64,
    member: MemberId,
    candidate: Arc<dyn SingletonCandidate>,
}

#[derive(Default)]
struct Slot {
    queue: Vec<Entry>,
    /// Token of the instantiated owner.
    active: Option<u64>,
    transition: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

impl Inner {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition_lock(&self, identifier: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.slots().get(identifier).map(|slot| slot.transition.clone())
    }

    /// Instantiates the head of the queue unless an owner is already active.
    async fn promote(&self, identifier: &str) {
        let Some(lock) = self.transition_lock(identifier) else {
            return;
        };
        let _transition = lock.lock().await;

        let next = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(identifier) else {
                return;
            };
            if slot.active.is_some() {
                return;
            }
            let Some(head) = slot.queue.first() else {
                return;
            };
            slot.active = Some(head.token);
            (head.member.clone(), head.candidate.clone())
        };

        info!(singleton = %identifier, member = %next.0, "Singleton ownership granted");
        next.1.instantiate().await;
    }

    /// Removes `token`; if it was the active owner, closes it and promotes
    /// the next registrant.
    async fn withdraw(&self, identifier: &str, token: u64) {
        let Some(lock) = self.transition_lock(identifier) else {
            return;
        };

        let closed = {
            let _transition = lock.lock().await;
            let removed = {
                let mut slots = self.slots();
                let Some(slot) = slots.get_mut(identifier) else {
                    return;
                };
                let Some(position) = slot.queue.iter().position(|entry| entry.token == token) else {
                    return;
                };
                let entry = slot.queue.remove(position);
                let was_active = slot.active == Some(token);
                if was_active {
                    slot.active = None;
                }
                if slot.queue.is_empty() {
                    slots.remove(identifier);
                }
                (entry, was_active)
            };

            let (entry, was_active) = removed;
            if was_active {
                info!(singleton = %identifier, member = %entry.member, "Singleton ownership released");
                entry.candidate.close_instance().await;
            } else {
                debug!(singleton = %identifier, member = %entry.member, "Standby registration withdrawn");
            }
            was_active
        };

        if closed {
            self.promote(identifier).await;
        }
    }
}

/// Shared election table for all members in this process.
#[derive(Clone, Default)]
pub struct LocalSingletonService {
    inner: Arc<Inner>,
}

impl LocalSingletonService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider registering candidates on behalf of `member`.
    pub fn provider_for(&self, member: MemberId) -> Arc<LocalSingletonProvider> {
        Arc::new(LocalSingletonProvider {
            inner: self.inner.clone(),
            member,
        })
    }

    /// Member currently holding `identifier`, if any.
    pub fn owner(&self, identifier: &str) -> Option<MemberId> {
        let slots = self.inner.slots();
        let slot = slots.get(identifier)?;
        let active = slot.active?;
        slot.queue
            .iter()
            .find(|entry| entry.token == active)
            .map(|entry| entry.member.clone())
    }

    /// Number of live registrations for `identifier`.
    pub fn registrants(&self, identifier: &str) -> usize {
        self.inner.slots().get(identifier).map_or(0, |slot| slot.queue.len())
    }
}

pub struct LocalSingletonProvider {
    inner: Arc<Inner>,
    member: MemberId,
}

impl ClusterSingletonProvider for LocalSingletonProvider {
    fn register(
        &self,
        candidate: Arc<dyn SingletonCandidate>,
    ) -> Result<Box<dyn SingletonRegistration>, RegistrationError> {
        let identifier = candidate.identifier().to_string();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = self.inner.slots();
            let slot = slots.entry(identifier.clone()).or_default();
            if slot.queue.iter().any(|entry| entry.member == self.member) {
                return Err(RegistrationError::AlreadyRegistered(identifier));
            }
            slot.queue.push(Entry {
                token,
                member: self.member.clone(),
                candidate,
            });
        }
        debug!(singleton = %identifier, member = %self.member, "Singleton candidate registered");

        let inner = self.inner.clone();
        let promoted = identifier.clone();
        tokio::spawn(async move { inner.promote(&promoted).await });

        Ok(Box::new(LocalRegistration {
            inner: self.inner.clone(),
            identifier,
            token,
        }))
    }
}

struct LocalRegistration {
    inner: Arc<Inner>,
    identifier: String,
    token: u64,
}

#[async_trait]
impl SingletonRegistration for LocalRegistration {
    async fn close(&self) {
        self.inner.withdraw(&self.identifier, self.token).await;
    }
}
