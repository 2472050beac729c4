//! Schema Source Registry
//!
//! Shared table of providers per source identifier. Registrations are made
//! through a `RegistrationScope` so that everything one mount attempt added
//! can be withdrawn in a single call. A scope is also a provider of its own:
//! resolving through it sees only that attempt's registrations and the
//! scope's fallback, never another device's.

use async_trait::async_trait;
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{SchemaError, SchemaSource, SourceIdentifier};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

type Entries = BTreeMap<SourceIdentifier, Vec<(u64, Arc<dyn SchemaSourceProvider>)>>;

#[derive(Default)]
struct Inner {
    entries: Mutex<Entries>,
    next_token: AtomicU64,
}

/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct SchemaSourceRegistry {
    inner: Arc<Inner>,
}

impl SchemaSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an empty scope bound to this registry.
    pub fn scope(&self) -> RegistrationScope {
        RegistrationScope {
            registry: self.clone(),
            entries: Mutex::new(Some(Vec::new())),
            fallback: None,
        }
    }

    /// Total number of live provider registrations.
    pub fn registration_count(&self) -> usize {
        self.entries().values().map(Vec::len).sum()
    }

    pub fn has_source(&self, id: &SourceIdentifier) -> bool {
        self.entries().get(id).is_some_and(|providers| !providers.is_empty())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: SourceIdentifier, provider: Arc<dyn SchemaSourceProvider>) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries().entry(id).or_default().push((token, provider));
        token
    }

    fn remove(&self, id: &SourceIdentifier, token: u64) {
        let mut entries = self.entries();
        if let Some(providers) = entries.get_mut(id) {
            providers.retain(|(t, _)| *t != token);
            if providers.is_empty() {
                entries.remove(id);
            }
        }
    }

    fn providers(&self, id: &SourceIdentifier) -> Vec<Arc<dyn SchemaSourceProvider>> {
        self.entries()
            .get(id)
            .map(|providers| providers.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }
}

/// Providers are tried in registration order; the first success wins.
#[async_trait]
impl SchemaSourceProvider for SchemaSourceRegistry {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
        let mut last_error = None;
        for provider in self.providers(id) {
            match provider.get_source(id).await {
                Ok(source) => return Ok(source),
                Err(e) => {
                    trace!(source = %id, error = %e, "Schema provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SchemaError::MissingSource(id.clone())))
    }
}

struct ScopedEntry {
    id: SourceIdentifier,
    token: u64,
    provider: Arc<dyn SchemaSourceProvider>,
}

/// Set of registrations withdrawn together by `close`, or on drop.
pub struct RegistrationScope {
    registry: SchemaSourceRegistry,
    /// `None` once closed.
    entries: Mutex<Option<Vec<ScopedEntry>>>,
    /// Consulted for sources this scope has no provider for, or whose
    /// provider failed.
    fallback: Option<Arc<dyn SchemaSourceProvider>>,
}

impl RegistrationScope {
    pub fn with_fallback(mut self, fallback: Arc<dyn SchemaSourceProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Registers `provider` for `id`. Returns `false` if this scope already
    /// holds a registration for `id` or has been closed.
    pub fn register(&self, id: SourceIdentifier, provider: Arc<dyn SchemaSourceProvider>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = entries.as_mut() else {
            return false;
        };
        if entries.iter().any(|entry| entry.id == id) {
            return false;
        }
        let token = self.registry.insert(id.clone(), provider.clone());
        entries.push(ScopedEntry { id, token, provider });
        true
    }

    /// Withdraws every registration made through this scope. Returns how many
    /// were removed; later calls return 0.
    pub fn close(&self) -> usize {
        let taken = self.entries.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(entries) = taken else {
            return 0;
        };
        for entry in &entries {
            self.registry.remove(&entry.id, entry.token);
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn provider(&self, id: &SourceIdentifier) -> Option<Arc<dyn SchemaSourceProvider>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()?
            .iter()
            .find(|entry| entry.id == *id)
            .map(|entry| entry.provider.clone())
    }
}

/// The scope's own provider first, then the fallback. When both fail the
/// scope provider's error is reported.
#[async_trait]
impl SchemaSourceProvider for RegistrationScope {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
        if self.is_closed() {
            return Err(SchemaError::MissingSource(id.clone()));
        }

        let primary = match self.provider(id) {
            Some(provider) => match provider.get_source(id).await {
                Ok(source) => return Ok(source),
                Err(e) => Some(e),
            },
            None => None,
        };
        let Some(fallback) = &self.fallback else {
            return Err(primary.unwrap_or_else(|| SchemaError::MissingSource(id.clone())));
        };
        match fallback.get_source(id).await {
            Ok(source) => Ok(source),
            Err(e) => {
                trace!(source = %id, error = %e, "Fallback schema provider failed");
                Err(primary.unwrap_or(e))
            }
        }
    }
}

impl Drop for RegistrationScope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<&'static str, SchemaError>);

    #[async_trait]
    impl SchemaSourceProvider for Fixed {
        async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
            self.0.clone().map(|text| SchemaSource::new(id.clone(), text))
        }
    }

    fn id(name: &str) -> SourceIdentifier {
        SourceIdentifier::new(name, Some("2024-01-01"))
    }

    #[tokio::test]
    async fn test_scope_close_withdraws_everything() {
        let registry = SchemaSourceRegistry::new();
        let scope = registry.scope();
        assert!(scope.register(id("a"), Arc::new(Fixed(Ok("module a {}")))));
        assert!(scope.register(id("b"), Arc::new(Fixed(Ok("module b {}")))));
        assert!(!scope.register(id("a"), Arc::new(Fixed(Ok("dup")))));
        assert_eq!(registry.registration_count(), 2);

        assert_eq!(scope.close(), 2);
        assert_eq!(scope.close(), 0);
        assert!(scope.is_closed());
        assert_eq!(registry.registration_count(), 0);
        assert!(!scope.register(id("c"), Arc::new(Fixed(Ok("late")))));
    }

    #[tokio::test]
    async fn test_drop_closes_scope() {
        let registry = SchemaSourceRegistry::new();
        {
            let scope = registry.scope();
            scope.register(id("a"), Arc::new(Fixed(Ok("module a {}"))));
            assert!(registry.has_source(&id("a")));
        }
        assert!(!registry.has_source(&id("a")));
    }

    #[tokio::test]
    async fn test_falls_through_failing_providers() {
        let registry = SchemaSourceRegistry::new();
        let first = registry.scope();
        let second = registry.scope();
        first.register(id("a"), Arc::new(Fixed(Err(SchemaError::MissingSource(id("a"))))));
        second.register(id("a"), Arc::new(Fixed(Ok("module a {}"))));

        let source = registry.get_source(&id("a")).await.unwrap();
        assert_eq!(source.text, "module a {}");

        second.close();
        assert!(registry.get_source(&id("a")).await.is_err());
        first.close();
        assert_eq!(
            registry.get_source(&id("a")).await.unwrap_err(),
            SchemaError::MissingSource(id("a"))
        );
    }

    #[tokio::test]
    async fn test_scope_serves_only_its_own_registrations() {
        let registry = SchemaSourceRegistry::new();
        let other_device = registry.scope();
        other_device.register(id("a"), Arc::new(Fixed(Ok("from the other master"))));

        let unavailable = SchemaError::SourceUnavailable {
            id: id("a"),
            cause: fleetmount_core::DeviceError::Operation("not served".into()),
        };
        let this_device = registry.scope();
        this_device.register(id("a"), Arc::new(Fixed(Err(unavailable.clone()))));

        // The shared table would fall through to the other device's provider.
        assert_eq!(registry.get_source(&id("a")).await.unwrap().text, "from the other master");
        assert_eq!(this_device.get_source(&id("a")).await.unwrap_err(), unavailable);
        assert_eq!(
            this_device.get_source(&id("b")).await.unwrap_err(),
            SchemaError::MissingSource(id("b"))
        );
    }

    #[tokio::test]
    async fn test_scope_fallback_fills_gaps() {
        let registry = SchemaSourceRegistry::new();
        let scope = registry
            .scope()
            .with_fallback(Arc::new(Fixed(Ok("module from-catalog {}"))));
        let unavailable = SchemaError::MissingSource(id("a"));
        scope.register(id("a"), Arc::new(Fixed(Err(unavailable))));

        assert_eq!(scope.get_source(&id("a")).await.unwrap().text, "module from-catalog {}");
        assert_eq!(scope.get_source(&id("b")).await.unwrap().text, "module from-catalog {}");

        scope.close();
        assert_eq!(
            scope.get_source(&id("b")).await.unwrap_err(),
            SchemaError::MissingSource(id("b"))
        );
    }
}
