//! Schema Resolver
//!
//! Fetches every requested source concurrently and checks that each text
//! declares the module it was requested as.

use async_trait::async_trait;
use fleetmount_core::schema::{SchemaResolver, SchemaSourceProvider};
use fleetmount_core::{EffectiveSchemaContext, SchemaError, SchemaSource, SourceIdentifier};
use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct RepositorySchemaResolver;

impl RepositorySchemaResolver {
    pub fn new() -> Self {
        Self
    }
}

/// Name declared by the leading `module <name>` or `submodule <name>` statement.
fn declared_module(text: &str) -> Option<&str> {
    let mut tokens = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .flat_map(str::split_whitespace);
    match tokens.next()? {
        "module" | "submodule" => tokens
            .next()
            .map(|name| name.trim_end_matches('{').trim_matches('"')),
        _ => None,
    }
}

fn validate(id: &SourceIdentifier, source: &SchemaSource) -> Result<(), SchemaError> {
    match declared_module(&source.text) {
        Some(name) if name == id.name => Ok(()),
        Some(name) => Err(SchemaError::Unresolvable {
            id: id.clone(),
            reason: format!("source declares module {name}"),
        }),
        None => Err(SchemaError::Unresolvable {
            id: id.clone(),
            reason: "missing module statement".to_string(),
        }),
    }
}

#[async_trait]
impl SchemaResolver for RepositorySchemaResolver {
    async fn resolve(
        &self,
        provider: Arc<dyn SchemaSourceProvider>,
        source_ids: &[SourceIdentifier],
    ) -> Result<EffectiveSchemaContext, SchemaError> {
        let fetches = source_ids.iter().map(|id| {
            let provider = provider.clone();
            async move { provider.get_source(id).await.map(|source| (id, source)) }
        });

        let mut modules = Vec::with_capacity(source_ids.len());
        for fetched in join_all(fetches).await {
            let (id, source) = fetched?;
            validate(id, &source)?;
            modules.push(id.clone());
        }

        debug!(modules = modules.len(), "Schema context resolved");
        Ok(EffectiveSchemaContext::new(modules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaSourceRegistry;

    struct Text(&'static str);

    #[async_trait]
    impl SchemaSourceProvider for Text {
        async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
            Ok(SchemaSource::new(id.clone(), self.0))
        }
    }

    #[test]
    fn test_declared_module() {
        assert_eq!(declared_module("module foo {\n}"), Some("foo"));
        assert_eq!(declared_module("\n  submodule bar{ }"), Some("bar"));
        assert_eq!(declared_module("container x {}"), None);
        assert_eq!(declared_module(""), None);
    }

    #[tokio::test]
    async fn test_resolve_all_sources() {
        let registry = SchemaSourceRegistry::new();
        let scope = registry.scope();
        let a = SourceIdentifier::new("a", Some("2024-01-01"));
        let b = SourceIdentifier::new("b", None);
        scope.register(a.clone(), Arc::new(Text("module a { }")));
        scope.register(b.clone(), Arc::new(Text("module b { }")));

        let context = RepositorySchemaResolver::new()
            .resolve(Arc::new(registry.clone()), &[a.clone(), b.clone()])
            .await
            .unwrap();
        assert!(context.contains(&a) && context.contains(&b));
    }

    #[tokio::test]
    async fn test_missing_and_mismatched_sources() {
        let registry = SchemaSourceRegistry::new();
        let scope = registry.scope();
        let a = SourceIdentifier::new("a", None);
        scope.register(a.clone(), Arc::new(Text("module other { }")));
        let resolver = RepositorySchemaResolver::new();

        let err = resolver.resolve(Arc::new(registry.clone()), &[a.clone()]).await.unwrap_err();
        assert!(matches!(err, SchemaError::Unresolvable { .. }));

        let missing = SourceIdentifier::new("missing", None);
        let err = resolver.resolve(Arc::new(registry), &[missing.clone()]).await.unwrap_err();
        assert_eq!(err, SchemaError::MissingSource(missing));
    }
}
