//! Schema Resource Manager
//!
//! Devices naming the same schema cache directory share one registry and
//! resolver. When a catalog root is configured, the directory's on-disk
//! sources are registered as a fallback provider.

use super::{SchemaCatalog, SchemaSourceRegistry};
use super::registry::RegistrationScope;
use fleetmount_core::schema::SchemaResolver;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Cache directory used by devices that do not name one.
pub const DEFAULT_SCHEMA_CACHE_DIRECTORY: &str = "schema";

/// Schema machinery for one cache directory.
pub struct SchemaResources {
    pub directory: String,
    pub registry: SchemaSourceRegistry,
    pub resolver: Arc<dyn SchemaResolver>,
    /// On-disk sources of this directory, if any.
    pub catalog: Option<Arc<SchemaCatalog>>,
    _catalog_scope: Option<RegistrationScope>,
}

impl SchemaResources {
    /// Opens a scope for one resolution attempt, backed by the catalog.
    pub fn attempt_scope(&self) -> RegistrationScope {
        let scope = self.registry.scope();
        match &self.catalog {
            Some(catalog) => scope.with_fallback(catalog.clone()),
            None => scope,
        }
    }
}

pub struct SchemaResourceManager {
    resolver: Arc<dyn SchemaResolver>,
    catalog_root: Option<PathBuf>,
    resources: Mutex<HashMap<String, Arc<SchemaResources>>>,
}

impl SchemaResourceManager {
    pub fn new(resolver: Arc<dyn SchemaResolver>) -> Self {
        Self {
            resolver,
            catalog_root: None,
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_catalog(mut self, root: impl Into<PathBuf>) -> Self {
        self.catalog_root = Some(root.into());
        self
    }

    /// Resources for `cache_directory`, created on first use.
    pub fn resources(&self, cache_directory: Option<&str>) -> Arc<SchemaResources> {
        let directory = cache_directory.unwrap_or(DEFAULT_SCHEMA_CACHE_DIRECTORY);
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = resources.get(directory) {
            return existing.clone();
        }

        let registry = SchemaSourceRegistry::new();
        let catalog = self.catalog_root.as_ref().and_then(|root| {
            let path = root.join(directory);
            match SchemaCatalog::from_directory(&path) {
                Ok(catalog) if !catalog.is_empty() => {
                    let scope = registry.scope();
                    let catalog = Arc::new(catalog);
                    for id in catalog.source_ids() {
                        scope.register(id.clone(), catalog.clone());
                    }
                    Some((catalog, scope))
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(directory = %path.display(), error = %e, "Failed to index schema catalog");
                    None
                }
            }
        });

        debug!(directory = %directory, catalog = catalog.is_some(), "Created schema resources");
        let (catalog, catalog_scope) = catalog.unzip();
        let created = Arc::new(SchemaResources {
            directory: directory.to_string(),
            registry,
            resolver: self.resolver.clone(),
            catalog,
            _catalog_scope: catalog_scope,
        });
        resources.insert(directory.to_string(), created.clone());
        created
    }
}
