//! Schema Sources and Resolution
//!
//! - `registry`: shared provider table with scoped, bulk-withdrawable registrations
//! - `remote`: provider fetching source text from a device's master actor
//! - `resolver`: builds an effective schema context from registered sources
//! - `catalog`: on-disk `name@revision.yang` sources
//! - `resources`: registry and resolver per schema cache directory

pub mod catalog;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod resources;

pub use catalog::SchemaCatalog;
pub use registry::{RegistrationScope, SchemaSourceRegistry};
pub use remote::ProxySchemaSourceProvider;
pub use resolver::RepositorySchemaResolver;
pub use resources::{SchemaResourceManager, SchemaResources, DEFAULT_SCHEMA_CACHE_DIRECTORY};
