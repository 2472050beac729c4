//! Schema Contracts

use crate::error::SchemaError;
use crate::identity::SourceIdentifier;
use crate::model::{EffectiveSchemaContext, SchemaSource};
use async_trait::async_trait;
use std::sync::Arc;

/// Supplies schema source text on demand.
#[async_trait]
pub trait SchemaSourceProvider: Send + Sync {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError>;
}

/// Builds an effective schema context from a set of sources.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(
        &self,
        provider: Arc<dyn SchemaSourceProvider>,
        source_ids: &[SourceIdentifier],
    ) -> Result<EffectiveSchemaContext, SchemaError>;
}
