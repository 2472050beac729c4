//! On-disk Schema Catalog
//!
//! A directory of `name@revision.yang` (or `name.yang`) files. Sources are
//! indexed once and read lazily.

use async_trait::async_trait;
use fleetmount_core::schema::SchemaSourceProvider;
use fleetmount_core::{DeviceError, SchemaError, SchemaSource, SourceIdentifier};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    directory: PathBuf,
    files: BTreeMap<SourceIdentifier, PathBuf>,
}

impl SchemaCatalog {
    /// Indexes `directory`. A missing directory yields an empty catalog.
    pub fn from_directory(directory: impl AsRef<Path>) -> std::io::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let mut files = BTreeMap::new();

        if !directory.is_dir() {
            debug!(directory = %directory.display(), "Schema catalog directory absent");
            return Ok(Self { directory, files });
        }

        for entry in std::fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("yang") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            match file_name.parse::<SourceIdentifier>() {
                Ok(id) => {
                    files.insert(id, path.clone());
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Ignoring schema file"),
            }
        }

        debug!(directory = %directory.display(), sources = files.len(), "Schema catalog indexed");
        Ok(Self { directory, files })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &SourceIdentifier> {
        self.files.keys()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl SchemaSourceProvider for SchemaCatalog {
    async fn get_source(&self, id: &SourceIdentifier) -> Result<SchemaSource, SchemaError> {
        let path = self.files.get(id).ok_or_else(|| SchemaError::MissingSource(id.clone()))?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SchemaError::SourceUnavailable {
                id: id.clone(),
                cause: DeviceError::Operation(format!("{}: {e}", path.display())),
            })?;
        Ok(SchemaSource::new(id.clone(), text))
    }
}
