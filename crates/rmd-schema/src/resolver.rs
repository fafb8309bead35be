//! Per-store schema resolution with caching.

use crate::repository::{RmdSchemaEntry, SchemaRepository};
use parking_lot::RwLock;
use rmd_core::Schema;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolves value and RMD schemas of one store, caching RMD schemas by
/// `(value_schema_id, rmd_version_id)`.
///
/// Misses are reported immediately and never cached, so a schema registered
/// later is picked up by the next call.
pub struct StoreSchemaCache {
    store: String,
    repository: Arc<dyn SchemaRepository>,
    rmd_schemas: RwLock<HashMap<(i32, i32), RmdSchemaEntry>>,
}

impl StoreSchemaCache {
    /// Create a resolver for `store` backed by `repository`.
    pub fn new(store: impl Into<String>, repository: Arc<dyn SchemaRepository>) -> Self {
        Self {
            store: store.into(),
            repository,
            rmd_schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Store this resolver serves.
    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// RMD schema for a value schema under an RMD version.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::NotFound`] if the repository has no such entry.
    pub fn resolve_rmd_schema(
        &self,
        value_schema_id: i32,
        rmd_version_id: i32,
    ) -> Result<RmdSchemaEntry, SchemaError> {
        let key = (value_schema_id, rmd_version_id);
        if let Some(entry) = self.rmd_schemas.read().get(&key) {
            return Ok(entry.clone());
        }

        let entry = self
            .repository
            .replication_metadata_schema(&self.store, value_schema_id, rmd_version_id)
            .ok_or_else(|| SchemaError::NotFound {
                store: self.store.clone(),
                value_schema_id,
                rmd_version_id,
            })?;

        let entry = self
            .rmd_schemas
            .write()
            .entry(key)
            .or_insert(entry)
            .clone();
        tracing::debug!(
            store = %self.store,
            value_schema_id,
            rmd_version_id,
            "Resolved RMD schema"
        );
        Ok(entry)
    }

    /// Value schema `id` of this store.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::ValueSchemaNotFound`] if it is not registered.
    pub fn value_schema(&self, id: i32) -> Result<Arc<Schema>, SchemaError> {
        self.repository
            .value_schema(&self.store, id)
            .ok_or_else(|| SchemaError::ValueSchemaNotFound {
                store: self.store.clone(),
                value_schema_id: id,
            })
    }
}

impl fmt::Debug for StoreSchemaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSchemaCache")
            .field("store", &self.store)
            .field("cached", &self.rmd_schemas.read().len())
            .finish_non_exhaustive()
    }
}

/// Schema resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// No RMD schema registered for the key
    #[error("no RMD schema for store {store}, value schema {value_schema_id}, RMD version {rmd_version_id}")]
    NotFound {
        /// Store name
        store: String,
        /// Value schema id
        value_schema_id: i32,
        /// RMD version id
        rmd_version_id: i32,
    },
    /// No value schema registered for the id
    #[error("no value schema {value_schema_id} for store {store}")]
    ValueSchemaNotFound {
        /// Store name
        store: String,
        /// Value schema id
        value_schema_id: i32,
    },
}
