//! Schema repository contract and an in-memory implementation.

use crate::generator::{generate_rmd_schema, GeneratorError, LATEST_RMD_VERSION_ID};
use parking_lot::RwLock;
use rmd_core::Schema;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An RMD schema registered for one value schema and RMD version.
#[derive(Debug, Clone, PartialEq)]
pub struct RmdSchemaEntry {
    value_schema_id: i32,
    rmd_version_id: i32,
    schema: Arc<Schema>,
}

impl RmdSchemaEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(value_schema_id: i32, rmd_version_id: i32, schema: Arc<Schema>) -> Self {
        Self {
            value_schema_id,
            rmd_version_id,
            schema,
        }
    }

    /// Value schema the RMD schema was generated from.
    #[must_use]
    pub fn value_schema_id(&self) -> i32 {
        self.value_schema_id
    }

    /// RMD version the schema follows.
    #[must_use]
    pub fn rmd_version_id(&self) -> i32 {
        self.rmd_version_id
    }

    /// The RMD schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

/// Read-only access to the schemas registered for each store.
///
/// Implementations are queried synchronously and may lag behind
/// registrations made elsewhere.
pub trait SchemaRepository: Send + Sync {
    /// Value schema `id` of `store`.
    fn value_schema(&self, store: &str, id: i32) -> Option<Arc<Schema>>;

    /// RMD schema for a value schema under an RMD version.
    fn replication_metadata_schema(
        &self,
        store: &str,
        value_schema_id: i32,
        rmd_version_id: i32,
    ) -> Option<RmdSchemaEntry>;
}

#[derive(Debug, Default)]
struct StoreSchemas {
    values: HashMap<i32, Arc<Schema>>,
    rmds: HashMap<(i32, i32), RmdSchemaEntry>,
}

/// Repository kept in memory, for tests and tooling.
#[derive(Debug, Default)]
pub struct InMemorySchemaRepository {
    stores: RwLock<HashMap<String, StoreSchemas>>,
}

impl InMemorySchemaRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value schema and generate its RMD schema at the latest version.
    ///
    /// # Errors
    ///
    /// Returns error if the RMD schema cannot be generated.
    pub fn add_value_schema(
        &self,
        store: &str,
        id: i32,
        schema: Schema,
    ) -> Result<RmdSchemaEntry, GeneratorError> {
        let rmd = generate_rmd_schema(&schema, LATEST_RMD_VERSION_ID)?;
        let entry = RmdSchemaEntry::new(id, LATEST_RMD_VERSION_ID, Arc::new(rmd));

        let mut stores = self.stores.write();
        let schemas = stores.entry(store.to_string()).or_default();
        schemas.values.insert(id, Arc::new(schema));
        schemas
            .rmds
            .insert((id, LATEST_RMD_VERSION_ID), entry.clone());
        drop(stores);

        tracing::info!(store, value_schema_id = id, "Registered value schema");
        Ok(entry)
    }

    /// Register an RMD schema directly.
    pub fn add_rmd_schema(&self, store: &str, entry: RmdSchemaEntry) {
        let key = (entry.value_schema_id, entry.rmd_version_id);
        self.stores
            .write()
            .entry(store.to_string())
            .or_default()
            .rmds
            .insert(key, entry);
    }

    /// Load value schemas for `store` from a directory of `<id>.avsc` or
    /// `<id>.json` files.
    ///
    /// Returns the number of schemas registered.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read, a file name is not a
    /// schema id, or a schema does not parse.
    pub fn load_dir(&self, store: &str, dir: &Path) -> Result<usize, RepositoryError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        paths.retain(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("avsc" | "json")
            )
        });
        paths.sort();

        for path in &paths {
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| RepositoryError::InvalidFileName(path.clone()))?;
            let text = std::fs::read_to_string(path)?;
            let schema = Schema::parse_str(&text).map_err(|source| RepositoryError::Parse {
                path: path.clone(),
                source,
            })?;
            self.add_value_schema(store, id, schema)?;
        }
        Ok(paths.len())
    }
}

impl SchemaRepository for InMemorySchemaRepository {
    fn value_schema(&self, store: &str, id: i32) -> Option<Arc<Schema>> {
        self.stores
            .read()
            .get(store)
            .and_then(|s| s.values.get(&id).cloned())
    }

    fn replication_metadata_schema(
        &self,
        store: &str,
        value_schema_id: i32,
        rmd_version_id: i32,
    ) -> Option<RmdSchemaEntry> {
        self.stores
            .read()
            .get(store)
            .and_then(|s| s.rmds.get(&(value_schema_id, rmd_version_id)).cloned())
    }
}

/// Errors raised while loading schemas into a repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// File name is not `<id>.avsc` or `<id>.json`
    #[error("schema file name is not a schema id: {}", .0.display())]
    InvalidFileName(PathBuf),
    /// Schema file does not parse
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Parse failure
        source: rmd_core::SchemaError,
    },
    /// RMD schema could not be generated
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}
