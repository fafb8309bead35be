//! Lazily populated cache keyed by a pair of integers.

use crate::retry::FallibleCache;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Loader<V, E> = dyn Fn(i32, i32) -> Result<V, E> + Send + Sync;

/// Cache of values keyed by `(i32, i32)`, built on first use by a loader.
///
/// The loader runs outside the lock, so two threads missing on the same key
/// may both load it; the first insert wins and both callers get that entry.
/// Failed loads are not cached.
pub struct BiIntKeyCache<V, E> {
    entries: RwLock<HashMap<(i32, i32), Arc<V>>>,
    loader: Box<Loader<V, E>>,
}

impl<V, E> BiIntKeyCache<V, E> {
    /// Create an empty cache around `loader`.
    pub fn new(loader: impl Fn(i32, i32) -> Result<V, E> + Send + Sync + 'static) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            loader: Box::new(loader),
        }
    }

    /// Get the value for `(first, second)`, loading it if absent.
    ///
    /// # Errors
    ///
    /// Returns the loader's error; nothing is cached in that case.
    pub fn get(&self, first: i32, second: i32) -> Result<Arc<V>, E> {
        if let Some(value) = self.entries.read().get(&(first, second)) {
            return Ok(Arc::clone(value));
        }

        let loaded = Arc::new((self.loader)(first, second)?);
        let (value, inserted) = self.insert_loaded((first, second), loaded);
        if inserted {
            tracing::info!(first, second, "Populated cache entry");
        }
        Ok(value)
    }

    /// Insert `loaded` unless another caller got there first. Returns the
    /// cached value and whether this call inserted it.
    fn insert_loaded(&self, key: (i32, i32), loaded: Arc<V>) -> (Arc<V>, bool) {
        match self.entries.write().entry(key) {
            Entry::Occupied(slot) => (Arc::clone(slot.get()), false),
            Entry::Vacant(slot) => (Arc::clone(slot.insert(loaded)), true),
        }
    }

    /// Cached value for `(first, second)`, without loading.
    #[must_use]
    pub fn peek(&self, first: i32, second: i32) -> Option<Arc<V>> {
        self.entries.read().get(&(first, second)).cloned()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V, E> FallibleCache<(i32, i32), Arc<V>> for BiIntKeyCache<V, E>
where
    V: Send + Sync,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn get(&self, key: &(i32, i32)) -> Result<Arc<V>, E> {
        BiIntKeyCache::get(self, key.0, key.1)
    }
}

impl<V, E> fmt::Debug for BiIntKeyCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiIntKeyCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
