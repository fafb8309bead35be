//! Merge outcome: a value paired with its replication metadata.

use crate::timestamp::RmdRecord;
use crate::value::Record;
use std::cell::{Cell, OnceCell};
use std::fmt;

type Deferred = Box<dyn FnOnce() -> Option<Record> + Send>;

/// A value (possibly computed on first access) and its RMD.
///
/// `None` as the value means the record is deleted; its RMD is still kept so
/// that stale writes arriving later can be rejected.
pub struct ValueAndReplicationMetadata {
    value: OnceCell<Option<Record>>,
    deferred: Cell<Option<Deferred>>,
    replication_metadata: RmdRecord,
    /// The incoming write lost and must not be persisted
    update_ignored: bool,
    resolved_schema_id: i32,
}

impl ValueAndReplicationMetadata {
    /// Pair an already computed value with its RMD.
    #[must_use]
    pub fn new(value: Option<Record>, replication_metadata: RmdRecord) -> Self {
        Self {
            value: OnceCell::from(value),
            deferred: Cell::new(None),
            replication_metadata,
            update_ignored: false,
            resolved_schema_id: 0,
        }
    }

    /// Pair a value computed on first access with its RMD.
    #[must_use]
    pub fn lazy(
        value: impl FnOnce() -> Option<Record> + Send + 'static,
        replication_metadata: RmdRecord,
    ) -> Self {
        Self {
            value: OnceCell::new(),
            deferred: Cell::new(Some(Box::new(value))),
            replication_metadata,
            update_ignored: false,
            resolved_schema_id: 0,
        }
    }

    /// The value, computing it if needed.
    #[must_use]
    pub fn value(&self) -> Option<&Record> {
        self.value
            .get_or_init(|| self.deferred.take().and_then(|compute| compute()))
            .as_ref()
    }

    /// Replace the value.
    pub fn set_value(&mut self, value: Option<Record>) {
        self.deferred = Cell::new(None);
        self.value = OnceCell::from(value);
    }

    /// The replication metadata.
    #[must_use]
    pub fn replication_metadata(&self) -> &RmdRecord {
        &self.replication_metadata
    }

    /// Replace the replication metadata.
    pub fn set_replication_metadata(&mut self, replication_metadata: RmdRecord) {
        self.replication_metadata = replication_metadata;
    }

    /// Whether the incoming write lost and must be skipped.
    #[must_use]
    pub fn is_update_ignored(&self) -> bool {
        self.update_ignored
    }

    /// Mark the incoming write as ignored or applied.
    pub fn set_update_ignored(&mut self, update_ignored: bool) {
        self.update_ignored = update_ignored;
    }

    /// Value schema id the value was resolved against.
    #[must_use]
    pub fn resolved_schema_id(&self) -> i32 {
        self.resolved_schema_id
    }

    /// Set the value schema id the value was resolved against.
    pub fn set_resolved_schema_id(&mut self, schema_id: i32) {
        self.resolved_schema_id = schema_id;
    }

    /// Split into value and RMD, computing the value if needed.
    #[must_use]
    pub fn into_parts(self) -> (Option<Record>, RmdRecord) {
        let Self {
            value,
            deferred,
            replication_metadata,
            ..
        } = self;
        let value = match value.into_inner() {
            Some(v) => v,
            None => deferred.into_inner().and_then(|compute| compute()),
        };
        (value, replication_metadata)
    }
}

impl fmt::Debug for ValueAndReplicationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueAndReplicationMetadata")
            .field("value", &self.value.get())
            .field("replication_metadata", &self.replication_metadata)
            .field("update_ignored", &self.update_ignored)
            .field("resolved_schema_id", &self.resolved_schema_id)
            .finish_non_exhaustive()
    }
}
