//! Replication metadata (RMD) timestamp model.
//!
//! Every stored record carries an [`RmdRecord`]: either one logical
//! timestamp for the whole record, or one timestamp per field. List and map
//! fields carry a [`CollectionRmdTimestamp`] with per-element timestamps and
//! tombstones for removed elements.
//!
//! Timestamps are logical milliseconds, monotonic per originating colo but
//! not comparable to wall-clock time across colos.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Replication metadata for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmdRecord {
    /// Record-level or per-field timestamps
    pub timestamp: RmdTimestamp,
    /// One offset per source, used for causal progress tracking only
    pub replication_checkpoint_vector: Vec<i64>,
}

impl RmdRecord {
    /// RMD for a record written as a whole at `timestamp`.
    #[must_use]
    pub fn record_level(timestamp: i64) -> Self {
        Self {
            timestamp: RmdTimestamp::Record(timestamp),
            replication_checkpoint_vector: Vec::new(),
        }
    }

    /// RMD with per-field timestamps.
    #[must_use]
    pub fn per_field(fields: FieldTimestamps) -> Self {
        Self {
            timestamp: RmdTimestamp::PerField(fields),
            replication_checkpoint_vector: Vec::new(),
        }
    }

    /// Builder-style checkpoint vector.
    #[must_use]
    pub fn with_checkpoint_vector(mut self, offsets: Vec<i64>) -> Self {
        self.replication_checkpoint_vector = offsets;
        self
    }

    /// Highest timestamp recorded anywhere in this RMD.
    #[must_use]
    pub fn max_timestamp(&self) -> i64 {
        match &self.timestamp {
            RmdTimestamp::Record(ts) => *ts,
            RmdTimestamp::PerField(fields) => fields
                .iter()
                .map(|(_, f)| f.max_timestamp())
                .max()
                .unwrap_or(i64::MIN),
        }
    }
}

/// Record-level timestamp or per-field timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RmdTimestamp {
    /// A single timestamp covering the whole record
    Record(i64),
    /// One entry per field of the value schema
    PerField(FieldTimestamps),
}

/// Per-field timestamps keyed by field name.
///
/// Iteration follows insertion order; equality does not depend on it. A
/// partial update may leave fields out; absent fields are left untouched by
/// the merge engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldTimestamps {
    fields: Vec<(String, FieldTimestamp)>,
}

impl PartialEq for FieldTimestamps {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(name, ts)| other.get(name).is_some_and(|o| o == ts))
    }
}

impl FieldTimestamps {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, ts: impl Into<FieldTimestamp>) -> Self {
        self.set(name, ts.into());
        self
    }

    /// Get the timestamp of a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldTimestamp> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Set or replace the timestamp of a field.
    pub fn set(&mut self, name: impl Into<String>, ts: FieldTimestamp) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = ts;
        } else {
            self.fields.push((name, ts));
        }
    }

    /// Iterate in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldTimestamp)> {
        self.fields.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no field carries a timestamp.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Timestamp of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldTimestamp {
    /// Primitive or record-typed field
    Scalar(i64),
    /// List or map field
    Collection(CollectionRmdTimestamp),
}

impl FieldTimestamp {
    /// Highest timestamp recorded for this field.
    #[must_use]
    pub fn max_timestamp(&self) -> i64 {
        match self {
            FieldTimestamp::Scalar(ts) => *ts,
            FieldTimestamp::Collection(c) => c.max_timestamp(),
        }
    }
}

impl From<i64> for FieldTimestamp {
    fn from(value: i64) -> Self {
        FieldTimestamp::Scalar(value)
    }
}

impl From<CollectionRmdTimestamp> for FieldTimestamp {
    fn from(value: CollectionRmdTimestamp) -> Self {
        FieldTimestamp::Collection(value)
    }
}

/// Timestamps of a list or map field.
///
/// The first `put_only_part_length` elements were written by the last
/// whole-collection put and implicitly carry `top_level_timestamp`. Every
/// later element has an entry in `active_elements_timestamps`, in
/// collection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRmdTimestamp {
    /// Time of the most recent whole-collection put
    pub top_level_timestamp: i64,
    /// Colo that performed that put
    pub top_level_colo_id: i32,
    /// Length of the prefix written entirely by that put
    pub put_only_part_length: i32,
    /// One timestamp per element after the put-only prefix
    pub active_elements_timestamps: Vec<i64>,
    /// Tombstoned elements (map keys for maps)
    pub deleted_elements: Vec<Value>,
    /// Parallel to `deleted_elements`
    pub deleted_elements_timestamps: Vec<i64>,
}

/// Colo id recorded when no put has happened yet.
pub const NO_COLO_ID: i32 = -1;

impl Default for CollectionRmdTimestamp {
    fn default() -> Self {
        Self::put(0, NO_COLO_ID, 0)
    }
}

impl CollectionRmdTimestamp {
    /// Timestamps of a collection written as a whole by a put.
    #[must_use]
    pub fn put(timestamp: i64, colo_id: i32, len: i32) -> Self {
        Self {
            top_level_timestamp: timestamp,
            top_level_colo_id: colo_id,
            put_only_part_length: len,
            active_elements_timestamps: Vec::new(),
            deleted_elements: Vec::new(),
            deleted_elements_timestamps: Vec::new(),
        }
    }

    /// Check the structural invariants against the collection length.
    ///
    /// # Errors
    ///
    /// Returns error describing the first violated invariant.
    pub fn validate(&self, collection_len: usize) -> Result<(), TimestampError> {
        if self.deleted_elements.len() != self.deleted_elements_timestamps.len() {
            return Err(TimestampError::TombstoneLengthMismatch {
                elements: self.deleted_elements.len(),
                timestamps: self.deleted_elements_timestamps.len(),
            });
        }
        let put_only = usize::try_from(self.put_only_part_length)
            .map_err(|_| TimestampError::NegativePutOnlyLength(self.put_only_part_length))?;
        if put_only + self.active_elements_timestamps.len() != collection_len {
            return Err(TimestampError::ActiveLengthMismatch {
                put_only,
                active: self.active_elements_timestamps.len(),
                collection: collection_len,
            });
        }
        Ok(())
    }

    /// Per-element timestamps for a collection of `collection_len` elements.
    ///
    /// # Errors
    ///
    /// Returns error if the invariants do not hold for that length.
    pub fn element_timestamps(&self, collection_len: usize) -> Result<Vec<i64>, TimestampError> {
        self.validate(collection_len)?;
        let put_only = collection_len - self.active_elements_timestamps.len();
        let mut timestamps = vec![self.top_level_timestamp; put_only];
        timestamps.extend_from_slice(&self.active_elements_timestamps);
        Ok(timestamps)
    }

    /// Tombstones as `(element, timestamp)` pairs.
    pub fn tombstones(&self) -> impl Iterator<Item = (&Value, i64)> {
        self.deleted_elements
            .iter()
            .zip(self.deleted_elements_timestamps.iter().copied())
    }

    /// Highest timestamp recorded for this collection.
    #[must_use]
    pub fn max_timestamp(&self) -> i64 {
        self.active_elements_timestamps
            .iter()
            .chain(self.deleted_elements_timestamps.iter())
            .copied()
            .fold(self.top_level_timestamp, i64::max)
    }
}

/// A decoded RMD paired with the value schema id it was written against.
///
/// Filled in by the codec; owned by the caller that supplies it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RmdWithValueSchemaId {
    value_schema_id: i32,
    rmd_record: Option<RmdRecord>,
}

impl RmdWithValueSchemaId {
    /// Create an empty holder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate both parts.
    pub fn set(&mut self, value_schema_id: i32, rmd_record: RmdRecord) {
        self.value_schema_id = value_schema_id;
        self.rmd_record = Some(rmd_record);
    }

    /// Value schema id the RMD was written against.
    #[must_use]
    pub fn value_schema_id(&self) -> i32 {
        self.value_schema_id
    }

    /// The decoded RMD, if populated.
    #[must_use]
    pub fn rmd_record(&self) -> Option<&RmdRecord> {
        self.rmd_record.as_ref()
    }

    /// Take ownership of the decoded RMD.
    #[must_use]
    pub fn into_rmd_record(self) -> Option<RmdRecord> {
        self.rmd_record
    }
}

/// Violations of the collection timestamp invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// Tombstone lists have different lengths
    #[error("{elements} deleted elements but {timestamps} deleted timestamps")]
    TombstoneLengthMismatch {
        /// Length of `deleted_elements`
        elements: usize,
        /// Length of `deleted_elements_timestamps`
        timestamps: usize,
    },
    /// Put-only prefix plus active timestamps does not cover the collection
    #[error("put-only part {put_only} + {active} active timestamps != collection length {collection}")]
    ActiveLengthMismatch {
        /// Put-only prefix length
        put_only: usize,
        /// Number of active element timestamps
        active: usize,
        /// Actual collection length
        collection: usize,
    },
    /// Negative put-only length
    #[error("negative put-only part length {0}")]
    NegativePutOnlyLength(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items_rmd() -> CollectionRmdTimestamp {
        CollectionRmdTimestamp {
            top_level_timestamp: 23,
            top_level_colo_id: 1,
            put_only_part_length: 3,
            active_elements_timestamps: vec![1, 2, 3],
            deleted_elements: vec![Value::from("foo"), Value::from("bar")],
            deleted_elements_timestamps: vec![1, 100],
        }
    }

    #[test]
    fn element_timestamps_expand_put_only_prefix() {
        let ts = items_rmd().element_timestamps(6).unwrap();
        assert_eq!(ts, vec![23, 23, 23, 1, 2, 3]);
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        assert_eq!(
            items_rmd().validate(5),
            Err(TimestampError::ActiveLengthMismatch {
                put_only: 3,
                active: 3,
                collection: 5
            })
        );

        let mut broken = items_rmd();
        broken.deleted_elements_timestamps.pop();
        assert!(matches!(
            broken.validate(6),
            Err(TimestampError::TombstoneLengthMismatch { .. })
        ));
    }

    #[test]
    fn max_timestamp_covers_tombstones() {
        assert_eq!(items_rmd().max_timestamp(), 100);
        let rmd = RmdRecord::per_field(
            FieldTimestamps::new()
                .with("Age", 7_i64)
                .with("Items", items_rmd()),
        );
        assert_eq!(rmd.max_timestamp(), 100);
    }

    #[test]
    fn field_order_does_not_affect_equality() {
        let schema_order = FieldTimestamps::new()
            .with("Name", 2_i64)
            .with("Age", 3_i64)
            .with("Items", items_rmd());
        let shuffled = FieldTimestamps::new()
            .with("Items", items_rmd())
            .with("Age", 3_i64)
            .with("Name", 2_i64);
        assert_eq!(schema_order, shuffled);
        assert_ne!(schema_order, shuffled.clone().with("Age", 4_i64));
        assert_ne!(schema_order, shuffled.with("Height", 1_i64));
    }

    #[test]
    fn holder_starts_empty() {
        let mut holder = RmdWithValueSchemaId::new();
        assert!(holder.rmd_record().is_none());
        holder.set(12, RmdRecord::record_level(5));
        assert_eq!(holder.value_schema_id(), 12);
        assert_eq!(holder.rmd_record(), Some(&RmdRecord::record_level(5)));
    }
}
