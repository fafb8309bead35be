//! Field-level conflict resolution between two replicated writes.
//!
//! # Merge Rules
//!
//! | Field kind | Strategy |
//! |------------|----------|
//! | Primitive / record | LWW on the field timestamp, value order breaks ties |
//! | List / map | Top-level put LWW by (timestamp, colo id) + per-element OR-set with tombstones |
//!
//! A record-level timestamp is expanded to every field before merging; a
//! collection field written by a record-level put becomes a put-only prefix
//! covering the whole collection, owned by the colo of that input. A delete
//! (`value = None`) is a put of the schema defaults; when it wins every field
//! the record stays deleted.
//!
//! Scalar field timestamps do not record a colo, so scalar ties are decided
//! from the competing values alone.

use crate::collection::{merge_collections, CollectionSide};
use crate::config::MergeConfig;
use crate::schema::{Field, RecordSchema, Schema, SchemaError};
use crate::timestamp::{
    CollectionRmdTimestamp, FieldTimestamp, FieldTimestamps, RmdRecord, RmdTimestamp, NO_COLO_ID,
};
use crate::update::UpdateBuilder;
use crate::value::{Record, Value};
use crate::value_and_rmd::ValueAndReplicationMetadata;
use std::cmp::Ordering;
use std::fmt;

/// One side of a merge: a value, its RMD, and the colo it came from.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    /// Record value, `None` for a deleted record or a delete write
    pub value: Option<&'a Record>,
    /// Replication metadata describing `value`
    pub rmd: &'a RmdRecord,
    /// Colo that produced this state; owns collection puts expanded from a
    /// record-level timestamp
    pub colo_id: i32,
}

impl<'a> MergeInput<'a> {
    /// Create a merge input.
    #[must_use]
    pub fn new(value: Option<&'a Record>, rmd: &'a RmdRecord, colo_id: i32) -> Self {
        Self {
            value,
            rmd,
            colo_id,
        }
    }
}

/// A scalar write competing for a field.
#[derive(Debug, Clone, Copy)]
pub struct WriteCandidate<'a> {
    /// Field timestamp
    pub timestamp: i64,
    /// Field value
    pub value: &'a Value,
}

/// Total order deciding which of two scalar writes wins.
///
/// Every region must run the same policy; changing it is only safe when
/// rolled out everywhere at once. The order may only depend on the
/// candidates, which carry nothing but what the RMD records.
pub trait TieBreakPolicy: Send + Sync + fmt::Debug {
    /// Order of `incoming` relative to `existing`; `Greater` means incoming wins.
    fn compare(&self, existing: &WriteCandidate<'_>, incoming: &WriteCandidate<'_>) -> Ordering;
}

/// Timestamp first, then the value order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueOrderTieBreak;

impl TieBreakPolicy for ValueOrderTieBreak {
    fn compare(&self, existing: &WriteCandidate<'_>, incoming: &WriteCandidate<'_>) -> Ordering {
        incoming
            .timestamp
            .cmp(&existing.timestamp)
            .then_with(|| incoming.value.total_cmp(existing.value))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FieldState {
    value: Value,
    timestamp: FieldTimestamp,
}

/// Resolves conflicts between an existing record state and an incoming write.
#[derive(Debug)]
pub struct MergeConflictResolver {
    config: MergeConfig,
    tie_break: Box<dyn TieBreakPolicy>,
}

impl MergeConflictResolver {
    /// Create a resolver with the value-order tie-break.
    #[must_use]
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            tie_break: Box::new(ValueOrderTieBreak),
        }
    }

    /// Replace the tie-break policy.
    #[must_use]
    pub fn with_tie_break(mut self, tie_break: impl TieBreakPolicy + 'static) -> Self {
        self.tie_break = Box::new(tie_break);
        self
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge `incoming` into `existing` under `schema`.
    ///
    /// `existing = None` means the key has never been written. The inputs are
    /// not modified; the outcome owns a fresh value and RMD.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ShapeMismatch`] if an RMD does not match the
    /// value or the schema, and [`MergeError::Schema`] if a default needed
    /// for a delete is missing.
    pub fn merge(
        &self,
        value_schema_id: i32,
        schema: &RecordSchema,
        existing: Option<MergeInput<'_>>,
        incoming: MergeInput<'_>,
    ) -> Result<ValueAndReplicationMetadata, MergeError> {
        let incoming_fields = normalize(schema, &incoming, false)?;
        let existing_fields = match &existing {
            Some(input) => normalize(schema, input, true)?,
            None => vec![None; schema.fields.len()],
        };

        let mut merged_value = Record::new();
        let mut merged_rmd = FieldTimestamps::new();
        let mut fields_won = 0usize;
        let mut incoming_exact = true;

        for ((field, existing_state), incoming_state) in schema
            .fields
            .iter()
            .zip(existing_fields)
            .zip(incoming_fields)
        {
            let (state, incoming_won) = match (existing_state, incoming_state) {
                (None, None) => {
                    incoming_exact = false;
                    (initial_state(field, default_of(field)?), false)
                }
                (Some(existing_state), None) => {
                    incoming_exact = false;
                    (existing_state, false)
                }
                (None, Some(incoming_state)) => (incoming_state, true),
                (Some(existing_state), Some(incoming_state)) => {
                    let (state, won) =
                        self.merge_field(field, existing_state, &incoming_state)?;
                    incoming_exact &= state == incoming_state;
                    (state, won)
                }
            };
            if incoming_won {
                fields_won += 1;
            }
            merged_value.set(field.name.clone(), state.value);
            merged_rmd.set(field.name.clone(), state.timestamp);
        }

        let update_ignored = existing.is_some() && fields_won == 0;
        let mut outcome = if let Some(existing) = existing.filter(|_| update_ignored) {
            ValueAndReplicationMetadata::new(existing.value.cloned(), existing.rmd.clone())
        } else {
            let checkpoints = merge_checkpoint_vectors(
                existing
                    .as_ref()
                    .map_or(&[][..], |e| &e.rmd.replication_checkpoint_vector),
                &incoming.rmd.replication_checkpoint_vector,
            );
            // A compact timestamp would lose the colo of collection puts
            let compact = incoming_exact && !has_collection_fields(schema);
            let timestamp = match incoming.rmd.timestamp {
                RmdTimestamp::Record(ts) if compact => RmdTimestamp::Record(ts),
                _ => RmdTimestamp::PerField(merged_rmd),
            };
            let value = if incoming.value.is_none() && incoming_exact {
                None
            } else {
                Some(merged_value)
            };
            ValueAndReplicationMetadata::new(
                value,
                RmdRecord {
                    timestamp,
                    replication_checkpoint_vector: checkpoints,
                },
            )
        };
        outcome.set_update_ignored(update_ignored);
        outcome.set_resolved_schema_id(value_schema_id);

        tracing::debug!(
            value_schema_id,
            incoming_colo = incoming.colo_id,
            fields_won,
            update_ignored,
            "Merged write"
        );
        Ok(outcome)
    }

    /// Merge a full put of `value` written at `timestamp` by `colo_id`.
    ///
    /// # Errors
    ///
    /// See [`MergeConflictResolver::merge`].
    pub fn put(
        &self,
        value_schema_id: i32,
        schema: &RecordSchema,
        existing: Option<MergeInput<'_>>,
        value: &Record,
        timestamp: i64,
        colo_id: i32,
    ) -> Result<ValueAndReplicationMetadata, MergeError> {
        let rmd = RmdRecord::record_level(timestamp);
        self.merge(
            value_schema_id,
            schema,
            existing,
            MergeInput::new(Some(value), &rmd, colo_id),
        )
    }

    /// Merge a delete written at `timestamp` by `colo_id`.
    ///
    /// # Errors
    ///
    /// See [`MergeConflictResolver::merge`].
    pub fn delete(
        &self,
        value_schema_id: i32,
        schema: &RecordSchema,
        existing: Option<MergeInput<'_>>,
        timestamp: i64,
        colo_id: i32,
    ) -> Result<ValueAndReplicationMetadata, MergeError> {
        let rmd = RmdRecord::record_level(timestamp);
        self.merge(
            value_schema_id,
            schema,
            existing,
            MergeInput::new(None, &rmd, colo_id),
        )
    }

    /// Merge a partial update built with [`UpdateBuilder`].
    ///
    /// # Errors
    ///
    /// See [`MergeConflictResolver::merge`]; also fails if the update mixes
    /// list and map operations on one field.
    pub fn update(
        &self,
        value_schema_id: i32,
        schema: &RecordSchema,
        existing: Option<MergeInput<'_>>,
        update: UpdateBuilder,
        colo_id: i32,
    ) -> Result<ValueAndReplicationMetadata, MergeError> {
        let (value, rmd) = update.build(colo_id).map_err(|e| MergeError::ShapeMismatch {
            field: e.field().to_string(),
            reason: e.to_string(),
        })?;
        self.merge(
            value_schema_id,
            schema,
            existing,
            MergeInput::new(Some(&value), &rmd, colo_id),
        )
    }

    fn merge_field(
        &self,
        field: &Field,
        existing: FieldState,
        incoming: &FieldState,
    ) -> Result<(FieldState, bool), MergeError> {
        match (&existing.timestamp, &incoming.timestamp) {
            (FieldTimestamp::Scalar(existing_ts), FieldTimestamp::Scalar(incoming_ts)) => {
                let order = self.tie_break.compare(
                    &WriteCandidate {
                        timestamp: *existing_ts,
                        value: &existing.value,
                    },
                    &WriteCandidate {
                        timestamp: *incoming_ts,
                        value: &incoming.value,
                    },
                );
                if order == Ordering::Greater {
                    Ok((incoming.clone(), true))
                } else {
                    Ok((existing, false))
                }
            }
            (FieldTimestamp::Collection(existing_ts), FieldTimestamp::Collection(incoming_ts)) => {
                let merged = merge_collections(
                    CollectionSide::new(&existing.value, existing_ts),
                    CollectionSide::new(&incoming.value, incoming_ts),
                    &self.config.tombstones,
                )
                .map_err(|e| shape(&field.name, e.to_string()))?;
                Ok((
                    FieldState {
                        value: merged.value,
                        timestamp: FieldTimestamp::Collection(merged.rmd),
                    },
                    merged.incoming_won,
                ))
            }
            _ => Err(shape(
                &field.name,
                "scalar timestamp merged against collection timestamp",
            )),
        }
    }
}

impl Default for MergeConflictResolver {
    fn default() -> Self {
        Self::new(MergeConfig::default())
    }
}

fn shape(field: &str, reason: impl Into<String>) -> MergeError {
    MergeError::ShapeMismatch {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn has_collection_fields(schema: &RecordSchema) -> bool {
    schema.fields.iter().any(|f| f.schema.collection().is_some())
}

fn default_of(field: &Field) -> Result<Value, MergeError> {
    field
        .default
        .clone()
        .ok_or_else(|| MergeError::Schema(SchemaError::MissingDefault(field.name.clone())))
}

fn collection_len(value: &Value) -> Result<i32, MergeError> {
    i32::try_from(value.collection_len().unwrap_or(0))
        .map_err(|_| MergeError::Schema(SchemaError::Invalid("collection too large".to_string())))
}

/// State of a field that has a value but no recorded timestamp.
fn initial_state(field: &Field, value: Value) -> FieldState {
    let timestamp = if field.schema.collection().is_some() {
        let len = i32::try_from(value.collection_len().unwrap_or(0)).unwrap_or(i32::MAX);
        FieldTimestamp::Collection(CollectionRmdTimestamp::put(0, NO_COLO_ID, len))
    } else {
        FieldTimestamp::Scalar(0)
    };
    FieldState { value, timestamp }
}

fn check_shape(field: &Field, value: Value, timestamp: FieldTimestamp) -> Result<FieldState, MergeError> {
    let collection_schema = field.schema.collection();
    match (&timestamp, collection_schema) {
        (FieldTimestamp::Collection(ts), Some(schema)) => {
            let value_matches = matches!(
                (schema, &value),
                (Schema::Array(_), Value::Array(_)) | (Schema::Map(_), Value::Map(_))
                    | (_, Value::Null)
            );
            if !value_matches {
                return Err(shape(
                    &field.name,
                    format!("collection timestamps paired with a {} value", value.kind()),
                ));
            }
            ts.validate(value.collection_len().unwrap_or(0))
                .map_err(|e| shape(&field.name, e.to_string()))?;
        }
        (FieldTimestamp::Scalar(_), None) => {}
        (FieldTimestamp::Collection(_), None) => {
            return Err(shape(
                &field.name,
                format!("collection timestamps for a {} field", field.schema.type_name()),
            ))
        }
        (FieldTimestamp::Scalar(_), Some(_)) => {
            return Err(shape(&field.name, "scalar timestamp for a collection field"))
        }
    }
    Ok(FieldState { value, timestamp })
}

/// Per-field states of one side, in schema order.
///
/// `fill_missing` treats a value without a timestamp as written at time 0
/// (existing state); otherwise such fields are not part of the write.
fn normalize(
    schema: &RecordSchema,
    input: &MergeInput<'_>,
    fill_missing: bool,
) -> Result<Vec<Option<FieldState>>, MergeError> {
    if let Some(record) = input.value {
        if let Some((name, _)) = record.iter().find(|(name, _)| schema.field(name).is_none()) {
            return Err(shape(name, "field not in value schema"));
        }
    }
    if let RmdTimestamp::PerField(fields) = &input.rmd.timestamp {
        if let Some((name, _)) = fields.iter().find(|(name, _)| schema.field(name).is_none()) {
            return Err(shape(name, "RMD field not in value schema"));
        }
    }

    schema
        .fields
        .iter()
        .map(|field| {
            let value = match input.value {
                Some(record) => record.get(&field.name).cloned(),
                None => Some(default_of(field)?),
            };
            let timestamp = match &input.rmd.timestamp {
                RmdTimestamp::Record(ts) => {
                    if field.schema.collection().is_some() {
                        let len = match &value {
                            Some(v) => collection_len(v)?,
                            None => collection_len(&default_of(field)?)?,
                        };
                        Some(FieldTimestamp::Collection(CollectionRmdTimestamp::put(
                            *ts,
                            input.colo_id,
                            len,
                        )))
                    } else {
                        Some(FieldTimestamp::Scalar(*ts))
                    }
                }
                RmdTimestamp::PerField(fields) => fields.get(&field.name).cloned(),
            };
            match (value, timestamp) {
                (Some(value), Some(timestamp)) => check_shape(field, value, timestamp).map(Some),
                (None, Some(timestamp)) => check_shape(field, default_of(field)?, timestamp).map(Some),
                (Some(value), None) if fill_missing => Ok(Some(initial_state(field, value))),
                _ => Ok(None),
            }
        })
        .collect()
}

/// Element-wise maximum, padded to the longer vector.
#[must_use]
pub fn merge_checkpoint_vectors(existing: &[i64], incoming: &[i64]) -> Vec<i64> {
    let len = existing.len().max(incoming.len());
    (0..len)
        .map(|i| match (existing.get(i), incoming.get(i)) {
            (Some(a), Some(b)) => *a.max(b),
            (Some(v), None) | (None, Some(v)) => *v,
            (None, None) => 0,
        })
        .collect()
}

/// Errors raised by the merge engine. Both are fatal for the record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    /// RMD shape does not match the value or the schema
    #[error("shape mismatch on field {field}: {reason}")]
    ShapeMismatch {
        /// Offending field
        field: String,
        /// What did not match
        reason: String,
    },
    /// Schema could not satisfy the merge
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const PERSON: &str = r#"{
        "type": "record", "name": "Person",
        "fields": [
            {"name": "Name", "type": "string", "default": "unknown"},
            {"name": "Age", "type": "int", "default": -1},
            {"name": "Items", "type": {"type": "array", "items": "string"}, "default": []},
            {"name": "PetNameToAge", "type": ["null", {"type": "map", "values": "int"}], "default": null}
        ]
    }"#;

    fn person_schema() -> Arc<RecordSchema> {
        Arc::clone(Schema::parse_str(PERSON).unwrap().as_record().unwrap())
    }

    fn person(name: &str, age: i32, items: &[&str]) -> Record {
        Record::new()
            .with("Name", name)
            .with("Age", age)
            .with(
                "Items",
                Value::Array(items.iter().map(|s| Value::from(*s)).collect()),
            )
            .with("PetNameToAge", Value::Null)
    }

    fn per_field(name: i64, age: i64, items: CollectionRmdTimestamp, pets: CollectionRmdTimestamp) -> RmdRecord {
        RmdRecord::per_field(
            FieldTimestamps::new()
                .with("Name", name)
                .with("Age", age)
                .with("Items", items)
                .with("PetNameToAge", pets),
        )
    }

    #[test]
    fn newer_field_wins() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &[]);
        let existing_rmd = RmdRecord::record_level(10);
        let incoming_value = person("a", 31, &[]);
        let incoming_rmd = RmdRecord::record_level(15);

        let outcome = resolver
            .merge(
                1,
                &schema,
                Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)),
                MergeInput::new(Some(&incoming_value), &incoming_rmd, 2),
            )
            .unwrap();

        assert!(!outcome.is_update_ignored());
        assert_eq!(outcome.value().and_then(|r| r.get("Age")), Some(&Value::Int(31)));
        assert_eq!(
            outcome.replication_metadata().timestamp,
            RmdTimestamp::PerField(FieldTimestamps::new()
                .with("Name", 15_i64)
                .with("Age", 15_i64)
                .with("Items", CollectionRmdTimestamp::put(15, 2, 0))
                .with("PetNameToAge", CollectionRmdTimestamp::put(15, 2, 0)))
        );
        assert_eq!(outcome.resolved_schema_id(), 1);
    }

    #[test]
    fn older_write_is_ignored() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &["x"]);
        let existing_rmd = RmdRecord::record_level(20).with_checkpoint_vector(vec![4, 4]);
        let incoming_value = person("b", 31, &["y"]);

        let outcome = resolver
            .put(
                1,
                &schema,
                Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)),
                &incoming_value,
                15,
                2,
            )
            .unwrap();

        assert!(outcome.is_update_ignored());
        assert_eq!(outcome.value(), Some(&existing_value));
        assert_eq!(outcome.replication_metadata(), &existing_rmd);
    }

    #[test]
    fn partial_win_keeps_other_fields() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &[]);
        let existing_rmd = per_field(
            20,
            10,
            CollectionRmdTimestamp::put(10, 1, 0),
            CollectionRmdTimestamp::put(10, 1, 0),
        );
        let incoming_value = person("b", 31, &[]);

        let outcome = resolver
            .put(
                1,
                &schema,
                Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)),
                &incoming_value,
                15,
                2,
            )
            .unwrap();

        assert!(!outcome.is_update_ignored());
        let value = outcome.value().unwrap();
        assert_eq!(value.get("Name"), Some(&Value::from("a")));
        assert_eq!(value.get("Age"), Some(&Value::Int(31)));
        let RmdTimestamp::PerField(fields) = &outcome.replication_metadata().timestamp else {
            panic!("expected per-field timestamps");
        };
        assert_eq!(fields.get("Name"), Some(&FieldTimestamp::Scalar(20)));
        assert_eq!(fields.get("Age"), Some(&FieldTimestamp::Scalar(15)));
        assert_eq!(
            fields.get("Items"),
            Some(&FieldTimestamp::Collection(CollectionRmdTimestamp::put(15, 2, 0)))
        );
    }

    #[test]
    fn tie_break_is_symmetric() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let a = person("a", 1, &["p"]);
        let b = person("b", 2, &["q"]);
        let rmd = RmdRecord::record_level(7);

        let ab = resolver
            .merge(
                1,
                &schema,
                Some(MergeInput::new(Some(&a), &rmd, 3)),
                MergeInput::new(Some(&b), &rmd, 5),
            )
            .unwrap();
        let ba = resolver
            .merge(
                1,
                &schema,
                Some(MergeInput::new(Some(&b), &rmd, 5)),
                MergeInput::new(Some(&a), &rmd, 3),
            )
            .unwrap();

        assert_eq!(ab.value(), Some(&b));
        assert_eq!(ba.value(), Some(&b));
        assert!(!ab.is_update_ignored());
        assert!(ba.is_update_ignored());
    }

    #[test]
    fn replayed_write_is_ignored() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let value = person("a", 1, &["p", "q"]);
        let rmd = RmdRecord::record_level(7);

        let outcome = resolver
            .merge(
                1,
                &schema,
                Some(MergeInput::new(Some(&value), &rmd, 3)),
                MergeInput::new(Some(&value), &rmd, 3),
            )
            .unwrap();
        assert!(outcome.is_update_ignored());
        assert_eq!(outcome.value(), Some(&value));
        assert_eq!(outcome.replication_metadata(), &rmd);
    }

    #[test]
    fn scalar_ties_ignore_colo_ids() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let a = person("a", 1, &[]);
        let b = person("a", 2, &[]);
        let rmd = RmdRecord::record_level(7);

        let ab = resolver
            .merge(1, &schema, Some(MergeInput::new(Some(&a), &rmd, 9)), MergeInput::new(Some(&b), &rmd, 4))
            .unwrap();
        let ba = resolver
            .merge(1, &schema, Some(MergeInput::new(Some(&b), &rmd, 4)), MergeInput::new(Some(&a), &rmd, 9))
            .unwrap();
        assert_eq!(ab.value().and_then(|r| r.get("Age")), Some(&Value::Int(2)));
        assert_eq!(ab.value(), ba.value());
    }

    #[test]
    fn merge_is_deterministic() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &["x", "y"]);
        let existing_rmd = RmdRecord::record_level(10);
        let update = UpdateBuilder::new(12)
            .set_field("Age", 44)
            .add_to_list("Items", vec![Value::from("z")])
            .remove_from_list("Items", vec![Value::from("x")]);

        let run = || {
            resolver
                .update(
                    1,
                    &schema,
                    Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)),
                    update.clone(),
                    2,
                )
                .unwrap()
                .into_parts()
        };
        let first = run();
        for _ in 0..3 {
            assert_eq!(run(), first);
        }
        let value = first.0.unwrap();
        assert_eq!(
            value.get("Items"),
            Some(&Value::Array(vec![Value::from("y"), Value::from("z")]))
        );
        assert_eq!(value.get("Name"), Some(&Value::from("a")));
    }

    #[test]
    fn delete_winning_everything_removes_record() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &["x"]);
        let existing_rmd = RmdRecord::record_level(10);

        let outcome = resolver
            .delete(1, &schema, Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)), 12, 2)
            .unwrap();
        assert!(!outcome.is_update_ignored());
        assert!(outcome.value().is_none());
        let RmdTimestamp::PerField(fields) = &outcome.replication_metadata().timestamp else {
            panic!("expected per-field timestamps");
        };
        assert_eq!(fields.get("Name"), Some(&FieldTimestamp::Scalar(12)));
        assert_eq!(
            fields.get("Items"),
            Some(&FieldTimestamp::Collection(CollectionRmdTimestamp::put(12, 2, 0)))
        );

        // A stale put arriving after the delete is rejected
        let (value, rmd) = outcome.into_parts();
        let stale = person("b", 5, &[]);
        let outcome = resolver
            .put(1, &schema, Some(MergeInput::new(value.as_ref(), &rmd, 2)), &stale, 11, 3)
            .unwrap();
        assert!(outcome.is_update_ignored());
        assert!(outcome.value().is_none());
    }

    #[test]
    fn partial_delete_resets_losing_fields_to_defaults() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &[]);
        let existing_rmd = per_field(
            20,
            5,
            CollectionRmdTimestamp::put(5, 1, 0),
            CollectionRmdTimestamp::put(5, 1, 0),
        );

        let outcome = resolver
            .delete(1, &schema, Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)), 10, 2)
            .unwrap();
        let value = outcome.value().unwrap();
        assert_eq!(value.get("Name"), Some(&Value::from("a")));
        assert_eq!(value.get("Age"), Some(&Value::Int(-1)));
    }

    #[test]
    fn first_write_is_taken_whole() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let value = person("a", 30, &["x"]);
        let outcome = resolver.put(1, &schema, None, &value, 3, 1).unwrap();
        assert!(!outcome.is_update_ignored());
        assert_eq!(outcome.value(), Some(&value));
        let RmdTimestamp::PerField(fields) = &outcome.replication_metadata().timestamp else {
            panic!("expected per-field timestamps");
        };
        assert_eq!(fields.get("Age"), Some(&FieldTimestamp::Scalar(3)));
        assert_eq!(
            fields.get("Items"),
            Some(&FieldTimestamp::Collection(CollectionRmdTimestamp::put(3, 1, 1)))
        );
    }

    #[test]
    fn scalar_only_put_stays_record_level() {
        let schema = Schema::parse_str(
            r#"{"type": "record", "name": "Point", "fields": [
                {"name": "x", "type": "int", "default": 0},
                {"name": "y", "type": "int", "default": 0}
            ]}"#,
        )
        .unwrap();
        let schema = schema.as_record().unwrap();
        let resolver = MergeConflictResolver::default();
        let value = Record::new().with("x", 1).with("y", 2);
        let outcome = resolver.put(1, schema, None, &value, 3, 1).unwrap();
        assert_eq!(outcome.replication_metadata().timestamp, RmdTimestamp::Record(3));
    }

    #[test]
    fn arrival_order_does_not_change_outcome() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let from_9 = person("n9", 9, &["a"]);
        let from_5 = person("n5", 5, &["b"]);

        // Each step passes the colo of the write applied last as the stored colo
        let apply = |order: &[usize]| {
            let mut state: Option<(Option<Record>, RmdRecord, i32)> = None;
            for &write in order {
                let existing = state
                    .as_ref()
                    .map(|(value, rmd, colo)| MergeInput::new(value.as_ref(), rmd, *colo));
                let (outcome, colo) = match write {
                    0 => (resolver.put(1, &schema, existing, &from_9, 10, 9).unwrap(), 9),
                    1 => (resolver.put(1, &schema, existing, &from_5, 10, 5).unwrap(), 5),
                    _ => (
                        resolver
                            .update(1, &schema, existing, UpdateBuilder::new(20).set_field("Age", 40), 1)
                            .unwrap(),
                        1,
                    ),
                };
                let (value, rmd) = outcome.into_parts();
                state = Some((value, rmd, colo));
            }
            state.map(|(value, rmd, _)| (value, rmd))
        };

        let first = apply(&[0, 2, 1]);
        assert_eq!(apply(&[1, 0, 2]), first);
        assert_eq!(apply(&[2, 1, 0]), first);

        let (value, _) = first.unwrap();
        let value = value.unwrap();
        assert_eq!(value.get("Name"), Some(&Value::from("n9")));
        assert_eq!(value.get("Age"), Some(&Value::Int(40)));
        assert_eq!(value.get("Items"), Some(&Value::Array(vec![Value::from("a")])));
    }

    #[test]
    fn collection_rmd_against_scalar_field_is_fatal() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let existing_value = person("a", 30, &[]);
        let existing_rmd = per_field(
            1,
            1,
            CollectionRmdTimestamp::default(),
            CollectionRmdTimestamp::default(),
        );
        let bad_rmd = RmdRecord::per_field(
            FieldTimestamps::new().with("Age", CollectionRmdTimestamp::default()),
        );
        let err = resolver
            .merge(
                1,
                &schema,
                Some(MergeInput::new(Some(&existing_value), &existing_rmd, 1)),
                MergeInput::new(Some(&existing_value), &bad_rmd, 2),
            )
            .unwrap_err();
        assert!(matches!(err, MergeError::ShapeMismatch { field, .. } if field == "Age"));
    }

    #[test]
    fn unknown_field_is_fatal() {
        let schema = person_schema();
        let resolver = MergeConflictResolver::default();
        let value = person("a", 1, &[]).with("Height", 180);
        let err = resolver.put(1, &schema, None, &value, 1, 1).unwrap_err();
        assert!(matches!(err, MergeError::ShapeMismatch { field, .. } if field == "Height"));
    }

    #[test]
    fn checkpoint_vectors_take_elementwise_max() {
        assert_eq!(merge_checkpoint_vectors(&[1, 5], &[3, 2, 9]), vec![3, 5, 9]);
        assert_eq!(merge_checkpoint_vectors(&[], &[]), Vec::<i64>::new());
    }
}
