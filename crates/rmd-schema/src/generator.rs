//! RMD schema generation from value schemas.
//!
//! Version 1 layout for a record value schema `Person`:
//!
//! ```text
//! Person_MetadataRecord {
//!   timestamp: union { long, Person_Rmd { <field>: long | <Field>_CollectionRmd, ... } }
//!   replication_checkpoint_vector: array<long>
//! }
//! ```
//!
//! Non-record value schemas only support a record-level timestamp.

use rmd_core::{Field, Record, RecordSchema, Schema, Value, NO_COLO_ID};
use std::sync::Arc;

/// Newest RMD version this generator understands.
pub const LATEST_RMD_VERSION_ID: i32 = 1;

/// Record-level or per-field timestamp.
pub const TIMESTAMP_FIELD_NAME: &str = "timestamp";
/// Causal progress offsets.
pub const REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME: &str = "replication_checkpoint_vector";

/// Time of the last whole-collection put.
pub const TOP_LEVEL_TS_FIELD_NAME: &str = "topLevelFieldTimestamp";
/// Colo of the last whole-collection put.
pub const TOP_LEVEL_COLO_ID_FIELD_NAME: &str = "topLevelColoID";
/// Length of the put-only prefix.
pub const PUT_ONLY_PART_LENGTH_FIELD_NAME: &str = "putOnlyPartLength";
/// Timestamps of elements after the prefix.
pub const ACTIVE_ELEM_TS_FIELD_NAME: &str = "activeElementsTimestamps";
/// Tombstoned element identities.
pub const DELETED_ELEM_FIELD_NAME: &str = "deletedElementsIdentities";
/// Tombstone timestamps.
pub const DELETED_ELEM_TS_FIELD_NAME: &str = "deletedElementsTimestamps";

/// Generate the RMD schema of `value_schema` under `rmd_version_id`.
///
/// # Errors
///
/// Returns error for RMD versions this generator does not know.
pub fn generate_rmd_schema(
    value_schema: &Schema,
    rmd_version_id: i32,
) -> Result<Schema, GeneratorError> {
    if rmd_version_id != LATEST_RMD_VERSION_ID {
        return Err(GeneratorError::UnsupportedVersion(rmd_version_id));
    }

    let (name, namespace, timestamp) = match value_schema.as_record() {
        Some(record) => {
            let timestamps = per_field_record(record);
            (
                record.name.clone(),
                record.namespace.clone(),
                Schema::Union(vec![Schema::Long, Schema::Record(timestamps)]),
            )
        }
        None => (value_schema.type_name().to_string(), None, Schema::Long),
    };

    let rmd = RecordSchema {
        name: format!("{name}_MetadataRecord"),
        namespace,
        fields: vec![
            Field::new(TIMESTAMP_FIELD_NAME, timestamp, Some(Value::Long(0))),
            Field::new(
                REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME,
                Schema::Array(Box::new(Schema::Long)),
                Some(Value::Array(Vec::new())),
            ),
        ],
    };
    tracing::debug!(
        value_schema = %name,
        rmd_version_id,
        "Generated RMD schema"
    );
    Ok(Schema::Record(Arc::new(rmd)))
}

/// Generate the RMD schema under the newest version.
///
/// # Errors
///
/// Never fails today; kept fallible for parity with [`generate_rmd_schema`].
pub fn generate_latest_rmd_schema(value_schema: &Schema) -> Result<Schema, GeneratorError> {
    generate_rmd_schema(value_schema, LATEST_RMD_VERSION_ID)
}

fn per_field_record(value: &RecordSchema) -> Arc<RecordSchema> {
    let fields = value
        .fields
        .iter()
        .map(|field| match field.schema.collection() {
            Some(collection) => {
                let record = collection_record(&field.name, collection, value.namespace.clone());
                let default = collection_default();
                Field::new(&field.name, Schema::Record(record), Some(default))
            }
            None => Field::new(&field.name, Schema::Long, Some(Value::Long(0))),
        })
        .collect();
    Arc::new(RecordSchema {
        name: format!("{}_Rmd", value.name),
        namespace: value.namespace.clone(),
        fields,
    })
}

fn collection_record(
    field_name: &str,
    collection: &Schema,
    namespace: Option<String>,
) -> Arc<RecordSchema> {
    let identity = match collection {
        Schema::Array(items) => (**items).clone(),
        _ => Schema::String,
    };
    let longs = || Schema::Array(Box::new(Schema::Long));
    let empty = || Some(Value::Array(Vec::new()));
    Arc::new(RecordSchema {
        name: format!("{field_name}_CollectionRmd"),
        namespace,
        fields: vec![
            Field::new(TOP_LEVEL_TS_FIELD_NAME, Schema::Long, Some(Value::Long(0))),
            Field::new(
                TOP_LEVEL_COLO_ID_FIELD_NAME,
                Schema::Int,
                Some(Value::Int(NO_COLO_ID)),
            ),
            Field::new(PUT_ONLY_PART_LENGTH_FIELD_NAME, Schema::Int, Some(Value::Int(0))),
            Field::new(ACTIVE_ELEM_TS_FIELD_NAME, longs(), empty()),
            Field::new(
                DELETED_ELEM_FIELD_NAME,
                Schema::Array(Box::new(identity)),
                empty(),
            ),
            Field::new(DELETED_ELEM_TS_FIELD_NAME, longs(), empty()),
        ],
    })
}

fn collection_default() -> Value {
    Value::Record(
        Record::new()
            .with(TOP_LEVEL_TS_FIELD_NAME, 0_i64)
            .with(TOP_LEVEL_COLO_ID_FIELD_NAME, NO_COLO_ID)
            .with(PUT_ONLY_PART_LENGTH_FIELD_NAME, 0)
            .with(ACTIVE_ELEM_TS_FIELD_NAME, Value::Array(Vec::new()))
            .with(DELETED_ELEM_FIELD_NAME, Value::Array(Vec::new()))
            .with(DELETED_ELEM_TS_FIELD_NAME, Value::Array(Vec::new())),
    )
}

/// The per-field timestamp record inside an RMD schema, if it has one.
#[must_use]
pub fn per_field_timestamp_schema(rmd_schema: &Schema) -> Option<&Arc<RecordSchema>> {
    let timestamp = rmd_schema.as_record()?.field(TIMESTAMP_FIELD_NAME)?;
    match &timestamp.schema {
        Schema::Union(branches) => branches.iter().find_map(Schema::as_record),
        _ => None,
    }
}

/// RMD schema generation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
    /// RMD version not known to this generator
    #[error("unsupported RMD version {0}")]
    UnsupportedVersion(i32),
}
