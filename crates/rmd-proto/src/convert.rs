//! Mapping between typed RMD and generic values shaped by the RMD schema.

use crate::binary::BinaryError;
use rmd_core::{
    CollectionRmdTimestamp, FieldTimestamp, FieldTimestamps, Record, RmdRecord, RmdTimestamp,
    Value,
};
use rmd_schema::generator::{
    ACTIVE_ELEM_TS_FIELD_NAME, DELETED_ELEM_FIELD_NAME, DELETED_ELEM_TS_FIELD_NAME,
    PUT_ONLY_PART_LENGTH_FIELD_NAME, REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME,
    TIMESTAMP_FIELD_NAME, TOP_LEVEL_COLO_ID_FIELD_NAME, TOP_LEVEL_TS_FIELD_NAME,
};

/// Generic value of an RMD, ready to encode under its RMD schema.
#[must_use]
pub fn rmd_to_value(rmd: &RmdRecord) -> Value {
    let timestamp = match &rmd.timestamp {
        RmdTimestamp::Record(ts) => Value::Long(*ts),
        RmdTimestamp::PerField(fields) => Value::Record(
            fields
                .iter()
                .map(|(name, ts)| (name.to_string(), field_to_value(ts)))
                .collect(),
        ),
    };
    Value::Record(
        Record::new()
            .with(TIMESTAMP_FIELD_NAME, timestamp)
            .with(
                REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME,
                longs(&rmd.replication_checkpoint_vector),
            ),
    )
}

fn field_to_value(ts: &FieldTimestamp) -> Value {
    match ts {
        FieldTimestamp::Scalar(ts) => Value::Long(*ts),
        FieldTimestamp::Collection(c) => Value::Record(
            Record::new()
                .with(TOP_LEVEL_TS_FIELD_NAME, c.top_level_timestamp)
                .with(TOP_LEVEL_COLO_ID_FIELD_NAME, c.top_level_colo_id)
                .with(PUT_ONLY_PART_LENGTH_FIELD_NAME, c.put_only_part_length)
                .with(ACTIVE_ELEM_TS_FIELD_NAME, longs(&c.active_elements_timestamps))
                .with(
                    DELETED_ELEM_FIELD_NAME,
                    Value::Array(c.deleted_elements.clone()),
                )
                .with(
                    DELETED_ELEM_TS_FIELD_NAME,
                    longs(&c.deleted_elements_timestamps),
                ),
        ),
    }
}

fn longs(values: &[i64]) -> Value {
    Value::Array(values.iter().copied().map(Value::Long).collect())
}

/// Typed RMD from a value decoded under an RMD schema.
///
/// # Errors
///
/// Returns error if the value is not shaped like an RMD.
pub fn value_to_rmd(value: Value) -> Result<RmdRecord, BinaryError> {
    let mut record = match value {
        Value::Record(record) => record,
        other => return Err(mismatch("record", &other)),
    };
    let timestamp = match take(&mut record, TIMESTAMP_FIELD_NAME)? {
        Value::Long(ts) => RmdTimestamp::Record(ts),
        Value::Record(fields) => {
            let mut timestamps = FieldTimestamps::new();
            for (name, value) in fields.iter() {
                timestamps.set(name, value_to_field(value)?);
            }
            RmdTimestamp::PerField(timestamps)
        }
        other => return Err(mismatch("long or record", &other)),
    };
    let replication_checkpoint_vector =
        to_longs(take(&mut record, REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME)?)?;
    Ok(RmdRecord {
        timestamp,
        replication_checkpoint_vector,
    })
}

fn value_to_field(value: &Value) -> Result<FieldTimestamp, BinaryError> {
    match value {
        Value::Long(ts) => Ok(FieldTimestamp::Scalar(*ts)),
        Value::Record(fields) => {
            let mut fields = fields.clone();
            let deleted_elements = match take(&mut fields, DELETED_ELEM_FIELD_NAME)? {
                Value::Array(items) => items,
                other => return Err(mismatch("array", &other)),
            };
            Ok(FieldTimestamp::Collection(CollectionRmdTimestamp {
                top_level_timestamp: to_long(take(&mut fields, TOP_LEVEL_TS_FIELD_NAME)?)?,
                top_level_colo_id: to_int(take(&mut fields, TOP_LEVEL_COLO_ID_FIELD_NAME)?)?,
                put_only_part_length: to_int(take(&mut fields, PUT_ONLY_PART_LENGTH_FIELD_NAME)?)?,
                active_elements_timestamps: to_longs(take(&mut fields, ACTIVE_ELEM_TS_FIELD_NAME)?)?,
                deleted_elements,
                deleted_elements_timestamps: to_longs(take(
                    &mut fields,
                    DELETED_ELEM_TS_FIELD_NAME,
                )?)?,
            }))
        }
        other => Err(mismatch("long or record", other)),
    }
}

fn take(record: &mut Record, name: &str) -> Result<Value, BinaryError> {
    record
        .remove(name)
        .ok_or_else(|| BinaryError::MissingField(name.to_string()))
}

fn to_long(value: Value) -> Result<i64, BinaryError> {
    match value {
        Value::Long(v) => Ok(v),
        other => Err(mismatch("long", &other)),
    }
}

fn to_int(value: Value) -> Result<i32, BinaryError> {
    match value {
        Value::Int(v) => Ok(v),
        other => Err(mismatch("int", &other)),
    }
}

fn to_longs(value: Value) -> Result<Vec<i64>, BinaryError> {
    match value {
        Value::Array(items) => items.into_iter().map(to_long).collect(),
        other => Err(mismatch("array", &other)),
    }
}

fn mismatch(expected: &'static str, found: &Value) -> BinaryError {
    BinaryError::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_field_rmd_maps_to_schema_shape() {
        let rmd = RmdRecord::per_field(
            FieldTimestamps::new().with("Age", 4_i64).with(
                "Items",
                CollectionRmdTimestamp {
                    active_elements_timestamps: vec![5],
                    deleted_elements: vec![Value::from("x")],
                    deleted_elements_timestamps: vec![6],
                    ..CollectionRmdTimestamp::put(3, 1, 1)
                },
            ),
        )
        .with_checkpoint_vector(vec![9]);

        let value = rmd_to_value(&rmd);
        let Value::Record(record) = &value else {
            panic!("expected record");
        };
        assert_eq!(
            record.get(REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME),
            Some(&Value::Array(vec![Value::Long(9)]))
        );
        assert_eq!(value_to_rmd(value).unwrap(), rmd);
    }

    #[test]
    fn missing_collection_field_is_reported() {
        let value = Value::Record(
            Record::new()
                .with(
                    TIMESTAMP_FIELD_NAME,
                    Record::new().with("Items", Record::new().with(TOP_LEVEL_TS_FIELD_NAME, 1_i64)),
                )
                .with(REPLICATION_CHECKPOINT_VECTOR_FIELD_NAME, Value::Array(vec![])),
        );
        assert_eq!(
            value_to_rmd(value),
            Err(BinaryError::MissingField(DELETED_ELEM_FIELD_NAME.to_string()))
        );
    }
}
