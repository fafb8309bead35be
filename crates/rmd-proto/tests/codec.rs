use rmd_core::{
    CollectionRmdTimestamp, FieldTimestamps, RmdRecord, RmdWithValueSchemaId, Schema, Value,
};
use rmd_proto::{prepend_value_schema_id, BinaryError, RmdDeserializer, RmdSerDe, RmdSerdeError};
use rmd_schema::{
    FallibleCache, InMemorySchemaRepository, SchemaError, StoreSchemaCache, MAX_RESOLVE_ATTEMPTS,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const STORE: &str = "test_store_name";
const VALUE_SCHEMA_ID: i32 = 1214;
const RMD_VERSION_ID: i32 = 1;

const PERSON: &str = r#"{
    "type": "record", "namespace": "com.example.avro", "name": "Person",
    "fields": [
        {"name": "Name", "type": "string", "default": "unknown"},
        {"name": "Age", "type": "int", "default": -1},
        {"name": "Items", "type": {"type": "array", "items": "string"}, "default": []},
        {"name": "PetNameToAge", "type": ["null", {"type": "map", "values": "int"}], "default": null}
    ]
}"#;

fn strings(values: &[&str]) -> Vec<Value> {
    values.iter().map(|s| Value::from(*s)).collect()
}

fn make_collection(
    top_level_timestamp: i64,
    top_level_colo_id: i32,
    put_only_part_length: i32,
    active_elements_timestamps: Vec<i64>,
    deleted_elements: &[&str],
    deleted_elements_timestamps: Vec<i64>,
) -> CollectionRmdTimestamp {
    CollectionRmdTimestamp {
        top_level_timestamp,
        top_level_colo_id,
        put_only_part_length,
        active_elements_timestamps,
        deleted_elements: strings(deleted_elements),
        deleted_elements_timestamps,
    }
}

fn person_rmd() -> RmdRecord {
    RmdRecord::per_field(
        FieldTimestamps::new()
            .with("Name", 1_i64)
            .with("Age", 1_i64)
            .with(
                "Items",
                make_collection(23, 1, 3, vec![1, 2, 3], &["foo", "bar"], vec![1, 100]),
            )
            .with(
                "PetNameToAge",
                make_collection(24, 2, 5, vec![1, 2, 3, 4, 5], &["foo", "bar", "qaz"], vec![1, 2, 3]),
            ),
    )
    .with_checkpoint_vector(vec![1, 2, 3])
}

fn setup() -> (RmdSerDe, Arc<StoreSchemaCache>) {
    let repository = Arc::new(InMemorySchemaRepository::new());
    repository
        .add_value_schema(STORE, VALUE_SCHEMA_ID, Schema::parse_str(PERSON).unwrap())
        .unwrap();
    let schema_cache = Arc::new(StoreSchemaCache::new(STORE, repository));
    (
        RmdSerDe::new(Arc::clone(&schema_cache), RMD_VERSION_ID),
        schema_cache,
    )
}

/// Fails a fixed number of times before handing out a real deserializer.
struct FlakyDeserializerCache {
    failures: u32,
    calls: AtomicU32,
    deserializer: Arc<RmdDeserializer>,
}

impl FlakyDeserializerCache {
    fn new(failures: u32, serde: &RmdSerDe) -> Self {
        let schema = serde.rmd_schema(VALUE_SCHEMA_ID).unwrap();
        Self {
            failures,
            calls: AtomicU32::new(0),
            deserializer: Arc::new(RmdDeserializer::new(VALUE_SCHEMA_ID, RMD_VERSION_ID, schema)),
        }
    }
}

impl FallibleCache<(i32, i32), Arc<RmdDeserializer>> for FlakyDeserializerCache {
    type Error = SchemaError;

    fn get(&self, key: &(i32, i32)) -> Result<Arc<RmdDeserializer>, SchemaError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(SchemaError::NotFound {
                store: STORE.to_string(),
                value_schema_id: key.0,
                rmd_version_id: key.1,
            })
        } else {
            Ok(Arc::clone(&self.deserializer))
        }
    }
}

#[test]
fn rmd_round_trips_with_schema_id() {
    let (serde, schema_cache) = setup();
    let rmd = person_rmd();

    let schema = serde.rmd_schema(VALUE_SCHEMA_ID).unwrap();
    let entry = schema_cache
        .resolve_rmd_schema(VALUE_SCHEMA_ID, RMD_VERSION_ID)
        .unwrap();
    assert_eq!(&schema, entry.schema());

    let payload = serde.serialize_rmd_record(VALUE_SCHEMA_ID, &rmd).unwrap();
    let bytes = prepend_value_schema_id(VALUE_SCHEMA_ID, &payload);
    assert_eq!(
        bytes,
        serde
            .serialize_value_schema_id_prepended(VALUE_SCHEMA_ID, &rmd)
            .unwrap()
    );

    let mut decoded = RmdWithValueSchemaId::new();
    serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut decoded)
        .unwrap();
    assert_eq!(decoded.value_schema_id(), VALUE_SCHEMA_ID);
    assert_eq!(decoded.rmd_record(), Some(&rmd));
}

#[test]
fn record_level_rmd_round_trips() {
    let (serde, _) = setup();
    let rmd = RmdRecord::record_level(42);
    let bytes = serde
        .serialize_value_schema_id_prepended(VALUE_SCHEMA_ID, &rmd)
        .unwrap();
    let mut decoded = RmdWithValueSchemaId::new();
    serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut decoded)
        .unwrap();
    assert_eq!(decoded.into_rmd_record(), Some(rmd));
}

#[test]
fn retry_recovers_from_transient_misses() {
    let (mut serde, _) = setup();
    let bytes = serde
        .serialize_value_schema_id_prepended(VALUE_SCHEMA_ID, &person_rmd())
        .unwrap();

    let cache = Arc::new(FlakyDeserializerCache::new(2, &serde));
    serde.set_deserializer_cache(cache.clone());

    let mut decoded = RmdWithValueSchemaId::new();
    serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut decoded)
        .unwrap();
    assert_eq!(decoded.value_schema_id(), VALUE_SCHEMA_ID);
    assert_eq!(decoded.rmd_record(), Some(&person_rmd()));
    assert_eq!(cache.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn retry_gives_up_after_five_attempts() {
    let (mut serde, _) = setup();
    let bytes = serde
        .serialize_value_schema_id_prepended(VALUE_SCHEMA_ID, &person_rmd())
        .unwrap();

    let cache = Arc::new(FlakyDeserializerCache::new(u32::MAX, &serde));
    serde.set_deserializer_cache(cache.clone());

    let mut decoded = RmdWithValueSchemaId::new();
    let err = serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut decoded)
        .unwrap_err();
    assert!(matches!(
        err,
        RmdSerdeError::DeserializerUnavailable {
            value_schema_id: VALUE_SCHEMA_ID,
            attempts: MAX_RESOLVE_ATTEMPTS,
            ..
        }
    ));
    assert_eq!(cache.calls.load(Ordering::SeqCst), MAX_RESOLVE_ATTEMPTS);
    assert!(decoded.rmd_record().is_none());
}

#[test]
fn unknown_schema_id_exhausts_retries() {
    let (serde, _) = setup();
    let payload = serde.serialize_rmd_record(VALUE_SCHEMA_ID, &person_rmd()).unwrap();
    let bytes = prepend_value_schema_id(9999, &payload);

    let mut decoded = RmdWithValueSchemaId::new();
    let err = serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut decoded)
        .unwrap_err();
    assert!(matches!(
        err,
        RmdSerdeError::DeserializerUnavailable {
            cause: SchemaError::NotFound { value_schema_id: 9999, .. },
            ..
        }
    ));
}

#[test]
fn truncated_payload_is_malformed() {
    let (serde, _) = setup();
    let bytes = serde
        .serialize_value_schema_id_prepended(VALUE_SCHEMA_ID, &person_rmd())
        .unwrap();

    let mut decoded = RmdWithValueSchemaId::new();
    let err = serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes[..bytes.len() - 3], &mut decoded)
        .unwrap_err();
    assert!(matches!(
        err,
        RmdSerdeError::Malformed(BinaryError::UnexpectedEof { .. })
    ));

    let err = serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes[..2], &mut decoded)
        .unwrap_err();
    assert!(matches!(err, RmdSerdeError::Malformed(_)));
    assert!(decoded.rmd_record().is_none());
}

#[test]
fn rmd_for_unknown_field_is_rejected() {
    let (serde, _) = setup();
    let rmd = RmdRecord::per_field(FieldTimestamps::new().with("Height", 3_i64));
    let err = serde.serialize_rmd_record(VALUE_SCHEMA_ID, &rmd).unwrap_err();
    assert!(matches!(
        err,
        RmdSerdeError::Malformed(BinaryError::TypeMismatch { expected: "union", .. })
    ));
}

#[test]
fn field_order_survives_round_trip() {
    let (serde, _) = setup();
    let rmd = RmdRecord::per_field(
        FieldTimestamps::new()
            .with("PetNameToAge", CollectionRmdTimestamp::put(4, 2, 0))
            .with("Age", 3_i64)
            .with("Items", make_collection(23, 1, 1, vec![5], &["foo"], vec![1]))
            .with("Name", 2_i64),
    );
    let bytes = serde
        .serialize_value_schema_id_prepended(VALUE_SCHEMA_ID, &rmd)
        .unwrap();

    let mut decoded = RmdWithValueSchemaId::new();
    serde
        .deserialize_value_schema_id_prepended_rmd_bytes(&bytes, &mut decoded)
        .unwrap();
    assert_eq!(decoded.rmd_record(), Some(&rmd));
}

#[test]
fn partial_per_field_rmd_is_rejected() {
    let (serde, _) = setup();
    let rmd = RmdRecord::per_field(FieldTimestamps::new().with("Age", 3_i64));
    let err = serde.serialize_rmd_record(VALUE_SCHEMA_ID, &rmd).unwrap_err();
    assert!(matches!(
        err,
        RmdSerdeError::Malformed(BinaryError::MissingField(ref name)) if name == "Name"
    ));
}
