//! RMD serialization with the value schema id prepended.
//!
//! # Wire Format
//!
//! ```text
//! [0..4)  value schema id, big-endian i32
//! [4..)   RMD payload encoded under the store's RMD schema
//! ```
//!
//! There is no magic number, length, or checksum; the RMD schema defines
//! where the payload ends.

use crate::binary::{decode_value, to_bytes, BinaryError};
use crate::convert::{rmd_to_value, value_to_rmd};
use rmd_core::{RmdRecord, RmdTimestamp, RmdWithValueSchemaId, Schema};
use rmd_schema::generator::per_field_timestamp_schema;
use rmd_schema::{
    retrying_get, BiIntKeyCache, FallibleCache, SchemaError, StoreSchemaCache,
    MAX_RESOLVE_ATTEMPTS,
};
use std::fmt;
use std::sync::Arc;

/// Length of the value schema id header.
pub const SCHEMA_ID_HEADER_LEN: usize = 4;

/// Cache of deserializers keyed by `(value_schema_id, rmd_version_id)`.
pub type DeserializerCache =
    dyn FallibleCache<(i32, i32), Arc<RmdDeserializer>, Error = SchemaError>;

/// Decodes RMD payloads written under one RMD schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RmdDeserializer {
    value_schema_id: i32,
    rmd_version_id: i32,
    schema: Arc<Schema>,
}

impl RmdDeserializer {
    /// Create a deserializer for `schema`.
    #[must_use]
    pub fn new(value_schema_id: i32, rmd_version_id: i32, schema: Arc<Schema>) -> Self {
        Self {
            value_schema_id,
            rmd_version_id,
            schema,
        }
    }

    /// RMD schema payloads are decoded under.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Decode one payload, which must span all of `payload`.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is truncated or does not match the schema.
    pub fn deserialize(&self, payload: &[u8]) -> Result<RmdRecord, BinaryError> {
        let rmd = value_to_rmd(decode_value(payload, &self.schema)?)?;
        tracing::debug!(
            value_schema_id = self.value_schema_id,
            rmd_version_id = self.rmd_version_id,
            bytes = payload.len(),
            "Decoded RMD"
        );
        Ok(rmd)
    }
}

/// Serializes and deserializes RMD for one store and RMD version.
pub struct RmdSerDe {
    schema_cache: Arc<StoreSchemaCache>,
    rmd_version_id: i32,
    deserializer_cache: Arc<DeserializerCache>,
}

impl RmdSerDe {
    /// Create a codec resolving schemas through `schema_cache`.
    #[must_use]
    pub fn new(schema_cache: Arc<StoreSchemaCache>, rmd_version_id: i32) -> Self {
        let resolver = Arc::clone(&schema_cache);
        let deserializer_cache: Arc<DeserializerCache> = Arc::new(BiIntKeyCache::new(
            move |value_schema_id, rmd_version_id| {
                resolver
                    .resolve_rmd_schema(value_schema_id, rmd_version_id)
                    .map(|entry| {
                        RmdDeserializer::new(
                            value_schema_id,
                            rmd_version_id,
                            Arc::clone(entry.schema()),
                        )
                    })
            },
        ));
        Self {
            schema_cache,
            rmd_version_id,
            deserializer_cache,
        }
    }

    /// RMD version this codec uses.
    #[must_use]
    pub fn rmd_version_id(&self) -> i32 {
        self.rmd_version_id
    }

    /// Replace the deserializer cache; the retry policy is unchanged.
    pub fn set_deserializer_cache(&mut self, cache: Arc<DeserializerCache>) {
        self.deserializer_cache = cache;
    }

    /// RMD schema for `value_schema_id` under the configured RMD version.
    ///
    /// # Errors
    ///
    /// Returns error if no such schema is registered.
    pub fn rmd_schema(&self, value_schema_id: i32) -> Result<Arc<Schema>, RmdSerdeError> {
        let entry = self
            .schema_cache
            .resolve_rmd_schema(value_schema_id, self.rmd_version_id)?;
        Ok(Arc::clone(entry.schema()))
    }

    /// Encode `rmd` under the RMD schema of `value_schema_id`, without the
    /// schema id header.
    ///
    /// Per-field RMD must cover every field of the value schema; decoding
    /// could not tell a left-out field from one at its default.
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be resolved or `rmd` does not fit it.
    pub fn serialize_rmd_record(
        &self,
        value_schema_id: i32,
        rmd: &RmdRecord,
    ) -> Result<Vec<u8>, RmdSerdeError> {
        let schema = self.rmd_schema(value_schema_id)?;
        let bytes = to_bytes(&rmd_to_value(rmd), &schema)?;
        if let (RmdTimestamp::PerField(fields), Some(expected)) =
            (&rmd.timestamp, per_field_timestamp_schema(&schema))
        {
            if let Some(missing) = expected.fields.iter().find(|f| fields.get(&f.name).is_none()) {
                return Err(BinaryError::MissingField(missing.name.clone()).into());
            }
        }
        tracing::debug!(value_schema_id, bytes = bytes.len(), "Encoded RMD");
        Ok(bytes)
    }

    /// Encode `rmd` into the full wire format.
    ///
    /// # Errors
    ///
    /// See [`RmdSerDe::serialize_rmd_record`].
    pub fn serialize_value_schema_id_prepended(
        &self,
        value_schema_id: i32,
        rmd: &RmdRecord,
    ) -> Result<Vec<u8>, RmdSerdeError> {
        let payload = self.serialize_rmd_record(value_schema_id, rmd)?;
        Ok(prepend_value_schema_id(value_schema_id, &payload))
    }

    /// Decode a wire-format blob into `out`.
    ///
    /// `out` is left untouched on failure.
    ///
    /// # Errors
    ///
    /// Returns [`RmdSerdeError::DeserializerUnavailable`] if no deserializer
    /// could be obtained within [`MAX_RESOLVE_ATTEMPTS`] attempts, and
    /// [`RmdSerdeError::Malformed`] if the bytes do not decode.
    pub fn deserialize_value_schema_id_prepended_rmd_bytes(
        &self,
        bytes: &[u8],
        out: &mut RmdWithValueSchemaId,
    ) -> Result<(), RmdSerdeError> {
        let (value_schema_id, payload) = split_value_schema_id(bytes)?;
        let deserializer = self.deserializer(value_schema_id)?;
        let rmd = deserializer.deserialize(payload)?;
        out.set(value_schema_id, rmd);
        Ok(())
    }

    fn deserializer(&self, value_schema_id: i32) -> Result<Arc<RmdDeserializer>, RmdSerdeError> {
        retrying_get(
            self.deserializer_cache.as_ref(),
            &(value_schema_id, self.rmd_version_id),
            MAX_RESOLVE_ATTEMPTS,
        )
        .map_err(|e| RmdSerdeError::DeserializerUnavailable {
            value_schema_id,
            rmd_version_id: self.rmd_version_id,
            attempts: e.attempts,
            cause: e.last,
        })
    }
}

impl fmt::Debug for RmdSerDe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmdSerDe")
            .field("store", &self.schema_cache.store_name())
            .field("rmd_version_id", &self.rmd_version_id)
            .finish_non_exhaustive()
    }
}

/// Prefix `payload` with the big-endian value schema id.
#[must_use]
pub fn prepend_value_schema_id(value_schema_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SCHEMA_ID_HEADER_LEN + payload.len());
    bytes.extend_from_slice(&value_schema_id.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Split a wire-format blob into its value schema id and payload.
///
/// # Errors
///
/// Returns error if `bytes` is shorter than the header.
pub fn split_value_schema_id(bytes: &[u8]) -> Result<(i32, &[u8]), BinaryError> {
    if bytes.len() < SCHEMA_ID_HEADER_LEN {
        return Err(BinaryError::UnexpectedEof {
            needed: SCHEMA_ID_HEADER_LEN,
            remaining: bytes.len(),
        });
    }
    let (header, payload) = bytes.split_at(SCHEMA_ID_HEADER_LEN);
    let mut id = [0u8; SCHEMA_ID_HEADER_LEN];
    id.copy_from_slice(header);
    Ok((i32::from_be_bytes(id), payload))
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum RmdSerdeError {
    /// No deserializer after every retry
    #[error("no RMD deserializer for value schema {value_schema_id}, RMD version {rmd_version_id} after {attempts} attempts: {cause}")]
    DeserializerUnavailable {
        /// Value schema id from the header
        value_schema_id: i32,
        /// Configured RMD version
        rmd_version_id: i32,
        /// Attempts made
        attempts: u32,
        /// Failure of the last attempt
        #[source]
        cause: SchemaError,
    },
    /// Bytes do not decode, or an RMD does not fit its schema
    #[error("malformed RMD payload: {0}")]
    Malformed(#[from] BinaryError),
    /// Schema resolution failed
    #[error(transparent)]
    Schema(#[from] SchemaError),
}
