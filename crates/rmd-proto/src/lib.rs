//! # RMD Proto
//!
//! Wire format for replication metadata.
//!
//! This crate provides:
//! - A schema-driven binary encoding of generic values
//! - Conversion between typed RMD and values shaped by the RMD schema
//! - `RmdSerDe`, which encodes RMD and decodes schema-id-prefixed blobs
//!   through a retrying deserializer cache

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binary;
pub mod convert;
pub mod serde;

pub use binary::{decode_value, encode_value, to_bytes, BinaryError, Decoder};
pub use convert::{rmd_to_value, value_to_rmd};
pub use serde::{
    prepend_value_schema_id, split_value_schema_id, DeserializerCache, RmdDeserializer, RmdSerDe,
    RmdSerdeError, SCHEMA_ID_HEADER_LEN,
};
