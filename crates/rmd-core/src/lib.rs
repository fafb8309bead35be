//! # RMD Core
//!
//! Replication metadata model and conflict resolution for active-active
//! replicated records.
//!
//! This crate provides:
//! - A dynamic value and record schema model
//! - Record-level and per-field timestamps, with per-element timestamps and
//!   tombstones for list and map fields
//! - A deterministic merge engine that every region runs identically
//! - Partial updates built from field sets and collection operations

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod config;
pub mod merge;
pub mod schema;
pub mod timestamp;
pub mod update;
pub mod value;
pub mod value_and_rmd;

pub use collection::{merge_collections, CollectionError, CollectionSide, MergedCollection};
pub use config::{ConfigError, MergeConfig, TombstonePolicy};
pub use merge::{
    merge_checkpoint_vectors, MergeConflictResolver, MergeError, MergeInput, TieBreakPolicy,
    ValueOrderTieBreak, WriteCandidate,
};
pub use schema::{Field, RecordSchema, Schema, SchemaError};
pub use timestamp::{
    CollectionRmdTimestamp, FieldTimestamp, FieldTimestamps, RmdRecord, RmdTimestamp,
    RmdWithValueSchemaId, TimestampError, NO_COLO_ID,
};
pub use update::{UpdateBuilder, UpdateError};
pub use value::{Record, Value};
pub use value_and_rmd::ValueAndReplicationMetadata;
