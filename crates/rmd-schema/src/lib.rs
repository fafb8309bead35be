//! # RMD Schema
//!
//! RMD schema generation and the resolution path used by the codec.
//!
//! This crate provides:
//! - RMD schema generation from record value schemas
//! - The schema repository contract, with an in-memory implementation
//! - A caching per-store resolver
//! - A lazily populated `(i32, i32)`-keyed cache and a bounded retry helper

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod generator;
pub mod repository;
pub mod resolver;
pub mod retry;

pub use cache::BiIntKeyCache;
pub use generator::{generate_rmd_schema, GeneratorError, LATEST_RMD_VERSION_ID};
pub use repository::{InMemorySchemaRepository, RepositoryError, RmdSchemaEntry, SchemaRepository};
pub use resolver::{SchemaError, StoreSchemaCache};
pub use retry::{retrying_get, FallibleCache, RetryError, MAX_RESOLVE_ATTEMPTS};
