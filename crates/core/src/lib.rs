//! # IDMP Core
//!
//! Core logic for the IDMP resource registry.
//!
//! This crate contains the schema-driven data model and everything that operates on it:
//! - Field catalog and schema registry with idempotent upserts
//! - Typed field values, validation and the resource store (memory or sharded JSON files)
//! - Bidirectional mapping between stored instances and FHIR 6.0.0 JSON documents
//! - The IDMP type definitions and the install/migrate/validate pipeline
//!
//! **No API concerns**: HTTP servers and command-line parsing belong in `api-rest` and `cli`.
//!
//! ## Data Layout
//!
//! ```text
//! <IDMP_DATA_DIR>/
//!   schemas/<Type>.yaml
//!   sequence.json
//!   checkpoints/<name>.json
//!   resources/<s1>/<s2>/<32hex-uuid>/resource.json
//!   artifacts/capability.json
//! ```

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod definitions;
pub mod error;
pub mod mapper;
pub mod migration;
pub mod path;
pub mod schema;
pub mod store;
pub mod validate;
pub mod value;

pub use config::CoreConfig;
pub use error::{IdmpError, IdmpResult};
pub use mapper::FhirMapper;
pub use schema::{ResourceType, SchemaChange, SchemaDocument, SchemaRegistry, SchemaUpsert};
pub use store::{NewResource, Query, QueryPage, ResourceInstance, ResourceStore};
pub use value::{FieldMap, FieldValue};
