//! Resource identifiers and sharded-path utilities.
//!
//! Every stored IDMP resource is identified by a UUID in a *canonical* representation:
//! **32 lowercase hexadecimal characters** (no hyphens). The same string appears in FHIR
//! documents (`"id"`), in references (`"Substance/<id>"`) and in on-disk paths.
//!
//! ## Canonical form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! Externally supplied identifiers (REST paths, CLI arguments, reference strings) must already be
//! canonical. Use [`ResourceId::parse`] to validate them.
//!
//! ## Sharded directory layout
//! For a canonical id `u`, file-backed stores keep the resource under:
//! `parent_dir/<u[0..2]>/<u[2..4]>/<u>/`
//!
//! This keeps directory fan-out bounded when a registry holds many thousands of resources.

mod service;

pub use service::{ResourceId, Uuid};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
