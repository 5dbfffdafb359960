//! FHIR wire/boundary support for the IDMP registry.
//!
//! This crate provides **domain-level datatypes** and **wire/translation helpers** for the FHIR
//! 6.0.0 JSON documents the registry exchanges:
//! - embedded datatypes (`Coding`, `CodeableConcept`, `Quantity`, references)
//! - primitive formats (dates, datetimes, instants and precision-preserving decimals)
//! - boundary documents (`Bundle` search sets, `OperationOutcome`, `CapabilityStatement`)
//! - the `Medication` → `MedicinalProductDefinition` transform used by `$idmp-transform`
//!
//! Resource-level mapping is schema driven and lives in `idmp-core`; this crate only knows the
//! fixed shapes every resource shares.

pub mod bundle;
pub mod capability;
pub mod datatypes;
pub mod outcome;
pub mod primitives;
pub mod transform;

// Re-export facades
pub use bundle::Bundle;
pub use capability::CapabilityStatement;
pub use outcome::OperationOutcome;
pub use transform::{MedicationTransform, ATC_SYSTEM};

// Re-export public domain-level types
pub use bundle::{BundleEntry, SearchSet};
pub use capability::{CapabilityResource, CapabilitySearchParam};
pub use datatypes::{
    CodeableConcept, Coding, Quantity, QuantityComparator, ResourceRef, UCUM_SYSTEM,
};
pub use outcome::{Issue, IssueSeverity, IssueType};

pub use rust_decimal::Decimal;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("invalid resource id: {0}")]
    InvalidUuid(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// Deserialise a wire struct from a JSON value, reporting the failing path on mismatch.
pub(crate) fn from_wire_value<'de, T>(value: &'de serde_json::Value, what: &str) -> FhirResult<T>
where
    T: serde::Deserialize<'de>,
{
    serde_path_to_error::deserialize::<_, T>(value).map_err(|err| {
        let path = err.path().to_string();
        let source = err.into_inner();
        let path = if path.is_empty() || path == "." {
            "<root>"
        } else {
            path.as_str()
        };
        FhirError::Translation(format!("{what} schema mismatch at {path}: {source}"))
    })
}
