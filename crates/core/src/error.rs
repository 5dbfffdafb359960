#[allow(clippy::single_component_path_imports)]
use serde_yaml;

#[derive(Debug, thiserror::Error)]
pub enum IdmpError {
    #[error("invalid field spec '{field}': {reason}")]
    InvalidFieldSpec { field: String, reason: String },
    #[error("duplicate field name '{field}' in {resource_type}")]
    DuplicateFieldName { resource_type: String, field: String },
    #[error("field '{field}' of {resource_type} references unknown type '{target}'")]
    UnknownReferencedType {
        resource_type: String,
        field: String,
        target: String,
    },
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("type mismatch for '{field}': {reason}")]
    TypeMismatch { field: String, reason: String },
    #[error("ambiguous value for '{field}': {reason}")]
    AmbiguousChoice { field: String, reason: String },
    #[error("missing required field '{field}'")]
    MissingRequiredField { field: String },
    #[error("unsupported resource type: {0}")]
    UnsupportedResourceType(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("migration step '{step}' failed: {reason}")]
    MigrationStepFailed { step: String, reason: String },

    #[error("tree '{field}' is {depth} levels deep, maximum is {max_depth}")]
    TreeDepthExceeded {
        field: String,
        depth: usize,
        max_depth: usize,
    },
    #[error("{} problem(s) in document: {}", .0.len(), join_messages(.0))]
    Document(Vec<IdmpError>),
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("FHIR error: {0}")]
    Fhir(#[from] fhir::FhirError),
    #[error("invalid text: {0}")]
    Text(#[from] idmp_types::TextError),
    #[error("invalid identifier: {0}")]
    Uuid(#[from] idmp_uuid::UuidError),

    #[error("failed to read storage: {0}")]
    StorageRead(std::io::Error),
    #[error("failed to write storage: {0}")]
    StorageWrite(std::io::Error),
    #[error("failed to serialize resource: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize resource: {0}")]
    Deserialization(serde_json::Error),
    #[error("failed to serialize YAML: {0}")]
    YamlSerialization(serde_yaml::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(String),
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl IdmpError {
    /// Flatten a collected [`IdmpError::Document`] into its individual problems.
    ///
    /// Any other error is returned as a single-element list.
    pub fn into_problems(self) -> Vec<IdmpError> {
        match self {
            IdmpError::Document(errors) => errors
                .into_iter()
                .flat_map(IdmpError::into_problems)
                .collect(),
            other => vec![other],
        }
    }

    /// Wrap collected problems: none is `Ok`, one is returned as is.
    pub(crate) fn collect(mut errors: Vec<IdmpError>) -> IdmpResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(IdmpError::Document(errors)),
        }
    }
}

fn join_messages(errors: &[IdmpError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type IdmpResult<T> = std::result::Result<T, IdmpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_display_lists_every_problem() {
        let err = IdmpError::Document(vec![
            IdmpError::MissingRequiredField {
                field: "name".into(),
            },
            IdmpError::MissingRequiredField {
                field: "identifier".into(),
            },
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 problem(s)"));
        assert!(message.contains("'name'"));
        assert!(message.contains("'identifier'"));
    }

    #[test]
    fn into_problems_flattens_nested_documents() {
        let err = IdmpError::Document(vec![
            IdmpError::NotFound("a".into()),
            IdmpError::Document(vec![IdmpError::NotFound("b".into())]),
        ]);
        assert_eq!(err.into_problems().len(), 2);
        assert_eq!(IdmpError::NotFound("x".into()).into_problems().len(), 1);
    }

    #[test]
    fn collect_keeps_single_error_unwrapped() {
        assert!(IdmpError::collect(Vec::new()).is_ok());
        let single = IdmpError::collect(vec![IdmpError::NotFound("x".into())]);
        assert!(matches!(single, Err(IdmpError::NotFound(_))));
        let many = IdmpError::collect(vec![
            IdmpError::NotFound("x".into()),
            IdmpError::NotFound("y".into()),
        ]);
        assert!(matches!(many, Err(IdmpError::Document(v)) if v.len() == 2));
    }
}
