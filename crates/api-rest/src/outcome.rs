//! Mapping of core errors onto HTTP statuses and `OperationOutcome` bodies.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use fhir::{FhirError, Issue, IssueType, OperationOutcome};
use idmp_core::IdmpError;
use serde_json::Value;

/// Content type of every FHIR body the API returns.
pub const FHIR_JSON: &str = "application/fhir+json";

/// A FHIR JSON document with its status.
pub struct FhirJson(pub StatusCode, pub Value);

impl IntoResponse for FhirJson {
    fn into_response(self) -> Response {
        let mut response = (self.0, axum::Json(self.1)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON));
        response
    }
}

/// Handler error rendered as an `OperationOutcome`.
#[derive(Debug)]
pub struct ApiError(pub IdmpError);

impl From<IdmpError> for ApiError {
    fn from(err: IdmpError) -> Self {
        Self(err)
    }
}

impl From<FhirError> for ApiError {
    fn from(err: FhirError) -> Self {
        Self(IdmpError::Fhir(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }
        let issues: Vec<Issue> = self.0.into_problems().iter().map(issue_for).collect();
        FhirJson(status, OperationOutcome::render(&issues)).into_response()
    }
}

fn status_for(err: &IdmpError) -> StatusCode {
    match err {
        IdmpError::NotFound(_) | IdmpError::UnsupportedResourceType(_) => StatusCode::NOT_FOUND,
        IdmpError::DuplicateKey(_) | IdmpError::AmbiguousChoice { .. } => StatusCode::CONFLICT,
        IdmpError::Document(problems) => {
            // A document failing only on duplicates is a conflict, anything else is a bad request.
            if problems.iter().all(|p| matches!(p, IdmpError::DuplicateKey(_))) {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_REQUEST
            }
        }
        IdmpError::InvalidFieldSpec { .. }
        | IdmpError::DuplicateFieldName { .. }
        | IdmpError::UnknownReferencedType { .. }
        | IdmpError::TypeMismatch { .. }
        | IdmpError::MissingRequiredField { .. }
        | IdmpError::TreeDepthExceeded { .. }
        | IdmpError::InvalidInput(_)
        | IdmpError::Fhir(_)
        | IdmpError::Text(_)
        | IdmpError::Uuid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn issue_for(err: &IdmpError) -> Issue {
    let code = match err {
        IdmpError::NotFound(_) => IssueType::NotFound,
        IdmpError::UnsupportedResourceType(_) => IssueType::NotSupported,
        IdmpError::DuplicateKey(_) => IssueType::Duplicate,
        IdmpError::AmbiguousChoice { .. } => IssueType::MultipleMatches,
        IdmpError::MissingRequiredField { .. } => IssueType::Required,
        IdmpError::TypeMismatch { .. } | IdmpError::TreeDepthExceeded { .. } => IssueType::Value,
        IdmpError::Fhir(FhirError::Unsupported(_)) => IssueType::NotSupported,
        IdmpError::InvalidFieldSpec { .. }
        | IdmpError::DuplicateFieldName { .. }
        | IdmpError::UnknownReferencedType { .. }
        | IdmpError::InvalidInput(_)
        | IdmpError::Fhir(_)
        | IdmpError::Text(_)
        | IdmpError::Uuid(_) => IssueType::Invalid,
        IdmpError::MigrationStepFailed { .. } => IssueType::Processing,
        _ => IssueType::Exception,
    };
    let issue = Issue::error(code, err.to_string());
    match err {
        IdmpError::TypeMismatch { field, .. }
        | IdmpError::AmbiguousChoice { field, .. }
        | IdmpError::MissingRequiredField { field }
        | IdmpError::TreeDepthExceeded { field, .. } => issue.with_expression(field.clone()),
        _ => issue,
    }
}
