//! FHIR `OperationOutcome` documents.
//!
//! API callers receive failures as an outcome with one issue per problem, each carrying a stable
//! `code` from the FHIR issue-type value set and human readable `diagnostics`.

use crate::{from_wire_value, FhirResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Public domain-level types
// ============================================================================

/// Issue severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

/// The subset of the FHIR issue-type value set the registry reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Structure,
    Required,
    Value,
    NotFound,
    NotSupported,
    Duplicate,
    MultipleMatches,
    Conflict,
    Processing,
    Exception,
    Informational,
}

/// One problem reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub code: IssueType,
    pub diagnostics: String,
    /// Element paths the issue relates to.
    pub expression: Vec<String>,
}

impl Issue {
    pub fn error(code: IssueType, diagnostics: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code,
            diagnostics: diagnostics.into(),
            expression: Vec::new(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression.push(expression.into());
        self
    }
}

// ============================================================================
// Public OperationOutcome operations
// ============================================================================

/// OperationOutcome operations.
///
/// This is a zero-sized type used for namespacing outcome-related operations.
pub struct OperationOutcome;

impl OperationOutcome {
    /// Render issues as an `OperationOutcome` document.
    pub fn render(issues: &[Issue]) -> Value {
        let wire = OperationOutcomeWire {
            resource_type: "OperationOutcome".into(),
            issue: issues
                .iter()
                .map(|i| IssueWire {
                    severity: i.severity,
                    code: i.code,
                    diagnostics: Some(i.diagnostics.clone()),
                    expression: i.expression.clone(),
                })
                .collect(),
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    /// Parse an `OperationOutcome` document back into issues.
    pub fn parse(value: &Value) -> FhirResult<Vec<Issue>> {
        let wire: OperationOutcomeWire = from_wire_value(value, "OperationOutcome")?;
        if wire.resource_type != "OperationOutcome" {
            return Err(crate::FhirError::InvalidInput(format!(
                "Expected resourceType 'OperationOutcome', got '{}'",
                wire.resource_type
            )));
        }
        Ok(wire
            .issue
            .into_iter()
            .map(|i| Issue {
                severity: i.severity,
                code: i.code,
                diagnostics: i.diagnostics.unwrap_or_default(),
                expression: i.expression,
            })
            .collect())
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct OperationOutcomeWire {
    #[serde(rename = "resourceType")]
    resource_type: String,
    issue: Vec<IssueWire>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct IssueWire {
    severity: IssueSeverity,
    code: IssueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diagnostics: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    expression: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_not_found_issue() {
        let outcome = OperationOutcome::render(&[Issue::error(
            IssueType::NotFound,
            "Substance/abc not found",
        )]);

        assert_eq!(
            outcome,
            json!({
                "resourceType": "OperationOutcome",
                "issue": [{
                    "severity": "error",
                    "code": "not-found",
                    "diagnostics": "Substance/abc not found"
                }]
            })
        );
    }

    #[test]
    fn multiple_matches_uses_kebab_case() {
        let outcome = OperationOutcome::render(&[Issue::error(
            IssueType::MultipleMatches,
            "two products",
        )
        .with_expression("classification")]);

        assert_eq!(outcome["issue"][0]["code"], "multiple-matches");
        assert_eq!(outcome["issue"][0]["expression"][0], "classification");
    }

    #[test]
    fn parse_round_trips_render() {
        let issues = vec![
            Issue::error(IssueType::Required, "name is required").with_expression("name"),
            Issue::error(IssueType::Value, "bad date"),
        ];
        let parsed = OperationOutcome::parse(&OperationOutcome::render(&issues))
            .expect("rendered outcome should parse");

        assert_eq!(parsed, issues);
    }

    #[test]
    fn parse_rejects_other_resource_types() {
        let err = OperationOutcome::parse(&json!({"resourceType": "Bundle", "issue": []}))
            .expect_err("wrong resourceType should fail");
        assert!(err.to_string().contains("OperationOutcome"));
    }
}
