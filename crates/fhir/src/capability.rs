//! FHIR `CapabilityStatement` rendering.
//!
//! The statement is derived from the registered resource types, so it is rebuilt whenever the
//! schema changes (served at `/metadata` and written as a derived artifact by the installer).

use serde::Serialize;
use serde_json::Value;

/// FHIR version the registry's documents conform to.
pub const FHIR_VERSION: &str = "6.0.0";

/// A search parameter advertised for one resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilitySearchParam {
    pub name: String,
    /// FHIR search parameter type: `token`, `string`, `reference`, `date`, `number`, ...
    pub param_type: String,
    pub documentation: Option<String>,
}

/// One supported resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityResource {
    pub resource_type: String,
    pub search_params: Vec<CapabilitySearchParam>,
    /// Named type-level operations without the `$` prefix, e.g. `lookup`.
    pub operations: Vec<String>,
}

/// CapabilityStatement operations.
///
/// This is a zero-sized type used for namespacing capability-related operations.
pub struct CapabilityStatement;

impl CapabilityStatement {
    /// Render a server capability statement for `resources`.
    ///
    /// The output is deterministic for the same input so callers can compare renders to decide
    /// whether a stored copy is stale.
    pub fn render(software_name: &str, resources: &[CapabilityResource]) -> Value {
        let wire = CapabilityWire {
            resource_type: "CapabilityStatement",
            status: "active",
            kind: "instance",
            fhir_version: FHIR_VERSION,
            format: vec!["json"],
            software: SoftwareWire {
                name: software_name.to_owned(),
            },
            rest: vec![RestWire {
                mode: "server",
                resource: resources
                    .iter()
                    .map(|r| ResourceWire {
                        resource_type: r.resource_type.clone(),
                        interaction: ["read", "search-type", "create", "update", "delete"]
                            .into_iter()
                            .map(|code| InteractionWire { code })
                            .collect(),
                        search_param: r
                            .search_params
                            .iter()
                            .map(|p| SearchParamWire {
                                name: p.name.clone(),
                                param_type: p.param_type.clone(),
                                documentation: p.documentation.clone(),
                            })
                            .collect(),
                        operation: r
                            .operations
                            .iter()
                            .map(|name| OperationWire {
                                name: name.clone(),
                                definition: format!(
                                    "OperationDefinition/{}-{}",
                                    r.resource_type, name
                                ),
                            })
                            .collect(),
                    })
                    .collect(),
            }],
        };
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Serialize)]
struct CapabilityWire {
    #[serde(rename = "resourceType")]
    resource_type: &'static str,
    status: &'static str,
    kind: &'static str,
    #[serde(rename = "fhirVersion")]
    fhir_version: &'static str,
    format: Vec<&'static str>,
    software: SoftwareWire,
    rest: Vec<RestWire>,
}

#[derive(Serialize)]
struct SoftwareWire {
    name: String,
}

#[derive(Serialize)]
struct RestWire {
    mode: &'static str,
    resource: Vec<ResourceWire>,
}

#[derive(Serialize)]
struct ResourceWire {
    #[serde(rename = "type")]
    resource_type: String,
    interaction: Vec<InteractionWire>,
    #[serde(rename = "searchParam", skip_serializing_if = "Vec::is_empty")]
    search_param: Vec<SearchParamWire>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    operation: Vec<OperationWire>,
}

#[derive(Serialize)]
struct InteractionWire {
    code: &'static str,
}

#[derive(Serialize)]
struct SearchParamWire {
    name: String,
    #[serde(rename = "type")]
    param_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    documentation: Option<String>,
}

#[derive(Serialize)]
struct OperationWire {
    name: String,
    definition: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_resources_and_search_params() {
        let statement = CapabilityStatement::render(
            "idmp-registry",
            &[CapabilityResource {
                resource_type: "MedicinalProduct".into(),
                search_params: vec![CapabilitySearchParam {
                    name: "classification".into(),
                    param_type: "token".into(),
                    documentation: None,
                }],
                operations: vec!["lookup".into()],
            }],
        );

        assert_eq!(statement["fhirVersion"], FHIR_VERSION);
        let resource = &statement["rest"][0]["resource"][0];
        assert_eq!(resource["type"], "MedicinalProduct");
        assert_eq!(resource["searchParam"][0]["name"], "classification");
        assert_eq!(resource["operation"][0]["name"], "lookup");
        assert_eq!(resource["interaction"].as_array().map(Vec::len), Some(5));
    }

    #[test]
    fn render_is_deterministic() {
        let resources = vec![CapabilityResource {
            resource_type: "Substance".into(),
            search_params: Vec::new(),
            operations: Vec::new(),
        }];

        assert_eq!(
            CapabilityStatement::render("x", &resources),
            CapabilityStatement::render("x", &resources)
        );
    }
}
