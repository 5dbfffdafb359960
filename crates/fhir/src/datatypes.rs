//! FHIR-aligned embedded datatypes and their JSON translation.
//!
//! These values have no identity of their own: they are owned by the resource that embeds them
//! and are stored inline with it.
//!
//! Responsibilities:
//! - Define public domain-level types (`Coding`, `CodeableConcept`, `Quantity`, `ResourceRef`)
//! - Define strict wire models for FHIR JSON
//! - Translate between the two, surfacing the failing path on mismatch

use crate::primitives::{decimal_from_json, decimal_to_json};
use crate::{from_wire_value, FhirError, FhirResult};
use idmp_uuid::ResourceId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Public domain-level types
// ============================================================================

/// A single terminology reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    /// Terminology URI, e.g. `http://www.whocc.no/atc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_selected: Option<bool>,
}

impl Coding {
    /// A coding with a system and a code.
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            ..Self::default()
        }
    }

    /// Builder-style display text.
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

/// Free text plus zero or more codings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
}

impl CodeableConcept {
    /// A concept carrying only free text.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            coding: Vec::new(),
        }
    }

    /// A concept carrying one coding.
    pub fn from_coding(coding: Coding) -> Self {
        Self {
            text: None,
            coding: vec![coding],
        }
    }

    /// True when neither text nor any coding is present.
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.coding.is_empty()
    }

    /// True if any coding carries `code`, optionally restricted to `system`.
    pub fn has_code(&self, system: Option<&str>, code: &str) -> bool {
        self.coding.iter().any(|c| {
            c.code.as_deref() == Some(code)
                && system.map_or(true, |s| c.system.as_deref() == Some(s))
        })
    }

    /// The code of the first coding in `system`, if any.
    pub fn code_in(&self, system: &str) -> Option<&str> {
        self.coding
            .iter()
            .find(|c| c.system.as_deref() == Some(system))
            .and_then(|c| c.code.as_deref())
    }

    pub fn to_json(&self) -> Value {
        Value::from(concept_to_wire(self))
    }

    pub fn from_json(value: &Value) -> FhirResult<Self> {
        let wire: CodeableConceptWire = from_wire_value(value, "CodeableConcept")?;
        Ok(concept_from_wire(wire))
    }
}

/// Quantity comparator (`<`, `<=`, `>=`, `>`, `ad`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityComparator {
    LessThan,
    LessOrEqual,
    GreaterOrEqual,
    GreaterThan,
    Sufficient,
}

impl QuantityComparator {
    fn to_wire(self) -> &'static str {
        match self {
            QuantityComparator::LessThan => "<",
            QuantityComparator::LessOrEqual => "<=",
            QuantityComparator::GreaterOrEqual => ">=",
            QuantityComparator::GreaterThan => ">",
            QuantityComparator::Sufficient => "ad",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "<" => Some(QuantityComparator::LessThan),
            "<=" => Some(QuantityComparator::LessOrEqual),
            ">=" => Some(QuantityComparator::GreaterOrEqual),
            ">" => Some(QuantityComparator::GreaterThan),
            "ad" => Some(QuantityComparator::Sufficient),
            _ => None,
        }
    }
}

/// A measured amount.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<QuantityComparator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Quantity {
    /// A value with a UCUM unit, e.g. `500 mg`.
    pub fn ucum(value: Decimal, unit: impl Into<String>) -> Self {
        let unit = unit.into();
        Self {
            value: Some(value),
            comparator: None,
            unit: Some(unit.clone()),
            system: Some(UCUM_SYSTEM.to_owned()),
            code: Some(unit),
        }
    }

    pub fn to_json(&self) -> FhirResult<Value> {
        let mut object = Map::new();
        if let Some(value) = &self.value {
            object.insert("value".into(), decimal_to_json(value)?);
        }
        if let Some(comparator) = self.comparator {
            object.insert("comparator".into(), comparator.to_wire().into());
        }
        insert_opt(&mut object, "unit", &self.unit);
        insert_opt(&mut object, "system", &self.system);
        insert_opt(&mut object, "code", &self.code);
        Ok(Value::Object(object))
    }

    pub fn from_json(value: &Value) -> FhirResult<Self> {
        let wire: QuantityWire = from_wire_value(value, "Quantity")?;
        let comparator = match wire.comparator.as_deref() {
            None => None,
            Some(s) => Some(QuantityComparator::from_wire(s).ok_or_else(|| {
                FhirError::InvalidInput(format!("unknown Quantity.comparator '{s}'"))
            })?),
        };
        let amount = match &wire.value {
            None => None,
            Some(v) => Some(decimal_from_json(v)?),
        };
        Ok(Self {
            value: amount,
            comparator,
            unit: wire.unit,
            system: wire.system,
            code: wire.code,
        })
    }
}

/// The UCUM units terminology URI.
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

/// A weak, literal reference to another resource: `<Type>/<id>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, id: ResourceId) -> Self {
        Self {
            resource_type: resource_type.into(),
            id,
            display: None,
        }
    }

    /// The literal reference string, e.g. `Substance/550e8400e29b41d4a716446655440000`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Parse a literal reference. Absolute URLs are accepted; only the last two segments count.
    pub fn parse(reference: &str) -> FhirResult<Self> {
        let mut segments = reference.trim().rsplit('/');
        let id = segments.next().unwrap_or_default();
        let resource_type = segments.next().unwrap_or_default();
        if resource_type.is_empty()
            || !resource_type.starts_with(|c: char| c.is_ascii_uppercase())
        {
            return Err(FhirError::InvalidInput(format!(
                "reference '{reference}' is not of the form <Type>/<id>"
            )));
        }
        let id = ResourceId::parse(id).map_err(|e| FhirError::InvalidUuid(e.to_string()))?;
        Ok(Self::new(resource_type, id))
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("reference".into(), self.reference().into());
        insert_opt(&mut object, "display", &self.display);
        Value::Object(object)
    }

    pub fn from_json(value: &Value) -> FhirResult<Self> {
        let wire: ReferenceWire = from_wire_value(value, "Reference")?;
        let reference = wire
            .reference
            .ok_or_else(|| FhirError::InvalidInput("Reference.reference is required".into()))?;
        let mut parsed = Self::parse(&reference)?;
        parsed.display = wire.display;
        Ok(parsed)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reference())
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct CodingWire {
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    display: Option<String>,
    #[serde(rename = "userSelected", default)]
    user_selected: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct CodeableConceptWire {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    coding: Vec<CodingWire>,
}

/// `value` stays raw JSON so decimals never pass through `f64`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuantityWire {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    comparator: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceWire {
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    display: Option<String>,
}

impl From<CodeableConceptWire> for Value {
    fn from(wire: CodeableConceptWire) -> Self {
        let mut object = Map::new();
        if let Some(text) = wire.text {
            object.insert("text".into(), Value::String(text));
        }
        if !wire.coding.is_empty() {
            let codings = wire
                .coding
                .into_iter()
                .map(|c| {
                    let mut coding = Map::new();
                    insert_opt(&mut coding, "system", &c.system);
                    insert_opt(&mut coding, "version", &c.version);
                    insert_opt(&mut coding, "code", &c.code);
                    insert_opt(&mut coding, "display", &c.display);
                    if let Some(selected) = c.user_selected {
                        coding.insert("userSelected".into(), Value::Bool(selected));
                    }
                    Value::Object(coding)
                })
                .collect();
            object.insert("coding".into(), Value::Array(codings));
        }
        Value::Object(object)
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn concept_to_wire(concept: &CodeableConcept) -> CodeableConceptWire {
    CodeableConceptWire {
        text: concept.text.clone(),
        coding: concept
            .coding
            .iter()
            .map(|c| CodingWire {
                system: c.system.clone(),
                version: c.version.clone(),
                code: c.code.clone(),
                display: c.display.clone(),
                user_selected: c.user_selected,
            })
            .collect(),
    }
}

fn concept_from_wire(wire: CodeableConceptWire) -> CodeableConcept {
    CodeableConcept {
        text: wire.text,
        coding: wire
            .coding
            .into_iter()
            .map(|c| Coding {
                system: c.system,
                version: c.version,
                code: c.code,
                display: c.display,
                user_selected: c.user_selected,
            })
            .collect(),
    }
}

fn insert_opt(object: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        object.insert(key.to_owned(), Value::String(value.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    const ATC: &str = "http://www.whocc.no/atc";

    #[test]
    fn concept_renders_text_and_codings() {
        let concept = CodeableConcept {
            text: Some("Paracetamol".into()),
            coding: vec![Coding::new(ATC, "N02BE01").with_display("paracetamol")],
        };

        assert_eq!(
            concept.to_json(),
            json!({
                "text": "Paracetamol",
                "coding": [{"system": ATC, "code": "N02BE01", "display": "paracetamol"}]
            })
        );
    }

    #[test]
    fn concept_parses_user_selected() {
        let value = json!({"coding": [{"code": "100000072072", "userSelected": true}]});
        let concept = CodeableConcept::from_json(&value).expect("should parse");

        assert_eq!(concept.coding[0].user_selected, Some(true));
        assert_eq!(concept.to_json(), value);
    }

    #[test]
    fn concept_rejects_unknown_keys_with_path() {
        let value = json!({"coding": [{"code": "x", "colour": "blue"}]});
        let err = CodeableConcept::from_json(&value).expect_err("unknown key should fail");

        match err {
            FhirError::Translation(msg) => {
                assert!(msg.contains("coding[0]"), "message should carry path: {msg}");
            }
            other => panic!("expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn has_code_respects_system() {
        let concept = CodeableConcept::from_coding(Coding::new(ATC, "N02BE01"));

        assert!(concept.has_code(None, "N02BE01"));
        assert!(concept.has_code(Some(ATC), "N02BE01"));
        assert!(!concept.has_code(Some("urn:other"), "N02BE01"));
        assert_eq!(concept.code_in(ATC), Some("N02BE01"));
    }

    #[test]
    fn quantity_keeps_decimal_scale() {
        let value = json!({"value": 500.0, "unit": "mg", "comparator": "<="});
        let quantity = Quantity::from_json(&value).expect("should parse");

        assert_eq!(quantity.value, Some(Decimal::from_str("500.0").unwrap()));
        assert_eq!(quantity.comparator, Some(QuantityComparator::LessOrEqual));
        assert_eq!(quantity.to_json().unwrap(), value);
    }

    #[test]
    fn quantity_rejects_unknown_comparator() {
        let err = Quantity::from_json(&json!({"comparator": "~"})).expect_err("should fail");
        assert!(err.to_string().contains("comparator"));
    }

    #[test]
    fn reference_round_trip() {
        let id = ResourceId::parse("550e8400e29b41d4a716446655440000").unwrap();
        let reference = ResourceRef::new("Substance", id);

        assert_eq!(
            reference.to_json(),
            json!({"reference": "Substance/550e8400e29b41d4a716446655440000"})
        );
        assert_eq!(ResourceRef::from_json(&reference.to_json()).unwrap(), reference);
    }

    #[test]
    fn reference_accepts_absolute_url() {
        let parsed = ResourceRef::parse(
            "https://example.org/fhir/Substance/550e8400e29b41d4a716446655440000",
        )
        .expect("absolute reference should parse");
        assert_eq!(parsed.resource_type, "Substance");
    }

    #[test]
    fn reference_rejects_bare_id() {
        assert!(ResourceRef::parse("550e8400e29b41d4a716446655440000").is_err());
        assert!(ResourceRef::parse("Substance/not-canonical").is_err());
    }
}
