//! `$idmp-transform`: reshape a FHIR `Medication` into an IDMP `MedicinalProduct`.
//!
//! Only the elements with a direct IDMP counterpart are carried over:
//!
//! | Medication | MedicinalProduct |
//! |---|---|
//! | `id`, `identifier` | `id`, `identifier` |
//! | `code.coding` in the ATC system | `classification[0].coding` |
//! | `code.text` | `name[0].productName` |
//! | `ingredient[].itemReference` | `ingredient[].itemReference` |
//! | `form` | `combinedPharmaceuticalDoseForm` |

use crate::{FhirError, FhirResult};
use serde_json::{json, Map, Value};

/// WHO ATC classification system.
pub const ATC_SYSTEM: &str = "http://www.whocc.no/atc";

/// Medication transform operations.
///
/// This is a zero-sized type used for namespacing the transform.
pub struct MedicationTransform;

impl MedicationTransform {
    /// Transform a `Medication` document.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if `resourceType` is missing and
    /// [`FhirError::Unsupported`] for any resource other than `Medication`.
    pub fn to_medicinal_product(medication: &Value) -> FhirResult<Value> {
        let resource_type = medication
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| FhirError::InvalidInput("Missing resourceType".into()))?;
        if resource_type != "Medication" {
            return Err(FhirError::Unsupported(format!(
                "Transformation not supported for {resource_type}"
            )));
        }

        let mut product = Map::new();
        product.insert("resourceType".into(), "MedicinalProduct".into());
        if let Some(id) = medication.get("id") {
            product.insert("id".into(), id.clone());
        }
        if let Some(identifier) = medication.get("identifier") {
            product.insert("identifier".into(), identifier.clone());
        }

        let code = medication.get("code");
        let atc: Vec<Value> = code
            .and_then(|c| c.get("coding"))
            .and_then(Value::as_array)
            .map(|codings| {
                codings
                    .iter()
                    .filter(|c| c.get("system").and_then(Value::as_str) == Some(ATC_SYSTEM))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !atc.is_empty() {
            product.insert("classification".into(), json!([{ "coding": atc }]));
        }

        if let Some(text) = code.and_then(|c| c.get("text")).and_then(Value::as_str) {
            product.insert("name".into(), json!([{ "productName": text }]));
        }

        if let Some(ingredients) = medication.get("ingredient").and_then(Value::as_array) {
            let items: Vec<Value> = ingredients
                .iter()
                .filter_map(|i| i.get("itemReference"))
                .map(|r| json!({ "itemReference": r }))
                .collect();
            if !items.is_empty() {
                product.insert("ingredient".into(), Value::Array(items));
            }
        }

        if let Some(form) = medication.get("form") {
            product.insert("combinedPharmaceuticalDoseForm".into(), form.clone());
        }

        Ok(Value::Object(product))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transforms_medication() {
        let medication = json!({
            "resourceType": "Medication",
            "code": {
                "text": "Doliprane 500 mg",
                "coding": [
                    {"system": "http://snomed.info/sct", "code": "322236009"},
                    {"system": ATC_SYSTEM, "code": "N02BE01"}
                ]
            },
            "form": {"text": "tablet"},
            "ingredient": [
                {"itemReference": {"reference": "Substance/550e8400e29b41d4a716446655440000"}},
                {"strength": {}}
            ]
        });

        let product = MedicationTransform::to_medicinal_product(&medication).expect("transform");

        assert_eq!(product["resourceType"], "MedicinalProduct");
        assert_eq!(product["classification"][0]["coding"][0]["code"], "N02BE01");
        assert_eq!(
            product["classification"][0]["coding"].as_array().map(Vec::len),
            Some(1)
        );
        assert_eq!(product["name"][0]["productName"], "Doliprane 500 mg");
        assert_eq!(product["ingredient"].as_array().map(Vec::len), Some(1));
        assert_eq!(product["combinedPharmaceuticalDoseForm"]["text"], "tablet");
        assert!(product.get("id").is_none());
    }

    #[test]
    fn rejects_missing_resource_type() {
        let err = MedicationTransform::to_medicinal_product(&json!({})).expect_err("should fail");
        assert!(matches!(err, FhirError::InvalidInput(_)));
    }

    #[test]
    fn rejects_other_resources() {
        let err = MedicationTransform::to_medicinal_product(&json!({"resourceType": "Patient"}))
            .expect_err("should fail");
        match err {
            FhirError::Unsupported(msg) => assert!(msg.contains("Patient")),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
