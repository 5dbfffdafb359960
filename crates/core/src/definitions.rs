//! Built-in IDMP resource definitions.
//!
//! The registry itself knows nothing about medicinal products; this module declares the FHIR
//! 6.0.0 shaped types the installer registers, the legacy types that migration reads from, the
//! folders instances live in and the search parameters each type advertises.
//!
//! ## Folder layout
//!
//! ```text
//! /IDMP/
//!   MedicinalProducts/<key>
//!   Substances/<key>
//!   PackagedProducts/<key>
//!   ...
//! /Legacy/
//!   MedicinalProducts/<key>
//!   Substances/<key>
//! ```

use crate::catalog::{
    boolean, build_all, choice, concept, concepts, datetime, group, groups, longtext,
    multi_reference, number, quantity, reference, select, text, tree, ChoiceType, FieldBuilder,
};
use crate::schema::{SchemaDocument, SchemaRegistry};
use crate::store::{Clause, MatchOp};
use crate::value::{FieldMap, FieldValue};
use crate::{IdmpError, IdmpResult};
use fhir::{CapabilityResource, CapabilitySearchParam, CodeableConcept};
use idmp_types::Location;

pub use fhir::ATC_SYSTEM;

// ============================================================================
// Names, systems and folders
// ============================================================================

pub const MEDICINAL_PRODUCT: &str = "MedicinalProduct";
pub const SUBSTANCE: &str = "Substance";
pub const PACKAGED_PRODUCT: &str = "PackagedProduct";
pub const MANUFACTURED_ITEM: &str = "ManufacturedItem";
pub const ADMINISTRABLE_PRODUCT: &str = "AdministrableProduct";
pub const INGREDIENT: &str = "Ingredient";
pub const REGULATED_AUTHORIZATION: &str = "RegulatedAuthorization";
pub const CLINICAL_USE_DEFINITION: &str = "ClinicalUseDefinition";
pub const ORGANIZATION: &str = "Organization";
pub const LEGACY_MEDICINAL_PRODUCT: &str = "LegacyMedicinalProduct";
pub const LEGACY_SUBSTANCE: &str = "LegacySubstance";

/// Group of every built-in FHIR shaped type.
pub const IDMP_GROUP: &str = "IDMP";
pub const LEGACY_GROUP: &str = "Legacy";

/// Identifier system of medicinal product identifiers (MPID).
pub const MPID_SYSTEM: &str = "urn:oid:2.16.840.1.113883.3.1937";
/// Identifier system of CAS registry numbers.
pub const CAS_SYSTEM: &str = "http://fdasis.nlm.nih.gov";
/// Coding system of WHO international nonproprietary names.
pub const INN_SYSTEM: &str = "http://www.who.int/medicines/publications/druginformation";
pub const PRODUCT_TYPE_SYSTEM: &str = "http://hl7.org/fhir/medicinal-product-type";
pub const LEGAL_STATUS_SYSTEM: &str = "http://hl7.org/fhir/legal-status-of-supply";
pub const SUBSTANCE_CATEGORY_SYSTEM: &str = "http://hl7.org/fhir/substance-category";

pub const IDMP_ROOT: &str = "/IDMP";
pub const LEGACY_ROOT: &str = "/Legacy";

const PUBLICATION_STATUS: [&str; 4] = ["draft", "active", "retired", "unknown"];

/// Folder new instances of `resource_type` are created in, e.g. `/IDMP/MedicinalProducts`.
pub fn folder_for(resource_type: &str) -> IdmpResult<Location> {
    let path = match resource_type.strip_prefix("Legacy") {
        Some(rest) if !rest.is_empty() => format!("{LEGACY_ROOT}/{rest}s"),
        _ => format!("{IDMP_ROOT}/{resource_type}s"),
    };
    Ok(Location::new(path)?)
}

// ============================================================================
// Type definitions
// ============================================================================

/// The FHIR resource types installed by `install-base-types`, in install order.
pub fn base_types() -> IdmpResult<Vec<SchemaDocument>> {
    Ok(vec![
        idmp_type(MEDICINAL_PRODUCT, medicinal_product())?,
        idmp_type(SUBSTANCE, substance())?,
        idmp_type(PACKAGED_PRODUCT, packaged_product())?,
        idmp_type(MANUFACTURED_ITEM, manufactured_item())?,
        idmp_type(ADMINISTRABLE_PRODUCT, administrable_product())?,
        idmp_type(INGREDIENT, ingredient())?,
        idmp_type(REGULATED_AUTHORIZATION, regulated_authorization())?,
        idmp_type(CLINICAL_USE_DEFINITION, clinical_use_definition())?,
    ])
}

/// Types the base types point at, installed by `install-support-types`.
pub fn support_types() -> IdmpResult<Vec<SchemaDocument>> {
    Ok(vec![idmp_type(ORGANIZATION, organization())?])
}

/// Legacy types as the old registry declared them.
///
/// These are only registered when absent: once migration has fixed them up they must not be
/// reverted by a later install.
pub fn legacy_types() -> IdmpResult<Vec<SchemaDocument>> {
    Ok(vec![
        SchemaDocument {
            name: LEGACY_SUBSTANCE.to_owned(),
            group: LEGACY_GROUP.to_owned(),
            description: Some("Substance as stored by the legacy registry".to_owned()),
            fields: build_all(vec![
                text("identifier", "Identifier", 64).unique(),
                text("substanceName", "Substance name", 255).mandatory(),
                text("inn", "INN", 255),
                text("casNumber", "CAS number", 32),
                text("substanceType", "Substance type", 100),
                text("molecularFormula", "Molecular formula", 100),
                number("molecularWeight", "Molecular weight", 3),
            ])?,
        },
        SchemaDocument {
            name: LEGACY_MEDICINAL_PRODUCT.to_owned(),
            group: LEGACY_GROUP.to_owned(),
            description: Some("Medicinal product as stored by the legacy registry".to_owned()),
            fields: build_all(vec![
                text("mpid", "MPID", 64).unique(),
                text("productName", "Product name", 255),
                text("nonproprietaryName", "Nonproprietary name", 255),
                text("productType", "Product type", 100),
                text("atcCode", "ATC code", 16),
                text("legalStatusOfSupply", "Legal status of supply", 100),
                longtext("description", "Description"),
                multi_reference("ingredient", "Ingredients", &[LEGACY_SUBSTANCE]),
            ])?,
        },
    ])
}

/// Names of every type the installer is expected to leave registered.
pub fn required_type_names() -> Vec<&'static str> {
    vec![
        MEDICINAL_PRODUCT,
        SUBSTANCE,
        PACKAGED_PRODUCT,
        MANUFACTURED_ITEM,
        ADMINISTRABLE_PRODUCT,
        INGREDIENT,
        REGULATED_AUTHORIZATION,
        CLINICAL_USE_DEFINITION,
        ORGANIZATION,
    ]
}

fn idmp_type(name: &str, fields: Vec<FieldBuilder>) -> IdmpResult<SchemaDocument> {
    Ok(SchemaDocument {
        name: name.to_owned(),
        group: IDMP_GROUP.to_owned(),
        description: Some(format!("FHIR 6.0.0 {name} Resource")),
        fields: build_all(fields)?,
    })
}

fn identifiers() -> FieldBuilder {
    text("identifier", "Identifier", 64).unique().at("identifier[].value")
}

fn marketing_status() -> FieldBuilder {
    groups(
        "marketingStatus",
        "Marketing status",
        vec![
            concept("country", "Country"),
            concept("jurisdiction", "Jurisdiction"),
            concept("status", "Status").mandatory(),
            datetime("restoreDate", "Restore date"),
        ],
    )
}

fn properties(name: &str) -> FieldBuilder {
    groups(
        name,
        "Property",
        vec![
            concept("type", "Type").mandatory(),
            choice(
                "value",
                "Value",
                vec![
                    ChoiceType::CodeableConcept,
                    ChoiceType::Quantity,
                    ChoiceType::Date,
                    ChoiceType::Boolean,
                    ChoiceType::Markdown,
                ],
            ),
        ],
    )
    .at("property")
}

fn medicinal_product() -> Vec<FieldBuilder> {
    vec![
        text("identifier", "MPID", 64)
            .mandatory()
            .unique()
            .at(&format!("identifier[system={MPID_SYSTEM}].value")),
        concept("medicinalProductType", "Type").at("type"),
        concept("domain", "Domain"),
        text("version", "Version", 200),
        concept("status", "Status"),
        datetime("statusDate", "Status date"),
        text("description", "Description", 600),
        concept("combinedPharmaceuticalDoseForm", "Combined pharmaceutical dose form"),
        concepts("route", "Route"),
        longtext("indication", "Indication"),
        concept("legalStatusOfSupply", "Legal status of supply"),
        concept("additionalMonitoringIndicator", "Additional monitoring indicator"),
        concepts("specialMeasures", "Special measures"),
        concept("pediatricUseIndicator", "Pediatric use indicator"),
        concepts("classification", "Classification"),
        marketing_status(),
        concepts("packagedMedicinalProduct", "Packaged medicinal product"),
        multi_reference("comprisedOf", "Comprised of", &[MANUFACTURED_ITEM]),
        multi_reference("ingredient", "Ingredient", &[SUBSTANCE]).at("ingredient[].itemReference"),
        groups(
            "contact",
            "Contact",
            vec![
                concept("type", "Type"),
                reference("contact", "Contact", &[ORGANIZATION]).mandatory(),
            ],
        ),
        groups(
            "name",
            "Name",
            vec![
                text("productName", "Product name", 255).mandatory(),
                concept("nameType", "Name type").at("type"),
                groups(
                    "usage",
                    "Usage",
                    vec![
                        concept("country", "Country").mandatory(),
                        concept("jurisdiction", "Jurisdiction"),
                        concept("language", "Language").mandatory(),
                    ],
                ),
            ],
        )
        .mandatory(),
        groups(
            "crossReference",
            "Cross reference",
            vec![
                reference("product", "Product", &[MEDICINAL_PRODUCT])
                    .mandatory()
                    .at("product.reference"),
                concept("type", "Type"),
            ],
        ),
        groups(
            "operation",
            "Manufacturing business operation",
            vec![
                concept("type", "Type").at("type.concept"),
                multi_reference("organization", "Organization", &[ORGANIZATION]),
                concept("confidentialityIndicator", "Confidentiality indicator"),
            ],
        ),
        groups(
            "characteristic",
            "Characteristic",
            vec![
                concept("type", "Type").mandatory(),
                choice(
                    "value",
                    "Value",
                    vec![
                        ChoiceType::CodeableConcept,
                        ChoiceType::Markdown,
                        ChoiceType::Quantity,
                        ChoiceType::Integer,
                        ChoiceType::Date,
                        ChoiceType::Boolean,
                    ],
                ),
            ],
        ),
    ]
}

fn substance() -> Vec<FieldBuilder> {
    vec![
        identifiers(),
        text("casNumber", "CAS number", 32).at(&format!("identifier[system={CAS_SYSTEM}].value")),
        select("status", "Status", &["active", "inactive", "entered-in-error"]),
        concepts("category", "Category"),
        text("name", "Name", 255).mandatory().at("code.text"),
        text("inn", "INN", 255).at(&format!("code.coding[system={INN_SYSTEM}].code")),
        longtext("description", "Description"),
        datetime("expiry", "Expiry"),
        quantity("quantity", "Quantity"),
        text("molecularFormula", "Molecular formula", 100).at("structure.molecularFormula"),
        number("molecularWeight", "Molecular weight", 3).at("molecularWeight.amount.value"),
        multi_reference("manufacturer", "Manufacturer", &[ORGANIZATION]),
        multi_reference("supplier", "Supplier", &[ORGANIZATION]),
        groups(
            "moiety",
            "Moiety",
            vec![
                concept("role", "Role"),
                text("name", "Name", 255),
                text("molecularFormula", "Molecular formula", 100),
                choice("amount", "Amount", vec![ChoiceType::Quantity, ChoiceType::String]),
            ],
        ),
        properties("propertyDetail"),
        groups(
            "ingredient",
            "Ingredient",
            vec![
                quantity("quantity", "Quantity"),
                choice(
                    "substance",
                    "Substance",
                    vec![
                        ChoiceType::CodeableConcept,
                        ChoiceType::Reference {
                            targets: vec![SUBSTANCE.to_owned()],
                        },
                    ],
                )
                .mandatory(),
            ],
        ),
    ]
}

fn packaged_product() -> Vec<FieldBuilder> {
    vec![
        identifiers(),
        text("name", "Name", 300),
        concept("productType", "Type").at("type"),
        multi_reference("packageFor", "Package for", &[MEDICINAL_PRODUCT]),
        concept("status", "Status"),
        datetime("statusDate", "Status date"),
        quantity("containedItemQuantity", "Contained item quantity").at("containedItemQuantity[]"),
        text("description", "Description", 600),
        groups(
            "legalStatusOfSupply",
            "Legal status of supply",
            vec![concept("code", "Code"), concept("jurisdiction", "Jurisdiction")],
        ),
        marketing_status(),
        boolean("copackagedIndicator", "Copackaged indicator"),
        multi_reference("manufacturer", "Manufacturer", &[ORGANIZATION]),
        tree(
            "packaging",
            "Packaging",
            "packaging",
            None,
            vec![
                text("identifier", "Identifier", 64).at("identifier[].value"),
                concept("packagingType", "Type").at("type"),
                number("quantity", "Quantity", 0),
                concepts("material", "Material"),
                concepts("alternateMaterial", "Alternate material"),
                multi_reference("manufacturer", "Manufacturer", &[ORGANIZATION]),
                properties("packagingProperty"),
                groups(
                    "containedItem",
                    "Contained item",
                    vec![
                        reference("item", "Item", &[MANUFACTURED_ITEM, PACKAGED_PRODUCT])
                            .mandatory()
                            .at("item.reference"),
                        quantity("amount", "Amount"),
                    ],
                ),
            ],
        ),
    ]
}

fn manufactured_item() -> Vec<FieldBuilder> {
    vec![
        identifiers(),
        select("status", "Status", &PUBLICATION_STATUS).mandatory(),
        text("name", "Name", 300),
        concept("manufacturedDoseForm", "Manufactured dose form").mandatory(),
        concept("unitOfPresentation", "Unit of presentation"),
        multi_reference("manufacturer", "Manufacturer", &[ORGANIZATION]),
        marketing_status(),
        concepts("ingredient", "Ingredient"),
        properties("propertyDetail"),
        tree(
            "component",
            "Component",
            "component",
            None,
            vec![
                concept("componentType", "Type").mandatory().at("type"),
                concepts("function", "Function"),
                quantity("amount", "Amount").at("amount[]"),
                groups(
                    "constituent",
                    "Constituent",
                    vec![
                        quantity("amount", "Amount").at("amount[]"),
                        concepts("location", "Location"),
                        concepts("function", "Function"),
                        multi_reference("hasIngredient", "Has ingredient", &[INGREDIENT])
                            .at("hasIngredient[].reference"),
                    ],
                ),
                properties("componentProperty"),
            ],
        ),
    ]
}

fn administrable_product() -> Vec<FieldBuilder> {
    vec![
        identifiers(),
        select("status", "Status", &PUBLICATION_STATUS).mandatory(),
        multi_reference("formOf", "Form of", &[MEDICINAL_PRODUCT]),
        concept("administrableDoseForm", "Administrable dose form"),
        concept("unitOfPresentation", "Unit of presentation"),
        multi_reference("producedFrom", "Produced from", &[MANUFACTURED_ITEM]),
        concepts("ingredient", "Ingredient"),
        longtext("description", "Description"),
        properties("propertyDetail"),
        groups(
            "routeOfAdministration",
            "Route of administration",
            vec![
                concept("code", "Code").mandatory(),
                quantity("firstDose", "First dose"),
                quantity("maxSingleDose", "Maximum single dose"),
                quantity("maxDosePerDay", "Maximum dose per day"),
            ],
        )
        .mandatory(),
    ]
}

fn ingredient() -> Vec<FieldBuilder> {
    let strength = groups(
        "strength",
        "Strength",
        vec![
            choice(
                "presentation",
                "Presentation",
                vec![ChoiceType::Quantity, ChoiceType::CodeableConcept],
            ),
            text("textPresentation", "Text presentation", 255),
            choice(
                "concentration",
                "Concentration",
                vec![ChoiceType::Quantity, ChoiceType::CodeableConcept],
            ),
            text("textConcentration", "Text concentration", 255),
            concept("basis", "Basis"),
            text("measurementPoint", "Measurement point", 255),
            concepts("country", "Country"),
        ],
    );
    vec![
        text("identifier", "Identifier", 64).unique().at("identifier.value"),
        select("status", "Status", &PUBLICATION_STATUS).mandatory(),
        multi_reference(
            "for",
            "For",
            &[MEDICINAL_PRODUCT, ADMINISTRABLE_PRODUCT, MANUFACTURED_ITEM],
        ),
        concept("role", "Role").mandatory(),
        concepts("function", "Function"),
        concept("group", "Group"),
        boolean("allergenicIndicator", "Allergenic indicator"),
        longtext("comment", "Comment"),
        groups(
            "manufacturer",
            "Manufacturer",
            vec![
                select("role", "Role", &["allowed", "possible", "actual"]),
                reference("manufacturer", "Manufacturer", &[ORGANIZATION]).mandatory(),
            ],
        ),
        group(
            "substance",
            "Substance",
            vec![
                reference("code", "Code", &[SUBSTANCE])
                    .mandatory()
                    .at("code.reference"),
                strength,
            ],
        )
        .mandatory(),
    ]
}

fn regulated_authorization() -> Vec<FieldBuilder> {
    vec![
        identifiers(),
        multi_reference(
            "subject",
            "Subject",
            &[
                MEDICINAL_PRODUCT,
                PACKAGED_PRODUCT,
                MANUFACTURED_ITEM,
                ADMINISTRABLE_PRODUCT,
                INGREDIENT,
                SUBSTANCE,
            ],
        ),
        concept("authorizationType", "Authorization type").at("type"),
        longtext("description", "Description"),
        concepts("region", "Region"),
        concept("status", "Status"),
        datetime("statusDate", "Status date"),
        group(
            "validityPeriod",
            "Validity period",
            vec![datetime("start", "Start"), datetime("end", "End")],
        ),
        concepts("indication", "Indication").at("indication[].concept"),
        concept("intendedUse", "Intended use"),
        concepts("basis", "Basis"),
        reference("holder", "Holder", &[ORGANIZATION]),
        reference("regulator", "Regulator", &[ORGANIZATION]),
        group(
            "case",
            "Case",
            vec![
                text("identifier", "Identifier", 64).at("identifier.value"),
                concept("type", "Type"),
                concept("status", "Status"),
            ],
        ),
    ]
}

fn clinical_use_definition() -> Vec<FieldBuilder> {
    let subjects = [
        MEDICINAL_PRODUCT,
        ADMINISTRABLE_PRODUCT,
        MANUFACTURED_ITEM,
        INGREDIENT,
        SUBSTANCE,
    ];
    vec![
        identifiers(),
        select(
            "clinicalUseType",
            "Type",
            &[
                "indication",
                "contraindication",
                "interaction",
                "undesirable-effect",
                "warning",
            ],
        )
        .mandatory()
        .at("type"),
        concepts("category", "Category"),
        multi_reference("subject", "Subject", &subjects),
        concept("status", "Status"),
        group(
            "contraindication",
            "Contraindication",
            vec![
                concept("diseaseSymptomProcedure", "Disease, symptom or procedure")
                    .at("diseaseSymptomProcedure.concept"),
                concept("diseaseStatus", "Disease status").at("diseaseStatus.concept"),
                concepts("comorbidity", "Comorbidity").at("comorbidity[].concept"),
                groups(
                    "otherTherapy",
                    "Other therapy",
                    vec![
                        concept("relationshipType", "Relationship type").mandatory(),
                        concept("treatment", "Treatment").mandatory().at("treatment.concept"),
                    ],
                ),
            ],
        ),
        group(
            "indication",
            "Indication",
            vec![
                concept("diseaseSymptomProcedure", "Disease, symptom or procedure")
                    .at("diseaseSymptomProcedure.concept"),
                concept("diseaseStatus", "Disease status").at("diseaseStatus.concept"),
                concepts("comorbidity", "Comorbidity").at("comorbidity[].concept"),
                concept("intendedEffect", "Intended effect").at("intendedEffect.concept"),
                choice("duration", "Duration", vec![ChoiceType::Quantity, ChoiceType::String]),
            ],
        ),
        group(
            "interaction",
            "Interaction",
            vec![
                groups(
                    "interactant",
                    "Interactant",
                    vec![choice(
                        "item",
                        "Item",
                        vec![
                            ChoiceType::Reference {
                                targets: vec![
                                    MEDICINAL_PRODUCT.to_owned(),
                                    SUBSTANCE.to_owned(),
                                ],
                            },
                            ChoiceType::CodeableConcept,
                        ],
                    )
                    .mandatory()],
                ),
                concept("type", "Type"),
                concept("effect", "Effect").at("effect.concept"),
                concept("incidence", "Incidence"),
                concepts("management", "Management"),
            ],
        ),
        group(
            "undesirableEffect",
            "Undesirable effect",
            vec![
                concept("symptomConditionEffect", "Symptom, condition or effect")
                    .at("symptomConditionEffect.concept"),
                concept("classification", "Classification"),
                concept("frequencyOfOccurrence", "Frequency of occurrence"),
            ],
        ),
        group(
            "warning",
            "Warning",
            vec![longtext("description", "Description"), concept("code", "Code")],
        ),
    ]
}

fn organization() -> Vec<FieldBuilder> {
    vec![
        identifiers(),
        boolean("active", "Active"),
        concepts("organizationType", "Type").at("type"),
        text("name", "Name", 255).mandatory(),
        longtext("description", "Description"),
        reference("partOf", "Part of", &[ORGANIZATION]),
    ]
}

// ============================================================================
// Product names
// ============================================================================

/// One entry of a medicinal product's `name` group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductName {
    pub product_name: String,
    pub name_type: Option<CodeableConcept>,
}

impl ProductName {
    /// Build a name entry from the bare string legacy products stored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a blank string.
    pub fn from_legacy_string(raw: &str) -> IdmpResult<Self> {
        let product_name = raw.trim();
        if product_name.is_empty() {
            return Err(IdmpError::InvalidInput(
                "legacy product name is blank".into(),
            ));
        }
        Ok(Self {
            product_name: product_name.to_owned(),
            name_type: None,
        })
    }

    pub fn with_type(mut self, name_type: CodeableConcept) -> Self {
        self.name_type = Some(name_type);
        self
    }

    pub fn into_fields(self) -> FieldMap {
        let mut fields = FieldMap::from([(
            "productName".to_owned(),
            FieldValue::Text(self.product_name),
        )]);
        if let Some(name_type) = self.name_type {
            fields.insert("nameType".to_owned(), FieldValue::Concept(name_type));
        }
        fields
    }

    /// The value of a product's `name` field holding `names` in order.
    pub fn field_value(names: Vec<ProductName>) -> FieldValue {
        FieldValue::Groups(names.into_iter().map(ProductName::into_fields).collect())
    }
}

// ============================================================================
// Search parameters
// ============================================================================

/// A named search parameter and the field clause it becomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchParam {
    pub name: &'static str,
    /// Dotted field path the clause applies to.
    pub field: &'static str,
    pub op: MatchOp,
    /// FHIR search parameter type.
    pub param_type: &'static str,
    pub documentation: &'static str,
}

const fn param(
    name: &'static str,
    field: &'static str,
    op: MatchOp,
    param_type: &'static str,
    documentation: &'static str,
) -> SearchParam {
    SearchParam {
        name,
        field,
        op,
        param_type,
        documentation,
    }
}

const MEDICINAL_PRODUCT_PARAMS: [SearchParam; 6] = [
    param("identifier", "identifier", MatchOp::Equals, "token", "MPID"),
    param("name", "name.productName", MatchOp::Contains, "string", "Any product name, substring"),
    param(
        "classification",
        "classification",
        MatchOp::Equals,
        "token",
        "Classification code, e.g. ATC",
    ),
    param("type", "medicinalProductType", MatchOp::Equals, "token", "Product type"),
    param(
        "legal-status",
        "legalStatusOfSupply",
        MatchOp::Equals,
        "token",
        "Legal status of supply",
    ),
    param(
        "inn",
        "name.productName",
        MatchOp::Contains,
        "string",
        "Nonproprietary name, substring",
    ),
];

const SUBSTANCE_PARAMS: [SearchParam; 5] = [
    param("identifier", "identifier", MatchOp::Equals, "token", "Substance identifier"),
    param("name", "name", MatchOp::Contains, "string", "Substance name, substring"),
    param("cas", "casNumber", MatchOp::Equals, "token", "CAS registry number"),
    param("inn", "inn", MatchOp::Contains, "string", "INN, substring"),
    param("category", "category", MatchOp::Equals, "token", "Substance category"),
];

const IDENTIFIER_PARAMS: [SearchParam; 1] =
    [param("identifier", "identifier", MatchOp::Equals, "token", "Business identifier")];

/// Search parameters advertised for `resource_type`.
pub fn search_params(resource_type: &str) -> &'static [SearchParam] {
    match resource_type {
        MEDICINAL_PRODUCT => &MEDICINAL_PRODUCT_PARAMS,
        SUBSTANCE => &SUBSTANCE_PARAMS,
        LEGACY_MEDICINAL_PRODUCT | LEGACY_SUBSTANCE => &[],
        _ => &IDENTIFIER_PARAMS,
    }
}

/// The clause a `name=value` search parameter stands for.
///
/// Names without a declared parameter are taken as a field path compared for equality.
pub fn search_clause(resource_type: &str, name: &str, value: &str) -> Clause {
    match search_params(resource_type).iter().find(|p| p.name == name) {
        Some(param) => Clause {
            field: param.field.to_owned(),
            op: param.op,
            value: value.to_owned(),
        },
        None => Clause::equals(name, value),
    }
}

/// Capability entries for every registered type.
pub fn capability_resources(registry: &SchemaRegistry) -> IdmpResult<Vec<CapabilityResource>> {
    Ok(registry
        .list_all()?
        .into_iter()
        .map(|resource_type| {
            let search_params = search_params(&resource_type.name)
                .iter()
                .filter(|p| resource_type.field_path(p.field).is_some())
                .map(|p| CapabilitySearchParam {
                    name: p.name.to_owned(),
                    param_type: p.param_type.to_owned(),
                    documentation: Some(p.documentation.to_owned()),
                })
                .collect();
            let operations = if resource_type.name == MEDICINAL_PRODUCT {
                vec!["lookup".to_owned()]
            } else {
                Vec::new()
            };
            CapabilityResource {
                resource_type: resource_type.name,
                search_params,
                operations,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaChange;

    fn install(registry: &SchemaRegistry) {
        for document in base_types()
            .expect("base types")
            .into_iter()
            .chain(support_types().expect("support types"))
            .chain(legacy_types().expect("legacy types"))
        {
            document.apply(registry).expect("apply");
        }
    }

    #[test]
    fn every_definition_builds_and_resolves() {
        let registry = SchemaRegistry::in_memory();
        install(&registry);
        registry.resolve().expect("all targets registered");
        for name in required_type_names() {
            assert!(registry.contains(name).unwrap(), "{name} missing");
        }
    }

    #[test]
    fn reinstall_is_unchanged() {
        let registry = SchemaRegistry::in_memory();
        install(&registry);
        for document in base_types().unwrap() {
            let upsert = document.apply(&registry).unwrap();
            assert_eq!(upsert.change, SchemaChange::Unchanged);
        }
    }

    #[test]
    fn base_types_without_support_types_do_not_resolve() {
        let registry = SchemaRegistry::in_memory();
        for document in base_types().unwrap() {
            document.apply(&registry).unwrap();
        }
        let err = registry.resolve().expect_err("Organization is missing");
        assert!(err
            .into_problems()
            .iter()
            .all(|e| matches!(
                e,
                IdmpError::UnknownReferencedType { target, .. } if target == ORGANIZATION
            )));
    }

    #[test]
    fn folders_follow_type_names() {
        assert_eq!(
            folder_for(MEDICINAL_PRODUCT).unwrap().as_str(),
            "/IDMP/MedicinalProducts"
        );
        assert_eq!(folder_for(LEGACY_SUBSTANCE).unwrap().as_str(), "/Legacy/Substances");
    }

    #[test]
    fn legacy_string_becomes_single_name_entry() {
        let name = ProductName::from_legacy_string("  Doliprane 500mg ").expect("name");
        assert_eq!(name.product_name, "Doliprane 500mg");

        let fields = name.into_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["productName"], FieldValue::text("Doliprane 500mg"));

        let err = ProductName::from_legacy_string("   ").expect_err("blank");
        assert!(matches!(err, IdmpError::InvalidInput(_)));
    }

    #[test]
    fn declared_parameters_map_to_field_clauses() {
        let clause = search_clause(MEDICINAL_PRODUCT, "legal-status", "prescription");
        assert_eq!(clause.field, "legalStatusOfSupply");
        assert_eq!(clause.op, MatchOp::Equals);

        let clause = search_clause(SUBSTANCE, "cas", "103-90-2");
        assert_eq!(clause.field, "casNumber");

        let clause = search_clause(MEDICINAL_PRODUCT, "statusDate", "2024-01-01");
        assert_eq!(clause, Clause::equals("statusDate", "2024-01-01"));
    }

    #[test]
    fn declared_parameters_name_real_fields() {
        let registry = SchemaRegistry::in_memory();
        install(&registry);
        for name in [MEDICINAL_PRODUCT, SUBSTANCE, ORGANIZATION] {
            let resource_type = registry.get(name).unwrap();
            for param in search_params(name) {
                assert!(
                    resource_type.field_path(param.field).is_some(),
                    "{name}.{} has no field {}",
                    param.name,
                    param.field
                );
            }
        }
    }

    #[test]
    fn only_medicinal_product_advertises_lookup() {
        let registry = SchemaRegistry::in_memory();
        install(&registry);
        let resources = capability_resources(&registry).unwrap();
        let product = resources
            .iter()
            .find(|r| r.resource_type == MEDICINAL_PRODUCT)
            .expect("product entry");
        assert_eq!(product.operations, vec!["lookup".to_owned()]);
        assert_eq!(product.search_params.len(), MEDICINAL_PRODUCT_PARAMS.len());
        assert!(resources
            .iter()
            .filter(|r| r.resource_type != MEDICINAL_PRODUCT)
            .all(|r| r.operations.is_empty()));
    }
}
