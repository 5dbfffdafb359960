//! Value validation against field definitions.
//!
//! Validation walks a [`FieldMap`] alongside the definitions that describe it, collecting every
//! problem instead of stopping at the first. Empty values are dropped on the way, so what comes
//! back is the normalised map that gets stored.

use crate::catalog::{ChoiceType, FieldDefinition, FieldKind};
use crate::value::{ChoiceValue, FieldMap, FieldValue, TreeNode};
use crate::{IdmpError, IdmpResult};
use fhir::ResourceRef;
use idmp_uuid::ResourceId;
use std::collections::HashSet;

/// Resolves a referenced instance id to its resource type.
pub(crate) type TargetLookup<'a> = &'a dyn Fn(&ResourceId) -> Option<String>;

/// What the validator needs beyond the definitions.
pub(crate) struct Validation<'a> {
    pub max_tree_depth: usize,
    pub lookup: Option<TargetLookup<'a>>,
    /// When set, a reference to an id the lookup does not know fails with `NotFound`.
    pub require_targets: bool,
}

impl<'a> Validation<'a> {
    /// Shape and constraint checks only; references are not resolved.
    pub fn detached(max_tree_depth: usize) -> Self {
        Self {
            max_tree_depth,
            lookup: None,
            require_targets: false,
        }
    }

    /// Validate `fields` of `resource_type` and return the normalised map.
    ///
    /// # Errors
    ///
    /// A single problem is returned as is; several are wrapped in [`IdmpError::Document`].
    pub fn validate(
        &self,
        resource_type: &str,
        definitions: &[FieldDefinition],
        fields: FieldMap,
    ) -> IdmpResult<FieldMap> {
        let mut errors = Vec::new();
        let normalised = self.check_map(resource_type, definitions, fields, "", &mut errors);
        IdmpError::collect(errors)?;
        Ok(normalised)
    }

    fn check_map(
        &self,
        resource_type: &str,
        definitions: &[FieldDefinition],
        fields: FieldMap,
        prefix: &str,
        errors: &mut Vec<IdmpError>,
    ) -> FieldMap {
        let mut normalised = FieldMap::new();

        for (name, value) in fields {
            let path = join(prefix, &name);
            let Some(definition) = definitions.iter().find(|d| d.name == name) else {
                errors.push(IdmpError::TypeMismatch {
                    field: path,
                    reason: format!("no such field on {resource_type}"),
                });
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if let Some(value) = self.check_value(resource_type, definition, value, &path, errors) {
                if !value.is_empty() {
                    normalised.insert(name, value);
                }
            }
        }

        for definition in definitions.iter().filter(|d| d.mandatory) {
            if !normalised.contains_key(&definition.name) {
                errors.push(IdmpError::MissingRequiredField {
                    field: join(prefix, &definition.name),
                });
            }
        }

        normalised
    }

    fn check_value(
        &self,
        resource_type: &str,
        definition: &FieldDefinition,
        value: FieldValue,
        path: &str,
        errors: &mut Vec<IdmpError>,
    ) -> Option<FieldValue> {
        if !value.fits(&definition.kind) {
            errors.push(mismatch(
                path,
                format!(
                    "expected a {} value, got {}",
                    definition.kind.label(),
                    value.label()
                ),
            ));
            return None;
        }

        match (&definition.kind, value) {
            (FieldKind::Text { max_length }, FieldValue::Text(text)) => {
                let length = text.chars().count();
                if length > *max_length {
                    errors.push(mismatch(
                        path,
                        format!("{length} characters exceed the maximum of {max_length}"),
                    ));
                    return None;
                }
                Some(FieldValue::Text(text))
            }
            (FieldKind::Number { precision }, FieldValue::Number(number)) => {
                if number.scale() > *precision {
                    errors.push(mismatch(
                        path,
                        format!(
                            "{number} has {} decimal places, at most {precision} allowed",
                            number.scale()
                        ),
                    ));
                    return None;
                }
                Some(FieldValue::Number(number))
            }
            (FieldKind::Select { options }, FieldValue::Select(option)) => {
                if !options.contains(&option) {
                    errors.push(not_an_option(path, &option, options));
                    return None;
                }
                Some(FieldValue::Select(option))
            }
            (FieldKind::MultiSelect { options }, FieldValue::MultiSelect(selected)) => {
                let mut seen = HashSet::new();
                for option in &selected {
                    if !options.contains(option) {
                        errors.push(not_an_option(path, option, options));
                        return None;
                    }
                    if !seen.insert(option.as_str()) {
                        errors.push(mismatch(path, format!("option '{option}' selected twice")));
                        return None;
                    }
                }
                Some(FieldValue::MultiSelect(selected))
            }
            (FieldKind::Reference { targets }, FieldValue::Reference(reference)) => self
                .check_reference(path, targets, &reference, errors)
                .then_some(FieldValue::Reference(reference)),
            (FieldKind::MultiReference { targets }, FieldValue::MultiReference(references)) => {
                let mut ok = true;
                for reference in &references {
                    ok &= self.check_reference(path, targets, reference, errors);
                }
                ok.then_some(FieldValue::MultiReference(references))
            }
            (FieldKind::Choice { alternatives }, FieldValue::Choice(choice)) => self
                .check_choice(path, alternatives, &choice, errors)
                .then_some(FieldValue::Choice(choice)),
            (FieldKind::Concept { repeated: true }, FieldValue::Concepts(concepts)) => Some(
                FieldValue::Concepts(concepts.into_iter().filter(|c| !c.is_empty()).collect()),
            ),
            (FieldKind::Group { fields, .. }, FieldValue::Group(map)) => Some(FieldValue::Group(
                self.check_map(resource_type, fields, map, path, errors),
            )),
            (FieldKind::Group { fields, .. }, FieldValue::Groups(maps)) => {
                let items = maps
                    .into_iter()
                    .enumerate()
                    .map(|(i, map)| {
                        let item_path = format!("{path}[{i}]");
                        self.check_map(resource_type, fields, map, &item_path, errors)
                    })
                    .filter(|map| !map.is_empty())
                    .collect();
                Some(FieldValue::Groups(items))
            }
            (
                FieldKind::Tree {
                    fields, max_depth, ..
                },
                FieldValue::Tree(nodes),
            ) => {
                let max_depth = max_depth.unwrap_or(self.max_tree_depth);
                let depth = nodes.iter().map(TreeNode::depth).max().unwrap_or(0);
                if depth > max_depth {
                    errors.push(IdmpError::TreeDepthExceeded {
                        field: path.to_owned(),
                        depth,
                        max_depth,
                    });
                    return None;
                }
                Some(FieldValue::Tree(self.check_nodes(
                    resource_type,
                    fields,
                    nodes,
                    path,
                    errors,
                )))
            }
            (_, value) => Some(value),
        }
    }

    fn check_nodes(
        &self,
        resource_type: &str,
        fields: &[FieldDefinition],
        nodes: Vec<TreeNode>,
        path: &str,
        errors: &mut Vec<IdmpError>,
    ) -> Vec<TreeNode> {
        nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| {
                let node_path = format!("{path}[{i}]");
                TreeNode {
                    fields: self.check_map(resource_type, fields, node.fields, &node_path, errors),
                    children: self.check_nodes(
                        resource_type,
                        fields,
                        node.children,
                        &node_path,
                        errors,
                    ),
                }
            })
            .collect()
    }

    fn check_reference(
        &self,
        path: &str,
        targets: &[String],
        reference: &ResourceRef,
        errors: &mut Vec<IdmpError>,
    ) -> bool {
        if !targets.contains(&reference.resource_type) {
            errors.push(mismatch(
                path,
                format!(
                    "{} is not one of the allowed types [{}]",
                    reference.resource_type,
                    targets.join(", ")
                ),
            ));
            return false;
        }

        let Some(lookup) = self.lookup else {
            return true;
        };
        match lookup(&reference.id) {
            Some(actual) if actual != reference.resource_type => {
                errors.push(mismatch(
                    path,
                    format!("{} is a {actual}, not a {}", reference.id, reference.resource_type),
                ));
                false
            }
            Some(_) => true,
            None if self.require_targets => {
                errors.push(IdmpError::NotFound(format!(
                    "{} referenced by '{path}'",
                    reference.reference()
                )));
                false
            }
            None => true,
        }
    }

    fn check_choice(
        &self,
        path: &str,
        alternatives: &[ChoiceType],
        choice: &ChoiceValue,
        errors: &mut Vec<IdmpError>,
    ) -> bool {
        match choice.alternative(alternatives) {
            None => {
                errors.push(mismatch(
                    path,
                    format!(
                        "{} is not an allowed alternative [{}]",
                        choice.suffix(),
                        alternatives
                            .iter()
                            .map(ChoiceType::suffix)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ));
                false
            }
            Some(ChoiceType::Reference { targets }) => match choice {
                ChoiceValue::Reference(reference) => {
                    self.check_reference(path, targets, reference, errors)
                }
                _ => true,
            },
            Some(_) => true,
        }
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn mismatch(path: &str, reason: String) -> IdmpError {
    IdmpError::TypeMismatch {
        field: path.to_owned(),
        reason,
    }
}

fn not_an_option(path: &str, option: &str, options: &[String]) -> IdmpError {
    mismatch(
        path,
        format!("'{option}' is not one of [{}]", options.join(", ")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        build_all, choice, concepts, groups, multi_reference, number, select, text, tree,
    };
    use fhir::{CodeableConcept, Coding};
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn product_fields() -> Vec<FieldDefinition> {
        build_all(vec![
            text("identifier", "Identifier", 20).mandatory().unique(),
            groups(
                "name",
                "Name",
                vec![text("productName", "Product name", 50).mandatory()],
            ),
            concepts("classification", "Classification"),
            select("status", "Status", &["active", "retired"]),
            number("strength", "Strength", 2),
            multi_reference("ingredient", "Ingredient", &["Substance"]),
            choice(
                "value",
                "Value",
                vec![ChoiceType::Boolean, ChoiceType::String],
            ),
            tree(
                "packaging",
                "Packaging",
                "packaging",
                None,
                vec![text("label", "Label", 20)],
            ),
        ])
        .expect("valid definitions")
    }

    fn map(entries: Vec<(&str, FieldValue)>) -> FieldMap {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect()
    }

    #[test]
    fn accepts_valid_values_and_drops_empty_ones() {
        let fields = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            (
                "classification",
                FieldValue::Concepts(vec![
                    CodeableConcept::from_coding(Coding::new("http://www.whocc.no/atc", "N02BE01")),
                    CodeableConcept::default(),
                ]),
            ),
            ("status", FieldValue::Select("active".into())),
            ("ingredient", FieldValue::MultiReference(Vec::new())),
        ]);

        let normalised = Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect("valid");

        assert!(!normalised.contains_key("ingredient"));
        match &normalised["classification"] {
            FieldValue::Concepts(c) => assert_eq!(c.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collects_missing_required_fields() {
        let fields = map(vec![(
            "name",
            FieldValue::Groups(vec![map(vec![("productName", FieldValue::text("Doliprane"))])]),
        )]);

        let err = Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect_err("identifier missing");

        match err {
            IdmpError::MissingRequiredField { field } => assert_eq!(field, "identifier"),
            other => panic!("expected MissingRequiredField, got {other:?}"),
        }
    }

    #[test]
    fn number_scale_is_never_rounded() {
        let fields = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            ("strength", FieldValue::Number(Decimal::from_str("1.505").unwrap())),
        ]);

        let err = Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect_err("3 decimals on a precision-2 field");
        assert!(matches!(err, IdmpError::TypeMismatch { field, .. } if field == "strength"));
    }

    #[test]
    fn reports_every_problem_at_once() {
        let fields = map(vec![
            ("identifier", FieldValue::Boolean(true)),
            ("status", FieldValue::Select("withdrawn".into())),
            ("unknown", FieldValue::text("x")),
        ]);

        let err = Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect_err("three problems");
        let problems = err.into_problems();
        // Wrong kind for identifier also leaves it missing.
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn reference_to_wrong_type_is_a_mismatch() {
        let id = ResourceId::new();
        let lookup = move |candidate: &ResourceId| -> Option<String> {
            (candidate == &id).then(|| "Organization".to_owned())
        };
        let validation = Validation {
            max_tree_depth: 2,
            lookup: Some(&lookup),
            require_targets: true,
        };
        let fields = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            (
                "ingredient",
                FieldValue::MultiReference(vec![ResourceRef::new("Substance", id)]),
            ),
        ]);

        let err = validation
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect_err("target is an Organization");
        match err {
            IdmpError::TypeMismatch { reason, .. } => assert!(reason.contains("Organization")),
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_reference_target_is_not_found_when_required() {
        let lookup = |_: &ResourceId| -> Option<String> { None };
        let validation = Validation {
            max_tree_depth: 2,
            lookup: Some(&lookup),
            require_targets: true,
        };
        let fields = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            (
                "ingredient",
                FieldValue::MultiReference(vec![ResourceRef::new("Substance", ResourceId::new())]),
            ),
        ]);

        let err = validation
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect_err("dangling reference");
        assert!(matches!(err, IdmpError::NotFound(_)));
    }

    #[test]
    fn choice_alternative_must_be_declared() {
        let fields = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            ("value", FieldValue::Choice(ChoiceValue::Integer(3))),
        ]);

        let err = Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), fields)
            .expect_err("Integer is not an alternative");
        assert!(err.to_string().contains("Integer"));
    }

    #[test]
    fn tree_depth_is_bounded() {
        let label = |s: &str| map(vec![("label", FieldValue::text(s))]);
        let two_levels = TreeNode::new(label("box")).with_child(TreeNode::new(label("blister")));
        let three_levels = TreeNode::new(label("box")).with_child(
            TreeNode::new(label("blister")).with_child(TreeNode::new(label("tablet"))),
        );

        let ok = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            ("packaging", FieldValue::Tree(vec![two_levels])),
        ]);
        assert!(Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), ok)
            .is_ok());

        let too_deep = map(vec![
            ("identifier", FieldValue::text("FR-001")),
            ("packaging", FieldValue::Tree(vec![three_levels])),
        ]);
        let err = Validation::detached(2)
            .validate("MedicinalProduct", &product_fields(), too_deep)
            .expect_err("three levels exceed two");
        match err {
            IdmpError::TreeDepthExceeded {
                depth, max_depth, ..
            } => {
                assert_eq!(depth, 3);
                assert_eq!(max_depth, 2);
            }
            other => panic!("expected TreeDepthExceeded, got {other:?}"),
        }
    }
}
