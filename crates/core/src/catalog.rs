//! Field and type catalog.
//!
//! Every resource type is a list of [`FieldDefinition`]s. A definition pairs a field name with a
//! typed [`FieldKind`] and the FHIR element path the value is written to. Definitions are
//! validated when they are built, so a registered schema never carries an impossible field
//! (a text field of length zero, a choice with one alternative, a tree that may not nest).
//!
//! Construction is pure: nothing here touches the registry or the store.

use crate::path::ElementPath;
use crate::{IdmpError, IdmpResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;

// ============================================================================
// Public domain-level types
// ============================================================================

/// The typed shape of a field's value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FieldKind {
    Text {
        max_length: usize,
    },
    LongText,
    Date,
    DateTime,
    /// A decimal with at most `precision` fractional digits.
    Number {
        precision: u32,
    },
    Boolean,
    Select {
        options: Vec<String>,
    },
    MultiSelect {
        options: Vec<String>,
    },
    Reference {
        targets: Vec<String>,
    },
    MultiReference {
        targets: Vec<String>,
    },
    /// A polymorphic `value[x]` element; exactly one alternative is populated.
    Choice {
        alternatives: Vec<ChoiceType>,
    },
    Concept {
        #[serde(default)]
        repeated: bool,
    },
    Quantity,
    Group {
        fields: Vec<FieldDefinition>,
        #[serde(default)]
        repeated: bool,
    },
    /// A recursive list of nodes; each node's children live under the `children` element.
    Tree {
        fields: Vec<FieldDefinition>,
        children: String,
        /// Falls back to the configured default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_depth: Option<usize>,
    },
}

impl FieldKind {
    /// True when the field holds a list of values.
    pub fn is_multi(&self) -> bool {
        match self {
            FieldKind::MultiSelect { .. }
            | FieldKind::MultiReference { .. }
            | FieldKind::Tree { .. } => {
                true
            }
            FieldKind::Concept { repeated } | FieldKind::Group { repeated, .. } => *repeated,
            _ => false,
        }
    }

    /// Short name used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            FieldKind::Text { .. } => "text",
            FieldKind::LongText => "long-text",
            FieldKind::Date => "date",
            FieldKind::DateTime => "date-time",
            FieldKind::Number { .. } => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Select { .. } => "select",
            FieldKind::MultiSelect { .. } => "multi-select",
            FieldKind::Reference { .. } => "reference",
            FieldKind::MultiReference { .. } => "multi-reference",
            FieldKind::Choice { .. } => "choice",
            FieldKind::Concept { repeated: false } => "concept",
            FieldKind::Concept { repeated: true } => "concepts",
            FieldKind::Quantity => "quantity",
            FieldKind::Group { repeated: false, .. } => "group",
            FieldKind::Group { repeated: true, .. } => "groups",
            FieldKind::Tree { .. } => "tree",
        }
    }

    /// Nested definitions of group and tree kinds.
    pub fn sub_fields(&self) -> &[FieldDefinition] {
        match self {
            FieldKind::Group { fields, .. } | FieldKind::Tree { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Resource types this kind may point at, including choice alternatives.
    pub fn reference_targets(&self) -> Vec<&str> {
        match self {
            FieldKind::Reference { targets } | FieldKind::MultiReference { targets } => {
                targets.iter().map(String::as_str).collect()
            }
            FieldKind::Choice { alternatives } => alternatives
                .iter()
                .flat_map(|a| match a {
                    ChoiceType::Reference { targets } => {
                        targets.iter().map(String::as_str).collect()
                    }
                    _ => Vec::new(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn may_be_unique(&self) -> bool {
        matches!(
            self,
            FieldKind::Text { .. }
                | FieldKind::Select { .. }
                | FieldKind::Number { .. }
                | FieldKind::Date
        )
    }
}

/// One alternative of a choice field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChoiceType {
    Quantity,
    CodeableConcept,
    Boolean,
    String,
    Integer,
    Date,
    DateTime,
    Markdown,
    Reference { targets: Vec<String> },
}

impl ChoiceType {
    /// Every element-name suffix a choice may use.
    pub const SUFFIXES: [&'static str; 9] = [
        "Quantity",
        "CodeableConcept",
        "Boolean",
        "String",
        "Integer",
        "Date",
        "DateTime",
        "Markdown",
        "Reference",
    ];

    /// The FHIR type suffix appended to the element name, e.g. `valueQuantity`.
    pub fn suffix(&self) -> &'static str {
        match self {
            ChoiceType::Quantity => "Quantity",
            ChoiceType::CodeableConcept => "CodeableConcept",
            ChoiceType::Boolean => "Boolean",
            ChoiceType::String => "String",
            ChoiceType::Integer => "Integer",
            ChoiceType::Date => "Date",
            ChoiceType::DateTime => "DateTime",
            ChoiceType::Markdown => "Markdown",
            ChoiceType::Reference { .. } => "Reference",
        }
    }
}

/// A named, typed field of a resource type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub title: String,
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Where the value lives in the FHIR document. `None` means the top-level member `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementPath>,
}

impl FieldDefinition {
    /// The effective element path.
    pub fn element_path(&self) -> Cow<'_, ElementPath> {
        match &self.element {
            Some(path) => Cow::Borrowed(path),
            None => Cow::Owned(ElementPath::member(&self.name)),
        }
    }

    /// Look up a nested sub-field of a group or tree.
    pub fn sub_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.kind.sub_fields().iter().find(|f| f.name == name)
    }
}

/// Flags applied on top of a field's kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldOptions {
    pub mandatory: bool,
    pub unique: bool,
    pub element: Option<String>,
}

impl FieldOptions {
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn at(mut self, element: impl Into<String>) -> Self {
        self.element = Some(element.into());
        self
    }
}

// ============================================================================
// Public catalog operations
// ============================================================================

/// Build and validate a field definition.
///
/// # Errors
///
/// Returns [`IdmpError::InvalidFieldSpec`] when the name, title, kind constraints, flags or
/// element path are not acceptable.
pub fn define_field(
    kind: FieldKind,
    name: &str,
    title: &str,
    options: FieldOptions,
) -> IdmpResult<FieldDefinition> {
    let element = match options.element {
        None => None,
        Some(raw) => Some(
            ElementPath::parse(&raw).map_err(|e| spec_error(name, e.to_string()))?,
        ),
    };
    let definition = FieldDefinition {
        name: name.trim().to_owned(),
        title: title.trim().to_owned(),
        kind,
        mandatory: options.mandatory,
        unique: options.unique,
        element,
    };
    check_definition(&definition)?;
    Ok(definition)
}

/// Validate a definition built elsewhere (for example parsed from YAML).
///
/// Nested group and tree fields are checked recursively; `unique` is only allowed at the top
/// level.
pub fn check_definition(definition: &FieldDefinition) -> IdmpResult<()> {
    check_definition_at(definition, true)
}

/// Fluent builder over [`define_field`], used by the built-in IDMP definitions.
#[derive(Clone, Debug)]
pub struct FieldBuilder {
    name: String,
    title: String,
    kind: FieldKind,
    sub_fields: Vec<FieldBuilder>,
    options: FieldOptions,
}

impl FieldBuilder {
    fn new(name: &str, title: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_owned(),
            title: title.to_owned(),
            kind,
            sub_fields: Vec::new(),
            options: FieldOptions::default(),
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.options = self.options.mandatory();
        self
    }

    pub fn unique(mut self) -> Self {
        self.options = self.options.unique();
        self
    }

    /// Map the field to an element path other than its own name.
    pub fn at(mut self, element: &str) -> Self {
        self.options = self.options.at(element);
        self
    }

    pub fn build(self) -> IdmpResult<FieldDefinition> {
        let mut kind = self.kind;
        if !self.sub_fields.is_empty() {
            let built = self
                .sub_fields
                .into_iter()
                .map(FieldBuilder::build)
                .collect::<IdmpResult<Vec<_>>>()?;
            match &mut kind {
                FieldKind::Group { fields, .. } | FieldKind::Tree { fields, .. } => *fields = built,
                _ => {}
            }
        }
        define_field(kind, &self.name, &self.title, self.options)
    }
}

/// Build a list of fields, failing on the first invalid one.
pub fn build_all(fields: Vec<FieldBuilder>) -> IdmpResult<Vec<FieldDefinition>> {
    fields.into_iter().map(FieldBuilder::build).collect()
}

pub fn text(name: &str, title: &str, max_length: usize) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Text { max_length })
}

pub fn longtext(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::LongText)
}

pub fn date(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Date)
}

pub fn datetime(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::DateTime)
}

pub fn number(name: &str, title: &str, precision: u32) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Number { precision })
}

pub fn boolean(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Boolean)
}

pub fn select(name: &str, title: &str, options: &[&str]) -> FieldBuilder {
    FieldBuilder::new(
        name,
        title,
        FieldKind::Select {
            options: to_strings(options),
        },
    )
}

pub fn multi_select(name: &str, title: &str, options: &[&str]) -> FieldBuilder {
    FieldBuilder::new(
        name,
        title,
        FieldKind::MultiSelect {
            options: to_strings(options),
        },
    )
}

pub fn reference(name: &str, title: &str, targets: &[&str]) -> FieldBuilder {
    FieldBuilder::new(
        name,
        title,
        FieldKind::Reference {
            targets: to_strings(targets),
        },
    )
}

pub fn multi_reference(name: &str, title: &str, targets: &[&str]) -> FieldBuilder {
    FieldBuilder::new(
        name,
        title,
        FieldKind::MultiReference {
            targets: to_strings(targets),
        },
    )
}

pub fn choice(name: &str, title: &str, alternatives: Vec<ChoiceType>) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Choice { alternatives })
}

pub fn concept(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Concept { repeated: false })
}

pub fn concepts(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Concept { repeated: true })
}

pub fn quantity(name: &str, title: &str) -> FieldBuilder {
    FieldBuilder::new(name, title, FieldKind::Quantity)
}

pub fn group(name: &str, title: &str, fields: Vec<FieldBuilder>) -> FieldBuilder {
    let mut builder = FieldBuilder::new(
        name,
        title,
        FieldKind::Group {
            fields: Vec::new(),
            repeated: false,
        },
    );
    builder.sub_fields = fields;
    builder
}

pub fn groups(name: &str, title: &str, fields: Vec<FieldBuilder>) -> FieldBuilder {
    let mut builder = group(name, title, fields);
    builder.kind = FieldKind::Group {
        fields: Vec::new(),
        repeated: true,
    };
    builder
}

/// A recursive tree whose nested nodes are written under `children`.
pub fn tree(
    name: &str,
    title: &str,
    children: &str,
    max_depth: Option<usize>,
    fields: Vec<FieldBuilder>,
) -> FieldBuilder {
    let mut builder = FieldBuilder::new(
        name,
        title,
        FieldKind::Tree {
            fields: Vec::new(),
            children: children.to_owned(),
            max_depth,
        },
    );
    builder.sub_fields = fields;
    builder
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn is_false(flag: &bool) -> bool {
    !*flag
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

fn spec_error(field: &str, reason: impl Into<String>) -> IdmpError {
    IdmpError::InvalidFieldSpec {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

pub(crate) fn is_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_definition_at(def: &FieldDefinition, top_level: bool) -> IdmpResult<()> {
    let name = def.name.as_str();
    if name.is_empty() {
        return Err(spec_error(name, "name is empty"));
    }
    if !is_field_name(name) {
        return Err(spec_error(
            name,
            "name must start with a letter and contain only ASCII letters, digits or '_'",
        ));
    }
    if def.title.trim().is_empty() {
        return Err(spec_error(name, "title is empty"));
    }
    if def.unique && !top_level {
        return Err(spec_error(name, "nested fields cannot be unique"));
    }
    if def.unique && !def.kind.may_be_unique() {
        return Err(spec_error(
            name,
            format!("a {} field cannot be unique", def.kind.label()),
        ));
    }

    match &def.kind {
        FieldKind::Text { max_length } if *max_length == 0 => {
            return Err(spec_error(name, "text max length must be at least 1"));
        }
        FieldKind::Number { precision } if *precision > 28 => {
            return Err(spec_error(name, "number precision cannot exceed 28"));
        }
        FieldKind::Select { options } | FieldKind::MultiSelect { options } => {
            check_options(name, options)?;
        }
        FieldKind::Reference { targets } | FieldKind::MultiReference { targets } => {
            check_targets(name, targets)?;
        }
        FieldKind::Choice { alternatives } => {
            let distinct: HashSet<&str> = alternatives.iter().map(ChoiceType::suffix).collect();
            if distinct.len() < 2 || distinct.len() != alternatives.len() {
                return Err(spec_error(
                    name,
                    "a choice needs at least 2 distinct alternatives",
                ));
            }
            for alternative in alternatives {
                if let ChoiceType::Reference { targets } = alternative {
                    check_targets(name, targets)?;
                }
            }
            if def.element_path().leaf().is_repeated() {
                return Err(spec_error(name, "a choice element cannot be repeated"));
            }
        }
        FieldKind::Group { fields, .. } => check_sub_fields(name, fields)?,
        FieldKind::Tree {
            fields,
            children,
            max_depth,
        } => {
            check_sub_fields(name, fields)?;
            if !is_field_name(children) {
                return Err(spec_error(name, "tree children element is not a valid name"));
            }
            if fields
                .iter()
                .any(|f| f.element_path().root() == children.as_str())
            {
                return Err(spec_error(
                    name,
                    format!("tree children element '{children}' is also used by a sub-field"),
                ));
            }
            if *max_depth == Some(0) {
                return Err(spec_error(name, "tree max depth must be at least 1"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_options(name: &str, options: &[String]) -> IdmpResult<()> {
    if options.is_empty() {
        return Err(spec_error(name, "option set is empty"));
    }
    let mut seen = HashSet::new();
    for option in options {
        if option.trim().is_empty() {
            return Err(spec_error(name, "options cannot be empty"));
        }
        if !seen.insert(option.as_str()) {
            return Err(spec_error(name, format!("option '{option}' is duplicated")));
        }
    }
    Ok(())
}

fn check_targets(name: &str, targets: &[String]) -> IdmpResult<()> {
    if targets.is_empty() {
        return Err(spec_error(name, "reference needs at least one target type"));
    }
    if targets.iter().any(|t| t.trim().is_empty()) {
        return Err(spec_error(name, "reference target type is empty"));
    }
    Ok(())
}

fn check_sub_fields(name: &str, fields: &[FieldDefinition]) -> IdmpResult<()> {
    if fields.is_empty() {
        return Err(spec_error(name, "needs at least one sub-field"));
    }
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(spec_error(
                name,
                format!("sub-field '{}' is duplicated", field.name),
            ));
        }
        check_definition_at(field, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_spec_error(result: IdmpResult<FieldDefinition>, needle: &str) {
        match result {
            Err(IdmpError::InvalidFieldSpec { reason, .. }) => {
                assert!(reason.contains(needle), "unexpected reason: {reason}");
            }
            other => panic!("expected InvalidFieldSpec, got {other:?}"),
        }
    }

    #[test]
    fn defines_text_field_with_flags() {
        let field = define_field(
            FieldKind::Text { max_length: 255 },
            "identifier",
            "Identifier",
            FieldOptions::default().mandatory().unique().at("identifier[].value"),
        )
        .expect("valid field");

        assert!(field.mandatory);
        assert!(field.unique);
        assert_eq!(field.element_path().to_string(), "identifier[].value");
    }

    #[test]
    fn element_defaults_to_field_name() {
        let field = longtext("description", "Description").build().unwrap();
        assert_eq!(field.element_path().to_string(), "description");
    }

    #[test]
    fn rejects_empty_name_and_title() {
        expect_spec_error(text("", "Name", 10).build(), "name is empty");
        expect_spec_error(text("name", " ", 10).build(), "title is empty");
        expect_spec_error(text("product name", "Name", 10).build(), "ASCII");
    }

    #[test]
    fn rejects_zero_length_text() {
        expect_spec_error(text("name", "Name", 0).build(), "max length");
    }

    #[test]
    fn rejects_empty_reference_targets() {
        expect_spec_error(reference("subject", "Subject", &[]).build(), "target");
    }

    #[test]
    fn choice_needs_two_distinct_alternatives() {
        expect_spec_error(
            choice("value", "Value", vec![ChoiceType::Quantity]).build(),
            "at least 2",
        );
        expect_spec_error(
            choice("value", "Value", vec![ChoiceType::Boolean, ChoiceType::Boolean]).build(),
            "distinct",
        );
        assert!(choice(
            "value",
            "Value",
            vec![ChoiceType::Quantity, ChoiceType::CodeableConcept]
        )
        .build()
        .is_ok());
    }

    #[test]
    fn rejects_bad_options() {
        expect_spec_error(select("status", "Status", &[]).build(), "empty");
        expect_spec_error(select("status", "Status", &["a", "a"]).build(), "duplicated");
    }

    #[test]
    fn unique_only_on_scalar_kinds() {
        expect_spec_error(concepts("classification", "Classification").unique().build(), "unique");
        expect_spec_error(
            group("name", "Name", vec![text("productName", "Product name", 10).unique()]).build(),
            "nested",
        );
    }

    #[test]
    fn group_sub_fields_are_checked() {
        expect_spec_error(group("name", "Name", vec![]).build(), "sub-field");
        expect_spec_error(
            groups(
                "name",
                "Name",
                vec![text("productName", "A", 10), text("productName", "B", 10)],
            )
            .build(),
            "duplicated",
        );
    }

    #[test]
    fn tree_rejects_zero_depth_and_clashing_children() {
        expect_spec_error(
            tree("packaging", "Packaging", "packaging", Some(0), vec![concept("type", "Type")])
                .build(),
            "depth",
        );
        expect_spec_error(
            tree("packaging", "Packaging", "type", None, vec![concept("type", "Type")]).build(),
            "also used",
        );
    }

    #[test]
    fn rejects_malformed_element_path() {
        expect_spec_error(text("name", "Name", 10).at("name[").build(), "element path");
    }

    #[test]
    fn kind_serialises_as_tagged_yaml() {
        let field = number("molecularWeight", "Molecular weight", 2).build().unwrap();
        let yaml = serde_yaml::to_string(&field).unwrap();
        assert!(yaml.contains("type: number"));
        assert!(yaml.contains("precision: 2"));

        let back: FieldDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn reference_targets_include_choice_alternatives() {
        let field = choice(
            "value",
            "Value",
            vec![
                ChoiceType::Boolean,
                ChoiceType::Reference {
                    targets: vec!["Substance".into()],
                },
            ],
        )
        .build()
        .unwrap();
        assert_eq!(field.kind.reference_targets(), vec!["Substance"]);
    }
}
