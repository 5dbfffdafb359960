//! Field values held by resource instances.
//!
//! Values are embedded: they belong to the instance that holds them and are stored inline.
//! References to other instances are weak ([`ResourceRef`]) and never own their target.

use crate::catalog::{ChoiceType, FieldKind};
use crate::{IdmpError, IdmpResult};
use chrono::{DateTime, FixedOffset, NaiveDate};
use fhir::{CodeableConcept, Quantity, ResourceRef};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field values keyed by field name.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A populated field value. Each variant corresponds to one [`FieldKind`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Text and long text.
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    Number(Decimal),
    Boolean(bool),
    Select(String),
    MultiSelect(Vec<String>),
    Reference(ResourceRef),
    MultiReference(Vec<ResourceRef>),
    Choice(ChoiceValue),
    Concept(CodeableConcept),
    Concepts(Vec<CodeableConcept>),
    Quantity(Quantity),
    Group(FieldMap),
    Groups(Vec<FieldMap>),
    Tree(Vec<TreeNode>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// True for values that carry nothing and are dropped on write.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) | FieldValue::Select(s) => s.is_empty(),
            FieldValue::MultiSelect(v) => v.is_empty(),
            FieldValue::MultiReference(v) => v.is_empty(),
            FieldValue::Concept(c) => c.is_empty(),
            FieldValue::Concepts(v) => v.is_empty(),
            FieldValue::Quantity(q) => q == &Quantity::default(),
            FieldValue::Group(map) => map.values().all(FieldValue::is_empty),
            FieldValue::Groups(v) => v.is_empty(),
            FieldValue::Tree(nodes) => nodes.is_empty(),
            FieldValue::Date(_)
            | FieldValue::DateTime(_)
            | FieldValue::Number(_)
            | FieldValue::Boolean(_)
            | FieldValue::Reference(_)
            | FieldValue::Choice(_) => false,
        }
    }

    /// Short name used in messages.
    pub fn label(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Date(_) => "date",
            FieldValue::DateTime(_) => "date-time",
            FieldValue::Number(_) => "number",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Select(_) => "select",
            FieldValue::MultiSelect(_) => "multi-select",
            FieldValue::Reference(_) => "reference",
            FieldValue::MultiReference(_) => "multi-reference",
            FieldValue::Choice(_) => "choice",
            FieldValue::Concept(_) => "concept",
            FieldValue::Concepts(_) => "concepts",
            FieldValue::Quantity(_) => "quantity",
            FieldValue::Group(_) => "group",
            FieldValue::Groups(_) => "groups",
            FieldValue::Tree(_) => "tree",
        }
    }

    /// True when this value has the shape `kind` expects. Constraints are checked elsewhere.
    pub fn fits(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (FieldValue::Text(_), FieldKind::Text { .. } | FieldKind::LongText)
                | (FieldValue::Date(_), FieldKind::Date)
                | (FieldValue::DateTime(_), FieldKind::DateTime)
                | (FieldValue::Number(_), FieldKind::Number { .. })
                | (FieldValue::Boolean(_), FieldKind::Boolean)
                | (FieldValue::Select(_), FieldKind::Select { .. })
                | (FieldValue::MultiSelect(_), FieldKind::MultiSelect { .. })
                | (FieldValue::Reference(_), FieldKind::Reference { .. })
                | (FieldValue::MultiReference(_), FieldKind::MultiReference { .. })
                | (FieldValue::Choice(_), FieldKind::Choice { .. })
                | (FieldValue::Concept(_), FieldKind::Concept { repeated: false })
                | (FieldValue::Concepts(_), FieldKind::Concept { repeated: true })
                | (FieldValue::Quantity(_), FieldKind::Quantity)
                | (FieldValue::Group(_), FieldKind::Group { repeated: false, .. })
                | (FieldValue::Groups(_), FieldKind::Group { repeated: true, .. })
                | (FieldValue::Tree(_), FieldKind::Tree { .. })
        )
    }
}

/// The populated alternative of a choice field.
///
/// Holding exactly one variant makes "two alternatives populated" unrepresentable once built;
/// see [`ChoiceBuilder`] for assembling a value from optional parts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceValue {
    Quantity(Quantity),
    CodeableConcept(CodeableConcept),
    Boolean(bool),
    String(String),
    Integer(i64),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    Markdown(String),
    Reference(ResourceRef),
}

impl ChoiceValue {
    /// The element-name suffix for this alternative, e.g. `Quantity` in `valueQuantity`.
    pub fn suffix(&self) -> &'static str {
        match self {
            ChoiceValue::Quantity(_) => "Quantity",
            ChoiceValue::CodeableConcept(_) => "CodeableConcept",
            ChoiceValue::Boolean(_) => "Boolean",
            ChoiceValue::String(_) => "String",
            ChoiceValue::Integer(_) => "Integer",
            ChoiceValue::Date(_) => "Date",
            ChoiceValue::DateTime(_) => "DateTime",
            ChoiceValue::Markdown(_) => "Markdown",
            ChoiceValue::Reference(_) => "Reference",
        }
    }

    /// The declared alternative this value populates, if allowed.
    pub fn alternative<'a>(&self, alternatives: &'a [ChoiceType]) -> Option<&'a ChoiceType> {
        alternatives.iter().find(|a| a.suffix() == self.suffix())
    }
}

/// Assembles a choice value from independently optional alternatives.
#[derive(Clone, Debug, Default)]
pub struct ChoiceBuilder {
    populated: Vec<ChoiceValue>,
}

impl ChoiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: ChoiceValue) -> Self {
        self.populated.push(value);
        self
    }

    /// Add an alternative only when present.
    pub fn with_opt(self, value: Option<ChoiceValue>) -> Self {
        match value {
            Some(value) => self.with(value),
            None => self,
        }
    }

    /// Finish the value for `field`.
    ///
    /// # Errors
    ///
    /// Returns [`IdmpError::AmbiguousChoice`] when more than one alternative is populated.
    pub fn build(mut self, field: &str) -> IdmpResult<Option<ChoiceValue>> {
        match self.populated.len() {
            0 => Ok(None),
            1 => Ok(self.populated.pop()),
            _ => Err(IdmpError::AmbiguousChoice {
                field: field.to_owned(),
                reason: format!(
                    "alternatives {} are all populated",
                    self.populated
                        .iter()
                        .map(|v| format!("{field}{}", v.suffix()))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
        }
    }
}

/// One node of a recursive tree field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(fields: FieldMap) -> Self {
        Self {
            fields,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: TreeNode) -> Self {
        self.children.push(child);
        self
    }

    /// Number of levels from this node down to its deepest descendant, counting itself.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(TreeNode::depth).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::Coding;
    use std::str::FromStr;

    #[test]
    fn choice_builder_accepts_one_alternative() {
        let value = ChoiceBuilder::new()
            .with(ChoiceValue::Boolean(true))
            .with_opt(None)
            .build("value")
            .expect("one alternative is fine");
        assert_eq!(value, Some(ChoiceValue::Boolean(true)));
        assert_eq!(ChoiceBuilder::new().build("value").unwrap(), None);
    }

    #[test]
    fn choice_builder_rejects_two_alternatives() {
        let err = ChoiceBuilder::new()
            .with(ChoiceValue::Quantity(Quantity::ucum(
                Decimal::from_str("500").unwrap(),
                "mg",
            )))
            .with(ChoiceValue::CodeableConcept(CodeableConcept::from_text("tablet")))
            .build("value")
            .expect_err("two alternatives must fail");

        match err {
            IdmpError::AmbiguousChoice { field, reason } => {
                assert_eq!(field, "value");
                assert!(reason.contains("valueQuantity"));
                assert!(reason.contains("valueCodeableConcept"));
            }
            other => panic!("expected AmbiguousChoice, got {other:?}"),
        }
    }

    #[test]
    fn tree_depth_counts_levels() {
        let leaf = TreeNode::default();
        let middle = TreeNode::default().with_child(leaf.clone());
        let root = TreeNode::default().with_child(middle).with_child(leaf);
        assert_eq!(root.depth(), 3);
        assert_eq!(TreeNode::default().depth(), 1);
    }

    #[test]
    fn empty_values() {
        assert!(FieldValue::text("").is_empty());
        assert!(FieldValue::Concepts(Vec::new()).is_empty());
        assert!(FieldValue::Concept(CodeableConcept::default()).is_empty());
        assert!(FieldValue::Group(FieldMap::new()).is_empty());
        assert!(!FieldValue::Boolean(false).is_empty());
        let coded = CodeableConcept::from_coding(Coding::new("s", "c"));
        assert!(!FieldValue::Concept(coded).is_empty());
    }

    #[test]
    fn values_fit_their_kinds() {
        assert!(FieldValue::text("x").fits(&FieldKind::LongText));
        assert!(FieldValue::Concepts(Vec::new()).fits(&FieldKind::Concept { repeated: true }));
        assert!(!FieldValue::Concepts(Vec::new()).fits(&FieldKind::Concept { repeated: false }));
        assert!(!FieldValue::Boolean(true).fits(&FieldKind::Text { max_length: 5 }));
    }

    #[test]
    fn stored_form_keeps_decimal_scale() {
        let value = FieldValue::Number(Decimal::from_str("151.170").unwrap());
        let json = serde_json::to_string(&value).unwrap();
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        match back {
            FieldValue::Number(d) => assert_eq!(d.scale(), 3),
            other => panic!("expected number, got {other:?}"),
        }
    }
}
