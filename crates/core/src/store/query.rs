//! Search over stored instances.
//!
//! A [`Query`] is a conjunction of clauses on (possibly dotted) field paths. Each stored value
//! is reduced to the strings a searcher would type: option values, concept codes (alone and as
//! `system|code`) and text, reference ids (alone and as `Type/id`), formatted dates and numbers.

use super::ResourceInstance;
use crate::schema::ResourceType;
use crate::value::{ChoiceValue, FieldMap, FieldValue, TreeNode};
use crate::{IdmpError, IdmpResult};
use fhir::primitives::{format_date, format_datetime};
use fhir::{CodeableConcept, ResourceRef};
use rust_decimal::Decimal;
use std::cmp::Ordering;

// ============================================================================
// Public domain-level types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOp {
    /// Exact match. Concepts match on their codes only, bare or `system|code`.
    Equals,
    /// Case-insensitive substring match.
    Contains,
}

/// One predicate of a filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clause {
    /// Field name, dotted into groups and trees, e.g. `name.productName`.
    pub field: String,
    pub op: MatchOp,
    pub value: String,
}

impl Clause {
    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: MatchOp::Equals,
            value: value.into(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: MatchOp::Contains,
            value: value.into(),
        }
    }
}

/// A conjunction of clauses. The empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Search request for [`ResourceStore::query`](super::ResourceStore::query).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub filter: Filter,
    /// Insertion order when absent.
    pub sort: Option<SortKey>,
    /// No limit when absent.
    pub limit: Option<usize>,
    pub offset: usize,
    pub include_drafts: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(clause: Clause) -> Self {
        Self::new().and(clause)
    }

    pub fn and(mut self, clause: Clause) -> Self {
        self.filter.clauses.push(clause);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort = Some(SortKey {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn with_drafts(mut self) -> Self {
        self.include_drafts = true;
        self
    }
}

/// One page of results plus the number of matches before paging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPage {
    pub items: Vec<ResourceInstance>,
    pub total: usize,
}

// ============================================================================
// Query evaluation (crate-internal)
// ============================================================================

/// Reject clauses and sort keys naming fields the type does not have.
pub(crate) fn check_query(resource_type: &ResourceType, query: &Query) -> IdmpResult<()> {
    let fields = query
        .filter
        .clauses
        .iter()
        .map(|c| c.field.as_str())
        .chain(query.sort.iter().map(|s| s.field.as_str()));
    for field in fields {
        if resource_type.field_path(field).is_none() {
            return Err(IdmpError::InvalidInput(format!(
                "{} has no searchable field '{field}'",
                resource_type.name
            )));
        }
    }
    Ok(())
}

pub(crate) fn matches(instance: &ResourceInstance, query: &Query) -> bool {
    if !query.include_drafts && !instance.published {
        return false;
    }
    query.filter.clauses.iter().all(|clause| {
        let needle = clause.value.to_lowercase();
        let values = values_at(&instance.fields, &clause.field).into_iter();
        match clause.op {
            MatchOp::Equals => values.flat_map(equality_terms).any(|t| t == clause.value),
            MatchOp::Contains => values
                .flat_map(search_terms)
                .any(|t| t.to_lowercase().contains(&needle)),
        }
    })
}

/// Stable sort by `key`; instances without a value go last in either direction.
pub(crate) fn sort(items: &mut [ResourceInstance], key: &SortKey) {
    items.sort_by_cached_key(|instance| {
        let value = values_at(&instance.fields, &key.field)
            .into_iter()
            .find_map(sort_value);
        SortSlot {
            value,
            descending: key.descending,
        }
    });
}

/// The scalar text of a value, used for uniqueness checks.
pub(crate) fn scalar_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(s) | FieldValue::Select(s) => Some(s.clone()),
        FieldValue::Number(n) => Some(n.normalize().to_string()),
        FieldValue::Date(d) => Some(format_date(*d)),
        _ => None,
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Number(Decimal),
    Text(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SortSlot {
    value: Option<SortValue>,
    descending: bool,
}

impl PartialOrd for SortSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.value, &other.value) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) if self.descending => b.cmp(a),
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

/// Every value reachable from `fields` along a dotted path.
fn values_at<'a>(fields: &'a FieldMap, path: &str) -> Vec<&'a FieldValue> {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return Vec::new();
    };
    let mut current: Vec<&FieldValue> = fields.get(first).into_iter().collect();
    for part in parts {
        current = current
            .into_iter()
            .flat_map(|value| nested(value, part))
            .collect();
    }
    current
}

fn nested<'a>(value: &'a FieldValue, name: &str) -> Vec<&'a FieldValue> {
    match value {
        FieldValue::Group(map) => map.get(name).into_iter().collect(),
        FieldValue::Groups(maps) => maps.iter().filter_map(|m| m.get(name)).collect(),
        FieldValue::Tree(nodes) => {
            let mut found = Vec::new();
            collect_tree(nodes, name, &mut found);
            found
        }
        _ => Vec::new(),
    }
}

fn collect_tree<'a>(nodes: &'a [TreeNode], name: &str, found: &mut Vec<&'a FieldValue>) {
    for node in nodes {
        if let Some(value) = node.fields.get(name) {
            found.push(value);
        }
        collect_tree(&node.children, name, found);
    }
}

fn search_terms(value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::Text(s) | FieldValue::Select(s) => vec![s.clone()],
        FieldValue::MultiSelect(options) => options.clone(),
        FieldValue::Number(n) => vec![n.to_string(), n.normalize().to_string()],
        FieldValue::Boolean(b) => vec![b.to_string()],
        FieldValue::Date(d) => vec![format_date(*d)],
        FieldValue::DateTime(dt) => vec![format_datetime(dt)],
        FieldValue::Reference(r) => reference_terms(r),
        FieldValue::MultiReference(refs) => refs.iter().flat_map(reference_terms).collect(),
        FieldValue::Concept(c) => concept_terms(c),
        FieldValue::Concepts(cs) => cs.iter().flat_map(concept_terms).collect(),
        FieldValue::Quantity(q) => q.value.iter().map(Decimal::to_string).collect(),
        FieldValue::Choice(choice) => match choice {
            ChoiceValue::Quantity(q) => q.value.iter().map(Decimal::to_string).collect(),
            ChoiceValue::CodeableConcept(c) => concept_terms(c),
            ChoiceValue::Boolean(b) => vec![b.to_string()],
            ChoiceValue::String(s) | ChoiceValue::Markdown(s) => vec![s.clone()],
            ChoiceValue::Integer(i) => vec![i.to_string()],
            ChoiceValue::Date(d) => vec![format_date(*d)],
            ChoiceValue::DateTime(dt) => vec![format_datetime(dt)],
            ChoiceValue::Reference(r) => reference_terms(r),
        },
        FieldValue::Group(_) | FieldValue::Groups(_) | FieldValue::Tree(_) => Vec::new(),
    }
}

/// Terms an exact match compares against; concept text and displays are left out.
fn equality_terms(value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::Concept(c) | FieldValue::Choice(ChoiceValue::CodeableConcept(c)) => {
            code_terms(c)
        }
        FieldValue::Concepts(cs) => cs.iter().flat_map(code_terms).collect(),
        other => search_terms(other),
    }
}

fn reference_terms(reference: &ResourceRef) -> Vec<String> {
    vec![reference.id.to_string(), reference.reference()]
}

fn concept_terms(concept: &CodeableConcept) -> Vec<String> {
    let mut terms: Vec<String> = concept.text.iter().cloned().collect();
    terms.extend(code_terms(concept));
    terms.extend(concept.coding.iter().filter_map(|c| c.display.clone()));
    terms
}

fn code_terms(concept: &CodeableConcept) -> Vec<String> {
    let mut terms = Vec::new();
    for coding in &concept.coding {
        if let Some(code) = &coding.code {
            terms.push(code.clone());
            if let Some(system) = &coding.system {
                terms.push(format!("{system}|{code}"));
            }
        }
    }
    terms
}

fn sort_value(value: &FieldValue) -> Option<SortValue> {
    match value {
        FieldValue::Number(n) => Some(SortValue::Number(*n)),
        FieldValue::Quantity(q) => q.value.map(SortValue::Number),
        other => search_terms(other).into_iter().next().map(SortValue::Text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fhir::Coding;
    use idmp_types::{Location, ResourceKey};
    use idmp_uuid::ResourceId;

    fn groups(names: &[&str]) -> FieldValue {
        FieldValue::Groups(
            names
                .iter()
                .map(|n| {
                    FieldMap::from([("productName".to_owned(), FieldValue::text(*n))])
                })
                .collect(),
        )
    }

    #[test]
    fn dotted_paths_reach_into_repeated_groups() {
        let fields = FieldMap::from([("name".to_owned(), groups(&["Doliprane", "Paracetamol"]))]);
        let found = values_at(&fields, "name.productName");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn concept_terms_include_system_qualified_codes() {
        let concept = CodeableConcept::from_coding(
            Coding::new("http://www.whocc.no/atc", "N02BE01").with_display("paracetamol"),
        );
        let terms = concept_terms(&concept);
        assert!(terms.contains(&"N02BE01".to_owned()));
        assert!(terms.contains(&"http://www.whocc.no/atc|N02BE01".to_owned()));
        assert!(terms.contains(&"paracetamol".to_owned()));
    }

    #[test]
    fn exact_concept_match_ignores_text_and_display() {
        let mut concept = CodeableConcept::from_coding(
            Coding::new("http://www.whocc.no/atc", "X").with_display("N02BE01"),
        );
        concept.text = Some("N02BE01".into());
        let instance = ResourceInstance {
            id: ResourceId::new(),
            resource_type: "MedicinalProduct".into(),
            key: ResourceKey::new("doliprane").unwrap(),
            parent: Location::root(),
            published: true,
            fields: FieldMap::from([("classification".to_owned(), FieldValue::Concept(concept))]),
            version: 1,
            sequence: 0,
            last_updated: Utc::now(),
        };

        let equals = Query::matching(Clause::equals("classification", "N02BE01"));
        assert!(!matches(&instance, &equals));
        let by_code = Query::matching(Clause::equals("classification", "X"));
        assert!(matches(&instance, &by_code));
        let qualified =
            Query::matching(Clause::equals("classification", "http://www.whocc.no/atc|X"));
        assert!(matches(&instance, &qualified));
        let contains = Query::matching(Clause::contains("classification", "n02be"));
        assert!(matches(&instance, &contains));
    }

    #[test]
    fn missing_sort_values_go_last_both_ways() {
        let present = SortSlot {
            value: Some(SortValue::Text("a".into())),
            descending: true,
        };
        let missing = SortSlot {
            value: None,
            descending: true,
        };
        assert_eq!(present.cmp(&missing), Ordering::Less);
        assert_eq!(missing.cmp(&present), Ordering::Greater);
    }
}
