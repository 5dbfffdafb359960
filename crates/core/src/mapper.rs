//! Schema-driven FHIR mapping.
//!
//! Converts between stored [`ResourceInstance`]s and FHIR JSON documents using the element path
//! of each field (see [`crate::path`]). Nothing here is specific to one resource type: the
//! registered schema decides where every value goes.
//!
//! Writing (`to_document`):
//! - `resourceType`, `id` and `meta` come first, then fields in definition order
//! - a multi-valued field fans out into one array entry per value at its first repeated segment,
//!   or becomes a JSON array at the leaf when no segment repeats
//! - a choice field writes exactly one `<leaf><Type>` member
//!
//! Reading (`from_document`) is strict: more than one value for a single-valued field is an
//! [`IdmpError::AmbiguousChoice`], never a first-match guess, and unknown members are reported.
//! Every problem in a document is collected and returned at once as [`IdmpError::Document`].

use crate::catalog::{ChoiceType, FieldDefinition, FieldKind};
use crate::constants::DEFAULT_MAX_TREE_DEPTH;
use crate::path::{ElementPath, Repeat, Segment};
use crate::schema::{ResourceType, SchemaRegistry};
use crate::store::ResourceInstance;
use crate::validate::Validation;
use crate::value::{ChoiceBuilder, ChoiceValue, FieldMap, FieldValue, TreeNode};
use crate::{IdmpError, IdmpResult};
use fhir::primitives::{
    decimal_from_json, decimal_to_json, format_date, format_datetime, format_instant,
    integer_from_json, parse_date, parse_datetime,
};
use fhir::{CodeableConcept, FhirError, Quantity, ResourceRef};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Resource-level members that are not fields.
const RESOURCE_MEMBERS: [&str; 9] = [
    "resourceType",
    "id",
    "meta",
    "implicitRules",
    "language",
    "text",
    "contained",
    "extension",
    "modifierExtension",
];

/// Members any nested element may carry.
const ELEMENT_MEMBERS: [&str; 3] = ["id", "extension", "modifierExtension"];

/// Maps instances of registered types to and from FHIR JSON.
#[derive(Debug, Clone, Copy)]
pub struct FhirMapper<'a> {
    registry: &'a SchemaRegistry,
    max_tree_depth: usize,
}

impl<'a> FhirMapper<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
        }
    }

    /// Depth used for trees without their own `max_depth`, normally `CoreConfig::max_tree_depth`.
    pub fn with_max_tree_depth(mut self, max_tree_depth: usize) -> Self {
        self.max_tree_depth = max_tree_depth;
        self
    }

    /// Render `instance` as a FHIR JSON document.
    ///
    /// # Errors
    ///
    /// `UnsupportedResourceType` when the instance's type is no longer registered and
    /// `InvalidInput` when two fields are mapped onto the same element.
    pub fn to_document(&self, instance: &ResourceInstance) -> IdmpResult<Value> {
        let resource_type = self.resource_type(&instance.resource_type)?;

        let mut document = Map::new();
        document.insert("resourceType".into(), resource_type.name.clone().into());
        document.insert("id".into(), instance.id.to_string().into());

        let mut meta = Map::new();
        meta.insert("versionId".into(), instance.version.to_string().into());
        meta.insert(
            "lastUpdated".into(),
            format_instant(&instance.last_updated).into(),
        );
        document.insert("meta".into(), Value::Object(meta));

        write_fields(&mut document, &resource_type.fields, &instance.fields)?;
        Ok(Value::Object(document))
    }

    /// Read the field values of a FHIR JSON document.
    ///
    /// The returned map is validated for shape, constraints and mandatory fields; references are
    /// not resolved (the store does that on write).
    ///
    /// # Errors
    ///
    /// - `UnsupportedResourceType` for a missing, non-string or unregistered `resourceType`
    /// - `Document` listing every `TypeMismatch`, `AmbiguousChoice`, `MissingRequiredField` and
    ///   `TreeDepthExceeded` found
    pub fn from_document(&self, document: &Value) -> IdmpResult<FieldMap> {
        let name = document
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| IdmpError::UnsupportedResourceType("<missing resourceType>".into()))?;
        let resource_type = self.resource_type(name)?;
        let object = document
            .as_object()
            .ok_or_else(|| IdmpError::InvalidInput("document must be a JSON object".into()))?;

        let mut errors = Vec::new();
        let fields = read_fields(object, &resource_type.fields, "", &mut errors);
        check_members(object, &resource_type.fields, &RESOURCE_MEMBERS, "", None, &mut errors);

        let validated = match Validation::detached(self.max_tree_depth).validate(
            &resource_type.name,
            &resource_type.fields,
            fields,
        ) {
            Ok(validated) => Some(validated),
            Err(err) => {
                errors.extend(err.into_problems());
                None
            }
        };

        match validated {
            Some(validated) if errors.is_empty() => Ok(validated),
            _ => Err(IdmpError::Document(errors)),
        }
    }

    fn resource_type(&self, name: &str) -> IdmpResult<ResourceType> {
        self.registry.get(name).map_err(|err| match err {
            IdmpError::NotFound(_) => IdmpError::UnsupportedResourceType(name.to_owned()),
            other => other,
        })
    }
}

// ============================================================================
// Writing (internal)
// ============================================================================

fn write_fields(
    target: &mut Map<String, Value>,
    definitions: &[FieldDefinition],
    fields: &FieldMap,
) -> IdmpResult<()> {
    for definition in definitions {
        let Some(value) = fields.get(&definition.name) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }

        let path = definition.element_path();
        let segments = match value {
            FieldValue::Choice(choice) => choice_segments(&path, choice.suffix()),
            _ => path.segments().to_vec(),
        };
        let items = value_to_json(definition, value)?;

        if !definition.kind.is_multi() {
            for item in items {
                place(target, &segments, item, &definition.name)?;
            }
        } else if path.first_repeated().is_some() {
            for item in items {
                place(target, &segments, item, &definition.name)?;
            }
        } else {
            place(target, &segments, Value::Array(items), &definition.name)?;
        }
    }
    Ok(())
}

/// JSON for a value: one entry per item for multi-valued kinds, exactly one otherwise.
fn value_to_json(definition: &FieldDefinition, value: &FieldValue) -> IdmpResult<Vec<Value>> {
    let items = match (value, &definition.kind) {
        (FieldValue::Text(s) | FieldValue::Select(s), _) => vec![Value::from(s.as_str())],
        (FieldValue::MultiSelect(options), _) => {
            options.iter().map(|o| Value::from(o.as_str())).collect()
        }
        (FieldValue::Date(d), _) => vec![format_date(*d).into()],
        (FieldValue::DateTime(dt), _) => vec![format_datetime(dt).into()],
        (FieldValue::Number(n), _) => vec![decimal_to_json(n)?],
        (FieldValue::Boolean(b), _) => vec![Value::Bool(*b)],
        (FieldValue::Reference(r), _) => vec![r.to_json()],
        (FieldValue::MultiReference(refs), _) => refs.iter().map(ResourceRef::to_json).collect(),
        (FieldValue::Concept(c), _) => vec![c.to_json()],
        (FieldValue::Concepts(cs), _) => cs.iter().map(CodeableConcept::to_json).collect(),
        (FieldValue::Quantity(q), _) => vec![q.to_json()?],
        (FieldValue::Choice(choice), _) => vec![choice_to_json(choice)?],
        (FieldValue::Group(map), kind) => vec![group_to_json(kind.sub_fields(), map)?],
        (FieldValue::Groups(maps), kind) => maps
            .iter()
            .map(|map| group_to_json(kind.sub_fields(), map))
            .collect::<IdmpResult<_>>()?,
        (FieldValue::Tree(nodes), FieldKind::Tree { fields, children, .. }) => nodes
            .iter()
            .map(|node| node_to_json(fields, children, node))
            .collect::<IdmpResult<_>>()?,
        (FieldValue::Tree(_), kind) => {
            return Err(mismatch(
                &definition.name,
                format!("tree value on a {} field", kind.label()),
            ))
        }
    };
    Ok(items)
}

fn choice_to_json(choice: &ChoiceValue) -> IdmpResult<Value> {
    Ok(match choice {
        ChoiceValue::Quantity(q) => q.to_json()?,
        ChoiceValue::CodeableConcept(c) => c.to_json(),
        ChoiceValue::Boolean(b) => Value::Bool(*b),
        ChoiceValue::String(s) | ChoiceValue::Markdown(s) => Value::from(s.as_str()),
        ChoiceValue::Integer(i) => Value::from(*i),
        ChoiceValue::Date(d) => format_date(*d).into(),
        ChoiceValue::DateTime(dt) => format_datetime(dt).into(),
        ChoiceValue::Reference(r) => r.to_json(),
    })
}

fn group_to_json(definitions: &[FieldDefinition], fields: &FieldMap) -> IdmpResult<Value> {
    let mut object = Map::new();
    write_fields(&mut object, definitions, fields)?;
    Ok(Value::Object(object))
}

fn node_to_json(
    definitions: &[FieldDefinition],
    children: &str,
    node: &TreeNode,
) -> IdmpResult<Value> {
    let mut object = Map::new();
    write_fields(&mut object, definitions, &node.fields)?;
    if !node.children.is_empty() {
        let nested = node
            .children
            .iter()
            .map(|child| node_to_json(definitions, children, child))
            .collect::<IdmpResult<Vec<_>>>()?;
        object.insert(children.to_owned(), Value::Array(nested));
    }
    Ok(Value::Object(object))
}

/// Write `value` at `segments` below `target`.
fn place(
    target: &mut Map<String, Value>,
    segments: &[Segment],
    value: Value,
    field: &str,
) -> IdmpResult<()> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(());
    };

    if rest.is_empty() {
        return match &segment.repeat {
            Repeat::Single => {
                if target.contains_key(&segment.name) {
                    return Err(conflict(field, &segment.name));
                }
                target.insert(segment.name.clone(), value);
                Ok(())
            }
            Repeat::Repeated => {
                array_at(target, &segment.name, field)?.push(value);
                Ok(())
            }
            Repeat::Discriminated { key, value: fixed } => {
                let Value::Object(mut entry) = value else {
                    return Err(mismatch(
                        field,
                        format!("only objects can carry the discriminator {key}={fixed}"),
                    ));
                };
                entry.insert(key.clone(), Value::String(fixed.clone()));
                array_at(target, &segment.name, field)?.push(Value::Object(entry));
                Ok(())
            }
        };
    }

    let next = match &segment.repeat {
        Repeat::Single => target
            .entry(segment.name.clone())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| conflict(field, &segment.name))?,
        Repeat::Repeated | Repeat::Discriminated { .. } => {
            let mut entry = Map::new();
            if let Some((key, fixed)) = segment.discriminator() {
                entry.insert(key.to_owned(), Value::String(fixed.to_owned()));
            }
            let array = array_at(target, &segment.name, field)?;
            array.push(Value::Object(entry));
            array
                .last_mut()
                .and_then(Value::as_object_mut)
                .ok_or_else(|| conflict(field, &segment.name))?
        }
    };
    place(next, rest, value, field)
}

fn array_at<'m>(
    target: &'m mut Map<String, Value>,
    name: &str,
    field: &str,
) -> IdmpResult<&'m mut Vec<Value>> {
    target
        .entry(name.to_owned())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| conflict(field, name))
}

// ============================================================================
// Reading (internal)
// ============================================================================

fn read_fields(
    source: &Map<String, Value>,
    definitions: &[FieldDefinition],
    prefix: &str,
    errors: &mut Vec<IdmpError>,
) -> FieldMap {
    let siblings: Vec<ElementPath> = definitions
        .iter()
        .map(|d| d.element_path().into_owned())
        .collect();

    let mut fields = FieldMap::new();
    for (index, definition) in definitions.iter().enumerate() {
        let field = join(prefix, &definition.name);
        let claims = SiblingClaims {
            paths: &siblings,
            own: index,
        };
        match read_field(source, definition, &claims, &field, errors) {
            Ok(Some(value)) => {
                fields.insert(definition.name.clone(), value);
            }
            Ok(None) => {}
            Err(err) => errors.push(err),
        }
    }
    fields
}

/// Element paths of the fields declared next to the one being read.
struct SiblingClaims<'s> {
    paths: &'s [ElementPath],
    own: usize,
}

impl SiblingClaims<'_> {
    /// Discriminators other fields use on the array at `depth` of the own path.
    fn at(&self, depth: usize) -> Vec<(&str, &str)> {
        let own = &self.paths[self.own];
        self.paths
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.own)
            .filter_map(|(_, other)| {
                let shares_prefix = other.segments().len() > depth
                    && own.segments().len() > depth
                    && own.segments()[..=depth]
                        .iter()
                        .zip(&other.segments()[..=depth])
                        .all(|(a, b)| a.name == b.name);
                if shares_prefix {
                    other.segments()[depth].discriminator()
                } else {
                    None
                }
            })
            .collect()
    }
}

fn read_field(
    source: &Map<String, Value>,
    definition: &FieldDefinition,
    claims: &SiblingClaims<'_>,
    field: &str,
    errors: &mut Vec<IdmpError>,
) -> IdmpResult<Option<FieldValue>> {
    let path = definition.element_path();

    if let FieldKind::Choice { alternatives } = &definition.kind {
        return read_choice(source, &path, alternatives, claims, field);
    }

    let candidates = collect(source, path.segments(), claims, 0).map_err(|r| mismatch(field, r))?;
    if candidates.is_empty() {
        return Ok(None);
    }

    if !definition.kind.is_multi() {
        if candidates.len() > 1 {
            return Err(IdmpError::AmbiguousChoice {
                field: field.to_owned(),
                reason: format!(
                    "{} values found at {path} for a single-valued field",
                    candidates.len()
                ),
            });
        }
        return single_from_json(&definition.kind, &candidates[0], field, errors).map(Some);
    }

    let items: Vec<Value> = if path.first_repeated().is_some() {
        candidates
    } else {
        match candidates.into_iter().next() {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(mismatch(field, format!("expected an array, got {}", json_kind(&other))))
            }
            None => Vec::new(),
        }
    };
    multi_from_json(&definition.kind, &items, field, errors).map(Some)
}

fn read_choice(
    source: &Map<String, Value>,
    path: &ElementPath,
    alternatives: &[ChoiceType],
    claims: &SiblingClaims<'_>,
    field: &str,
) -> IdmpResult<Option<FieldValue>> {
    let mut builder = ChoiceBuilder::new();
    let mut found = 0usize;

    for suffix in ChoiceType::SUFFIXES {
        let segments = choice_segments(path, suffix);
        let member = &segments[segments.len() - 1].name;
        let values = collect(source, &segments, claims, 0).map_err(|r| mismatch(field, r))?;
        for value in values {
            found += 1;
            let Some(alternative) = alternatives.iter().find(|a| a.suffix() == suffix) else {
                return Err(mismatch(
                    field,
                    format!(
                        "{member} is not an allowed alternative [{}]",
                        alternatives
                            .iter()
                            .map(ChoiceType::suffix)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ));
            };
            let converted =
                choice_from_json(alternative, &value).map_err(|e| fhir_mismatch(member, e))?;
            builder = builder.with(converted);
        }
    }

    if found == 0 {
        return Ok(None);
    }
    Ok(builder.build(field)?.map(FieldValue::Choice))
}

/// Every value at `segments` below `source`, honouring discriminators.
fn collect(
    source: &Map<String, Value>,
    segments: &[Segment],
    claims: &SiblingClaims<'_>,
    depth: usize,
) -> Result<Vec<Value>, String> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(Vec::new());
    };
    let Some(node) = source.get(&segment.name) else {
        return Ok(Vec::new());
    };

    let entries: Vec<&Value> = match &segment.repeat {
        Repeat::Single => vec![node],
        Repeat::Repeated => {
            let claimed = claims.at(depth);
            as_array(node, &segment.name)?
                .iter()
                .filter(|entry| !claimed.iter().any(|(k, v)| carries(entry, k, v)))
                .collect()
        }
        Repeat::Discriminated { key, value } => as_array(node, &segment.name)?
            .iter()
            .filter(|entry| carries(entry, key, value))
            .collect(),
    };

    if rest.is_empty() {
        return Ok(entries
            .into_iter()
            .map(|entry| match (segment.discriminator(), entry) {
                (Some((key, _)), Value::Object(object)) => {
                    let mut stripped = object.clone();
                    stripped.remove(key);
                    Value::Object(stripped)
                }
                _ => entry.clone(),
            })
            .collect());
    }

    let mut found = Vec::new();
    for entry in entries {
        let object = entry
            .as_object()
            .ok_or_else(|| {
                format!(
                    "expected an object at {}, got {}",
                    segment.name,
                    json_kind(entry)
                )
            })?;
        found.extend(collect(object, rest, claims, depth + 1)?);
    }
    Ok(found)
}

fn single_from_json(
    kind: &FieldKind,
    value: &Value,
    field: &str,
    errors: &mut Vec<IdmpError>,
) -> IdmpResult<FieldValue> {
    Ok(match kind {
        FieldKind::Text { .. } | FieldKind::LongText => FieldValue::Text(as_string(value, field)?),
        FieldKind::Select { .. } => FieldValue::Select(as_string(value, field)?),
        FieldKind::Date => FieldValue::Date(
            parse_date(&as_string(value, field)?).map_err(|e| fhir_mismatch(field, e))?,
        ),
        FieldKind::DateTime => FieldValue::DateTime(
            parse_datetime(&as_string(value, field)?).map_err(|e| fhir_mismatch(field, e))?,
        ),
        FieldKind::Number { .. } => {
            FieldValue::Number(decimal_from_json(value).map_err(|e| fhir_mismatch(field, e))?)
        }
        FieldKind::Boolean => FieldValue::Boolean(value.as_bool().ok_or_else(|| {
            mismatch(field, format!("expected a boolean, got {}", json_kind(value)))
        })?),
        FieldKind::Reference { .. } => {
            let reference = ResourceRef::from_json(value).map_err(|e| fhir_mismatch(field, e))?;
            FieldValue::Reference(reference)
        }
        FieldKind::Concept { .. } => FieldValue::Concept(
            CodeableConcept::from_json(value).map_err(|e| fhir_mismatch(field, e))?,
        ),
        FieldKind::Quantity => {
            FieldValue::Quantity(Quantity::from_json(value).map_err(|e| fhir_mismatch(field, e))?)
        }
        FieldKind::Group { fields, .. } => {
            FieldValue::Group(group_from_json(fields, value, field, errors)?)
        }
        FieldKind::MultiSelect { .. }
        | FieldKind::MultiReference { .. }
        | FieldKind::Tree { .. }
        | FieldKind::Choice { .. } => {
            return Err(mismatch(field, format!("{} is not single-valued", kind.label())))
        }
    })
}

fn multi_from_json(
    kind: &FieldKind,
    items: &[Value],
    field: &str,
    errors: &mut Vec<IdmpError>,
) -> IdmpResult<FieldValue> {
    let item_field = |i: usize| format!("{field}[{i}]");
    Ok(match kind {
        FieldKind::MultiSelect { .. } => FieldValue::MultiSelect(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| as_string(item, &item_field(i)))
                .collect::<IdmpResult<_>>()?,
        ),
        FieldKind::MultiReference { .. } => FieldValue::MultiReference(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    ResourceRef::from_json(item).map_err(|e| fhir_mismatch(&item_field(i), e))
                })
                .collect::<IdmpResult<_>>()?,
        ),
        FieldKind::Concept { .. } => FieldValue::Concepts(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    CodeableConcept::from_json(item).map_err(|e| fhir_mismatch(&item_field(i), e))
                })
                .collect::<IdmpResult<_>>()?,
        ),
        FieldKind::Group { fields, .. } => FieldValue::Groups(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| group_from_json(fields, item, &item_field(i), errors))
                .collect::<IdmpResult<_>>()?,
        ),
        FieldKind::Tree {
            fields, children, ..
        } => FieldValue::Tree(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| node_from_json(fields, children, item, &item_field(i), errors))
                .collect::<IdmpResult<_>>()?,
        ),
        other => return Err(mismatch(field, format!("{} is not multi-valued", other.label()))),
    })
}

fn group_from_json(
    definitions: &[FieldDefinition],
    value: &Value,
    field: &str,
    errors: &mut Vec<IdmpError>,
) -> IdmpResult<FieldMap> {
    let object = value
        .as_object()
        .ok_or_else(|| mismatch(field, format!("expected an object, got {}", json_kind(value))))?;
    let fields = read_fields(object, definitions, field, errors);
    check_members(object, definitions, &ELEMENT_MEMBERS, field, None, errors);
    Ok(fields)
}

fn node_from_json(
    definitions: &[FieldDefinition],
    children: &str,
    value: &Value,
    field: &str,
    errors: &mut Vec<IdmpError>,
) -> IdmpResult<TreeNode> {
    let object = value
        .as_object()
        .ok_or_else(|| mismatch(field, format!("expected an object, got {}", json_kind(value))))?;
    let fields = read_fields(object, definitions, field, errors);
    check_members(object, definitions, &ELEMENT_MEMBERS, field, Some(children), errors);

    let nested = match object.get(children) {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let path = format!("{field}.{children}[{i}]");
                node_from_json(definitions, children, item, &path, errors)
            })
            .collect::<IdmpResult<_>>()?,
        Some(other) => {
            return Err(mismatch(
                &format!("{field}.{children}"),
                format!("expected an array, got {}", json_kind(other)),
            ))
        }
    };
    Ok(TreeNode {
        fields,
        children: nested,
    })
}

fn choice_from_json(alternative: &ChoiceType, value: &Value) -> Result<ChoiceValue, FhirError> {
    let text = || {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                FhirError::InvalidInput(format!("expected a string, got {}", json_kind(value)))
            })
    };
    Ok(match alternative {
        ChoiceType::Quantity => ChoiceValue::Quantity(Quantity::from_json(value)?),
        ChoiceType::CodeableConcept => {
            ChoiceValue::CodeableConcept(CodeableConcept::from_json(value)?)
        }
        ChoiceType::Boolean => ChoiceValue::Boolean(value.as_bool().ok_or_else(|| {
            FhirError::InvalidInput(format!("expected a boolean, got {}", json_kind(value)))
        })?),
        ChoiceType::String => ChoiceValue::String(text()?),
        ChoiceType::Markdown => ChoiceValue::Markdown(text()?),
        ChoiceType::Integer => ChoiceValue::Integer(integer_from_json(value)?),
        ChoiceType::Date => ChoiceValue::Date(parse_date(&text()?)?),
        ChoiceType::DateTime => ChoiceValue::DateTime(parse_datetime(&text()?)?),
        ChoiceType::Reference { .. } => ChoiceValue::Reference(ResourceRef::from_json(value)?),
    })
}

/// Report members of `object` that no definition claims.
fn check_members(
    object: &Map<String, Value>,
    definitions: &[FieldDefinition],
    allowed: &[&str],
    prefix: &str,
    children: Option<&str>,
    errors: &mut Vec<IdmpError>,
) {
    let mut claimed: HashSet<String> = allowed.iter().map(|m| (*m).to_owned()).collect();
    claimed.extend(children.map(str::to_owned));
    for definition in definitions {
        let path = definition.element_path();
        match (&definition.kind, path.segments().len()) {
            (FieldKind::Choice { .. }, 1) => {
                claimed.extend(
                    ChoiceType::SUFFIXES
                        .iter()
                        .map(|suffix| format!("{}{suffix}", path.root())),
                );
            }
            _ => {
                claimed.insert(path.root().to_owned());
            }
        }
    }

    for member in object.keys() {
        if !claimed.contains(member) {
            errors.push(mismatch(
                &join(prefix, member),
                "is not an element of this resource".to_owned(),
            ));
        }
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

/// `path` with the choice suffix appended to its leaf, e.g. `value` → `valueQuantity`.
fn choice_segments(path: &ElementPath, suffix: &str) -> Vec<Segment> {
    let mut segments = path.segments().to_vec();
    if let Some(leaf) = segments.last_mut() {
        leaf.name = format!("{}{suffix}", leaf.name);
    }
    segments
}

fn carries(entry: &Value, key: &str, value: &str) -> bool {
    entry.get(key).and_then(Value::as_str) == Some(value)
}

fn as_array<'v>(node: &'v Value, name: &str) -> Result<&'v Vec<Value>, String> {
    node.as_array()
        .ok_or_else(|| format!("expected an array at {name}, got {}", json_kind(node)))
}

fn as_string(value: &Value, field: &str) -> IdmpResult<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| mismatch(field, format!("expected a string, got {}", json_kind(value))))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn mismatch(field: &str, reason: String) -> IdmpError {
    IdmpError::TypeMismatch {
        field: field.to_owned(),
        reason,
    }
}

fn fhir_mismatch(field: &str, err: FhirError) -> IdmpError {
    mismatch(field, err.to_string())
}

fn conflict(field: &str, element: &str) -> IdmpError {
    IdmpError::InvalidInput(format!(
        "field '{field}' writes element '{element}' which is already used by another field"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        build_all, choice, concept, concepts, date, groups, multi_reference, number, quantity,
        text, tree,
    };
    use crate::config::CoreConfig;
    use crate::store::{NewResource, ResourceStore};
    use fhir::Coding;
    use idmp_types::{Location, ResourceKey};
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;

    const ATC: &str = "http://www.whocc.no/atc";
    const INN: &str = "http://www.who.int/medicines/publications/druginformation";

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::in_memory();
        registry
            .upsert(
                "Substance",
                "IDMP",
                build_all(vec![
                    text("identifier", "Identifier", 64).unique().at("identifier[].value"),
                    text("name", "Name", 255).at("code.text"),
                    text("inn", "INN", 255).at(&format!("code.coding[system={INN}].code")),
                    text("casNumber", "CAS number", 32)
                        .at("identifier[system=http://fdasis.nlm.nih.gov].value"),
                    number("molecularWeight", "Molecular weight", 3)
                        .at("molecule.molecularWeight.amount.value"),
                ])
                .expect("substance fields"),
            )
            .expect("substance");
        registry
            .upsert(
                "MedicinalProduct",
                "IDMP",
                build_all(vec![
                    text("identifier", "MPID", 64)
                        .mandatory()
                        .at("identifier[system=urn:oid:2.16.840.1.113883.3.1937].value"),
                    groups(
                        "name",
                        "Name",
                        vec![
                            text("productName", "Product name", 255).mandatory(),
                            concept("nameType", "Name type").at("type"),
                        ],
                    )
                    .mandatory(),
                    concepts("classification", "Classification"),
                    date("statusDate", "Status date"),
                    multi_reference("ingredient", "Ingredient", &["Substance"])
                        .at("ingredient[].itemReference"),
                    groups(
                        "characteristic",
                        "Characteristic",
                        vec![
                            concept("type", "Type"),
                            choice(
                                "value",
                                "Value",
                                vec![
                                    ChoiceType::Quantity,
                                    ChoiceType::CodeableConcept,
                                    ChoiceType::Boolean,
                                ],
                            ),
                        ],
                    ),
                    tree(
                        "packaging",
                        "Packaging",
                        "packaging",
                        None,
                        vec![concept("type", "Type"), quantity("quantity", "Quantity")],
                    ),
                ])
                .expect("product fields"),
            )
            .expect("product");
        Arc::new(registry)
    }

    fn store(registry: Arc<SchemaRegistry>) -> ResourceStore {
        ResourceStore::open(Arc::new(CoreConfig::in_memory()), registry).expect("store")
    }

    fn paracetamol(store: &ResourceStore) -> ResourceInstance {
        store
            .create(
                NewResource::new(
                    "Substance",
                    Location::new("/IDMP/Substances").unwrap(),
                    ResourceKey::new("paracetamol").unwrap(),
                )
                .with_fields(FieldMap::from([
                    ("identifier".to_owned(), FieldValue::text("362O9ITL9D")),
                    ("name".to_owned(), FieldValue::text("Paracétamol")),
                ])),
            )
            .expect("create paracetamol")
    }

    fn doliprane_fields(substance: &ResourceInstance) -> FieldMap {
        let name = FieldMap::from([
            ("productName".to_owned(), FieldValue::text("Doliprane 500 mg")),
            (
                "nameType".to_owned(),
                FieldValue::Concept(CodeableConcept::from_text("full")),
            ),
        ]);
        let characteristic = FieldMap::from([
            (
                "type".to_owned(),
                FieldValue::Concept(CodeableConcept::from_text("strength")),
            ),
            (
                "value".to_owned(),
                FieldValue::Choice(ChoiceValue::Quantity(Quantity::ucum(
                    Decimal::from_str("500.0").unwrap(),
                    "mg",
                ))),
            ),
        ]);
        let type_of = |label: &str| {
            FieldMap::from([(
                "type".to_owned(),
                FieldValue::Concept(CodeableConcept::from_text(label)),
            )])
        };
        FieldMap::from([
            ("identifier".to_owned(), FieldValue::text("FR-001")),
            ("name".to_owned(), FieldValue::Groups(vec![name])),
            (
                "classification".to_owned(),
                FieldValue::Concepts(vec![CodeableConcept::from_coding(
                    Coding::new(ATC, "N02BE01").with_display("paracetamol"),
                )]),
            ),
            (
                "statusDate".to_owned(),
                FieldValue::Date(chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
            ),
            (
                "ingredient".to_owned(),
                FieldValue::MultiReference(vec![substance.reference()]),
            ),
            (
                "characteristic".to_owned(),
                FieldValue::Groups(vec![characteristic]),
            ),
            (
                "packaging".to_owned(),
                FieldValue::Tree(vec![TreeNode::new(type_of("box"))
                    .with_child(TreeNode::new(type_of("blister")))]),
            ),
        ])
    }

    #[test]
    fn substance_document_omits_absent_fields() {
        let registry = registry();
        let store = store(registry.clone());
        let substance = paracetamol(&store);

        let document = FhirMapper::new(&registry)
            .to_document(&substance)
            .expect("to_document");

        assert_eq!(document["resourceType"], "Substance");
        assert_eq!(document["id"], substance.id.to_string());
        assert_eq!(document["meta"]["versionId"], "1");
        assert_eq!(document["identifier"], json!([{ "value": "362O9ITL9D" }]));
        assert_eq!(document["code"], json!({ "text": "Paracétamol" }));
        assert!(document.get("casNumber").is_none());
        assert!(document.get("molecule").is_none());
        assert_eq!(document.as_object().unwrap().len(), 5);
    }

    #[test]
    fn product_references_fan_out_per_value() {
        let registry = registry();
        let store = store(registry.clone());
        let substance = paracetamol(&store);
        let product = store
            .create(
                NewResource::new(
                    "MedicinalProduct",
                    Location::new("/IDMP/MedicinalProducts").unwrap(),
                    ResourceKey::new("doliprane-500").unwrap(),
                )
                .with_fields(doliprane_fields(&substance)),
            )
            .expect("create product");

        let document = FhirMapper::new(&registry).to_document(&product).unwrap();

        assert_eq!(
            document["ingredient"],
            json!([{ "itemReference": { "reference": format!("Substance/{}", substance.id) } }])
        );
        assert_eq!(
            document["identifier"],
            json!([{ "system": "urn:oid:2.16.840.1.113883.3.1937", "value": "FR-001" }])
        );
        assert_eq!(document["name"][0]["productName"], "Doliprane 500 mg");
        assert_eq!(document["name"][0]["type"]["text"], "full");
        assert_eq!(document["statusDate"], "2024-03-01");
        assert_eq!(
            document["packaging"][0]["packaging"][0]["type"]["text"],
            "blister"
        );
    }

    #[test]
    fn round_trip_reproduces_field_map() {
        let registry = registry();
        let store = store(registry.clone());
        let substance = paracetamol(&store);
        let product = store
            .create(
                NewResource::new(
                    "MedicinalProduct",
                    Location::new("/IDMP/MedicinalProducts").unwrap(),
                    ResourceKey::new("doliprane-500").unwrap(),
                )
                .with_fields(doliprane_fields(&substance)),
            )
            .unwrap();

        let mapper = FhirMapper::new(&registry);
        for instance in [&substance, &product] {
            let document = mapper.to_document(instance).unwrap();
            let fields = mapper.from_document(&document).expect("from_document");
            assert_eq!(&fields, &instance.fields, "round trip of {}", instance.resource_type);
        }
    }

    #[test]
    fn choice_emits_exactly_one_member() {
        let registry = registry();
        let store = store(registry.clone());
        let substance = paracetamol(&store);
        let product = store
            .create(
                NewResource::new(
                    "MedicinalProduct",
                    Location::new("/IDMP/MedicinalProducts").unwrap(),
                    ResourceKey::new("doliprane-500").unwrap(),
                )
                .with_fields(doliprane_fields(&substance)),
            )
            .unwrap();

        let document = FhirMapper::new(&registry).to_document(&product).unwrap();
        let characteristic = document["characteristic"][0].as_object().unwrap();
        let value_members: Vec<&String> = characteristic
            .keys()
            .filter(|k| k.starts_with("value"))
            .collect();
        assert_eq!(value_members, vec!["valueQuantity"]);
        assert_eq!(characteristic["valueQuantity"]["value"].to_string(), "500.0");
    }

    #[test]
    fn two_choice_members_are_ambiguous() {
        let registry = registry();
        let document = json!({
            "resourceType": "MedicinalProduct",
            "identifier": [{ "system": "urn:oid:2.16.840.1.113883.3.1937", "value": "FR-001" }],
            "name": [{ "productName": "Doliprane" }],
            "characteristic": [{
                "valueQuantity": { "value": 500, "unit": "mg" },
                "valueBoolean": true
            }]
        });

        let err = FhirMapper::new(&registry)
            .from_document(&document)
            .expect_err("two alternatives");
        let problems = err.into_problems();
        assert_eq!(problems.len(), 1);
        assert!(matches!(
            &problems[0],
            IdmpError::AmbiguousChoice { field, .. } if field == "characteristic[0].value"
        ));
    }

    #[test]
    fn repeated_single_valued_element_is_ambiguous() {
        let registry = registry();
        let document = json!({
            "resourceType": "MedicinalProduct",
            "identifier": [
                { "system": "urn:oid:2.16.840.1.113883.3.1937", "value": "FR-001" },
                { "system": "urn:oid:2.16.840.1.113883.3.1937", "value": "FR-002" }
            ],
            "name": [{ "productName": "Doliprane" }]
        });

        let problems = FhirMapper::new(&registry)
            .from_document(&document)
            .expect_err("two MPIDs")
            .into_problems();
        assert!(problems
            .iter()
            .any(|p| matches!(
                p,
                IdmpError::AmbiguousChoice { field, .. } if field == "identifier"
            )));
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let registry = registry();
        let document = json!({
            "resourceType": "MedicinalProduct",
            "name": [{ "type": { "text": "full" } }],
            "statusDate": "01/03/2024",
            "colour": "red"
        });

        let err = FhirMapper::new(&registry)
            .from_document(&document)
            .expect_err("several problems");
        let problems = match err {
            IdmpError::Document(problems) => problems,
            other => panic!("expected Document, got {other:?}"),
        };

        let missing: Vec<&str> = problems
            .iter()
            .filter_map(|p| match p {
                IdmpError::MissingRequiredField { field } => Some(field.as_str()),
                _ => None,
            })
            .collect();
        assert!(missing.contains(&"identifier"));
        assert!(missing.contains(&"name[0].productName"));
        assert!(problems
            .iter()
            .any(|p| matches!(p, IdmpError::TypeMismatch { field, .. } if field == "statusDate")));
        assert!(problems
            .iter()
            .any(|p| matches!(p, IdmpError::TypeMismatch { field, .. } if field == "colour")));
    }

    #[test]
    fn undiscriminated_entries_skip_sibling_claims() {
        let registry = registry();
        let document = json!({
            "resourceType": "Substance",
            "identifier": [
                { "system": "http://fdasis.nlm.nih.gov", "value": "103-90-2" },
                { "value": "362O9ITL9D" }
            ],
            "code": {
                "text": "Paracétamol",
                "coding": [{ "system": INN, "code": "paracetamol" }]
            },
            "molecule": { "molecularWeight": { "amount": { "value": 151.163 } } }
        });

        let fields = FhirMapper::new(&registry)
            .from_document(&document)
            .expect("valid substance");
        assert_eq!(fields["identifier"], FieldValue::text("362O9ITL9D"));
        assert_eq!(fields["casNumber"], FieldValue::text("103-90-2"));
        assert_eq!(fields["inn"], FieldValue::text("paracetamol"));
        match &fields["molecularWeight"] {
            FieldValue::Number(n) => assert_eq!(n.to_string(), "151.163"),
            other => panic!("expected a number, got {other:?}"),
        }
    }

    #[test]
    fn unknown_resource_type_is_unsupported() {
        let registry = registry();
        let mapper = FhirMapper::new(&registry);

        assert!(matches!(
            mapper.from_document(&json!({ "resourceType": "Device" })),
            Err(IdmpError::UnsupportedResourceType(t)) if t == "Device"
        ));
        assert!(matches!(
            mapper.from_document(&json!({ "identifier": [] })),
            Err(IdmpError::UnsupportedResourceType(_))
        ));
    }

    #[test]
    fn deep_packaging_exceeds_tree_depth() {
        let registry = registry();
        let document = json!({
            "resourceType": "MedicinalProduct",
            "identifier": [{ "system": "urn:oid:2.16.840.1.113883.3.1937", "value": "FR-001" }],
            "name": [{ "productName": "Doliprane" }],
            "packaging": [{
                "type": { "text": "box" },
                "packaging": [{
                    "type": { "text": "blister" },
                    "packaging": [{ "type": { "text": "tablet" } }]
                }]
            }]
        });

        let problems = FhirMapper::new(&registry)
            .from_document(&document)
            .expect_err("three levels")
            .into_problems();
        assert!(problems
            .iter()
            .any(|p| matches!(p, IdmpError::TreeDepthExceeded { depth: 3, .. })));

        assert!(FhirMapper::new(&registry)
            .with_max_tree_depth(3)
            .from_document(&document)
            .is_ok());
    }
}
