//! Schema registry.
//!
//! Holds every registered [`ResourceType`] and applies idempotent create-or-update ("upsert").
//! Reference targets are checked late, by [`SchemaRegistry::resolve`], so mutually recursive
//! types can be declared in any order.
//!
//! ## Storage Layout
//!
//! When opened on a directory, each type is persisted as YAML:
//!
//! ```text
//! schemas/
//!   MedicinalProduct.yaml
//!   Substance.yaml
//!   ...
//! ```
//!
//! Files are rewritten only when an operation actually changes the type.

use crate::catalog::{check_definition, FieldDefinition};
use crate::config::CoreConfig;
use crate::{IdmpError, IdmpResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// Public domain-level types
// ============================================================================

/// A named resource schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub fields: Vec<FieldDefinition>,
    /// Incremented on every effective change.
    #[serde(default)]
    pub revision: u64,
}

impl ResourceType {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve a dotted field path such as `name.productName` through groups and trees.
    pub fn field_path(&self, path: &str) -> Option<Vec<&FieldDefinition>> {
        let mut parts = path.split('.');
        let mut current = self.field(parts.next()?)?;
        let mut chain = vec![current];
        for part in parts {
            current = current.sub_field(part)?;
            chain.push(current);
        }
        Some(chain)
    }
}

/// What an upsert did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaChange {
    Created,
    Updated,
    Unchanged,
}

impl SchemaChange {
    pub fn is_change(self) -> bool {
        self != SchemaChange::Unchanged
    }
}

/// Result of a schema write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaUpsert {
    pub resource_type: ResourceType,
    pub change: SchemaChange,
}

/// A declarative schema document, as accepted by `install-schema`.
///
/// ```yaml
/// name: Organization
/// group: IDMP
/// fields:
///   - name: name
///     title: Name
///     kind: { type: text, max_length: 255 }
///     mandatory: true
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDocument {
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub description: Option<String>,
    pub fields: Vec<FieldDefinition>,
}

impl SchemaDocument {
    /// Parse one document or a list of documents.
    ///
    /// # Errors
    ///
    /// Returns [`IdmpError::YamlDeserialization`] carrying the failing path.
    pub fn parse(yaml: &str) -> IdmpResult<Vec<SchemaDocument>> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| IdmpError::YamlDeserialization(e.to_string()))?;
        if value.is_sequence() {
            from_yaml_value(value, "schema documents")
        } else {
            Ok(vec![from_yaml_value(value, "schema document")?])
        }
    }

    /// Upsert this document into `registry`, then apply its description if given.
    pub fn apply(self, registry: &SchemaRegistry) -> IdmpResult<SchemaUpsert> {
        let mut upsert = registry.upsert(&self.name, &self.group, self.fields)?;
        if let Some(description) = self.description {
            let described = registry.set_description(&self.name, &description)?;
            if described.change.is_change() && upsert.change == SchemaChange::Unchanged {
                upsert.change = SchemaChange::Updated;
            }
            upsert.resource_type = described.resource_type;
        }
        Ok(upsert)
    }
}

// ============================================================================
// Schema registry service
// ============================================================================

/// Registry of resource types. Safe to share via `Arc`.
#[derive(Debug)]
pub struct SchemaRegistry {
    types: RwLock<BTreeMap<String, ResourceType>>,
    dir: Option<PathBuf>,
}

impl SchemaRegistry {
    /// A registry that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            types: RwLock::new(BTreeMap::new()),
            dir: None,
        }
    }

    /// The registry for `cfg`: file-backed under the schemas directory when a data dir is set.
    pub fn from_config(cfg: &CoreConfig) -> IdmpResult<Self> {
        match cfg.schemas_dir() {
            Some(dir) => Self::open(&dir),
            None => Ok(Self::in_memory()),
        }
    }

    /// Open a registry persisted under `dir`, loading every `*.yaml` file in it.
    ///
    /// # Errors
    ///
    /// Returns `StorageRead`/`StorageWrite` on I/O failures and `YamlDeserialization` with the
    /// failing file and path when a schema file does not parse.
    pub fn open(dir: &Path) -> IdmpResult<Self> {
        fs::create_dir_all(dir).map_err(IdmpError::StorageWrite)?;

        let mut types = BTreeMap::new();
        for entry in fs::read_dir(dir).map_err(IdmpError::StorageRead)? {
            let path = entry.map_err(IdmpError::StorageRead)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(IdmpError::StorageRead)?;
            let value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
                IdmpError::YamlDeserialization(format!("{}: {e}", path.display()))
            })?;
            let resource_type: ResourceType =
                from_yaml_value(value, &path.display().to_string())?;
            types.insert(resource_type.name.clone(), resource_type);
        }

        tracing::debug!(count = types.len(), dir = %dir.display(), "loaded schemas");
        Ok(Self {
            types: RwLock::new(types),
            dir: Some(dir.to_path_buf()),
        })
    }

    /// Create or replace the field list of `name`.
    ///
    /// Applying the same input twice leaves the second call `Unchanged` with an identical type.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a malformed type name
    /// - `DuplicateFieldName` when two fields (at any nesting level) share a name
    /// - `InvalidFieldSpec` for a field that fails catalog checks
    pub fn upsert(
        &self,
        name: &str,
        group: &str,
        fields: Vec<FieldDefinition>,
    ) -> IdmpResult<SchemaUpsert> {
        check_type_name(name)?;
        check_field_names(name, &fields)?;
        for field in &fields {
            check_definition(field)?;
        }

        let mut types = self.write()?;
        let (resource_type, change) = match types.get(name) {
            Some(existing) if existing.group == group && existing.fields == fields => {
                (existing.clone(), SchemaChange::Unchanged)
            }
            Some(existing) => {
                let mut updated = existing.clone();
                updated.group = group.to_owned();
                updated.fields = fields;
                updated.revision += 1;
                (updated, SchemaChange::Updated)
            }
            None => (
                ResourceType {
                    name: name.to_owned(),
                    group: group.to_owned(),
                    description: None,
                    fields,
                    revision: 1,
                },
                SchemaChange::Created,
            ),
        };

        if change.is_change() {
            self.persist(&resource_type)?;
            types.insert(name.to_owned(), resource_type.clone());
            tracing::info!(
                resource_type = name,
                ?change,
                revision = resource_type.revision,
                "schema upserted"
            );
        }
        Ok(SchemaUpsert {
            resource_type,
            change,
        })
    }

    /// # Errors
    ///
    /// Returns `NotFound` if `name` is not registered.
    pub fn get(&self, name: &str) -> IdmpResult<ResourceType> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| IdmpError::NotFound(format!("resource type {name}")))
    }

    pub fn contains(&self, name: &str) -> IdmpResult<bool> {
        Ok(self.read()?.contains_key(name))
    }

    /// Every registered type, ordered by name.
    pub fn list_all(&self) -> IdmpResult<Vec<ResourceType>> {
        Ok(self.read()?.values().cloned().collect())
    }

    pub fn set_description(&self, name: &str, description: &str) -> IdmpResult<SchemaUpsert> {
        self.modify(name, |resource_type| {
            let description = Some(description.to_owned()).filter(|d| !d.trim().is_empty());
            if resource_type.description == description {
                return Ok(false);
            }
            resource_type.description = description;
            Ok(true)
        })
    }

    /// Append a field.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateFieldName` if the type already has a field of that name.
    pub fn add_field(&self, name: &str, field: FieldDefinition) -> IdmpResult<SchemaUpsert> {
        check_definition(&field)?;
        self.modify(name, |resource_type| {
            if resource_type.field(&field.name).is_some() {
                return Err(IdmpError::DuplicateFieldName {
                    resource_type: resource_type.name.clone(),
                    field: field.name.clone(),
                });
            }
            resource_type.fields.push(field.clone());
            Ok(true)
        })
    }

    /// Rename a top-level field. Renaming an already renamed field is a no-op.
    ///
    /// Stored values are not touched; see `ResourceStore::rename_field_values`.
    pub fn rename_field(&self, name: &str, from: &str, to: &str) -> IdmpResult<SchemaUpsert> {
        self.modify(name, |resource_type| {
            let has_from = resource_type.field(from).is_some();
            let has_to = resource_type.field(to).is_some();
            match (has_from, has_to) {
                (false, true) => Ok(false),
                (true, true) => Err(IdmpError::DuplicateFieldName {
                    resource_type: resource_type.name.clone(),
                    field: to.to_owned(),
                }),
                (false, false) => Err(IdmpError::NotFound(format!(
                    "field {from} on {}",
                    resource_type.name
                ))),
                (true, false) => {
                    let mut renamed = resource_type
                        .fields
                        .iter()
                        .find(|f| f.name == from)
                        .cloned()
                        .ok_or_else(|| IdmpError::NotFound(format!("field {from}")))?;
                    renamed.name = to.to_owned();
                    check_definition(&renamed)?;
                    for field in &mut resource_type.fields {
                        if field.name == from {
                            *field = renamed.clone();
                        }
                    }
                    Ok(true)
                }
            }
        })
    }

    /// Remove a type and its schema file.
    ///
    /// Callers are responsible for purging instances first; see `cleanup::drop_types`.
    pub fn remove(&self, name: &str) -> IdmpResult<ResourceType> {
        let mut types = self.write()?;
        let removed = types
            .remove(name)
            .ok_or_else(|| IdmpError::NotFound(format!("resource type {name}")))?;
        if let Some(dir) = &self.dir {
            let path = schema_file(dir, name);
            if path.exists() {
                fs::remove_file(&path).map_err(IdmpError::StorageWrite)?;
            }
        }
        tracing::info!(resource_type = name, "schema removed");
        Ok(removed)
    }

    /// Check that every reference target, at any nesting level, names a registered type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReferencedType`; several unresolved targets come back as a `Document`.
    pub fn resolve(&self) -> IdmpResult<()> {
        let types = self.read()?;
        let mut errors = Vec::new();
        for resource_type in types.values() {
            collect_unresolved(&types, &resource_type.name, &resource_type.fields, "", &mut errors);
        }
        IdmpError::collect(errors)
    }

    fn modify(
        &self,
        name: &str,
        mut change: impl FnMut(&mut ResourceType) -> IdmpResult<bool>,
    ) -> IdmpResult<SchemaUpsert> {
        let mut types = self.write()?;
        let existing = types
            .get(name)
            .ok_or_else(|| IdmpError::NotFound(format!("resource type {name}")))?;
        let mut updated = existing.clone();
        if !change(&mut updated)? {
            return Ok(SchemaUpsert {
                resource_type: updated,
                change: SchemaChange::Unchanged,
            });
        }
        updated.revision += 1;
        self.persist(&updated)?;
        types.insert(name.to_owned(), updated.clone());
        tracing::info!(resource_type = name, revision = updated.revision, "schema updated");
        Ok(SchemaUpsert {
            resource_type: updated,
            change: SchemaChange::Updated,
        })
    }

    fn persist(&self, resource_type: &ResourceType) -> IdmpResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(resource_type).map_err(IdmpError::YamlSerialization)?;
        let path = schema_file(dir, &resource_type.name);
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, yaml).map_err(IdmpError::StorageWrite)?;
        fs::rename(&tmp, &path).map_err(IdmpError::StorageWrite)
    }

    fn read(&self) -> IdmpResult<RwLockReadGuard<'_, BTreeMap<String, ResourceType>>> {
        self.types.read().map_err(|_| IdmpError::LockPoisoned)
    }

    fn write(&self) -> IdmpResult<RwLockWriteGuard<'_, BTreeMap<String, ResourceType>>> {
        self.types.write().map_err(|_| IdmpError::LockPoisoned)
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn schema_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.yaml"))
}

fn from_yaml_value<T>(value: serde_yaml::Value, what: &str) -> IdmpResult<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_path_to_error::deserialize(value).map_err(|err| {
        let path = err.path().to_string();
        IdmpError::YamlDeserialization(format!("{what} at {path}: {}", err.into_inner()))
    })
}

fn check_type_name(name: &str) -> IdmpResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(IdmpError::InvalidInput(format!(
            "resource type name '{name}' must be an ASCII identifier starting with an \
             uppercase letter"
        )))
    }
}

fn check_field_names(resource_type: &str, fields: &[FieldDefinition]) -> IdmpResult<()> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(IdmpError::DuplicateFieldName {
                resource_type: resource_type.to_owned(),
                field: field.name.clone(),
            });
        }
        check_field_names(resource_type, field.kind.sub_fields())?;
    }
    Ok(())
}

fn collect_unresolved(
    types: &BTreeMap<String, ResourceType>,
    resource_type: &str,
    fields: &[FieldDefinition],
    prefix: &str,
    errors: &mut Vec<IdmpError>,
) {
    for field in fields {
        let path = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        for target in field.kind.reference_targets() {
            if !types.contains_key(target) {
                errors.push(IdmpError::UnknownReferencedType {
                    resource_type: resource_type.to_owned(),
                    field: path.clone(),
                    target: target.to_owned(),
                });
            }
        }
        collect_unresolved(types, resource_type, field.kind.sub_fields(), &path, errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_all, groups, multi_reference, text};
    use tempfile::TempDir;

    fn substance_fields() -> Vec<FieldDefinition> {
        build_all(vec![
            text("identifier", "Identifier", 255).unique().at("identifier[].value"),
            text("name", "Name", 255).at("code.text"),
            text("casNumber", "CAS number", 50),
        ])
        .unwrap()
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let registry = std::sync::Arc::new(SchemaRegistry::in_memory());
        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.types.write().unwrap();
            panic!("poison the registry lock");
        })
        .join();

        assert!(matches!(
            registry.contains("Substance"),
            Err(IdmpError::LockPoisoned)
        ));
        assert!(matches!(registry.list_all(), Err(IdmpError::LockPoisoned)));
    }

    #[test]
    fn upsert_is_idempotent() {
        let registry = SchemaRegistry::in_memory();

        let first = registry
            .upsert("Substance", "IDMP", substance_fields())
            .expect("create");
        let second = registry
            .upsert("Substance", "IDMP", substance_fields())
            .expect("repeat");

        assert_eq!(first.change, SchemaChange::Created);
        assert_eq!(second.change, SchemaChange::Unchanged);
        assert_eq!(first.resource_type, second.resource_type);
        assert_eq!(registry.get("Substance").unwrap(), first.resource_type);
    }

    #[test]
    fn upsert_replaces_fields_and_keeps_description() {
        let registry = SchemaRegistry::in_memory();
        registry.upsert("Substance", "IDMP", substance_fields()).unwrap();
        registry.set_description("Substance", "FHIR Substance").unwrap();

        let mut fields = substance_fields();
        fields.pop();
        let updated = registry.upsert("Substance", "IDMP", fields).unwrap();

        assert_eq!(updated.change, SchemaChange::Updated);
        assert_eq!(updated.resource_type.fields.len(), 2);
        assert_eq!(updated.resource_type.revision, 3);
        assert_eq!(
            updated.resource_type.description.as_deref(),
            Some("FHIR Substance")
        );
    }

    #[test]
    fn rejects_duplicate_field_names_at_any_level() {
        let registry = SchemaRegistry::in_memory();
        let mut fields = substance_fields();
        let first = fields[0].clone();
        fields.push(first);

        let err = registry
            .upsert("Substance", "IDMP", fields)
            .expect_err("duplicate");
        assert!(matches!(
            err,
            IdmpError::DuplicateFieldName { field, .. } if field == "identifier"
        ));

        let mut group = groups("name", "Name", vec![text("productName", "Product name", 10)])
            .build()
            .unwrap();
        if let crate::catalog::FieldKind::Group { fields, .. } = &mut group.kind {
            let first = fields[0].clone();
            fields.push(first);
        }
        let err = registry
            .upsert("MedicinalProduct", "IDMP", vec![group])
            .expect_err("nested duplicate");
        assert!(matches!(err, IdmpError::DuplicateFieldName { .. }));
    }

    #[test]
    fn resolve_reports_unknown_targets_after_forward_declaration() {
        let registry = SchemaRegistry::in_memory();
        let product = build_all(vec![multi_reference(
            "ingredient",
            "Ingredient",
            &["Substance"],
        )])
        .unwrap();

        registry.upsert("MedicinalProduct", "IDMP", product).unwrap();
        let err = registry.resolve().expect_err("Substance not yet registered");
        match err {
            IdmpError::UnknownReferencedType {
                resource_type,
                field,
                target,
            } => {
                assert_eq!(resource_type, "MedicinalProduct");
                assert_eq!(field, "ingredient");
                assert_eq!(target, "Substance");
            }
            other => panic!("expected UnknownReferencedType, got {other:?}"),
        }

        registry.upsert("Substance", "IDMP", substance_fields()).unwrap();
        registry.resolve().expect("now resolvable");
    }

    #[test]
    fn add_and_rename_fields() {
        let registry = SchemaRegistry::in_memory();
        registry.upsert("Substance", "IDMP", substance_fields()).unwrap();

        let inn = text("inn", "INN", 255).build().unwrap();
        registry.add_field("Substance", inn.clone()).unwrap();
        let err = registry.add_field("Substance", inn).expect_err("already present");
        assert!(matches!(err, IdmpError::DuplicateFieldName { .. }));

        let renamed = registry.rename_field("Substance", "inn", "innName").unwrap();
        assert_eq!(renamed.change, SchemaChange::Updated);
        assert!(renamed.resource_type.field("innName").is_some());

        let again = registry.rename_field("Substance", "inn", "innName").unwrap();
        assert_eq!(again.change, SchemaChange::Unchanged);
    }

    #[test]
    fn persists_and_reloads_yaml() {
        let dir = TempDir::new().expect("tempdir");
        {
            let registry = SchemaRegistry::open(dir.path()).unwrap();
            registry.upsert("Substance", "IDMP", substance_fields()).unwrap();
        }
        assert!(dir.path().join("Substance.yaml").exists());

        let reopened = SchemaRegistry::open(dir.path()).unwrap();
        let substance = reopened.get("Substance").unwrap();
        assert_eq!(substance.fields, substance_fields());

        reopened.remove("Substance").unwrap();
        assert!(!dir.path().join("Substance.yaml").exists());
    }

    #[test]
    fn schema_document_parse_reports_path() {
        let yaml = r#"
- name: Organization
  group: IDMP
  fields:
    - name: name
      title: Name
      kind: { type: text, max_length: 255 }
- name: Broken
  group: IDMP
  fields:
    - name: size
      title: Size
      kind: { type: number, precision: lots }
"#;
        let err = SchemaDocument::parse(yaml).expect_err("precision is not a number");
        match err {
            IdmpError::YamlDeserialization(msg) => {
                assert!(msg.contains("[1].fields[0].kind"), "unexpected: {msg}")
            }
            other => panic!("expected YamlDeserialization, got {other:?}"),
        }
    }

    #[test]
    fn schema_document_applies_with_description() {
        let registry = SchemaRegistry::in_memory();
        let docs = SchemaDocument::parse(
            r#"
name: Organization
group: IDMP
description: Marketing authorisation holders
fields:
  - name: name
    title: Name
    kind: { type: text, max_length: 255 }
    mandatory: true
"#,
        )
        .unwrap();

        let applied = docs.into_iter().next().unwrap().apply(&registry).unwrap();
        assert_eq!(applied.change, SchemaChange::Created);
        assert_eq!(
            registry.get("Organization").unwrap().description.as_deref(),
            Some("Marketing authorisation holders")
        );
    }

    #[test]
    fn rejects_bad_type_names() {
        let registry = SchemaRegistry::in_memory();
        assert!(registry.upsert("substance", "IDMP", substance_fields()).is_err());
        assert!(registry.upsert("Sub/stance", "IDMP", substance_fields()).is_err());
    }
}
