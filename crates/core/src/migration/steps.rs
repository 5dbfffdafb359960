//! Install, artifact and validation steps.

use super::{Carry, ItemResult, MigrationStep, StepContext, StepReport};
use crate::constants::{CAPABILITY_JSON_FILENAME, SOFTWARE_NAME};
use crate::definitions::{
    base_types, capability_resources, legacy_types, required_type_names, support_types,
};
use crate::schema::SchemaDocument;
use crate::value::{FieldMap, FieldValue, TreeNode};
use crate::{IdmpError, IdmpResult};
use fhir::{CapabilityStatement, CodeableConcept};
use std::collections::BTreeSet;
use std::fs;
use std::io;

/// Upserts the FHIR resource types.
#[derive(Debug, Clone, Copy)]
pub struct InstallBaseTypes;

impl MigrationStep for InstallBaseTypes {
    fn name(&self) -> &str {
        "install-base-types"
    }

    fn run(&self, ctx: &StepContext<'_>, _carry: &Carry) -> IdmpResult<StepReport> {
        let mut report = StepReport::default();
        for document in base_types()? {
            report.record_schema(&document.apply(ctx.registry())?);
        }
        Ok(report)
    }
}

/// Upserts the types the base types point at, declares the legacy types if they are missing
/// and checks that every reference target resolves.
#[derive(Debug, Clone, Copy)]
pub struct InstallSupportTypes;

impl MigrationStep for InstallSupportTypes {
    fn name(&self) -> &str {
        "install-support-types"
    }

    fn run(&self, ctx: &StepContext<'_>, _carry: &Carry) -> IdmpResult<StepReport> {
        let registry = ctx.registry();
        let mut report = StepReport::default();
        for document in support_types()? {
            report.record_schema(&document.apply(registry)?);
        }
        for document in legacy_types()? {
            if registry.contains(&document.name)? {
                report.record(format!("schema {}", document.name), ItemResult::Unchanged);
                continue;
            }
            report.record_schema(&document.apply(registry)?);
        }
        registry.resolve()?;
        Ok(report)
    }
}

/// Writes the capability statement to `artifacts/capability.json`, only when it changed.
#[derive(Debug, Clone, Copy)]
pub struct RebuildDerivedArtifacts;

impl MigrationStep for RebuildDerivedArtifacts {
    fn name(&self) -> &str {
        "rebuild-derived-artifacts"
    }

    fn run(&self, ctx: &StepContext<'_>, _carry: &Carry) -> IdmpResult<StepReport> {
        let mut report = StepReport::default();
        let Some(dir) = ctx.store.config().artifacts_dir() else {
            report.record(
                CAPABILITY_JSON_FILENAME,
                ItemResult::Skipped {
                    reason: "no data directory configured".into(),
                },
            );
            return Ok(report);
        };

        let statement =
            CapabilityStatement::render(SOFTWARE_NAME, &capability_resources(ctx.registry())?);
        let rendered = serde_json::to_string_pretty(&statement).map_err(IdmpError::Serialization)?;

        let path = dir.join(CAPABILITY_JSON_FILENAME);
        let item = path.display().to_string();
        let existing = match fs::read_to_string(&path) {
            Ok(existing) => Some(existing),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(IdmpError::StorageRead(e)),
        };
        if existing.as_deref() == Some(rendered.as_str()) {
            report.record(item, ItemResult::Unchanged);
            return Ok(report);
        }

        fs::create_dir_all(&dir).map_err(IdmpError::StorageWrite)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &rendered).map_err(IdmpError::StorageWrite)?;
        fs::rename(&tmp, &path).map_err(IdmpError::StorageWrite)?;

        let result = if existing.is_some() {
            ItemResult::Updated
        } else {
            ItemResult::Created
        };
        tracing::info!(path = %item, "capability statement written");
        report.record(item, result);
        Ok(report)
    }
}

/// Checks the registry and every stored instance.
///
/// - reference targets resolve (fatal)
/// - every required type is registered with at least the fields its definition declares
/// - every stored instance re-validates against its current schema
/// - every concept code carried from migration is used by some instance
#[derive(Debug, Clone, Copy)]
pub struct Validate;

impl MigrationStep for Validate {
    fn name(&self) -> &str {
        "validate"
    }

    fn run(&self, ctx: &StepContext<'_>, carry: &Carry) -> IdmpResult<StepReport> {
        let registry = ctx.registry();
        registry.resolve()?;

        let mut report = StepReport::default();
        let documents: Vec<SchemaDocument> =
            base_types()?.into_iter().chain(support_types()?).collect();
        for name in required_type_names() {
            let item = format!("schema {name}");
            let Ok(registered) = registry.get(name) else {
                report.fail(item, &IdmpError::NotFound(format!("resource type {name}")));
                continue;
            };
            let missing: Vec<&str> = documents
                .iter()
                .filter(|d| d.name == name)
                .flat_map(|d| d.fields.iter())
                .filter(|f| registered.field(&f.name).is_none())
                .map(|f| f.name.as_str())
                .collect();
            if missing.is_empty() {
                report.record(item, ItemResult::Checked);
            } else {
                report.fail(
                    item,
                    &IdmpError::InvalidInput(format!("missing fields: {}", missing.join(", "))),
                );
            }
        }

        let mut used = BTreeSet::new();
        for resource_type in registry.list_all()? {
            for instance in ctx.store.instances_of(&resource_type.name)? {
                collect_codes(&instance.fields, &mut used);
                match ctx.store.check(&instance) {
                    Ok(()) => report.record(instance.path(), ItemResult::Checked),
                    Err(err) => report.fail(instance.path(), &err),
                }
            }
        }

        for (system, code) in carry.codes() {
            if !used.contains(&(system.to_owned(), code.to_owned())) {
                report.fail(
                    format!("concept {system}|{code}"),
                    &IdmpError::NotFound("no stored instance uses this migrated code".into()),
                );
            }
        }
        Ok(report)
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn collect_codes(fields: &FieldMap, used: &mut BTreeSet<(String, String)>) {
    for value in fields.values() {
        match value {
            FieldValue::Concept(concept) => concept_codes(concept, used),
            FieldValue::Concepts(concepts) => {
                for concept in concepts {
                    concept_codes(concept, used);
                }
            }
            FieldValue::Group(map) => collect_codes(map, used),
            FieldValue::Groups(maps) => {
                for map in maps {
                    collect_codes(map, used);
                }
            }
            FieldValue::Tree(nodes) => collect_node_codes(nodes, used),
            _ => {}
        }
    }
}

fn collect_node_codes(nodes: &[TreeNode], used: &mut BTreeSet<(String, String)>) {
    for node in nodes {
        collect_codes(&node.fields, used);
        collect_node_codes(&node.children, used);
    }
}

fn concept_codes(concept: &CodeableConcept, used: &mut BTreeSet<(String, String)>) {
    for coding in &concept.coding {
        if let (Some(system), Some(code)) = (&coding.system, &coding.code) {
            used.insert((system.clone(), code.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::definitions::{ATC_SYSTEM, MEDICINAL_PRODUCT, ORGANIZATION};
    use crate::migration::{install_pipeline, Orchestrator};
    use crate::schema::{SchemaChange, SchemaRegistry};
    use crate::store::ResourceStore;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn memory_store() -> ResourceStore {
        ResourceStore::open(
            Arc::new(CoreConfig::in_memory()),
            Arc::new(SchemaRegistry::in_memory()),
        )
        .expect("store")
    }

    fn file_store(dir: &Path) -> ResourceStore {
        let cfg = Arc::new(CoreConfig::new(Some(dir.to_path_buf()), 2, 10).expect("config"));
        let registry = Arc::new(SchemaRegistry::from_config(&cfg).expect("registry"));
        ResourceStore::open(cfg, registry).expect("store")
    }

    #[test]
    fn install_reports_created_then_unchanged() {
        let store = memory_store();
        let ctx = StepContext::new(&store);

        let first = InstallBaseTypes.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(first.schema_changes, 8);

        let second = InstallBaseTypes.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(second.schema_changes, 0);
        assert!(second
            .outcomes
            .iter()
            .all(|o| o.result == ItemResult::Unchanged));
    }

    #[test]
    fn support_step_fails_on_unresolved_targets() {
        let store = memory_store();
        let ctx = StepContext::new(&store);
        InstallSupportTypes
            .run(&ctx, &Carry::default())
            .expect("support types resolve on their own");

        store
            .registry()
            .upsert(
                "Broken",
                "IDMP",
                crate::catalog::build_all(vec![crate::catalog::reference(
                    "target",
                    "Target",
                    &["Missing"],
                )])
                .unwrap(),
            )
            .unwrap();
        let err = InstallSupportTypes
            .run(&ctx, &Carry::default())
            .expect_err("unresolved target");
        assert!(matches!(err, IdmpError::UnknownReferencedType { .. }));
    }

    #[test]
    fn legacy_types_are_not_reverted() {
        let store = memory_store();
        let ctx = StepContext::new(&store);
        InstallSupportTypes.run(&ctx, &Carry::default()).unwrap();
        let renamed = store
            .registry()
            .rename_field("LegacyMedicinalProduct", "productName", "name")
            .unwrap();
        assert_eq!(renamed.change, SchemaChange::Updated);

        let again = InstallSupportTypes.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(again.schema_changes, 0);
        let legacy = store.registry().get("LegacyMedicinalProduct").unwrap();
        assert!(legacy.field("name").is_some());
        assert!(legacy.field("productName").is_none());
    }

    #[test]
    fn artifact_is_rewritten_only_on_change() {
        let tmp = TempDir::new().unwrap();
        let store = file_store(tmp.path());
        let ctx = StepContext::new(&store);
        install_pipeline().run(&ctx);

        let path = tmp.path().join("artifacts").join(CAPABILITY_JSON_FILENAME);
        let written = fs::read_to_string(&path).expect("capability written");
        assert!(written.contains("\"CapabilityStatement\""));
        assert!(written.contains(MEDICINAL_PRODUCT));

        let again = RebuildDerivedArtifacts.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(again.outcomes[0].result, ItemResult::Unchanged);

        store.registry().remove(ORGANIZATION).unwrap();
        let changed = RebuildDerivedArtifacts.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(changed.updated, 1);
    }

    #[test]
    fn artifacts_are_skipped_without_data_dir() {
        let store = memory_store();
        let report = RebuildDerivedArtifacts
            .run(&StepContext::new(&store), &Carry::default())
            .unwrap();
        assert!(matches!(report.outcomes[0].result, ItemResult::Skipped { .. }));
        assert!(report.is_success());
    }

    #[test]
    fn validate_checks_resolution_and_carried_codes() {
        let store = memory_store();
        let ctx = StepContext::new(&store);
        let base_only = Orchestrator::new(vec![Box::new(InstallBaseTypes)]);
        assert!(base_only.run(&ctx).is_success());

        let mut carry = Carry::default();
        carry.add_code(ATC_SYSTEM, "N02BE01");
        // Base types point at Organization, which is missing.
        assert!(Validate.run(&ctx, &carry).is_err());

        InstallSupportTypes.run(&ctx, &Carry::default()).unwrap();
        let report = Validate.run(&ctx, &carry).unwrap();
        let failed: Vec<&str> = report.failures().map(|o| o.item.as_str()).collect();
        assert_eq!(failed, vec!["concept http://www.whocc.no/atc|N02BE01"]);
    }
}
