//! Cleanup of stored instances and registered types.
//!
//! Everything goes through [`ResourceStore`] and [`SchemaRegistry`](crate::schema::SchemaRegistry)
//! operations; nothing here touches the storage layout directly. Each removed item is reported
//! as an outcome so a partial cleanup can be inspected and resumed.

use crate::catalog::FieldDefinition;
use crate::migration::{ItemResult, StepReport};
use crate::schema::ResourceType;
use crate::store::ResourceStore;
use crate::{IdmpError, IdmpResult};
use std::collections::BTreeMap;

/// Delete every instance of the given types, drafts included.
///
/// A type that is not registered is reported as a failed item; the remaining types are still
/// purged.
pub fn purge(store: &ResourceStore, types: &[&str]) -> IdmpResult<StepReport> {
    let mut report = StepReport::default();
    for &resource_type in types {
        purge_type(store, resource_type, &mut report)?;
    }
    Ok(report)
}

/// Remove the given types: their instances first, then their schemas.
///
/// A type that a registered type outside the batch still points at is refused before anything
/// is deleted, and so is every type a refused one points at. Refused types keep both their
/// instances and their schema and are reported as failed items. When purging an accepted type
/// fails, no schema is removed.
pub fn drop_types(store: &ResourceStore, types: &[&str]) -> IdmpResult<StepReport> {
    let registry = store.registry();
    let registered = registry.list_all()?;
    let refused = refused_types(&registered, types);

    let mut report = StepReport::default();
    for (resource_type, referrers) in &refused {
        report.fail(
            format!("schema {resource_type}"),
            &IdmpError::InvalidInput(format!("still referenced by {}", referrers.join(", "))),
        );
    }

    let accepted: Vec<&str> = types
        .iter()
        .copied()
        .filter(|t| !refused.contains_key(t))
        .collect();
    let failed_before = report.failures().count();
    for &resource_type in &accepted {
        purge_type(store, resource_type, &mut report)?;
    }
    if report.failures().count() > failed_before {
        for &resource_type in &accepted {
            report.record(
                format!("schema {resource_type}"),
                ItemResult::Skipped {
                    reason: "purge did not complete".into(),
                },
            );
        }
        return Ok(report);
    }

    for resource_type in accepted {
        let item = format!("schema {resource_type}");
        match registry.remove(resource_type) {
            Ok(_) => report.record(item, ItemResult::Deleted),
            Err(err) => report.fail(item, &err),
        }
    }
    Ok(report)
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn purge_type(
    store: &ResourceStore,
    resource_type: &str,
    report: &mut StepReport,
) -> IdmpResult<()> {
    if !store.registry().contains(resource_type)? {
        report.fail(
            format!("schema {resource_type}"),
            &IdmpError::UnsupportedResourceType(resource_type.to_owned()),
        );
        return Ok(());
    }
    let mut deleted = 0;
    for instance in store.instances_of(resource_type)? {
        match store.delete(&instance.id) {
            Ok(removed) => {
                report.record(removed.path(), ItemResult::Deleted);
                deleted += 1;
            }
            Err(err) => report.fail(instance.path(), &err),
        }
    }
    tracing::info!(resource_type, deleted, "instances purged");
    Ok(())
}

/// Types of the batch that must stay, with the names of the types pointing at them.
///
/// Referrers are registered types outside the batch, or refused ones, so refusal spreads to
/// everything a kept type needs.
fn refused_types<'a>(
    registered: &[ResourceType],
    types: &[&'a str],
) -> BTreeMap<&'a str, Vec<String>> {
    let mut refused: BTreeMap<&'a str, Vec<String>> = BTreeMap::new();
    loop {
        let mut changed = false;
        for &resource_type in types {
            if refused.contains_key(resource_type) {
                continue;
            }
            let referrers: Vec<String> = registered
                .iter()
                .filter(|t| t.name != resource_type)
                .filter(|t| {
                    !types.contains(&t.name.as_str()) || refused.contains_key(t.name.as_str())
                })
                .filter(|t| points_at(&t.fields, resource_type))
                .map(|t| t.name.clone())
                .collect();
            if !referrers.is_empty() {
                refused.insert(resource_type, referrers);
                changed = true;
            }
        }
        if !changed {
            return refused;
        }
    }
}

fn points_at(fields: &[FieldDefinition], target: &str) -> bool {
    fields.iter().any(|f| {
        f.kind.reference_targets().contains(&target) || points_at(f.kind.sub_fields(), target)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_all, reference, text};
    use crate::config::CoreConfig;
    use crate::definitions::{LEGACY_MEDICINAL_PRODUCT, LEGACY_SUBSTANCE};
    use crate::migration::{seed_pipeline, StepContext};
    use crate::schema::SchemaRegistry;
    use crate::store::{NewResource, Query};
    use idmp_types::{Location, ResourceKey};
    use std::sync::Arc;

    fn seeded_store() -> ResourceStore {
        let store = ResourceStore::open(
            Arc::new(CoreConfig::in_memory()),
            Arc::new(SchemaRegistry::in_memory()),
        )
        .expect("store");
        assert!(seed_pipeline().run(&StepContext::new(&store)).is_success());
        store
    }

    #[test]
    fn purge_removes_drafts_too() {
        let store = seeded_store();
        store
            .create(
                NewResource::new(
                    LEGACY_SUBSTANCE,
                    Location::new("/Legacy/Substances").unwrap(),
                    ResourceKey::new("ibuprofen").unwrap(),
                )
                .with_fields(crate::value::FieldMap::from([(
                    "substanceName".to_owned(),
                    crate::value::FieldValue::text("Ibuprofen"),
                )]))
                .draft(),
            )
            .unwrap();

        let report = purge(&store, &[LEGACY_MEDICINAL_PRODUCT, LEGACY_SUBSTANCE]).unwrap();
        assert!(report.is_success());
        assert_eq!(report.deleted, 5);
        assert_eq!(store.count(LEGACY_SUBSTANCE).unwrap(), 0);
        assert!(store
            .query(LEGACY_SUBSTANCE, &Query::new().with_drafts())
            .unwrap()
            .items
            .is_empty());
    }

    #[test]
    fn purge_reports_unknown_types() {
        let store = seeded_store();
        let report = purge(&store, &["Nope"]).unwrap();
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn drop_removes_schemas_after_purge() {
        let store = seeded_store();
        let report = drop_types(&store, &[LEGACY_MEDICINAL_PRODUCT, LEGACY_SUBSTANCE]).unwrap();
        assert!(report.is_success(), "{:?}", report.outcomes);
        assert_eq!(report.deleted, 6, "four instances and two schemas");
        assert!(!store.registry().contains(LEGACY_MEDICINAL_PRODUCT).unwrap());
        assert!(!store.registry().contains(LEGACY_SUBSTANCE).unwrap());
        assert!(store.registry().resolve().is_ok());
    }

    #[test]
    fn refused_drop_keeps_instances() {
        let store = seeded_store();
        assert_eq!(store.count(LEGACY_SUBSTANCE).unwrap(), 1);

        let report = drop_types(&store, &[LEGACY_SUBSTANCE]).unwrap();
        let failed: Vec<&str> = report.failures().map(|o| o.item.as_str()).collect();
        assert_eq!(failed, vec!["schema LegacySubstance"]);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.count(LEGACY_SUBSTANCE).unwrap(), 1);
        assert!(store.registry().contains(LEGACY_SUBSTANCE).unwrap());
    }

    #[test]
    fn refusal_spreads_to_types_a_kept_type_needs() {
        let store = ResourceStore::open(
            Arc::new(CoreConfig::in_memory()),
            Arc::new(SchemaRegistry::in_memory()),
        )
        .expect("store");
        let registry = store.registry();
        let upsert = |name: &str, fields| {
            registry
                .upsert(name, "Test", build_all(fields).expect("fields"))
                .expect("upsert");
        };
        upsert("Part", vec![text("code", "Code", 16)]);
        upsert("Item", vec![reference("part", "Part", &["Part"])]);
        upsert("Holder", vec![reference("item", "Item", &["Item"])]);
        store
            .create(
                NewResource::new(
                    "Part",
                    Location::new("/Test/Parts").unwrap(),
                    ResourceKey::new("p1").unwrap(),
                )
                .with_fields(crate::value::FieldMap::from([(
                    "code".to_owned(),
                    crate::value::FieldValue::text("P1"),
                )])),
            )
            .unwrap();

        let report = drop_types(&store, &["Item", "Part"]).unwrap();
        let failed: Vec<&str> = report.failures().map(|o| o.item.as_str()).collect();
        assert_eq!(failed, vec!["schema Item", "schema Part"]);
        assert_eq!(store.count("Part").unwrap(), 1);
        assert!(registry.resolve().is_ok());
    }
}
