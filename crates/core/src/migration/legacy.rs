//! Legacy data migration and the demo legacy data set.
//!
//! Legacy instances are converted one at a time in insertion order. After each successfully
//! converted instance the `legacy-migration` checkpoint is moved to its sequence number, so a
//! re-run starts after the last instance that made it. Once an item fails the checkpoint stays
//! put and later items are still attempted; on the next run they are found at their target
//! location and reported as unchanged.

use super::{Carry, ItemResult, MigrationStep, StepContext, StepReport};
use crate::definitions::{
    folder_for, ProductName, ATC_SYSTEM, LEGACY_MEDICINAL_PRODUCT, LEGACY_SUBSTANCE,
    LEGAL_STATUS_SYSTEM, MEDICINAL_PRODUCT, PRODUCT_TYPE_SYSTEM, SUBSTANCE,
    SUBSTANCE_CATEGORY_SYSTEM,
};
use crate::store::{NewResource, ResourceInstance, ResourceStore};
use crate::value::{FieldMap, FieldValue};
use crate::{IdmpError, IdmpResult};
use fhir::{CodeableConcept, Coding};
use idmp_types::ResourceKey;
use rust_decimal::Decimal;

/// Checkpoint holding the sequence number of the last migrated legacy instance.
pub const LEGACY_CHECKPOINT: &str = "legacy-migration";

/// Name the legacy product schema used for the product name before migration fixed it.
const LEGACY_NAME_FIELD: &str = "productName";
const NAME_FIELD: &str = "name";

/// Converts legacy products and substances into `MedicinalProduct` and `Substance` instances.
#[derive(Debug, Clone, Copy)]
pub struct MigrateLegacyData;

impl MigrationStep for MigrateLegacyData {
    fn name(&self) -> &str {
        "migrate-legacy-data"
    }

    fn run(&self, ctx: &StepContext<'_>, _carry: &Carry) -> IdmpResult<StepReport> {
        let store = ctx.store;
        let registry = ctx.registry();
        let mut report = StepReport::default();

        // Schema fix-up first: values follow the rename, also after an interrupted run.
        let renamed =
            registry.rename_field(LEGACY_MEDICINAL_PRODUCT, LEGACY_NAME_FIELD, NAME_FIELD)?;
        report.record_schema(&renamed);
        store.rename_field_values(LEGACY_MEDICINAL_PRODUCT, LEGACY_NAME_FIELD, NAME_FIELD)?;

        let checkpoint = store.checkpoint(LEGACY_CHECKPOINT)?;
        let mut pending: Vec<ResourceInstance> = store
            .instances_of(LEGACY_SUBSTANCE)?
            .into_iter()
            .chain(store.instances_of(LEGACY_MEDICINAL_PRODUCT)?)
            .filter(|i| i.sequence > checkpoint)
            .collect();
        pending.sort_by_key(|i| i.sequence);
        tracing::info!(checkpoint, pending = pending.len(), "migrating legacy instances");

        let mut advancing = true;
        for legacy in pending {
            let item = legacy.path();
            match migrate_one(store, &legacy, &mut report.carry) {
                Ok(result) => {
                    report.record(item, result);
                    if advancing {
                        store.set_checkpoint(LEGACY_CHECKPOINT, legacy.sequence)?;
                    }
                }
                Err(err) => {
                    report.fail(item, &err);
                    advancing = false;
                }
            }
        }
        Ok(report)
    }
}

/// Creates the demo legacy data set.
#[derive(Debug, Clone, Copy)]
pub struct SeedDemoData;

impl MigrationStep for SeedDemoData {
    fn name(&self) -> &str {
        "seed-demo-data"
    }

    fn run(&self, ctx: &StepContext<'_>, _carry: &Carry) -> IdmpResult<StepReport> {
        seed_demo_data(ctx.store)
    }
}

struct DemoProduct {
    key: &'static str,
    mpid: &'static str,
    name: &'static str,
    atc: &'static str,
    ingredient: Option<&'static str>,
}

const DEMO_PRODUCTS: [DemoProduct; 3] = [
    DemoProduct {
        key: "doliprane-500",
        mpid: "FR-001",
        name: "Doliprane 500mg",
        atc: "N02BE01",
        ingredient: Some("paracetamol"),
    },
    DemoProduct {
        key: "advil-400",
        mpid: "FR-002",
        name: "Advil 400mg",
        atc: "M01AE01",
        ingredient: None,
    },
    DemoProduct {
        key: "aspirine-500",
        mpid: "FR-003",
        name: "Aspirine 500mg",
        atc: "N02BA01",
        ingredient: None,
    },
];

/// Create the paracetamol legacy substance and three legacy products, skipping any that exist.
///
/// The legacy types must be registered. The product name is written under whichever name field
/// the legacy schema currently has, so seeding works before and after migration.
pub fn seed_demo_data(store: &ResourceStore) -> IdmpResult<StepReport> {
    let mut report = StepReport::default();

    let substance_folder = folder_for(LEGACY_SUBSTANCE)?;
    let paracetamol_key = ResourceKey::new("paracetamol")?;
    let paracetamol = match store.find_at(&substance_folder, &paracetamol_key)? {
        Some(existing) => {
            report.record(existing.path(), ItemResult::Unchanged);
            existing
        }
        None => {
            let created = store.create(
                NewResource::new(LEGACY_SUBSTANCE, substance_folder, paracetamol_key)
                    .with_fields(FieldMap::from([
                        text("identifier", "362O9ITL9D"),
                        text("substanceName", "Paracétamol"),
                        text("inn", "paracetamol"),
                        text("casNumber", "103-90-2"),
                        text("substanceType", "chemical"),
                        text("molecularFormula", "C8H9NO2"),
                        (
                            "molecularWeight".to_owned(),
                            FieldValue::Number(Decimal::new(151_163, 3)),
                        ),
                    ])),
            )?;
            report.record(created.path(), ItemResult::Created);
            created
        }
    };

    let legacy_product = store.registry().get(LEGACY_MEDICINAL_PRODUCT)?;
    let name_field = if legacy_product.field(NAME_FIELD).is_some() {
        NAME_FIELD
    } else {
        LEGACY_NAME_FIELD
    };
    let product_folder = folder_for(LEGACY_MEDICINAL_PRODUCT)?;
    for demo in &DEMO_PRODUCTS {
        let key = ResourceKey::new(demo.key)?;
        if let Some(existing) = store.find_at(&product_folder, &key)? {
            report.record(existing.path(), ItemResult::Unchanged);
            continue;
        }
        let mut fields = FieldMap::from([
            text("mpid", demo.mpid),
            text(name_field, demo.name),
            text("productType", "chemical"),
            text("atcCode", demo.atc),
            text("legalStatusOfSupply", "non-prescription"),
            text("description", "Test medicinal product"),
        ]);
        if demo.ingredient == Some(paracetamol.key.as_str()) {
            fields.insert(
                "ingredient".to_owned(),
                FieldValue::MultiReference(vec![paracetamol.reference()]),
            );
        }
        let created = store.create(
            NewResource::new(LEGACY_MEDICINAL_PRODUCT, product_folder.clone(), key)
                .with_fields(fields),
        )?;
        report.record(created.path(), ItemResult::Created);
    }
    Ok(report)
}

// ============================================================================
// Conversion (internal)
// ============================================================================

fn migrate_one(
    store: &ResourceStore,
    legacy: &ResourceInstance,
    carry: &mut Carry,
) -> IdmpResult<ItemResult> {
    let target_type = match legacy.resource_type.as_str() {
        LEGACY_SUBSTANCE => SUBSTANCE,
        LEGACY_MEDICINAL_PRODUCT => MEDICINAL_PRODUCT,
        other => return Err(IdmpError::UnsupportedResourceType(other.to_owned())),
    };
    let folder = folder_for(target_type)?;
    if let Some(existing) = store.find_at(&folder, &legacy.key)? {
        tracing::debug!(path = %existing.path(), "already migrated");
        return Ok(ItemResult::Unchanged);
    }

    let fields = if target_type == SUBSTANCE {
        substance_fields(&legacy.fields, carry)
    } else {
        product_fields(store, &legacy.fields, carry)?
    };
    let mut new = NewResource::new(target_type, folder, legacy.key.clone()).with_fields(fields);
    if !legacy.published {
        new = new.draft();
    }
    let created = store.create(new)?;
    tracing::info!(from = %legacy.path(), to = %created.path(), "legacy instance migrated");
    Ok(ItemResult::Created)
}

fn substance_fields(legacy: &FieldMap, carry: &mut Carry) -> FieldMap {
    let mut fields = FieldMap::new();
    copy_text(legacy, "identifier", &mut fields, "identifier");
    copy_text(legacy, "substanceName", &mut fields, "name");
    copy_text(legacy, "inn", &mut fields, "inn");
    copy_text(legacy, "casNumber", &mut fields, "casNumber");
    copy_text(legacy, "molecularFormula", &mut fields, "molecularFormula");
    if let Some(weight) = legacy.get("molecularWeight") {
        fields.insert("molecularWeight".to_owned(), weight.clone());
    }
    if let Some(category) = text_of(legacy, "substanceType") {
        carry.add_code(SUBSTANCE_CATEGORY_SYSTEM, category);
        fields.insert(
            "category".to_owned(),
            FieldValue::Concepts(vec![coded(SUBSTANCE_CATEGORY_SYSTEM, category)]),
        );
    }
    fields
}

fn product_fields(
    store: &ResourceStore,
    legacy: &FieldMap,
    carry: &mut Carry,
) -> IdmpResult<FieldMap> {
    let mut fields = FieldMap::new();
    copy_text(legacy, "mpid", &mut fields, "identifier");
    copy_text(legacy, "description", &mut fields, "description");

    let mut names = Vec::new();
    if let Some(name) = text_of(legacy, NAME_FIELD) {
        names.push(ProductName::from_legacy_string(name)?);
    }
    if let Some(inn) = text_of(legacy, "nonproprietaryName") {
        names.push(
            ProductName::from_legacy_string(inn)?.with_type(CodeableConcept::from_text("INN")),
        );
    }
    if !names.is_empty() {
        fields.insert(NAME_FIELD.to_owned(), ProductName::field_value(names));
    }

    if let Some(product_type) = text_of(legacy, "productType") {
        carry.add_code(PRODUCT_TYPE_SYSTEM, product_type);
        fields.insert(
            "medicinalProductType".to_owned(),
            FieldValue::Concept(coded(PRODUCT_TYPE_SYSTEM, product_type)),
        );
    }
    if let Some(atc) = text_of(legacy, "atcCode") {
        carry.add_code(ATC_SYSTEM, atc);
        fields.insert(
            "classification".to_owned(),
            FieldValue::Concepts(vec![coded(ATC_SYSTEM, atc)]),
        );
    }
    if let Some(status) = text_of(legacy, "legalStatusOfSupply") {
        carry.add_code(LEGAL_STATUS_SYSTEM, status);
        fields.insert(
            "legalStatusOfSupply".to_owned(),
            FieldValue::Concept(coded(LEGAL_STATUS_SYSTEM, status)),
        );
    }

    if let Some(FieldValue::MultiReference(refs)) = legacy.get("ingredient") {
        let substances = folder_for(SUBSTANCE)?;
        let mut ingredients = Vec::with_capacity(refs.len());
        for reference in refs {
            let legacy_substance = store.get_by_id(&reference.id)?;
            let migrated = store
                .find_at(&substances, &legacy_substance.key)?
                .ok_or_else(|| {
                    IdmpError::NotFound(format!(
                        "ingredient {} has not been migrated",
                        legacy_substance.path()
                    ))
                })?;
            ingredients.push(migrated.reference());
        }
        fields.insert(
            "ingredient".to_owned(),
            FieldValue::MultiReference(ingredients),
        );
    }
    Ok(fields)
}

fn text_of<'a>(fields: &'a FieldMap, name: &str) -> Option<&'a str> {
    match fields.get(name) {
        Some(FieldValue::Text(value)) if !value.trim().is_empty() => Some(value.trim()),
        _ => None,
    }
}

fn copy_text(from: &FieldMap, name: &str, to: &mut FieldMap, target: &str) {
    if let Some(value) = text_of(from, name) {
        to.insert(target.to_owned(), FieldValue::text(value));
    }
}

fn coded(system: &str, code: &str) -> CodeableConcept {
    CodeableConcept::from_coding(Coding::new(system, code))
}

fn text(name: &str, value: &str) -> (String, FieldValue) {
    (name.to_owned(), FieldValue::text(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::migration::{InstallBaseTypes, InstallSupportTypes};
    use crate::schema::SchemaRegistry;
    use crate::store::{Clause, Query};
    use idmp_types::Location;
    use std::str::FromStr;
    use std::sync::Arc;

    fn installed_store() -> ResourceStore {
        let store = ResourceStore::open(
            Arc::new(CoreConfig::in_memory()),
            Arc::new(SchemaRegistry::in_memory()),
        )
        .expect("store");
        let ctx = StepContext::new(&store);
        InstallBaseTypes.run(&ctx, &Carry::default()).expect("base");
        InstallSupportTypes.run(&ctx, &Carry::default()).expect("support");
        store
    }

    #[test]
    fn seeding_is_idempotent() {
        let store = installed_store();
        let first = seed_demo_data(&store).unwrap();
        assert_eq!(first.created, 4);
        let second = seed_demo_data(&store).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.unchanged, 4);
    }

    #[test]
    fn migrates_products_with_remapped_ingredients() {
        let store = installed_store();
        seed_demo_data(&store).unwrap();
        let ctx = StepContext::new(&store);

        let report = MigrateLegacyData.run(&ctx, &Carry::default()).unwrap();
        assert!(report.is_success(), "{:?}", report.outcomes);
        assert_eq!(report.created, 4);
        assert_eq!(report.schema_changes, 1);
        assert!(report.carry.contains(ATC_SYSTEM, "M01AE01"));

        let substance = store
            .get_by_location("/IDMP/Substances/paracetamol")
            .expect("substance migrated");
        assert_eq!(substance.fields["name"], FieldValue::text("Paracétamol"));
        assert_eq!(
            substance.fields["molecularWeight"],
            FieldValue::Number(Decimal::from_str("151.163").unwrap())
        );

        let doliprane = store
            .get_by_location("/IDMP/MedicinalProducts/doliprane-500")
            .expect("product migrated");
        assert_eq!(doliprane.fields["identifier"], FieldValue::text("FR-001"));
        assert_eq!(
            doliprane.fields["ingredient"],
            FieldValue::MultiReference(vec![substance.reference()])
        );
        assert_eq!(
            doliprane.fields["name"],
            ProductName::field_value(vec![
                ProductName::from_legacy_string("Doliprane 500mg").unwrap()
            ])
        );

        assert_eq!(store.checkpoint(LEGACY_CHECKPOINT).unwrap(), 4);
    }

    #[test]
    fn second_run_starts_after_checkpoint() {
        let store = installed_store();
        seed_demo_data(&store).unwrap();
        let ctx = StepContext::new(&store);
        MigrateLegacyData.run(&ctx, &Carry::default()).unwrap();

        let again = MigrateLegacyData.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.schema_changes, 0);
        assert_eq!(again.outcomes.len(), 1, "only the schema outcome");
    }

    #[test]
    fn failed_item_holds_checkpoint_but_later_items_migrate() {
        let store = installed_store();
        let ctx = StepContext::new(&store);
        let products = folder_for(LEGACY_MEDICINAL_PRODUCT).unwrap();
        let create = |key: &str, fields: FieldMap| {
            store
                .create(
                    NewResource::new(
                        LEGACY_MEDICINAL_PRODUCT,
                        products.clone(),
                        ResourceKey::new(key).unwrap(),
                    )
                    .with_fields(fields),
                )
                .unwrap()
        };
        let ok = create(
            "first",
            FieldMap::from([text("mpid", "FR-100"), text("productName", "First")]),
        );
        // No MPID: the migrated product misses its mandatory identifier.
        create("broken", FieldMap::from([text("productName", "Broken")]));
        create(
            "last",
            FieldMap::from([text("mpid", "FR-102"), text("productName", "Last")]),
        );

        let report = MigrateLegacyData.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(report.created, 2);
        let failures: Vec<&str> = report.failures().map(|o| o.item.as_str()).collect();
        assert_eq!(failures, vec!["/Legacy/MedicinalProducts/broken"]);
        assert_eq!(store.checkpoint(LEGACY_CHECKPOINT).unwrap(), ok.sequence);

        let target = Location::new("/IDMP/MedicinalProducts").unwrap();
        assert!(store
            .find_at(&target, &ResourceKey::new("last").unwrap())
            .unwrap()
            .is_some());

        let retry = MigrateLegacyData.run(&ctx, &Carry::default()).unwrap();
        assert_eq!(retry.created, 0);
        assert_eq!(retry.failures().count(), 1);
        assert_eq!(retry.unchanged, 1, "last is found at its target");
    }

    #[test]
    fn migrated_products_are_searchable_by_classification() {
        let store = installed_store();
        seed_demo_data(&store).unwrap();
        MigrateLegacyData
            .run(&StepContext::new(&store), &Carry::default())
            .unwrap();

        let page = store
            .query(
                MEDICINAL_PRODUCT,
                &Query::matching(Clause::equals("classification", "N02BA01")),
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].key.as_str(), "aspirine-500");
    }
}
