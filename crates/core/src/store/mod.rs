//! Resource store.
//!
//! Stores instances of registered resource types. Every instance has a canonical id, lives at a
//! location (`parent` folder + `key`), carries a draft/published flag and a validated field map.
//!
//! The store validates every write against the instance's [`ResourceType`]:
//! - values must fit their field kinds and constraints
//! - mandatory fields must be present
//! - unique fields must not collide with another instance of the same type
//! - references must point at existing instances of an allowed type
//!
//! All mutations are serialised through one store-level mutex, so the `(parent, key)` check and
//! the insert that follows are atomic. Persistence is delegated to a [`StorageBackend`].

mod backend;
mod file;
mod query;

pub use backend::{MemoryBackend, StorageBackend, StoreMeta};
pub use file::FileBackend;
pub use query::{Clause, Filter, MatchOp, Query, QueryPage, SortKey};

use crate::config::CoreConfig;
use crate::schema::{ResourceType, SchemaRegistry};
use crate::validate::Validation;
use crate::value::FieldMap;
use crate::{IdmpError, IdmpResult};
use chrono::{DateTime, Utc};
use fhir::ResourceRef;
use idmp_types::{Location, ResourceKey};
use idmp_uuid::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// Public domain-level types
// ============================================================================

/// A stored instance of a resource type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub id: ResourceId,
    pub resource_type: String,
    pub key: ResourceKey,
    pub parent: Location,
    pub published: bool,
    pub fields: FieldMap,
    /// Starts at 1, incremented on every write.
    pub version: u64,
    /// Store-assigned insertion order.
    pub sequence: u64,
    pub last_updated: DateTime<Utc>,
}

impl ResourceInstance {
    /// Full location path, e.g. `/IDMP/Substances/paracetamol`.
    pub fn path(&self) -> String {
        self.parent.path_of(&self.key)
    }

    /// A reference to this instance.
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.resource_type.clone(), self.id)
    }
}

/// Input for [`ResourceStore::create`].
#[derive(Clone, Debug)]
pub struct NewResource {
    pub resource_type: String,
    pub key: ResourceKey,
    pub parent: Location,
    pub published: bool,
    pub fields: FieldMap,
}

impl NewResource {
    /// A published resource with no fields yet.
    pub fn new(resource_type: impl Into<String>, parent: Location, key: ResourceKey) -> Self {
        Self {
            resource_type: resource_type.into(),
            key,
            parent,
            published: true,
            fields: FieldMap::new(),
        }
    }

    pub fn with_fields(mut self, fields: FieldMap) -> Self {
        self.fields = fields;
        self
    }

    pub fn draft(mut self) -> Self {
        self.published = false;
        self
    }
}

// ============================================================================
// Resource store service
// ============================================================================

/// Resource store service. Safe to share via `Arc`.
#[derive(Debug)]
pub struct ResourceStore {
    cfg: Arc<CoreConfig>,
    registry: Arc<SchemaRegistry>,
    backend: Box<dyn StorageBackend>,
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    instances: BTreeMap<u64, ResourceInstance>,
    by_id: HashMap<ResourceId, u64>,
    by_path: HashMap<String, u64>,
    meta: StoreMeta,
}

impl StoreState {
    fn insert(&mut self, instance: ResourceInstance) {
        self.by_id.insert(instance.id, instance.sequence);
        self.by_path.insert(instance.path(), instance.sequence);
        self.instances.insert(instance.sequence, instance);
    }

    fn remove(&mut self, id: &ResourceId) -> Option<ResourceInstance> {
        let sequence = self.by_id.remove(id)?;
        let instance = self.instances.remove(&sequence)?;
        self.by_path.remove(&instance.path());
        Some(instance)
    }

    fn get(&self, id: &ResourceId) -> Option<&ResourceInstance> {
        self.by_id.get(id).and_then(|seq| self.instances.get(seq))
    }

    fn of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a ResourceInstance> {
        self.instances
            .values()
            .filter(move |i| i.resource_type == resource_type)
    }
}

impl ResourceStore {
    /// Open the store for `cfg`: file-backed when a data dir is set, in memory otherwise.
    pub fn open(cfg: Arc<CoreConfig>, registry: Arc<SchemaRegistry>) -> IdmpResult<Self> {
        let backend: Box<dyn StorageBackend> = match cfg.data_dir() {
            Some(dir) => Box::new(FileBackend::open(dir)?),
            None => Box::new(MemoryBackend::new()),
        };
        Self::with_backend(cfg, registry, backend)
    }

    /// Open the schema registry and the store for `cfg` together.
    pub fn from_config(cfg: Arc<CoreConfig>) -> IdmpResult<Self> {
        let registry = Arc::new(SchemaRegistry::from_config(&cfg)?);
        Self::open(cfg, registry)
    }

    /// Open the store over an explicit backend, loading everything it holds.
    pub fn with_backend(
        cfg: Arc<CoreConfig>,
        registry: Arc<SchemaRegistry>,
        backend: Box<dyn StorageBackend>,
    ) -> IdmpResult<Self> {
        let mut state = StoreState {
            meta: backend.load_meta()?,
            ..StoreState::default()
        };

        let mut loaded = backend.load_all()?;
        loaded.sort_by_key(|i| i.sequence);
        for instance in loaded {
            if state.by_path.contains_key(&instance.path()) {
                tracing::warn!(
                    id = %instance.id,
                    path = %instance.path(),
                    "skipping instance with duplicate location"
                );
                continue;
            }
            state.insert(instance);
        }

        let after_last = state.instances.keys().next_back().map_or(1, |seq| seq + 1);
        state.meta.next_sequence = state.meta.next_sequence.max(after_last);

        tracing::debug!(count = state.instances.len(), "resource store opened");
        Ok(Self {
            cfg,
            registry,
            backend,
            state: Mutex::new(state),
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.cfg
    }

    /// Create a new instance.
    ///
    /// # Errors
    ///
    /// - `UnsupportedResourceType` if the type is not registered
    /// - `DuplicateKey` if `(parent, key)` is taken or a unique field value is already used
    /// - `TypeMismatch`, `MissingRequiredField`, `TreeDepthExceeded`, `NotFound` from validation
    pub fn create(&self, new: NewResource) -> IdmpResult<ResourceInstance> {
        let resource_type = self.schema_for(&new.resource_type)?;
        let mut state = self.lock()?;

        let path = new.parent.path_of(&new.key);
        if state.by_path.contains_key(&path) {
            return Err(IdmpError::DuplicateKey(format!("{path} already exists")));
        }
        let fields = self.validate(&state, &resource_type, new.fields)?;
        check_unique(&state, &resource_type, &fields, None)?;

        let mut id = ResourceId::new();
        while state.by_id.contains_key(&id) {
            id = ResourceId::new();
        }
        let mut meta = state.meta.clone();
        let sequence = meta.next_sequence.max(1);
        meta.next_sequence = sequence + 1;

        let instance = ResourceInstance {
            id,
            resource_type: resource_type.name,
            key: new.key,
            parent: new.parent,
            published: new.published,
            fields,
            version: 1,
            sequence,
            last_updated: Utc::now(),
        };
        self.backend.write(&instance)?;
        self.backend.write_meta(&meta)?;
        state.meta = meta;
        state.insert(instance.clone());

        tracing::info!(
            resource_type = %instance.resource_type,
            id = %instance.id,
            path = %path,
            "resource created"
        );
        Ok(instance)
    }

    /// Replace the field map of an existing instance.
    pub fn update(&self, id: &ResourceId, fields: FieldMap) -> IdmpResult<ResourceInstance> {
        let mut state = self.lock()?;
        let existing = state
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))?;
        let resource_type = self.schema_for(&existing.resource_type)?;

        let fields = self.validate(&state, &resource_type, fields)?;
        check_unique(&state, &resource_type, &fields, Some(id))?;

        let updated = ResourceInstance {
            fields,
            version: existing.version + 1,
            last_updated: Utc::now(),
            ..existing
        };
        self.backend.write(&updated)?;
        state.insert(updated.clone());

        tracing::info!(
            resource_type = %updated.resource_type,
            id = %id,
            version = updated.version,
            "resource updated"
        );
        Ok(updated)
    }

    pub fn set_published(&self, id: &ResourceId, published: bool) -> IdmpResult<ResourceInstance> {
        let mut state = self.lock()?;
        let existing = state.get(id).cloned().ok_or_else(|| not_found(id))?;
        if existing.published == published {
            return Ok(existing);
        }
        let updated = ResourceInstance {
            published,
            version: existing.version + 1,
            last_updated: Utc::now(),
            ..existing
        };
        self.backend.write(&updated)?;
        state.insert(updated.clone());
        Ok(updated)
    }

    /// Delete an instance and its embedded values. Instances referring to it are left as they
    /// are.
    pub fn delete(&self, id: &ResourceId) -> IdmpResult<ResourceInstance> {
        let mut state = self.lock()?;
        if state.get(id).is_none() {
            return Err(not_found(id));
        }
        self.backend.remove(id)?;
        let removed = state.remove(id).ok_or_else(|| not_found(id))?;
        tracing::info!(resource_type = %removed.resource_type, id = %id, "resource deleted");
        Ok(removed)
    }

    pub fn get_by_id(&self, id: &ResourceId) -> IdmpResult<ResourceInstance> {
        self.lock()?.get(id).cloned().ok_or_else(|| not_found(id))
    }

    /// Look up an instance by its full path, e.g. `/IDMP/Substances/paracetamol`.
    pub fn get_by_location(&self, path: &str) -> IdmpResult<ResourceInstance> {
        let (parent, key) = Location::split_path(path)?;
        let full = parent.path_of(&key);
        let state = self.lock()?;
        state
            .by_path
            .get(&full)
            .and_then(|seq| state.instances.get(seq))
            .cloned()
            .ok_or_else(|| IdmpError::NotFound(format!("resource at {full}")))
    }

    /// Like [`get_by_location`](Self::get_by_location) but `None` instead of `NotFound`.
    pub fn find_at(
        &self,
        parent: &Location,
        key: &ResourceKey,
    ) -> IdmpResult<Option<ResourceInstance>> {
        let state = self.lock()?;
        Ok(state
            .by_path
            .get(&parent.path_of(key))
            .and_then(|seq| state.instances.get(seq))
            .cloned())
    }

    /// Search instances of `resource_type`.
    ///
    /// # Errors
    ///
    /// `UnsupportedResourceType` for an unregistered type and `InvalidInput` for a clause or
    /// sort key naming an unknown field.
    pub fn query(&self, resource_type: &str, request: &Query) -> IdmpResult<QueryPage> {
        let schema = self.schema_for(resource_type)?;
        query::check_query(&schema, request)?;

        let mut items: Vec<ResourceInstance> = {
            let state = self.lock()?;
            state
                .of_type(resource_type)
                .filter(|i| query::matches(i, request))
                .cloned()
                .collect()
        };
        if let Some(key) = &request.sort {
            query::sort(&mut items, key);
        }

        let total = items.len();
        let items = items
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(QueryPage { items, total })
    }

    /// Every instance of `resource_type`, drafts included, in insertion order.
    pub fn instances_of(&self, resource_type: &str) -> IdmpResult<Vec<ResourceInstance>> {
        Ok(self.lock()?.of_type(resource_type).cloned().collect())
    }

    pub fn count(&self, resource_type: &str) -> IdmpResult<usize> {
        Ok(self.lock()?.of_type(resource_type).count())
    }

    /// Move stored values from `from` to `to` after a schema rename. Returns how many instances
    /// changed.
    ///
    /// Nothing is written when any affected instance already holds a value under `to`.
    pub fn rename_field_values(
        &self,
        resource_type: &str,
        from: &str,
        to: &str,
    ) -> IdmpResult<usize> {
        let mut state = self.lock()?;
        let affected: Vec<ResourceInstance> = state
            .of_type(resource_type)
            .filter(|i| i.fields.contains_key(from))
            .cloned()
            .collect();
        if let Some(clash) = affected.iter().find(|i| i.fields.contains_key(to)) {
            return Err(IdmpError::DuplicateFieldName {
                resource_type: resource_type.to_owned(),
                field: format!("{to} (on {})", clash.path()),
            });
        }

        for mut instance in affected.iter().cloned() {
            if let Some(value) = instance.fields.remove(from) {
                instance.fields.insert(to.to_owned(), value);
            }
            instance.version += 1;
            instance.last_updated = Utc::now();
            self.backend.write(&instance)?;
            state.insert(instance);
        }

        if !affected.is_empty() {
            tracing::info!(
                resource_type,
                from,
                to,
                count = affected.len(),
                "field values renamed"
            );
        }
        Ok(affected.len())
    }

    /// Re-run validation of a stored instance against its current schema.
    pub fn check(&self, instance: &ResourceInstance) -> IdmpResult<()> {
        let resource_type = self.schema_for(&instance.resource_type)?;
        let state = self.lock()?;
        self.validate(&state, &resource_type, instance.fields.clone())?;
        check_unique(&state, &resource_type, &instance.fields, Some(&instance.id))
    }

    /// The high-water mark stored under `name`; 0 when never set.
    pub fn checkpoint(&self, name: &str) -> IdmpResult<u64> {
        Ok(self
            .lock()?
            .meta
            .checkpoints
            .get(name)
            .copied()
            .unwrap_or(0))
    }

    pub fn set_checkpoint(&self, name: &str, sequence: u64) -> IdmpResult<()> {
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            || name.is_empty()
        {
            return Err(IdmpError::InvalidInput(format!(
                "checkpoint name '{name}' must be ASCII letters, digits, '-' or '_'"
            )));
        }
        let mut state = self.lock()?;
        let mut meta = state.meta.clone();
        meta.checkpoints.insert(name.to_owned(), sequence);
        self.backend.write_meta(&meta)?;
        state.meta = meta;
        Ok(())
    }

    fn schema_for(&self, resource_type: &str) -> IdmpResult<ResourceType> {
        self.registry.get(resource_type).map_err(|err| match err {
            IdmpError::NotFound(_) => IdmpError::UnsupportedResourceType(resource_type.to_owned()),
            other => other,
        })
    }

    fn validate(
        &self,
        state: &StoreState,
        resource_type: &ResourceType,
        fields: FieldMap,
    ) -> IdmpResult<FieldMap> {
        let lookup = |id: &ResourceId| -> Option<String> {
            state.get(id).map(|i| i.resource_type.clone())
        };
        let validation = Validation {
            max_tree_depth: self.cfg.max_tree_depth(),
            lookup: Some(&lookup),
            require_targets: true,
        };
        validation.validate(&resource_type.name, &resource_type.fields, fields)
    }

    fn lock(&self) -> IdmpResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| IdmpError::LockPoisoned)
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn not_found(id: &ResourceId) -> IdmpError {
    IdmpError::NotFound(format!("resource {id}"))
}

fn check_unique(
    state: &StoreState,
    resource_type: &ResourceType,
    fields: &FieldMap,
    exclude: Option<&ResourceId>,
) -> IdmpResult<()> {
    for definition in resource_type.fields.iter().filter(|d| d.unique) {
        let Some(value) = fields.get(&definition.name).and_then(query::scalar_text) else {
            continue;
        };
        let clash = state.of_type(&resource_type.name).find(|other| {
            Some(&other.id) != exclude
                && other
                    .fields
                    .get(&definition.name)
                    .and_then(query::scalar_text)
                    .as_deref()
                    == Some(value.as_str())
        });
        if let Some(other) = clash {
            return Err(IdmpError::DuplicateKey(format!(
                "{}.{} '{value}' is already used by {}",
                resource_type.name,
                definition.name,
                other.path()
            )));
        }
    }
    Ok(())
}
