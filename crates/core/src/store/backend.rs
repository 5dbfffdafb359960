//! Storage backends for the resource store.
//!
//! A backend only persists; indexing, validation and locking live in
//! [`ResourceStore`](super::ResourceStore). Every call is made while the store holds its write
//! lock, so backends need no locking of their own beyond what `Send + Sync` demands.

use super::ResourceInstance;
use crate::{IdmpError, IdmpResult};
use idmp_uuid::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

/// Store-wide bookkeeping persisted next to the instances.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Sequence number handed to the next created instance. Starts at 1.
    pub next_sequence: u64,
    /// Named high-water marks, e.g. the last migrated legacy instance.
    pub checkpoints: BTreeMap<String, u64>,
}

/// Persistence seam of the resource store.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Every persisted instance, in any order.
    fn load_all(&self) -> IdmpResult<Vec<ResourceInstance>>;

    /// Create or overwrite one instance.
    fn write(&self, instance: &ResourceInstance) -> IdmpResult<()>;

    fn remove(&self, id: &ResourceId) -> IdmpResult<()>;

    fn load_meta(&self) -> IdmpResult<StoreMeta>;

    fn write_meta(&self, meta: &StoreMeta) -> IdmpResult<()>;
}

/// Keeps instances in process memory only.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    instances: Mutex<HashMap<ResourceId, ResourceInstance>>,
    meta: Mutex<StoreMeta>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load_all(&self) -> IdmpResult<Vec<ResourceInstance>> {
        let instances = self.instances.lock().map_err(|_| IdmpError::LockPoisoned)?;
        Ok(instances.values().cloned().collect())
    }

    fn write(&self, instance: &ResourceInstance) -> IdmpResult<()> {
        self.instances
            .lock()
            .map_err(|_| IdmpError::LockPoisoned)?
            .insert(instance.id, instance.clone());
        Ok(())
    }

    fn remove(&self, id: &ResourceId) -> IdmpResult<()> {
        self.instances
            .lock()
            .map_err(|_| IdmpError::LockPoisoned)?
            .remove(id);
        Ok(())
    }

    fn load_meta(&self) -> IdmpResult<StoreMeta> {
        Ok(self.meta.lock().map_err(|_| IdmpError::LockPoisoned)?.clone())
    }

    fn write_meta(&self, meta: &StoreMeta) -> IdmpResult<()> {
        *self.meta.lock().map_err(|_| IdmpError::LockPoisoned)? = meta.clone();
        Ok(())
    }
}
