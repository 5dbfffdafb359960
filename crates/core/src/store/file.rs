//! File-backed storage.
//!
//! ```text
//! <data_dir>/
//!   sequence.json                      {"next_sequence": 42}
//!   checkpoints/
//!     legacy-migration.json            {"sequence": 17}
//!   resources/
//!     55/
//!       0e/
//!         550e8400e29b41d4a716446655440000/
//!           resource.json
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a crash never leaves
//! a half-written instance behind.

use super::backend::{StorageBackend, StoreMeta};
use super::ResourceInstance;
use crate::constants::{
    CHECKPOINTS_DIR_NAME, RESOURCES_DIR_NAME, RESOURCE_JSON_FILENAME, SEQUENCE_JSON_FILENAME,
};
use crate::{IdmpError, IdmpResult};
use idmp_uuid::ResourceId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Persists instances as sharded JSON files under a data directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) the layout under `root`.
    pub fn open(root: &Path) -> IdmpResult<Self> {
        fs::create_dir_all(root.join(RESOURCES_DIR_NAME)).map_err(IdmpError::StorageWrite)?;
        fs::create_dir_all(root.join(CHECKPOINTS_DIR_NAME)).map_err(IdmpError::StorageWrite)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn resources_dir(&self) -> PathBuf {
        self.root.join(RESOURCES_DIR_NAME)
    }

    fn instance_dir(&self, id: &ResourceId) -> PathBuf {
        id.sharded_dir(&self.resources_dir())
    }
}

impl StorageBackend for FileBackend {
    fn load_all(&self) -> IdmpResult<Vec<ResourceInstance>> {
        let mut instances = Vec::new();
        // resources/<s1>/<s2>/<id>/resource.json
        for s1 in read_dirs(&self.resources_dir())? {
            for s2 in read_dirs(&s1)? {
                for dir in read_dirs(&s2)? {
                    let file = dir.join(RESOURCE_JSON_FILENAME);
                    if !file.is_file() {
                        continue;
                    }
                    let raw = fs::read_to_string(&file).map_err(IdmpError::StorageRead)?;
                    let instance: ResourceInstance =
                        serde_json::from_str(&raw).map_err(IdmpError::Deserialization)?;
                    instances.push(instance);
                }
            }
        }
        Ok(instances)
    }

    fn write(&self, instance: &ResourceInstance) -> IdmpResult<()> {
        let dir = self.instance_dir(&instance.id);
        fs::create_dir_all(&dir).map_err(IdmpError::StorageWrite)?;
        let json = serde_json::to_string_pretty(instance).map_err(IdmpError::Serialization)?;
        write_atomic(&dir.join(RESOURCE_JSON_FILENAME), json.as_bytes())
    }

    fn remove(&self, id: &ResourceId) -> IdmpResult<()> {
        let dir = self.instance_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IdmpError::StorageWrite(e)),
        }
    }

    fn load_meta(&self) -> IdmpResult<StoreMeta> {
        let mut meta = StoreMeta::default();

        let sequence_file = self.root.join(SEQUENCE_JSON_FILENAME);
        if sequence_file.is_file() {
            let raw = fs::read_to_string(&sequence_file).map_err(IdmpError::StorageRead)?;
            let wire: SequenceWire =
                serde_json::from_str(&raw).map_err(IdmpError::Deserialization)?;
            meta.next_sequence = wire.next_sequence;
        }

        for entry in
            fs::read_dir(self.root.join(CHECKPOINTS_DIR_NAME)).map_err(IdmpError::StorageRead)?
        {
            let path = entry.map_err(IdmpError::StorageRead)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = fs::read_to_string(&path).map_err(IdmpError::StorageRead)?;
            let wire: CheckpointWire =
                serde_json::from_str(&raw).map_err(IdmpError::Deserialization)?;
            meta.checkpoints.insert(name.to_owned(), wire.sequence);
        }
        Ok(meta)
    }

    fn write_meta(&self, meta: &StoreMeta) -> IdmpResult<()> {
        let sequence = serde_json::to_string(&SequenceWire {
            next_sequence: meta.next_sequence,
        })
        .map_err(IdmpError::Serialization)?;
        write_atomic(&self.root.join(SEQUENCE_JSON_FILENAME), sequence.as_bytes())?;

        let checkpoints_dir = self.root.join(CHECKPOINTS_DIR_NAME);
        for (name, sequence) in &meta.checkpoints {
            let path = checkpoints_dir.join(format!("{name}.json"));
            let json = serde_json::to_string(&CheckpointWire {
                sequence: *sequence,
            })
            .map_err(IdmpError::Serialization)?;
            write_atomic(&path, json.as_bytes())?;
        }
        Ok(())
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SequenceWire {
    next_sequence: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckpointWire {
    sequence: u64,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn read_dirs(dir: &Path) -> IdmpResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(IdmpError::StorageRead(e)),
    };
    for entry in entries {
        let path = entry.map_err(IdmpError::StorageRead)?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> IdmpResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(IdmpError::StorageWrite)?;
    fs::rename(&tmp, path).map_err(IdmpError::StorageWrite)
}
