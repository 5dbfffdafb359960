//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Environment variables are read by the binaries only; the helpers
//! here validate the raw values they hand over.

use crate::constants::{
    ARTIFACTS_DIR_NAME, CHECKPOINTS_DIR_NAME, DEFAULT_MAX_TREE_DEPTH, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE, RESOURCES_DIR_NAME, SCHEMAS_DIR_NAME,
};
use crate::{IdmpError, IdmpResult};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: Option<PathBuf>,
    max_tree_depth: usize,
    default_page_size: usize,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// `data_dir` of `None` keeps every schema and resource in memory.
    pub fn new(
        data_dir: Option<PathBuf>,
        max_tree_depth: usize,
        default_page_size: usize,
    ) -> IdmpResult<Self> {
        if max_tree_depth == 0 {
            return Err(IdmpError::InvalidInput(
                "max_tree_depth must be at least 1".into(),
            ));
        }
        if default_page_size == 0 || default_page_size > MAX_PAGE_SIZE {
            return Err(IdmpError::InvalidInput(format!(
                "default_page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        Ok(Self {
            data_dir,
            max_tree_depth,
            default_page_size,
        })
    }

    /// In-memory configuration with default limits.
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn schemas_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(SCHEMAS_DIR_NAME))
    }

    pub fn resources_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(RESOURCES_DIR_NAME))
    }

    pub fn checkpoints_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(CHECKPOINTS_DIR_NAME))
    }

    pub fn artifacts_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(ARTIFACTS_DIR_NAME))
    }

    pub fn max_tree_depth(&self) -> usize {
        self.max_tree_depth
    }

    pub fn default_page_size(&self) -> usize {
        self.default_page_size
    }

    pub fn max_page_size(&self) -> usize {
        MAX_PAGE_SIZE
    }
}

/// Parse the data directory from an optional string value.
///
/// `None` or empty/whitespace selects in-memory storage.
pub fn data_dir_from_env_value(value: Option<String>) -> Option<PathBuf> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parse the maximum tree depth from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns [`DEFAULT_MAX_TREE_DEPTH`].
pub fn max_tree_depth_from_env_value(value: Option<String>) -> IdmpResult<usize> {
    positive_from_env_value("IDMP_MAX_TREE_DEPTH", value, DEFAULT_MAX_TREE_DEPTH)
}

/// Parse the default search page size from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns [`DEFAULT_PAGE_SIZE`].
pub fn default_page_size_from_env_value(value: Option<String>) -> IdmpResult<usize> {
    positive_from_env_value("IDMP_DEFAULT_COUNT", value, DEFAULT_PAGE_SIZE)
}

/// Parse a boolean flag such as `IDMP_AUTO_INSTALL`. Accepts `1/0`, `true/false`, `yes/no`.
pub fn flag_from_env_value(name: &str, value: Option<String>) -> IdmpResult<bool> {
    let value = value
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty());
    match value.as_deref() {
        None | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => Err(IdmpError::InvalidInput(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

fn positive_from_env_value(name: &str, value: Option<String>, default: usize) -> IdmpResult<usize> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let Some(raw) = value else {
        return Ok(default);
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(IdmpError::InvalidInput(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_depth_defaults_when_unset() {
        assert_eq!(max_tree_depth_from_env_value(None).unwrap(), 2);
        assert_eq!(max_tree_depth_from_env_value(Some("  ".into())).unwrap(), 2);
        assert_eq!(max_tree_depth_from_env_value(Some("4".into())).unwrap(), 4);
    }

    #[test]
    fn tree_depth_rejects_zero_and_garbage() {
        assert!(max_tree_depth_from_env_value(Some("0".into())).is_err());
        let err = max_tree_depth_from_env_value(Some("deep".into())).expect_err("should fail");
        assert!(err.to_string().contains("IDMP_MAX_TREE_DEPTH"));
    }

    #[test]
    fn data_dir_absent_means_in_memory() {
        assert_eq!(data_dir_from_env_value(None), None);
        assert_eq!(data_dir_from_env_value(Some("".into())), None);
        assert_eq!(
            data_dir_from_env_value(Some("/var/idmp".into())),
            Some(PathBuf::from("/var/idmp"))
        );
    }

    #[test]
    fn flag_parsing() {
        assert!(!flag_from_env_value("X", None).unwrap());
        assert!(flag_from_env_value("X", Some("TRUE".into())).unwrap());
        assert!(!flag_from_env_value("X", Some("0".into())).unwrap());
        assert!(flag_from_env_value("X", Some("maybe".into())).is_err());
    }

    #[test]
    fn config_derives_layout_from_data_dir() {
        let cfg = CoreConfig::new(Some(PathBuf::from("/data")), 2, 10).unwrap();
        assert_eq!(cfg.schemas_dir(), Some(PathBuf::from("/data/schemas")));
        assert_eq!(cfg.resources_dir(), Some(PathBuf::from("/data/resources")));
        assert!(CoreConfig::in_memory().artifacts_dir().is_none());
    }

    #[test]
    fn config_rejects_bad_limits() {
        assert!(CoreConfig::new(None, 0, 10).is_err());
        assert!(CoreConfig::new(None, 2, 0).is_err());
        assert!(CoreConfig::new(None, 2, 101).is_err());
    }
}
