//! Constants used throughout the IDMP core crate.
//!
//! This module contains path, filename and default constants to ensure
//! consistency across the codebase.

/// Directory name for schema YAML files.
pub const SCHEMAS_DIR_NAME: &str = "schemas";

/// Directory name for stored resource instances.
pub const RESOURCES_DIR_NAME: &str = "resources";

/// Directory name for migration checkpoints.
pub const CHECKPOINTS_DIR_NAME: &str = "checkpoints";

/// Directory name for derived artifacts rebuilt by the installer.
pub const ARTIFACTS_DIR_NAME: &str = "artifacts";

/// Filename for a stored resource instance.
pub const RESOURCE_JSON_FILENAME: &str = "resource.json";

/// Filename for the store's next insertion sequence.
pub const SEQUENCE_JSON_FILENAME: &str = "sequence.json";

/// Filename for the derived capability statement.
pub const CAPABILITY_JSON_FILENAME: &str = "capability.json";

/// Default maximum nesting depth for recursive tree fields.
pub const DEFAULT_MAX_TREE_DEPTH: usize = 2;

/// Default search page size.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Largest page size a search may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Software name advertised in the capability statement.
pub const SOFTWARE_NAME: &str = "idmp-registry";
