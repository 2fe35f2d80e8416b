//! Declarative configuration loaded from JSON.
//!
//! ```json
//! {
//!   "permission": {"fail_closed": true, "apply_to_write": false, "dialect": "postgres"},
//!   "cache": {"max_entries": 10000, "ttl_secs": 3600},
//!   "registry": {
//!     "convention": {"enabled": true, "prefixes": ["t_"]},
//!     "resources": [{
//!       "name": "ORDER",
//!       "tables": ["t_order"],
//!       "statements": ["com.x.OrderMapper.selectPage"],
//!       "fields": {"deptId": {"table": "t_order", "column": "dept_id"}}
//!     }]
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::ChangeDetectorConfig;
use crate::parser::sql_parser::SqlDialect;

/// Behavior switches of the bridge and interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionOptions {
    /// On missing context, missing policy or evaluation failure, append
    /// `1 = 0` (`true`) or nothing (`false`).
    pub fail_closed: bool,
    /// Also filter DELETE and UPDATE statements.
    pub apply_to_write: bool,
    /// Dialect used to parse host statements.
    pub dialect: SqlDialect,
}

impl Default for PermissionOptions {
    fn default() -> Self {
        Self {
            fail_closed: true,
            apply_to_write: false,
            dialect: SqlDialect::Generic,
        }
    }
}

/// Bounds of the shared predicate cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Maximum number of cached scopes before eviction starts.
    pub max_entries: u64,
    /// Seconds an entry lives after it was compiled.
    pub ttl_secs: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 3_600,
        }
    }
}

/// Naming-convention fallback settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConventionConfig {
    /// Whether unmapped tables fall back to the convention.
    #[serde(default)]
    pub enabled: bool,
    /// Table prefixes stripped before uppercasing.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
}

fn default_prefixes() -> Vec<String> {
    vec!["t_".to_string()]
}

/// Column behind a field key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Optional table qualifier.
    #[serde(default)]
    pub table: Option<String>,
    /// Column identifier.
    pub column: String,
}

/// Bindings of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource code.
    pub name: String,
    /// Physical tables.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Statement identifiers.
    #[serde(default)]
    pub statements: Vec<String>,
    /// Field whitelist.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldConfig>,
}

/// Registry declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Optional convention fallback.
    #[serde(default)]
    pub convention: Option<ConventionConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowscopeConfig {
    /// Bridge and interceptor switches.
    #[serde(default)]
    pub permission: PermissionOptions,
    /// Predicate cache bounds.
    #[serde(default)]
    pub cache: CacheOptions,
    /// Registry declarations.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Policy-store write detection.
    #[serde(default)]
    pub change_detector: ChangeDetectorConfig,
}

impl RowscopeConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}
