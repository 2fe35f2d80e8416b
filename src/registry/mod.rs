//! Resource registry: statement and table bindings, plus the explicit
//! field-to-column whitelist each resource exposes to policy rules.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::parser::names::normalize_relation_name;
use crate::range::filter::RangeFilterContext;

/// Fluent, fail-fast registry construction.
pub mod builder;
/// Validated column references and field-map keys.
pub mod column;
/// Naming-convention fallback for unmapped tables.
pub mod convention;
/// Identifier whitelist grammar.
pub mod validator;

pub use builder::{ResourceDeclaration, ResourceRegistryBuilder};
pub use column::{ColumnRef, ResourceFieldKey};
pub use convention::{ConventionFallbackRegistry, ConventionResolver, PrefixConvention};
pub use validator::ColumnNameValidator;

/// Read-only mapping from physical query metadata to logical resources.
pub trait ResourceRegistry: Send + Sync {
    /// Resolve the resource governing a statement.
    ///
    /// A statement mapping wins over a table mapping. `None` means the
    /// statement is not governed, which is different from a denial.
    fn resolve_resource(&self, table: Option<&str>, statement_id: Option<&str>) -> Option<String>;

    /// Column declared for `field_key` on `resource`.
    fn resolve_column(&self, resource: &str, field_key: &str) -> Result<ColumnRef>;

    /// Declared tables and whitelisted columns of `resource`.
    fn filter_context(&self, resource: &str) -> RangeFilterContext;
}

impl<R: ResourceRegistry + ?Sized> ResourceRegistry for Arc<R> {
    fn resolve_resource(&self, table: Option<&str>, statement_id: Option<&str>) -> Option<String> {
        (**self).resolve_resource(table, statement_id)
    }

    fn resolve_column(&self, resource: &str, field_key: &str) -> Result<ColumnRef> {
        (**self).resolve_column(resource, field_key)
    }

    fn filter_context(&self, resource: &str) -> RangeFilterContext {
        (**self).filter_context(resource)
    }
}

/// Immutable map-backed registry produced by [`ResourceRegistryBuilder::build`].
#[derive(Debug, Clone)]
pub struct DefaultResourceRegistry {
    statements: HashMap<String, String>,
    tables: HashMap<String, String>,
    fields: HashMap<ResourceFieldKey, ColumnRef>,
    contexts: HashMap<String, RangeFilterContext>,
    validator: ColumnNameValidator,
}

impl DefaultResourceRegistry {
    pub(crate) fn new(
        statements: HashMap<String, String>,
        tables: HashMap<String, String>,
        fields: HashMap<ResourceFieldKey, ColumnRef>,
        resource_tables: HashMap<String, BTreeSet<String>>,
        validator: ColumnNameValidator,
    ) -> Self {
        let mut contexts: HashMap<String, (BTreeSet<String>, BTreeSet<String>)> = resource_tables
            .into_iter()
            .map(|(resource, tables)| (resource, (tables, BTreeSet::new())))
            .collect();
        for (key, column) in &fields {
            let (tables, columns) = contexts.entry(key.resource.clone()).or_default();
            if let Some(table) = column.table() {
                tables.insert(table.to_ascii_lowercase());
            }
            columns.insert(column.column().to_ascii_lowercase());
        }
        let contexts = contexts
            .into_iter()
            .map(|(resource, (tables, columns))| {
                let context = RangeFilterContext::new(resource.clone(), tables, columns);
                (resource, context)
            })
            .collect();

        Self {
            statements,
            tables,
            fields,
            contexts,
            validator,
        }
    }

    /// Every resource with at least one binding, sorted.
    pub fn resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.contexts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ResourceRegistry for DefaultResourceRegistry {
    fn resolve_resource(&self, table: Option<&str>, statement_id: Option<&str>) -> Option<String> {
        if let Some(resource) = statement_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .and_then(|id| self.statements.get(id))
        {
            return Some(resource.clone());
        }
        let table = table.map(str::trim).filter(|t| !t.is_empty())?;
        self.tables.get(&normalize_relation_name(table)).cloned()
    }

    fn resolve_column(&self, resource: &str, field_key: &str) -> Result<ColumnRef> {
        let key = ResourceFieldKey::new(resource, field_key);
        let column = self
            .fields
            .get(&key)
            .ok_or_else(|| Error::UnregisteredField {
                resource: resource.to_string(),
                field_key: field_key.to_string(),
            })?;
        self.validator.validate_table(column.table())?;
        self.validator.validate(column.column())?;
        Ok(column.clone())
    }

    fn filter_context(&self, resource: &str) -> RangeFilterContext {
        self.contexts
            .get(resource)
            .cloned()
            .unwrap_or_else(|| RangeFilterContext::empty(resource))
    }
}
