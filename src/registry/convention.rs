use crate::error::Result;
use crate::parser::names::normalize_relation_name;
use crate::range::filter::RangeFilterContext;
use crate::registry::column::ColumnRef;
use crate::registry::validator::ColumnNameValidator;
use crate::registry::ResourceRegistry;

/// Derives a resource code from a physical table name.
pub trait ConventionResolver: Send + Sync {
    /// Resource for `table`, or `None` when the convention does not apply.
    fn resource_for_table(&self, table: &str) -> Option<String>;
}

/// Strip a known prefix and uppercase the remainder: `t_order` -> `ORDER`.
#[derive(Debug, Clone)]
pub struct PrefixConvention {
    prefixes: Vec<String>,
    validator: ColumnNameValidator,
}

impl PrefixConvention {
    /// Convention with the given prefixes, tried in order.
    pub fn new(prefixes: Vec<String>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            validator: ColumnNameValidator::default(),
        }
    }
}

impl Default for PrefixConvention {
    fn default() -> Self {
        Self::new(vec!["t_".to_string()])
    }
}

impl ConventionResolver for PrefixConvention {
    fn resource_for_table(&self, table: &str) -> Option<String> {
        let table = normalize_relation_name(table);
        self.validator.validate(&table).ok()?;
        let stem = self
            .prefixes
            .iter()
            .find_map(|prefix| table.strip_prefix(prefix.as_str()))
            .unwrap_or(&table);
        if stem.is_empty() {
            return None;
        }
        Some(stem.to_ascii_uppercase())
    }
}

/// Registry decorator that falls back to a naming convention when no
/// explicit statement or table mapping exists.
///
/// Only [`resolve_resource`](ResourceRegistry::resolve_resource) consults the
/// convention. Columns are never inferred.
#[derive(Debug, Clone)]
pub struct ConventionFallbackRegistry<R, C = PrefixConvention> {
    inner: R,
    convention: C,
}

impl<R: ResourceRegistry, C: ConventionResolver> ConventionFallbackRegistry<R, C> {
    /// Wrap `inner` with `convention`.
    pub fn new(inner: R, convention: C) -> Self {
        Self { inner, convention }
    }

    /// The wrapped registry.
    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: ResourceRegistry, C: ConventionResolver> ResourceRegistry
    for ConventionFallbackRegistry<R, C>
{
    fn resolve_resource(&self, table: Option<&str>, statement_id: Option<&str>) -> Option<String> {
        self.inner
            .resolve_resource(table, statement_id)
            .or_else(|| {
                let table = table.map(str::trim).filter(|t| !t.is_empty())?;
                self.convention.resource_for_table(table)
            })
    }

    fn resolve_column(&self, resource: &str, field_key: &str) -> Result<ColumnRef> {
        self.inner.resolve_column(resource, field_key)
    }

    fn filter_context(&self, resource: &str) -> RangeFilterContext {
        self.inner.filter_context(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_convention_strips_and_uppercases() {
        let convention = PrefixConvention::default();
        assert_eq!(
            convention.resource_for_table("t_order").as_deref(),
            Some("ORDER")
        );
        assert_eq!(
            convention.resource_for_table("app.T_User").as_deref(),
            Some("USER")
        );
        assert_eq!(
            convention.resource_for_table("audit_log").as_deref(),
            Some("AUDIT_LOG")
        );
    }

    #[test]
    fn prefix_convention_ignores_unsafe_or_empty_names() {
        let convention = PrefixConvention::default();
        assert_eq!(convention.resource_for_table("t_"), None);
        assert_eq!(convention.resource_for_table("t order"), None);
    }
}
