use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::parser::names::normalize_relation_name;
use crate::registry::column::{ColumnRef, ResourceFieldKey};
use crate::registry::convention::{ConventionFallbackRegistry, PrefixConvention};
use crate::registry::validator::ColumnNameValidator;
use crate::registry::{DefaultResourceRegistry, ResourceRegistry};

/// Declarations for a single resource, collected inside
/// [`ResourceRegistryBuilder::resource`].
#[derive(Debug, Clone, Default)]
pub struct ResourceDeclaration {
    tables: Vec<String>,
    statements: Vec<String>,
    fields: Vec<(String, Option<String>, String)>,
}

impl ResourceDeclaration {
    /// Bind a physical table to the resource.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Bind a statement identifier to the resource.
    pub fn statement(mut self, statement_id: impl Into<String>) -> Self {
        self.statements.push(statement_id.into());
        self
    }

    /// Declare `field_key` as `table.column`.
    pub fn field(
        mut self,
        field_key: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.fields
            .push((field_key.into(), Some(table.into()), column.into()));
        self
    }

    /// Declare `field_key` as an unqualified column.
    pub fn bare_field(mut self, field_key: impl Into<String>, column: impl Into<String>) -> Self {
        self.fields.push((field_key.into(), None, column.into()));
        self
    }
}

/// Builds a [`DefaultResourceRegistry`].
///
/// The first conflicting or blank declaration is remembered and reported by
/// [`build`](Self::build); later declarations are ignored once an error is
/// recorded. Re-declaring an identical mapping is accepted.
#[derive(Debug, Default)]
pub struct ResourceRegistryBuilder {
    validator: ColumnNameValidator,
    statements: BTreeMap<String, String>,
    tables: BTreeMap<String, String>,
    fields: BTreeMap<ResourceFieldKey, (Option<String>, String)>,
    resource_tables: BTreeMap<String, BTreeSet<String>>,
    error: Option<Error>,
}

impl ResourceRegistryBuilder {
    /// Empty builder with the default validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the identifier validator.
    pub fn validator(mut self, validator: ColumnNameValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Group table, statement and field bindings under `resource`.
    pub fn resource(
        mut self,
        resource: impl Into<String>,
        declare: impl FnOnce(ResourceDeclaration) -> ResourceDeclaration,
    ) -> Self {
        let resource = resource.into();
        let declaration = declare(ResourceDeclaration::default());
        for table in declaration.tables {
            self = self.map_table(table, resource.clone());
        }
        for statement in declaration.statements {
            self = self.map_statement(statement, resource.clone());
        }
        for (field_key, table, column) in declaration.fields {
            self = self.map_field(resource.clone(), field_key, table, column);
        }
        self
    }

    /// Map a statement identifier to a resource.
    pub fn map_statement(
        mut self,
        statement_id: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        let statement_id = statement_id.into().trim().to_string();
        let resource = resource.into().trim().to_string();
        if self.error.is_some() {
            return self;
        }
        if statement_id.is_empty() || resource.is_empty() {
            return self.fail(Error::InvalidDeclaration {
                message: "statement id and resource must not be blank".to_string(),
            });
        }
        if let Some(err) = check_duplicate(&self.statements, "statement", &statement_id, &resource)
        {
            return self.fail(err);
        }
        self.statements.insert(statement_id, resource);
        self
    }

    /// Map a physical table (case-insensitive) to a resource.
    pub fn map_table(mut self, table: impl Into<String>, resource: impl Into<String>) -> Self {
        let raw = table.into();
        let resource = resource.into().trim().to_string();
        if self.error.is_some() {
            return self;
        }
        if raw.trim().is_empty() || resource.is_empty() {
            return self.fail(Error::InvalidDeclaration {
                message: "table and resource must not be blank".to_string(),
            });
        }
        if let Err(err) = self.validator.validate(raw.trim()) {
            return self.fail(err);
        }
        let table = normalize_relation_name(&raw);
        if let Some(err) = check_duplicate(&self.tables, "table", &table, &resource) {
            return self.fail(err);
        }
        self.resource_tables
            .entry(resource.clone())
            .or_default()
            .insert(table.clone());
        self.tables.insert(table, resource);
        self
    }

    /// Declare the column behind `field_key` on `resource`.
    pub fn map_field(
        mut self,
        resource: impl Into<String>,
        field_key: impl Into<String>,
        table: Option<String>,
        column: impl Into<String>,
    ) -> Self {
        let resource = resource.into().trim().to_string();
        let field_key = field_key.into().trim().to_string();
        let column = column.into().trim().to_string();
        let table = table
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if self.error.is_some() {
            return self;
        }
        if resource.is_empty() || field_key.is_empty() || column.is_empty() {
            return self.fail(Error::InvalidDeclaration {
                message: "resource, field key and column must not be blank".to_string(),
            });
        }

        let key = ResourceFieldKey::new(resource, field_key);
        let target = (table, column);
        if let Some(previous) = self.fields.get(&key) {
            if *previous == target {
                return self;
            }
            let err = Error::DuplicateMapping {
                kind: "field",
                key: key.to_string(),
                previous: render_target(previous),
                current: render_target(&target),
            };
            return self.fail(err);
        }
        self.fields.insert(key, target);
        self
    }

    /// Validate every declaration and freeze the registry.
    pub fn build(self) -> Result<DefaultResourceRegistry> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut fields = HashMap::with_capacity(self.fields.len());
        for (key, (table, column)) in self.fields {
            self.validator.validate_table(table.as_deref())?;
            self.validator.validate(&column)?;
            fields.insert(key, ColumnRef::new(table, column));
        }

        debug!(
            statements = self.statements.len(),
            tables = self.tables.len(),
            fields = fields.len(),
            "resource registry built"
        );

        Ok(DefaultResourceRegistry::new(
            self.statements.into_iter().collect(),
            self.tables.into_iter().collect(),
            fields,
            self.resource_tables.into_iter().collect(),
            self.validator,
        ))
    }

    /// Build a registry from declarative configuration, wrapping it in the
    /// convention fallback when enabled.
    pub fn from_config(config: &RegistryConfig) -> Result<Arc<dyn ResourceRegistry>> {
        let mut builder = Self::new();
        for resource in &config.resources {
            for table in &resource.tables {
                builder = builder.map_table(table.clone(), resource.name.clone());
            }
            for statement in &resource.statements {
                builder = builder.map_statement(statement.clone(), resource.name.clone());
            }
            for (field_key, field) in &resource.fields {
                builder = builder.map_field(
                    resource.name.clone(),
                    field_key.clone(),
                    field.table.clone(),
                    field.column.clone(),
                );
            }
        }
        let registry = builder.build()?;

        match &config.convention {
            Some(convention) if convention.enabled => {
                let resolver = PrefixConvention::new(convention.prefixes.clone());
                Ok(Arc::new(ConventionFallbackRegistry::new(registry, resolver)))
            }
            _ => Ok(Arc::new(registry)),
        }
    }

    fn fail(mut self, err: Error) -> Self {
        self.error.get_or_insert(err);
        self
    }
}

fn check_duplicate(
    map: &BTreeMap<String, String>,
    kind: &'static str,
    key: &str,
    value: &str,
) -> Option<Error> {
    match map.get(key) {
        Some(previous) if previous != value => Some(Error::DuplicateMapping {
            kind,
            key: key.to_string(),
            previous: previous.clone(),
            current: value.to_string(),
        }),
        _ => None,
    }
}

fn render_target((table, column): &(Option<String>, String)) -> String {
    match table {
        Some(table) => format!("{table}.{column}"),
        None => column.clone(),
    }
}
