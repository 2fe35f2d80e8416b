use std::fmt;

use sqlparser::ast::{Expr, Ident};

/// A validated column reference, optionally table-qualified.
///
/// Only the registry constructs these, after both parts passed the
/// [`ColumnNameValidator`](crate::registry::validator::ColumnNameValidator).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    table: Option<String>,
    column: String,
}

impl ColumnRef {
    pub(crate) fn new(table: Option<String>, column: String) -> Self {
        let table = table.filter(|t| !t.trim().is_empty());
        Self { table, column }
    }

    /// Table qualifier, if any.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Column identifier.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Render as an identifier expression.
    pub fn to_expr(&self) -> Expr {
        match &self.table {
            Some(table) => {
                Expr::CompoundIdentifier(vec![Ident::new(table), Ident::new(&self.column)])
            }
            None => Expr::Identifier(Ident::new(&self.column)),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{table}.{}", self.column),
            None => f.write_str(&self.column),
        }
    }
}

/// Key of the registry's field map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceFieldKey {
    /// Logical resource code.
    pub resource: String,
    /// Logical field key used by rules and decisions.
    pub field_key: String,
}

impl ResourceFieldKey {
    /// Build a key from its two parts.
    pub fn new(resource: impl Into<String>, field_key: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field_key: field_key.into(),
        }
    }
}

impl fmt::Display for ResourceFieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.field_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_qualified_and_bare_columns() {
        let qualified = ColumnRef::new(Some("t_order".into()), "dept_id".into());
        let bare = ColumnRef::new(Some(" ".into()), "dept_id".into());

        assert_eq!(qualified.to_string(), "t_order.dept_id");
        assert_eq!(qualified.to_expr().to_string(), "t_order.dept_id");
        assert_eq!(bare.table(), None);
        assert_eq!(bare.to_expr().to_string(), "dept_id");
    }
}
