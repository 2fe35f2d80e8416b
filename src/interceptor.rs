//! Statement-level host adapter.
//!
//! Parses SQL text, asks the bridge for a segment per governed table
//! reference, ANDs the segments into the owning `WHERE` clause and then
//! narrows projections to the column constraints the bridge collected.
//! Subqueries anywhere in an expression are filtered in their own scope.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{
    Delete, Expr, FromTable, Ident, ObjectName, Query, Select, SelectItem,
    SelectItemQualifiedWildcardKind, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins,
    UpdateTableFromKind, VisitMut, VisitorMut,
};
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use crate::bridge::{DataScopeBridge, Segment};
use crate::config::PermissionOptions;
use crate::context::{ExecutionContextHolder, ExecutionScope};
use crate::decision::{AccessContext, Action, ColumnConstraint};
use crate::error::Result;
use crate::parser::expr::{
    always_false, append_filter, collect_column_references, is_always_false, null_literal,
};
use crate::parser::names::{normalize_identifier, normalize_relation_name, object_relation_name};
use crate::parser::sql_parser::{parse_statements, parse_table_factor, SqlDialect};
use crate::registry::ResourceRegistry;

/// Result of [`StatementInterceptor::rewrite_with_constraints`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    /// Rewritten SQL text.
    pub sql: String,
    /// Column constraints collected per resource, for shaping result rows.
    pub constraints: BTreeMap<String, ColumnConstraint>,
}

/// Rewrites host statements with data-scope filters.
pub struct StatementInterceptor {
    bridge: Arc<DataScopeBridge>,
    registry: Arc<dyn ResourceRegistry>,
    options: PermissionOptions,
}

impl StatementInterceptor {
    /// Interceptor using the bridge's options.
    pub fn new(bridge: Arc<DataScopeBridge>, registry: Arc<dyn ResourceRegistry>) -> Self {
        let options = bridge.options().clone();
        Self {
            bridge,
            registry,
            options,
        }
    }

    /// Rewrite every statement in `sql`.
    pub fn rewrite(
        &self,
        sql: &str,
        statement_id: Option<&str>,
        access: &AccessContext,
    ) -> Result<String> {
        Ok(self.rewrite_with_constraints(sql, statement_id, access)?.sql)
    }

    /// [`rewrite`](Self::rewrite), also returning the column constraints.
    pub fn rewrite_with_constraints(
        &self,
        sql: &str,
        statement_id: Option<&str>,
        access: &AccessContext,
    ) -> Result<Rewritten> {
        let mut statements = parse_statements(sql, self.options.dialect)?;
        let mut constraints = BTreeMap::new();
        for statement in &mut statements {
            constraints.extend(self.rewrite_statement(statement, statement_id, access)?);
        }
        let sql = statements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";\n");
        debug!(statement_id, sql = %sql, "statement rewritten");
        Ok(Rewritten { sql, constraints })
    }

    fn rewrite_statement(
        &self,
        statement: &mut Statement,
        statement_id: Option<&str>,
        access: &AccessContext,
    ) -> Result<BTreeMap<String, ColumnConstraint>> {
        let scope = Scope {
            interceptor: self,
            statement_id,
            access,
        };
        match statement {
            Statement::Query(query) => {
                let _guard = ExecutionScope::enter(Action::Query, Some(access.clone()));
                scope.query(query, &BTreeSet::new());
                let constraints = effective(ExecutionContextHolder::constraints());
                if !constraints.is_empty() {
                    scope.project_query(query, &BTreeSet::new(), &constraints);
                }
                Ok(constraints)
            }
            Statement::Delete(delete) if self.options.apply_to_write => {
                let _guard = ExecutionScope::enter(Action::Delete, Some(access.clone()));
                scope.delete(delete);
                Ok(BTreeMap::new())
            }
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } if self.options.apply_to_write => {
                let _guard = ExecutionScope::enter(Action::Update, Some(access.clone()));
                let ctes = BTreeSet::new();
                let mut segments = Vec::new();
                scope.from(std::slice::from_mut(table), &ctes, &mut segments);
                if let Some(
                    UpdateTableFromKind::BeforeSet(tables) | UpdateTableFromKind::AfterSet(tables),
                ) = from
                {
                    scope.from(tables, &ctes, &mut segments);
                }
                scope.subqueries(assignments, &ctes);
                scope.subqueries(selection, &ctes);
                *selection = fold_segments(selection.take(), segments);
                Ok(BTreeMap::new())
            }
            _ => Ok(BTreeMap::new()),
        }
    }
}

fn effective(constraints: BTreeMap<String, ColumnConstraint>) -> BTreeMap<String, ColumnConstraint> {
    constraints
        .into_iter()
        .filter(|(_, c)| c.is_effective())
        .collect()
}

/// A physical table reference in one `SELECT`.
struct TableRef {
    table: String,
    alias: Option<String>,
    resource: Option<String>,
}

impl TableRef {
    fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

struct Scope<'a> {
    interceptor: &'a StatementInterceptor,
    statement_id: Option<&'a str>,
    access: &'a AccessContext,
}

impl Scope<'_> {
    // Row filters.

    fn query(&self, query: &mut Query, outer_ctes: &BTreeSet<String>) {
        let ctes = self.ctes(query, outer_ctes, |scope, cte_query, ctes| {
            scope.query(cte_query, ctes)
        });
        self.set_expr(&mut query.body, &ctes);
    }

    fn set_expr(&self, body: &mut SetExpr, ctes: &BTreeSet<String>) {
        match body {
            SetExpr::Select(select) => self.select(select, ctes),
            SetExpr::Query(query) => self.query(query, ctes),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left, ctes);
                self.set_expr(right, ctes);
            }
            _ => {}
        }
    }

    fn select(&self, select: &mut Select, ctes: &BTreeSet<String>) {
        self.subqueries(&mut select.projection, ctes);
        for item in &mut select.from {
            for join in &mut item.joins {
                self.subqueries(&mut join.join_operator, ctes);
            }
        }
        self.subqueries(&mut select.selection, ctes);
        self.subqueries(&mut select.having, ctes);
        self.subqueries(&mut select.qualify, ctes);
        let mut segments = Vec::new();
        self.from(&mut select.from, ctes, &mut segments);
        select.selection = fold_segments(select.selection.take(), segments);
    }

    fn delete(&self, delete: &mut Delete) {
        let tables = match &mut delete.from {
            FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
        };
        let ctes = BTreeSet::new();
        let mut segments = Vec::new();
        self.from(tables, &ctes, &mut segments);
        if let Some(using) = &mut delete.using {
            self.from(using, &ctes, &mut segments);
        }
        self.subqueries(&mut delete.selection, &ctes);
        delete.selection = fold_segments(delete.selection.take(), segments);
    }

    /// Filter every query nested in `node`'s expressions. Only the outermost
    /// ones are handed to [`query`](Self::query), which descends further.
    fn subqueries<N: VisitMut>(&self, node: &mut N, ctes: &BTreeSet<String>) {
        let mut nested = NestedQueries {
            scope: self,
            ctes,
            depth: 0,
        };
        let _ = node.visit(&mut nested);
    }

    fn from(
        &self,
        from: &mut [TableWithJoins],
        ctes: &BTreeSet<String>,
        segments: &mut Vec<Expr>,
    ) {
        let mut siblings = Vec::new();
        for item in from.iter() {
            physical_tables(&item.relation, &mut siblings);
            for join in &item.joins {
                physical_tables(&join.relation, &mut siblings);
            }
        }
        for item in from {
            self.factor(&mut item.relation, ctes, &siblings, segments);
            for join in &mut item.joins {
                self.factor(&mut join.relation, ctes, &siblings, segments);
            }
        }
    }

    fn factor(
        &self,
        factor: &mut TableFactor,
        ctes: &BTreeSet<String>,
        siblings: &[String],
        segments: &mut Vec<Expr>,
    ) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = object_relation_name(name);
                if name.0.len() == 1 && ctes.contains(&table) {
                    return;
                }
                if self.defers_to_owner(&table, siblings) {
                    return;
                }
                let alias = alias.as_ref().map(|a| a.name.value.clone());
                let segment = self.interceptor.bridge.resolve_segment(
                    Some(self.access),
                    Some(&table),
                    self.statement_id,
                );
                match segment {
                    Segment::Unrestricted => {}
                    Segment::Denied => segments.push(always_false()),
                    Segment::Filter { filter, .. } => {
                        segments.push(filter.qualified_for(&table, alias.as_deref()));
                    }
                }
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery, ctes),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.from(std::slice::from_mut(&mut **table_with_joins), ctes, segments),
            TableFactor::Pivot {
                table,
                value_source,
                ..
            } => {
                self.subqueries(value_source, ctes);
                self.pre_filtered(table, ctes, segments);
            }
            TableFactor::Unpivot { table, .. } => self.pre_filtered(table, ctes, segments),
            _ => {}
        }
    }

    /// The outer `WHERE` cannot see a pivoted table's rows, so its filter is
    /// moved into a derived table in place of the table itself.
    fn pre_filtered(
        &self,
        inner: &mut TableFactor,
        ctes: &BTreeSet<String>,
        outer: &mut Vec<Expr>,
    ) {
        let mut own = Vec::new();
        self.factor(inner, ctes, &[], &mut own);
        let Some(filter) = fold_segments(None, own) else {
            return;
        };
        let derived = match &*inner {
            TableFactor::Table { name, alias, .. } => {
                filtered_relation(name, alias.as_ref(), &filter, self.interceptor.options.dialect)
            }
            _ => None,
        };
        match derived {
            Some(derived) => *inner = derived,
            None => outer.push(always_false()),
        }
    }

    /// A statement mapping governs every table of the statement; the filter
    /// is attached to the tables the resource declares, when one is present.
    fn defers_to_owner(&self, table: &str, siblings: &[String]) -> bool {
        let registry = &self.interceptor.registry;
        let Some(resource) = registry.resolve_resource(Some(table), self.statement_id) else {
            return false;
        };
        let context = registry.filter_context(&resource);
        !context.tables().is_empty()
            && !context.owns_table(table)
            && siblings.iter().any(|sibling| context.owns_table(sibling))
    }

    fn ctes(
        &self,
        query: &mut Query,
        outer: &BTreeSet<String>,
        mut visit: impl FnMut(&Self, &mut Query, &BTreeSet<String>),
    ) -> BTreeSet<String> {
        let mut ctes = outer.clone();
        if let Some(with) = &mut query.with {
            let recursive = with.recursive;
            for cte in &mut with.cte_tables {
                let name = normalize_identifier(&cte.alias.name.value);
                if recursive {
                    ctes.insert(name.clone());
                }
                visit(self, &mut cte.query, &ctes);
                ctes.insert(name);
            }
        }
        ctes
    }

    // Column constraints.

    fn project_query(
        &self,
        query: &mut Query,
        outer_ctes: &BTreeSet<String>,
        constraints: &BTreeMap<String, ColumnConstraint>,
    ) {
        let ctes = self.ctes(query, outer_ctes, |scope, cte_query, ctes| {
            scope.project_query(cte_query, ctes, constraints)
        });
        self.project_set_expr(&mut query.body, &ctes, constraints);
    }

    fn project_set_expr(
        &self,
        body: &mut SetExpr,
        ctes: &BTreeSet<String>,
        constraints: &BTreeMap<String, ColumnConstraint>,
    ) {
        match body {
            SetExpr::Select(select) => self.project_select(select, ctes, constraints),
            SetExpr::Query(query) => self.project_query(query, ctes, constraints),
            SetExpr::SetOperation { left, right, .. } => {
                self.project_set_expr(left, ctes, constraints);
                self.project_set_expr(right, ctes, constraints);
            }
            _ => {}
        }
    }

    fn project_select(
        &self,
        select: &mut Select,
        ctes: &BTreeSet<String>,
        constraints: &BTreeMap<String, ColumnConstraint>,
    ) {
        let mut refs = Vec::new();
        for item in &mut select.from {
            self.collect_refs(&mut item.relation, ctes, constraints, &mut refs);
            for join in &mut item.joins {
                self.collect_refs(&mut join.relation, ctes, constraints, &mut refs);
            }
        }
        let siblings: Vec<String> = refs.iter().map(|r| r.table.clone()).collect();
        for r in &mut refs {
            if r.resource.is_some() && self.defers_to_owner(&r.table, &siblings) {
                r.resource = None;
            }
        }
        let constrained = |r: &TableRef| {
            r.resource
                .as_ref()
                .and_then(|resource| constraints.get(resource))
        };
        if !refs.iter().any(|r| constrained(r).is_some()) {
            return;
        }

        let fail_closed = self.interceptor.options.fail_closed;
        let original = std::mem::take(&mut select.projection);
        let mut rebuilt = Vec::with_capacity(original.len());
        let mut failed = false;
        for item in original.iter().cloned() {
            match item {
                SelectItem::Wildcard(_) => {
                    let mut expanded = Vec::new();
                    for r in &refs {
                        match constrained(r) {
                            None => match qualified_wildcard(r.qualifier()) {
                                Some(all) => expanded.push(all),
                                None => failed = true,
                            },
                            Some(c) => match expand(r, c) {
                                Some(columns) => expanded.extend(columns),
                                None => failed = true,
                            },
                        }
                    }
                    if failed && !fail_closed {
                        failed = false;
                        rebuilt.push(item);
                    } else {
                        rebuilt.extend(expanded);
                    }
                }
                SelectItem::QualifiedWildcard(ref kind, _) => {
                    let token = match kind {
                        SelectItemQualifiedWildcardKind::ObjectName(name) => object_relation_name(name),
                        SelectItemQualifiedWildcardKind::Expr(expr) => {
                            normalize_relation_name(&expr.to_string())
                        }
                    };
                    let outcome = match resolve_ref(&refs, &token) {
                        None => None,
                        Some(r) => match constrained(r) {
                            None => Some(None),
                            Some(c) => expand(r, c).filter(|columns| !columns.is_empty()).map(Some),
                        },
                    };
                    match outcome {
                        Some(Some(columns)) => rebuilt.extend(columns),
                        Some(None) => rebuilt.push(item),
                        None if fail_closed => failed = true,
                        None => rebuilt.push(item),
                    }
                }
                SelectItem::UnnamedExpr(ref expr) | SelectItem::ExprWithAlias { ref expr, .. } => {
                    let allowed = collect_column_references(expr).iter().all(|column| {
                        match column.qualifier.as_deref() {
                            Some(token) => resolve_ref(&refs, token)
                                .and_then(|r| constrained(r))
                                .map_or(true, |c| c.allows(&column.column)),
                            // Unqualified: every constrained table it might bind to must allow it.
                            None => refs
                                .iter()
                                .filter_map(|r| constrained(r))
                                .all(|c| c.allows(&column.column)),
                        }
                    });
                    if allowed {
                        rebuilt.push(item);
                    }
                }
            }
            if failed {
                break;
            }
        }

        if failed || rebuilt.is_empty() {
            warn!(
                statement_id = self.statement_id,
                "projection cannot satisfy column constraints"
            );
            if fail_closed {
                select.projection = if rebuilt.is_empty() {
                    vec![SelectItem::UnnamedExpr(null_literal())]
                } else {
                    rebuilt
                };
                let already_denied = select.selection.as_ref().is_some_and(is_always_false);
                if !already_denied {
                    select.selection = append_filter(select.selection.take(), Some(always_false()));
                }
            } else if rebuilt.is_empty() {
                select.projection = original;
            } else {
                select.projection = rebuilt;
            }
            return;
        }
        select.projection = rebuilt;
    }

    fn collect_refs(
        &self,
        factor: &mut TableFactor,
        ctes: &BTreeSet<String>,
        constraints: &BTreeMap<String, ColumnConstraint>,
        refs: &mut Vec<TableRef>,
    ) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = object_relation_name(name);
                let resource = if name.0.len() == 1 && ctes.contains(&table) {
                    None
                } else {
                    self.interceptor
                        .registry
                        .resolve_resource(Some(&table), self.statement_id)
                };
                refs.push(TableRef {
                    table,
                    alias: alias.as_ref().map(|a| a.name.value.clone()),
                    resource,
                });
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                self.project_query(subquery, ctes, constraints);
                if let Some(alias) = alias {
                    refs.push(TableRef {
                        table: normalize_identifier(&alias.name.value),
                        alias: Some(alias.name.value.clone()),
                        resource: None,
                    });
                }
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_refs(&mut table_with_joins.relation, ctes, constraints, refs);
                for join in &mut table_with_joins.joins {
                    self.collect_refs(&mut join.relation, ctes, constraints, refs);
                }
            }
            TableFactor::Pivot { table, alias, .. } | TableFactor::Unpivot { table, alias, .. } => {
                let mut inner = Vec::new();
                self.collect_refs(table, ctes, constraints, &mut inner);
                // The pivot's output inherits the constraint of what it reads.
                let resource = inner.into_iter().find_map(|r| r.resource);
                if let Some(alias) = alias {
                    refs.push(TableRef {
                        table: normalize_identifier(&alias.name.value),
                        alias: Some(alias.name.value.clone()),
                        resource,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Walks expressions, handing each outermost nested query back to the scope.
struct NestedQueries<'s, 'a> {
    scope: &'s Scope<'a>,
    ctes: &'s BTreeSet<String>,
    depth: usize,
}

impl VisitorMut for NestedQueries<'_, '_> {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &mut Query) -> ControlFlow<()> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, query: &mut Query) -> ControlFlow<()> {
        self.depth -= 1;
        if self.depth == 0 {
            self.scope.query(query, self.ctes);
        }
        ControlFlow::Continue(())
    }
}

/// `(SELECT * FROM name [alias] WHERE filter) AS alias`.
fn filtered_relation(
    name: &ObjectName,
    alias: Option<&TableAlias>,
    filter: &Expr,
    dialect: SqlDialect,
) -> Option<TableFactor> {
    let exposed = alias
        .map(|a| a.name.to_string())
        .or_else(|| name.0.last().map(ToString::to_string))?;
    let inner_alias = alias.map(|a| format!(" AS {}", a.name)).unwrap_or_default();
    parse_table_factor(
        &format!("(SELECT * FROM {name}{inner_alias} WHERE {filter}) AS {exposed}"),
        dialect,
    )
    .ok()
}

fn physical_tables(factor: &TableFactor, tables: &mut Vec<String>) {
    match factor {
        TableFactor::Table { name, .. } => tables.push(object_relation_name(name)),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            physical_tables(&table_with_joins.relation, tables);
            for join in &table_with_joins.joins {
                physical_tables(&join.relation, tables);
            }
        }
        _ => {}
    }
}

fn fold_segments(original: Option<Expr>, segments: Vec<Expr>) -> Option<Expr> {
    let mut combined = original;
    let mut denied = false;
    for segment in segments {
        if is_always_false(&segment) {
            if denied {
                continue;
            }
            denied = true;
        }
        combined = append_filter(combined, Some(segment));
    }
    combined
}

/// Table reference a qualifier points at: alias first, then table name.
fn resolve_ref<'r>(refs: &'r [TableRef], token: &str) -> Option<&'r TableRef> {
    let token = normalize_identifier(token);
    refs.iter()
        .find(|r| {
            r.alias
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(&token))
        })
        .or_else(|| refs.iter().find(|r| r.table == token))
}

/// Allowed columns of `table_ref` as qualified projection items; `None` when
/// the constraint is deny-only and a wildcard cannot be enumerated.
fn expand(table_ref: &TableRef, constraint: &ColumnConstraint) -> Option<Vec<SelectItem>> {
    if constraint.allow_columns().is_empty() {
        return None;
    }
    Some(
        constraint
            .allow_columns()
            .iter()
            .filter(|column| constraint.allows(column))
            .map(|column| {
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(vec![
                    Ident::new(table_ref.qualifier()),
                    Ident::new(column),
                ]))
            })
            .collect(),
    )
}

fn qualified_wildcard(qualifier: &str) -> Option<SelectItem> {
    let dialect = sqlparser::dialect::GenericDialect {};
    Parser::new(&dialect)
        .try_with_sql(&format!("{qualifier}.*"))
        .and_then(|mut parser| parser.parse_select_item())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(table: &str, alias: Option<&str>) -> TableRef {
        TableRef {
            table: table.to_string(),
            alias: alias.map(str::to_string),
            resource: None,
        }
    }

    #[test]
    fn qualifiers_match_aliases_before_table_names() {
        let refs = [table("t_order", Some("o")), table("o", None)];
        assert_eq!(resolve_ref(&refs, "O").map(|r| r.table.as_str()), Some("t_order"));
        assert_eq!(
            resolve_ref(&refs, "\"T_ORDER\"").map(|r| r.qualifier()),
            Some("o")
        );
        assert!(resolve_ref(&refs, "t_user").is_none());
    }

    #[test]
    fn repeated_denials_collapse() {
        let combined = fold_segments(None, vec![always_false(), always_false()]);
        assert_eq!(combined.map(|e| e.to_string()).as_deref(), Some("1 = 0"));
    }
}
