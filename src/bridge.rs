//! Decision-to-filter bridge: the per-statement entry point for host engines.
//!
//! ```text
//! CONTEXT_CHECK -> RESOURCE_RESOLVE -> DECISION_FETCH -> FILTER_BUILD -> RETURN
//! ```
//!
//! Every per-query failure collapses into the configured fail policy; nothing
//! escapes to the host as an error.

use std::sync::Arc;

use sqlparser::ast::Expr;
use tracing::{debug, warn};

use crate::cache::PredicateCacheService;
use crate::config::PermissionOptions;
use crate::context::ExecutionContextHolder;
use crate::decision::{AccessContext, DecisionType};
use crate::error::{Error, Result};
use crate::parser::expr::always_false;
use crate::range::filter::RangeFilter;
use crate::registry::ResourceRegistry;

/// Outcome of [`DataScopeBridge::segment_for`] before rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// The statement is not governed, or policy grants every row.
    Unrestricted,
    /// Append this filter.
    Filter {
        /// Resource the filter belongs to.
        resource: String,
        /// Validated filter.
        filter: RangeFilter,
    },
    /// Append the fail-policy or DENY filter `1 = 0`.
    Denied,
}

impl Segment {
    /// Unqualified expression to AND onto the host filter.
    pub fn into_expr(self) -> Option<Expr> {
        match self {
            Segment::Unrestricted => None,
            Segment::Filter { filter, .. } => Some(filter.into_expr()),
            Segment::Denied => Some(always_false()),
        }
    }
}

/// Resolves the filter to append to one statement.
pub struct DataScopeBridge {
    registry: Arc<dyn ResourceRegistry>,
    cache: Arc<PredicateCacheService>,
    options: PermissionOptions,
}

impl DataScopeBridge {
    /// Bridge over `registry` and `cache`.
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        cache: Arc<PredicateCacheService>,
        options: PermissionOptions,
    ) -> Self {
        Self {
            registry,
            cache,
            options,
        }
    }

    /// Options the bridge runs with.
    pub fn options(&self) -> &PermissionOptions {
        &self.options
    }

    /// Segment for the statement on the current thread.
    ///
    /// Reads the access context and action from [`ExecutionContextHolder`].
    /// `original_filter` is not modified; combine with
    /// [`append_filter`](crate::parser::expr::append_filter).
    pub fn get_sql_segment(
        &self,
        table: Option<&str>,
        original_filter: Option<&Expr>,
        statement_id: Option<&str>,
    ) -> Option<Expr> {
        let access = ExecutionContextHolder::access();
        let segment = self.segment_for(access.as_ref(), table, statement_id);
        if original_filter.is_some() && segment.is_some() {
            debug!(table, statement_id, "appending data scope to existing filter");
        }
        segment
    }

    /// [`get_sql_segment`](Self::get_sql_segment) with an explicit access context.
    pub fn segment_for(
        &self,
        access: Option<&AccessContext>,
        table: Option<&str>,
        statement_id: Option<&str>,
    ) -> Option<Expr> {
        self.resolve_segment(access, table, statement_id).into_expr()
    }

    /// Structured variant of [`segment_for`](Self::segment_for).
    pub fn resolve_segment(
        &self,
        access: Option<&AccessContext>,
        table: Option<&str>,
        statement_id: Option<&str>,
    ) -> Segment {
        // CONTEXT_CHECK
        let identity = access
            .ok_or(Error::MissingContext("tenant"))
            .and_then(|access| Ok((access, access.require_tenant()?, access.require_subject()?)));
        let (access, tenant, subject) = match identity {
            Ok(identity) => identity,
            Err(err) => {
                warn!(table, statement_id, error = %err, "data scope context unavailable");
                return self.fail_policy();
            }
        };

        // RESOURCE_RESOLVE
        let Some(resource) = self.registry.resolve_resource(table, statement_id) else {
            return Segment::Unrestricted;
        };

        // DECISION_FETCH + FILTER_BUILD
        match self.fetch(tenant, subject, &resource, access) {
            Ok(segment) => segment,
            Err(err) => {
                warn!(
                    resource = %resource,
                    tenant,
                    subject,
                    code = err.code(),
                    error = %err,
                    "data scope evaluation failed"
                );
                self.fail_policy()
            }
        }
    }

    fn fetch(
        &self,
        tenant: &str,
        subject: &str,
        resource: &str,
        access: &AccessContext,
    ) -> Result<Segment> {
        let action = ExecutionContextHolder::action();
        let Some(predicate) = self
            .cache
            .get_or_compile(tenant, subject, resource, access, action)?
        else {
            warn!(resource, tenant, subject, %action, "no applicable data policy");
            return Ok(self.fail_policy());
        };

        if let Some(constraint) = predicate.column_constraint() {
            ExecutionContextHolder::put_constraint(resource, constraint.clone());
        }
        if predicate.decision_type() == DecisionType::Deny {
            debug!(resource, tenant, subject, "data scope denied");
            return Ok(Segment::Denied);
        }
        Ok(match predicate.row_filter() {
            Some(filter) => Segment::Filter {
                resource: resource.to_string(),
                filter,
            },
            None => Segment::Unrestricted,
        })
    }

    fn fail_policy(&self) -> Segment {
        if self.options.fail_closed {
            Segment::Denied
        } else {
            Segment::Unrestricted
        }
    }
}
