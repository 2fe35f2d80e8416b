//! Version-checked cache of compiled predicates with single-flight misses.
//!
//! Entries are kept per tenant, subject, resource and action, and remember
//! the policy version they were compiled under. Every lookup first resolves
//! the current version (once per statement inside an
//! [`ExecutionScope`](crate::context::ExecutionScope)), so a version bump
//! recompiles the entry in place. The cache is bounded by entry count and
//! time to live, and change events remove entries eagerly.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::CacheOptions;
use crate::context::ExecutionContextHolder;
use crate::decision::{
    AccessContext, Action, AuthorizationDecisionSource, AuthorizeRequest, ColumnConstraint,
    DecisionType, PolicyVersion,
};
use crate::error::Result;
use crate::events::{PermissionChangeEvent, PermissionChangeListener};
use crate::range::filter::{RangeFilter, RangeFilterBuilder, SqlRangeFilterBuilder};
use crate::registry::ResourceRegistry;

/// Cache key. Equal keys always map to structurally equal predicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredicateCacheKey {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Subject identifier.
    pub subject_id: String,
    /// Resource code.
    pub resource: String,
    /// Statement action.
    pub action: Action,
    /// Policy version the entry was compiled under.
    pub policy_version: PolicyVersion,
}

impl PredicateCacheKey {
    fn scope(&self) -> EntryScope {
        EntryScope {
            tenant_id: self.tenant_id.clone(),
            subject_id: self.subject_id.clone(),
            resource: self.resource.clone(),
            action: self.action,
        }
    }
}

/// A decision compiled against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPredicate {
    resource: String,
    policy_version: PolicyVersion,
    decision_type: DecisionType,
    filter: Option<RangeFilter>,
    column_constraint: Option<ColumnConstraint>,
}

impl CompiledPredicate {
    /// Resource code.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Policy version this predicate was compiled under.
    pub fn policy_version(&self) -> PolicyVersion {
        self.policy_version
    }

    /// Allow or deny.
    pub fn decision_type(&self) -> DecisionType {
        self.decision_type
    }

    /// Filter to append: always-false for DENY, the compiled row filter
    /// (possibly none) for ALLOW.
    pub fn row_filter(&self) -> Option<RangeFilter> {
        match self.decision_type {
            DecisionType::Deny => Some(RangeFilter::always_false()),
            DecisionType::Allow => self.filter.clone(),
        }
    }

    /// Column restriction, if the decision carried one.
    pub fn column_constraint(&self) -> Option<&ColumnConstraint> {
        self.column_constraint.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryScope {
    tenant_id: String,
    subject_id: String,
    resource: String,
    action: Action,
}

#[derive(Debug)]
struct Compiled {
    policy_version: PolicyVersion,
    // `None` means "no applicable policy".
    predicate: Option<Arc<CompiledPredicate>>,
}

/// Empty until the first successful evaluation.
type Slot = Arc<Mutex<Option<Compiled>>>;

/// Compiles and caches decision row filters.
pub struct PredicateCacheService {
    source: Arc<dyn AuthorizationDecisionSource>,
    registry: Arc<dyn ResourceRegistry>,
    builder: Arc<dyn RangeFilterBuilder>,
    entries: Cache<EntryScope, Slot>,
}

fn bounded(options: &CacheOptions) -> Cache<EntryScope, Slot> {
    Cache::builder()
        .max_capacity(options.max_entries)
        .time_to_live(Duration::from_secs(options.ttl_secs))
        .build()
}

impl PredicateCacheService {
    /// Service using [`SqlRangeFilterBuilder`] and default bounds.
    pub fn new(
        source: Arc<dyn AuthorizationDecisionSource>,
        registry: Arc<dyn ResourceRegistry>,
    ) -> Self {
        Self::with_builder(source, registry, Arc::new(SqlRangeFilterBuilder::new()))
    }

    /// Service with a custom filter builder.
    pub fn with_builder(
        source: Arc<dyn AuthorizationDecisionSource>,
        registry: Arc<dyn ResourceRegistry>,
        builder: Arc<dyn RangeFilterBuilder>,
    ) -> Self {
        Self {
            source,
            registry,
            builder,
            entries: bounded(&CacheOptions::default()),
        }
    }

    /// Replace the capacity and time to live. Drops anything cached so far.
    pub fn with_options(mut self, options: &CacheOptions) -> Self {
        self.entries = bounded(options);
        self
    }

    /// Compiled predicate for the current policy version.
    ///
    /// `Ok(None)` means no policy applies; callers decide what that means.
    /// Concurrent misses for one key evaluate the decision source once.
    /// Errors are returned to every caller that observed them and are not
    /// cached.
    pub fn get_or_compile(
        &self,
        tenant_id: &str,
        subject_id: &str,
        resource: &str,
        access: &AccessContext,
        action: Action,
    ) -> Result<Option<Arc<CompiledPredicate>>> {
        let policy_version = self.policy_version(tenant_id, subject_id)?;
        let key = PredicateCacheKey {
            tenant_id: tenant_id.to_string(),
            subject_id: subject_id.to_string(),
            resource: resource.to_string(),
            action,
            policy_version,
        };
        if let Some(memoized) = ExecutionContextHolder::memoized_predicate(&key) {
            return Ok(memoized);
        }

        let scope = key.scope();
        let slot = self.entries.get_with(scope.clone(), Slot::default);
        let mut guard = slot.lock();
        if let Some(cached) = guard.as_ref() {
            if cached.policy_version == policy_version {
                let predicate = cached.predicate.clone();
                ExecutionContextHolder::memoize_predicate(key, predicate.clone());
                return Ok(predicate);
            }
        }

        match self.compile(&key, access) {
            Ok(predicate) => {
                *guard = Some(Compiled {
                    policy_version,
                    predicate: predicate.clone(),
                });
                ExecutionContextHolder::memoize_predicate(key, predicate.clone());
                Ok(predicate)
            }
            Err(err) => {
                // Slots that never compiled are not kept.
                if guard.is_none() {
                    self.entries.invalidate(&scope);
                }
                Err(err)
            }
        }
    }

    fn policy_version(&self, tenant_id: &str, subject_id: &str) -> Result<PolicyVersion> {
        if let Some(version) = ExecutionContextHolder::memoized_version(tenant_id, subject_id) {
            return Ok(version);
        }
        let version = self.source.policy_version(tenant_id, subject_id)?;
        ExecutionContextHolder::memoize_version(tenant_id, subject_id, version);
        Ok(version)
    }

    fn compile(
        &self,
        key: &PredicateCacheKey,
        access: &AccessContext,
    ) -> Result<Option<Arc<CompiledPredicate>>> {
        let request = AuthorizeRequest {
            tenant_id: &key.tenant_id,
            subject_id: &key.subject_id,
            resource: &key.resource,
            action: key.action,
            access,
        };
        let Some(decision) = self.source.authorize(&request)? else {
            debug!(
                tenant = %key.tenant_id,
                subject = %key.subject_id,
                resource = %key.resource,
                "no applicable policy"
            );
            return Ok(None);
        };

        let filter = match decision.decision_type {
            DecisionType::Deny => None,
            DecisionType::Allow => {
                let context = self.registry.filter_context(&key.resource);
                self.builder
                    .build(decision.row_filter.as_ref(), &context)?
            }
        };
        debug!(
            tenant = %key.tenant_id,
            subject = %key.subject_id,
            resource = %key.resource,
            action = %key.action,
            version = key.policy_version,
            decision = ?decision.decision_type,
            "predicate compiled"
        );

        Ok(Some(Arc::new(CompiledPredicate {
            resource: key.resource.clone(),
            policy_version: key.policy_version,
            decision_type: decision.decision_type,
            filter,
            column_constraint: decision.column_constraint,
        })))
    }

    /// Remove the entries an event affects and return how many were removed.
    ///
    /// Tenant and resource remove that pair, tenant alone removes the
    /// tenant, and an event without a tenant clears the cache.
    pub fn invalidate(&self, event: &PermissionChangeEvent) -> usize {
        let tenant = event.tenant_code.as_deref().filter(|t| !t.trim().is_empty());
        let resource = event
            .resource_code
            .as_deref()
            .filter(|r| !r.trim().is_empty());

        let removed = match (tenant, resource) {
            (Some(tenant), Some(resource)) => self.remove_where(|k| {
                k.tenant_id == tenant && k.resource.eq_ignore_ascii_case(resource)
            }),
            (Some(tenant), None) => self.remove_where(|k| k.tenant_id == tenant),
            (None, _) => self.invalidate_all(),
        };
        info!(
            change = ?event.change_type,
            tenant = tenant.unwrap_or("*"),
            resource = resource.unwrap_or("*"),
            removed,
            "predicate cache invalidated"
        );
        removed
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, matches: impl Fn(&EntryScope) -> bool) -> usize {
        let mut removed = 0;
        for (scope, _) in self.entries.iter() {
            if matches(scope.as_ref()) {
                self.entries.invalidate(scope.as_ref());
                removed += 1;
            }
        }
        removed
    }

    /// Number of cached scopes, including in-flight ones.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PermissionChangeListener for PredicateCacheService {
    fn on_change(&self, event: &PermissionChangeEvent) {
        self.invalidate(event);
    }
}
