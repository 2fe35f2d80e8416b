use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::decision::{
    AuthorizationDecisionSource, AuthorizeRequest, ColumnConstraint, Decision, DecisionType,
    PolicyVersion,
};
use crate::error::Result;
use crate::range::expression::{LogicalOperator, RangeExpression};
use crate::registry::ResourceRegistry;
use crate::rules::compiler::RuleCompiler;
use crate::rules::RuleSet;

/// Source of rule sets and their versions.
pub trait RuleStore: Send + Sync {
    /// Current version for `tenant_id` and `subject_id`; `0` when none were stored.
    fn version(&self, tenant_id: &str, subject_id: &str) -> Result<PolicyVersion>;

    /// Every rule set bound to `tenant_id` and `subject_id`.
    fn load(&self, tenant_id: &str, subject_id: &str) -> Result<Vec<RuleSet>>;
}

type SubjectKey = (String, String);

#[derive(Debug, Default)]
struct StoreState {
    next_version: PolicyVersion,
    entries: HashMap<SubjectKey, (PolicyVersion, Vec<RuleSet>)>,
}

/// Thread-safe in-memory [`RuleStore`].
///
/// Each `put` or `remove` assigns a fresh, globally increasing version, so a
/// version is never reused for different content.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    state: RwLock<StoreState>,
}

#[derive(Debug, Deserialize)]
struct StoreEntry {
    tenant_id: String,
    subject_id: String,
    #[serde(default)]
    rule_sets: Vec<RuleSet>,
}

impl InMemoryRuleStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `[{"tenant_id", "subject_id", "rule_sets": [..]}, ..]`.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<StoreEntry> = serde_json::from_str(json)?;
        let store = Self::new();
        for entry in entries {
            store.put(&entry.tenant_id, &entry.subject_id, entry.rule_sets);
        }
        Ok(store)
    }

    /// [`from_json`](Self::from_json) on a file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Replace the rule sets of a subject and bump its version.
    pub fn put(&self, tenant_id: &str, subject_id: &str, rule_sets: Vec<RuleSet>) -> PolicyVersion {
        let mut state = self.state.write();
        state.next_version += 1;
        let version = state.next_version;
        state.entries.insert(
            (tenant_id.to_string(), subject_id.to_string()),
            (version, rule_sets),
        );
        debug!(tenant = tenant_id, subject = subject_id, version, "rule sets stored");
        version
    }

    /// Drop the rule sets of a subject; returns the version that replaces them.
    pub fn remove(&self, tenant_id: &str, subject_id: &str) -> PolicyVersion {
        self.put(tenant_id, subject_id, Vec::new())
    }
}

impl RuleStore for InMemoryRuleStore {
    fn version(&self, tenant_id: &str, subject_id: &str) -> Result<PolicyVersion> {
        let state = self.state.read();
        Ok(state
            .entries
            .get(&(tenant_id.to_string(), subject_id.to_string()))
            .map_or(0, |(version, _)| *version))
    }

    fn load(&self, tenant_id: &str, subject_id: &str) -> Result<Vec<RuleSet>> {
        let state = self.state.read();
        Ok(state
            .entries
            .get(&(tenant_id.to_string(), subject_id.to_string()))
            .map(|(_, sets)| sets.clone())
            .unwrap_or_default())
    }
}

impl<S: RuleStore + ?Sized> RuleStore for Arc<S> {
    fn version(&self, tenant_id: &str, subject_id: &str) -> Result<PolicyVersion> {
        (**self).version(tenant_id, subject_id)
    }

    fn load(&self, tenant_id: &str, subject_id: &str) -> Result<Vec<RuleSet>> {
        (**self).load(tenant_id, subject_id)
    }
}

/// [`AuthorizationDecisionSource`] backed by a [`RuleStore`].
///
/// Of the rule sets that apply to the request, any DENY wins. Otherwise the
/// ALLOW sets' row rules are ORed; an ALLOW set without rules grants every
/// row. Columns are granted the same way: a column is visible when any
/// applicable ALLOW set allows it, and a set without a column constraint
/// allows them all.
pub struct RuleStoreDecisionSource<S> {
    store: S,
    registry: Arc<dyn ResourceRegistry>,
    compiler: RuleCompiler,
}

impl<S: RuleStore> RuleStoreDecisionSource<S> {
    /// Source over `store`, resolving fields through `registry`.
    pub fn new(store: S, registry: Arc<dyn ResourceRegistry>) -> Self {
        Self {
            store,
            registry,
            compiler: RuleCompiler::new(),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: RuleStore> AuthorizationDecisionSource for RuleStoreDecisionSource<S> {
    fn policy_version(&self, tenant_id: &str, subject_id: &str) -> Result<PolicyVersion> {
        self.store.version(tenant_id, subject_id)
    }

    fn authorize(&self, request: &AuthorizeRequest<'_>) -> Result<Option<Decision>> {
        let sets: Vec<RuleSet> = self
            .store
            .load(request.tenant_id, request.subject_id)?
            .into_iter()
            .filter(|set| set.applies_to(request.resource, request.action))
            .collect();
        if sets.is_empty() {
            return Ok(None);
        }
        if sets.iter().any(|set| set.effect == DecisionType::Deny) {
            return Ok(Some(Decision::deny()));
        }

        let mut unrestricted = false;
        let mut filters = Vec::new();
        let mut columns: Option<ColumnConstraint> = None;
        for set in &sets {
            let granted = set.columns.clone().unwrap_or_default();
            columns = Some(match columns {
                Some(acc) => acc.union(&granted),
                None => granted,
            });
            if set.rules.is_empty() {
                unrestricted = true;
            } else {
                filters.push(self.compiler.compile(set, request.access, self.registry.as_ref())?);
            }
        }

        let row_filter = if unrestricted {
            None
        } else {
            RangeExpression::combine(LogicalOperator::Or, filters)
        };
        let mut decision = Decision::allow(row_filter);
        if let Some(columns) = columns.filter(ColumnConstraint::is_effective) {
            decision = decision.with_column_constraint(columns);
        }
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_never_repeat() {
        let store = InMemoryRuleStore::new();
        assert_eq!(store.version("t1", "u1").unwrap(), 0);
        let first = store.put("t1", "u1", Vec::new());
        let other = store.put("t1", "u2", Vec::new());
        let second = store.remove("t1", "u1");
        assert!(first < other && other < second);
        assert_eq!(store.version("t1", "u1").unwrap(), second);
    }

    #[test]
    fn json_entries_load_per_subject() {
        let store = InMemoryRuleStore::from_json(
            r#"[{"tenant_id":"t1","subject_id":"u1","rule_sets":[{"resource":"ORDER","effect":"DENY"}]}]"#,
        )
        .unwrap();
        assert_eq!(store.load("t1", "u1").unwrap().len(), 1);
        assert!(store.load("t1", "u2").unwrap().is_empty());
    }
}
