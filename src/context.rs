//! Per-thread execution context for the statement currently being filtered.
//!
//! The holder carries the statement action, the access context and the
//! column constraints the bridge collected, keyed by resource. Inside an
//! [`ExecutionScope`] it also memoizes policy versions and compiled
//! predicates, so a statement that touches one resource several times asks
//! the decision source once. It is strictly thread-confined;
//! [`ExecutionScope`] guarantees that whatever a statement wrote is gone
//! once the statement finishes, on every exit path.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::cache::{CompiledPredicate, PredicateCacheKey};
use crate::decision::{AccessContext, Action, ColumnConstraint, PolicyVersion};

#[derive(Debug, Clone, Default)]
struct RequestMemo {
    versions: HashMap<(String, String), PolicyVersion>,
    predicates: HashMap<PredicateCacheKey, Option<Arc<CompiledPredicate>>>,
}

#[derive(Debug, Clone, Default)]
struct ExecutionContext {
    action: Option<Action>,
    access: Option<AccessContext>,
    constraints: BTreeMap<String, ColumnConstraint>,
    // Only present while a scope is active.
    memo: Option<RequestMemo>,
}

thread_local! {
    static CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::default());
}

/// Accessors for the current thread's execution context.
pub struct ExecutionContextHolder;

impl ExecutionContextHolder {
    /// Record the action of the current statement.
    pub fn set_action(action: Action) {
        CONTEXT.with(|ctx| ctx.borrow_mut().action = Some(action));
    }

    /// Action of the current statement, defaulting to [`Action::Query`].
    pub fn action() -> Action {
        CONTEXT.with(|ctx| ctx.borrow().action.unwrap_or_default())
    }

    /// Record the access context of the current statement.
    pub fn set_access(access: AccessContext) {
        CONTEXT.with(|ctx| ctx.borrow_mut().access = Some(access));
    }

    /// Access context of the current statement, if one was set.
    pub fn access() -> Option<AccessContext> {
        CONTEXT.with(|ctx| ctx.borrow().access.clone())
    }

    /// Store the column constraint for `resource`, replacing any earlier one.
    pub fn put_constraint(resource: impl Into<String>, constraint: ColumnConstraint) {
        CONTEXT.with(|ctx| {
            ctx.borrow_mut()
                .constraints
                .insert(resource.into(), constraint);
        });
    }

    /// Snapshot of every constraint collected so far.
    pub fn constraints() -> BTreeMap<String, ColumnConstraint> {
        CONTEXT.with(|ctx| ctx.borrow().constraints.clone())
    }

    /// Policy version already looked up by the current statement.
    pub fn memoized_version(tenant_id: &str, subject_id: &str) -> Option<PolicyVersion> {
        CONTEXT.with(|ctx| {
            ctx.borrow().memo.as_ref().and_then(|memo| {
                memo.versions
                    .get(&(tenant_id.to_string(), subject_id.to_string()))
                    .copied()
            })
        })
    }

    /// Remember a policy version for the rest of the statement. Outside a
    /// scope this does nothing.
    pub fn memoize_version(tenant_id: &str, subject_id: &str, version: PolicyVersion) {
        CONTEXT.with(|ctx| {
            if let Some(memo) = ctx.borrow_mut().memo.as_mut() {
                memo.versions
                    .insert((tenant_id.to_string(), subject_id.to_string()), version);
            }
        });
    }

    /// Predicate already resolved for `key` by the current statement.
    ///
    /// The outer `None` is a miss; `Some(None)` is a remembered "no policy".
    pub fn memoized_predicate(key: &PredicateCacheKey) -> Option<Option<Arc<CompiledPredicate>>> {
        CONTEXT.with(|ctx| {
            ctx.borrow()
                .memo
                .as_ref()
                .and_then(|memo| memo.predicates.get(key).cloned())
        })
    }

    /// Remember a resolved predicate for the rest of the statement.
    pub fn memoize_predicate(key: PredicateCacheKey, predicate: Option<Arc<CompiledPredicate>>) {
        CONTEXT.with(|ctx| {
            if let Some(memo) = ctx.borrow_mut().memo.as_mut() {
                memo.predicates.insert(key, predicate);
            }
        });
    }

    /// Reset the thread's context.
    pub fn clear() {
        CONTEXT.with(|ctx| *ctx.borrow_mut() = ExecutionContext::default());
    }

    fn replace(next: ExecutionContext) -> ExecutionContext {
        CONTEXT.with(|ctx| std::mem::replace(&mut *ctx.borrow_mut(), next))
    }
}

/// Scoped ownership of the execution context.
///
/// Entering installs a fresh context for one statement; dropping the scope
/// restores the context that was active before, so nested statements and
/// panics both leave the thread exactly as they found it.
#[must_use = "the context is restored as soon as the scope is dropped"]
pub struct ExecutionScope {
    previous: Option<ExecutionContext>,
    _not_send: PhantomData<*const ()>,
}

impl ExecutionScope {
    /// Install `action` and `access` for the current statement.
    pub fn enter(action: Action, access: Option<AccessContext>) -> Self {
        let previous = ExecutionContextHolder::replace(ExecutionContext {
            action: Some(action),
            access,
            constraints: BTreeMap::new(),
            memo: Some(RequestMemo::default()),
        });
        Self {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            ExecutionContextHolder::replace(previous);
        }
    }
}
