mod support;

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rowscope::cache::PredicateCacheService;
use rowscope::config::CacheOptions;
use rowscope::context::ExecutionScope;
use rowscope::decision::{
    Action, AuthorizationDecisionSource, ColumnConstraint, Decision, DecisionType,
};
use rowscope::events::{spawn_invalidation_listener, PermissionChangeEvent, PermissionChangeType};

use support::{access, allow, cache, sample_registry, StubSource};

#[test]
fn concurrent_misses_evaluate_once() {
    let source = StubSource::with("ORDER", allow("dept_id = 10"));
    source.slow(Duration::from_millis(50));
    let cache = cache(&source);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
                    .unwrap()
                    .expect("policy applies")
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(source.calls(), 1);
    let first = &results[0];
    assert!(results.iter().all(|r| Arc::ptr_eq(r, first)));
    assert_eq!(first.row_filter().unwrap().to_string(), "dept_id = 10");
}

#[test]
fn equal_keys_return_the_same_predicate() {
    let source = StubSource::with("ORDER", allow("dept_id = 10"));
    let cache = cache(&source);
    let a = cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap()
        .unwrap();
    let b = cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(source.calls(), 1);
    assert_eq!(a.policy_version(), 0);
    assert_eq!(a.resource(), "ORDER");
}

#[test]
fn actions_are_cached_separately() {
    let source = StubSource::with("ORDER", allow("dept_id = 10"));
    let cache = cache(&source);
    cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap();
    cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Delete)
        .unwrap();
    assert_eq!(source.calls(), 2);
    assert_eq!(cache.len(), 2);
}

#[test]
fn a_version_bump_recompiles_in_place() {
    let source = StubSource::with("ORDER", allow("dept_id = 10"));
    let cache = cache(&source);
    cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap();

    source.set("ORDER", allow("dept_id = 20"));
    let version = source.bump();
    let fresh = cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap()
        .unwrap();

    assert_eq!(fresh.policy_version(), version);
    assert_eq!(fresh.row_filter().unwrap().to_string(), "dept_id = 20");
    assert_eq!(source.calls(), 2);
    assert_eq!(cache.len(), 1);
}

#[test]
fn no_policy_is_cached_but_errors_are_not() {
    let source = StubSource::new();
    let cache = cache(&source);
    for _ in 0..2 {
        assert!(cache
            .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
            .unwrap()
            .is_none());
    }
    assert_eq!(source.calls(), 1);

    source.fail(true);
    for _ in 0..2 {
        let err = cache
            .get_or_compile("t1", "u1", "USER", &access(), Action::Query)
            .unwrap_err();
        assert_eq!(err.code(), "DECISION_SOURCE_FAILURE");
    }
    assert_eq!(source.calls(), 3);
    assert_eq!(cache.len(), 1);
}

#[test]
fn filters_violating_the_whitelist_are_errors() {
    let source = StubSource::with("ORDER", allow("salary > 1"));
    let cache = cache(&source);
    let err = cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED_COLUMN_REFERENCE");
    assert!(cache.is_empty());
}

#[test]
fn deny_compiles_to_the_always_false_filter() {
    let columns = ColumnConstraint::new(["id"], Vec::<String>::new());
    let source = StubSource::with("ORDER", Decision::deny().with_column_constraint(columns));
    let cache = cache(&source);
    let predicate = cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap()
        .unwrap();
    assert_eq!(predicate.decision_type(), DecisionType::Deny);
    assert!(predicate.row_filter().unwrap().is_always_false());
    assert!(predicate.column_constraint().is_some());
}

fn warm(cache: &PredicateCacheService) {
    for tenant in ["t1", "t2"] {
        for resource in ["ORDER", "USER"] {
            cache
                .get_or_compile(tenant, "u1", resource, &access(), Action::Query)
                .unwrap();
        }
    }
}

#[test]
fn invalidation_narrows_to_the_event_scope() {
    let source = StubSource::new();
    source.set("ORDER", allow("dept_id = 1"));
    source.set("USER", allow("dept_id = 1"));
    let cache = cache(&source);
    warm(&cache);
    assert_eq!(cache.len(), 4);

    let pair = PermissionChangeEvent::new(PermissionChangeType::Update)
        .tenant("t1")
        .resource("order");
    assert_eq!(cache.invalidate(&pair), 1);

    let tenant = PermissionChangeEvent::new(PermissionChangeType::Delete).tenant("t2");
    assert_eq!(cache.invalidate(&tenant), 2);

    let everything = PermissionChangeEvent::new(PermissionChangeType::Create);
    assert_eq!(cache.invalidate(&everything), 1);
    assert!(cache.is_empty());
}

#[test]
fn listener_thread_invalidates_until_senders_drop() {
    let source = StubSource::with("ORDER", allow("dept_id = 1"));
    let cache = cache(&source);
    warm(&cache);

    let (tx, rx) = mpsc::channel();
    let handle = spawn_invalidation_listener(rx, Arc::clone(&cache)).unwrap();
    tx.send(PermissionChangeEvent::new(PermissionChangeType::Update).tenant("t1"))
        .unwrap();
    drop(tx);
    handle.join().unwrap();

    assert_eq!(cache.len(), 2);
    let calls = source.calls();
    cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap();
    assert_eq!(source.calls(), calls + 1);
}

#[test]
fn capacity_bounds_the_number_of_entries() {
    let source = StubSource::new();
    source.set("ORDER", allow("dept_id = 1"));
    source.set("USER", allow("dept_id = 1"));
    let cache = PredicateCacheService::new(
        Arc::clone(&source) as Arc<dyn AuthorizationDecisionSource>,
        sample_registry(),
    )
    .with_options(&CacheOptions {
        max_entries: 2,
        ttl_secs: 3_600,
    });
    warm(&cache);
    assert_eq!(source.calls(), 4);
    assert!(cache.len() <= 2);
}

#[test]
fn a_statement_reads_the_policy_version_once() {
    let source = StubSource::new();
    source.set("ORDER", allow("dept_id = 1"));
    source.set("USER", allow("dept_id = 1"));
    let cache = cache(&source);
    {
        let _scope = ExecutionScope::enter(Action::Query, Some(access()));
        let first = cache
            .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
            .unwrap()
            .unwrap();
        source.bump();
        let again = cache
            .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
            .unwrap()
            .unwrap();
        cache
            .get_or_compile("t1", "u1", "USER", &access(), Action::Query)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.policy_version(), 0);
        assert_eq!(source.version_reads(), 1);
    }

    let fresh = cache
        .get_or_compile("t1", "u1", "ORDER", &access(), Action::Query)
        .unwrap()
        .unwrap();
    assert_eq!(fresh.policy_version(), 1);
    assert_eq!(source.version_reads(), 2);
}
