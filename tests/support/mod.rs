#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rowscope::bridge::DataScopeBridge;
use rowscope::cache::PredicateCacheService;
use rowscope::config::PermissionOptions;
use rowscope::decision::{
    AccessContext, AuthorizationDecisionSource, AuthorizeRequest, Decision, PolicyVersion,
};
use rowscope::interceptor::StatementInterceptor;
use rowscope::range::RangeExpression;
use rowscope::registry::{ResourceRegistry, ResourceRegistryBuilder};
use rowscope::{Error, Result};

pub(crate) const ORDER_PAGE: &str = "com.x.OrderMapper.selectPage";

/// ORDER on `t_order` (plus a statement binding) and USER on `t_user`.
pub(crate) fn sample_registry() -> Arc<dyn ResourceRegistry> {
    let registry = ResourceRegistryBuilder::new()
        .resource("ORDER", |r| {
            r.table("t_order")
                .statement(ORDER_PAGE)
                .field("deptId", "t_order", "dept_id")
                .field("ownerId", "t_order", "owner_id")
                .field("status", "t_order", "status")
                .field("amount", "t_order", "amount")
                .field("orderNo", "t_order", "order_no")
        })
        .resource("USER", |r| {
            r.table("t_user")
                .bare_field("deptId", "dept_id")
                .bare_field("name", "name")
        })
        .build()
        .expect("sample registry should build");
    Arc::new(registry)
}

pub(crate) fn access() -> AccessContext {
    AccessContext::new("t1", "u1")
}

pub(crate) fn leaf(sql: &str) -> RangeExpression {
    RangeExpression::parse_leaf(sql).expect("leaf should parse")
}

pub(crate) fn allow(sql: &str) -> Decision {
    Decision::allow(Some(leaf(sql)))
}

/// Scriptable decision source counting how often it is asked.
#[derive(Default)]
pub(crate) struct StubSource {
    version: AtomicU64,
    version_reads: AtomicUsize,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    decisions: Mutex<HashMap<String, Decision>>,
}

impl StubSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with(resource: &str, decision: Decision) -> Arc<Self> {
        let source = Self::new();
        source.set(resource, decision);
        source
    }

    pub(crate) fn set(&self, resource: &str, decision: Decision) {
        self.decisions
            .lock()
            .unwrap()
            .insert(resource.to_string(), decision);
    }

    pub(crate) fn clear(&self, resource: &str) {
        self.decisions.lock().unwrap().remove(resource);
    }

    pub(crate) fn bump(&self) -> PolicyVersion {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn version_reads(&self) -> usize {
        self.version_reads.load(Ordering::SeqCst)
    }
}

impl AuthorizationDecisionSource for StubSource {
    fn policy_version(&self, _tenant_id: &str, _subject_id: &str) -> Result<PolicyVersion> {
        self.version_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.version.load(Ordering::SeqCst))
    }

    fn authorize(&self, request: &AuthorizeRequest<'_>) -> Result<Option<Decision>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::decision_source("policy service unavailable"));
        }
        Ok(self.decisions.lock().unwrap().get(request.resource).cloned())
    }
}

pub(crate) fn cache(source: &Arc<StubSource>) -> Arc<PredicateCacheService> {
    Arc::new(PredicateCacheService::new(
        Arc::clone(source) as Arc<dyn AuthorizationDecisionSource>,
        sample_registry(),
    ))
}

pub(crate) fn bridge(source: &Arc<StubSource>, options: PermissionOptions) -> DataScopeBridge {
    DataScopeBridge::new(sample_registry(), cache(source), options)
}

pub(crate) fn interceptor(
    source: &Arc<StubSource>,
    options: PermissionOptions,
) -> StatementInterceptor {
    StatementInterceptor::new(Arc::new(bridge(source, options)), sample_registry())
}

pub(crate) fn fail_open() -> PermissionOptions {
    PermissionOptions {
        fail_closed: false,
        ..PermissionOptions::default()
    }
}

/// Collapse whitespace so assertions do not depend on rendering details.
pub(crate) fn squash(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
