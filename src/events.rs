//! Permission change notifications.
//!
//! Events are produced by whoever writes policies ([`ChangeDetector`] derives
//! them from write statements against the policy and resource tables) and
//! consumed by [`PermissionChangeListener`]s such as the predicate cache.

use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

use crate::decision::Action;

/// Kind of policy store change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionChangeType {
    /// A policy or resource was added.
    Create,
    /// A policy or resource was modified.
    Update,
    /// A policy or resource was removed.
    Delete,
}

impl PermissionChangeType {
    /// Change type for a write action; reads produce none.
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Create => Some(PermissionChangeType::Create),
            Action::Update => Some(PermissionChangeType::Update),
            Action::Delete => Some(PermissionChangeType::Delete),
            Action::Query => None,
        }
    }
}

/// A policy store change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionChangeEvent {
    /// What happened.
    pub change_type: PermissionChangeType,
    /// Affected tenant; `None` means every tenant.
    #[serde(default)]
    pub tenant_code: Option<String>,
    /// Affected resource; `None` means every resource of the tenant.
    #[serde(default)]
    pub resource_code: Option<String>,
    /// Affected policy, when known.
    #[serde(default)]
    pub policy_id: Option<String>,
    /// When the change was observed.
    pub changed_at: DateTime<Utc>,
    /// Free-form metadata such as the statement id.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl PermissionChangeEvent {
    /// Event stamped with the current time.
    pub fn new(change_type: PermissionChangeType) -> Self {
        Self {
            change_type,
            tenant_code: None,
            resource_code: None,
            policy_id: None,
            changed_at: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    /// Scope to a tenant.
    pub fn tenant(mut self, tenant_code: impl Into<String>) -> Self {
        self.tenant_code = Some(tenant_code.into());
        self
    }

    /// Scope to a resource.
    pub fn resource(mut self, resource_code: impl Into<String>) -> Self {
        self.resource_code = Some(resource_code.into());
        self
    }
}

/// Receives change events.
pub trait PermissionChangeListener: Send + Sync {
    /// Handle one event. Must not block for long.
    fn on_change(&self, event: &PermissionChangeEvent);
}

impl<L: PermissionChangeListener + ?Sized> PermissionChangeListener for Arc<L> {
    fn on_change(&self, event: &PermissionChangeEvent) {
        (**self).on_change(event);
    }
}

/// Forward every event from `events` to `listener` on a named thread.
///
/// The thread exits once every sender is dropped.
pub fn spawn_invalidation_listener<L>(
    events: Receiver<PermissionChangeEvent>,
    listener: Arc<L>,
) -> io::Result<JoinHandle<()>>
where
    L: PermissionChangeListener + ?Sized + 'static,
{
    thread::Builder::new()
        .name("rowscope-invalidation".to_string())
        .spawn(move || {
            for event in events {
                listener.on_change(&event);
            }
            debug!("invalidation listener stopped");
        })
}

/// Statement-id prefixes identifying writes to the policy and resource stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeDetectorConfig {
    /// Prefix of statements that write policies.
    pub policy_statement_prefix: String,
    /// Prefix of statements that write resources.
    pub resource_statement_prefix: String,
}

impl Default for ChangeDetectorConfig {
    fn default() -> Self {
        Self {
            policy_statement_prefix: "rowscope.PolicyMapper".to_string(),
            resource_statement_prefix: "rowscope.ResourceMapper".to_string(),
        }
    }
}

const ENTITY_KEYS: [&str; 4] = ["et", "entity", "param1", "record"];

/// Turns write statements against the policy or resource store into events.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    config: ChangeDetectorConfig,
}

impl ChangeDetector {
    /// Detector with the given prefixes.
    pub fn new(config: ChangeDetectorConfig) -> Self {
        Self { config }
    }

    /// Event for a write, or `None` when the statement is not a store write.
    ///
    /// `parameter` is the statement's bound parameter object; the entity is
    /// read from it directly or from one of the wrapper keys `et`, `entity`,
    /// `param1` or `record`.
    pub fn detect(
        &self,
        statement_id: &str,
        action: Action,
        parameter: &Json,
    ) -> Option<PermissionChangeEvent> {
        let statement_id = statement_id.trim();
        if statement_id.is_empty() {
            return None;
        }
        let policy_change = statement_id.starts_with(&self.config.policy_statement_prefix);
        let resource_change = statement_id.starts_with(&self.config.resource_statement_prefix);
        if !policy_change && !resource_change {
            return None;
        }
        let change_type = PermissionChangeType::from_action(action)?;

        let mut event = PermissionChangeEvent::new(change_type);
        match entity(parameter) {
            Some(entity) => {
                event.tenant_code = text(entity.get("tenantCode"));
                event.resource_code = text(entity.get("resourceCode"));
                if policy_change {
                    event.policy_id = text(entity.get("id"));
                }
            }
            None if policy_change => {
                event.policy_id = match parameter {
                    Json::Object(map) => text(map.get("id")),
                    other => text(Some(other)),
                };
            }
            None => {}
        }
        event
            .attributes
            .insert("statementId".to_string(), statement_id.to_string());
        event
            .attributes
            .insert("sqlCommand".to_string(), action.code().to_string());

        info!(
            statement_id,
            change = ?event.change_type,
            tenant = event.tenant_code.as_deref().unwrap_or("*"),
            resource = event.resource_code.as_deref().unwrap_or("*"),
            "permission change detected"
        );
        Some(event)
    }
}

fn entity(parameter: &Json) -> Option<&Map<String, Json>> {
    let map = parameter.as_object()?;
    if map.contains_key("tenantCode") || map.contains_key("resourceCode") {
        return Some(map);
    }
    ENTITY_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(Json::as_object))
}

fn text(value: Option<&Json>) -> Option<String> {
    match value? {
        Json::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
