use crate::error::{ErrorCode, ResourceType};
use crate::types::{HealthStatus, RuntimeState};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeEvent {
    #[serde(rename_all = "camelCase")]
    StateChange {
        runtime_id: String,
        timestamp: DateTime<Utc>,
        previous_state: RuntimeState,
        current_state: RuntimeState,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        runtime_id: String,
        timestamp: DateTime<Utc>,
        code: ErrorCode,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ResourceWarning {
        runtime_id: String,
        timestamp: DateTime<Utc>,
        resource_type: ResourceType,
        usage: f64,
        limit: f64,
    },
    #[serde(rename_all = "camelCase")]
    HealthCheck {
        runtime_id: String,
        timestamp: DateTime<Utc>,
        health: HealthStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    Error,
    ResourceWarning,
    HealthCheck,
}

impl RuntimeEvent {
    pub fn state_change(runtime_id: &str, previous: RuntimeState, current: RuntimeState) -> Self {
        RuntimeEvent::StateChange {
            runtime_id: runtime_id.to_owned(),
            timestamp: Utc::now(),
            previous_state: previous,
            current_state: current,
        }
    }

    pub fn error(runtime_id: &str, err: &crate::RuntimeError) -> Self {
        RuntimeEvent::Error {
            runtime_id: runtime_id.to_owned(),
            timestamp: Utc::now(),
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn health_check(runtime_id: &str, health: HealthStatus) -> Self {
        RuntimeEvent::HealthCheck {
            runtime_id: runtime_id.to_owned(),
            timestamp: Utc::now(),
            health,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            RuntimeEvent::StateChange { .. } => EventKind::StateChange,
            RuntimeEvent::Error { .. } => EventKind::Error,
            RuntimeEvent::ResourceWarning { .. } => EventKind::ResourceWarning,
            RuntimeEvent::HealthCheck { .. } => EventKind::HealthCheck,
        }
    }

    pub fn runtime_id(&self) -> &str {
        match self {
            RuntimeEvent::StateChange { runtime_id, .. }
            | RuntimeEvent::Error { runtime_id, .. }
            | RuntimeEvent::ResourceWarning { runtime_id, .. }
            | RuntimeEvent::HealthCheck { runtime_id, .. } => runtime_id,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Synchronous fan-out of runtime events to subscribed handlers.
///
/// Handlers run in subscription order on the emitting task. A panicking
/// handler is logged and skipped so later handlers still see the event.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind, or to all of them with `None`.
    pub fn subscribe(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription { id, kind, handler });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn emit(&self, event: &RuntimeEvent) {
        // Snapshot the handler list so handlers may (un)subscribe re-entrantly.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == event.kind()))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(
                    "event handler panicked on {:?} for {}",
                    event.kind(),
                    event.runtime_id()
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}
