//! Synchronous in-process publish/subscribe for state transitions.
//!
//! The manager and supervisor publish; metrics and audit subscribers
//! register by event kind. Delivery is synchronous and ordered within one
//! publisher. A panicking subscriber is caught and logged so it can never
//! take the publisher down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use gantry_db::models::{ChildCounters, OperationKind, OrchestrationState};

/// Discriminant used for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StepProcessed,
    OperationSucceeded,
    OperationFailed,
    OperationCanceled,
    OrchestrationFinished,
}

/// Typed events emitted on state transitions.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A step ran to some result; `retry_after` is set when the step asked
    /// to be re-invoked.
    StepProcessed {
        operation_id: Uuid,
        kind: OperationKind,
        step: String,
        retry_after: Option<Duration>,
    },
    OperationSucceeded {
        operation_id: Uuid,
        kind: OperationKind,
    },
    OperationFailed {
        operation_id: Uuid,
        kind: OperationKind,
        reason: String,
    },
    OperationCanceled {
        operation_id: Uuid,
        kind: OperationKind,
    },
    OrchestrationFinished {
        orchestration_id: Uuid,
        state: OrchestrationState,
        counters: ChildCounters,
    },
}

impl BrokerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StepProcessed { .. } => EventKind::StepProcessed,
            Self::OperationSucceeded { .. } => EventKind::OperationSucceeded,
            Self::OperationFailed { .. } => EventKind::OperationFailed,
            Self::OperationCanceled { .. } => EventKind::OperationCanceled,
            Self::OrchestrationFinished { .. } => EventKind::OrchestrationFinished,
        }
    }
}

type Subscriber = Arc<dyn Fn(&BrokerEvent) + Send + Sync>;

/// Process-wide event bus. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<EventKind, Vec<Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one event kind. Subscribers are invoked
    /// in registration order.
    pub fn subscribe(
        &self,
        kind: EventKind,
        subscriber: impl Fn(&BrokerEvent) + Send + Sync + 'static,
    ) {
        let mut guard = self.subscribers.lock().expect("event bus poisoned");
        guard.entry(kind).or_default().push(Arc::new(subscriber));
    }

    /// Deliver the event synchronously to every subscriber of its kind.
    pub fn publish(&self, event: BrokerEvent) {
        // Clone the subscriber list out of the lock so a subscriber that
        // publishes again cannot deadlock.
        let subscribers: Vec<Subscriber> = {
            let guard = self.subscribers.lock().expect("event bus poisoned");
            guard.get(&event.kind()).cloned().unwrap_or_default()
        };

        for subscriber in subscribers {
            let result = catch_unwind(AssertUnwindSafe(|| subscriber(&event)));
            if result.is_err() {
                tracing::error!(event = ?event.kind(), "event subscriber panicked");
            }
        }
    }
}
