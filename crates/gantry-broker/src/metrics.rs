//! Counter collection fed by the event bus, rendered on the status port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gantry_core::events::{BrokerEvent, EventBus, EventKind};

#[derive(Default)]
struct Counters {
    steps_processed: AtomicU64,
    steps_retried: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    operations_canceled: AtomicU64,
    orchestrations_finished: AtomicU64,
}

/// Process-wide metrics. Cheap to clone; clones share counters.
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe the counters to every relevant event kind.
    pub fn attach(&self, events: &EventBus) {
        let subscriptions = [
            EventKind::StepProcessed,
            EventKind::OperationSucceeded,
            EventKind::OperationFailed,
            EventKind::OperationCanceled,
            EventKind::OrchestrationFinished,
        ];
        for kind in subscriptions {
            let counters = Arc::clone(&self.counters);
            events.subscribe(kind, move |event| match event {
                BrokerEvent::StepProcessed { retry_after, .. } => {
                    counters.steps_processed.fetch_add(1, Ordering::Relaxed);
                    if retry_after.is_some() {
                        counters.steps_retried.fetch_add(1, Ordering::Relaxed);
                    }
                }
                BrokerEvent::OperationSucceeded { .. } => {
                    counters.operations_succeeded.fetch_add(1, Ordering::Relaxed);
                }
                BrokerEvent::OperationFailed { .. } => {
                    counters.operations_failed.fetch_add(1, Ordering::Relaxed);
                }
                BrokerEvent::OperationCanceled { .. } => {
                    counters.operations_canceled.fetch_add(1, Ordering::Relaxed);
                }
                BrokerEvent::OrchestrationFinished { .. } => {
                    counters
                        .orchestrations_finished
                        .fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    }

    /// Text exposition for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        let c = &self.counters;
        let mut out = String::new();
        for (name, value) in [
            ("gantry_steps_processed_total", &c.steps_processed),
            ("gantry_steps_retried_total", &c.steps_retried),
            ("gantry_operations_succeeded_total", &c.operations_succeeded),
            ("gantry_operations_failed_total", &c.operations_failed),
            ("gantry_operations_canceled_total", &c.operations_canceled),
            (
                "gantry_orchestrations_finished_total",
                &c.orchestrations_finished,
            ),
        ] {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" counter\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.load(Ordering::Relaxed).to_string());
            out.push('\n');
        }
        out
    }
}
