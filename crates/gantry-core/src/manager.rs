//! The operation manager: drives one operation through its step pipeline
//! to completion or permanent failure.
//!
//! At most one worker acts on an operation at a time; that is enforced by
//! the store's optimistic version check, not by coordination between
//! workers. Losing the version race means another worker holds the record,
//! so the manager drops it silently.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_db::models::{Operation, OperationState};
use gantry_db::store::{OperationStore, StoreError};

use crate::events::{BrokerEvent, EventBus};
use crate::queue::{ExecuteOutcome, Executor};
use crate::step::{Step, StepRegistry, StepResult};

/// Default wall-clock budget for one operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Description written when an operation outlives its budget.
pub const TIMEOUT_REASON: &str = "operation exceeded timeout";

pub struct OperationManager {
    store: Arc<dyn OperationStore>,
    registry: StepRegistry,
    events: EventBus,
    operation_timeout: chrono::Duration,
}

impl OperationManager {
    pub fn new(
        store: Arc<dyn OperationStore>,
        registry: StepRegistry,
        events: EventBus,
        operation_timeout: Duration,
    ) -> Self {
        let operation_timeout = chrono::Duration::from_std(operation_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        Self {
            store,
            registry,
            events,
            operation_timeout,
        }
    }

    /// Run the operation's eligible steps in weight order.
    ///
    /// Returns [`ExecuteOutcome::Requeue`] when a step asked to be
    /// re-invoked later; everything else (terminal state, lost version
    /// race, missing record) resolves to [`ExecuteOutcome::Done`].
    pub async fn process(&self, id: Uuid) -> anyhow::Result<ExecuteOutcome> {
        let mut op = match self.store.get(id).await {
            Ok(op) => op,
            Err(StoreError::NotFound(_)) => {
                warn!(operation_id = %id, "operation not found, dropping");
                return Ok(ExecuteOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if op.state.is_terminal() {
            return Ok(ExecuteOutcome::Done);
        }

        if op.state == OperationState::Pending {
            op.state = OperationState::InProgress;
            op.updated_at = Utc::now();
            match self.persist(op).await? {
                Some(persisted) => op = persisted,
                None => return Ok(ExecuteOutcome::Done),
            }
        }

        if self.expired(&op) {
            return self.fail_operation(op, TIMEOUT_REASON).await;
        }

        for entry in self.registry.plan() {
            // Reload between steps: observe cancellation written directly
            // to the store, and progress persisted before a crash.
            op = match self.store.get(id).await {
                Ok(op) => op,
                Err(StoreError::NotFound(_)) => return Ok(ExecuteOutcome::Done),
                Err(e) => return Err(e.into()),
            };

            if op.state == OperationState::Canceled {
                info!(operation_id = %op.id, "operation canceled, aborting pipeline");
                self.events.publish(BrokerEvent::OperationCanceled {
                    operation_id: op.id,
                    kind: op.kind(),
                });
                return Ok(ExecuteOutcome::Done);
            }
            if op.state.is_terminal() {
                return Ok(ExecuteOutcome::Done);
            }

            if self.expired(&op) {
                return self.fail_operation(op, TIMEOUT_REASON).await;
            }

            if op.progress.contains_key(entry.name()) || entry.skipped(&op) {
                continue;
            }

            let step_name = entry.name().to_string();
            let kind = op.kind();
            debug!(operation_id = %op.id, step = %step_name, "running step");

            match self.invoke(&entry.step, op.clone()).await {
                StepResult::Done(mut next) => {
                    let now = Utc::now();
                    next.progress.insert(step_name.clone(), now);
                    next.updated_at = now;
                    let operation_id = next.id;
                    match self.persist(next).await? {
                        Some(persisted) => op = persisted,
                        None => return Ok(ExecuteOutcome::Done),
                    }
                    self.events.publish(BrokerEvent::StepProcessed {
                        operation_id,
                        kind,
                        step: step_name,
                        retry_after: None,
                    });
                }
                StepResult::Retry(mut next, delay) => {
                    next.updated_at = Utc::now();
                    let operation_id = next.id;
                    if self.persist(next).await?.is_none() {
                        return Ok(ExecuteOutcome::Done);
                    }
                    debug!(
                        operation_id = %operation_id,
                        step = %step_name,
                        retry_after_secs = delay.as_secs_f64(),
                        "step not done yet, rescheduling"
                    );
                    self.events.publish(BrokerEvent::StepProcessed {
                        operation_id,
                        kind,
                        step: step_name,
                        retry_after: Some(delay),
                    });
                    return Ok(ExecuteOutcome::Requeue(delay));
                }
                StepResult::Fail(next, error) => {
                    let reason = format!("{error:#}");
                    warn!(
                        operation_id = %next.id,
                        step = %step_name,
                        error = %reason,
                        "step failed permanently"
                    );
                    return self.fail_operation(next, &reason).await;
                }
            }
        }

        // Every step has a progress marker (or was skipped): the operation
        // is complete.
        let now = Utc::now();
        op.state = OperationState::Succeeded;
        op.description = "operation succeeded".to_string();
        op.updated_at = now;
        op.finished_at = Some(now);
        let operation_id = op.id;
        let kind = op.kind();
        if self.persist(op).await?.is_some() {
            info!(operation_id = %operation_id, "operation succeeded");
            self.events.publish(BrokerEvent::OperationSucceeded { operation_id, kind });
        }
        Ok(ExecuteOutcome::Done)
    }

    fn expired(&self, op: &Operation) -> bool {
        Utc::now() > op.created_at + self.operation_timeout
    }

    /// Run a step with panic containment: a panicking step is reported as
    /// a permanent failure, never as a crashed worker.
    async fn invoke(&self, step: &Arc<dyn Step>, op: Operation) -> StepResult {
        let fallback = op.clone();
        let name = step.name().to_string();
        match AssertUnwindSafe(step.run(op)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "opaque panic payload".to_string()
                };
                StepResult::Fail(fallback, anyhow!("step {name} panicked: {reason}"))
            }
        }
    }

    /// Transition to `failed` with the reason as the description.
    async fn fail_operation(
        &self,
        mut op: Operation,
        reason: &str,
    ) -> anyhow::Result<ExecuteOutcome> {
        let now = Utc::now();
        op.state = OperationState::Failed;
        op.description = reason.to_string();
        op.updated_at = now;
        op.finished_at = Some(now);
        let operation_id = op.id;
        let kind = op.kind();
        if self.persist(op).await?.is_some() {
            self.events.publish(BrokerEvent::OperationFailed {
                operation_id,
                kind,
                reason: reason.to_string(),
            });
        }
        Ok(ExecuteOutcome::Done)
    }

    /// Optimistic write; `None` means the version race was lost and the
    /// operation belongs to another worker now.
    async fn persist(&self, op: Operation) -> anyhow::Result<Option<Operation>> {
        match self.store.update(op).await {
            Ok(op) => Ok(Some(op)),
            Err(StoreError::Conflict(id)) => {
                debug!(operation_id = %id, "optimistic write lost, dropping operation");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Executor for OperationManager {
    async fn execute(&self, id: Uuid) -> anyhow::Result<ExecuteOutcome> {
        self.process(id).await
    }
}
