//! The orchestration supervisor: expands campaigns into per-runtime child
//! operations and tracks aggregate progress.
//!
//! The supervisor never runs steps itself. It creates children in the
//! operation store, admits them to the matching kind queue in waves
//! bounded by the campaign's parallelism, and derives the campaign's
//! terminal state from child states.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_db::models::{
    ChildCounters, Operation, OperationFilter, OperationKind, OperationPayload, OperationState,
    Orchestration, OrchestrationKind, OrchestrationState, UpgradeClusterPayload,
    UpgradeRuntimePayload,
};
use gantry_db::store::{OperationStore, OrchestrationStore, StoreError};

use crate::events::{BrokerEvent, EventBus};
use crate::queue::{ExecuteOutcome, Executor, QueueHandle};
use crate::resolver::RuntimeResolver;

/// Default delay between supervisor scans of one campaign.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

pub struct OrchestrationSupervisor {
    orchestrations: Arc<dyn OrchestrationStore>,
    operations: Arc<dyn OperationStore>,
    resolver: Arc<dyn RuntimeResolver>,
    /// Queue per child operation kind; children are admitted here.
    child_queues: HashMap<OperationKind, QueueHandle>,
    events: EventBus,
    polling_interval: Duration,
}

impl OrchestrationSupervisor {
    pub fn new(
        orchestrations: Arc<dyn OrchestrationStore>,
        operations: Arc<dyn OperationStore>,
        resolver: Arc<dyn RuntimeResolver>,
        child_queues: HashMap<OperationKind, QueueHandle>,
        events: EventBus,
        polling_interval: Duration,
    ) -> Self {
        Self {
            orchestrations,
            operations,
            resolver,
            child_queues,
            events,
            polling_interval,
        }
    }

    /// One supervision tick for a campaign.
    pub async fn process(&self, id: Uuid) -> anyhow::Result<ExecuteOutcome> {
        let orchestration = match self.orchestrations.get(id).await {
            Ok(orchestration) => orchestration,
            Err(StoreError::NotFound(_)) => {
                warn!(orchestration_id = %id, "orchestration not found, dropping");
                return Ok(ExecuteOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if orchestration.state.is_terminal() {
            return Ok(ExecuteOutcome::Done);
        }

        match orchestration.state {
            OrchestrationState::Pending => self.start(orchestration).await,
            OrchestrationState::Canceling => self.drain_canceled(orchestration).await,
            OrchestrationState::InProgress | OrchestrationState::Retrying => {
                self.scan(orchestration).await
            }
            // Terminal states were handled above.
            _ => Ok(ExecuteOutcome::Done),
        }
    }

    /// Expand a pending campaign: resolve targets, create one pending
    /// child per runtime, and move to in-progress.
    async fn start(&self, mut orchestration: Orchestration) -> anyhow::Result<ExecuteOutcome> {
        let runtimes = self
            .resolver
            .resolve(&orchestration.parameters.targets)
            .await
            .context("failed to resolve campaign targets")?;

        // Restart-safe: a crash mid-expansion leaves some children behind;
        // skip the runtimes that already have one.
        let existing = self
            .operations
            .list_by_orchestration(orchestration.id, OperationFilter::default())
            .await?;
        let covered: HashSet<&str> = existing
            .operations
            .iter()
            .map(|op| op.instance_id.as_str())
            .collect();

        let mut created = 0usize;
        for runtime in &runtimes {
            if covered.contains(runtime.instance_id.as_str()) {
                continue;
            }
            let payload = match orchestration.kind {
                OrchestrationKind::UpgradeRuntime => {
                    OperationPayload::UpgradeRuntime(UpgradeRuntimePayload {
                        runtime_id: runtime.runtime_id,
                        target_version: orchestration.parameters.target_version.clone(),
                        previous_version: None,
                    })
                }
                OrchestrationKind::UpgradeCluster => {
                    OperationPayload::UpgradeCluster(UpgradeClusterPayload {
                        runtime_id: runtime.runtime_id,
                        target_version: orchestration.parameters.target_version.clone(),
                    })
                }
            };
            let mut child = Operation::new(runtime.instance_id.clone(), payload);
            child.orchestration_id = Some(orchestration.id);

            match self.operations.insert(child).await {
                Ok(()) => created += 1,
                Err(StoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            orchestration_id = %orchestration.id,
            targets = runtimes.len(),
            created,
            "campaign expanded into child operations"
        );

        let counters = self.count_children(orchestration.id).await?;
        orchestration.state = OrchestrationState::InProgress;
        orchestration.counters = counters;
        orchestration.description = format!("{} runtimes targeted", counters.total());
        orchestration.updated_at = Utc::now();

        if self.persist(orchestration).await?.is_none() {
            return Ok(ExecuteOutcome::Done);
        }
        // Admit the first wave right away instead of waiting a full poll.
        Ok(ExecuteOutcome::Requeue(Duration::ZERO))
    }

    /// Regular scan of an in-progress campaign: refresh counters, admit
    /// the next wave, derive the terminal state.
    async fn scan(&self, mut orchestration: Orchestration) -> anyhow::Result<ExecuteOutcome> {
        let page = self
            .operations
            .list_by_orchestration(orchestration.id, OperationFilter::default())
            .await?;
        let counters = count(&page.operations);

        if counters.pending == 0 && counters.in_progress == 0 {
            let state = if counters.failed > 0 {
                OrchestrationState::Failed
            } else {
                OrchestrationState::Succeeded
            };
            return self.finish(orchestration, state, counters).await;
        }

        let parallelism = orchestration.parameters.parallelism.max(1);
        let window_open = orchestration
            .parameters
            .schedule
            .as_ref()
            .is_none_or(|w| w.contains(Utc::now()));

        if window_open && counters.in_progress < parallelism {
            let slots = (parallelism - counters.in_progress) as usize;
            match self.child_queues.get(&orchestration.kind.child_kind()) {
                Some(queue) => {
                    // Children are sorted by created_at, so the admitted
                    // prefix is stable across scans; dedup in the queue
                    // makes re-adding it a no-op.
                    for child in page
                        .operations
                        .iter()
                        .filter(|op| op.state == OperationState::Pending)
                        .take(slots)
                    {
                        queue.add(child.id);
                    }
                }
                None => warn!(
                    orchestration_id = %orchestration.id,
                    kind = %orchestration.kind,
                    "no queue registered for child kind, children stay pending"
                ),
            }
        } else if !window_open {
            debug!(
                orchestration_id = %orchestration.id,
                "outside the schedule window, not releasing children"
            );
        }

        orchestration.counters = counters;
        orchestration.updated_at = Utc::now();
        if self.persist(orchestration).await?.is_none() {
            return Ok(ExecuteOutcome::Done);
        }
        Ok(ExecuteOutcome::Requeue(self.polling_interval))
    }

    /// Canceling flow: pending children are canceled directly; in-flight
    /// children settle on their own (steps observe the cancel hint via the
    /// shared store).
    async fn drain_canceled(
        &self,
        mut orchestration: Orchestration,
    ) -> anyhow::Result<ExecuteOutcome> {
        let page = self
            .operations
            .list_by_orchestration(
                orchestration.id,
                OperationFilter::states([OperationState::Pending]),
            )
            .await?;

        for mut child in page.operations {
            let now = Utc::now();
            child.state = OperationState::Canceled;
            child.description = "canceled by orchestration".to_string();
            child.updated_at = now;
            child.finished_at = Some(now);
            match self.operations.update(child).await {
                Ok(_) => {}
                // A worker grabbed the child first; it will settle on its
                // own and the next scan picks it up.
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let counters = self.count_children(orchestration.id).await?;
        if counters.in_progress == 0 {
            return self
                .finish(orchestration, OrchestrationState::Canceled, counters)
                .await;
        }

        orchestration.counters = counters;
        orchestration.updated_at = Utc::now();
        if self.persist(orchestration).await?.is_none() {
            return Ok(ExecuteOutcome::Done);
        }
        Ok(ExecuteOutcome::Requeue(self.polling_interval))
    }

    async fn finish(
        &self,
        mut orchestration: Orchestration,
        state: OrchestrationState,
        counters: ChildCounters,
    ) -> anyhow::Result<ExecuteOutcome> {
        let orchestration_id = orchestration.id;
        orchestration.state = state;
        orchestration.counters = counters;
        orchestration.description = match state {
            OrchestrationState::Succeeded => "all children succeeded".to_string(),
            OrchestrationState::Failed => {
                format!("{} of {} children failed", counters.failed, counters.total())
            }
            OrchestrationState::Canceled => "campaign canceled".to_string(),
            other => other.to_string(),
        };
        orchestration.updated_at = Utc::now();

        if self.persist(orchestration).await?.is_some() {
            info!(
                orchestration_id = %orchestration_id,
                state = %state,
                "orchestration finished"
            );
            self.events.publish(BrokerEvent::OrchestrationFinished {
                orchestration_id,
                state,
                counters,
            });
        }
        Ok(ExecuteOutcome::Done)
    }

    async fn count_children(&self, orchestration_id: Uuid) -> anyhow::Result<ChildCounters> {
        let page = self
            .operations
            .list_by_orchestration(orchestration_id, OperationFilter::default())
            .await?;
        Ok(count(&page.operations))
    }

    async fn persist(
        &self,
        orchestration: Orchestration,
    ) -> anyhow::Result<Option<Orchestration>> {
        match self.orchestrations.update(orchestration).await {
            Ok(orchestration) => Ok(Some(orchestration)),
            Err(StoreError::Conflict(id)) => {
                debug!(
                    orchestration_id = %id,
                    "optimistic write lost, dropping orchestration"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn count(children: &[Operation]) -> ChildCounters {
    let mut counters = ChildCounters::default();
    for child in children {
        counters.record(child.state);
    }
    counters
}

#[async_trait]
impl Executor for OrchestrationSupervisor {
    async fn execute(&self, id: Uuid) -> anyhow::Result<ExecuteOutcome> {
        self.process(id).await
    }
}
