//! Startup crash recovery: requeue everything that was in flight when the
//! previous process died.
//!
//! Runs synchronously before the HTTP surface starts serving. Operation
//! replay is safe because steps are idempotent and completed steps are
//! skipped via their progress markers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use gantry_db::models::{
    OperationFilter, OperationKind, OperationState, OrchestrationFilter, OrchestrationState,
};
use gantry_db::store::{OperationStore, OrchestrationStore};

use crate::queue::QueueHandle;

/// What the loader put back on the queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub operations: usize,
    pub orchestrations: usize,
}

pub struct RecoveryLoader {
    operations: Arc<dyn OperationStore>,
    orchestrations: Arc<dyn OrchestrationStore>,
    operation_queues: HashMap<OperationKind, QueueHandle>,
    orchestration_queue: QueueHandle,
    /// Disabled on read-only replicas that share a production database.
    enabled: bool,
}

impl RecoveryLoader {
    pub fn new(
        operations: Arc<dyn OperationStore>,
        orchestrations: Arc<dyn OrchestrationStore>,
        operation_queues: HashMap<OperationKind, QueueHandle>,
        orchestration_queue: QueueHandle,
        enabled: bool,
    ) -> Self {
        Self {
            operations,
            orchestrations,
            operation_queues,
            orchestration_queue,
            enabled,
        }
    }

    pub async fn restore(&self) -> anyhow::Result<RestoreSummary> {
        if !self.enabled {
            info!("recovery loader disabled, skipping restore");
            return Ok(RestoreSummary::default());
        }

        let mut summary = RestoreSummary::default();

        for (kind, queue) in &self.operation_queues {
            let unfinished = self.operations.list_not_finished_by_kind(*kind).await?;
            if unfinished.is_empty() {
                continue;
            }
            info!(
                kind = %kind,
                count = unfinished.len(),
                "requeueing unfinished operations"
            );
            // Already sorted by created_at ascending.
            for op in unfinished {
                if queue.add(op.id) {
                    summary.operations += 1;
                }
            }
        }

        summary.orchestrations += self.restore_canceling().await?;

        for states in [
            vec![
                OrchestrationState::InProgress,
                OrchestrationState::Retrying,
            ],
            vec![OrchestrationState::Pending],
        ] {
            let orchestrations = self
                .orchestrations
                .list(OrchestrationFilter::states(states))
                .await?;
            for orchestration in orchestrations {
                if self.orchestration_queue.add(orchestration.id) {
                    summary.orchestrations += 1;
                }
            }
        }

        info!(
            operations = summary.operations,
            orchestrations = summary.orchestrations,
            "recovery restore finished"
        );
        Ok(summary)
    }

    /// Requeue at most one canceling orchestration per startup, and only
    /// when one of its children is still in progress. A canceling
    /// campaign with nothing in flight resolves on its next regular scan,
    /// so requeueing it here is wasted work; the one-per-startup cap
    /// bounds the cancel fan-out a restart can trigger at once.
    async fn restore_canceling(&self) -> anyhow::Result<usize> {
        let canceling = self
            .orchestrations
            .list(OrchestrationFilter::states([OrchestrationState::Canceling]))
            .await?;

        for orchestration in canceling {
            if !self.has_in_progress_children(orchestration.id).await? {
                continue;
            }
            if self.orchestration_queue.add(orchestration.id) {
                info!(
                    orchestration_id = %orchestration.id,
                    "requeued canceling orchestration"
                );
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn has_in_progress_children(&self, orchestration_id: Uuid) -> anyhow::Result<bool> {
        let page = self
            .operations
            .list_by_orchestration(
                orchestration_id,
                OperationFilter::states([OperationState::InProgress]),
            )
            .await?;
        Ok(page.in_progress > 0)
    }
}
