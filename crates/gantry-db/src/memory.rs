//! Process-local store implementations.
//!
//! Back the `DbInMemory` broker mode and the default test suite. The
//! version-check semantics are identical to the PostgreSQL stores so the
//! engine cannot tell the difference.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    paginate, Operation, OperationFilter, OperationKind, OperationState, Orchestration,
    OrchestrationFilter,
};
use crate::store::{
    ChildPage, OperationStore, OrchestrationStore, StoreError, StoreResult,
};

/// In-memory [`OperationStore`].
#[derive(Default)]
pub struct InMemoryOperationStore {
    operations: RwLock<HashMap<Uuid, Operation>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert(&self, op: Operation) -> StoreResult<()> {
        let mut guard = self.operations.write().expect("operation store poisoned");
        if guard.contains_key(&op.id) {
            return Err(StoreError::AlreadyExists(op.id));
        }
        guard.insert(op.id, op);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Operation> {
        let guard = self.operations.read().expect("operation store poisoned");
        guard.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, mut op: Operation) -> StoreResult<Operation> {
        let mut guard = self.operations.write().expect("operation store poisoned");
        let stored = guard.get(&op.id).ok_or(StoreError::NotFound(op.id))?;
        if stored.version != op.version {
            return Err(StoreError::Conflict(op.id));
        }
        op.version += 1;
        guard.insert(op.id, op.clone());
        Ok(op)
    }

    async fn list_not_finished_by_kind(
        &self,
        kind: OperationKind,
    ) -> StoreResult<Vec<Operation>> {
        let guard = self.operations.read().expect("operation store poisoned");
        let mut ops: Vec<Operation> = guard
            .values()
            .filter(|op| op.kind() == kind && !op.state.is_terminal())
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.created_at);
        Ok(ops)
    }

    async fn list_by_orchestration(
        &self,
        orchestration_id: Uuid,
        filter: OperationFilter,
    ) -> StoreResult<ChildPage> {
        let guard = self.operations.read().expect("operation store poisoned");
        let children: Vec<&Operation> = guard
            .values()
            .filter(|op| op.orchestration_id == Some(orchestration_id))
            .collect();

        let in_progress = children
            .iter()
            .filter(|op| op.state == OperationState::InProgress)
            .count() as u32;

        let mut matching: Vec<Operation> = children
            .into_iter()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        matching.sort_by_key(|op| op.created_at);

        let total = matching.len() as u32;
        let operations = paginate(matching, filter.page, filter.page_size);

        Ok(ChildPage {
            operations,
            in_progress,
            total,
        })
    }

    async fn last_by_instance(&self, instance_id: &str) -> StoreResult<Option<Operation>> {
        let guard = self.operations.read().expect("operation store poisoned");
        Ok(guard
            .values()
            .filter(|op| op.instance_id == instance_id)
            .max_by_key(|op| op.created_at)
            .cloned())
    }
}

/// In-memory [`OrchestrationStore`].
#[derive(Default)]
pub struct InMemoryOrchestrationStore {
    orchestrations: RwLock<HashMap<Uuid, Orchestration>>,
}

impl InMemoryOrchestrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrchestrationStore for InMemoryOrchestrationStore {
    async fn insert(&self, orchestration: Orchestration) -> StoreResult<()> {
        let mut guard = self
            .orchestrations
            .write()
            .expect("orchestration store poisoned");
        if guard.contains_key(&orchestration.id) {
            return Err(StoreError::AlreadyExists(orchestration.id));
        }
        guard.insert(orchestration.id, orchestration);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Orchestration> {
        let guard = self
            .orchestrations
            .read()
            .expect("orchestration store poisoned");
        guard.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, mut orchestration: Orchestration) -> StoreResult<Orchestration> {
        let mut guard = self
            .orchestrations
            .write()
            .expect("orchestration store poisoned");
        let stored = guard
            .get(&orchestration.id)
            .ok_or(StoreError::NotFound(orchestration.id))?;
        if stored.version != orchestration.version {
            return Err(StoreError::Conflict(orchestration.id));
        }
        orchestration.version += 1;
        guard.insert(orchestration.id, orchestration.clone());
        Ok(orchestration)
    }

    async fn list(&self, filter: OrchestrationFilter) -> StoreResult<Vec<Orchestration>> {
        let guard = self
            .orchestrations
            .read()
            .expect("orchestration store poisoned");
        let mut matching: Vec<Orchestration> = guard
            .values()
            .filter(|orch| filter.matches(orch))
            .cloned()
            .collect();
        matching.sort_by_key(|orch| orch.created_at);
        Ok(paginate(matching, filter.page, filter.page_size))
    }
}
