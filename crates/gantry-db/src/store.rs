//! Store traits consumed by the engine.
//!
//! Both traits are object-safe so the engine can hold `Arc<dyn ...>` and be
//! wired against PostgreSQL in production or the in-memory stores in
//! `DbInMemory` mode and tests. All mutations use optimistic concurrency:
//! `update` succeeds only when the caller's `version` matches the stored
//! one, and bumps it by one.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Operation, OperationFilter, OperationKind, Orchestration, OrchestrationFilter,
};

/// Errors surfaced by the stores. The engine matches on `Conflict` (drop
/// the record, another writer holds it) and `NotFound`; everything else is
/// a backend failure that bubbles up.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(Uuid),

    #[error("record {0} already exists")]
    AlreadyExists(Uuid),

    /// The optimistic version check failed: another writer updated the
    /// record since it was read.
    #[error("version conflict on record {0}")]
    Conflict(Uuid),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A page of child operations plus the aggregate counts the supervisor
/// needs for wave admission.
#[derive(Debug, Clone)]
pub struct ChildPage {
    /// Children matching the filter, sorted by `created_at` ascending.
    pub operations: Vec<Operation>,
    /// Children of the orchestration currently in progress, regardless of
    /// the filter.
    pub in_progress: u32,
    /// Children matching the filter before pagination.
    pub total: u32,
}

/// Durable CRUD over operation records.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn insert(&self, op: Operation) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Operation>;

    /// Persist the operation if `op.version` still matches the stored
    /// version; returns the record with the bumped version.
    async fn update(&self, op: Operation) -> StoreResult<Operation>;

    /// Non-terminal operations of one kind, sorted by `created_at`
    /// ascending (the order the recovery loader requeues them in).
    async fn list_not_finished_by_kind(&self, kind: OperationKind)
        -> StoreResult<Vec<Operation>>;

    /// Children of an orchestration, filtered and paginated.
    async fn list_by_orchestration(
        &self,
        orchestration_id: Uuid,
        filter: OperationFilter,
    ) -> StoreResult<ChildPage>;

    /// The most recently created operation for an instance, terminal or
    /// not. Backs the last-operation endpoint.
    async fn last_by_instance(&self, instance_id: &str) -> StoreResult<Option<Operation>>;
}

/// Durable CRUD over orchestration records.
#[async_trait]
pub trait OrchestrationStore: Send + Sync {
    async fn insert(&self, orchestration: Orchestration) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Orchestration>;

    /// Optimistic update, same contract as [`OperationStore::update`].
    async fn update(&self, orchestration: Orchestration) -> StoreResult<Orchestration>;

    /// Orchestrations matching the filter, sorted by `created_at`
    /// ascending.
    async fn list(&self, filter: OrchestrationFilter) -> StoreResult<Vec<Orchestration>>;
}

// Both traits must stay object-safe; the engine holds them as trait
// objects.
const _: () = {
    fn _assert_object_safe(_: &dyn OperationStore, _: &dyn OrchestrationStore) {}
};
