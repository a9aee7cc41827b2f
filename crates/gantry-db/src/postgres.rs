//! PostgreSQL store implementations (sqlx).
//!
//! Payloads, progress maps, selectors, and counters live in JSONB columns;
//! the `kind` and `state` columns are duplicated as text for indexing. The
//! optimistic update guards on `version` in the WHERE clause: zero affected
//! rows means either a conflict or a missing record, disambiguated with a
//! follow-up existence check.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{
    Operation, OperationFilter, OperationKind, Orchestration, OrchestrationFilter,
};
use crate::store::{ChildPage, OperationStore, OrchestrationStore, StoreError, StoreResult};

/// Render filter enums as the text values bound into `ANY($n)` clauses.
fn filter_strings(filter: &OperationFilter) -> (Vec<String>, Vec<String>) {
    let kinds = filter.kinds.iter().map(ToString::to_string).collect();
    let states = filter.states.iter().map(ToString::to_string).collect();
    (kinds, states)
}

/// PostgreSQL-backed [`OperationStore`].
#[derive(Clone)]
pub struct PgOperationStore {
    pool: PgPool,
}

impl PgOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct OperationRow {
    id: Uuid,
    instance_id: String,
    orchestration_id: Option<Uuid>,
    state: crate::models::OperationState,
    description: String,
    progress: serde_json::Value,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    version: i32,
}

impl OperationRow {
    fn into_operation(self) -> StoreResult<Operation> {
        let progress = serde_json::from_value(self.progress)
            .context("failed to decode operation progress")?;
        let payload = serde_json::from_value(self.payload)
            .context("failed to decode operation payload")?;
        Ok(Operation {
            id: self.id,
            instance_id: self.instance_id,
            orchestration_id: self.orchestration_id,
            state: self.state,
            description: self.description,
            progress,
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            version: self.version,
        })
    }
}

const OPERATION_COLUMNS: &str = "id, instance_id, orchestration_id, state, description, \
     progress, payload, created_at, updated_at, finished_at, version";

#[async_trait]
impl OperationStore for PgOperationStore {
    async fn insert(&self, op: Operation) -> StoreResult<()> {
        let progress =
            serde_json::to_value(&op.progress).context("failed to encode operation progress")?;
        let payload =
            serde_json::to_value(&op.payload).context("failed to encode operation payload")?;

        let result = sqlx::query(
            "INSERT INTO operations \
             (id, instance_id, orchestration_id, kind, state, description, progress, payload, \
              created_at, updated_at, finished_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(op.id)
        .bind(&op.instance_id)
        .bind(op.orchestration_id)
        .bind(op.kind())
        .bind(op.state)
        .bind(&op.description)
        .bind(progress)
        .bind(payload)
        .bind(op.created_at)
        .bind(op.updated_at)
        .bind(op.finished_at)
        .bind(op.version)
        .execute(&self.pool)
        .await
        .context("failed to insert operation")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(op.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Operation> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch operation")?;

        row.ok_or(StoreError::NotFound(id))?.into_operation()
    }

    async fn update(&self, mut op: Operation) -> StoreResult<Operation> {
        let progress =
            serde_json::to_value(&op.progress).context("failed to encode operation progress")?;
        let payload =
            serde_json::to_value(&op.payload).context("failed to encode operation payload")?;

        let result = sqlx::query(
            "UPDATE operations \
             SET state = $1, description = $2, progress = $3, payload = $4, \
                 updated_at = $5, finished_at = $6, version = version + 1 \
             WHERE id = $7 AND version = $8",
        )
        .bind(op.state)
        .bind(&op.description)
        .bind(progress)
        .bind(payload)
        .bind(op.updated_at)
        .bind(op.finished_at)
        .bind(op.id)
        .bind(op.version)
        .execute(&self.pool)
        .await
        .context("failed to update operation")?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM operations WHERE id = $1)")
                    .bind(op.id)
                    .fetch_one(&self.pool)
                    .await
                    .context("failed to check operation existence")?;
            return Err(if exists {
                StoreError::Conflict(op.id)
            } else {
                StoreError::NotFound(op.id)
            });
        }

        op.version += 1;
        Ok(op)
    }

    async fn list_not_finished_by_kind(
        &self,
        kind: OperationKind,
    ) -> StoreResult<Vec<Operation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE kind = $1 AND state IN ('pending', 'in_progress') \
             ORDER BY created_at ASC"
        ))
        .bind(kind)
        .fetch_all(&self.pool)
        .await
        .context("failed to list unfinished operations")?;

        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    async fn list_by_orchestration(
        &self,
        orchestration_id: Uuid,
        filter: OperationFilter,
    ) -> StoreResult<ChildPage> {
        let (kinds, states) = filter_strings(&filter);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM operations \
             WHERE orchestration_id = $1 \
               AND (cardinality($2::text[]) = 0 OR kind = ANY($2)) \
               AND (cardinality($3::text[]) = 0 OR state = ANY($3)) \
               AND ($4::timestamptz IS NULL OR created_at >= $4) \
               AND ($5::timestamptz IS NULL OR created_at <= $5)",
        )
        .bind(orchestration_id)
        .bind(&kinds)
        .bind(&states)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .fetch_one(&self.pool)
        .await
        .context("failed to count orchestration children")?;

        let in_progress: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM operations \
             WHERE orchestration_id = $1 AND state = 'in_progress'",
        )
        .bind(orchestration_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count in-progress children")?;

        let limit = filter.page_size.map(i64::from);
        let offset = match (filter.page, filter.page_size) {
            (Some(page), Some(size)) => i64::from(page.saturating_sub(1)) * i64::from(size),
            _ => 0,
        };

        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE orchestration_id = $1 \
               AND (cardinality($2::text[]) = 0 OR kind = ANY($2)) \
               AND (cardinality($3::text[]) = 0 OR state = ANY($3)) \
               AND ($4::timestamptz IS NULL OR created_at >= $4) \
               AND ($5::timestamptz IS NULL OR created_at <= $5) \
             ORDER BY created_at ASC \
             LIMIT $6 OFFSET $7"
        ))
        .bind(orchestration_id)
        .bind(&kinds)
        .bind(&states)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to list orchestration children")?;

        let operations: StoreResult<Vec<Operation>> =
            rows.into_iter().map(OperationRow::into_operation).collect();

        Ok(ChildPage {
            operations: operations?,
            in_progress: u32::try_from(in_progress).unwrap_or(u32::MAX),
            total: u32::try_from(total).unwrap_or(u32::MAX),
        })
    }

    async fn last_by_instance(&self, instance_id: &str) -> StoreResult<Option<Operation>> {
        let row: Option<OperationRow> = sqlx::query_as(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE instance_id = $1 \
             ORDER BY created_at DESC \
             LIMIT 1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch last operation for instance")?;

        row.map(OperationRow::into_operation).transpose()
    }
}

/// PostgreSQL-backed [`OrchestrationStore`].
#[derive(Clone)]
pub struct PgOrchestrationStore {
    pool: PgPool,
}

impl PgOrchestrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct OrchestrationRow {
    id: Uuid,
    kind: crate::models::OrchestrationKind,
    state: crate::models::OrchestrationState,
    description: String,
    parameters: serde_json::Value,
    counters: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i32,
}

impl OrchestrationRow {
    fn into_orchestration(self) -> StoreResult<Orchestration> {
        let parameters = serde_json::from_value(self.parameters)
            .context("failed to decode orchestration parameters")?;
        let counters = serde_json::from_value(self.counters)
            .context("failed to decode orchestration counters")?;
        Ok(Orchestration {
            id: self.id,
            kind: self.kind,
            state: self.state,
            description: self.description,
            parameters,
            counters,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        })
    }
}

const ORCHESTRATION_COLUMNS: &str =
    "id, kind, state, description, parameters, counters, created_at, updated_at, version";

#[async_trait]
impl OrchestrationStore for PgOrchestrationStore {
    async fn insert(&self, orchestration: Orchestration) -> StoreResult<()> {
        let parameters = serde_json::to_value(&orchestration.parameters)
            .context("failed to encode orchestration parameters")?;
        let counters = serde_json::to_value(orchestration.counters)
            .context("failed to encode orchestration counters")?;

        let result = sqlx::query(
            "INSERT INTO orchestrations \
             (id, kind, state, description, parameters, counters, created_at, updated_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(orchestration.id)
        .bind(orchestration.kind)
        .bind(orchestration.state)
        .bind(&orchestration.description)
        .bind(parameters)
        .bind(counters)
        .bind(orchestration.created_at)
        .bind(orchestration.updated_at)
        .bind(orchestration.version)
        .execute(&self.pool)
        .await
        .context("failed to insert orchestration")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(orchestration.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Orchestration> {
        let row: Option<OrchestrationRow> = sqlx::query_as(&format!(
            "SELECT {ORCHESTRATION_COLUMNS} FROM orchestrations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch orchestration")?;

        row.ok_or(StoreError::NotFound(id))?.into_orchestration()
    }

    async fn update(&self, mut orchestration: Orchestration) -> StoreResult<Orchestration> {
        let parameters = serde_json::to_value(&orchestration.parameters)
            .context("failed to encode orchestration parameters")?;
        let counters = serde_json::to_value(orchestration.counters)
            .context("failed to encode orchestration counters")?;

        let result = sqlx::query(
            "UPDATE orchestrations \
             SET state = $1, description = $2, parameters = $3, counters = $4, \
                 updated_at = $5, version = version + 1 \
             WHERE id = $6 AND version = $7",
        )
        .bind(orchestration.state)
        .bind(&orchestration.description)
        .bind(parameters)
        .bind(counters)
        .bind(orchestration.updated_at)
        .bind(orchestration.id)
        .bind(orchestration.version)
        .execute(&self.pool)
        .await
        .context("failed to update orchestration")?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM orchestrations WHERE id = $1)")
                    .bind(orchestration.id)
                    .fetch_one(&self.pool)
                    .await
                    .context("failed to check orchestration existence")?;
            return Err(if exists {
                StoreError::Conflict(orchestration.id)
            } else {
                StoreError::NotFound(orchestration.id)
            });
        }

        orchestration.version += 1;
        Ok(orchestration)
    }

    async fn list(&self, filter: OrchestrationFilter) -> StoreResult<Vec<Orchestration>> {
        let kinds: Vec<String> = filter.kinds.iter().map(ToString::to_string).collect();
        let states: Vec<String> = filter.states.iter().map(ToString::to_string).collect();

        let limit = filter.page_size.map(i64::from);
        let offset = match (filter.page, filter.page_size) {
            (Some(page), Some(size)) => i64::from(page.saturating_sub(1)) * i64::from(size),
            _ => 0,
        };

        let rows: Vec<OrchestrationRow> = sqlx::query_as(&format!(
            "SELECT {ORCHESTRATION_COLUMNS} FROM orchestrations \
             WHERE (cardinality($1::text[]) = 0 OR kind = ANY($1)) \
               AND (cardinality($2::text[]) = 0 OR state = ANY($2)) \
               AND ($3::timestamptz IS NULL OR created_at >= $3) \
               AND ($4::timestamptz IS NULL OR created_at <= $4) \
             ORDER BY created_at ASC \
             LIMIT $5 OFFSET $6"
        ))
        .bind(&kinds)
        .bind(&states)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to list orchestrations")?;

        rows.into_iter()
            .map(OrchestrationRow::into_orchestration)
            .collect()
    }
}
