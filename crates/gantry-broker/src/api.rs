//! The broker's HTTP surface.
//!
//! Two routers: the catalog API (OSB-style instance endpoints plus the
//! orchestration surface) and the status router (`/healthz`, `/metrics`).
//! The boundary only writes pending records and enqueues their IDs; the
//! engine never runs inside a request handler.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use gantry_core::queue::QueueHandle;
use gantry_db::models::{
    DeprovisionPayload, Operation, OperationKind, OperationPayload, OperationState,
    Orchestration, OrchestrationKind, OrchestrationParameters, OrchestrationState,
    ProvisionPayload, ScheduleWindow, TargetSelector, UpdatePayload,
};
use gantry_db::store::{OperationStore, OrchestrationStore, StoreError};

use crate::metrics::Metrics;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GONE,
            message: msg.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err}"),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found(format!("record {id} not found")),
            StoreError::AlreadyExists(id) => {
                Self::conflict(format!("record {id} already exists"))
            }
            StoreError::Conflict(id) => {
                Self::conflict(format!("record {id} is being modified concurrently"))
            }
            StoreError::Backend(e) => Self::internal(format!("{e:#}")),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState {
    pub operations: Arc<dyn OperationStore>,
    pub orchestrations: Arc<dyn OrchestrationStore>,
    /// One queue handle per operation kind.
    pub operation_queues: HashMap<OperationKind, QueueHandle>,
    pub orchestration_queue: QueueHandle,
    pub development_mode: bool,
    pub default_runtime_version: String,
}

impl AppState {
    fn enqueue(&self, kind: OperationKind, id: Uuid) {
        match self.operation_queues.get(&kind) {
            Some(queue) => {
                queue.add(id);
            }
            None => tracing::error!(kind = %kind, operation_id = %id, "no queue for kind"),
        }
    }

    /// The uniqueness guard on (instance, active operation): one in-flight
    /// lifecycle action per instance.
    async fn active_operation(&self, instance_id: &str) -> Result<Option<Operation>, AppError> {
        let last = self.operations.last_by_instance(instance_id).await?;
        Ok(last.filter(|op| !op.state.is_terminal()))
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub plan: String,
    pub region: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Pin a runtime version; the broker default applies otherwise.
    pub runtime_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OperationAccepted {
    pub operation: Uuid,
}

#[derive(Debug, Serialize)]
pub struct LastOperationResponse {
    pub state: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrchestrationRequest {
    pub kind: OrchestrationKind,
    #[serde(default)]
    pub targets: TargetSelector,
    pub parallelism: Option<u32>,
    pub schedule: Option<ScheduleWindow>,
    pub target_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

pub fn broker_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v2/service_instances/{id}",
            put(provision).delete(deprovision).patch(update_instance),
        )
        .route(
            "/v2/service_instances/{id}/last_operation",
            get(last_operation),
        )
        .route("/orchestrations", post(create_orchestration))
        .route("/orchestrations/{id}", get(get_orchestration))
        .route("/orchestrations/{id}/cancel", put(cancel_orchestration))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn status_router(metrics: Metrics) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

// ---------------------------------------------------------------------------
// Instance handlers
// ---------------------------------------------------------------------------

async fn provision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(request): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(active) = state.active_operation(&instance_id).await? {
        return Err(AppError::conflict(format!(
            "instance {instance_id} has an active {} operation",
            active.kind()
        )));
    }

    let mut payload = ProvisionPayload::new(request.plan);
    payload.region = request.region;
    payload.parameters = request.parameters;
    payload.runtime_version = request.runtime_version;

    let op = Operation::new(instance_id, OperationPayload::Provision(payload));
    let id = op.id;
    state.operations.insert(op).await?;
    state.enqueue(OperationKind::Provision, id);

    Ok((
        StatusCode::ACCEPTED,
        Json(OperationAccepted { operation: id }),
    ))
}

async fn deprovision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let Some(last) = state.operations.last_by_instance(&instance_id).await? else {
        return Err(AppError::gone(format!("instance {instance_id} is unknown")));
    };
    if !last.state.is_terminal() {
        return Err(AppError::conflict(format!(
            "instance {instance_id} has an active {} operation",
            last.kind()
        )));
    }

    let payload = DeprovisionPayload {
        plan: last.plan().unwrap_or("unknown").to_string(),
        runtime_id: last.runtime_id(),
    };
    let op = Operation::new(instance_id, OperationPayload::Deprovision(payload));
    let id = op.id;
    state.operations.insert(op).await?;
    state.enqueue(OperationKind::Deprovision, id);

    Ok((
        StatusCode::ACCEPTED,
        Json(OperationAccepted { operation: id }),
    ))
}

async fn update_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let Some(last) = state.operations.last_by_instance(&instance_id).await? else {
        return Err(AppError::gone(format!("instance {instance_id} is unknown")));
    };
    if !last.state.is_terminal() {
        return Err(AppError::conflict(format!(
            "instance {instance_id} has an active {} operation",
            last.kind()
        )));
    }

    let payload = UpdatePayload {
        plan: last.plan().unwrap_or("unknown").to_string(),
        parameters: request.parameters,
    };
    let op = Operation::new(instance_id, OperationPayload::Update(payload));
    let id = op.id;
    state.operations.insert(op).await?;
    state.enqueue(OperationKind::Update, id);

    Ok((
        StatusCode::ACCEPTED,
        Json(OperationAccepted { operation: id }),
    ))
}

async fn last_operation(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let Some(op) = state.operations.last_by_instance(&instance_id).await? else {
        return Err(AppError::not_found(format!(
            "no operation for instance {instance_id}"
        )));
    };

    let osb_state = match op.state {
        OperationState::Pending | OperationState::InProgress => "in progress",
        OperationState::Succeeded => "succeeded",
        OperationState::Failed | OperationState::Canceled => "failed",
    };

    // Raw failure reasons may leak backend details; hide them unless the
    // broker runs in development mode.
    let description = if op.state == OperationState::Failed && !state.development_mode {
        "operation failed".to_string()
    } else {
        op.description.clone()
    };

    Ok(Json(LastOperationResponse {
        state: osb_state.to_string(),
        description,
    }))
}

// ---------------------------------------------------------------------------
// Orchestration handlers
// ---------------------------------------------------------------------------

async fn create_orchestration(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateOrchestrationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let parameters = OrchestrationParameters {
        targets: request.targets,
        parallelism: request.parallelism.unwrap_or(1),
        schedule: request.schedule,
        target_version: request
            .target_version
            .unwrap_or_else(|| state.default_runtime_version.clone()),
    };

    let orchestration = Orchestration::new(request.kind, parameters);
    let id = orchestration.id;
    state.orchestrations.insert(orchestration).await?;
    state.orchestration_queue.add(id);

    Ok((
        StatusCode::ACCEPTED,
        Json(OperationAccepted { operation: id }),
    ))
}

async fn get_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let orchestration = state.orchestrations.get(id).await?;
    Ok(Json(orchestration))
}

async fn cancel_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let mut orchestration = state.orchestrations.get(id).await?;
    if orchestration.state.is_terminal() {
        return Err(AppError::conflict(format!(
            "orchestration {id} is already {}",
            orchestration.state
        )));
    }

    if orchestration.state != OrchestrationState::Canceling {
        orchestration.state = OrchestrationState::Canceling;
        orchestration.description = "cancelation requested".to_string();
        orchestration.updated_at = Utc::now();
        state.orchestrations.update(orchestration).await?;
    }
    state.orchestration_queue.add(id);

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id }))))
}

// ---------------------------------------------------------------------------
// Status handlers
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(metrics): State<Metrics>) -> impl IntoResponse {
    metrics.render()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
