// Graduation HTTP routes
// Decision: A duplicate idempotency key answers 200 with the existing workflow, a new one 202
// Decision: Orchestrator errors map to status codes in one place (error_response)

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use graduation_core::Workflow;
use graduation_durable::{Orchestrator, OrchestratorError};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{ErrorResponse, ListResponse};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Request to start graduating a subject
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateGraduationRequest {
    /// The subject to graduate.
    pub subject_id: Uuid,
    /// Who asked for the graduation.
    pub requester_id: Uuid,
    /// Caller-chosen key. Repeating it returns the original workflow.
    /// A missing key is rejected with 400 like a blank one.
    #[serde(default)]
    #[schema(example = "graduate-atlas-2025-06-01")]
    pub idempotency_key: String,
}

/// Filters for listing graduations. One of them is required.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListGraduationsQuery {
    /// Every workflow of this subject, newest first.
    pub subject_id: Option<Uuid>,
    /// The workflow created for this idempotency key.
    pub idempotency_key: Option<String>,
}

/// App state for graduation routes
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Create graduation routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/graduations",
            post(create_graduation).get(list_graduations),
        )
        .route("/v1/graduations/:graduation_id", get(get_graduation))
        .route(
            "/v1/graduations/:graduation_id/retry",
            post(retry_graduation),
        )
        .with_state(state)
}

fn error_response(err: OrchestratorError) -> ApiError {
    let status = match &err {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::SubjectNotFound(_)
        | OrchestratorError::WorkflowNotFound(_)
        | OrchestratorError::KeyNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyProvisioned(_) | OrchestratorError::NotRetryable { .. } => {
            StatusCode::CONFLICT
        }
        OrchestratorError::Store(e) => {
            tracing::error!("Graduation store error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    ErrorResponse::new(err.to_string()).into_response(status)
}

/// POST /v1/graduations - Start (or look up) a graduation
#[utoipa::path(
    post,
    path = "/v1/graduations",
    request_body = CreateGraduationRequest,
    responses(
        (status = 202, description = "Workflow created and submitted", body = Workflow),
        (status = 200, description = "Workflow already exists for the idempotency key", body = Workflow),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 404, description = "Subject not found", body = ErrorResponse),
        (status = 409, description = "Subject already provisioned", body = ErrorResponse),
        (status = 422, description = "Body is not a valid graduation request (plain text)"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "graduations"
)]
pub async fn create_graduation(
    State(state): State<AppState>,
    Json(req): Json<CreateGraduationRequest>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    let initiation = state
        .orchestrator
        .initiate(req.subject_id, req.requester_id, &req.idempotency_key)
        .await
        .map_err(error_response)?;

    let status = if initiation.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(initiation.workflow)))
}

/// GET /v1/graduations - List graduations of a subject or by idempotency key
#[utoipa::path(
    get,
    path = "/v1/graduations",
    params(ListGraduationsQuery),
    responses(
        (status = 200, description = "Matching workflows", body = ListResponse<Workflow>),
        (status = 400, description = "No filter given", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "graduations"
)]
pub async fn list_graduations(
    State(state): State<AppState>,
    Query(query): Query<ListGraduationsQuery>,
) -> Result<Json<ListResponse<Workflow>>, ApiError> {
    let workflows = match (query.subject_id, query.idempotency_key) {
        (Some(subject_id), _) => state
            .orchestrator
            .list_for_subject(subject_id)
            .await
            .map_err(error_response)?,
        (None, Some(key)) => match state.orchestrator.get_by_key(&key).await {
            Ok(workflow) => vec![workflow],
            Err(OrchestratorError::KeyNotFound(_)) => Vec::new(),
            Err(e) => return Err(error_response(e)),
        },
        (None, None) => {
            return Err(ErrorResponse::new("subject_id or idempotency_key is required")
                .into_response(StatusCode::BAD_REQUEST))
        }
    };

    Ok(Json(ListResponse::new(workflows)))
}

/// GET /v1/graduations/{graduation_id} - Current state of a graduation
#[utoipa::path(
    get,
    path = "/v1/graduations/{graduation_id}",
    params(
        ("graduation_id" = Uuid, Path, description = "Workflow ID")
    ),
    responses(
        (status = 200, description = "Workflow found", body = Workflow),
        (status = 404, description = "Workflow not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "graduations"
)]
pub async fn get_graduation(
    State(state): State<AppState>,
    Path(graduation_id): Path<Uuid>,
) -> Result<Json<Workflow>, ApiError> {
    let workflow = state
        .orchestrator
        .get_status(graduation_id)
        .await
        .map_err(error_response)?;

    Ok(Json(workflow))
}

/// POST /v1/graduations/{graduation_id}/retry - Resume a failed graduation
#[utoipa::path(
    post,
    path = "/v1/graduations/{graduation_id}/retry",
    params(
        ("graduation_id" = Uuid, Path, description = "Workflow ID")
    ),
    responses(
        (status = 202, description = "Workflow reopened and submitted", body = Workflow),
        (status = 404, description = "Workflow not found", body = ErrorResponse),
        (status = 409, description = "Workflow is not retryable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "graduations"
)]
pub async fn retry_graduation(
    State(state): State<AppState>,
    Path(graduation_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    let workflow = state
        .orchestrator
        .retry(graduation_id)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::ACCEPTED, Json(workflow)))
}
