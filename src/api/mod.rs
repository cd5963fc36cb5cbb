//! REST API for the orchestrator.
//!
//! A thin axum layer over the execution engine:
//!
//! ```text
//! POST   /executions                  submit a program execution
//! GET    /executions                  list execution records
//! GET    /executions/concurrent       currently running executions
//! DELETE /executions/cleanup          prune terminal records
//! GET    /executions/{id}             one execution record
//! GET    /executions/{id}/logs        record plus duration and line counts
//! GET    /programs                    catalog listing
//! GET    /images/available            images declared by the catalog
//! GET    /containers/active           active containers on the runtime
//! GET    /containers/logs/{image}     log tails by exact image reference
//! GET    /health                      liveness probe
//! ```
//!
//! Handlers do no orchestration of their own; they translate between HTTP
//! and the engine's types and map rejection kinds to status codes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{Catalog, Program};
use crate::docker::{ActiveContainer, ContainerDriver, ContainerLogs};
use crate::error::{DriverError, SubmitError};
use crate::executor::{
    AdmissionController, Execution, ExecutionRequest, ExecutionStore, Executor,
};
use crate::report::{ContainerReporter, ImageListing, ImageReporter};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    executor: Arc<Executor>,
    catalog: Arc<Catalog>,
    store: Arc<ExecutionStore>,
    admission: Arc<AdmissionController>,
    images: Arc<ImageReporter>,
    containers: Arc<ContainerReporter>,
}

impl AppState {
    pub fn new(
        executor: Arc<Executor>,
        catalog: Arc<Catalog>,
        driver: Arc<dyn ContainerDriver>,
    ) -> Self {
        Self {
            store: Arc::clone(executor.store()),
            admission: Arc::clone(executor.admission()),
            images: Arc::new(ImageReporter::new(Arc::clone(&catalog))),
            containers: Arc::new(ContainerReporter::new(driver)),
            executor,
            catalog,
        }
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/executions", post(submit_execution).get(list_executions))
        .route("/executions/concurrent", get(concurrent_executions))
        .route("/executions/cleanup", delete(cleanup_executions))
        .route("/executions/{execution_id}", get(get_execution))
        .route("/executions/{execution_id}/logs", get(get_execution_logs))
        .route("/programs", get(list_programs))
        .route("/images/available", get(available_images))
        .route("/containers/active", get(active_containers))
        .route("/containers/logs/{image}", get(container_logs))
        .route("/health", get(health))
        .with_state(state)
}

// -- Response types --

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

#[derive(Debug, Serialize)]
pub struct ExecutionSubmitted {
    pub execution_id: Uuid,
    pub program_id: String,
    pub status: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct RunningExecution {
    execution_id: Uuid,
    program_id: String,
    start_time: DateTime<Utc>,
    duration_seconds: f64,
}

#[derive(Debug, Serialize)]
struct ConcurrentReport {
    concurrent_count: usize,
    max_concurrent: usize,
    running_executions: Vec<RunningExecution>,
}

#[derive(Debug, Serialize)]
struct CleanupReport {
    removed_executions: usize,
    remaining_executions: usize,
}

#[derive(Debug, Serialize)]
struct ExecutionDetail {
    execution_id: Uuid,
    program_id: String,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_seconds: f64,
    output: String,
    error: String,
    exit_code: Option<i64>,
    output_lines: usize,
    error_lines: usize,
}

#[derive(Debug, Serialize)]
struct ImagesResponse {
    total_images: usize,
    images: Vec<ImageListing>,
}

#[derive(Debug, Serialize)]
struct ContainersResponse {
    total_containers: usize,
    containers: Vec<ActiveContainer>,
}

#[derive(Debug, Serialize)]
struct ContainerLogsResponse {
    image: String,
    total_containers: usize,
    containers: Vec<ContainerLogs>,
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::ProgramNotFound(_) => StatusCode::NOT_FOUND,
            SubmitError::ProgramDisabled(_) => StatusCode::BAD_REQUEST,
            SubmitError::MainFileMissing { .. } | SubmitError::ComposeFileMissing { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SubmitError::ImageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SubmitError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.kind(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn driver_error_response(err: DriverError) -> Response {
    let status = match err {
        DriverError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorBody {
        error: "runtime_error",
        detail: err.to_string(),
    };
    (status, Json(body)).into_response()
}

fn not_found(execution_id: Uuid) -> Response {
    let body = ErrorBody {
        error: "not_found",
        detail: format!("execution not found: {execution_id}"),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

// -- Handlers --

async fn health() -> &'static str {
    "ok"
}

async fn submit_execution(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionSubmitted>), SubmitError> {
    let program_id = request.program_id.clone();
    let execution_id = state.executor.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecutionSubmitted {
            execution_id,
            message: format!("Program '{program_id}' queued for execution"),
            program_id,
            status: "queued",
            timestamp: Utc::now(),
        }),
    ))
}

async fn list_executions(State(state): State<AppState>) -> Json<Vec<Execution>> {
    Json(state.store.list())
}

async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Response {
    match state.store.get(execution_id) {
        Some(execution) => Json(execution).into_response(),
        None => not_found(execution_id),
    }
}

async fn get_execution_logs(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Response {
    let Some(execution) = state.store.get(execution_id) else {
        return not_found(execution_id);
    };
    Json(ExecutionDetail::from(execution)).into_response()
}

impl From<Execution> for ExecutionDetail {
    fn from(execution: Execution) -> Self {
        let end = execution.end_time.unwrap_or_else(Utc::now);
        let duration = (end - execution.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            execution_id: execution.execution_id,
            program_id: execution.program_id,
            status: execution.status.to_string(),
            start_time: execution.start_time,
            end_time: execution.end_time,
            duration_seconds: duration,
            output_lines: count_lines(&execution.output),
            error_lines: count_lines(&execution.error),
            output: execution.output,
            error: execution.error,
            exit_code: execution.exit_code,
        }
    }
}

fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.lines().count()
    }
}

async fn concurrent_executions(State(state): State<AppState>) -> Json<ConcurrentReport> {
    let now = Utc::now();
    let running: Vec<RunningExecution> = state
        .store
        .running()
        .into_iter()
        .map(|e| RunningExecution {
            execution_id: e.execution_id,
            program_id: e.program_id,
            start_time: e.start_time,
            duration_seconds: (now - e.start_time)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        })
        .collect();

    Json(ConcurrentReport {
        concurrent_count: running.len(),
        max_concurrent: state.admission.limit(),
        running_executions: running,
    })
}

async fn cleanup_executions(State(state): State<AppState>) -> Json<CleanupReport> {
    let removed = state.store.prune(|_| true);
    tracing::info!(removed, "pruned terminal execution records");
    Json(CleanupReport {
        removed_executions: removed,
        remaining_executions: state.store.len(),
    })
}

async fn list_programs(State(state): State<AppState>) -> Json<Vec<Program>> {
    Json(state.catalog.snapshot().all_programs().cloned().collect())
}

async fn available_images(State(state): State<AppState>) -> Json<ImagesResponse> {
    let images = state.images.declared_images();
    Json(ImagesResponse {
        total_images: images.len(),
        images,
    })
}

async fn active_containers(State(state): State<AppState>) -> Response {
    match state.containers.active().await {
        Ok(containers) => Json(ContainersResponse {
            total_containers: containers.len(),
            containers,
        })
        .into_response(),
        Err(e) => driver_error_response(e),
    }
}

async fn container_logs(State(state): State<AppState>, Path(image): Path<String>) -> Response {
    match state.containers.logs_for_image(&image).await {
        Ok(containers) => Json(ContainerLogsResponse {
            image,
            total_containers: containers.len(),
            containers,
        })
        .into_response(),
        Err(e) => driver_error_response(e),
    }
}
