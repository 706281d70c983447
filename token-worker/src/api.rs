//! Status and trigger endpoints for the worker.
//!
//! - `GET /health` - dependency and job health (503 when anything is unhealthy)
//! - `GET /jobs` - per-job status
//! - `POST /jobs/refresh/run` - run a refresh cycle now
//! - `POST /jobs/reconcile/run` - run a reconciliation pass now

use crate::job::{JobError, JobHealth, JobStatus};
use crate::reconcile::{HealthReport, ReconciliationJob};
use crate::refresh_job::{RefreshJob, RefreshRunSummary};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokenkeeper::service::ServiceHealth;
use tokenkeeper::CredentialService;
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<CredentialService>,
    pub refresh_job: Arc<RefreshJob>,
    pub reconcile_job: Arc<ReconciliationJob>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct AppError(JobError);

impl From<JobError> for AppError {
    fn from(e: JobError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            JobError::AlreadyRunning(_) => StatusCode::CONFLICT,
            JobError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            JobError::Store(e) => {
                error!(error = %e, "Job failed on store access");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    dependencies: ServiceHealth,
    jobs: Vec<JobHealth>,
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<JobStatus>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/refresh/run", post(run_refresh))
        .route("/jobs/reconcile/run", post(run_reconcile))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Response {
    let dependencies = state.service.health_check();
    let jobs = vec![state.refresh_job.health(), state.reconcile_job.health()];
    let healthy = dependencies.healthy && jobs.iter().all(|j| j.healthy);

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            dependencies,
            jobs,
        }),
    )
        .into_response()
}

async fn list_jobs(State(state): State<ApiState>) -> Json<JobsResponse> {
    Json(JobsResponse {
        jobs: vec![state.refresh_job.status(), state.reconcile_job.status()],
    })
}

async fn run_refresh(
    State(state): State<ApiState>,
) -> Result<Json<RefreshRunSummary>, AppError> {
    info!("Refresh run requested via API");
    let summary = state.refresh_job.run_cycle().await?;
    Ok(Json(summary))
}

async fn run_reconcile(State(state): State<ApiState>) -> Result<Json<HealthReport>, AppError> {
    info!("Reconciliation requested via API");
    let report = state.reconcile_job.run_cycle().await?;
    Ok(Json(report))
}
