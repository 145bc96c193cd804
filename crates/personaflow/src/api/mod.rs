use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::api::models::{
    BatchEvent, CancelResponse, CreateJobRequest, JobView, ListJobsQuery, ListJobsResponse,
};
use crate::error::{PipelineError, StoreError};
use crate::jobs::{JobFilter, JobStatus, NewJob, Stage};
use crate::pipeline::Orchestrator;

pub mod models;

/// Units requested when a create call does not say.
pub const DEFAULT_EXPECTED_UNITS: i32 = 2000;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Provider push entry point
        .route("/webhooks/batch", post(batch_webhook))
        // Jobs
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
        .into_response()
}

fn pipeline_err(e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::UnknownExternalRef(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
        PipelineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        PipelineError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed");
    }
    error_response(status, e.to_string())
}

pub async fn batch_webhook(
    State(state): State<ApiState>,
    Json(ev): Json<BatchEvent>,
) -> Response {
    tracing::debug!(external_ref = %ev.external_ref, status = ev.status.as_str(), "batch webhook");
    match state
        .orchestrator
        .on_external_event(&ev.external_ref, ev.status)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => pipeline_err(e),
    }
}

pub async fn create_job(
    State(state): State<ApiState>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    let job_id = body
        .job_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("dg-{}", Uuid::new_v4()));
    let units = body.expected_units.unwrap_or(DEFAULT_EXPECTED_UNITS);

    match state
        .orchestrator
        .create_job(NewJob::data_generation(job_id, body.subject_id, units))
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => pipeline_err(e),
    }
}

fn parse_filter(q: ListJobsQuery) -> Result<JobFilter, String> {
    let stage = match q.stage.as_deref() {
        Some(s) => Some(Stage::parse(s).ok_or_else(|| format!("unknown stage {s}"))?),
        None => None,
    };

    let statuses = match q.status.as_deref() {
        None => Vec::new(),
        Some(s) => {
            let stages = match stage {
                Some(st) => vec![st],
                None => vec![Stage::DataGeneration, Stage::FineTuning],
            };
            let found: Vec<JobStatus> = stages
                .into_iter()
                .filter_map(|st| JobStatus::parse(st, s))
                .collect();
            if found.is_empty() {
                return Err(format!("unknown status {s}"));
            }
            found
        }
    };

    Ok(JobFilter {
        stage,
        statuses,
        subject_id: q.subject_id,
        limit: Some(q.limit.unwrap_or(100).clamp(1, 500)),
        ..Default::default()
    })
}

pub async fn list_jobs(State(state): State<ApiState>, Query(q): Query<ListJobsQuery>) -> Response {
    let filter = match parse_filter(q) {
        Ok(f) => f,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    match state.orchestrator.store().list(&filter).await {
        Ok(items) => Json(ListJobsResponse { items }).into_response(),
        Err(e) => pipeline_err(e.into()),
    }
}

pub async fn get_job(Path(id): Path<String>, State(state): State<ApiState>) -> Response {
    match state.orchestrator.store().get(&id).await {
        Ok(Some(job)) => {
            let watched = state.orchestrator.is_watched(&job.job_id);
            Json(JobView { job, watched }).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => pipeline_err(e.into()),
    }
}

pub async fn cancel_job(Path(id): Path<String>, State(state): State<ApiState>) -> Response {
    let cancelled = state.orchestrator.cancel(&id);
    Json(CancelResponse {
        job_id: id,
        cancelled,
    })
    .into_response()
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
