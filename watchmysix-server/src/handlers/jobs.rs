use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use watchmysix_core::{CancelOutcome, JobId, JobRequest, JobSnapshot, JobStatus, JobSummary, ReconError};

use super::parse_job_id;
use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub id: JobId,
    /// Same value as `id`, for clients that read `job_id`.
    pub job_id: JobId,
    pub status: JobStatus,
    pub target: String,
    pub requested_tools: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub id: JobId,
    pub status: JobStatus,
    pub cancel_requested: bool,
    /// The job had already finished; nothing was cancelled.
    pub already_terminal: bool,
}

pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SubmitJobResponse>)> {
    let Json(request) = payload.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;

    let id = state.engine.submit(request)?;
    let job = state.engine.get(id)?;
    info!(job_id = %id, target = %job.target, "job submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            id,
            job_id: id,
            status: job.status,
            target: job.target,
            requested_tools: job.requested_tools,
            created_at: job.created_at,
        }),
    ))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: state.engine.list(),
    })
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<JobSnapshot>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.engine.get(id)?))
}

/// Idempotent: cancelling a finished job reports its final status.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<CancelJobResponse>> {
    let id = parse_job_id(&id)?;
    let already_terminal = match state.engine.cancel(id) {
        Ok(CancelOutcome::Cancelled | CancelOutcome::Cancelling) => false,
        Err(ReconError::AlreadyTerminal { .. }) => true,
        Err(err) => return Err(err.into()),
    };

    let job = state.engine.get(id)?;
    Ok(Json(CancelJobResponse {
        id,
        status: job.status,
        cancel_requested: job.cancel_requested,
        already_terminal,
    }))
}
