//! Handlers for the `/jobs` resource.
//!
//! All endpoints require a [`Caller`]. The caller id is recorded on
//! submitted jobs for attribution; it never restricts what can be read.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use forge_core::job::SubmitJob;
use forge_core::types::JobId;
use forge_pipeline::JobFilter;

use crate::error::AppResult;
use crate::middleware::auth::Caller;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Submit a new job. Returns 201 with the queued job's status view. The
/// worker pool picks it up from there.
pub async fn create_job(
    caller: Caller,
    State(state): State<AppState>,
    input: Result<Json<SubmitJob>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = input?;
    let job = state.scheduler.submit(input, &caller.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: job.status_view(),
        }),
    ))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// List jobs, newest first. Supports optional `status`, `job_type`,
/// `limit`, and `offset` query parameters.
pub async fn list_jobs(
    _caller: Caller,
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.status.list(&filter).await?;
    Ok(Json(DataResponse { data: jobs }))
}

// ---------------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
///
/// Current snapshot of one job. Always at least as new as any event
/// already pushed for it.
pub async fn get_job(
    _caller: Caller,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let view = state.status.get(job_id).await?;
    Ok(Json(DataResponse { data: view }))
}
