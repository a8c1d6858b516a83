use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::models::job::JobStatus;
use crate::models::report::Report;
use crate::models::submission::{JobStatusResponse, SubmitRequest, SubmitResponse};

/// POST /api/v1/jobs: accept a job and return its id without waiting for compute.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), EngineError> {
    request
        .validate()
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let job_id = state
        .coordinator
        .submit(&request.input_ref, request.params)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, EngineError> {
    Ok(Json(state.coordinator.get_status(job_id).await?))
}

/// GET /api/v1/jobs/{job_id}/report: 409 until the job has succeeded.
pub async fn get_job_report(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Report>, EngineError> {
    Ok(Json(state.coordinator.get_report(job_id).await?))
}
