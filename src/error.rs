//! Error taxonomy surfaced by the job coordinator and worker pool.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::services::queue::QueueError;
use crate::services::result_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Submission rejected before anything was written or enqueued.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Enqueue could not be durably confirmed; the caller should resubmit.
    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(#[source] QueueError),

    #[error("Compute failed: {0}")]
    ComputeFailure(String),

    /// Per-artifact and non-fatal; recorded on the artifact row only.
    #[error("Artifact upload failed: {0}")]
    UploadFailure(String),

    #[error("Result store write failed: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {job_id} has no report yet (status {status})")]
    NotReady { job_id: Uuid, status: JobStatus },
}

impl EngineError {
    /// Stable machine-readable name used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::QueueUnavailable(_) => "queue_unavailable",
            EngineError::ComputeFailure(_) => "compute_failure",
            EngineError::UploadFailure(_) => "upload_failure",
            EngineError::PersistenceFailure(_) => "persistence_failure",
            EngineError::NotFound(_) => "not_found",
            EngineError::NotReady { .. } => "not_ready",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NotReady { .. } => StatusCode::CONFLICT,
            EngineError::ComputeFailure(_)
            | EngineError::UploadFailure(_)
            | EngineError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
