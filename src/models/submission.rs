use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, JobError, JobStatus};

/// Request to submit a dataset for analysis.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 1024))]
    pub input_ref: String,

    #[garde(skip)]
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Response for querying job status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<JobError>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            attempt_count: job.attempt_count,
            // Error detail is only meaningful on failed jobs.
            error: match job.status {
                JobStatus::Failed => job.error.clone(),
                _ => None,
            },
        }
    }
}
