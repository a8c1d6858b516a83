use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Error kind recorded when a job exhausts its delivery attempts.
pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";

/// Error kind recorded when a submission could not be durably enqueued.
pub const QUEUE_UNAVAILABLE: &str = "queue_unavailable";

/// Lifecycle state of an analysis job.
///
/// Serialized as `PENDING`, `RUNNING`, `SUCCEEDED`, `FAILED` on the wire and
/// stored lower-case in the `analysis_jobs.status` column.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Column value used by the Postgres store.
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Structured failure detail, present only on `FAILED` jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl JobError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn max_retries_exceeded(attempts: u32, last_error: &str) -> Self {
        Self::new(
            MAX_RETRIES_EXCEEDED,
            format!("Processing failed after {attempts} attempts: {last_error}"),
        )
    }
}

/// One unit of submitted analysis work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub input_ref: String,
    pub params: serde_json::Value,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
}

impl Job {
    /// A freshly submitted job in `PENDING`.
    pub fn pending(job_id: Uuid, input_ref: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            input_ref: input_ref.into(),
            params,
            attempt_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Message carried on the job queue from submitters to workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub input_ref: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl From<&Job> for JobDescriptor {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            input_ref: job.input_ref.clone(),
            params: job.params.clone(),
        }
    }
}
