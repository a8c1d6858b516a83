//! Durable job status, reports and artifact rows.
//!
//! `commit` is atomic and idempotent: replaying it for the same job replaces
//! the report and the complete artifact set in one step, so concurrent or
//! duplicate commits end in exactly one writer's state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::artifact::ArtifactMetadata;
use crate::models::job::{Job, JobError, JobStatus};
use crate::models::report::{Report, ReportDraft};

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a new `PENDING` job row.
    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Advisory `PENDING|RUNNING -> RUNNING`; returns false for terminal or
    /// unknown jobs.
    async fn mark_running(&self, job_id: Uuid, attempt: u32) -> Result<bool, StoreError>;

    /// Advisory `RUNNING -> PENDING` after a failed attempt that will be retried.
    async fn release(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Atomically store the report and artifact set and mark the job `SUCCEEDED`.
    async fn commit(
        &self,
        job_id: Uuid,
        report: &ReportDraft,
        artifacts: &[ArtifactMetadata],
    ) -> Result<(), StoreError>;

    /// Mark the job `FAILED`. Never overrides a `SUCCEEDED` job; returns
    /// whether the row changed.
    async fn commit_failure(&self, job_id: Uuid, error: &JobError) -> Result<bool, StoreError>;

    /// Committed report with artifacts in their original order.
    async fn get_report(&self, job_id: Uuid) -> Result<Option<Report>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Postgres-backed result store.
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        queries::insert_job(&self.pool, job).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn mark_running(&self, job_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        Ok(queries::mark_job_running(&self.pool, job_id, attempt as i32).await?)
    }

    async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        queries::release_job(&self.pool, job_id).await?;
        Ok(())
    }

    async fn commit(
        &self,
        job_id: Uuid,
        report: &ReportDraft,
        artifacts: &[ArtifactMetadata],
    ) -> Result<(), StoreError> {
        validate_artifacts(job_id, artifacts)?;
        match queries::commit_report(&self.pool, job_id, report, artifacts).await {
            Err(sqlx::Error::RowNotFound) => Err(StoreError::UnknownJob(job_id)),
            other => Ok(other?),
        }
    }

    async fn commit_failure(&self, job_id: Uuid, error: &JobError) -> Result<bool, StoreError> {
        Ok(queries::commit_failure(&self.pool, job_id, error).await?)
    }

    async fn get_report(&self, job_id: Uuid) -> Result<Option<Report>, StoreError> {
        Ok(queries::get_report(&self.pool, job_id).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Artifacts must belong to the committing job and never repeat an id.
fn validate_artifacts(job_id: Uuid, artifacts: &[ArtifactMetadata]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::new();
    for artifact in artifacts {
        if artifact.job_id != job_id {
            return Err(StoreError::Invalid(format!(
                "artifact {} belongs to job {}, not {job_id}",
                artifact.artifact_id, artifact.job_id
            )));
        }
        if !seen.insert(artifact.artifact_id) {
            return Err(StoreError::Invalid(format!(
                "artifact {} appears twice",
                artifact.artifact_id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    reports: HashMap<Uuid, Report>,
}

/// In-process result store for tests and local development.
///
/// A single lock covers jobs and reports, which is what makes `commit`
/// atomic here.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    state: RwLock<MemoryState>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.job_id) {
            return Err(StoreError::Invalid(format!("job {} already exists", job.job_id)));
        }
        state.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.read().await.jobs.get(&job_id).cloned())
    }

    async fn mark_running(&self, job_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Running;
                job.attempt_count = job.attempt_count.max(attempt as i32);
                job.started_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        job_id: Uuid,
        report: &ReportDraft,
        artifacts: &[ArtifactMetadata],
    ) -> Result<(), StoreError> {
        validate_artifacts(job_id, artifacts)?;

        let mut state = self.state.write().await;
        let now = Utc::now();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::UnknownJob(job_id))?;
        job.status = JobStatus::Succeeded;
        job.finished_at = Some(now);
        job.error = None;

        let created_at = state
            .reports
            .get(&job_id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let artifacts = artifacts
            .iter()
            .cloned()
            .map(|mut a| {
                a.access_url = None;
                a
            })
            .collect();
        state.reports.insert(
            job_id,
            Report {
                job_id,
                payload: report.payload.clone(),
                artifacts,
                execution_time_ms: report.execution_time_ms,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn commit_failure(&self, job_id: Uuid, error: &JobError) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::UnknownJob(job_id))?;
        if job.status == JobStatus::Succeeded {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.clone());
        job.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_report(&self, job_id: Uuid) -> Result<Option<Report>, StoreError> {
        let state = self.state.read().await;
        // Reports are only visible once the job row says so.
        match state.jobs.get(&job_id) {
            Some(job) if job.status == JobStatus::Succeeded => {
                Ok(state.reports.get(&job_id).cloned())
            }
            _ => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown job: {0}")]
    UnknownJob(Uuid),

    #[error("Invalid commit: {0}")]
    Invalid(String),
}
