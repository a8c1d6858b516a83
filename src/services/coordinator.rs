//! Request-path entry point: submission and read-only lookups.
//!
//! Submission is the only mutation made from the request path. Status and
//! report reads go to the result store and never touch the queue, so they
//! always reflect the last committed state.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::EngineError;
use crate::models::artifact::ArtifactStatus;
use crate::models::job::{Job, JobDescriptor, JobError, JobStatus, QUEUE_UNAVAILABLE};
use crate::models::report::Report;
use crate::models::submission::JobStatusResponse;
use crate::services::queue::JobQueue;
use crate::services::result_store::ResultStore;
use crate::services::retry::{retry, RetryPolicy};
use crate::services::storage::BlobStore;

const MAX_INPUT_REF_LEN: usize = 1024;

pub struct JobCoordinator {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ResultStore>,
    blobs: Arc<dyn BlobStore>,
    enqueue_policy: RetryPolicy,
    access_url_ttl: Duration,
}

impl JobCoordinator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ResultStore>,
        blobs: Arc<dyn BlobStore>,
        enqueue_policy: RetryPolicy,
        access_url_ttl: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            blobs,
            enqueue_policy,
            access_url_ttl,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Create a `PENDING` job and enqueue it. Returns as soon as the queue
    /// confirms; never waits on compute.
    pub async fn submit(
        &self,
        input_ref: &str,
        params: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        validate_input_ref(input_ref)?;

        let job = Job::pending(Uuid::new_v4(), input_ref, params);
        self.store.create_job(&job).await?;

        let descriptor = JobDescriptor::from(&job);
        let enqueued = retry(&self.enqueue_policy, "job_enqueue", || {
            self.queue.enqueue(&descriptor)
        })
        .await;

        if let Err(e) = enqueued {
            // No worker will ever see this job; close it out so it does not
            // sit in PENDING forever.
            let error = JobError::new(QUEUE_UNAVAILABLE, e.to_string());
            if let Err(store_err) = self.store.commit_failure(job.job_id, &error).await {
                tracing::error!(
                    job_id = %job.job_id,
                    error = %store_err,
                    "Failed to mark unqueued job as failed"
                );
            }
            return Err(EngineError::QueueUnavailable(e));
        }

        metrics::counter!("analysis_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job.job_id, input_ref, "Job submitted");
        Ok(job.job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, EngineError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusResponse, EngineError> {
        let job = self.get_job(job_id).await?;
        Ok(JobStatusResponse::from(&job))
    }

    /// Committed report with fresh access URLs for uploaded artifacts.
    pub async fn get_report(&self, job_id: Uuid) -> Result<Report, EngineError> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Succeeded {
            return Err(EngineError::NotReady {
                job_id,
                status: job.status,
            });
        }

        let mut report = self.store.get_report(job_id).await?.ok_or_else(|| {
            // Status and report are committed together; a gap means the job
            // moved between the two reads.
            tracing::warn!(job_id = %job_id, "Succeeded job has no visible report");
            EngineError::NotReady {
                job_id,
                status: job.status,
            }
        })?;

        for artifact in report
            .artifacts
            .iter_mut()
            .filter(|a| a.status == ArtifactStatus::Uploaded)
        {
            match self
                .blobs
                .presign_get(&artifact.storage_key, self.access_url_ttl)
                .await
            {
                Ok(url) => artifact.access_url = Some(url),
                Err(e) => tracing::warn!(
                    job_id = %job_id,
                    artifact_id = %artifact.artifact_id,
                    error = %e,
                    "Failed to presign artifact URL"
                ),
            }
        }

        Ok(report)
    }
}

/// Reject empty, oversized or whitespace-bearing input references.
pub fn validate_input_ref(input_ref: &str) -> Result<(), EngineError> {
    if input_ref.trim().is_empty() {
        return Err(EngineError::Validation("input_ref must not be empty".to_string()));
    }
    if input_ref.len() > MAX_INPUT_REF_LEN {
        return Err(EngineError::Validation(format!(
            "input_ref exceeds {MAX_INPUT_REF_LEN} bytes"
        )));
    }
    if input_ref.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EngineError::Validation(
            "input_ref must not contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}
