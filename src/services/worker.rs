//! Worker loop: dequeue, compute, publish artifacts, commit, ack.
//!
//! Workers share no in-process state; everything they coordinate on goes
//! through the queue and the result store, so any number of them can run
//! across processes.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::models::artifact::{ArtifactMetadata, ArtifactStatus};
use crate::models::job::{JobError, JobStatus};
use crate::models::report::{ComputeOutput, ReportDraft};
use crate::services::compute::AnalysisCompute;
use crate::services::publisher::ArtifactPublisher;
use crate::services::queue::{Delivery, JobQueue, NackOutcome, QueueError};
use crate::services::result_store::{ResultStore, StoreError};
use crate::services::retry::{retry, RetryPolicy};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub dequeue_timeout: Duration,
    /// Wait after an infrastructure error before polling again.
    pub poll_interval: Duration,
    pub compute_timeout: Duration,
    pub commit_policy: RetryPolicy,
    /// How often the lease reaper returns abandoned deliveries.
    pub reap_interval: Duration,
    /// How often a worker extends the lease on the delivery it holds.
    /// Must be well below the queue's visibility timeout.
    pub lease_renewal: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dequeue_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            compute_timeout: Duration::from_secs(1800),
            commit_policy: RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(5)),
            reap_interval: Duration::from_secs(30),
            lease_renewal: Duration::from_secs(300),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Already terminal in the result store; acked without recomputing.
    Skipped(JobStatus),
    Retrying,
    Failed,
    DeadLettered,
}

/// One execution unit. Cheap to clone; clones share handles, not state.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ResultStore>,
    publisher: Arc<ArtifactPublisher>,
    compute: Arc<dyn AnalysisCompute>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ResultStore>,
        publisher: Arc<ArtifactPublisher>,
        compute: Arc<dyn AnalysisCompute>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            publisher,
            compute,
            config,
        }
    }

    /// Poll until `shutdown` fires. Errors are logged and the loop continues.
    /// Shutdown interrupts the wait for work, never a delivery in progress.
    pub async fn run(&self, worker_index: usize, shutdown: CancellationToken) {
        tracing::info!(worker = worker_index, "Worker started");
        while !shutdown.is_cancelled() {
            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.queue.dequeue(self.config.dequeue_timeout) => dequeued,
            };

            let next = match dequeued {
                Ok(Some(delivery)) => self.handle(delivery).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(WorkerError::from(e)),
            };

            match next {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker = worker_index, ?outcome, "Delivery handled");
                }
                Ok(None) => {
                    tracing::trace!(worker = worker_index, "No jobs available");
                }
                Err(e) => {
                    tracing::error!(worker = worker_index, error = %e, "Error processing job, will retry");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        tracing::info!(worker = worker_index, "Worker stopped");
    }

    /// Dequeue and handle one delivery. `Ok(None)` when the queue was empty
    /// for the whole dequeue timeout.
    pub async fn process_next(&self) -> Result<Option<Outcome>, WorkerError> {
        match self.queue.dequeue(self.config.dequeue_timeout).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one delivery end to end.
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome, WorkerError> {
        let job_id = delivery.descriptor.job_id;
        let max_attempts = self.queue.max_attempts();

        tracing::info!(
            job_id = %job_id,
            attempt = delivery.attempt,
            input_ref = %delivery.descriptor.input_ref,
            "Processing analysis job"
        );

        match self.store.get_job(job_id).await? {
            None => {
                tracing::error!(job_id = %job_id, "Descriptor for unknown job, dead-lettering");
                self.queue.dead_letter(&delivery).await?;
                return Ok(Outcome::DeadLettered);
            }
            Some(job) if job.status.is_terminal() => {
                tracing::info!(job_id = %job_id, status = %job.status, "Job already finished, skipping");
                self.queue.ack(&delivery).await?;
                return Ok(Outcome::Skipped(job.status));
            }
            Some(_) => {}
        }

        // Redelivered past the limit (e.g. earlier holders crashed mid-run).
        if delivery.attempt > max_attempts {
            return self
                .exhaust(&delivery, "delivery attempts exceeded before processing")
                .await;
        }

        if let Err(e) = self.store.mark_running(job_id, delivery.attempt).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to mark job running");
        }

        let started = Instant::now();
        let processed = self
            .holding_lease(&delivery, self.compute_publish_commit(&delivery, started))
            .await;

        let (draft, artifacts) = match processed {
            Ok(committed) => committed,
            Err(Stage::Compute(failure)) => return self.fail_attempt(&delivery, &failure).await,
            Err(Stage::Commit(e)) => {
                // The result is lost with this attempt; redelivery recomputes.
                tracing::error!(job_id = %job_id, error = %e, "Commit failed after retries");
                return match self.queue.nack(&delivery).await? {
                    NackOutcome::Requeued { .. } => Err(WorkerError::Persistence(e)),
                    NackOutcome::DeadLettered => {
                        self.commit_exhausted(&delivery, &e.to_string()).await?;
                        Ok(Outcome::Failed)
                    }
                };
            }
        };

        self.queue.ack(&delivery).await?;

        metrics::counter!("analysis_jobs_succeeded_total").increment(1);
        metrics::histogram!("analysis_job_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job_id,
            execution_time_ms = draft.execution_time_ms,
            artifacts = artifacts.len(),
            failed_uploads = artifacts
                .iter()
                .filter(|a| a.status != ArtifactStatus::Uploaded)
                .count(),
            "Job completed successfully"
        );
        Ok(Outcome::Succeeded)
    }

    /// Compute, publish and commit. Nothing is committed unless compute
    /// succeeded; the commit is retried without recomputing.
    async fn compute_publish_commit(
        &self,
        delivery: &Delivery,
        started: Instant,
    ) -> Result<(ReportDraft, Vec<ArtifactMetadata>), Stage> {
        let job_id = delivery.descriptor.job_id;
        let output = self.run_compute(delivery).await.map_err(Stage::Compute)?;

        let artifacts = self.publisher.publish_all(job_id, output.artifacts).await;
        let draft = ReportDraft {
            payload: output.payload,
            execution_time_ms: started.elapsed().as_millis() as i64,
        };

        retry(&self.config.commit_policy, "result_commit", || {
            self.store.commit(job_id, &draft, &artifacts)
        })
        .await
        .map_err(Stage::Commit)?;

        Ok((draft, artifacts))
    }

    /// Drive `work` while periodically extending the delivery's lease, so a
    /// long compute is not mistaken for a crashed worker.
    async fn holding_lease<F: Future>(&self, delivery: &Delivery, work: F) -> F::Output {
        tokio::pin!(work);
        let period = self.config.lease_renewal.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => match self.queue.extend_lease(delivery).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        job_id = %delivery.descriptor.job_id,
                        attempt = delivery.attempt,
                        "Lease lost; the job may be redelivered while still running"
                    ),
                    Err(e) => tracing::warn!(
                        job_id = %delivery.descriptor.job_id,
                        error = %e,
                        "Failed to extend lease"
                    ),
                },
            }
        }
    }

    /// Run compute on its own task so a panic is contained, bounded by the
    /// configured timeout.
    async fn run_compute(&self, delivery: &Delivery) -> Result<ComputeOutput, EngineError> {
        let compute = Arc::clone(&self.compute);
        let descriptor = delivery.descriptor.clone();
        let mut task = tokio::spawn(async move { compute.run(&descriptor).await });

        match tokio::time::timeout(self.config.compute_timeout, &mut task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(EngineError::ComputeFailure(e.to_string())),
            Ok(Err(join_error)) => Err(EngineError::ComputeFailure(format!(
                "compute task aborted: {join_error}"
            ))),
            Err(_) => {
                task.abort();
                Err(EngineError::ComputeFailure(format!(
                    "compute timed out after {}s",
                    self.config.compute_timeout.as_secs()
                )))
            }
        }
    }

    async fn fail_attempt(
        &self,
        delivery: &Delivery,
        failure: &EngineError,
    ) -> Result<Outcome, WorkerError> {
        let job_id = delivery.descriptor.job_id;
        let detail = match failure {
            EngineError::ComputeFailure(detail) => detail.clone(),
            other => other.to_string(),
        };
        let message = detail.as_str();
        metrics::counter!("analysis_job_attempts_failed_total").increment(1);
        tracing::error!(
            job_id = %job_id,
            attempt = delivery.attempt,
            error = message,
            kind = failure.kind(),
            "Job processing failed"
        );

        if delivery.attempt >= self.queue.max_attempts() {
            return self.exhaust(delivery, message).await;
        }

        if let Err(e) = self.store.release(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to reset job to pending");
        }

        match self.queue.nack(delivery).await? {
            NackOutcome::Requeued { delay } => {
                tracing::info!(
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job re-queued for retry"
                );
                Ok(Outcome::Retrying)
            }
            // The queue enforces its own limit as well.
            NackOutcome::DeadLettered => {
                self.commit_exhausted(delivery, message).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    /// Record the terminal failure, then stop redelivery.
    async fn exhaust(&self, delivery: &Delivery, message: &str) -> Result<Outcome, WorkerError> {
        self.commit_exhausted(delivery, message).await?;
        self.queue.dead_letter(delivery).await?;
        Ok(Outcome::Failed)
    }

    async fn commit_exhausted(&self, delivery: &Delivery, message: &str) -> Result<(), WorkerError> {
        let job_id = delivery.descriptor.job_id;
        let error = JobError::max_retries_exceeded(delivery.attempt, message);
        let changed = retry(&self.config.commit_policy, "failure_commit", || {
            self.store.commit_failure(job_id, &error)
        })
        .await?;

        if changed {
            metrics::counter!("analysis_jobs_failed_total").increment(1);
        }
        tracing::warn!(
            job_id = %job_id,
            attempts = delivery.attempt,
            recorded = changed,
            "Job failed after max retries"
        );
        Ok(())
    }
}

/// Where a processing attempt stopped.
enum Stage {
    Compute(EngineError),
    Commit(StoreError),
}

/// A fixed set of workers plus the lease reaper.
pub struct WorkerPool {
    worker: Worker,
}

impl WorkerPool {
    pub fn new(worker: Worker) -> Self {
        Self { worker }
    }

    /// Run until `shutdown` fires and every loop has drained.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        let concurrency = self.worker.config.concurrency.max(1);

        for index in 0..concurrency {
            let worker = self.worker.clone();
            let token = shutdown.clone();
            tasks.spawn(async move { worker.run(index, token).await });
        }

        let queue = Arc::clone(&self.worker.queue);
        let reap_interval = self.worker.config.reap_interval;
        let token = shutdown.clone();
        tasks.spawn(async move { reap_expired_leases(queue, reap_interval, token).await });

        tracing::info!(concurrency, "Worker pool running");

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn reap_expired_leases(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.requeue_expired().await {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "Requeued deliveries with expired leases"),
            Err(e) => tracing::error!(error = %e, "Lease reaper failed"),
        }
        match queue.depth().await {
            Ok(depth) => metrics::gauge!("analysis_queue_depth").set(depth as f64),
            Err(e) => tracing::debug!(error = %e, "Queue depth unavailable"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Result store error: {0}")]
    Persistence(#[from] StoreError),
}
