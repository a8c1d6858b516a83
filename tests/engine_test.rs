//! End-to-end engine behaviour against the in-process backends: submission,
//! worker processing, redelivery, and what readers observe afterwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Barrier;
use uuid::Uuid;

use analysis_engine::error::EngineError;
use analysis_engine::models::artifact::{ArtifactMetadata, ArtifactStatus, RawArtifact};
use analysis_engine::models::job::{Job, JobDescriptor, JobError, JobStatus};
use analysis_engine::models::report::{ComputeOutput, Report, ReportDraft};
use analysis_engine::services::compute::{AnalysisCompute, ComputeError};
use analysis_engine::services::coordinator::JobCoordinator;
use analysis_engine::services::profiler::DatasetProfiler;
use analysis_engine::services::publisher::ArtifactPublisher;
use analysis_engine::services::queue::{
    Delivery, JobQueue, MemoryJobQueue, NackOutcome, QueueError, QueueSettings,
};
use analysis_engine::services::result_store::{MemoryResultStore, ResultStore, StoreError};
use analysis_engine::services::retry::RetryPolicy;
use analysis_engine::services::storage::{BlobStore, MemoryBlobStore};
use analysis_engine::services::worker::{Outcome, Worker, WorkerConfig};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Engine {
    queue: Arc<MemoryJobQueue>,
    store: Arc<MemoryResultStore>,
    blobs: Arc<MemoryBlobStore>,
    coordinator: JobCoordinator,
}

fn queue_settings(max_attempts: u32, visibility_timeout: Duration) -> QueueSettings {
    QueueSettings {
        max_attempts,
        visibility_timeout,
        redelivery: RetryPolicy::immediate(0),
    }
}

fn engine() -> Engine {
    engine_with(queue_settings(3, Duration::from_secs(60)))
}

fn engine_with(settings: QueueSettings) -> Engine {
    let queue = Arc::new(MemoryJobQueue::new(settings));
    let store = Arc::new(MemoryResultStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let coordinator = JobCoordinator::new(
        queue.clone(),
        store.clone(),
        blobs.clone(),
        RetryPolicy::immediate(1),
        Duration::from_secs(300),
    );
    Engine {
        queue,
        store,
        blobs,
        coordinator,
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 1,
        dequeue_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        compute_timeout: Duration::from_secs(5),
        commit_policy: RetryPolicy::immediate(2),
        reap_interval: Duration::from_millis(50),
        lease_renewal: Duration::from_secs(1),
    }
}

impl Engine {
    fn worker(&self, compute: Arc<dyn AnalysisCompute>) -> Worker {
        self.worker_with(compute, self.store.clone(), worker_config())
    }

    fn worker_with(
        &self,
        compute: Arc<dyn AnalysisCompute>,
        store: Arc<dyn ResultStore>,
        config: WorkerConfig,
    ) -> Worker {
        let publisher =
            ArtifactPublisher::new(self.blobs.clone(), "test", "engine", RetryPolicy::immediate(1));
        Worker::new(self.queue.clone(), store, Arc::new(publisher), compute, config)
    }
}

// ---------------------------------------------------------------------------
// Compute doubles
// ---------------------------------------------------------------------------

/// Returns the same payload and artifacts on every run.
struct FixedCompute {
    artifacts: Vec<(&'static str, usize)>,
    calls: AtomicU32,
}

impl FixedCompute {
    fn new(artifacts: Vec<(&'static str, usize)>) -> Arc<Self> {
        Arc::new(Self {
            artifacts,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl AnalysisCompute for FixedCompute {
    async fn run(&self, job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ComputeOutput {
            payload: json!({"input": job.input_ref, "ok": true}),
            artifacts: self
                .artifacts
                .iter()
                .map(|(name, size)| RawArtifact::new(*name, vec![b'x'; *size]))
                .collect(),
        })
    }
}

struct FailingCompute {
    calls: AtomicU32,
}

#[async_trait]
impl AnalysisCompute for FailingCompute {
    async fn run(&self, _job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ComputeError::Failed(format!("boom #{call}")))
    }
}

/// Holds every caller at a barrier so two deliveries compute concurrently,
/// then tags its output with a per-call writer number.
struct GatedCompute {
    barrier: Barrier,
    calls: AtomicU32,
}

#[async_trait]
impl AnalysisCompute for GatedCompute {
    async fn run(&self, _job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        let writer = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.barrier.wait().await;
        Ok(ComputeOutput {
            payload: json!({ "writer": writer }),
            artifacts: vec![
                RawArtifact::new(format!("w{writer}_summary.json"), b"{}".to_vec()),
                RawArtifact::new(format!("w{writer}_rows.csv"), b"a\n1\n".to_vec()),
            ],
        })
    }
}

/// Like [`GatedCompute`], but every writer emits the same file name with
/// a different body length.
struct SameNameCompute {
    barrier: Barrier,
    calls: AtomicU32,
}

#[async_trait]
impl AnalysisCompute for SameNameCompute {
    async fn run(&self, _job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        let writer = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.barrier.wait().await;
        let size = if writer == 1 { 13 } else { 2 };
        Ok(ComputeOutput {
            payload: json!({ "writer": writer, "size": size }),
            artifacts: vec![RawArtifact::new("report.json", vec![b'B'; size])],
        })
    }
}

/// Succeeds after sleeping, long enough to outlive a short lease.
struct DelayedCompute {
    delay: Duration,
    calls: AtomicU32,
}

#[async_trait]
impl AnalysisCompute for DelayedCompute {
    async fn run(&self, _job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ComputeOutput {
            payload: json!({"ok": true}),
            artifacts: vec![],
        })
    }
}

struct SlowCompute;

#[async_trait]
impl AnalysisCompute for SlowCompute {
    async fn run(&self, _job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ComputeError::Failed("unreachable".to_string()))
    }
}

struct PanickingCompute;

#[async_trait]
impl AnalysisCompute for PanickingCompute {
    async fn run(&self, _job: &JobDescriptor) -> Result<ComputeOutput, ComputeError> {
        panic!("compute bug");
    }
}

// ---------------------------------------------------------------------------
// Infrastructure doubles
// ---------------------------------------------------------------------------

/// Result store whose first `commit_failures` commits fail.
struct FlakyStore {
    inner: MemoryResultStore,
    commit_failures: u32,
    commit_calls: AtomicU32,
}

#[async_trait]
impl ResultStore for FlakyStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn mark_running(&self, job_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        self.inner.mark_running(job_id, attempt).await
    }

    async fn release(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.inner.release(job_id).await
    }

    async fn commit(
        &self,
        job_id: Uuid,
        report: &ReportDraft,
        artifacts: &[ArtifactMetadata],
    ) -> Result<(), StoreError> {
        let call = self.commit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.commit_failures {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.commit(job_id, report, artifacts).await
    }

    async fn commit_failure(&self, job_id: Uuid, error: &JobError) -> Result<bool, StoreError> {
        self.inner.commit_failure(job_id, error).await
    }

    async fn get_report(&self, job_id: Uuid) -> Result<Option<Report>, StoreError> {
        self.inner.get_report(job_id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

/// Queue that refuses every enqueue but remembers what it was offered.
#[derive(Default)]
struct DownQueue {
    offered: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl JobQueue for DownQueue {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        if let Ok(mut offered) = self.offered.lock() {
            offered.push(descriptor.job_id);
        }
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    async fn dequeue(&self, _timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        Ok(None)
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(&self, _delivery: &Delivery) -> Result<NackOutcome, QueueError> {
        Ok(NackOutcome::DeadLettered)
    }

    async fn dead_letter(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    async fn extend_lease(&self, _delivery: &Delivery) -> Result<bool, QueueError> {
        Ok(false)
    }

    async fn requeue_expired(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(0)
    }

    async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    fn max_attempts(&self) -> u32 {
        3
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_commits_report_with_uploaded_artifacts() {
    let engine = engine();
    let compute = FixedCompute::new(vec![("report.json", 2048), ("cleaned.csv", 10240)]);
    let worker = engine.worker(compute.clone());

    let job_id = engine
        .coordinator
        .submit("s3://in/a.csv", json!({}))
        .await
        .unwrap();
    assert_eq!(
        engine.coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Pending
    );

    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Succeeded));

    let status = engine.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Succeeded);
    assert_eq!(status.attempt_count, 1);

    let report = engine.coordinator.get_report(job_id).await.unwrap();
    assert_eq!(report.payload["input"], "s3://in/a.csv");
    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(report.artifacts[0].file_name, "report.json");
    assert_eq!(report.artifacts[0].size_bytes, 2048);
    assert_eq!(report.artifacts[1].file_name, "cleaned.csv");
    assert_eq!(report.artifacts[1].size_bytes, 10240);
    for artifact in &report.artifacts {
        assert_eq!(artifact.status, ArtifactStatus::Uploaded);
        assert!(!artifact.storage_key.is_empty());
        assert!(engine.blobs.contains(&artifact.storage_key).await);
        assert!(artifact.access_url.is_some());
    }

    assert_eq!(engine.queue.depth().await.unwrap(), 0);
    assert_eq!(engine.queue.in_flight().await, 0);
}

#[tokio::test]
async fn failing_compute_fails_job_after_max_attempts() {
    let engine = engine();
    let compute = Arc::new(FailingCompute {
        calls: AtomicU32::new(0),
    });
    let worker = engine.worker(compute.clone());

    let job_id = engine
        .coordinator
        .submit("s3://in/b.csv", json!({}))
        .await
        .unwrap();

    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Retrying));
    assert_eq!(
        engine.coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Pending
    );
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Retrying));
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Failed));
    assert_eq!(worker.process_next().await.unwrap(), None);

    let status = engine.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.attempt_count, 3);
    let error = status.error.unwrap();
    assert_eq!(error.kind, "max_retries_exceeded");
    assert!(error.message.contains("boom #3"));

    assert_eq!(compute.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.queue.dead_letter_depth().await.unwrap(), 1);
    assert!(matches!(
        engine.coordinator.get_report(job_id).await,
        Err(EngineError::NotReady {
            status: JobStatus::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn malformed_submission_creates_nothing() {
    let engine = engine();

    let err = engine.coordinator.submit("", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(engine.store.job_count().await, 0);
    assert_eq!(engine.queue.depth().await.unwrap(), 0);

    let never_issued = Uuid::new_v4();
    assert!(matches!(
        engine.coordinator.get_status(never_issued).await,
        Err(EngineError::NotFound(id)) if id == never_issued
    ));
}

#[tokio::test]
async fn repeated_commit_is_idempotent() {
    let store = MemoryResultStore::new();
    let job = Job::pending(Uuid::new_v4(), "s3://in/c.csv", json!({}));
    store.create_job(&job).await.unwrap();

    let publisher = ArtifactPublisher::new(
        Arc::new(MemoryBlobStore::new()),
        "test",
        "engine",
        RetryPolicy::immediate(0),
    );
    let artifacts = publisher
        .publish_all(
            job.job_id,
            vec![
                RawArtifact::new("a.json", b"{}".to_vec()),
                RawArtifact::new("b.csv", b"x\n".to_vec()),
            ],
        )
        .await;
    let draft = ReportDraft {
        payload: json!({"rows": 1}),
        execution_time_ms: 12,
    };

    store.commit(job.job_id, &draft, &artifacts).await.unwrap();
    let first = store.get_report(job.job_id).await.unwrap().unwrap();
    store.commit(job.job_id, &draft, &artifacts).await.unwrap();
    let second = store.get_report(job.job_id).await.unwrap().unwrap();

    assert_eq!(first.payload, second.payload);
    assert_eq!(first.execution_time_ms, second.execution_time_ms);
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(
        serde_json::to_value(&first.artifacts).unwrap(),
        serde_json::to_value(&second.artifacts).unwrap()
    );
    assert_eq!(
        store.get_job(job.job_id).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn redelivery_after_success_skips_compute() {
    let engine = engine();
    let compute = FixedCompute::new(vec![("report.json", 16)]);
    let worker = engine.worker(compute.clone());

    let job_id = engine
        .coordinator
        .submit("s3://in/a.csv", json!({}))
        .await
        .unwrap();
    worker.process_next().await.unwrap();
    let committed = engine.coordinator.get_report(job_id).await.unwrap();

    // At-least-once: the same descriptor shows up again.
    let job = engine.coordinator.get_job(job_id).await.unwrap();
    engine.queue.enqueue(&JobDescriptor::from(&job)).await.unwrap();

    assert_eq!(
        worker.process_next().await.unwrap(),
        Some(Outcome::Skipped(JobStatus::Succeeded))
    );
    assert_eq!(compute.calls.load(Ordering::SeqCst), 1);

    let after = engine.coordinator.get_report(job_id).await.unwrap();
    assert_eq!(after.artifacts[0].artifact_id, committed.artifacts[0].artifact_id);
}

#[tokio::test]
async fn concurrent_duplicate_delivery_leaves_one_consistent_result() {
    let engine = engine();
    let compute = Arc::new(GatedCompute {
        barrier: Barrier::new(2),
        calls: AtomicU32::new(0),
    });
    let first = engine.worker(compute.clone());
    let second = engine.worker(compute.clone());

    let job_id = engine
        .coordinator
        .submit("s3://in/dup.csv", json!({}))
        .await
        .unwrap();
    let job = engine.coordinator.get_job(job_id).await.unwrap();
    engine.queue.enqueue(&JobDescriptor::from(&job)).await.unwrap();

    let (a, b) = futures::join!(first.process_next(), second.process_next());
    assert_eq!(a.unwrap(), Some(Outcome::Succeeded));
    assert_eq!(b.unwrap(), Some(Outcome::Succeeded));
    assert_eq!(compute.calls.load(Ordering::SeqCst), 2);

    let report = engine.coordinator.get_report(job_id).await.unwrap();
    let writer = report.payload["writer"].as_u64().unwrap();
    let prefix = format!("w{writer}_");
    assert_eq!(report.artifacts.len(), 2);
    assert!(
        report.artifacts.iter().all(|a| a.file_name.starts_with(&prefix)),
        "artifacts from another writer leaked into the report: {:?}",
        report
            .artifacts
            .iter()
            .map(|a| a.file_name.as_str())
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn duplicate_deliveries_with_same_artifact_name_keep_their_own_bytes() {
    let engine = engine();
    let compute = Arc::new(SameNameCompute {
        barrier: Barrier::new(2),
        calls: AtomicU32::new(0),
    });
    let first = engine.worker(compute.clone());
    let second = engine.worker(compute.clone());

    let job_id = engine
        .coordinator
        .submit("s3://in/dup.csv", json!({}))
        .await
        .unwrap();
    let job = engine.coordinator.get_job(job_id).await.unwrap();
    engine.queue.enqueue(&JobDescriptor::from(&job)).await.unwrap();

    let (a, b) = futures::join!(first.process_next(), second.process_next());
    assert_eq!(a.unwrap(), Some(Outcome::Succeeded));
    assert_eq!(b.unwrap(), Some(Outcome::Succeeded));

    // Both runs uploaded; neither overwrote the other.
    assert_eq!(engine.blobs.keys().await.len(), 2);

    let report = engine.coordinator.get_report(job_id).await.unwrap();
    assert_eq!(report.artifacts.len(), 1);
    let artifact = &report.artifacts[0];
    assert_eq!(artifact.file_name, "report.json");
    assert_eq!(artifact.size_bytes, report.payload["size"].as_i64().unwrap());

    let stored = engine.blobs.download(&artifact.storage_key).await.unwrap();
    assert_eq!(stored.len() as i64, artifact.size_bytes);
}

#[tokio::test]
async fn one_failed_upload_does_not_fail_the_job() {
    let engine = engine();
    engine.blobs.reject_keys_containing("chart").await;
    let compute = FixedCompute::new(vec![
        ("summary.json", 64),
        ("cleaned.csv", 256),
        ("chart.png", 1024),
    ]);
    let worker = engine.worker(compute);

    let job_id = engine
        .coordinator
        .submit("s3://in/a.csv", json!({}))
        .await
        .unwrap();
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Succeeded));

    let report = engine.coordinator.get_report(job_id).await.unwrap();
    let statuses: Vec<ArtifactStatus> = report.artifacts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            ArtifactStatus::Uploaded,
            ArtifactStatus::Uploaded,
            ArtifactStatus::UploadFailed
        ]
    );

    let failed = &report.artifacts[2];
    assert!(failed.error.is_some());
    assert!(failed.access_url.is_none());
    assert!(!engine.blobs.contains(&failed.storage_key).await);
    assert_eq!(
        engine.coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn abandoned_delivery_is_redelivered_after_lease_expiry() {
    let engine = engine_with(queue_settings(3, Duration::ZERO));
    let compute = FixedCompute::new(vec![("report.json", 8)]);
    let worker = engine.worker(compute.clone());

    let job_id = engine
        .coordinator
        .submit("s3://in/a.csv", json!({}))
        .await
        .unwrap();

    // A worker takes the job and disappears without acking.
    let abandoned = engine
        .queue
        .dequeue(Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(abandoned.attempt, 1);
    assert_eq!(engine.queue.requeue_expired().await.unwrap(), 1);

    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Succeeded));
    let status = engine.coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Succeeded);
    assert_eq!(status.attempt_count, 2);
}

#[tokio::test]
async fn compute_timeout_counts_as_failed_attempt() {
    let engine = engine_with(queue_settings(1, Duration::from_secs(60)));
    let config = WorkerConfig {
        compute_timeout: Duration::from_millis(50),
        ..worker_config()
    };
    let worker = engine.worker_with(Arc::new(SlowCompute), engine.store.clone(), config);

    let job_id = engine
        .coordinator
        .submit("s3://in/slow.csv", json!({}))
        .await
        .unwrap();
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Failed));

    let error = engine.coordinator.get_status(job_id).await.unwrap().error.unwrap();
    assert_eq!(error.kind, "max_retries_exceeded");
    assert!(error.message.contains("timed out"));
}

#[tokio::test]
async fn compute_panic_is_contained() {
    let engine = engine_with(queue_settings(2, Duration::from_secs(60)));
    let worker = engine.worker(Arc::new(PanickingCompute));

    let job_id = engine
        .coordinator
        .submit("s3://in/panic.csv", json!({}))
        .await
        .unwrap();
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Retrying));
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Failed));
    assert_eq!(
        engine.coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test]
async fn transient_commit_failure_is_retried_without_recompute() {
    let engine = engine();
    let store = Arc::new(FlakyStore {
        inner: MemoryResultStore::new(),
        commit_failures: 2,
        commit_calls: AtomicU32::new(0),
    });
    let coordinator = JobCoordinator::new(
        engine.queue.clone(),
        store.clone(),
        engine.blobs.clone(),
        RetryPolicy::immediate(0),
        Duration::from_secs(60),
    );
    let compute = FixedCompute::new(vec![("report.json", 8)]);
    let worker = engine.worker_with(compute.clone(), store.clone(), worker_config());

    let job_id = coordinator.submit("s3://in/a.csv", json!({})).await.unwrap();
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Succeeded));

    assert_eq!(compute.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.commit_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn exhausted_commit_retries_nack_the_delivery() {
    let engine = engine();
    let store = Arc::new(FlakyStore {
        inner: MemoryResultStore::new(),
        commit_failures: 3,
        commit_calls: AtomicU32::new(0),
    });
    let coordinator = JobCoordinator::new(
        engine.queue.clone(),
        store.clone(),
        engine.blobs.clone(),
        RetryPolicy::immediate(0),
        Duration::from_secs(60),
    );
    let compute = FixedCompute::new(vec![("report.json", 8)]);
    let worker = engine.worker_with(compute.clone(), store.clone(), worker_config());

    let job_id = coordinator.submit("s3://in/a.csv", json!({})).await.unwrap();
    assert!(worker.process_next().await.is_err());
    assert_eq!(engine.queue.in_flight().await, 0);

    // Redelivered; the store has recovered.
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Succeeded));
    assert_eq!(compute.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn commit_failing_through_the_last_attempt_fails_the_job() {
    let engine = engine();
    let store = Arc::new(FlakyStore {
        inner: MemoryResultStore::new(),
        commit_failures: u32::MAX,
        commit_calls: AtomicU32::new(0),
    });
    let coordinator = JobCoordinator::new(
        engine.queue.clone(),
        store.clone(),
        engine.blobs.clone(),
        RetryPolicy::immediate(0),
        Duration::from_secs(60),
    );
    let compute = FixedCompute::new(vec![("report.json", 8)]);
    let worker = engine.worker_with(compute.clone(), store.clone(), worker_config());

    let job_id = coordinator.submit("s3://in/a.csv", json!({})).await.unwrap();
    assert!(worker.process_next().await.is_err());
    assert!(worker.process_next().await.is_err());
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Failed));

    let status = coordinator.get_status(job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, "max_retries_exceeded");

    assert_eq!(compute.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.queue.dead_letter_depth().await.unwrap(), 1);
    assert_eq!(engine.queue.depth().await.unwrap(), 0);
    assert_eq!(engine.queue.in_flight().await, 0);
}

#[tokio::test]
async fn compute_outliving_the_visibility_timeout_keeps_its_lease() {
    let engine = engine_with(queue_settings(3, Duration::from_millis(100)));
    let compute = Arc::new(DelayedCompute {
        delay: Duration::from_millis(300),
        calls: AtomicU32::new(0),
    });
    let config = WorkerConfig {
        lease_renewal: Duration::from_millis(20),
        ..worker_config()
    };
    let worker = engine.worker_with(compute.clone(), engine.store.clone(), config);

    let job_id = engine
        .coordinator
        .submit("s3://in/long.csv", json!({}))
        .await
        .unwrap();

    let reap_midway = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.queue.requeue_expired().await.unwrap()
    };
    let (outcome, reaped) = futures::join!(worker.process_next(), reap_midway);

    assert_eq!(reaped, 0);
    assert_eq!(outcome.unwrap(), Some(Outcome::Succeeded));
    assert_eq!(compute.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.queue.depth().await.unwrap(), 0);
    assert_eq!(engine.queue.in_flight().await, 0);
    assert_eq!(
        engine.coordinator.get_status(job_id).await.unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
async fn unavailable_queue_fails_submission_and_closes_the_job() {
    let queue = Arc::new(DownQueue::default());
    let store = Arc::new(MemoryResultStore::new());
    let coordinator = JobCoordinator::new(
        queue.clone(),
        store.clone(),
        Arc::new(MemoryBlobStore::new()),
        RetryPolicy::immediate(2),
        Duration::from_secs(60),
    );

    let err = coordinator.submit("s3://in/a.csv", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::QueueUnavailable(_)));

    let offered = queue.offered.lock().unwrap().clone();
    assert_eq!(offered.len(), 3);
    let job = store.get_job(offered[0]).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, "queue_unavailable");
}

#[tokio::test]
async fn dataset_profiler_runs_end_to_end() {
    let engine = engine();
    engine
        .blobs
        .upload("in/orders.csv", b"id,total\n1,9.5\n\n2,\n", "text/csv")
        .await
        .unwrap();
    let worker = engine.worker(Arc::new(DatasetProfiler::new(engine.blobs.clone())));

    let job_id = engine
        .coordinator
        .submit("s3://bucket/in/orders.csv", json!({"delimiter": ","}))
        .await
        .unwrap();
    assert_eq!(worker.process_next().await.unwrap(), Some(Outcome::Succeeded));

    let report = engine.coordinator.get_report(job_id).await.unwrap();
    assert_eq!(report.payload["summary"]["rows"], 2);
    assert_eq!(report.payload["summary"]["blank_lines_dropped"], 1);

    let names: Vec<&str> = report.artifacts.iter().map(|a| a.file_name.as_str()).collect();
    assert_eq!(names, vec!["report.json", "cleaned.csv"]);

    let cleaned = engine
        .blobs
        .download(&report.artifacts[1].storage_key)
        .await
        .unwrap();
    assert_eq!(cleaned, b"id,total\n1,9.5\n2,\n");
}

#[tokio::test]
async fn status_is_always_a_defined_state() {
    let engine = engine();
    let worker = engine.worker(FixedCompute::new(vec![]));
    let job_id = engine
        .coordinator
        .submit("s3://in/a.csv", json!({}))
        .await
        .unwrap();

    let allowed = ["PENDING", "RUNNING", "SUCCEEDED", "FAILED"];
    let coordinator = &engine.coordinator;
    let read_status = move || async move {
        let status = coordinator.get_status(job_id).await.unwrap();
        serde_json::to_value(&status).unwrap()["status"]
            .as_str()
            .unwrap()
            .to_string()
    };

    assert!(allowed.contains(&read_status().await.as_str()));
    worker.process_next().await.unwrap();
    assert_eq!(read_status().await, "SUCCEEDED");
}
