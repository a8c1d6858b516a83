use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use analysis_engine::config::AppConfig;
use analysis_engine::db;
use analysis_engine::routes::metrics::describe_metrics;
use analysis_engine::services::profiler::DatasetProfiler;
use analysis_engine::services::publisher::ArtifactPublisher;
use analysis_engine::services::queue::RedisJobQueue;
use analysis_engine::services::result_store::PgResultStore;
use analysis_engine::services::storage::{BlobStore, S3BlobStore};
use analysis_engine::services::worker::{Worker, WorkerPool};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting analysis worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Workers expose no HTTP; the recorder keeps metric calls cheap and
    // consistent with the server.
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let blobs: Arc<dyn BlobStore> = Arc::new(
        S3BlobStore::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )
        .expect("Failed to initialize object storage client"),
    );

    let queue = RedisJobQueue::new(&config.redis_url, &config.queue_prefix, config.queue_settings())
        .expect("Failed to initialize job queue");

    let publisher = ArtifactPublisher::new(
        Arc::clone(&blobs),
        &config.environment,
        &config.tool_name,
        config.upload_policy(),
    );

    let worker = Worker::new(
        Arc::new(queue),
        Arc::new(PgResultStore::new(db_pool)),
        Arc::new(publisher),
        Arc::new(DatasetProfiler::new(blobs)),
        config.worker_config(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, draining workers");
        }
        signal.cancel();
    });

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Worker ready, starting job processing loop"
    );
    WorkerPool::new(worker).run(shutdown).await;
}
