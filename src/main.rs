use std::sync::Arc;

use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use analysis_engine::app_state::AppState;
use analysis_engine::config::AppConfig;
use analysis_engine::db;
use analysis_engine::routes;
use analysis_engine::services::coordinator::JobCoordinator;
use analysis_engine::services::queue::RedisJobQueue;
use analysis_engine::services::result_store::PgResultStore;
use analysis_engine::services::storage::S3BlobStore;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing analysis intake server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing object storage client");
    let blobs = S3BlobStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    tracing::info!(prefix = %config.queue_prefix, "Connecting to Redis job queue");
    let queue = RedisJobQueue::new(&config.redis_url, &config.queue_prefix, config.queue_settings())
        .expect("Failed to initialize job queue");

    let coordinator = JobCoordinator::new(
        Arc::new(queue),
        Arc::new(PgResultStore::new(db_pool)),
        Arc::new(blobs),
        config.enqueue_policy(),
        config.access_url_ttl(),
    );
    let state = AppState::new(coordinator);

    let app = routes::router(state).route(
        "/metrics",
        get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    tracing::info!("Starting analysis intake server on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
