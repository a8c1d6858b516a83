use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every engine metric. Call once after the
/// recorder is installed.
pub fn describe_metrics() {
    metrics::describe_counter!("analysis_jobs_submitted_total", "Jobs accepted and enqueued");
    metrics::describe_counter!("analysis_jobs_succeeded_total", "Jobs whose result was committed");
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Jobs marked failed after exhausting delivery attempts"
    );
    metrics::describe_counter!(
        "analysis_job_attempts_failed_total",
        "Individual delivery attempts whose compute failed"
    );
    metrics::describe_counter!(
        "artifact_uploads_failed_total",
        "Artifacts left in UPLOAD_FAILED after retries"
    );
    metrics::describe_histogram!(
        "analysis_job_duration_seconds",
        "Wall time from compute start to committed result"
    );
    metrics::describe_gauge!("analysis_queue_depth", "Descriptors waiting in the job queue");
}
