//! Moves computed artifact bytes into object storage and hands back
//! metadata only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::artifact::{content_type_for, ArtifactMetadata, ArtifactStatus, RawArtifact};
use crate::services::retry::{retry, RetryPolicy};
use crate::services::storage::BlobStore;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub struct ArtifactPublisher {
    blobs: Arc<dyn BlobStore>,
    environment: String,
    tool: String,
    upload_policy: RetryPolicy,
}

impl ArtifactPublisher {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        environment: &str,
        tool: &str,
        upload_policy: RetryPolicy,
    ) -> Self {
        Self {
            blobs,
            environment: sanitize_segment(environment),
            tool: sanitize_segment(tool),
            upload_policy,
        }
    }

    /// Upload one artifact. Upload failure is reported on the returned
    /// metadata, never as an error.
    pub async fn publish(&self, job_id: Uuid, raw: RawArtifact) -> ArtifactMetadata {
        self.publish_one(job_id, raw, Utc::now()).await
    }

    /// Upload every artifact of a job, preserving order. All keys share one
    /// timestamp.
    pub async fn publish_all(&self, job_id: Uuid, raws: Vec<RawArtifact>) -> Vec<ArtifactMetadata> {
        let timestamp = Utc::now();
        let mut published = Vec::with_capacity(raws.len());
        for raw in raws {
            published.push(self.publish_one(job_id, raw, timestamp).await);
        }
        published
    }

    async fn publish_one(
        &self,
        job_id: Uuid,
        raw: RawArtifact,
        timestamp: DateTime<Utc>,
    ) -> ArtifactMetadata {
        let artifact_id = Uuid::new_v4();
        let format = raw.resolved_format();
        let content_type = content_type_for(&format);

        // Every key carries the artifact id. Two deliveries of one job can
        // publish the same file name in the same second, and neither may
        // overwrite the other's bytes.
        let file_name = disambiguate(&sanitize_file_name(&raw.file_name), artifact_id);
        let storage_key = self.storage_key(job_id, timestamp, &file_name);

        let bytes = raw.bytes;
        let size_bytes = bytes.len() as i64;
        let outcome = retry(&self.upload_policy, "artifact_upload", || {
            self.blobs.upload(&storage_key, &bytes, content_type)
        })
        .await;

        let (status, error) = match outcome {
            Ok(()) => {
                tracing::info!(
                    job_id = %job_id,
                    artifact_id = %artifact_id,
                    storage_key = %storage_key,
                    size_bytes,
                    "Artifact uploaded"
                );
                (ArtifactStatus::Uploaded, None)
            }
            Err(e) => {
                metrics::counter!("artifact_uploads_failed_total").increment(1);
                tracing::warn!(
                    job_id = %job_id,
                    artifact_id = %artifact_id,
                    storage_key = %storage_key,
                    error = %e,
                    "Artifact upload failed after retries"
                );
                let failure = EngineError::UploadFailure(e.to_string());
                (ArtifactStatus::UploadFailed, Some(failure.to_string()))
            }
        };

        ArtifactMetadata {
            artifact_id,
            job_id,
            file_name: raw.file_name,
            format,
            size_bytes,
            storage_key,
            status,
            error,
            access_url: None,
            created_at: Utc::now(),
        }
    }

    /// `{environment}/{tool}/{job_id}/{timestamp}_{file_name}`, lower-cased.
    pub fn storage_key(&self, job_id: Uuid, timestamp: DateTime<Utc>, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}_{}",
            self.environment,
            self.tool,
            job_id,
            timestamp.format(TIMESTAMP_FORMAT),
            file_name
        )
        .to_lowercase()
    }
}

/// Reduce a file name to `[a-z0-9._-]`, collapsing other runs to `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut out = String::with_capacity(base.len());
    let mut last_was_sep = false;
    for c in base.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_start_matches(['.', '_']).trim_end_matches('_');
    if trimmed.is_empty() {
        "artifact".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sanitize_segment(segment: &str) -> String {
    sanitize_file_name(segment).replace('.', "_")
}

/// Insert the artifact id before the extension: `a.csv` -> `a_<id>.csv`.
fn disambiguate(file_name: &str, artifact_id: Uuid) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{artifact_id}.{ext}"),
        _ => format!("{file_name}_{artifact_id}"),
    }
}
