use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Upload state of a single artifact.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Uploaded,
    UploadFailed,
}

impl ArtifactStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// File produced by a compute run, still holding its payload.
///
/// Only the compute function and the artifact publisher ever see this type.
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub file_name: String,
    /// Explicit format; defaults to the file extension when absent.
    pub format: Option<String>,
    pub bytes: Vec<u8>,
}

impl RawArtifact {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            format: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Lower-cased format, taken from the explicit value or the extension.
    pub fn resolved_format(&self) -> String {
        self.format
            .clone()
            .or_else(|| {
                self.file_name
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_string())
                    .filter(|ext| !ext.is_empty())
            })
            .unwrap_or_else(|| "bin".to_string())
            .to_lowercase()
    }
}

/// Persisted description of an artifact. Never carries payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    pub artifact_id: Uuid,
    pub job_id: Uuid,
    pub file_name: String,
    pub format: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub status: ArtifactStatus,
    /// Upload error captured after the last retry, only for `UPLOAD_FAILED`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Time-limited read URL, regenerated on every report read.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub access_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Map an artifact format to the content type used for uploads.
pub fn content_type_for(format: &str) -> &'static str {
    match format {
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" | "log" => "text/plain",
        "html" => "text/html",
        "md" => "text/markdown",
        "parquet" => "application/vnd.apache.parquet",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
