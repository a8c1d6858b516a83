use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{ArtifactMetadata, RawArtifact};

/// What a compute function hands back to the worker.
#[derive(Debug, Clone)]
pub struct ComputeOutput {
    pub payload: serde_json::Value,
    pub artifacts: Vec<RawArtifact>,
}

/// Report body submitted to the result store alongside its artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
    pub payload: serde_json::Value,
    pub execution_time_ms: i64,
}

/// Committed structured result of a successful job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub job_id: Uuid,
    pub payload: serde_json::Value,
    pub artifacts: Vec<ArtifactMetadata>,
    pub execution_time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
