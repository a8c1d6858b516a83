use async_trait::async_trait;

use crate::models::job::JobDescriptor;
use crate::models::report::ComputeOutput;
use crate::services::storage::StorageError;

/// The analysis step run by workers. Treated as opaque and possibly
/// non-deterministic; may be CPU or I/O heavy.
#[async_trait]
pub trait AnalysisCompute: Send + Sync {
    async fn run(&self, job: &JobDescriptor) -> Result<ComputeOutput, ComputeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Failed to load input: {0}")]
    Input(#[from] StorageError),

    #[error("Invalid input data: {0}")]
    InvalidData(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}
