use std::time::Duration;

use serde::Deserialize;

use crate::services::queue::QueueSettings;
use crate::services::retry::RetryPolicy;
use crate::services::worker::WorkerConfig;

/// Process configuration, read from the environment (and `.env` if present).
/// Shared by the intake server and the worker binary.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address. Ignored by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    pub s3_bucket: String,
    /// S3-compatible endpoint URL (AWS, R2, MinIO)
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    #[serde(default = "default_region")]
    pub s3_region: String,

    /// First segment of every artifact storage key.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Second segment of every artifact storage key.
    #[serde(default = "default_tool_name")]
    pub tool_name: String,

    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_dequeue_timeout_secs")]
    pub dequeue_timeout_secs: u64,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_compute_timeout_secs")]
    pub compute_timeout_secs: u64,

    #[serde(default = "default_upload_max_retries")]
    pub upload_max_retries: u32,

    #[serde(default = "default_upload_backoff_base_ms")]
    pub upload_backoff_base_ms: u64,

    #[serde(default = "default_upload_backoff_max_ms")]
    pub upload_backoff_max_ms: u64,

    #[serde(default = "default_commit_max_retries")]
    pub commit_max_retries: u32,

    #[serde(default = "default_redelivery_backoff_base_ms")]
    pub redelivery_backoff_base_ms: u64,

    #[serde(default = "default_redelivery_backoff_max_ms")]
    pub redelivery_backoff_max_ms: u64,

    /// Lifetime of presigned artifact URLs returned with reports.
    #[serde(default = "default_access_url_ttl_secs")]
    pub access_url_ttl_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_tool_name() -> String {
    "profiler".to_string()
}

fn default_queue_prefix() -> String {
    "analysis".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_dequeue_timeout_secs() -> u64 {
    5
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_compute_timeout_secs() -> u64 {
    1800
}

fn default_upload_max_retries() -> u32 {
    3
}

fn default_upload_backoff_base_ms() -> u64 {
    250
}

fn default_upload_backoff_max_ms() -> u64 {
    8000
}

fn default_commit_max_retries() -> u32 {
    5
}

fn default_redelivery_backoff_base_ms() -> u64 {
    1000
}

fn default_redelivery_backoff_max_ms() -> u64 {
    60_000
}

fn default_access_url_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Configuration value {0} must not be empty")]
    Empty(&'static str),

    #[error("Configuration value {0} must be greater than zero")]
    Zero(&'static str),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject blank connection settings and zero limits up front rather
    /// than at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("DATABASE_URL", &self.database_url),
            ("REDIS_URL", &self.redis_url),
            ("S3_BUCKET", &self.s3_bucket),
            ("S3_ENDPOINT", &self.s3_endpoint),
            ("S3_ACCESS_KEY", &self.s3_access_key),
            ("S3_SECRET_KEY", &self.s3_secret_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }

        if self.worker_concurrency == 0 {
            return Err(ConfigError::Zero("WORKER_CONCURRENCY"));
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::Zero("MAX_DELIVERY_ATTEMPTS"));
        }
        if self.dequeue_timeout_secs == 0 {
            return Err(ConfigError::Zero("DEQUEUE_TIMEOUT_SECS"));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(ConfigError::Zero("VISIBILITY_TIMEOUT_SECS"));
        }
        if self.compute_timeout_secs == 0 {
            return Err(ConfigError::Zero("COMPUTE_TIMEOUT_SECS"));
        }
        Ok(())
    }

    pub fn upload_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.upload_max_retries,
            Duration::from_millis(self.upload_backoff_base_ms),
            Duration::from_millis(self.upload_backoff_max_ms),
        )
    }

    /// Enqueue and artifact upload share the same backoff envelope.
    pub fn enqueue_policy(&self) -> RetryPolicy {
        self.upload_policy()
    }

    pub fn commit_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.commit_max_retries,
            Duration::from_millis(self.upload_backoff_base_ms),
            Duration::from_millis(self.upload_backoff_max_ms),
        )
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_attempts: self.max_delivery_attempts,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            redelivery: RetryPolicy::new(
                0,
                Duration::from_millis(self.redelivery_backoff_base_ms),
                Duration::from_millis(self.redelivery_backoff_max_ms),
            ),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            dequeue_timeout: Duration::from_secs(self.dequeue_timeout_secs),
            compute_timeout: Duration::from_secs(self.compute_timeout_secs),
            commit_policy: self.commit_policy(),
            // Reap a few times per lease so abandoned work is not held much
            // longer than the visibility timeout.
            reap_interval: Duration::from_secs((self.visibility_timeout_secs / 4).clamp(1, 60)),
            // Renew well inside the lease so compute may outlast it.
            lease_renewal: Duration::from_secs((self.visibility_timeout_secs / 3).max(1)),
            ..WorkerConfig::default()
        }
    }

    pub fn access_url_ttl(&self) -> Duration {
        Duration::from_secs(self.access_url_ttl_secs)
    }
}
