//! Asynchronous analysis job engine.
//!
//! Jobs are submitted through the [`services::coordinator::JobCoordinator`],
//! carried by a [`services::queue::JobQueue`] to a
//! [`services::worker::WorkerPool`], and their reports and artifact metadata
//! land in a [`services::result_store::ResultStore`]. Artifact bytes go to a
//! [`services::storage::BlobStore`] and never through the result store.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
