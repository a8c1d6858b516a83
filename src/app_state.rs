use std::sync::Arc;

use crate::services::coordinator::JobCoordinator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
}

impl AppState {
    pub fn new(coordinator: JobCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }
}
