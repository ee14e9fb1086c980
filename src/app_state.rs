use std::sync::Arc;

use crate::db::store::JobStore;
use crate::services::queue::JobPublisher;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobPublisher>,
    /// How long a pending job absorbs duplicate submissions.
    pub freshness_window: chrono::Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobPublisher>,
        freshness_window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            queue,
            freshness_window,
        }
    }
}
