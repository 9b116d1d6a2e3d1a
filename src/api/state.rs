use std::sync::Arc;

use crate::services::FeedEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FeedEngine>,
}

impl AppState {
    pub fn new(engine: Arc<FeedEngine>) -> Self {
        Self { engine }
    }
}
