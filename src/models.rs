use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::intent::Intent;
use crate::queue::RunQueue;
use crate::run::{RunId, RunStatus};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub queue: RunQueue,
}

// API Request/Response types

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub intent: Intent,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelRunResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub sources: usize,
    pub generator: String,
}
