//! API Routes
//!
//! - `/api/runs` - Create a run from an intent
//! - `/api/runs/{run_id}` - Poll run state
//! - `/api/runs/{run_id}/cancel` - Request cancellation
//! - `/api/health` - Health checks

pub mod health;
pub mod runs;

use axum::Router;
use tracing::info;

use crate::middleware::{apply_cors, apply_tracing};
use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let router = Router::new()
        .merge(runs::router(state.clone()))
        .merge(health::router(state));

    apply_tracing(apply_cors(router))
}
