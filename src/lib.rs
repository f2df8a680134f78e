// Route Orchestrator - turns a research intent into a ranked, evidence-scored repurposing shortlist

pub mod agents;
pub mod budget;
pub mod cache;
pub mod config;
pub mod engine;
pub mod evidence;
pub mod executor;
pub mod graph;
pub mod intent;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod queue;
pub mod ranking;
pub mod routes;
pub mod run;
pub mod sources;
pub mod store;
pub mod synthesis;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use engine::{Engine, EngineBuilder};
pub use intent::{Intent, ReasoningMode, Route};
pub use models::AppState;
pub use run::{RunId, RunSnapshot, RunStatus};

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
