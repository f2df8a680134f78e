// Text generation for candidate justifications

pub mod extractive;
pub mod openai;
pub mod provider;

use std::sync::Arc;

use tracing::{info, warn};

pub use extractive::ExtractiveGenerator;
pub use openai::OpenAIGenerator;
pub use provider::*;

use crate::config::LLMConfig;

/// Pick the generator for `config`. Falls back to extractive when no key is set.
pub fn build_generator(config: &LLMConfig) -> Arc<dyn TextGenerator> {
    match config.provider.as_str() {
        "openai" if !config.api_key.is_empty() => {
            info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible generator");
            Arc::new(OpenAIGenerator::new(&config.api_key, &config.base_url, &config.model, config.timeout))
        }
        "openai" | "extractive" => {
            info!("Using extractive generator");
            Arc::new(ExtractiveGenerator::new())
        }
        other => {
            warn!(provider = %other, "Unknown generation provider, using extractive generator");
            Arc::new(ExtractiveGenerator::new())
        }
    }
}
