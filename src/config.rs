use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub llm: LLMConfig,
    pub sources: SourcesConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000, host: "0.0.0.0".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on one agent's execution, retries included.
    pub agent_timeout: Duration,
    /// Wall-clock budget for a whole run.
    pub run_budget: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Concurrent calls allowed per source, across all runs.
    pub source_concurrency: usize,
    /// Optional requests-per-second quota per source.
    pub source_rate_per_sec: Option<u32>,
    pub llm_concurrency: usize,
    pub worker_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(60),
            run_budget: Duration::from_secs(600),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(8),
            source_concurrency: 4,
            source_rate_per_sec: None,
            llm_concurrency: 2,
            worker_count: 2,
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub source_ttl: Duration,
    pub synthesis_ttl: Duration,
    /// Entries older than this are served but flagged stale.
    pub soft_freshness: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            source_ttl: Duration::from_secs(86_400),
            synthesis_ttl: Duration::from_secs(86_400),
            soft_freshness: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    /// `openai` (any OpenAI-compatible endpoint) or `extractive`.
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: "extractive".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesConfig {
    /// JSON fixture file to serve sources from.
    pub fixtures: Option<PathBuf>,
    pub gateway_url: Option<String>,
    pub gateway_api_key: Option<String>,
    /// `id:category` pairs served through the gateway.
    pub gateway_sources: Vec<String>,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Directory for run records; in-memory when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub log_dir: Option<PathBuf>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn opt_var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn secs(key: &str, default: u64) -> Result<Duration> {
    let value: u64 = var_or(key, &default.to_string())
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds", key))?;
    Ok(Duration::from_secs(value))
}

fn millis(key: &str, default: u64) -> Result<Duration> {
    let value: u64 = var_or(key, &default.to_string())
        .parse()
        .with_context(|| format!("{} must be a whole number of milliseconds", key))?;
    Ok(Duration::from_millis(value))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: var_or("PORT", "3000").parse().context("PORT must be a port number")?,
                host: var_or("HOST", "0.0.0.0"),
            },
            engine: EngineConfig {
                agent_timeout: secs("AGENT_TIMEOUT_SECS", 60)?,
                run_budget: secs("RUN_BUDGET_SECS", 600)?,
                retry_max_attempts: var_or("RETRY_MAX_ATTEMPTS", "3").parse()?,
                retry_base_delay: millis("RETRY_BASE_MS", 250)?,
                retry_max_delay: millis("RETRY_MAX_MS", 8000)?,
                source_concurrency: var_or("SOURCE_CONCURRENCY", "4").parse()?,
                source_rate_per_sec: opt_var("SOURCE_RATE_PER_SEC").map(|v| v.parse()).transpose()?,
                llm_concurrency: var_or("LLM_CONCURRENCY", "2").parse()?,
                worker_count: var_or("WORKER_COUNT", "2").parse()?,
            },
            cache: CacheConfig {
                source_ttl: secs("CACHE_TTL_SECS", 86_400)?,
                synthesis_ttl: secs("LLM_CACHE_TTL_SECS", 86_400)?,
                soft_freshness: secs("CACHE_SOFT_FRESHNESS_SECS", 6 * 3600)?,
            },
            llm: LLMConfig {
                provider: var_or("LLM_PROVIDER", "openai"),
                model: var_or("LLM_MODEL", "gpt-4o-mini"),
                api_key: env::var("LLM_API_KEY").unwrap_or_default(),
                base_url: var_or("LLM_BASE_URL", "https://api.openai.com/v1"),
                timeout: secs("LLM_TIMEOUT_SECS", 30)?,
            },
            sources: SourcesConfig {
                fixtures: opt_var("SOURCE_FIXTURES").map(PathBuf::from),
                gateway_url: opt_var("SOURCE_GATEWAY_URL"),
                gateway_api_key: opt_var("SOURCE_GATEWAY_API_KEY"),
                gateway_sources: var_or("SOURCE_GATEWAY_SOURCES", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                http_timeout: secs("SOURCE_HTTP_TIMEOUT_SECS", 30)?,
            },
            store: StoreConfig { dir: opt_var("RUN_STORE_DIR").map(PathBuf::from) },
            logging: LoggingConfig {
                filter: opt_var("RUST_LOG"),
                log_dir: opt_var("LOG_DIR").map(PathBuf::from),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert!(config.engine.agent_timeout < config.engine.run_budget);
        assert!(config.cache.soft_freshness < config.cache.source_ttl);
        assert_eq!(config.engine.retry_policy().max_attempts, 3);
        assert!(config.store.dir.is_none());
    }
}
