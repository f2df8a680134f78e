use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use route_orchestrator::config::Config;
use route_orchestrator::engine::Engine;
use route_orchestrator::intent::Intent;
use route_orchestrator::llm::build_generator;
use route_orchestrator::queue::WorkerPool;
use route_orchestrator::sources::{gateway_registry, FixtureFile, SourceRegistry};
use route_orchestrator::store::{FileRunStore, InMemoryRunStore, RunStore};
use route_orchestrator::utils::init_logging;
use route_orchestrator::{create_router, AppState};

const QUEUE_CAPACITY: usize = 256;
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "route-orchestrator", version, about = "Drug repurposing route orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the run API (default)
    Serve,
    /// Execute one intent to completion and print the snapshot as JSON
    Run {
        /// Path to an intent JSON document
        #[arg(long)]
        intent: PathBuf,
        /// Serve sources from this fixture file instead of the configured ones
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
}

async fn build_registry(config: &Config, fixtures: Option<&Path>) -> anyhow::Result<SourceRegistry> {
    let ttl = config.cache.source_ttl;
    if let Some(path) = fixtures.or(config.sources.fixtures.as_deref()) {
        return Ok(FixtureFile::load(path).await?.into_registry(ttl)?);
    }
    if config.sources.gateway_url.is_some() {
        return Ok(gateway_registry(&config.sources, ttl)?);
    }
    Ok(SourceRegistry::new())
}

async fn build_engine(config: &Config, fixtures: Option<&Path>) -> anyhow::Result<Engine> {
    let registry = build_registry(config, fixtures).await?;
    if registry.is_empty() {
        warn!("No sources configured; every run will complete with an empty shortlist");
    }
    info!(sources = registry.len(), "Source registry ready");

    let store: Arc<dyn RunStore> = match &config.store.dir {
        Some(dir) => Arc::new(FileRunStore::new(dir.clone())),
        None => Arc::new(InMemoryRunStore::new()),
    };

    Ok(Engine::builder(config.clone())
        .registry(registry)
        .generator(build_generator(&config.llm))
        .store(store)
        .build())
}

async fn run_once(config: &Config, intent_path: &Path, fixtures: Option<&Path>) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(intent_path)
        .await
        .with_context(|| format!("reading intent {}", intent_path.display()))?;
    let intent: Intent = serde_json::from_slice(&bytes).context("intent is not valid JSON")?;

    let engine = build_engine(config, fixtures).await?;
    let run_id = engine.create_run(intent).await?;
    let snapshot = engine.advance(run_id).await?;
    engine.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(build_engine(&config, None).await?);
    let (queue, pool) = WorkerPool::start(engine.clone(), config.engine.worker_count, QUEUE_CAPACITY);

    let stop = CancellationToken::new();
    let purge = {
        let engine = engine.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = engine.services().purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    };

    let app = create_router(AppState { engine: engine.clone(), queue });

    let host: std::net::IpAddr = config.server.host.parse().context("HOST must be an IP address")?;
    let addr = SocketAddr::from((host, config.server.port));
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    stop.cancel();
    let _ = purge.await;
    engine.shutdown().await;
    pool.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;
    let _guard = init_logging(&config.logging);
    info!("Configuration loaded: {:?}", config.server);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Run { intent, fixtures } => run_once(&config, &intent, fixtures.as_deref()).await,
    }
}
