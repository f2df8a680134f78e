//! Orchestration engine
//!
//! Owns the live runs and the process-wide services (caches, rate controller,
//! retry policy) shared by all of them. Collaborators drive it through four
//! calls:
//!
//! - [`Engine::create_run`] validates an intent and records a `created` run
//! - [`Engine::advance`] drives a run to a terminal state (idempotent)
//! - [`Engine::get_state`] returns a snapshot without waiting
//! - [`Engine::cancel`] requests cancellation and returns immediately
//!
//! A run leaves the live table once it is terminal and its final state is
//! saved; later calls are answered from the run store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::AgentSet;
use crate::budget::RateController;
use crate::cache::{EvidenceCache, SynthesisCache, TtlCache};
use crate::config::{Config, EngineConfig};
use crate::executor::Executor;
use crate::graph::catalog;
use crate::intent::Intent;
use crate::llm::{ExtractiveGenerator, TextGenerator};
use crate::run::{IssueKind, Run, RunId, RunIssue, RunSnapshot, RunStatus};
use crate::sources::SourceRegistry;
use crate::store::{InMemoryRunStore, RunStore};
use crate::types::{AppError, AppResult};
use crate::utils::RetryPolicy;

/// Process-wide state shared by every run. Created once, torn down by
/// [`EngineServices::shutdown`].
pub struct EngineServices {
    pub evidence_cache: EvidenceCache,
    pub synthesis_cache: SynthesisCache,
    pub rate: RateController,
    pub retry: RetryPolicy,
    pub synthesis_ttl: Duration,
}

impl EngineServices {
    pub fn new(config: &Config) -> Self {
        Self {
            evidence_cache: TtlCache::new(config.cache.soft_freshness),
            synthesis_cache: TtlCache::new(config.cache.soft_freshness),
            rate: RateController::new(
                config.engine.source_concurrency,
                config.engine.source_rate_per_sec,
                config.engine.llm_concurrency,
            ),
            retry: config.engine.retry_policy(),
            synthesis_ttl: config.cache.synthesis_ttl,
        }
    }

    /// Drop expired cache entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.evidence_cache.purge_expired() + self.synthesis_cache.purge_expired()
    }

    pub fn shutdown(&self) {
        self.rate.shutdown();
        self.evidence_cache.clear();
        self.synthesis_cache.clear();
    }
}

pub(crate) struct RunHandle {
    pub(crate) run: RwLock<Run>,
    pub(crate) cancel: CancellationToken,
    claimed: AtomicBool,
    /// The last save reached the store.
    saved: AtomicBool,
}

impl RunHandle {
    fn new(run: Run) -> Self {
        Self {
            run: RwLock::new(run),
            cancel: CancellationToken::new(),
            claimed: AtomicBool::new(false),
            saved: AtomicBool::new(false),
        }
    }
}

enum RunEntry {
    Live(Arc<RunHandle>),
    Retired(Box<Run>),
}

pub struct EngineBuilder {
    config: Config,
    registry: SourceRegistry,
    agents: AgentSet,
    generator: Option<Arc<dyn TextGenerator>>,
    store: Option<Arc<dyn RunStore>>,
    services: Option<Arc<EngineServices>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: SourceRegistry::new(),
            agents: AgentSet::standard(),
            generator: None,
            store: None,
            services: None,
        }
    }

    pub fn registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn agents(mut self, agents: AgentSet) -> Self {
        self.agents = agents;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share caches and rate limits with another engine.
    pub fn services(mut self, services: Arc<EngineServices>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn build(self) -> Engine {
        let services = self.services.unwrap_or_else(|| Arc::new(EngineServices::new(&self.config)));
        Engine {
            registry: Arc::new(self.registry),
            agents: self.agents,
            generator: self.generator.unwrap_or_else(|| Arc::new(ExtractiveGenerator::new())),
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryRunStore::new())),
            services,
            config: self.config.engine,
            runs: RwLock::new(HashMap::new()),
        }
    }
}

pub struct Engine {
    pub(crate) registry: Arc<SourceRegistry>,
    pub(crate) agents: AgentSet,
    pub(crate) generator: Arc<dyn TextGenerator>,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) services: Arc<EngineServices>,
    pub(crate) config: EngineConfig,
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    async fn entry(&self, run_id: RunId) -> AppResult<RunEntry> {
        if let Some(handle) = self.runs.read().await.get(&run_id).cloned() {
            return Ok(RunEntry::Live(handle));
        }
        self.store
            .load(run_id)
            .await?
            .map(|run| RunEntry::Retired(Box::new(run)))
            .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))
    }

    /// Number of runs held in memory.
    pub async fn live_runs(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Save a copy of the run; failures are recorded on the run, never raised.
    pub(crate) async fn persist(&self, handle: &RunHandle) {
        let copy = handle.run.read().await.clone();
        match self.store.save(&copy).await {
            Ok(()) => handle.saved.store(true, Ordering::SeqCst),
            Err(e) => {
                warn!(run_id = %copy.id(), error = %e, "Failed to persist run");
                handle.saved.store(false, Ordering::SeqCst);
                handle
                    .run
                    .write()
                    .await
                    .record_issue(RunIssue::new(IssueKind::PersistenceFailure, e.to_string()));
            }
        }
    }

    /// Drop a terminal run from the live table once its final state is saved.
    /// Unsaved runs stay live so their state is not lost.
    async fn retire(&self, run_id: RunId, handle: &RunHandle) {
        if !handle.run.read().await.status().is_terminal() {
            return;
        }
        if !handle.saved.load(Ordering::SeqCst) {
            warn!(run_id = %run_id, "Keeping unsaved terminal run in memory");
            return;
        }
        self.runs.write().await.remove(&run_id);
        debug!(run_id = %run_id, "Run retired from memory");
    }

    pub async fn create_run(&self, intent: Intent) -> AppResult<RunId> {
        let target = intent.resolve_target()?;
        let graph = catalog()
            .get(target.route)
            .ok_or_else(|| AppError::Internal(format!("no graph for route {}", target.route)))?;

        let run = Run::new(intent, target, &graph.layout());
        let run_id = run.id();
        info!(
            run_id = %run_id,
            route = %run.target().route,
            subject = %run.target().subject.label,
            "Run created"
        );

        let handle = Arc::new(RunHandle::new(run));
        self.persist(&handle).await;
        self.runs.write().await.insert(run_id, handle);
        Ok(run_id)
    }

    /// A scheduler accepted the run.
    pub async fn mark_queued(&self, run_id: RunId) -> AppResult<()> {
        let handle = match self.entry(run_id).await? {
            RunEntry::Live(handle) => handle,
            RunEntry::Retired(run) => {
                return Err(AppError::InvalidTransition { from: run.status(), to: RunStatus::Queued })
            }
        };
        {
            let mut run = handle.run.write().await;
            if run.status() == RunStatus::Queued {
                return Ok(());
            }
            run.transition(RunStatus::Queued)?;
        }
        self.persist(&handle).await;
        Ok(())
    }

    /// Drive the run to a terminal state. Calling it again, or while another
    /// caller is driving the run, just returns the current snapshot.
    pub async fn advance(&self, run_id: RunId) -> AppResult<RunSnapshot> {
        let handle = match self.entry(run_id).await? {
            RunEntry::Live(handle) => handle,
            RunEntry::Retired(run) => return Ok(run.snapshot()),
        };
        if handle.claimed.swap(true, Ordering::SeqCst) {
            return Ok(handle.run.read().await.snapshot());
        }

        {
            let mut run = handle.run.write().await;
            if run.status().is_terminal() {
                return Ok(run.snapshot());
            }
            if run.status() == RunStatus::Created {
                run.transition(RunStatus::Queued)?;
            }
            run.transition(RunStatus::Running)?;
        }
        self.persist(&handle).await;
        info!(run_id = %run_id, "Run started");

        Executor::new(self, &handle).execute().await;
        self.retire(run_id, &handle).await;

        let snapshot = handle.run.read().await.snapshot();
        info!(
            run_id = %run_id,
            status = %snapshot.status,
            degraded = snapshot.degraded,
            candidates = snapshot.candidates.len(),
            "Run finished"
        );
        Ok(snapshot)
    }

    pub async fn get_state(&self, run_id: RunId) -> AppResult<RunSnapshot> {
        match self.entry(run_id).await? {
            RunEntry::Live(handle) => Ok(handle.run.read().await.snapshot()),
            RunEntry::Retired(run) => Ok(run.snapshot()),
        }
    }

    /// Request cancellation. Runs that have not started are cancelled on the
    /// spot; a running run stops at its next suspension point.
    pub async fn cancel(&self, run_id: RunId) -> AppResult<RunStatus> {
        let handle = match self.entry(run_id).await? {
            RunEntry::Live(handle) => handle,
            RunEntry::Retired(run) => return Ok(run.status()),
        };
        handle.cancel.cancel();

        let status = {
            let mut run = handle.run.write().await;
            if matches!(run.status(), RunStatus::Created | RunStatus::Queued) {
                run.transition(RunStatus::Cancelled)?;
                run.record_issue(RunIssue::new(IssueKind::RunCancelled, "cancelled before start"));
            }
            run.status()
        };
        if status == RunStatus::Cancelled && !handle.claimed.load(Ordering::SeqCst) {
            self.persist(&handle).await;
            self.retire(run_id, &handle).await;
        }
        info!(run_id = %run_id, status = %status, "Cancellation requested");
        Ok(status)
    }

    /// Cancel every live run and release shared services.
    pub async fn shutdown(&self) {
        for handle in self.runs.read().await.values() {
            handle.cancel.cancel();
        }
        self.services.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentContext, AgentKind, AgentOutput, RetrievalAgent};
    use crate::evidence::{EntityKind, SourceCategory};
    use crate::intent::{ReasoningMode, Route};
    use crate::run::{FailureReason, SkipReason, StageOutcome, StageStatus};
    use crate::sources::{FixtureSource, RawRecord};
    use crate::types::CallFailure;
    use async_trait::async_trait;

    const IBD: &str = "Inflammatory Bowel Disease";

    fn config() -> Config {
        let mut config = Config::default();
        config.engine.retry_base_delay = Duration::from_millis(1);
        config.engine.retry_max_delay = Duration::from_millis(5);
        config
    }

    fn trials(drug: &str, n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                RawRecord::new(drug, EntityKind::Drug)
                    .with("trial_id", format!("NCT-{}-{}", drug, i))
                    .with("phase", "PHASE3")
                    .with("status", "COMPLETED")
                    .with("confidence", 0.9)
            })
            .collect()
    }

    fn ibd_registry(clinical: Arc<FixtureSource>) -> SourceRegistry {
        let ttl = Duration::from_secs(3600);
        let mut records = trials("Tofacitinib", 15);
        records.extend(trials("Vedolizumab", 8));
        let ctgov = Arc::new(FixtureSource::new().with_records(IBD, records));
        SourceRegistry::new()
            .with_source("ctgov", SourceCategory::Clinical, ctgov, ttl)
            .with_source("euctr", SourceCategory::Clinical, clinical, ttl)
            .with_source("pubmed", SourceCategory::Literature, Arc::new(FixtureSource::new()), ttl)
    }

    fn ibd_intent(sources: &[&str]) -> Intent {
        Intent::new(Route::MarketBack)
            .with_field("indication", IBD)
            .with_sources(sources.iter().copied())
    }

    fn stage_outcome(snapshot: &RunSnapshot, agent: AgentKind) -> Option<StageOutcome> {
        snapshot.stages.iter().find(|s| s.agent == agent).and_then(|s| match &s.status {
            StageStatus::Done(result) => Some(result.outcome.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_market_back_ranks_trial_volume_and_flags_missing_dimensions() {
        let engine = Engine::builder(config())
            .registry(ibd_registry(Arc::new(FixtureSource::new())))
            .build();
        let run_id = engine.create_run(ibd_intent(&["ctgov", "pubmed"])).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.candidates.len(), 2);
        assert_eq!(snapshot.candidates[0].entity_id, "tofacitinib");
        assert_eq!(snapshot.candidates[1].entity_id, "vedolizumab");
        assert!(snapshot.candidates.iter().all(|c| c.degraded));
        assert!(snapshot.candidates.iter().all(|c| c.justification.is_some()));
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::SafetyTox),
            Some(StageOutcome::Skipped { reason: SkipReason::NoSelectedSources })
        );
    }

    #[tokio::test]
    async fn test_unregistered_agent_is_skipped_not_left_pending() {
        let engine = Engine::builder(config())
            .registry(ibd_registry(Arc::new(FixtureSource::new())))
            .agents(AgentSet::standard().without(AgentKind::Literature))
            .build();
        let run_id = engine.create_run(ibd_intent(&["ctgov", "pubmed"])).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.degraded);
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::Literature),
            Some(StageOutcome::Skipped { reason: SkipReason::NoImplementation })
        );
        assert_eq!(stage_outcome(&snapshot, AgentKind::ClinicalTrials), Some(StageOutcome::SucceededFully));
        assert!(snapshot.stages.iter().all(|s| s.status != StageStatus::Pending));
        assert_eq!(snapshot.candidates[0].entity_id, "tofacitinib");
    }

    #[tokio::test]
    async fn test_single_failing_source_degrades_but_completes() {
        let down = Arc::new(FixtureSource::new().failing(CallFailure::unavailable("503")));
        let engine = Engine::builder(config()).registry(ibd_registry(down)).build();
        let run_id = engine.create_run(ibd_intent(&["ctgov", "euctr"])).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.degraded);
        assert!(matches!(
            stage_outcome(&snapshot, AgentKind::ClinicalTrials),
            Some(StageOutcome::SucceededPartially { .. })
        ));
        assert!(snapshot.candidates.iter().all(|c| c.degraded));
        assert!(snapshot.issues.iter().any(|i| i.kind == IssueKind::SourceUnavailable));
    }

    #[tokio::test]
    async fn test_whole_stage_failure_fails_run_and_stops_downstream() {
        let down = Arc::new(FixtureSource::new().failing(CallFailure::invalid("bad key")));
        let ttl = Duration::from_secs(60);
        let registry = SourceRegistry::new()
            .with_source("pubmed", SourceCategory::Literature, down.clone(), ttl)
            .with_source("ctgov", SourceCategory::Clinical, down, ttl)
            .with_source("faers", SourceCategory::Safety, Arc::new(FixtureSource::new()), ttl);
        let engine = Engine::builder(config()).registry(registry).build();
        let intent = Intent::new(Route::Debate)
            .with_field("drug_name", "Metformin")
            .with_field("indication", "Glioblastoma")
            .with_sources(["pubmed", "ctgov", "faers"]);
        let run_id = engine.create_run(intent).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.failure.is_some());
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::Literature),
            Some(StageOutcome::Failed { reason: FailureReason::AllSourcesFailed })
        );
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::SafetyTox),
            Some(StageOutcome::Skipped { reason: SkipReason::UpstreamFailed })
        );
        assert!(snapshot.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_empty_source_selection_completes_immediately() {
        let engine = Engine::builder(config()).registry(ibd_registry(Arc::new(FixtureSource::new()))).build();
        let run_id = engine.create_run(ibd_intent(&[])).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.candidates.is_empty());
        assert!(snapshot.issues.is_empty());
        assert!(!snapshot.degraded);
    }

    #[tokio::test]
    async fn test_warm_cache_rerun_is_byte_identical() {
        let engine = Engine::builder(config())
            .registry(ibd_registry(Arc::new(FixtureSource::new())))
            .build();

        let first = engine.create_run(ibd_intent(&["ctgov", "pubmed"])).await.unwrap();
        let first = engine.advance(first).await.unwrap();
        let second = engine.create_run(ibd_intent(&["ctgov", "pubmed"])).await.unwrap();
        let second = engine.advance(second).await.unwrap();

        assert_eq!(
            serde_json::to_string(&first.candidates).unwrap(),
            serde_json::to_string(&second.candidates).unwrap()
        );
    }

    #[tokio::test]
    async fn test_advance_is_idempotent_on_terminal_runs() {
        let engine = Engine::builder(config()).registry(ibd_registry(Arc::new(FixtureSource::new()))).build();
        let run_id = engine.create_run(ibd_intent(&["ctgov"])).await.unwrap();
        engine.mark_queued(run_id).await.unwrap();

        let first = engine.advance(run_id).await.unwrap();
        let again = engine.advance(run_id).await.unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(again.status, RunStatus::Completed);
        assert_eq!(first.completed_at, again.completed_at);
    }

    #[tokio::test]
    async fn test_terminal_run_leaves_memory_but_stays_readable() {
        let clinical = Arc::new(FixtureSource::new());
        let engine = Engine::builder(config()).registry(ibd_registry(clinical.clone())).build();
        let run_id = engine.create_run(ibd_intent(&["ctgov", "euctr"])).await.unwrap();
        assert_eq!(engine.live_runs().await, 1);

        let finished = engine.advance(run_id).await.unwrap();
        assert_eq!(engine.live_runs().await, 0);

        let stored = engine.get_state(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.candidates.len(), finished.candidates.len());
        assert_eq!(stored.completed_at, finished.completed_at);

        let calls = clinical.calls();
        assert!(calls > 0);
        assert_eq!(engine.advance(run_id).await.unwrap().completed_at, finished.completed_at);
        assert_eq!(engine.cancel(run_id).await.unwrap(), RunStatus::Completed);
        assert_eq!(clinical.calls(), calls);
    }

    struct UnwritableStore;

    #[async_trait]
    impl RunStore for UnwritableStore {
        async fn save(&self, _run: &Run) -> AppResult<()> {
            Err(AppError::Persistence("disk full".to_string()))
        }

        async fn load(&self, _run_id: RunId) -> AppResult<Option<Run>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_unsaved_terminal_run_stays_live() {
        let engine = Engine::builder(config())
            .registry(ibd_registry(Arc::new(FixtureSource::new())))
            .store(Arc::new(UnwritableStore))
            .build();
        let run_id = engine.create_run(ibd_intent(&["ctgov"])).await.unwrap();

        engine.advance(run_id).await.unwrap();

        assert_eq!(engine.live_runs().await, 1);
        let snapshot = engine.get_state(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.issues.iter().any(|i| i.kind == IssueKind::PersistenceFailure));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let engine = Engine::builder(config()).build();
        let run_id = engine.create_run(ibd_intent(&["ctgov"])).await.unwrap();

        assert_eq!(engine.cancel(run_id).await.unwrap(), RunStatus::Cancelled);
        let snapshot = engine.advance(run_id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert!(snapshot.stages.iter().all(|s| s.status == StageStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_run_stops_stage_advancement() {
        let slow = Arc::new(
            FixtureSource::new()
                .with_records(IBD, vec![RawRecord::new("IBD paper", EntityKind::Indication).with("title", "x")])
                .with_latency(Duration::from_secs(30)),
        );
        let ttl = Duration::from_secs(60);
        let clinical = Arc::new(FixtureSource::new().with_records(IBD, trials("Tofacitinib", 2)));
        let registry = SourceRegistry::new()
            .with_source("pubmed", SourceCategory::Literature, slow, ttl)
            .with_source("ctgov", SourceCategory::Clinical, clinical.clone(), ttl);
        let engine = Arc::new(Engine::builder(config()).registry(registry).build());
        let run_id = engine.create_run(ibd_intent(&["pubmed", "ctgov"])).await.unwrap();

        let driver = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.advance(run_id).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.get_state(run_id).await.unwrap().status, RunStatus::Running);

        engine.cancel(run_id).await.unwrap();
        let snapshot = driver.await.unwrap().unwrap();

        assert_eq!(snapshot.status, RunStatus::Cancelled);
        // The clinical-trials stage never started.
        assert_eq!(clinical.calls(), 0);
        let clinical_stage = snapshot.stages.iter().find(|s| s.agent == AgentKind::ClinicalTrials).unwrap();
        assert_eq!(clinical_stage.status, StageStatus::Pending);
    }

    struct StuckAgent;

    #[async_trait]
    impl RetrievalAgent for StuckAgent {
        fn kind(&self) -> AgentKind {
            AgentKind::Literature
        }

        async fn fetch(&self, _ctx: AgentContext) -> AgentOutput {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_timeout_is_recorded_and_fails_lone_stage() {
        let mut config = config();
        config.engine.agent_timeout = Duration::from_secs(5);
        let ttl = Duration::from_secs(60);
        let registry = SourceRegistry::new()
            .with_source("pubmed", SourceCategory::Literature, Arc::new(FixtureSource::new()), ttl)
            .with_source("ctgov", SourceCategory::Clinical, Arc::new(FixtureSource::new()), ttl);
        let engine = Engine::builder(config)
            .registry(registry)
            .agents(AgentSet::standard().with_agent(Arc::new(StuckAgent)))
            .build();
        let run_id = engine.create_run(ibd_intent(&["pubmed", "ctgov"])).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::Literature),
            Some(StageOutcome::Failed { reason: FailureReason::Timeout })
        );
        assert!(snapshot.issues.iter().any(|i| i.kind == IssueKind::AgentTimeout));
    }

    #[tokio::test]
    async fn test_exhausted_run_budget_completes_degraded() {
        let mut config = config();
        config.engine.run_budget = Duration::ZERO;
        let engine = Engine::builder(config).registry(ibd_registry(Arc::new(FixtureSource::new()))).build();
        let run_id = engine.create_run(ibd_intent(&["ctgov", "pubmed"])).await.unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();

        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.degraded);
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::ClinicalTrials),
            Some(StageOutcome::Skipped { reason: SkipReason::RunBudgetExhausted })
        );
        assert!(snapshot.issues.iter().any(|i| i.kind == IssueKind::BudgetExhausted));
    }

    #[tokio::test]
    async fn test_low_mode_skips_optional_agents() {
        let ttl = Duration::from_secs(60);
        let registry = ibd_registry(Arc::new(FixtureSource::new()))
            .with_source("fda", SourceCategory::Regulatory, Arc::new(FixtureSource::new()), ttl);
        let engine = Engine::builder(config()).registry(registry).build();
        let run_id = engine
            .create_run(ibd_intent(&["ctgov", "fda"]).with_mode(ReasoningMode::Low))
            .await
            .unwrap();

        let snapshot = engine.advance(run_id).await.unwrap();
        assert_eq!(
            stage_outcome(&snapshot, AgentKind::Regulatory),
            Some(StageOutcome::Skipped { reason: SkipReason::ExcludedByMode })
        );
        let justification = snapshot.candidates[0].justification.as_ref().unwrap();
        assert_eq!(justification.temperature, 0.2);
    }

    #[tokio::test]
    async fn test_unknown_run_and_invalid_intent() {
        let engine = Engine::builder(config()).build();
        assert!(matches!(engine.get_state(RunId::new()).await, Err(AppError::RunNotFound(_))));
        assert!(matches!(
            engine.create_run(Intent::new(Route::MarketBack)).await,
            Err(AppError::InvalidIntent(_))
        ));
    }
}
