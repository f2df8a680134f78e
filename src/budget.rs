//! Rate/Budget Controller
//!
//! Two halves:
//!
//! - **Planning** ([`ModeProfile`], [`ExecutionPlan`]): a pure mapping from
//!   reasoning mode, selected sources and limits to which agents run, how many
//!   results each may keep, and how synthesis is tuned.
//! - **Enforcement** ([`ResultBudget`], [`RateController`]): per-run result
//!   counting and process-wide per-source concurrency and request-rate caps.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agents::AgentKind;
use crate::evidence::SourceId;
use crate::graph::{AgentNode, RouteGraph};
use crate::intent::{Intent, ReasoningMode};
use crate::run::SkipReason;
use crate::sources::{SourceBinding, SourceRegistry};
use crate::types::CallFailure;

/// Synthesis and retrieval depth for one reasoning mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeProfile {
    pub mode: ReasoningMode,
    pub temperature: f32,
    pub include_optional_agents: bool,
    pub per_agent_result_cap: usize,
    pub max_tokens: u32,
    pub evidence_per_justification: usize,
}

impl ModeProfile {
    pub fn for_mode(mode: ReasoningMode) -> Self {
        match mode {
            ReasoningMode::Low => Self {
                mode,
                temperature: 0.2,
                include_optional_agents: false,
                per_agent_result_cap: 10,
                max_tokens: 256,
                evidence_per_justification: 6,
            },
            ReasoningMode::Moderate => Self {
                mode,
                temperature: 0.4,
                include_optional_agents: true,
                per_agent_result_cap: 25,
                max_tokens: 512,
                evidence_per_justification: 10,
            },
            ReasoningMode::High => Self {
                mode,
                temperature: 0.7,
                include_optional_agents: true,
                per_agent_result_cap: 50,
                max_tokens: 1024,
                evidence_per_justification: 16,
            },
        }
    }
}

/// An agent that will run, with the sources it may query.
#[derive(Debug, Clone)]
pub struct PlannedAgent {
    pub node: AgentNode,
    pub sources: Vec<SourceBinding>,
}

/// Which agents run for a run, stage by stage.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Same length as the route graph; a stage may end up empty.
    pub stages: Vec<Vec<PlannedAgent>>,
    pub skipped: Vec<(AgentKind, SkipReason)>,
    pub profile: ModeProfile,
    /// Total evidence items the run may accumulate.
    pub result_budget: usize,
}

impl ExecutionPlan {
    pub fn build(graph: &RouteGraph, intent: &Intent, registry: &SourceRegistry) -> Self {
        let profile = ModeProfile::for_mode(intent.reasoning_mode);
        let mut skipped = Vec::new();
        let mut query_slots = 0;

        let stages = graph
            .stages
            .iter()
            .map(|stage| {
                stage
                    .iter()
                    .filter_map(|node| {
                        if node.optional && !profile.include_optional_agents {
                            skipped.push((node.kind, SkipReason::ExcludedByMode));
                            return None;
                        }
                        let sources = registry.selected(node.kind.category(), &intent.selected_sources);
                        if sources.is_empty() {
                            skipped.push((node.kind, SkipReason::NoSelectedSources));
                            return None;
                        }
                        query_slots += sources.len();
                        Some(PlannedAgent { node: *node, sources })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        Self { stages, skipped, profile, result_budget: query_slots * profile.per_agent_result_cap }
    }

    pub fn agent_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.agent_count() == 0
    }
}

/// Per-run count of evidence items still allowed.
#[derive(Debug)]
pub struct ResultBudget {
    remaining: AtomicUsize,
}

impl ResultBudget {
    pub fn new(total: usize) -> Self {
        Self { remaining: AtomicUsize::new(total) }
    }

    /// Take up to `wanted` items from the budget; returns how many were granted.
    pub fn reserve(&self, wanted: usize) -> usize {
        let mut current = self.remaining.load(Ordering::SeqCst);
        loop {
            let granted = wanted.min(current);
            match self.remaining.compare_exchange(
                current,
                current - granted,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

/// Process-wide per-source concurrency ceiling and optional request quota.
pub struct RateController {
    per_source: usize,
    rate_per_sec: Option<NonZeroU32>,
    slots: Mutex<HashMap<SourceId, Arc<Semaphore>>>,
    limiters: Mutex<HashMap<SourceId, Arc<DefaultDirectRateLimiter>>>,
    generation: Arc<Semaphore>,
}

impl RateController {
    pub fn new(per_source: usize, rate_per_sec: Option<u32>, generation_concurrency: usize) -> Self {
        Self {
            per_source: per_source.max(1),
            rate_per_sec: rate_per_sec.and_then(NonZeroU32::new),
            slots: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            generation: Arc::new(Semaphore::new(generation_concurrency.max(1))),
        }
    }

    fn semaphore(&self, source: &SourceId) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(source.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source)))
            .clone()
    }

    fn limiter(&self, source: &SourceId) -> Option<Arc<DefaultDirectRateLimiter>> {
        let rate = self.rate_per_sec?;
        let mut limiters = self.limiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(
            limiters
                .entry(source.clone())
                .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_second(rate))))
                .clone(),
        )
    }

    /// Wait for a call slot on `source`. The permit releases the slot on drop.
    pub async fn acquire(
        &self,
        source: &SourceId,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, CallFailure> {
        let semaphore = self.semaphore(source);
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(CallFailure::cancelled()),
            permit = semaphore.acquire_owned() => permit
                .map_err(|_| CallFailure::unavailable(format!("{} slots closed", source)))?,
        };

        if let Some(limiter) = self.limiter(source) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CallFailure::cancelled()),
                _ = limiter.until_ready() => {}
            }
        }
        debug!(source = %source, "Acquired source slot");
        Ok(permit)
    }

    /// Wait for a generation slot.
    pub async fn acquire_generation(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, CallFailure> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CallFailure::cancelled()),
            permit = self.generation.clone().acquire_owned() => permit
                .map_err(|_| CallFailure::unavailable("generation slots closed")),
        }
    }

    /// Close every semaphore; pending and future acquisitions fail.
    pub fn shutdown(&self) {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for semaphore in slots.values() {
            semaphore.close();
        }
        self.generation.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::SourceCategory;
    use crate::graph::catalog;
    use crate::intent::Route;
    use crate::sources::FixtureSource;
    use std::time::Duration;

    fn registry() -> SourceRegistry {
        let client = Arc::new(FixtureSource::new());
        let ttl = Duration::from_secs(60);
        SourceRegistry::new()
            .with_source("pubmed", SourceCategory::Literature, client.clone(), ttl)
            .with_source("ctgov", SourceCategory::Clinical, client.clone(), ttl)
            .with_source("fda", SourceCategory::Regulatory, client.clone(), ttl)
            .with_source("uspto", SourceCategory::Patent, client, ttl)
    }

    #[test]
    fn test_low_mode_excludes_optional_agents() {
        let graph = catalog().get(Route::Debate).unwrap();
        let intent = Intent::new(Route::Debate)
            .with_mode(ReasoningMode::Low)
            .with_sources(["pubmed", "ctgov", "fda", "uspto"]);
        let plan = ExecutionPlan::build(&graph, &intent, &registry());

        assert!(plan.skipped.contains(&(AgentKind::Regulatory, SkipReason::ExcludedByMode)));
        assert!(plan.skipped.contains(&(AgentKind::SafetyTox, SkipReason::NoSelectedSources)));
        assert_eq!(plan.agent_count(), 3);
        assert_eq!(plan.result_budget, 3 * 10);

        let intent = intent.with_mode(ReasoningMode::High);
        let plan = ExecutionPlan::build(&graph, &intent, &registry());
        assert_eq!(plan.agent_count(), 4);
        assert_eq!(plan.profile.temperature, 0.7);
    }

    #[test]
    fn test_empty_source_selection_gives_empty_plan() {
        let graph = catalog().get(Route::MarketBack).unwrap();
        let intent = Intent::new(Route::MarketBack).with_field("indication", "IBD");
        let plan = ExecutionPlan::build(&graph, &intent, &registry());
        assert!(plan.is_empty());
        assert_eq!(plan.stages.len(), graph.stages.len());
    }

    #[test]
    fn test_result_budget_never_overdraws() {
        let budget = ResultBudget::new(10);
        assert_eq!(budget.reserve(4), 4);
        assert_eq!(budget.reserve(8), 6);
        assert_eq!(budget.reserve(1), 0);
        assert_eq!(budget.remaining(), 0);
    }

    #[tokio::test]
    async fn test_per_source_ceiling() {
        let controller = RateController::new(2, None, 1);
        let cancel = CancellationToken::new();
        let source = SourceId::new("ctgov");

        let a = controller.acquire(&source, &cancel).await.unwrap();
        let _b = controller.acquire(&source, &cancel).await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(20), controller.acquire(&source, &cancel)).await;
        assert!(third.is_err());

        // Other sources are unaffected.
        controller.acquire(&SourceId::new("pubmed"), &cancel).await.unwrap();

        drop(a);
        controller.acquire(&source, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let controller = RateController::new(1, None, 1);
        let source = SourceId::new("ctgov");
        let _held = controller.acquire(&source, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller.acquire(&source, &cancel).await.unwrap_err();
        assert_eq!(err, CallFailure::cancelled());
    }
}
