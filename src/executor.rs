//! Stage-by-stage execution of one run.
//!
//! Agents of a stage run concurrently; the stage barrier is the only place the
//! run record is written. Before each stage the executor checks cancellation
//! and the wall-clock budget, so no stage starts after either is observed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use futures::future::join_all;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::agents::{AgentContext, AgentOutput, RetrievalAgent};
use crate::budget::{ExecutionPlan, PlannedAgent, ResultBudget};
use crate::engine::{Engine, RunHandle};
use crate::evidence::{EntityKind, EvidenceItem, EvidencePayload, SourceCategory, SubjectRef};
use crate::graph::{catalog, LeadScope};
use crate::intent::RouteTarget;
use crate::ranking::{rank, shortlist_limit, RankingInput, RankingOutcome};
use crate::run::{
    FailureReason, IssueKind, Run, RunIssue, RunStatus, SkipReason, StageOutcome, StageResult,
    StageStatus,
};
use crate::synthesis::{synthesize, SynthesisRequest};

/// Targets named by upstream evidence, strongest first.
pub fn target_leads(evidence: &[EvidenceItem], max: usize) -> Vec<SubjectRef> {
    let mut best: BTreeMap<String, (f64, SubjectRef)> = BTreeMap::new();
    let mut offer = |subject: SubjectRef, weight: f64| {
        let entry = best.entry(subject.id.clone()).or_insert((weight, subject));
        if weight > entry.0 {
            entry.0 = weight;
        }
    };

    for item in evidence {
        let strength = match &item.payload {
            EvidencePayload::TargetAssociation { target, score, .. } => {
                offer(SubjectRef::new(EntityKind::Target, target), item.confidence * score);
                *score
            }
            EvidencePayload::DrugTarget { target, strength, .. } => {
                offer(SubjectRef::new(EntityKind::Target, target), item.confidence * strength);
                *strength
            }
            _ => 0.5,
        };
        if item.subject.kind == EntityKind::Target {
            offer(item.subject.clone(), item.confidence * strength);
        }
    }

    let mut ranked: Vec<(f64, SubjectRef)> = best.into_values().collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    ranked.into_iter().take(max).map(|(_, subject)| subject).collect()
}

/// Categories with a failed source so far.
fn degraded_categories(run: &Run) -> BTreeSet<SourceCategory> {
    run.stages
        .iter()
        .filter_map(|entry| match &entry.status {
            StageStatus::Done(result) => match &result.outcome {
                StageOutcome::SucceededPartially { .. }
                | StageOutcome::Failed { reason: FailureReason::AllSourcesFailed | FailureReason::Timeout } => {
                    Some(entry.agent.category())
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Entities whose evidence a result cap cut short, by category.
fn truncated_entities(run: &Run) -> BTreeMap<String, BTreeSet<SourceCategory>> {
    let mut truncated: BTreeMap<String, BTreeSet<SourceCategory>> = BTreeMap::new();
    for issue in run.issues().iter().filter(|i| i.kind == IssueKind::BudgetExhausted) {
        if let (Some(entity), Some(agent)) = (&issue.entity, issue.agent) {
            truncated.entry(entity.clone()).or_default().insert(agent.category());
        }
    }
    truncated
}

pub(crate) struct Executor<'a> {
    engine: &'a Engine,
    handle: &'a RunHandle,
}

enum StageVerdict {
    Continue,
    Cancelled,
    Failed(String),
}

impl<'a> Executor<'a> {
    pub(crate) fn new(engine: &'a Engine, handle: &'a RunHandle) -> Self {
        Self { engine, handle }
    }

    fn ranked(&self, run: &Run, limit: usize) -> RankingOutcome {
        let degraded = degraded_categories(run);
        let truncated = truncated_entities(run);
        rank(&RankingInput {
            target: run.target(),
            evidence: run.evidence(),
            degraded_categories: &degraded,
            truncated: &truncated,
            strict_fto: run.intent().strict_fto,
            limit,
        })
    }

    fn leads(&self, run: &Run, scope: LeadScope) -> Vec<SubjectRef> {
        match scope {
            LeadScope::Intent => vec![run.target().subject.clone()],
            LeadScope::Targets => target_leads(run.evidence(), run.intent().limits.max_targets as usize),
            LeadScope::Candidates => run
                .candidates()
                .iter()
                .map(|c| SubjectRef::new(c.kind, c.label.clone()))
                .collect(),
        }
    }

    async fn run_agent(&self, agent: Arc<dyn RetrievalAgent>, ctx: AgentContext) -> AgentOutput {
        let kind = agent.kind();
        let started = StdInstant::now();
        let limit = self.engine.config.agent_timeout;
        match timeout(limit, agent.fetch(ctx)).await {
            Ok(output) => output,
            Err(_) => {
                warn!(agent = %kind, timeout_secs = limit.as_secs_f64(), "Agent timed out");
                AgentOutput {
                    evidence: Vec::new(),
                    result: StageResult::failed(kind, FailureReason::Timeout, started.elapsed().as_millis() as u64),
                    issues: vec![RunIssue::new(
                        IssueKind::AgentTimeout,
                        format!("{} exceeded {:.1}s", kind, limit.as_secs_f64()),
                    )
                    .for_agent(kind)],
                }
            }
        }
    }

    async fn run_stage(
        &self,
        index: usize,
        stage: &[PlannedAgent],
        plan: &ExecutionPlan,
        target: &Arc<RouteTarget>,
        budget: &Arc<ResultBudget>,
    ) -> StageVerdict {
        let run_id = self.handle.run.read().await.id();
        let mut jobs = Vec::new();
        {
            let mut run = self.handle.run.write().await;
            for planned in stage {
                let Some(agent) = self.engine.agents.get(planned.node.kind) else {
                    warn!(run_id = %run_id, agent = %planned.node.kind, "No implementation registered");
                    run.set_stage(
                        planned.node.kind,
                        StageStatus::Done(StageResult::skipped(planned.node.kind, SkipReason::NoImplementation)),
                    );
                    continue;
                };
                let leads = self.leads(&run, planned.node.scope);
                run.set_stage(planned.node.kind, StageStatus::Running);
                jobs.push((
                    agent,
                    AgentContext {
                        run_id,
                        target: target.clone(),
                        leads,
                        sources: planned.sources.clone(),
                        result_cap: plan.profile.per_agent_result_cap,
                        budget: budget.clone(),
                        services: self.engine.services.clone(),
                        cancel: self.handle.cancel.clone(),
                    },
                ));
            }
        }
        info!(run_id = %run_id, stage = index, agents = jobs.len(), "Stage started");

        let outputs = join_all(jobs.into_iter().map(|(agent, ctx)| self.run_agent(agent, ctx))).await;

        let all_failed = !outputs.is_empty() && outputs.iter().all(|o| o.result.outcome.is_failed());
        {
            let mut run = self.handle.run.write().await;
            for output in outputs {
                run.append_evidence(output.evidence);
                for issue in output.issues {
                    run.record_issue(issue);
                }
                run.set_stage(output.result.agent, StageStatus::Done(output.result));
            }
            let limit = shortlist_limit(run.target(), &run.intent().limits);
            let provisional = self.ranked(&run, limit).candidates;
            run.candidates = provisional;
            info!(
                run_id = %run_id,
                stage = index,
                evidence = run.evidence().len(),
                candidates = run.candidates.len(),
                "Stage finished"
            );
        }
        self.engine.persist(self.handle).await;

        if self.handle.cancel.is_cancelled() {
            StageVerdict::Cancelled
        } else if all_failed {
            StageVerdict::Failed(format!("every agent in stage {} failed", index))
        } else {
            StageVerdict::Continue
        }
    }

    async fn skip_remaining(&self, plan: &ExecutionPlan, from: usize, reason: SkipReason) {
        let mut run = self.handle.run.write().await;
        for planned in plan.stages.iter().skip(from).flatten() {
            run.set_stage(planned.node.kind, StageStatus::Done(StageResult::skipped(planned.node.kind, reason)));
        }
    }

    async fn finish(&self, status: RunStatus, failure: Option<String>) {
        {
            let mut run = self.handle.run.write().await;
            let degraded = run.stages.iter().any(|entry| match &entry.status {
                StageStatus::Done(result) => result.outcome.degrades_run(),
                _ => false,
            }) || run.issues().iter().any(|i| i.kind == IssueKind::BudgetExhausted);
            run.degraded = degraded;

            if status == RunStatus::Cancelled {
                for entry in run.stages.iter_mut() {
                    if entry.status == StageStatus::Running {
                        entry.status = StageStatus::Done(StageResult::failed(entry.agent, FailureReason::Cancelled, 0));
                    }
                }
                run.record_issue(RunIssue::new(IssueKind::RunCancelled, "cancelled while running"));
            }
            if let Some(reason) = &failure {
                run.record_issue(RunIssue::new(IssueKind::StageFailed, reason.clone()));
            }
            run.failure = failure;
            if let Err(e) = run.transition(status) {
                warn!(run_id = %run.id(), error = %e, "Could not finish run");
            }
        }
        self.engine.persist(self.handle).await;
    }

    pub(crate) async fn execute(self) {
        let (run_id, target, intent) = {
            let run = self.handle.run.read().await;
            (run.id(), run.target().clone(), run.intent().clone())
        };
        let Some(graph) = catalog().get(target.route) else {
            self.finish(RunStatus::Failed, Some(format!("no graph for route {}", target.route))).await;
            return;
        };

        let plan = ExecutionPlan::build(&graph, &intent, &self.engine.registry);
        info!(
            run_id = %run_id,
            route = %target.route,
            mode = %plan.profile.mode,
            agents = plan.agent_count(),
            skipped = plan.skipped.len(),
            result_budget = plan.result_budget,
            "Execution plan ready"
        );
        {
            let mut run = self.handle.run.write().await;
            for (agent, reason) in &plan.skipped {
                run.set_stage(*agent, StageStatus::Done(StageResult::skipped(*agent, *reason)));
            }
        }

        let deadline = Instant::now() + self.engine.config.run_budget;
        let budget = Arc::new(ResultBudget::new(plan.result_budget));
        let target = Arc::new(target);

        for (index, stage) in plan.stages.iter().enumerate() {
            if self.handle.cancel.is_cancelled() {
                self.finish(RunStatus::Cancelled, None).await;
                return;
            }
            if stage.is_empty() {
                continue;
            }
            if Instant::now() >= deadline {
                warn!(run_id = %run_id, stage = index, "Run budget exhausted, skipping remaining stages");
                self.skip_remaining(&plan, index, SkipReason::RunBudgetExhausted).await;
                self.handle.run.write().await.record_issue(RunIssue::new(
                    IssueKind::BudgetExhausted,
                    format!("wall-clock budget exhausted before stage {}", index),
                ));
                break;
            }

            match self.run_stage(index, stage, &plan, &target, &budget).await {
                StageVerdict::Continue => {}
                StageVerdict::Cancelled => {
                    self.finish(RunStatus::Cancelled, None).await;
                    return;
                }
                StageVerdict::Failed(reason) => {
                    warn!(run_id = %run_id, stage = index, "{}", reason);
                    self.skip_remaining(&plan, index + 1, SkipReason::UpstreamFailed).await;
                    self.finish(RunStatus::Failed, Some(reason)).await;
                    return;
                }
            }
        }

        // Final ranking and synthesis.
        let (mut candidates, conflicts, evidence) = {
            let run = self.handle.run.read().await;
            let limit = shortlist_limit(run.target(), &run.intent().limits);
            let outcome = self.ranked(&run, limit);
            (outcome.candidates, outcome.issues, run.evidence().to_vec())
        };
        let synthesis_issues = synthesize(
            self.engine.services.clone(),
            self.engine.generator.clone(),
            &mut candidates,
            SynthesisRequest {
                run_id,
                target: &target,
                profile: plan.profile,
                evidence: &evidence,
                cancel: &self.handle.cancel,
            },
        )
        .await;

        if self.handle.cancel.is_cancelled() {
            self.finish(RunStatus::Cancelled, None).await;
            return;
        }
        {
            let mut run = self.handle.run.write().await;
            run.candidates = candidates;
            for issue in conflicts.into_iter().chain(synthesis_issues) {
                run.record_issue(issue);
            }
        }
        self.finish(RunStatus::Completed, None).await;
    }
}
