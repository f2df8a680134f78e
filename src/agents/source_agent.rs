//! Source Agent
//!
//! The built-in [`RetrievalAgent`]: fans one query per (source, lead) pair out
//! through the shared cache, retry policy and rate controller, then normalizes
//! whatever came back. A failing source only degrades that source.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::normalize::{normalize, NormalizeInput};
use super::{AgentContext, AgentKind, AgentOutput, RetrievalAgent};
use crate::budget::RateController;
use crate::cache::{Cached, Fingerprint, MAX_SHARED_FETCH_RETRIES};
use crate::evidence::{EvidenceItem, SourceId, SubjectRef};
use crate::run::{FailureReason, IssueKind, RunIssue, StageOutcome, StageResult};
use crate::sources::{QueryParams, RawRecord, SourceBinding};
use crate::types::{CallFailure, FailureKind};
use crate::utils::with_retry;
use tokio_util::sync::CancellationToken;

pub struct SourceAgent {
    kind: AgentKind,
}

impl SourceAgent {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }

    fn params(&self, ctx: &AgentContext, lead: &SubjectRef) -> QueryParams {
        let mut params = QueryParams::new();
        params.insert("agent".to_string(), self.kind.as_str().to_string());
        params.insert("lead".to_string(), lead.label.clone());
        params.insert("lead_kind".to_string(), lead.kind.to_string());
        params.insert("subject".to_string(), ctx.target.subject.label.clone());
        if let Some(secondary) = &ctx.target.secondary {
            params.insert("indication".to_string(), secondary.label.clone());
        }
        if let Some(geography) = &ctx.target.geography {
            params.insert("geography".to_string(), geography.clone());
        }
        params.insert("limit".to_string(), ctx.result_cap.to_string());
        params
    }

    /// One cached, retried, rate-limited query.
    async fn query(
        &self,
        ctx: &AgentContext,
        binding: &SourceBinding,
        params: QueryParams,
    ) -> Result<Cached<Vec<RawRecord>>, CallFailure> {
        let fingerprint = Fingerprint::for_query(&binding.id, &params);
        let mut attempts = 0;

        loop {
            let client = binding.client.clone();
            let source = binding.id.clone();
            let params = params.clone();
            let services = ctx.services.clone();
            let cancel = ctx.cancel.clone();

            let result = ctx
                .services
                .evidence_cache
                .get_or_fetch(&fingerprint, binding.ttl, move || async move {
                    let (client, source, params, cancel) = (&client, &source, &params, &cancel);
                    let rate = &services.rate;
                    with_retry(&services.retry, cancel, move || async move {
                        guarded_query(rate, source, &**client, params, cancel).await
                    })
                    .await
                })
                .await;

            match result {
                // The shared fetch belonged to another run that was cancelled.
                Err(failure)
                    if failure.kind == FailureKind::Cancelled
                        && !ctx.cancel.is_cancelled()
                        && attempts < MAX_SHARED_FETCH_RETRIES =>
                {
                    attempts += 1;
                    debug!(source = %binding.id, "Shared fetch was cancelled by its owner, refetching");
                }
                other => return other,
            }
        }
    }
}

async fn guarded_query(
    rate: &RateController,
    source: &SourceId,
    client: &dyn crate::sources::SourceClient,
    params: &QueryParams,
    cancel: &CancellationToken,
) -> Result<Vec<RawRecord>, CallFailure> {
    let _permit = rate.acquire(source, cancel).await?;
    client.query(params, cancel).await
}

#[derive(Default)]
struct SourceTally {
    succeeded: bool,
    failure: Option<CallFailure>,
}

#[async_trait]
impl RetrievalAgent for SourceAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn fetch(&self, ctx: AgentContext) -> AgentOutput {
        let started = Instant::now();
        let agent = self.kind;

        if ctx.leads.is_empty() {
            debug!(run_id = %ctx.run_id, agent = %agent, "No leads to expand");
            return AgentOutput {
                evidence: Vec::new(),
                result: StageResult {
                    agent,
                    outcome: StageOutcome::SucceededFully,
                    evidence_count: 0,
                    sources_succeeded: ctx.sources.iter().map(|s| s.id.clone()).collect(),
                    duration_ms: 0,
                },
                issues: Vec::new(),
            };
        }

        info!(
            run_id = %ctx.run_id,
            agent = %agent,
            sources = ctx.sources.len(),
            leads = ctx.leads.len(),
            "Agent started"
        );

        let pairs: Vec<(&SourceBinding, &SubjectRef)> = ctx
            .sources
            .iter()
            .flat_map(|source| ctx.leads.iter().map(move |lead| (source, lead)))
            .collect();
        let results = join_all(
            pairs
                .iter()
                .map(|(source, lead)| self.query(&ctx, source, self.params(&ctx, lead))),
        )
        .await;

        let mut tallies: BTreeMap<SourceId, SourceTally> = BTreeMap::new();
        let mut per_lead: Vec<Vec<EvidenceItem>> = ctx.leads.iter().map(|_| Vec::new()).collect();

        for (index, ((binding, lead), result)) in pairs.iter().zip(results).enumerate() {
            let tally = tallies.entry(binding.id.clone()).or_default();
            match result {
                Ok(cached) => {
                    tally.succeeded = true;
                    let input = NormalizeInput {
                        agent,
                        source: &binding.id,
                        lead,
                        candidate_kind: ctx.target.candidate_kind,
                        retrieved_at: cached.stored_at,
                        stale: cached.stale,
                    };
                    per_lead[index % ctx.leads.len()].extend(cached.value.iter().filter_map(|record| normalize(&input, record)));
                }
                Err(failure) => {
                    warn!(
                        run_id = %ctx.run_id,
                        agent = %agent,
                        source = %binding.id,
                        lead = %lead.label,
                        error = %failure,
                        "Source query failed"
                    );
                    tally.failure.get_or_insert(failure);
                }
            }
        }

        let mut issues = Vec::new();
        let mut failed_sources = Vec::new();
        let mut sources_succeeded = Vec::new();
        let mut cancelled = false;
        for (source, tally) in &tallies {
            if tally.succeeded {
                sources_succeeded.push(source.clone());
            }
            if let Some(failure) = &tally.failure {
                cancelled |= failure.kind == FailureKind::Cancelled;
                failed_sources.push(source.clone());
                if failure.kind != FailureKind::Cancelled {
                    issues.push(
                        RunIssue::new(failure.kind.into(), failure.message.clone())
                            .for_agent(agent)
                            .for_source(source.clone()),
                    );
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = if sources_succeeded.is_empty() {
            let reason = if cancelled || ctx.cancel.is_cancelled() {
                FailureReason::Cancelled
            } else {
                FailureReason::AllSourcesFailed
            };
            return AgentOutput {
                evidence: Vec::new(),
                result: StageResult::failed(agent, reason, duration_ms),
                issues,
            };
        } else if failed_sources.is_empty() {
            StageOutcome::SucceededFully
        } else {
            StageOutcome::SucceededPartially { failed_sources }
        };

        let collected = subject_counts(per_lead.iter().flatten());
        let mut evidence = interleave(per_lead, ctx.result_cap);
        let granted = ctx.budget.reserve(evidence.len());
        if granted < evidence.len() {
            issues.push(
                RunIssue::new(
                    IssueKind::BudgetExhausted,
                    format!("result budget kept {} of {} items", granted, evidence.len()),
                )
                .for_agent(agent),
            );
            evidence.truncate(granted);
        }

        let kept = subject_counts(evidence.iter());
        for (entity, total) in collected {
            let lost = total - kept.get(&entity).copied().unwrap_or(0);
            if lost > 0 {
                issues.push(
                    RunIssue::new(
                        IssueKind::BudgetExhausted,
                        format!("result cap dropped {} of {} items", lost, total),
                    )
                    .for_agent(agent)
                    .for_entity(entity),
                );
            }
        }

        info!(
            run_id = %ctx.run_id,
            agent = %agent,
            evidence = evidence.len(),
            duration_ms,
            "Agent finished"
        );

        AgentOutput {
            result: StageResult {
                agent,
                outcome,
                evidence_count: evidence.len(),
                sources_succeeded,
                duration_ms,
            },
            evidence,
            issues,
        }
    }
}

/// Takes one item from each lead in turn until `cap` items are chosen, so a
/// lead with many records cannot starve the others.
fn interleave(per_lead: Vec<Vec<EvidenceItem>>, cap: usize) -> Vec<EvidenceItem> {
    let mut lanes: Vec<_> = per_lead.into_iter().map(Vec::into_iter).collect();
    let mut picked = Vec::new();
    while picked.len() < cap {
        let before = picked.len();
        for lane in lanes.iter_mut() {
            if picked.len() == cap {
                break;
            }
            if let Some(item) = lane.next() {
                picked.push(item);
            }
        }
        if picked.len() == before {
            break;
        }
    }
    picked
}

fn subject_counts<'a>(items: impl Iterator<Item = &'a EvidenceItem>) -> BTreeMap<String, usize> {
    items.fold(BTreeMap::new(), |mut counts, item| {
        *counts.entry(item.subject.id.clone()).or_default() += 1;
        counts
    })
}
