//! Hybrid Synthesis Layer
//!
//! Attaches a justification to every ranked candidate. The generator only sees
//! the candidate's top evidence (confidence desc, id asc, capped by the
//! reasoning mode), and the justification records exactly those ids. A
//! generation failure never fails the run: the candidate gets the
//! `unavailable` sentinel and the run records a `synthesis_failure` issue.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::budget::ModeProfile;
use crate::cache::{Fingerprint, MAX_SHARED_FETCH_RETRIES};
use crate::engine::EngineServices;
use crate::evidence::{Candidate, EvidenceId, EvidenceItem, Justification, JustificationText};
use crate::intent::RouteTarget;
use crate::llm::{PromptContext, PromptEvidence, TextGenerator};
use crate::run::{IssueKind, RunId, RunIssue};
use crate::types::{CallFailure, FailureKind};
use crate::utils::with_retry;

pub struct SynthesisRequest<'a> {
    pub run_id: RunId,
    pub target: &'a RouteTarget,
    pub profile: ModeProfile,
    pub evidence: &'a [EvidenceItem],
    pub cancel: &'a CancellationToken,
}

/// Top `limit` items backing `candidate`, by confidence desc then id asc.
pub fn select_evidence<'a>(
    candidate: &Candidate,
    index: &HashMap<&EvidenceId, &'a EvidenceItem>,
    limit: usize,
) -> Vec<&'a EvidenceItem> {
    let mut items: Vec<&EvidenceItem> = candidate.evidence.iter().filter_map(|id| index.get(id).copied()).collect();
    items.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then_with(|| a.id.cmp(&b.id)));
    items.truncate(limit);
    items
}

fn prompt_for(target: &RouteTarget, candidate: &Candidate, items: &[&EvidenceItem]) -> PromptContext {
    PromptContext {
        route: target.route.to_string(),
        subject: target.subject.label.clone(),
        candidate: candidate.label.clone(),
        composite: candidate.composite,
        rationale: candidate.rationale.clone(),
        evidence: items.iter().map(|item| PromptEvidence::from_item(item)).collect(),
    }
}

async fn generate_cached(
    services: Arc<EngineServices>,
    generator: Arc<dyn TextGenerator>,
    prompt: PromptContext,
    profile: ModeProfile,
    cancel: CancellationToken,
) -> Result<String, CallFailure> {
    let key = format!(
        "{}|{}|{}|{}",
        generator.name(),
        profile.temperature,
        profile.max_tokens,
        prompt.render()
    );
    let fingerprint = Fingerprint::for_bytes("synthesis", key.as_bytes());
    let ttl = services.synthesis_ttl;
    let mut attempts = 0;

    loop {
        let producer_services = services.clone();
        let generator = generator.clone();
        let prompt = prompt.clone();
        let producer_cancel = cancel.clone();

        let result = services
            .synthesis_cache
            .get_or_fetch(&fingerprint, ttl, move || async move {
                let (services, generator, prompt, cancel) =
                    (&producer_services, &generator, &prompt, &producer_cancel);
                let _permit = services.rate.acquire_generation(cancel).await?;
                with_retry(&services.retry, cancel, move || async move {
                    generator.generate(prompt, profile.temperature, profile.max_tokens, cancel).await
                })
                .await
            })
            .await;

        match result {
            // Joined a generation that another run cancelled.
            Err(failure)
                if failure.kind == FailureKind::Cancelled
                    && !cancel.is_cancelled()
                    && attempts < MAX_SHARED_FETCH_RETRIES =>
            {
                attempts += 1;
                debug!(fingerprint = %fingerprint, "Shared generation was cancelled by its owner, regenerating");
            }
            other => return other.map(|cached| cached.value),
        }
    }
}

/// Fill in `justification` on every candidate. Returns the issues to record.
pub async fn synthesize(
    services: Arc<EngineServices>,
    generator: Arc<dyn TextGenerator>,
    candidates: &mut [Candidate],
    request: SynthesisRequest<'_>,
) -> Vec<RunIssue> {
    let index: HashMap<&EvidenceId, &EvidenceItem> = request.evidence.iter().map(|e| (&e.id, e)).collect();
    let limit = request.profile.evidence_per_justification;

    let jobs: Vec<(Vec<EvidenceId>, PromptContext)> = candidates
        .iter()
        .map(|candidate| {
            let items = select_evidence(candidate, &index, limit);
            let ids = items.iter().map(|item| item.id.clone()).collect();
            (ids, prompt_for(request.target, candidate, &items))
        })
        .collect();

    let results = join_all(jobs.iter().map(|(_, prompt)| {
        generate_cached(
            services.clone(),
            generator.clone(),
            prompt.clone(),
            request.profile,
            request.cancel.clone(),
        )
    }))
    .await;

    let mut issues = Vec::new();
    for ((candidate, (evidence_ids, _)), result) in candidates.iter_mut().zip(jobs).zip(results) {
        let text = match result {
            Ok(text) => JustificationText::Generated(text),
            Err(failure) => {
                if !request.cancel.is_cancelled() {
                    warn!(
                        run_id = %request.run_id,
                        candidate = %candidate.entity_id,
                        error = %failure,
                        "Justification unavailable"
                    );
                    issues.push(
                        RunIssue::new(IssueKind::SynthesisFailure, failure.to_string())
                            .for_entity(candidate.entity_id.clone()),
                    );
                }
                JustificationText::Unavailable
            }
        };
        candidate.justification = Some(Justification {
            text,
            evidence_ids,
            temperature: request.profile.temperature,
        });
    }

    debug!(run_id = %request.run_id, candidates = candidates.len(), failures = issues.len(), "Synthesis finished");
    issues
}
