//! Evidence Aggregator & Ranker
//!
//! Groups evidence about the route's candidate kind by entity, derives the
//! five sub-scores, combines them into a composite and orders the shortlist.
//!
//! | sub-score          | fed by                         | shape                         |
//! |--------------------|--------------------------------|-------------------------------|
//! | clinical-precedent | clinical trials, regulatory    | `1 - e^(-points/20)`          |
//! | safety             | adverse-event signals          | `e^(-weighted reports/200)`   |
//! | patent-freedom     | patents                        | `e^(-risk/3)`                 |
//! | market-potential   | market sizing                  | `log10(size)/11`, growth-adj. |
//! | mechanistic-fit    | literature, targets, drugs     | noisy-or of item strengths    |
//!
//! Unknown sub-scores sit at the neutral value and mark the candidate
//! degraded. The composite is the weighted mean of the known sub-scores only,
//! so a missing category never drags a candidate down; with nothing known it
//! is the neutral value. For a fixed known set it is non-decreasing in each
//! sub-score.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::evidence::{
    Candidate, ConfidenceLevel, EntityKind, EvidenceItem, EvidencePayload, PatentStatus,
    RegulatoryStatus, SourceCategory, SubScore, SubScoreKind, SubjectRef, TrialStatus,
};
use crate::intent::{ResultLimits, Route, RouteTarget};
use crate::run::{IssueKind, RunIssue};

/// Candidates whose patent-freedom falls below this are dropped under strict FTO.
pub const STRICT_FTO_THRESHOLD: f64 = 0.3;

pub fn composite_score(sub_scores: &BTreeMap<SubScoreKind, SubScore>) -> f64 {
    let (weighted, weights) = SubScoreKind::ALL
        .iter()
        .filter_map(|kind| sub_scores.get(kind).filter(|score| score.known).map(|score| (kind.weight(), score.value)))
        .fold((0.0, 0.0), |(sum, total), (weight, value)| (sum + weight * value, total + weight));

    if weights > 0.0 {
        weighted / weights
    } else {
        SubScore::unknown().value
    }
}

fn clinical_precedent(items: &[&EvidenceItem]) -> Option<(f64, String)> {
    let mut points = 0.0;
    let mut trials = 0;
    let mut completed = 0;
    let mut approvals = 0;
    let mut seen = false;

    for item in items {
        match &item.payload {
            EvidencePayload::ClinicalTrial { phase, status, .. } => {
                seen = true;
                trials += 1;
                if *status == TrialStatus::Completed {
                    completed += 1;
                }
                points += phase.weight() * status.factor();
            }
            EvidencePayload::Regulatory { status, .. } => {
                seen = true;
                points += match status {
                    RegulatoryStatus::Approved => {
                        approvals += 1;
                        6.0
                    }
                    RegulatoryStatus::Designation => 2.0,
                    RegulatoryStatus::Pending => 1.0,
                    RegulatoryStatus::Withdrawn | RegulatoryStatus::Unknown => 0.0,
                };
            }
            _ => {}
        }
    }

    seen.then(|| {
        let mut line = format!("{} clinical trials ({} completed)", trials, completed);
        if approvals > 0 {
            line.push_str(&format!(", {} regulatory approvals", approvals));
        }
        (1.0 - (-points / 20.0_f64).exp(), line)
    })
}

fn safety(items: &[&EvidenceItem]) -> Option<(f64, String)> {
    let mut weighted = 0.0;
    let mut signals = 0;
    let mut serious_total = 0u32;
    for item in items {
        if let EvidencePayload::SafetySignal { reports, serious, .. } = &item.payload {
            signals += 1;
            serious_total += *serious;
            let total = (*reports).max(*serious);
            weighted += (total - *serious) as f64 + 3.0 * f64::from(*serious);
        }
    }
    (signals > 0).then(|| {
        (
            (-weighted / 200.0_f64).exp(),
            format!("{} adverse-event signals, {} serious reports", signals, serious_total),
        )
    })
}

fn patent_freedom(items: &[&EvidenceItem]) -> Option<(f64, String)> {
    let mut risk = 0.0;
    let mut patents = 0;
    let mut active = 0;
    for item in items {
        if let EvidencePayload::Patent { status, expiry_year, litigated, .. } = &item.payload {
            patents += 1;
            let lapsed = expiry_year.is_some_and(|year| year < item.retrieved_year());
            let weight = match status {
                PatentStatus::Active if !lapsed => {
                    active += 1;
                    1.0
                }
                PatentStatus::Active | PatentStatus::Expired => 0.2,
                PatentStatus::Unknown => 0.6,
            };
            risk += weight * if *litigated { 2.0 } else { 1.0 };
        }
    }
    (patents > 0).then(|| ((-risk / 3.0_f64).exp(), format!("{} patents, {} active", patents, active)))
}

fn market_potential(items: &[&EvidenceItem]) -> Option<(f64, String)> {
    items
        .iter()
        .filter_map(|item| match &item.payload {
            EvidencePayload::MarketSizing { market_size_usd, growth_rate, .. } => {
                let base = (market_size_usd.max(1.0).log10() / 11.0).clamp(0.0, 1.0);
                let growth = growth_rate.unwrap_or(0.0).clamp(-0.5, 0.5);
                Some(((base * (1.0 + growth)).clamp(0.0, 1.0), *market_size_usd))
            }
            _ => None,
        })
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(score, size)| (score, format!("market size ${:.1}B", size / 1e9)))
}

fn mechanistic_fit(items: &[&EvidenceItem]) -> Option<(f64, String)> {
    let mut miss = 1.0;
    let mut count = 0;
    for item in items {
        let strength = match &item.payload {
            EvidencePayload::Literature { relevance, .. } => *relevance,
            EvidencePayload::TargetAssociation { score, .. } => *score,
            EvidencePayload::DrugTarget { strength, .. } => *strength,
            _ => continue,
        };
        count += 1;
        miss *= 1.0 - (strength * item.confidence * 0.5).clamp(0.0, 1.0);
    }
    (count > 0).then(|| (1.0 - miss, format!("{} mechanistic evidence items", count)))
}

fn sub_score_for(kind: SubScoreKind, items: &[&EvidenceItem]) -> Option<(f64, String)> {
    let relevant: Vec<&EvidenceItem> =
        items.iter().copied().filter(|item| item.category.feeds() == kind).collect();
    match kind {
        SubScoreKind::ClinicalPrecedent => clinical_precedent(&relevant),
        SubScoreKind::Safety => safety(&relevant),
        SubScoreKind::PatentFreedom => patent_freedom(&relevant),
        SubScoreKind::MarketPotential => market_potential(&relevant),
        SubScoreKind::MechanisticFit => mechanistic_fit(&relevant),
    }
}

fn confidence_level(composite: f64, degraded: bool) -> ConfidenceLevel {
    let level = if composite >= 0.7 {
        ConfidenceLevel::High
    } else if composite >= 0.4 {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    };
    if degraded && level == ConfidenceLevel::High {
        ConfidenceLevel::Medium
    } else {
        level
    }
}

/// How many candidates the route keeps.
pub fn shortlist_limit(target: &RouteTarget, limits: &ResultLimits) -> usize {
    match (target.route, target.candidate_kind) {
        (Route::Debate, _) => 1,
        (_, EntityKind::Indication) => limits.max_new_indications as usize,
        _ => (limits.max_targets * limits.max_drugs_per_target) as usize,
    }
}

pub struct RankingInput<'a> {
    pub target: &'a RouteTarget,
    pub evidence: &'a [EvidenceItem],
    /// Categories with at least one failed source in this run.
    pub degraded_categories: &'a BTreeSet<SourceCategory>,
    /// Entities that lost evidence to a result cap, with the categories cut.
    pub truncated: &'a BTreeMap<String, BTreeSet<SourceCategory>>,
    pub strict_fto: bool,
    pub limit: usize,
}

#[derive(Debug, Default)]
pub struct RankingOutcome {
    pub candidates: Vec<Candidate>,
    pub issues: Vec<RunIssue>,
}

fn is_candidate(target: &RouteTarget, subject: &SubjectRef) -> bool {
    if subject.kind != target.candidate_kind || target.excluded.contains(&subject.id) {
        return false;
    }
    match target.route {
        Route::Debate => subject.id == target.subject.id,
        _ => subject.id != target.subject.id,
    }
}

fn resolve_canonical_id(entity_id: &str, items: &[&EvidenceItem], issues: &mut Vec<RunIssue>) -> Option<String> {
    let distinct: BTreeSet<&str> = items.iter().filter_map(|i| i.canonical_id.as_deref()).collect();
    let best = items
        .iter()
        .filter(|i| i.canonical_id.is_some())
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                // Prefer the lexicographically smaller id on equal confidence.
                .then_with(|| b.canonical_id.cmp(&a.canonical_id))
        })
        .and_then(|i| i.canonical_id.clone());

    if distinct.len() > 1 {
        let chosen = best.clone().unwrap_or_default();
        issues.push(
            RunIssue::new(
                IssueKind::AggregationConflict,
                format!(
                    "sources disagree on identity ({}); kept {} from the most confident source",
                    distinct.into_iter().collect::<Vec<_>>().join(", "),
                    chosen
                ),
            )
            .for_entity(entity_id),
        );
    }
    best
}

/// Drug-level safety and patent evidence applies to every indication an
/// asset-forward run ranks.
fn is_shared(target: &RouteTarget, item: &EvidenceItem) -> bool {
    target.route == Route::AssetForward
        && item.subject.kind == target.subject.kind
        && item.subject.id == target.subject.id
        && matches!(item.category, SourceCategory::Safety | SourceCategory::Patent)
}

pub fn rank(input: &RankingInput<'_>) -> RankingOutcome {
    let mut groups: BTreeMap<&str, Vec<&EvidenceItem>> = BTreeMap::new();
    let mut shared = Vec::new();
    for item in input.evidence {
        if is_candidate(input.target, &item.subject) {
            groups.entry(item.subject.id.as_str()).or_default().push(item);
        } else if is_shared(input.target, item) {
            shared.push(item);
        }
    }
    for items in groups.values_mut() {
        items.extend(shared.iter().copied());
    }

    let mut issues = Vec::new();
    let mut candidates: Vec<Candidate> = groups
        .into_iter()
        .map(|(entity_id, items)| {
            let mut sub_scores = BTreeMap::new();
            let mut rationale = Vec::new();
            let mut degradation = Vec::new();

            for kind in SubScoreKind::ALL {
                let count = items.iter().filter(|i| i.category.feeds() == kind).count();
                match sub_score_for(kind, &items) {
                    Some((value, line)) => {
                        sub_scores.insert(kind, SubScore::known(value, count));
                        rationale.push(format!("{} {:.2}: {}", kind, value, line));
                    }
                    None => {
                        sub_scores.insert(kind, SubScore::unknown());
                        degradation.push(format!("no {} evidence", kind));
                    }
                }
            }
            for category in input.degraded_categories {
                let reason = format!("{} source failure affects {}", category, category.feeds());
                if !degradation.contains(&reason) {
                    degradation.push(reason);
                }
            }
            let cut = [entity_id, input.target.subject.id.as_str()]
                .into_iter()
                .filter(|id| *id == entity_id || input.target.route == Route::AssetForward)
                .filter_map(|id| input.truncated.get(id))
                .flatten();
            for category in cut {
                let reason = format!("{} evidence truncated by result cap", category);
                if !degradation.contains(&reason) {
                    degradation.push(reason);
                }
            }

            let composite = composite_score(&sub_scores);
            let degraded = !degradation.is_empty();
            let canonical_id = resolve_canonical_id(entity_id, &items, &mut issues);

            Candidate {
                entity_id: entity_id.to_string(),
                label: items[0].subject.label.clone(),
                kind: input.target.candidate_kind,
                canonical_id,
                evidence: items.iter().map(|i| i.id.clone()).collect(),
                sub_scores,
                composite,
                rank: 0,
                degraded,
                degradation,
                confidence_level: confidence_level(composite, degraded),
                rationale,
                justification: None,
                earliest_evidence_at: items.iter().map(|i| i.retrieved_at).min(),
            }
        })
        .collect();

    if input.strict_fto {
        let before = candidates.len();
        candidates.retain(|c| {
            let patent = c.sub_score(SubScoreKind::PatentFreedom);
            !(patent.known && patent.value < STRICT_FTO_THRESHOLD)
        });
        debug!(dropped = before - candidates.len(), "Strict FTO filter applied");
    }

    candidates.sort_by(compare_candidates);
    candidates.truncate(input.limit);
    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = index + 1;
    }

    RankingOutcome { candidates, issues }
}

/// Composite desc, then more known sub-scores, then earliest evidence, then id.
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.composite
        .total_cmp(&a.composite)
        .then_with(|| b.known_sub_scores().cmp(&a.known_sub_scores()))
        .then_with(|| match (a.earliest_evidence_at, b.earliest_evidence_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceQuality, SourceId, TrialPhase};
    use crate::intent::Intent;
    use chrono::{TimeZone, Utc};

    fn market_back() -> RouteTarget {
        Intent::new(Route::MarketBack)
            .with_field("indication", "Inflammatory Bowel Disease")
            .resolve_target()
            .unwrap()
    }

    fn trial(drug: &str, n: usize) -> EvidenceItem {
        EvidenceItem::new(
            SourceId::new("ctgov"),
            SourceCategory::Clinical,
            SubjectRef::new(EntityKind::Drug, drug),
            EvidencePayload::ClinicalTrial {
                trial_id: format!("NCT{}-{}", drug, n),
                phase: TrialPhase::Phase3,
                status: TrialStatus::Completed,
                drug: Some(drug.to_string()),
                indication: None,
                enrollment: None,
            },
            0.9,
            EvidenceQuality::Complete,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn patent(drug: &str, n: usize, litigated: bool) -> EvidenceItem {
        EvidenceItem::new(
            SourceId::new("uspto"),
            SourceCategory::Patent,
            SubjectRef::new(EntityKind::Drug, drug),
            EvidencePayload::Patent {
                patent_number: format!("US{}{}", drug, n),
                status: PatentStatus::Active,
                expiry_year: Some(2040),
                litigated,
            },
            0.9,
            EvidenceQuality::Complete,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn rank_all(target: &RouteTarget, evidence: &[EvidenceItem], strict_fto: bool) -> RankingOutcome {
        rank(&RankingInput {
            target,
            evidence,
            degraded_categories: &BTreeSet::new(),
            truncated: &BTreeMap::new(),
            strict_fto,
            limit: 50,
        })
    }

    #[test]
    fn test_composite_is_monotonic_in_each_sub_score() {
        let steps = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        for kind in SubScoreKind::ALL {
            for base in steps {
                let mut previous = f64::MIN;
                for value in steps {
                    let mut scores: BTreeMap<SubScoreKind, SubScore> =
                        SubScoreKind::ALL.iter().map(|k| (*k, SubScore::known(base, 1))).collect();
                    scores.insert(kind, SubScore::known(value, 1));
                    let composite = composite_score(&scores);
                    assert!(composite >= previous, "{} not monotonic", kind);
                    previous = composite;
                }
            }
        }
    }

    #[test]
    fn test_composite_ignores_unknown_sub_scores() {
        let mut strong_single: BTreeMap<SubScoreKind, SubScore> =
            SubScoreKind::ALL.iter().map(|k| (*k, SubScore::unknown())).collect();
        strong_single.insert(SubScoreKind::ClinicalPrecedent, SubScore::known(0.9, 3));
        let uniform: BTreeMap<SubScoreKind, SubScore> =
            SubScoreKind::ALL.iter().map(|k| (*k, SubScore::known(0.7, 1))).collect();

        assert!((composite_score(&strong_single) - 0.9).abs() < 1e-9);
        assert!((composite_score(&uniform) - 0.7).abs() < 1e-9);
        assert!(composite_score(&strong_single) > composite_score(&uniform));
        assert_eq!(composite_score(&BTreeMap::new()), SubScore::unknown().value);

        // Two known of five: clinical 0.35 at 1.0, safety 0.20 at 0.0.
        let mut mixed = strong_single.clone();
        mixed.insert(SubScoreKind::ClinicalPrecedent, SubScore::known(1.0, 1));
        mixed.insert(SubScoreKind::Safety, SubScore::known(0.0, 1));
        assert!((composite_score(&mixed) - 0.35 / 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_composite_is_monotonic_with_unknown_mix() {
        let steps = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        // Every known set that includes the varied kind.
        for mask in 0u32..32 {
            for (index, kind) in SubScoreKind::ALL.iter().enumerate() {
                if mask & (1 << index) == 0 {
                    continue;
                }
                let mut previous = f64::MIN;
                for value in steps {
                    let scores: BTreeMap<SubScoreKind, SubScore> = SubScoreKind::ALL
                        .iter()
                        .enumerate()
                        .map(|(i, k)| {
                            let score = if k == kind {
                                SubScore::known(value, 1)
                            } else if mask & (1 << i) != 0 {
                                SubScore::known(0.4, 1)
                            } else {
                                SubScore::unknown()
                            };
                            (*k, score)
                        })
                        .collect();
                    let composite = composite_score(&scores);
                    assert!(composite >= previous, "{} not monotonic for mask {:05b}", kind, mask);
                    previous = composite;
                }
            }
        }
    }

    #[test]
    fn test_single_strong_category_outranks_uniform_mediocrity() {
        let target = market_back();
        let mut evidence: Vec<EvidenceItem> = (0..40).map(|n| trial("Tofacitinib", n)).collect();
        evidence.extend((0..2).map(|n| trial("Vedolizumab", n)));
        let outcome = rank_all(&target, &evidence, false);

        // Clinical evidence alone sets the composite; nothing else pulls it toward 0.5.
        let top = &outcome.candidates[0];
        assert_eq!(top.entity_id, "tofacitinib");
        let clinical = top.sub_scores[&SubScoreKind::ClinicalPrecedent].value;
        assert!((top.composite - clinical).abs() < 1e-9);
        assert!(top.composite > 0.9);
    }

    #[test]
    fn test_more_trials_rank_first_and_missing_dimensions_degrade() {
        let target = market_back();
        let mut evidence: Vec<EvidenceItem> = (0..8).map(|n| trial("Vedolizumab", n)).collect();
        evidence.extend((0..15).map(|n| trial("Tofacitinib", n)));

        let outcome = rank_all(&target, &evidence, false);

        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].entity_id, "tofacitinib");
        assert_eq!(outcome.candidates[0].rank, 1);
        assert!(outcome.candidates.iter().all(|c| c.degraded));
        assert!(outcome.candidates[0].composite > outcome.candidates[1].composite);
        assert_eq!(outcome.candidates[0].evidence.len(), 15);
    }

    #[test]
    fn test_ties_break_on_known_sub_scores_then_entity_id() {
        let mut scores_a = BTreeMap::new();
        scores_a.insert(SubScoreKind::Safety, SubScore::known(0.5, 1));
        let scores_b: BTreeMap<SubScoreKind, SubScore> = BTreeMap::new();

        let candidate = |id: &str, sub_scores: BTreeMap<SubScoreKind, SubScore>| Candidate {
            entity_id: id.to_string(),
            label: id.to_string(),
            kind: EntityKind::Drug,
            canonical_id: None,
            evidence: vec![],
            composite: composite_score(&sub_scores),
            sub_scores,
            rank: 0,
            degraded: true,
            degradation: vec![],
            confidence_level: ConfidenceLevel::Low,
            rationale: vec![],
            justification: None,
            earliest_evidence_at: None,
        };

        let a = candidate("zeta", scores_a);
        let b = candidate("alpha", scores_b.clone());
        let c = candidate("beta", scores_b);
        assert_eq!(a.composite, b.composite);

        let mut list = vec![c.clone(), b.clone(), a.clone()];
        list.sort_by(compare_candidates);
        let order: Vec<&str> = list.iter().map(|c| c.entity_id.as_str()).collect();
        assert_eq!(order, vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn test_strict_fto_drops_heavily_patented_candidates() {
        let target = market_back();
        let mut evidence = vec![trial("Tofacitinib", 0), trial("Budesonide", 0)];
        evidence.extend((0..3).map(|n| patent("Tofacitinib", n, true)));

        let lenient = rank_all(&target, &evidence, false);
        assert_eq!(lenient.candidates.len(), 2);

        let strict = rank_all(&target, &evidence, true);
        assert_eq!(strict.candidates.len(), 1);
        assert_eq!(strict.candidates[0].entity_id, "budesonide");
    }

    #[test]
    fn test_conflicting_identity_keeps_most_confident() {
        let target = market_back();
        let a = trial("Tofacitinib", 0).with_canonical_id(Some("CHEMBL221959".to_string()));
        let mut b = trial("Tofacitinib", 1).with_canonical_id(Some("DB08895".to_string()));
        b.confidence = 0.5;

        let outcome = rank_all(&target, &[a, b], false);
        assert_eq!(outcome.candidates[0].canonical_id.as_deref(), Some("CHEMBL221959"));
        assert_eq!(outcome.candidates[0].evidence.len(), 2);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].kind, IssueKind::AggregationConflict);
    }

    #[test]
    fn test_degraded_category_marks_candidates() {
        let target = market_back();
        let evidence = vec![trial("Tofacitinib", 0)];
        let degraded: BTreeSet<SourceCategory> = [SourceCategory::Clinical].into_iter().collect();
        let outcome = rank(&RankingInput {
            target: &target,
            evidence: &evidence,
            degraded_categories: &degraded,
            truncated: &BTreeMap::new(),
            strict_fto: false,
            limit: 10,
        });
        assert!(outcome.candidates[0]
            .degradation
            .iter()
            .any(|d| d.contains("clinical source failure")));
    }

    #[test]
    fn test_truncated_entity_is_marked_degraded() {
        let target = market_back();
        let evidence = vec![trial("Tofacitinib", 0), trial("Upadacitinib", 0)];
        let truncated: BTreeMap<String, BTreeSet<SourceCategory>> =
            [("tofacitinib".to_string(), [SourceCategory::Clinical].into_iter().collect())]
                .into_iter()
                .collect();
        let outcome = rank(&RankingInput {
            target: &target,
            evidence: &evidence,
            degraded_categories: &BTreeSet::new(),
            truncated: &truncated,
            strict_fto: false,
            limit: 10,
        });

        let find = |id: &str| outcome.candidates.iter().find(|c| c.entity_id == id).unwrap();
        assert!(find("tofacitinib").degradation.contains(&"clinical evidence truncated by result cap".to_string()));
        assert!(!find("upadacitinib").degradation.iter().any(|d| d.contains("result cap")));
    }

    #[test]
    fn test_drug_safety_applies_to_every_indication() {
        let target = Intent::new(Route::AssetForward)
            .with_field("drug_name", "Sildenafil")
            .with_field("known_indications", "Erectile Dysfunction")
            .resolve_target()
            .unwrap();
        let indication = |label: &str| {
            EvidenceItem::new(
                SourceId::new("opentargets"),
                SourceCategory::Target,
                SubjectRef::new(EntityKind::Indication, label),
                EvidencePayload::TargetAssociation {
                    target: "PDE5A".to_string(),
                    indication: label.to_string(),
                    score: 0.8,
                },
                0.9,
                EvidenceQuality::Complete,
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            )
        };
        let safety = EvidenceItem::new(
            SourceId::new("faers"),
            SourceCategory::Safety,
            SubjectRef::new(EntityKind::Drug, "Sildenafil"),
            EvidencePayload::SafetySignal { event: "headache".to_string(), reports: 20, serious: 0 },
            0.9,
            EvidenceQuality::Complete,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        );
        let evidence = vec![
            indication("Pulmonary Arterial Hypertension"),
            indication("Erectile Dysfunction"),
            indication("Raynaud Phenomenon"),
            safety,
        ];

        let outcome = rank_all(&target, &evidence, false);
        assert_eq!(outcome.candidates.len(), 2);
        for candidate in &outcome.candidates {
            assert!(candidate.sub_score(SubScoreKind::Safety).known);
            assert_ne!(candidate.entity_id, "erectile dysfunction");
        }
    }

    #[test]
    fn test_shortlist_limits() {
        let limits = ResultLimits::default();
        assert_eq!(shortlist_limit(&market_back(), &limits), 50);
        let asset = Intent::new(Route::AssetForward)
            .with_field("drug_name", "Sildenafil")
            .resolve_target()
            .unwrap();
        assert_eq!(shortlist_limit(&asset, &limits), 10);
    }
}
