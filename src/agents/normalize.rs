// Raw record -> EvidenceItem mapping, one shape per agent kind.
// Records missing an identity field are dropped; records missing optional
// fields are kept with quality = partial.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::AgentKind;
use crate::evidence::{
    EntityKind, EvidenceItem, EvidencePayload, EvidenceQuality, PatentStatus, RegulatoryStatus,
    SourceId, SubjectRef, TrialPhase, TrialStatus,
};
use crate::sources::RawRecord;

const DEFAULT_CONFIDENCE: f64 = 0.7;
const DEFAULT_STRENGTH: f64 = 0.5;

pub struct NormalizeInput<'a> {
    pub agent: AgentKind,
    pub source: &'a SourceId,
    /// What was queried.
    pub lead: &'a SubjectRef,
    /// Kind of entity the run ranks.
    pub candidate_kind: EntityKind,
    pub retrieved_at: DateTime<Utc>,
    pub stale: bool,
}

impl NormalizeInput<'_> {
    fn default_subject_kind(&self) -> EntityKind {
        match self.agent {
            AgentKind::TargetDiscovery if self.lead.kind == EntityKind::Target => self.candidate_kind,
            AgentKind::TargetDiscovery => EntityKind::Target,
            AgentKind::DrugCandidate => EntityKind::Drug,
            _ => self.candidate_kind,
        }
    }

    fn subject(&self, record: &RawRecord) -> SubjectRef {
        match record.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(label) => {
                SubjectRef::new(record.subject_kind.unwrap_or_else(|| self.default_subject_kind()), label)
            }
            None => self.lead.clone(),
        }
    }
}

/// Track whether any optional field fell back to a default.
struct Partial(bool);

impl Partial {
    fn or<T>(&mut self, value: Option<T>, default: T) -> T {
        value.unwrap_or_else(|| {
            self.0 = true;
            default
        })
    }
}

fn regulatory_status(raw: &str) -> RegulatoryStatus {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("withdrawn") || lower.contains("revoked") {
        RegulatoryStatus::Withdrawn
    } else if lower.contains("approved") || lower.contains("authori") {
        RegulatoryStatus::Approved
    } else if lower.contains("orphan") || lower.contains("breakthrough") || lower.contains("fast track") || lower.contains("designation") {
        RegulatoryStatus::Designation
    } else if lower.contains("pending") || lower.contains("review") || lower.contains("submitted") {
        RegulatoryStatus::Pending
    } else {
        RegulatoryStatus::Unknown
    }
}

fn patent_status(raw: &str) -> PatentStatus {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("expired") || lower.contains("lapsed") {
        PatentStatus::Expired
    } else if lower.contains("active") || lower.contains("granted") || lower.contains("in force") {
        PatentStatus::Active
    } else {
        PatentStatus::Unknown
    }
}

fn label_if(subject: &SubjectRef, kind: EntityKind) -> Option<String> {
    (subject.kind == kind).then(|| subject.label.clone())
}

pub fn normalize(input: &NormalizeInput<'_>, record: &RawRecord) -> Option<EvidenceItem> {
    let subject = input.subject(record);
    let mut partial = Partial(false);

    let payload = match input.agent {
        AgentKind::Literature => EvidencePayload::Literature {
            title: record.str_field("title")?.to_string(),
            pmid: record.str_field("pmid").map(str::to_string),
            year: record.i32_field("year"),
            relevance: partial.or(record.f64_field("relevance"), DEFAULT_STRENGTH).clamp(0.0, 1.0),
        },
        AgentKind::TargetDiscovery => {
            let target = record
                .str_field("target")
                .map(str::to_string)
                .or_else(|| label_if(&subject, EntityKind::Target))
                .or_else(|| label_if(input.lead, EntityKind::Target))?;
            let indication = record
                .str_field("indication")
                .map(str::to_string)
                .or_else(|| label_if(&subject, EntityKind::Indication))
                .or_else(|| label_if(input.lead, EntityKind::Indication))?;
            EvidencePayload::TargetAssociation {
                target,
                indication,
                score: partial.or(record.f64_field("score"), DEFAULT_STRENGTH).clamp(0.0, 1.0),
            }
        }
        AgentKind::DrugCandidate => {
            let drug = record
                .str_field("drug")
                .map(str::to_string)
                .or_else(|| label_if(&subject, EntityKind::Drug))?;
            let target = record
                .str_field("target")
                .map(str::to_string)
                .or_else(|| label_if(input.lead, EntityKind::Target))?;
            let strength = record.f64_field("strength").or_else(|| record.f64_field("score"));
            EvidencePayload::DrugTarget {
                drug,
                target,
                mechanism: record.str_field("mechanism").map(str::to_string),
                strength: partial.or(strength, DEFAULT_STRENGTH).clamp(0.0, 1.0),
            }
        }
        AgentKind::ClinicalTrials => {
            let trial_id = record.str_field("trial_id").or_else(|| record.str_field("nct_id"))?;
            let phase = record.str_field("phase").map(TrialPhase::parse);
            let status = record.str_field("status").map(TrialStatus::parse);
            EvidencePayload::ClinicalTrial {
                trial_id: trial_id.to_string(),
                phase: partial.or(phase, TrialPhase::Unknown),
                status: partial.or(status, TrialStatus::Unknown),
                drug: record.str_field("drug").map(str::to_string).or_else(|| label_if(&subject, EntityKind::Drug)),
                indication: record
                    .str_field("indication")
                    .or_else(|| record.str_field("condition"))
                    .map(str::to_string),
                enrollment: record.u32_field("enrollment"),
            }
        }
        AgentKind::SafetyTox => {
            let event = record.str_field("event").or_else(|| record.str_field("reaction"))?;
            EvidencePayload::SafetySignal {
                event: event.to_string(),
                reports: partial.or(record.u32_field("reports"), 0),
                serious: record.u32_field("serious").unwrap_or(0),
            }
        }
        AgentKind::Patent => {
            let patent_number = record.str_field("patent_number").or_else(|| record.str_field("number"))?;
            let status = record.str_field("status").map(patent_status);
            EvidencePayload::Patent {
                patent_number: patent_number.to_string(),
                status: partial.or(status, PatentStatus::Unknown),
                expiry_year: record.i32_field("expiry_year"),
                litigated: record.bool_field("litigated").unwrap_or(false),
            }
        }
        AgentKind::Regulatory => {
            let status = record.str_field("status").map(regulatory_status);
            let agency = record.str_field("agency").map(str::to_string);
            if status.is_none() && agency.is_none() {
                debug!(source = %input.source, "Dropping regulatory record without status or agency");
                return None;
            }
            EvidencePayload::Regulatory {
                agency: partial.or(agency, "unknown".to_string()),
                status: partial.or(status, RegulatoryStatus::Unknown),
                indication: record.str_field("indication").map(str::to_string),
            }
        }
        AgentKind::Market => EvidencePayload::MarketSizing {
            market_size_usd: record.f64_field("market_size_usd").filter(|v| *v >= 0.0)?,
            growth_rate: record.f64_field("growth_rate"),
            geography: record.str_field("geography").map(str::to_string),
        },
    };

    let quality = if partial.0 { EvidenceQuality::Partial } else { EvidenceQuality::Complete };
    let confidence = record.f64_field("confidence").unwrap_or(DEFAULT_CONFIDENCE);

    Some(
        EvidenceItem::new(
            input.source.clone(),
            input.agent.category(),
            subject,
            payload,
            confidence,
            quality,
            input.retrieved_at,
        )
        .with_canonical_id(record.str_field("canonical_id").map(str::to_string))
        .mark_stale(input.stale),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(agent: AgentKind, source: &'a SourceId, lead: &'a SubjectRef) -> NormalizeInput<'a> {
        NormalizeInput {
            agent,
            source,
            lead,
            candidate_kind: EntityKind::Drug,
            retrieved_at: Utc::now(),
            stale: false,
        }
    }

    #[test]
    fn test_clinical_trial_record() {
        let source = SourceId::new("ctgov");
        let lead = SubjectRef::new(EntityKind::Indication, "Inflammatory Bowel Disease");
        let record = RawRecord::new("Tofacitinib", EntityKind::Drug)
            .with("trial_id", "NCT01465763")
            .with("phase", "PHASE3")
            .with("status", "COMPLETED")
            .with("confidence", 0.9);

        let item = normalize(&input(AgentKind::ClinicalTrials, &source, &lead), &record).unwrap();
        assert_eq!(item.subject.id, "tofacitinib");
        assert_eq!(item.quality, EvidenceQuality::Complete);
        assert_eq!(item.confidence, 0.9);
        match item.payload {
            EvidencePayload::ClinicalTrial { phase, status, .. } => {
                assert_eq!(phase, TrialPhase::Phase3);
                assert_eq!(status, TrialStatus::Completed);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_missing_optional_fields_mark_partial() {
        let source = SourceId::new("ctgov");
        let lead = SubjectRef::new(EntityKind::Drug, "Tofacitinib");
        let mut record = RawRecord::new("x", EntityKind::Drug).with("trial_id", "NCT1");
        record.subject = None;

        let item = normalize(&input(AgentKind::ClinicalTrials, &source, &lead), &record).unwrap();
        assert_eq!(item.quality, EvidenceQuality::Partial);
        // No subject on the record: the lead is the subject.
        assert_eq!(item.subject, lead);
    }

    #[test]
    fn test_record_without_identity_is_dropped() {
        let source = SourceId::new("faers");
        let lead = SubjectRef::new(EntityKind::Drug, "Tofacitinib");
        let record = RawRecord::new("Tofacitinib", EntityKind::Drug).with("reports", 12);
        assert!(normalize(&input(AgentKind::SafetyTox, &source, &lead), &record).is_none());
    }

    #[test]
    fn test_target_discovery_subject_kind_follows_lead() {
        let source = SourceId::new("opentargets");
        let indication = SubjectRef::new(EntityKind::Indication, "IBD");
        let mut record = RawRecord::new("JAK1", EntityKind::Target).with("score", 0.8);
        record.subject_kind = None;

        let item = normalize(&input(AgentKind::TargetDiscovery, &source, &indication), &record).unwrap();
        assert_eq!(item.subject.kind, EntityKind::Target);
        assert!(matches!(
            item.payload,
            EvidencePayload::TargetAssociation { ref target, ref indication, .. }
                if target == "JAK1" && indication == "IBD"
        ));
    }

    #[test]
    fn test_status_keywords() {
        assert_eq!(regulatory_status("Orphan Drug Designation"), RegulatoryStatus::Designation);
        assert_eq!(regulatory_status("APPROVED"), RegulatoryStatus::Approved);
        assert_eq!(patent_status("Expired - fee related"), PatentStatus::Expired);
        assert_eq!(patent_status("granted"), PatentStatus::Active);
    }
}
