//! Evidence Schema & Candidate Model
//!
//! Every retrieval agent normalizes what it finds into [`EvidenceItem`]s; the
//! ranker and the synthesis layer only ever read these shapes, never raw
//! source payloads.
//!
//! ```text
//! RawRecord ──normalize──▶ EvidenceItem ──group by subject──▶ Candidate
//!                              │                                  │
//!                              └──── evidence ids ◀───────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of an external data source (e.g. `clinicaltrials`, `pubmed`).
///
/// Always lowercase and trimmed so that intents and registrations agree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        SourceId::new(s)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        SourceId::new(s)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability a source (and the agent that queries it) provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Literature,
    Target,
    Drug,
    Clinical,
    Safety,
    Patent,
    Regulatory,
    Market,
}

impl SourceCategory {
    pub const ALL: [SourceCategory; 8] = [
        SourceCategory::Literature,
        SourceCategory::Target,
        SourceCategory::Drug,
        SourceCategory::Clinical,
        SourceCategory::Safety,
        SourceCategory::Patent,
        SourceCategory::Regulatory,
        SourceCategory::Market,
    ];

    /// The sub-score this category's evidence contributes to.
    pub fn feeds(self) -> SubScoreKind {
        match self {
            SourceCategory::Literature | SourceCategory::Target | SourceCategory::Drug => {
                SubScoreKind::MechanisticFit
            }
            SourceCategory::Clinical | SourceCategory::Regulatory => SubScoreKind::ClinicalPrecedent,
            SourceCategory::Safety => SubScoreKind::Safety,
            SourceCategory::Patent => SubScoreKind::PatentFreedom,
            SourceCategory::Market => SubScoreKind::MarketPotential,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceCategory::Literature => "literature",
            SourceCategory::Target => "target",
            SourceCategory::Drug => "drug",
            SourceCategory::Clinical => "clinical",
            SourceCategory::Safety => "safety",
            SourceCategory::Patent => "patent",
            SourceCategory::Regulatory => "regulatory",
            SourceCategory::Market => "market",
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Drug,
    Indication,
    Target,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Drug => write!(f, "drug"),
            EntityKind::Indication => write!(f, "indication"),
            EntityKind::Target => write!(f, "target"),
        }
    }
}

/// Collapse whitespace and lowercase, so "Inflammatory  Bowel Disease" and
/// "inflammatory bowel disease" name the same entity.
pub fn normalize_entity_id(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// What a piece of evidence is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub kind: EntityKind,
    /// Normalized identifier, see [`normalize_entity_id`].
    pub id: String,
    /// Human-readable name as first seen.
    pub label: String,
}

impl SubjectRef {
    pub fn new(kind: EntityKind, label: impl Into<String>) -> Self {
        let label = label.into();
        Self { kind, id: normalize_entity_id(&label), label: label.trim().to_string() }
    }
}

/// Content-addressed evidence identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceId(String);

impl EvidenceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn derive(
        source: &SourceId,
        category: SourceCategory,
        subject: &SubjectRef,
        payload: &EvidencePayload,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(category.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(subject.kind.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(subject.id.as_bytes());
        hasher.update(b"|");
        // Payload serialization is deterministic: struct fields in declaration order.
        hasher.update(serde_json::to_vec(payload).unwrap_or_default());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..32].to_string())
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    EarlyPhase1,
    Phase1,
    Phase2,
    Phase3,
    Phase4,
    Unknown,
}

impl TrialPhase {
    /// Accepts registry spellings such as `PHASE3`, `Phase 2/Phase 3`, `phase_2`.
    /// Combined phases resolve to the later one.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("early") {
            return TrialPhase::EarlyPhase1;
        }
        let highest = lower
            .chars()
            .filter_map(|c| c.to_digit(10))
            .filter(|d| (1..=4).contains(d))
            .max();
        match highest {
            Some(1) => TrialPhase::Phase1,
            Some(2) => TrialPhase::Phase2,
            Some(3) => TrialPhase::Phase3,
            Some(4) => TrialPhase::Phase4,
            _ => TrialPhase::Unknown,
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            TrialPhase::EarlyPhase1 => 0.5,
            TrialPhase::Phase1 => 1.0,
            TrialPhase::Phase2 => 2.0,
            TrialPhase::Phase3 => 3.0,
            TrialPhase::Phase4 => 4.0,
            TrialPhase::Unknown => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    Active,
    Recruiting,
    Terminated,
    Withdrawn,
    Unknown,
}

impl TrialStatus {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase().replace(['_', '-'], " ");
        if lower.contains("completed") {
            TrialStatus::Completed
        } else if lower.contains("active not recruiting") || lower.contains("active, not recruiting") {
            TrialStatus::Active
        } else if lower.contains("not yet recruiting") || lower.contains("recruiting") || lower.contains("enrolling") {
            TrialStatus::Recruiting
        } else if lower.contains("active") {
            TrialStatus::Active
        } else if lower.contains("terminated") || lower.contains("suspended") {
            TrialStatus::Terminated
        } else if lower.contains("withdrawn") {
            TrialStatus::Withdrawn
        } else {
            TrialStatus::Unknown
        }
    }

    pub fn factor(self) -> f64 {
        match self {
            TrialStatus::Completed => 1.0,
            TrialStatus::Active | TrialStatus::Recruiting => 0.7,
            TrialStatus::Unknown => 0.5,
            TrialStatus::Terminated | TrialStatus::Withdrawn => 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatentStatus {
    Active,
    Expired,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulatoryStatus {
    Approved,
    Designation,
    Pending,
    Withdrawn,
    Unknown,
}

/// Typed, normalized content of one evidence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidencePayload {
    Literature {
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pmid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        year: Option<i32>,
        /// Relevance to the subject in `[0,1]`.
        relevance: f64,
    },
    TargetAssociation {
        target: String,
        indication: String,
        score: f64,
    },
    DrugTarget {
        drug: String,
        target: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mechanism: Option<String>,
        strength: f64,
    },
    ClinicalTrial {
        trial_id: String,
        phase: TrialPhase,
        status: TrialStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        drug: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        indication: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        enrollment: Option<u32>,
    },
    SafetySignal {
        event: String,
        reports: u32,
        serious: u32,
    },
    Patent {
        patent_number: String,
        status: PatentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        expiry_year: Option<i32>,
        litigated: bool,
    },
    Regulatory {
        agency: String,
        status: RegulatoryStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        indication: Option<String>,
    },
    MarketSizing {
        market_size_usd: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        growth_rate: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        geography: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceQuality {
    Complete,
    /// Some optional fields were missing in the source record.
    Partial,
}

/// One normalized, source-attributed fact. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: EvidenceId,
    pub source: SourceId,
    pub category: SourceCategory,
    pub subject: SubjectRef,
    pub payload: EvidencePayload,
    pub retrieved_at: DateTime<Utc>,
    pub confidence: f64,
    pub quality: EvidenceQuality,
    /// Served from cache past the soft-freshness threshold.
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
}

impl EvidenceItem {
    pub fn new(
        source: SourceId,
        category: SourceCategory,
        subject: SubjectRef,
        payload: EvidencePayload,
        confidence: f64,
        quality: EvidenceQuality,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        let id = EvidenceId::derive(&source, category, &subject, &payload);
        Self {
            id,
            source,
            category,
            subject,
            payload,
            retrieved_at,
            confidence: confidence.clamp(0.0, 1.0),
            quality,
            stale: false,
            canonical_id: None,
        }
    }

    pub fn with_canonical_id(mut self, canonical_id: Option<String>) -> Self {
        self.canonical_id = canonical_id;
        self
    }

    pub fn mark_stale(mut self, stale: bool) -> Self {
        self.stale = stale;
        self
    }

    pub fn retrieved_year(&self) -> i32 {
        self.retrieved_at.year()
    }
}

/// Named sub-scores the ranker computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubScoreKind {
    ClinicalPrecedent,
    Safety,
    PatentFreedom,
    MarketPotential,
    MechanisticFit,
}

impl SubScoreKind {
    pub const ALL: [SubScoreKind; 5] = [
        SubScoreKind::ClinicalPrecedent,
        SubScoreKind::Safety,
        SubScoreKind::PatentFreedom,
        SubScoreKind::MarketPotential,
        SubScoreKind::MechanisticFit,
    ];

    /// Composite weight. Weights sum to 1.0.
    pub fn weight(self) -> f64 {
        match self {
            SubScoreKind::ClinicalPrecedent => 0.35,
            SubScoreKind::Safety => 0.20,
            SubScoreKind::PatentFreedom => 0.15,
            SubScoreKind::MarketPotential => 0.15,
            SubScoreKind::MechanisticFit => 0.15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubScoreKind::ClinicalPrecedent => "clinical-precedent",
            SubScoreKind::Safety => "safety",
            SubScoreKind::PatentFreedom => "patent-freedom",
            SubScoreKind::MarketPotential => "market-potential",
            SubScoreKind::MechanisticFit => "mechanistic-fit",
        }
    }
}

impl fmt::Display for SubScoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const NEUTRAL_SUB_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScore {
    pub value: f64,
    /// False when no evidence fed this sub-score; `value` is then neutral.
    pub known: bool,
    pub evidence_count: usize,
}

impl SubScore {
    pub fn known(value: f64, evidence_count: usize) -> Self {
        Self { value: value.clamp(0.0, 1.0), known: true, evidence_count }
    }

    pub fn unknown() -> Self {
        Self { value: NEUTRAL_SUB_SCORE, known: false, evidence_count: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum JustificationText {
    Generated(String),
    /// Generation failed after retries.
    Unavailable,
}

/// Narrative attached to a candidate, with the exact evidence it was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Justification {
    pub text: JustificationText,
    pub evidence_ids: Vec<EvidenceId>,
    pub temperature: f32,
}

/// A ranked entity (drug or indication) and the evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub entity_id: String,
    pub label: String,
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,
    pub evidence: Vec<EvidenceId>,
    pub sub_scores: BTreeMap<SubScoreKind, SubScore>,
    pub composite: f64,
    pub rank: usize,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradation: Vec<String>,
    pub confidence_level: ConfidenceLevel,
    #[serde(default)]
    pub rationale: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<Justification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_evidence_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn known_sub_scores(&self) -> usize {
        self.sub_scores.values().filter(|s| s.known).count()
    }

    pub fn sub_score(&self, kind: SubScoreKind) -> SubScore {
        self.sub_scores.get(&kind).copied().unwrap_or_else(SubScore::unknown)
    }
}
