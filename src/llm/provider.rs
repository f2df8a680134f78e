use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::evidence::{EvidenceId, EvidenceItem, EvidencePayload, SourceId};
use crate::types::CallFailure;

/// Produces the narrative for one candidate from a bounded prompt context.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Stable name, part of the synthesis cache key.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &PromptContext,
        temperature: f32,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, CallFailure>;
}

/// One evidence item as shown to the generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptEvidence {
    pub id: EvidenceId,
    pub source: SourceId,
    pub summary: String,
}

impl PromptEvidence {
    pub fn from_item(item: &EvidenceItem) -> Self {
        Self { id: item.id.clone(), source: item.source.clone(), summary: summarize(&item.payload) }
    }
}

/// Everything the generator may see about one candidate. Nothing else is sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptContext {
    pub route: String,
    pub subject: String,
    pub candidate: String,
    pub composite: f64,
    pub rationale: Vec<String>,
    pub evidence: Vec<PromptEvidence>,
}

pub const SYSTEM_PROMPT: &str = "You write short justifications for drug-repurposing shortlists. \
Use only the evidence listed in the prompt and cite each claim with its evidence id in square brackets. \
Do not introduce facts that are not in the evidence.";

impl PromptContext {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Route: {}\nSubject: {}\nCandidate: {} (composite {:.3})\n",
            self.route, self.subject, self.candidate, self.composite
        );
        if !self.rationale.is_empty() {
            out.push_str("Scores:\n");
            for line in &self.rationale {
                out.push_str(&format!("- {}\n", line));
            }
        }
        out.push_str("Evidence:\n");
        for item in &self.evidence {
            out.push_str(&format!("[{}] ({}) {}\n", item.id, item.source, item.summary));
        }
        out.push_str("\nExplain in 2-4 sentences why this candidate is ranked where it is.");
        out
    }
}

pub fn summarize(payload: &EvidencePayload) -> String {
    match payload {
        EvidencePayload::Literature { title, year, .. } => match year {
            Some(year) => format!("publication \"{}\" ({})", title, year),
            None => format!("publication \"{}\"", title),
        },
        EvidencePayload::TargetAssociation { target, indication, score } => {
            format!("{} associated with {} (score {:.2})", target, indication, score)
        }
        EvidencePayload::DrugTarget { drug, target, mechanism, .. } => match mechanism {
            Some(mechanism) => format!("{} acts on {} as {}", drug, target, mechanism),
            None => format!("{} acts on {}", drug, target),
        },
        EvidencePayload::ClinicalTrial { trial_id, phase, status, .. } => {
            format!("trial {} ({:?}, {:?})", trial_id, phase, status)
        }
        EvidencePayload::SafetySignal { event, reports, serious } => {
            format!("{} reports of {} ({} serious)", reports, event, serious)
        }
        EvidencePayload::Patent { patent_number, status, expiry_year, .. } => match expiry_year {
            Some(year) => format!("patent {} {:?}, expires {}", patent_number, status, year),
            None => format!("patent {} {:?}", patent_number, status),
        },
        EvidencePayload::Regulatory { agency, status, .. } => format!("{} status {:?}", agency, status),
        EvidencePayload::MarketSizing { market_size_usd, growth_rate, .. } => match growth_rate {
            Some(growth) => format!("market ${:.1}B growing {:.0}%", market_size_usd / 1e9, growth * 100.0),
            None => format!("market ${:.1}B", market_size_usd / 1e9),
        },
    }
}
