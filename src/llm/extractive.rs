// Deterministic generator that only restates the supplied evidence.
// Used when no API key is configured.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::provider::{PromptContext, TextGenerator};
use crate::types::CallFailure;

const MAX_CITED: usize = 4;

#[derive(Debug, Default, Clone)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextGenerator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(
        &self,
        prompt: &PromptContext,
        _temperature: f32,
        _max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String, CallFailure> {
        if cancel.is_cancelled() {
            return Err(CallFailure::cancelled());
        }
        if prompt.evidence.is_empty() {
            return Ok(format!(
                "{} was ranked for {} without supporting evidence items.",
                prompt.candidate, prompt.subject
            ));
        }

        let mut text = format!(
            "{} is a {} candidate for {} (composite {:.2}).",
            prompt.candidate, prompt.route, prompt.subject, prompt.composite
        );
        for item in prompt.evidence.iter().take(MAX_CITED) {
            text.push_str(&format!(" {} [{}].", capitalize(&item.summary), item.id));
        }
        if prompt.evidence.len() > MAX_CITED {
            text.push_str(&format!(" {} further items support this.", prompt.evidence.len() - MAX_CITED));
        }
        Ok(text)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EntityKind, EvidenceItem, EvidencePayload, EvidenceQuality, SourceCategory, SourceId, SubjectRef};
    use crate::llm::PromptEvidence;
    use chrono::Utc;

    #[tokio::test]
    async fn test_cites_only_supplied_evidence() {
        let item = EvidenceItem::new(
            SourceId::new("faers"),
            SourceCategory::Safety,
            SubjectRef::new(EntityKind::Drug, "Tofacitinib"),
            EvidencePayload::SafetySignal { event: "herpes zoster".to_string(), reports: 40, serious: 3 },
            0.8,
            EvidenceQuality::Complete,
            Utc::now(),
        );
        let prompt = PromptContext {
            route: "market-back".to_string(),
            subject: "IBD".to_string(),
            candidate: "Tofacitinib".to_string(),
            composite: 0.5,
            rationale: vec![],
            evidence: vec![PromptEvidence::from_item(&item)],
        };

        let text = ExtractiveGenerator::new()
            .generate(&prompt, 0.2, 256, &CancellationToken::new())
            .await
            .unwrap();
        assert!(text.contains(item.id.as_str()));
        assert!(text.contains("40 reports of herpes zoster"));

        // Same input, same output.
        let again = ExtractiveGenerator::new()
            .generate(&prompt, 0.7, 256, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, again);
    }
}
