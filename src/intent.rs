//! Typed research intents and route resolution.
//!
//! An [`Intent`] is what a caller asks for. Before a run starts it is resolved
//! into a [`RouteTarget`]: the concrete route, the primary subject every
//! intent-scoped agent queries about, and the kind of entity being ranked.
//! Free-text `natural-language` intents are classified into one of the
//! concrete routes here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::evidence::{normalize_entity_id, EntityKind, SourceId, SubjectRef};
use crate::types::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Route {
    /// Indication in, ranked drugs out.
    MarketBack,
    /// Drug in, ranked new indications out.
    AssetForward,
    /// One drug against one indication.
    Debate,
    /// Indication in, drugs ranked where competition is thin.
    WhiteSpace,
    /// Free text, classified into one of the above.
    NaturalLanguage,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::MarketBack => "market-back",
            Route::AssetForward => "asset-forward",
            Route::Debate => "debate",
            Route::WhiteSpace => "white-space",
            Route::NaturalLanguage => "natural-language",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    Low,
    #[default]
    Moderate,
    High,
}

impl fmt::Display for ReasoningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasoningMode::Low => write!(f, "low"),
            ReasoningMode::Moderate => write!(f, "moderate"),
            ReasoningMode::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ResultLimits {
    #[validate(range(min = 1, max = 100))]
    pub max_targets: u32,
    #[validate(range(min = 1, max = 50))]
    pub max_drugs_per_target: u32,
    #[validate(range(min = 1, max = 100))]
    pub max_new_indications: u32,
}

impl Default for ResultLimits {
    fn default() -> Self {
        Self { max_targets: 10, max_drugs_per_target: 5, max_new_indications: 10 }
    }
}

/// A structured research request. Owned read-only by the run created from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub route: Route,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub reasoning_mode: ReasoningMode,
    #[serde(default)]
    pub selected_sources: BTreeSet<SourceId>,
    #[serde(default)]
    pub limits: ResultLimits,
    /// Drop candidates whose patent landscape leaves little freedom to operate.
    #[serde(default)]
    pub strict_fto: bool,
}

impl Intent {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            fields: BTreeMap::new(),
            reasoning_mode: ReasoningMode::default(),
            selected_sources: BTreeSet::new(),
            limits: ResultLimits::default(),
            strict_fto: false,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_mode(mut self, mode: ReasoningMode) -> Self {
        self.reasoning_mode = mode;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        self.selected_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> AppResult<&str> {
        self.field(key).ok_or_else(|| {
            AppError::InvalidIntent(format!("route {} requires field '{}'", self.route, key))
        })
    }

    /// Validate and resolve the intent into a concrete route target.
    pub fn resolve_target(&self) -> AppResult<RouteTarget> {
        self.limits
            .validate()
            .map_err(|e| AppError::InvalidIntent(format!("invalid limits: {}", e)))?;

        let geography = self.field("geography").map(str::to_string);
        let target = match self.route {
            Route::MarketBack | Route::WhiteSpace => RouteTarget {
                route: self.route,
                subject: SubjectRef::new(EntityKind::Indication, self.require("indication")?),
                secondary: None,
                candidate_kind: EntityKind::Drug,
                geography,
                excluded: BTreeSet::new(),
            },
            Route::AssetForward => RouteTarget {
                route: Route::AssetForward,
                subject: SubjectRef::new(EntityKind::Drug, self.require("drug_name")?),
                secondary: None,
                candidate_kind: EntityKind::Indication,
                geography,
                excluded: self
                    .field("known_indications")
                    .map(|list| {
                        list.split([',', ';'])
                            .map(normalize_entity_id)
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            Route::Debate => RouteTarget {
                route: Route::Debate,
                subject: SubjectRef::new(EntityKind::Drug, self.require("drug_name")?),
                secondary: Some(SubjectRef::new(EntityKind::Indication, self.require("indication")?)),
                candidate_kind: EntityKind::Drug,
                geography,
                excluded: BTreeSet::new(),
            },
            Route::NaturalLanguage => {
                let mut target = classify_query(self.require("query")?)?;
                target.geography = geography;
                target
            }
        };
        Ok(target)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.resolve_target().map(|_| ())
    }
}

/// The concrete thing a run is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Never [`Route::NaturalLanguage`].
    pub route: Route,
    pub subject: SubjectRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<SubjectRef>,
    pub candidate_kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geography: Option<String>,
    /// Normalized entity ids that must not appear as candidates.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded: BTreeSet<String>,
}

const ASSET_FORWARD_PREFIXES: &[&str] = &[
    "new indications for ",
    "other indications for ",
    "other uses for ",
    "repurposing ",
    "repurpose ",
];
const WHITE_SPACE_PREFIXES: &[&str] = &["white space in ", "unmet needs in ", "unmet need in "];
const MARKET_BACK_PREFIXES: &[&str] = &["drugs for ", "treatments for ", "therapies for ", "treat "];

fn clean_phrase(raw: &str) -> &str {
    raw.trim().trim_end_matches(['?', '.', '!']).trim()
}

/// Slice `query` after the first occurrence of `pattern` in its lowercase form.
/// ASCII lowercasing keeps byte offsets aligned with the original.
fn after<'a>(query: &'a str, lower: &str, pattern: &str) -> Option<&'a str> {
    lower
        .find(pattern)
        .map(|pos| clean_phrase(&query[pos + pattern.len()..]))
        .filter(|rest| !rest.is_empty())
}

fn classify_query(query: &str) -> AppResult<RouteTarget> {
    let lower = query.to_ascii_lowercase();
    let base = |route, subject, candidate_kind| RouteTarget {
        route,
        subject,
        secondary: None,
        candidate_kind,
        geography: None,
        excluded: BTreeSet::new(),
    };

    if let Some(rest) = after(query, &lower, "does ") {
        let rest_lower = rest.to_ascii_lowercase();
        if let Some(split) = rest_lower.find(" treat ") {
            let drug = clean_phrase(&rest[..split]);
            let indication = clean_phrase(&rest[split + " treat ".len()..]);
            if !drug.is_empty() && !indication.is_empty() {
                let mut target = base(Route::Debate, SubjectRef::new(EntityKind::Drug, drug), EntityKind::Drug);
                target.secondary = Some(SubjectRef::new(EntityKind::Indication, indication));
                return Ok(target);
            }
        }
    }

    for prefix in ASSET_FORWARD_PREFIXES {
        if let Some(drug) = after(query, &lower, prefix) {
            return Ok(base(
                Route::AssetForward,
                SubjectRef::new(EntityKind::Drug, drug),
                EntityKind::Indication,
            ));
        }
    }

    for prefix in WHITE_SPACE_PREFIXES {
        if let Some(indication) = after(query, &lower, prefix) {
            return Ok(base(
                Route::WhiteSpace,
                SubjectRef::new(EntityKind::Indication, indication),
                EntityKind::Drug,
            ));
        }
    }

    for prefix in MARKET_BACK_PREFIXES {
        if let Some(indication) = after(query, &lower, prefix) {
            return Ok(base(
                Route::MarketBack,
                SubjectRef::new(EntityKind::Indication, indication),
                EntityKind::Drug,
            ));
        }
    }

    let indication = clean_phrase(query);
    if indication.is_empty() {
        return Err(AppError::InvalidIntent("natural-language query is empty".to_string()));
    }
    Ok(base(
        Route::MarketBack,
        SubjectRef::new(EntityKind::Indication, indication),
        EntityKind::Drug,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_back_requires_indication() {
        let intent = Intent::new(Route::MarketBack);
        assert!(matches!(intent.validate(), Err(AppError::InvalidIntent(_))));

        let intent = intent.with_field("indication", "  ");
        assert!(matches!(intent.validate(), Err(AppError::InvalidIntent(_))));

        let target = Intent::new(Route::MarketBack)
            .with_field("indication", "Inflammatory Bowel Disease")
            .resolve_target()
            .unwrap();
        assert_eq!(target.subject.id, "inflammatory bowel disease");
        assert_eq!(target.candidate_kind, EntityKind::Drug);
    }

    #[test]
    fn test_debate_requires_both_fields() {
        let intent = Intent::new(Route::Debate).with_field("drug_name", "Metformin");
        assert!(intent.validate().is_err());

        let target = intent.with_field("indication", "Glioblastoma").resolve_target().unwrap();
        assert_eq!(target.subject.kind, EntityKind::Drug);
        assert_eq!(target.secondary.unwrap().id, "glioblastoma");
    }

    #[test]
    fn test_asset_forward_excludes_known_indications() {
        let target = Intent::new(Route::AssetForward)
            .with_field("drug_name", "Sildenafil")
            .with_field("known_indications", "Erectile Dysfunction, Pulmonary  Arterial Hypertension")
            .resolve_target()
            .unwrap();
        assert_eq!(target.candidate_kind, EntityKind::Indication);
        assert!(target.excluded.contains("pulmonary arterial hypertension"));
        assert_eq!(target.excluded.len(), 2);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut intent = Intent::new(Route::WhiteSpace).with_field("indication", "NASH");
        intent.limits.max_targets = 0;
        assert!(matches!(intent.validate(), Err(AppError::InvalidIntent(_))));
    }

    #[test]
    fn test_natural_language_classification() {
        let resolve = |q: &str| {
            Intent::new(Route::NaturalLanguage).with_field("query", q).resolve_target().unwrap()
        };

        let t = resolve("Does Metformin treat Glioblastoma?");
        assert_eq!(t.route, Route::Debate);
        assert_eq!(t.subject.label, "Metformin");
        assert_eq!(t.secondary.unwrap().label, "Glioblastoma");

        let t = resolve("Find new indications for Baricitinib");
        assert_eq!(t.route, Route::AssetForward);
        assert_eq!(t.subject.label, "Baricitinib");

        let t = resolve("Where is the unmet need in Ulcerative Colitis?");
        assert_eq!(t.route, Route::WhiteSpace);
        assert_eq!(t.subject.id, "ulcerative colitis");

        let t = resolve("Drugs for Crohn's disease");
        assert_eq!(t.route, Route::MarketBack);
        assert_eq!(t.subject.label, "Crohn's disease");

        let t = resolve("psoriasis");
        assert_eq!(t.route, Route::MarketBack);
        assert_eq!(t.subject.id, "psoriasis");
    }

    #[test]
    fn test_intent_deserializes_with_defaults() {
        let intent: Intent = serde_json::from_value(serde_json::json!({
            "route": "market-back",
            "fields": { "indication": "IBD" },
            "selected_sources": ["ClinicalTrials", "pubmed"]
        }))
        .unwrap();
        assert_eq!(intent.reasoning_mode, ReasoningMode::Moderate);
        assert!(intent.selected_sources.contains(&SourceId::new("clinicaltrials")));
        assert_eq!(intent.limits, ResultLimits::default());
    }
}
