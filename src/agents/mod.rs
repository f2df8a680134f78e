//! Retrieval Agents
//!
//! One agent per capability. Every agent has the same contract: given the
//! run's target, a set of leads and the sources it may query, return
//! normalized evidence plus a [`StageResult`] describing which sources
//! succeeded.
//!
//! - **literature**: publications mentioning the subject
//! - **target-discovery**: targets associated with an indication, or
//!   indications associated with targets
//! - **drug-candidate**: drugs acting on targets, or targets of a drug
//! - **clinical-trials**, **safety-tox**, **patent**, **regulatory**, **market**
//!
//! ```text
//!  leads × selected sources
//!        │
//!        ▼
//!  ┌────────────┐   miss   ┌──────────────┐   slot   ┌──────────────┐
//!  │   cache    │ ───────▶ │ retry/backoff│ ───────▶ │ SourceClient │
//!  └────────────┘          └──────────────┘          └──────────────┘
//!        │
//!        ▼
//!  normalize ─▶ EvidenceItem[] + StageResult
//! ```

pub mod normalize;
pub mod source_agent;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::budget::ResultBudget;
use crate::engine::EngineServices;
use crate::evidence::{EvidenceItem, SourceCategory, SubjectRef};
use crate::intent::RouteTarget;
use crate::run::{RunId, RunIssue, StageResult};
use crate::sources::SourceBinding;

pub use source_agent::SourceAgent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Literature,
    TargetDiscovery,
    DrugCandidate,
    ClinicalTrials,
    SafetyTox,
    Patent,
    Regulatory,
    Market,
}

impl AgentKind {
    pub const ALL: [AgentKind; 8] = [
        AgentKind::Literature,
        AgentKind::TargetDiscovery,
        AgentKind::DrugCandidate,
        AgentKind::ClinicalTrials,
        AgentKind::SafetyTox,
        AgentKind::Patent,
        AgentKind::Regulatory,
        AgentKind::Market,
    ];

    /// Category of sources this agent queries.
    pub fn category(self) -> SourceCategory {
        match self {
            AgentKind::Literature => SourceCategory::Literature,
            AgentKind::TargetDiscovery => SourceCategory::Target,
            AgentKind::DrugCandidate => SourceCategory::Drug,
            AgentKind::ClinicalTrials => SourceCategory::Clinical,
            AgentKind::SafetyTox => SourceCategory::Safety,
            AgentKind::Patent => SourceCategory::Patent,
            AgentKind::Regulatory => SourceCategory::Regulatory,
            AgentKind::Market => SourceCategory::Market,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Literature => "literature",
            AgentKind::TargetDiscovery => "target-discovery",
            AgentKind::DrugCandidate => "drug-candidate",
            AgentKind::ClinicalTrials => "clinical-trials",
            AgentKind::SafetyTox => "safety-tox",
            AgentKind::Patent => "patent",
            AgentKind::Regulatory => "regulatory",
            AgentKind::Market => "market",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one agent invocation needs.
#[derive(Clone)]
pub struct AgentContext {
    pub run_id: RunId,
    pub target: Arc<RouteTarget>,
    pub leads: Vec<SubjectRef>,
    pub sources: Vec<SourceBinding>,
    /// Max evidence items this invocation may return.
    pub result_cap: usize,
    pub budget: Arc<ResultBudget>,
    pub services: Arc<EngineServices>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub evidence: Vec<EvidenceItem>,
    pub result: StageResult,
    pub issues: Vec<RunIssue>,
}

#[async_trait]
pub trait RetrievalAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Never returns an error: failures are reported in the [`StageResult`].
    async fn fetch(&self, ctx: AgentContext) -> AgentOutput;
}

/// The agent implementation used for each kind.
#[derive(Clone)]
pub struct AgentSet {
    agents: HashMap<AgentKind, Arc<dyn RetrievalAgent>>,
}

impl AgentSet {
    /// One [`SourceAgent`] per kind.
    pub fn standard() -> Self {
        let agents = AgentKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(SourceAgent::new(kind)) as Arc<dyn RetrievalAgent>))
            .collect();
        Self { agents }
    }

    /// Replace the implementation for the agent's kind.
    pub fn with_agent(mut self, agent: Arc<dyn RetrievalAgent>) -> Self {
        self.agents.insert(agent.kind(), agent);
        self
    }

    /// Drop the implementation for `kind`; planned stages for it are skipped.
    pub fn without(mut self, kind: AgentKind) -> Self {
        self.agents.remove(&kind);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn RetrievalAgent>> {
        self.agents.get(&kind).cloned()
    }
}

impl Default for AgentSet {
    fn default() -> Self {
        Self::standard()
    }
}
