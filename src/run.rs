//! Run State Machine
//!
//! Lifecycle of one orchestration run:
//!
//! ```text
//! created ──▶ queued ──▶ running ──┬──▶ completed
//!    │          │                  ├──▶ failed
//!    └──────────┴──────────────────┴──▶ cancelled
//! ```
//!
//! Status only moves forward and terminal states are immutable. The stage
//! map is written at stage barriers only; pollers read a [`RunSnapshot`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentKind;
use crate::evidence::{Candidate, EvidenceId, EvidenceItem, SourceId};
use crate::intent::{Intent, Route, RouteTarget};
use crate::types::{AppError, AppResult, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RunId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AllSourcesFailed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// None of the agent's sources were selected in the intent.
    NoSelectedSources,
    /// Optional agent excluded by the reasoning mode.
    ExcludedByMode,
    /// The run's wall-clock budget ran out before this stage started.
    RunBudgetExhausted,
    /// An earlier stage failed the run.
    UpstreamFailed,
    /// The engine has no implementation registered for this agent.
    NoImplementation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    SucceededFully,
    SucceededPartially { failed_sources: Vec<SourceId> },
    Failed { reason: FailureReason },
    Skipped { reason: SkipReason },
}

impl StageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped { .. })
    }

    /// Partial, failed, budget-skipped and unimplemented outcomes degrade the run.
    pub fn degrades_run(&self) -> bool {
        matches!(
            self,
            StageOutcome::SucceededPartially { .. }
                | StageOutcome::Failed { .. }
                | StageOutcome::Skipped { reason: SkipReason::RunBudgetExhausted | SkipReason::NoImplementation }
        )
    }
}

/// Outcome of one agent's execution within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub agent: AgentKind,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub evidence_count: usize,
    #[serde(default)]
    pub sources_succeeded: Vec<SourceId>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn skipped(agent: AgentKind, reason: SkipReason) -> Self {
        Self {
            agent,
            outcome: StageOutcome::Skipped { reason },
            evidence_count: 0,
            sources_succeeded: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failed(agent: AgentKind, reason: FailureReason, duration_ms: u64) -> Self {
        Self {
            agent,
            outcome: StageOutcome::Failed { reason },
            evidence_count: 0,
            sources_succeeded: Vec::new(),
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "result", rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Done(StageResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    /// Position of the agent's stage in the route graph.
    pub stage: usize,
    pub agent: AgentKind,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SourceUnavailable,
    AuthOrQueryInvalid,
    RateLimited,
    AgentTimeout,
    AggregationConflict,
    SynthesisFailure,
    BudgetExhausted,
    StageFailed,
    RunCancelled,
    PersistenceFailure,
}

impl From<FailureKind> for IssueKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::SourceUnavailable => IssueKind::SourceUnavailable,
            FailureKind::AuthOrQueryInvalid => IssueKind::AuthOrQueryInvalid,
            FailureKind::RateLimited => IssueKind::RateLimited,
            FailureKind::Cancelled => IssueKind::RunCancelled,
        }
    }
}

/// An error or degradation recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIssue {
    pub kind: IssueKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub at: DateTime<Utc>,
}

impl RunIssue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), agent: None, source: None, entity: None, at: Utc::now() }
    }

    pub fn for_agent(mut self, agent: AgentKind) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn for_source(mut self, source: SourceId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn for_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub(crate) id: RunId,
    intent: Intent,
    pub(crate) target: RouteTarget,
    pub(crate) status: RunStatus,
    pub(crate) stages: Vec<StageEntry>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    evidence: Vec<EvidenceItem>,
    pub(crate) candidates: Vec<Candidate>,
    pub(crate) issues: Vec<RunIssue>,
    pub(crate) degraded: bool,
    pub(crate) failure: Option<String>,
}

impl Run {
    pub fn new(intent: Intent, target: RouteTarget, layout: &[Vec<AgentKind>]) -> Self {
        let stages = layout
            .iter()
            .enumerate()
            .flat_map(|(index, agents)| {
                agents.iter().map(move |agent| StageEntry {
                    stage: index,
                    agent: *agent,
                    status: StageStatus::Pending,
                })
            })
            .collect();

        Self {
            id: RunId::new(),
            intent,
            target,
            status: RunStatus::Created,
            stages,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            evidence: Vec::new(),
            candidates: Vec::new(),
            issues: Vec::new(),
            degraded: false,
            failure: None,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn target(&self) -> &RouteTarget {
        &self.target
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn issues(&self) -> &[RunIssue] {
        &self.issues
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn transition(&mut self, next: RunStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition { from: self.status, to: next });
        }
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Append evidence, skipping ids already recorded. Existing items are never touched.
    pub(crate) fn append_evidence(&mut self, items: Vec<EvidenceItem>) -> usize {
        let mut seen: BTreeSet<EvidenceId> = self.evidence.iter().map(|e| e.id.clone()).collect();
        let before = self.evidence.len();
        for item in items {
            if seen.insert(item.id.clone()) {
                self.evidence.push(item);
            }
        }
        self.evidence.len() - before
    }

    pub(crate) fn set_stage(&mut self, agent: AgentKind, status: StageStatus) {
        if let Some(entry) = self.stages.iter_mut().find(|e| e.agent == agent) {
            entry.status = status;
        }
    }

    pub(crate) fn stage_status(&self, agent: AgentKind) -> Option<&StageStatus> {
        self.stages.iter().find(|e| e.agent == agent).map(|e| &e.status)
    }

    pub(crate) fn record_issue(&mut self, issue: RunIssue) {
        self.issues.push(issue);
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let cited: BTreeSet<&EvidenceId> = self
            .candidates
            .iter()
            .flat_map(|c| c.evidence.iter())
            .collect();
        RunSnapshot {
            run_id: self.id,
            route: self.target.route,
            requested_route: self.intent.route,
            target: self.target.clone(),
            status: self.status,
            degraded: self.degraded,
            stages: self.stages.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            candidates: self.candidates.clone(),
            evidence_count: self.evidence.len(),
            evidence: self
                .evidence
                .iter()
                .filter(|e| cited.contains(&e.id))
                .cloned()
                .collect(),
            issues: self.issues.clone(),
            failure: self.failure.clone(),
        }
    }
}

/// Read-only view returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub route: Route,
    pub requested_route: Route,
    pub target: RouteTarget,
    pub status: RunStatus,
    pub degraded: bool,
    pub stages: Vec<StageEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Provisional while running, final once completed.
    pub candidates: Vec<Candidate>,
    pub evidence_count: usize,
    /// Evidence cited by the candidates.
    pub evidence: Vec<EvidenceItem>,
    pub issues: Vec<RunIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
