//! Per-route dependency graphs
//!
//! Each concrete route has a fixed, staged DAG of retrieval agents. Agents in
//! one stage run concurrently; a stage only starts after the previous one has
//! fully returned. What an agent queries about is given by its [`LeadScope`].
//!
//! ```text
//! market-back   literature ─▶ target ─▶ {drug(targets), clinical} ─▶ {safety, patent, regulatory*, market*}(candidates)
//! asset-forward {drug, literature*} ─▶ target(targets) ─▶ {clinical(candidates), safety} ─▶ {regulatory*, market*}(candidates)
//! debate        {literature, clinical} ─▶ {safety, patent, regulatory*, market*}
//! white-space   {literature, target} ─▶ drug(targets) ─▶ {clinical, patent}(candidates) ─▶ market*(candidates)
//! ```
//!
//! `*` marks optional agents, dropped in low reasoning mode. The graphs are
//! built once per process and shared.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::agents::AgentKind;
use crate::intent::Route;

/// Where an agent's leads come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadScope {
    /// The route's primary subject.
    Intent,
    /// Targets found by upstream agents.
    Targets,
    /// The provisional ranking of candidates so far.
    Candidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentNode {
    pub kind: AgentKind,
    pub scope: LeadScope,
    pub optional: bool,
}

const fn node(kind: AgentKind, scope: LeadScope) -> AgentNode {
    AgentNode { kind, scope, optional: false }
}

const fn optional(kind: AgentKind, scope: LeadScope) -> AgentNode {
    AgentNode { kind, scope, optional: true }
}

#[derive(Debug, Clone)]
pub struct RouteGraph {
    pub route: Route,
    pub stages: Vec<Vec<AgentNode>>,
}

impl RouteGraph {
    pub fn layout(&self) -> Vec<Vec<AgentKind>> {
        self.stages.iter().map(|stage| stage.iter().map(|n| n.kind).collect()).collect()
    }

    pub fn agent_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

pub struct GraphCatalog {
    graphs: HashMap<Route, Arc<RouteGraph>>,
}

impl GraphCatalog {
    fn standard() -> Self {
        use AgentKind::*;
        use LeadScope::*;

        let graphs = [
            RouteGraph {
                route: Route::MarketBack,
                stages: vec![
                    vec![node(Literature, Intent)],
                    vec![node(TargetDiscovery, Intent)],
                    vec![node(DrugCandidate, Targets), node(ClinicalTrials, Intent)],
                    vec![
                        node(SafetyTox, Candidates),
                        node(Patent, Candidates),
                        optional(Regulatory, Candidates),
                        optional(Market, Candidates),
                    ],
                ],
            },
            RouteGraph {
                route: Route::AssetForward,
                stages: vec![
                    vec![node(DrugCandidate, Intent), optional(Literature, Intent)],
                    vec![node(TargetDiscovery, Targets)],
                    vec![node(ClinicalTrials, Candidates), node(SafetyTox, Intent)],
                    vec![optional(Regulatory, Candidates), optional(Market, Candidates)],
                ],
            },
            RouteGraph {
                route: Route::Debate,
                stages: vec![
                    vec![node(Literature, Intent), node(ClinicalTrials, Intent)],
                    vec![
                        node(SafetyTox, Intent),
                        node(Patent, Intent),
                        optional(Regulatory, Intent),
                        optional(Market, Intent),
                    ],
                ],
            },
            RouteGraph {
                route: Route::WhiteSpace,
                stages: vec![
                    vec![node(Literature, Intent), node(TargetDiscovery, Intent)],
                    vec![node(DrugCandidate, Targets)],
                    vec![node(ClinicalTrials, Candidates), node(Patent, Candidates)],
                    vec![optional(Market, Candidates)],
                ],
            },
        ];

        Self { graphs: graphs.into_iter().map(|g| (g.route, Arc::new(g))).collect() }
    }

    /// Graph for a concrete route. `natural-language` has none: it is
    /// resolved to a concrete route first.
    pub fn get(&self, route: Route) -> Option<Arc<RouteGraph>> {
        self.graphs.get(&route).cloned()
    }
}

pub fn catalog() -> &'static GraphCatalog {
    static CATALOG: OnceLock<GraphCatalog> = OnceLock::new();
    CATALOG.get_or_init(GraphCatalog::standard)
}
