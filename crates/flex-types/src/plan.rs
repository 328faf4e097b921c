use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityKind;

/// Dispatcher tag for a node's executor. Capability behavior is selected
/// by `(agent_type, capability_id)`, never by subclassing; `kind` here is
/// the plan-level counterpart used before a capability is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Ai,
    Human,
    Routing,
    /// See [`CapabilityKind::Fallback`]; archived snapshots may still
    /// carry this, new plans must not.
    Fallback,
}

impl From<CapabilityKind> for Option<NodeKind> {
    fn from(kind: CapabilityKind) -> Self {
        match kind {
            CapabilityKind::Routing => Some(NodeKind::Routing),
            CapabilityKind::Fallback => Some(NodeKind::Fallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    AwaitingHitl,
    AwaitingHuman,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeContracts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFacets {
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeProvenance {
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostConditionResult {
    pub expression: String,
    pub satisfied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    pub label: String,
    #[serde(default)]
    pub contracts: NodeContracts,
    #[serde(default)]
    pub facets: NodeFacets,
    #[serde(default)]
    pub provenance: NodeProvenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_condition_results: Option<Vec<PostConditionResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexPlan {
    pub run_id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<FlexNode>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl FlexPlan {
    pub fn node(&self, id: &str) -> Option<&FlexNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut FlexNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn predecessors_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.to == node_id)
            .map(|edge| edge.from.as_str())
    }

    /// The first `pending` node whose predecessors are all `completed`
    /// or `skipped`, per spec.md §4.7 step 1.
    pub fn next_runnable(&self) -> Option<&FlexNode> {
        self.nodes.iter().find(|node| {
            node.status == NodeStatus::Pending
                && self.predecessors_of(&node.id).all(|pred_id| {
                    self.node(pred_id)
                        .map(|pred| {
                            matches!(pred.status, NodeStatus::Completed | NodeStatus::Skipped)
                        })
                        .unwrap_or(false)
                })
        })
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.iter().all(|node| {
            !matches!(
                node.status,
                NodeStatus::Pending | NodeStatus::Running
            )
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingState {
    #[serde(default)]
    pub completed_node_ids: Vec<String>,
    #[serde(default)]
    pub node_outputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_actions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_attempts: Option<HashMap<String, u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshotBody {
    pub nodes: Vec<FlexNode>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_state: Option<PendingState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub run_id: String,
    pub plan_version: u32,
    pub snapshot: PlanSnapshotBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_snapshot: Option<crate::context::RunContextSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    #[serde(default)]
    pub pending_node_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
