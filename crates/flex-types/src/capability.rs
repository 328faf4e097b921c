use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Ai,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Structuring,
    Execution,
    Validation,
    Transformation,
    Routing,
    /// Legacy value migrated out of the enumeration. Rejected on ingest
    /// (see `PlannerValidationService`); tolerated when deserializing
    /// archived plan snapshots.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Active,
    Inactive,
}

/// Either an explicit list of facet names or an inline JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContractSpec {
    Facets(Vec<String>),
    JsonSchema(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDecline {
    FailRun,
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentDefaults {
    pub role: String,
    #[serde(default = "default_human_timeout_seconds")]
    pub timeout_seconds: u64,
    pub on_decline: OnDecline,
    #[serde(default = "default_max_notifications")]
    pub max_notifications: u32,
}

pub fn default_human_timeout_seconds() -> u64 {
    900
}

fn default_max_notifications() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstructionTemplates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// A JSON-Logic expression evaluated against the run context's facets
/// plus the node's own output after a capability completes, per
/// spec.md §4.7's "postConditions (a list of JSON-Logic expressions
/// over run-context facets)". A node whose post-conditions don't hold
/// after retry is a replan trigger, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostConditionSpec {
    pub expression: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A registered, live capability: AI or human, declared in terms of
/// facets (or an inline JSON Schema) it consumes and produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub capability_id: String,
    pub version: u32,
    pub agent_type: AgentType,
    pub kind: CapabilityKind,
    pub display_name: String,
    pub summary: String,
    pub input_contract: ContractSpec,
    pub output_contract: ContractSpec,
    #[serde(default)]
    pub input_facets: Vec<String>,
    #[serde(default)]
    pub output_facets: Vec<String>,
    #[serde(default)]
    pub post_conditions: Vec<PostConditionSpec>,
    #[serde(default)]
    pub cost: CostHint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub instruction_templates: InstructionTemplates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_defaults: Option<AssignmentDefaults>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub status: CapabilityStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl CapabilityRecord {
    pub fn is_active(&self) -> bool {
        self.status == CapabilityStatus::Active
    }
}
