use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlKind {
    Approval,
    Clarify,
    Choice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlPayload {
    pub question: String,
    pub kind: HitlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<HitlOption>>,
    #[serde(default)]
    pub allow_free_form: bool,
    #[serde(default = "default_urgency")]
    pub urgency: String,
}

fn default_urgency() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    Pending,
    Resolved,
    Denied,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlMetrics {
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRequestRecord {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_node_id: Option<String>,
    pub origin_agent: String,
    pub payload: HitlPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_prompt: Option<String>,
    pub status: HitlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metrics: HitlMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlResponseType {
    Option,
    Approval,
    Rejection,
    Freeform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlResponse {
    pub id: String,
    pub request_id: String,
    pub response_type: HitlResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeform_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanTaskStatus {
    AwaitingSubmission,
    Submitted,
    Declined,
    TimedOut,
}

/// Projection of a node with status `awaiting_human` for listing/UI use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanTask {
    pub task_id: String,
    pub run_id: String,
    pub node_id: String,
    pub capability_id: String,
    pub status: HumanTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<crate::capability::AssignmentDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub contracts: crate::plan::NodeContracts,
    pub facets: crate::plan::NodeFacets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_provenance: Option<Value>,
}
