use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetProvenance {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetValue {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub provenance: FacetProvenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub question_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    pub question: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

/// The in-memory, per-run facet ledger's durable snapshot shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContextSnapshot {
    #[serde(default)]
    pub facets: HashMap<String, FacetValue>,
    #[serde(default)]
    pub clarifications: Vec<Clarification>,
}
