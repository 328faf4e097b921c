//! Wire-format DTOs for the Flex HTTP surface: the shapes that cross the
//! network, as distinct from `flex-types`'s internal domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclineInfo {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// `resumeSubmission` per spec.md §6.1: the operator's answer to a
/// suspended `awaiting_human` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSubmission {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline: Option<DeclineInfo>,
    pub submitted_at: DateTime<Utc>,
}
