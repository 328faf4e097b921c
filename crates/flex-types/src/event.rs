use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlexEventType {
    Start,
    PlanRequested,
    PlanRejected,
    PlanGenerated,
    PlanUpdated,
    NodeStart,
    NodeComplete,
    NodeError,
    ValidationError,
    PolicyTriggered,
    GoalConditionFailed,
    FeedbackResolution,
    HitlRequest,
    HitlResolved,
    Warning,
    Metrics,
    Log,
    Complete,
}

/// A lifecycle event emitted by the engine. `facet_provenance` is
/// attached whenever the event concerns a specific facet update, per
/// spec.md §4.4 / §6.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlexEvent {
    #[serde(rename = "type")]
    pub event_type: FlexEventType,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_provenance: Option<Value>,
}

impl FlexEvent {
    pub fn new(event_type: FlexEventType, run_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            run_id: run_id.into(),
            correlation_id: None,
            plan_version: None,
            node_id: None,
            payload,
            facet_provenance: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_plan_version(mut self, version: Option<u32>) -> Self {
        self.plan_version = version;
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_facet_provenance(mut self, provenance: Value) -> Self {
        self.facet_provenance = Some(provenance);
        self
    }

    pub fn empty_payload() -> Value {
        json!({})
    }
}
