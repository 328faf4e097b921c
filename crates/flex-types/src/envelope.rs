use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Wildcard pattern matched against `{capabilityId}.{factName}`, e.g. `"qa.*"`.
    pub pattern: String,
    pub action: PolicyAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    RequireApproval,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner: Option<Value>,
    #[serde(default)]
    pub runtime: Vec<PolicyRule>,
}

/// `envelope.outputContract`: either a facet contract, an inline JSON
/// Schema, or a freeform passthrough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputContract {
    Facets {
        facets: Vec<String>,
        #[serde(default)]
        partial_allowed: bool,
    },
    JsonSchema {
        schema: Value,
    },
    Freeform,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_run_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// The declarative objective + structured inputs/policies/output
/// contract a caller submits to the [`RunCoordinator`](../flex_core/struct.RunCoordinator.html).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub objective: String,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub constraints: EnvelopeConstraints,
    #[serde(default)]
    pub policies: Policies,
    #[serde(default)]
    pub special_instructions: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub output_contract: OutputContract,
}

impl TaskEnvelope {
    pub fn validate(&self) -> Result<(), String> {
        if self.objective.trim().is_empty() {
            return Err("objective must be at least 1 character".to_string());
        }
        Ok(())
    }

    pub fn resume_run_id(&self) -> Option<&str> {
        self.constraints
            .resume_run_id
            .as_deref()
            .or_else(|| self.metadata.get("runId").and_then(|v| v.as_str()))
    }
}
