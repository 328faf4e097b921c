use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use flex_types::context::{Clarification, FacetProvenance, FacetValue, RunContextSnapshot};
use flex_types::envelope::OutputContract;
use flex_types::plan::{FlexNode, FlexPlan};

use crate::errors::ValidationError;

/// In-memory, per-run facet ledger. Last writer wins; the old value is
/// not retained, only its place in `clarifications` if it was a
/// clarification answer.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RwLock<RunContextSnapshot>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RunContextSnapshot {
                facets: HashMap::new(),
                clarifications: Vec::new(),
            })),
        }
    }

    pub fn from_snapshot(snapshot: RunContextSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// For each facet in `node.facets.output` present in `output`,
    /// records `{value, updatedAt, provenance}`.
    pub async fn update_from_node(&self, node: &FlexNode, output: &Value) {
        let mut snapshot = self.inner.write().await;
        for facet_name in &node.facets.output {
            let Some(value) = output.get(facet_name) else {
                continue;
            };
            snapshot.facets.insert(
                facet_name.clone(),
                FacetValue {
                    value: value.clone(),
                    updated_at: Utc::now(),
                    provenance: FacetProvenance {
                        node_id: node.id.clone(),
                        capability_id: node.capability_id.clone(),
                        rationale: node.rationale.clone(),
                    },
                },
            );
        }
    }

    pub async fn record_clarification(&self, clarification: Clarification) {
        let mut snapshot = self.inner.write().await;
        snapshot.clarifications.push(clarification);
    }

    pub async fn answer_clarification(&self, question_id: &str, answer: String) {
        let mut snapshot = self.inner.write().await;
        if let Some(c) = snapshot.clarifications.iter_mut().find(|c| c.question_id == question_id) {
            c.answer = Some(answer);
            c.answered_at = Some(Utc::now());
        }
    }

    pub async fn snapshot(&self) -> RunContextSnapshot {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, facet_name: &str) -> Option<FacetValue> {
        self.inner.read().await.facets.get(facet_name).cloned()
    }

    /// Composes the run's final output per `outputContract`.
    pub async fn compose_final_output(
        &self,
        output_contract: &OutputContract,
        _plan: &FlexPlan,
    ) -> Result<Value, ValidationError> {
        let snapshot = self.inner.read().await;
        match output_contract {
            OutputContract::Facets { facets, partial_allowed } => {
                let mut out = Map::new();
                let mut missing = Vec::new();
                for facet in facets {
                    match snapshot.facets.get(facet) {
                        Some(fv) => {
                            out.insert(facet.clone(), fv.value.clone());
                        }
                        None => missing.push(facet.clone()),
                    }
                }
                if !missing.is_empty() && !*partial_allowed {
                    return Err(ValidationError::FlexValidationError {
                        node_id: "final_output".to_string(),
                        message: format!("missing required output facets: {}", missing.join(", ")),
                    });
                }
                Ok(Value::Object(out))
            }
            OutputContract::JsonSchema { schema } => {
                let mut merged = Map::new();
                for (name, fv) in snapshot.facets.iter() {
                    merged.insert(name.clone(), fv.value.clone());
                }
                let output = Value::Object(merged);
                let validator = jsonschema::validator_for(schema).map_err(|err| ValidationError::FlexValidationError {
                    node_id: "final_output".to_string(),
                    message: format!("outputContract schema is invalid: {err}"),
                })?;
                if let Err(err) = validator.validate(&output) {
                    return Err(ValidationError::FlexValidationError {
                        node_id: "final_output".to_string(),
                        message: format!("final output failed schema validation: {err}"),
                    });
                }
                Ok(output)
            }
            OutputContract::Freeform => {
                let mut merged = Map::new();
                for (name, fv) in snapshot.facets.iter() {
                    merged.insert(name.clone(), fv.value.clone());
                }
                Ok(Value::Object(merged))
            }
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flex_types::plan::{NodeContracts, NodeFacets, NodeKind, NodeProvenance, NodeStatus};
    use serde_json::json;

    fn node(id: &str, output_facets: Vec<&str>) -> FlexNode {
        FlexNode {
            id: id.to_string(),
            kind: NodeKind::Ai,
            capability_id: Some("strategist@1".to_string()),
            label: id.to_string(),
            contracts: NodeContracts::default(),
            facets: NodeFacets {
                input: vec![],
                output: output_facets.into_iter().map(String::from).collect(),
            },
            provenance: NodeProvenance::default(),
            routing: None,
            rationale: None,
            status: NodeStatus::Completed,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            post_condition_results: None,
        }
    }

    #[tokio::test]
    async fn update_from_node_records_provenance() {
        let ctx = RunContext::new();
        ctx.update_from_node(&node("n1", vec!["creative_brief"]), &json!({"creative_brief": "go"}))
            .await;
        let value = ctx.get("creative_brief").await.unwrap();
        assert_eq!(value.value, json!("go"));
        assert_eq!(value.provenance.node_id, "n1");
    }

    #[tokio::test]
    async fn compose_final_output_facets_mode_errors_on_missing_required() {
        let ctx = RunContext::new();
        let plan = FlexPlan {
            run_id: "r1".to_string(),
            version: 1,
            created_at: Utc::now(),
            nodes: vec![],
            edges: vec![],
            metadata: Default::default(),
        };
        let contract = OutputContract::Facets {
            facets: vec!["creative_brief".to_string()],
            partial_allowed: false,
        };
        let err = ctx.compose_final_output(&contract, &plan).await.unwrap_err();
        assert!(matches!(err, ValidationError::FlexValidationError { .. }));
    }

    #[tokio::test]
    async fn compose_final_output_json_schema_mode_rejects_mismatch() {
        let ctx = RunContext::new();
        ctx.update_from_node(&node("n1", vec!["creative_brief"]), &json!({"creative_brief": 42}))
            .await;
        let plan = FlexPlan {
            run_id: "r1".to_string(),
            version: 1,
            created_at: Utc::now(),
            nodes: vec![],
            edges: vec![],
            metadata: Default::default(),
        };
        let contract = OutputContract::JsonSchema {
            schema: json!({
                "type": "object",
                "properties": {"creative_brief": {"type": "string"}},
                "required": ["creative_brief"]
            }),
        };
        let err = ctx.compose_final_output(&contract, &plan).await.unwrap_err();
        assert!(matches!(err, ValidationError::FlexValidationError { .. }));
    }

    #[tokio::test]
    async fn compose_final_output_json_schema_mode_succeeds_when_valid() {
        let ctx = RunContext::new();
        ctx.update_from_node(&node("n1", vec!["creative_brief"]), &json!({"creative_brief": "go"}))
            .await;
        let plan = FlexPlan {
            run_id: "r1".to_string(),
            version: 1,
            created_at: Utc::now(),
            nodes: vec![],
            edges: vec![],
            metadata: Default::default(),
        };
        let contract = OutputContract::JsonSchema {
            schema: json!({
                "type": "object",
                "properties": {"creative_brief": {"type": "string"}},
                "required": ["creative_brief"]
            }),
        };
        let output = ctx.compose_final_output(&contract, &plan).await.unwrap();
        assert_eq!(output["creative_brief"], json!("go"));
    }

    #[tokio::test]
    async fn compose_final_output_facets_mode_succeeds_when_all_present() {
        let ctx = RunContext::new();
        ctx.update_from_node(&node("n1", vec!["creative_brief"]), &json!({"creative_brief": "go"}))
            .await;
        let plan = FlexPlan {
            run_id: "r1".to_string(),
            version: 1,
            created_at: Utc::now(),
            nodes: vec![],
            edges: vec![],
            metadata: Default::default(),
        };
        let contract = OutputContract::Facets {
            facets: vec!["creative_brief".to_string()],
            partial_allowed: false,
        };
        let output = ctx.compose_final_output(&contract, &plan).await.unwrap();
        assert_eq!(output["creative_brief"], json!("go"));
    }
}
