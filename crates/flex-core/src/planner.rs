use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flex_model::{ModelRuntime, ResponsesRequest};
use flex_types::envelope::TaskEnvelope;
use flex_types::plan::PlanSnapshot;

use crate::capability_registry::{CapabilityRegistry, CrcsReason, CrcsSnapshot};
use crate::errors::{Diagnostic, PlannerError};
use crate::facet_catalog::FacetCatalog;
use flex_telemetry::TelemetryService;

/// One node spec inside a `PlannerDraft`, before validation resolves it
/// against the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftNodeSpec {
    pub stage: String,
    #[serde(default)]
    pub capability_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub input_facets: Vec<String>,
    #[serde(default)]
    pub output_facets: Vec<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default = "default_pending")]
    pub status: String,
    #[serde(default)]
    pub routing: Option<Value>,
    #[serde(default)]
    pub derived: Option<bool>,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_pending() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlannerDraft {
    pub nodes: Vec<DraftNodeSpec>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// What the planner is asked to produce a draft for: the envelope, an
/// optional in-progress snapshot (for resume/replan — completed nodes
/// are preserved verbatim, the new version must exceed the snapshot's),
/// and diagnostics from a prior rejected draft.
pub struct PlanRequest<'a> {
    pub envelope: &'a TaskEnvelope,
    pub existing_snapshot: Option<&'a PlanSnapshot>,
    pub prior_diagnostics: Vec<Diagnostic>,
}

#[async_trait]
pub trait PlannerService: Send + Sync {
    async fn propose_plan(&self, request: PlanRequest<'_>) -> Result<PlannerDraft, PlannerError>;
}

const MAX_FACET_ROWS: usize = 40;
const MAX_CAPABILITY_ROWS: usize = 40;
const MAX_INPUT_VALUE_CHARS: usize = 800;

/// Deterministic prompt assembly + a single `ModelRuntime.responses`
/// call, per spec.md §4.4. The model is expected to return a JSON
/// object shaped like [`PlannerDraft`]; any parse/schema failure
/// surfaces as `PlannerError`, with no silent fallback.
pub struct DefaultPlannerService {
    facet_catalog: Arc<FacetCatalog>,
    registry: Arc<CapabilityRegistry>,
    runtime: Arc<dyn ModelRuntime>,
    telemetry: Arc<TelemetryService>,
    timeout: std::time::Duration,
    model: Option<String>,
}

impl DefaultPlannerService {
    pub fn new(
        facet_catalog: Arc<FacetCatalog>,
        registry: Arc<CapabilityRegistry>,
        runtime: Arc<dyn ModelRuntime>,
        telemetry: Arc<TelemetryService>,
        timeout: std::time::Duration,
        model: Option<String>,
    ) -> Self {
        Self {
            facet_catalog,
            registry,
            runtime,
            telemetry,
            timeout,
            model,
        }
    }

    fn facet_summary_table(&self) -> String {
        let mut rows = self.facet_catalog.list();
        rows.truncate(MAX_FACET_ROWS);
        let mut out = String::from("| Facet | Direction | Summary |\n|---|---|---|\n");
        for facet in rows {
            out.push_str(&format!("| {} | {:?} | {} |\n", facet.name, facet.direction, facet.summary));
        }
        out
    }

    fn capability_summary_table(&self, crcs: &CrcsSnapshot, active: &[flex_types::capability::CapabilityRecord]) -> String {
        let mut out = String::from(
            "| Capability ID | Display Name | Kind | Input Facets | Output Facets | Reason Codes |\n|---|---|---|---|---|---|\n",
        );
        for row in &crcs.rows {
            let Some(capability) = active.iter().find(|c| c.capability_id == row.capability_id) else {
                continue;
            };
            out.push_str(&format!(
                "| {} | {} | {:?} | {} | {} | {:?} |\n",
                capability.capability_id,
                capability.display_name,
                capability.kind,
                capability.input_facets.join(","),
                capability.output_facets.join(","),
                row.reason,
            ));
        }
        out
    }

    fn system_prompt(&self, crcs: &CrcsSnapshot, active: &[flex_types::capability::CapabilityRecord]) -> String {
        format!(
            "You are the Flex planner. Emit a JSON object {{\"nodes\": [...], \"metadata\": {{}}}} \
             where each node has {{stage, capabilityId?, kind?, inputFacets?, outputFacets?, rationale?, \
             instructions?, status, routing?, derived?, label?}}. Emit nothing else.\n\n\
             Facet catalog:\n{}\n\nCandidate capabilities:\n{}\n\n\
             Rules: reference only active capabilities; every output facet in the envelope's output \
             contract must be produced by some node; preserve completed nodes verbatim on replan.",
            self.facet_summary_table(),
            self.capability_summary_table(crcs, active),
        )
    }

    fn user_prompt(&self, request: &PlanRequest<'_>) -> String {
        let mut parts = vec![format!("Objective: {}", request.envelope.objective)];

        if !request.envelope.special_instructions.is_empty() {
            parts.push(format!(
                "Special instructions: {}",
                request.envelope.special_instructions.join("; ")
            ));
        }

        if !request.envelope.inputs.is_empty() {
            let mut input_lines = Vec::new();
            for (facet, value) in &request.envelope.inputs {
                let rendered = truncate_value(value, MAX_INPUT_VALUE_CHARS);
                input_lines.push(format!("- {facet}: {rendered}"));
            }
            parts.push(format!("Inputs:\n{}", input_lines.join("\n")));
        }

        parts.push(format!(
            "Output contract: {}",
            serde_json::to_string(&request.envelope.output_contract).unwrap_or_default()
        ));

        if let Some(snapshot) = request.existing_snapshot {
            parts.push(format!(
                "Existing plan version {} (pending nodes are editable, completed nodes must be preserved verbatim; \
                 the new version must exceed this one): {}",
                snapshot.plan_version,
                serde_json::to_string(&snapshot.snapshot).unwrap_or_default()
            ));
        }

        if !request.prior_diagnostics.is_empty() {
            let diag_lines: Vec<String> = request
                .prior_diagnostics
                .iter()
                .map(|d| format!("- [{}] {}", d.code, d.message))
                .collect();
            parts.push(format!(
                "The previous draft was rejected with these diagnostics; address them:\n{}",
                diag_lines.join("\n")
            ));
        }

        parts.push(
            "Checklist: every referenced capability must be active; every facet must exist in the catalog; \
             every required output facet must be covered."
                .to_string(),
        );

        parts.join("\n\n")
    }
}

#[async_trait]
impl PlannerService for DefaultPlannerService {
    async fn propose_plan(&self, request: PlanRequest<'_>) -> Result<PlannerDraft, PlannerError> {
        let crcs = self.registry.compute_crcs_snapshot(request.envelope, &[]).await;
        let active = self.registry.list_active().await;

        let system_prompt = self.system_prompt(&crcs, &active);
        let user_prompt = self.user_prompt(&request);

        let facet_rows = self.facet_catalog.list().len().min(MAX_FACET_ROWS);
        let capability_rows = crcs.rows.len().min(MAX_CAPABILITY_ROWS);

        self.telemetry
            .record_duration_ms(
                "flex.planner.prompt_size",
                &[("part", "system")],
                system_prompt.len() as f64,
            )
            .await;
        self.telemetry
            .record_duration_ms("flex.planner.prompt_size", &[("part", "user")], user_prompt.len() as f64)
            .await;
        self.telemetry
            .record_duration_ms("flex.planner.prompt_size", &[("part", "facet_rows")], facet_rows as f64)
            .await;
        self.telemetry
            .record_duration_ms(
                "flex.planner.prompt_size",
                &[("part", "capability_rows")],
                capability_rows as f64,
            )
            .await;
        self.telemetry.increment_counter("flex.planner.requests", &[]).await;

        // recordPlannerCrcsStats: total/mrcs/rowCap/missingPinned as a pseudo-gauge
        // (record_duration_ms is reused as a histogram of one sample, same as above),
        // plus a per-reason breakdown of the rows actually sent to the prompt.
        self.telemetry
            .record_duration_ms("flex.planner.crcs_stats", &[("field", "total_rows")], crcs.total_rows as f64)
            .await;
        self.telemetry
            .record_duration_ms("flex.planner.crcs_stats", &[("field", "mrcs_size")], crcs.mrcs_size as f64)
            .await;
        self.telemetry
            .record_duration_ms("flex.planner.crcs_stats", &[("field", "row_cap")], crcs.row_cap as f64)
            .await;
        self.telemetry
            .record_duration_ms(
                "flex.planner.crcs_stats",
                &[("field", "missing_pinned_capabilities")],
                crcs.missing_pinned_capabilities.len() as f64,
            )
            .await;
        for reason in [CrcsReason::PathReference, CrcsReason::PolicyReference, CrcsReason::Pinned, CrcsReason::Fallback] {
            let count = crcs.rows.iter().filter(|row| row.reason == reason).count();
            self.telemetry
                .record_duration_ms(
                    "flex.planner.crcs_reason_counts",
                    &[("reason", crcs_reason_label(reason))],
                    count as f64,
                )
                .await;
        }

        let text = self
            .runtime
            .responses(ResponsesRequest {
                system_prompt,
                user_prompt,
                model: self.model.clone(),
                timeout: self.timeout,
            })
            .await
            .map_err(|e| match e {
                flex_model::ModelError::Timeout(d) => PlannerError::Timeout(d),
                other => PlannerError::ParseFailed(other.to_string()),
            })?;

        let draft: PlannerDraft = serde_json::from_str(&text).map_err(|e| PlannerError::ParseFailed(e.to_string()))?;

        if draft.nodes.is_empty() {
            return Err(PlannerError::SchemaInvalid("draft has zero nodes".to_string()));
        }

        Ok(draft)
    }
}

fn crcs_reason_label(reason: CrcsReason) -> &'static str {
    match reason {
        CrcsReason::PathReference => "path_reference",
        CrcsReason::PolicyReference => "policy_reference",
        CrcsReason::Pinned => "pinned",
        CrcsReason::Fallback => "fallback",
    }
}

fn truncate_value(value: &Value, max_chars: usize) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let truncated: String = rendered.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flex_model::ScriptedModelRuntime;
    use flex_types::capability::{AgentType, CapabilityKind, CapabilityStatus, ContractSpec};
    use flex_types::envelope::{EnvelopeConstraints, OutputContract, Policies};
    use flex_types::facet::{Facet, FacetDirection};
    use serde_json::json;

    fn catalog() -> Arc<FacetCatalog> {
        Arc::new(FacetCatalog::new(vec![Facet {
            name: "creative_brief".to_string(),
            direction: FacetDirection::Output,
            schema: json!({"type": "string"}),
            summary: "brief".to_string(),
            version: 1,
        }]))
    }

    async fn registry_with_strategist(catalog: Arc<FacetCatalog>) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(catalog));
        registry
            .register(flex_types::capability::CapabilityRecord {
                capability_id: "strategist@1".to_string(),
                version: 1,
                agent_type: AgentType::Ai,
                kind: CapabilityKind::Structuring,
                display_name: "Strategist".to_string(),
                summary: String::new(),
                input_contract: ContractSpec::Facets(vec![]),
                output_contract: ContractSpec::Facets(vec!["creative_brief".to_string()]),
                input_facets: vec![],
                output_facets: vec!["creative_brief".to_string()],
                post_conditions: vec![],
                cost: Default::default(),
                heartbeat: None,
                instruction_templates: Default::default(),
                assignment_defaults: None,
                metadata: Default::default(),
                status: CapabilityStatus::Active,
                registered_at: chrono::Utc::now(),
                last_seen_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn propose_plan_parses_scripted_draft() {
        let catalog = catalog();
        let registry = registry_with_strategist(catalog.clone()).await;
        let runtime = Arc::new(ScriptedModelRuntime::new());
        runtime
            .push_default(json!({
                "nodes": [{"stage": "strategy", "capabilityId": "strategist@1", "outputFacets": ["creative_brief"], "status": "pending"}],
                "metadata": {}
            }))
            .await;
        let telemetry = Arc::new(TelemetryService::new());
        let planner = DefaultPlannerService::new(
            catalog,
            registry,
            runtime,
            telemetry,
            std::time::Duration::from_secs(5),
            None,
        );

        let envelope = TaskEnvelope {
            objective: "Plan a post".to_string(),
            inputs: Default::default(),
            constraints: EnvelopeConstraints::default(),
            policies: Policies::default(),
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: OutputContract::Facets {
                facets: vec!["creative_brief".to_string()],
                partial_allowed: false,
            },
        };

        let draft = planner
            .propose_plan(PlanRequest {
                envelope: &envelope,
                existing_snapshot: None,
                prior_diagnostics: vec![],
            })
            .await
            .unwrap();

        assert_eq!(draft.nodes.len(), 1);
        assert_eq!(draft.nodes[0].capability_id.as_deref(), Some("strategist@1"));
    }
}
