use std::sync::Arc;

use flex_types::envelope::OutputContract;
use flex_types::facet::FacetDirection;

use crate::capability_registry::CapabilityRegistry;
use crate::errors::Diagnostic;
use crate::facet_catalog::FacetCatalog;
use crate::planner::PlannerDraft;

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Checks a `PlannerDraft` against the live `CapabilityRegistry` and
/// `FacetCatalog` before it is allowed to become a plan snapshot, per
/// spec.md §4.5.
pub struct PlannerValidationService {
    facet_catalog: Arc<FacetCatalog>,
    registry: Arc<CapabilityRegistry>,
}

impl PlannerValidationService {
    pub fn new(facet_catalog: Arc<FacetCatalog>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { facet_catalog, registry }
    }

    pub async fn validate(&self, draft: &PlannerDraft, output_contract: &OutputContract) -> ValidationOutcome {
        let mut diagnostics = Vec::new();
        let active = self.registry.list_active().await;
        let mut covered_output_facets: Vec<String> = Vec::new();

        for node in &draft.nodes {
            if node.kind.as_deref() == Some("fallback") {
                diagnostics.push(
                    Diagnostic::new(
                        "FALLBACK_KIND_REJECTED",
                        format!("node {} declares the legacy fallback kind, which new plans may not use", node.stage),
                    )
                    .with_node(node.stage.clone()),
                );
                continue;
            }

            let is_structural = matches!(node.kind.as_deref(), Some("routing"));

            if !is_structural {
                match &node.capability_id {
                    None => {
                        diagnostics.push(
                            Diagnostic::new("CAPABILITY_MISSING", format!("node {} has no capabilityId", node.stage))
                                .with_node(node.stage.clone()),
                        );
                    }
                    Some(capability_id) => match active.iter().find(|c| &c.capability_id == capability_id) {
                        None => {
                            let registered = self.registry.get_by_id(capability_id).await.is_some();
                            let code = if registered {
                                "CAPABILITY_INACTIVE"
                            } else {
                                "CAPABILITY_NOT_REGISTERED"
                            };
                            diagnostics.push(
                                Diagnostic::new(code, format!("capability {capability_id} is not usable"))
                                    .with_node(node.stage.clone())
                                    .with_capability(capability_id.clone()),
                            );
                        }
                        Some(_) => {}
                    },
                }
            }

            for facet in &node.input_facets {
                if let Err(err) = self.facet_catalog.resolve_many(std::slice::from_ref(facet), FacetDirection::Input) {
                    diagnostics.push(facet_diagnostic(&node.stage, facet, &err));
                }
            }
            for facet in &node.output_facets {
                match self.facet_catalog.resolve_many(std::slice::from_ref(facet), FacetDirection::Output) {
                    Ok(_) => covered_output_facets.push(facet.clone()),
                    Err(err) => diagnostics.push(facet_diagnostic(&node.stage, facet, &err)),
                }
            }
        }

        if let OutputContract::Facets { facets, partial_allowed } = output_contract {
            if !partial_allowed {
                for required in facets {
                    if !covered_output_facets.contains(required) {
                        diagnostics.push(
                            Diagnostic::new(
                                "OUTPUT_FACET_UNCOVERED",
                                format!("no node produces required output facet {required}"),
                            )
                            .with_facet(required.clone()),
                        );
                    }
                }
            }
        }

        ValidationOutcome {
            ok: diagnostics.is_empty(),
            diagnostics,
        }
    }
}

fn facet_diagnostic(stage: &str, facet: &str, err: &crate::errors::FacetCatalogError) -> Diagnostic {
    let code = match err {
        crate::errors::FacetCatalogError::UnknownFacet(_) => "UNKNOWN_FACET",
        crate::errors::FacetCatalogError::FacetDirectionMismatch { .. } => "FACET_CONTRACT_DIRECTION_MISMATCH",
    };
    Diagnostic::new(code, err.to_string())
        .with_node(stage.to_string())
        .with_facet(facet.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DraftNodeSpec;
    use flex_types::capability::{AgentType, CapabilityKind, CapabilityRecord, CapabilityStatus, ContractSpec};
    use flex_types::facet::Facet;
    use serde_json::json;

    fn catalog() -> Arc<FacetCatalog> {
        Arc::new(FacetCatalog::new(vec![Facet {
            name: "creative_brief".to_string(),
            direction: FacetDirection::Output,
            schema: json!({"type": "string"}),
            summary: String::new(),
            version: 1,
        }]))
    }

    async fn registry(catalog: Arc<FacetCatalog>) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(catalog));
        registry
            .register(CapabilityRecord {
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

    fn draft_node(capability_id: Option<&str>, output_facets: Vec<&str>) -> DraftNodeSpec {
        DraftNodeSpec {
            stage: "strategy".to_string(),
            capability_id: capability_id.map(String::from),
            kind: None,
            input_facets: vec![],
            output_facets: output_facets.into_iter().map(String::from).collect(),
            rationale: None,
            instructions: None,
            status: "pending".to_string(),
            routing: None,
            derived: None,
            label: None,
        }
    }

    #[tokio::test]
    async fn valid_draft_passes() {
        let catalog = catalog();
        let registry = registry(catalog.clone()).await;
        let service = PlannerValidationService::new(catalog, registry);
        let draft = PlannerDraft {
            nodes: vec![draft_node(Some("strategist@1"), vec!["creative_brief"])],
            metadata: Default::default(),
        };
        let outcome = service
            .validate(
                &draft,
                &OutputContract::Facets {
                    facets: vec!["creative_brief".to_string()],
                    partial_allowed: false,
                },
            )
            .await;
        assert!(outcome.ok, "{:?}", outcome.diagnostics);
    }

    #[tokio::test]
    async fn missing_capability_id_is_flagged() {
        let catalog = catalog();
        let registry = registry(catalog.clone()).await;
        let service = PlannerValidationService::new(catalog, registry);
        let draft = PlannerDraft {
            nodes: vec![draft_node(None, vec!["creative_brief"])],
            metadata: Default::default(),
        };
        let outcome = service
            .validate(&draft, &OutputContract::Freeform)
            .await;
        assert!(!outcome.ok);
        assert!(outcome.diagnostics.iter().any(|d| d.code == "CAPABILITY_MISSING"));
    }

    #[tokio::test]
    async fn uncovered_required_output_facet_is_flagged() {
        let catalog = catalog();
        let registry = registry(catalog.clone()).await;
        let service = PlannerValidationService::new(catalog, registry);
        let draft = PlannerDraft {
            nodes: vec![draft_node(Some("strategist@1"), vec![])],
            metadata: Default::default(),
        };
        let outcome = service
            .validate(
                &draft,
                &OutputContract::Facets {
                    facets: vec!["creative_brief".to_string()],
                    partial_allowed: false,
                },
            )
            .await;
        assert!(!outcome.ok);
        assert!(outcome.diagnostics.iter().any(|d| d.code == "OUTPUT_FACET_UNCOVERED"));
    }
}
