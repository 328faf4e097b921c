use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flex_types::capability::{AgentType, CapabilityRecord, OnDecline};
use flex_types::envelope::TaskEnvelope;
use flex_types::event::{FlexEvent, FlexEventType};
use flex_types::hitl::{HitlResponse, HitlResponseType, HumanTask};
use flex_types::plan::{Edge, FlexNode, FlexPlan, NodeContracts, NodeError, NodeFacets, NodeKind, NodeProvenance, NodeStatus};
use flex_types::run::RunStatus;
pub use flex_wire::{DeclineInfo, ResumeSubmission};

use crate::capability_registry::CapabilityRegistry;
use crate::engine::{ExecutionEngine, ExecutionOutcome};
use crate::errors::{EngineError, PersistenceError, PlannerDraftRejected};
use crate::facet_catalog::FacetCatalog;
use crate::persistence::{NodeUpdate, PendingHumanTaskFilters, PersistenceStore, SavePlanSnapshotOptions};
use crate::planner::{DraftNodeSpec, PlanRequest, PlannerDraft, PlannerService};
use crate::run_context::RunContext;
use crate::validation::PlannerValidationService;
use flex_telemetry::EventBus;

/// `{runId, status, output?}`, per spec.md §6.1. `status` is one of
/// `completed | awaiting_hitl | awaiting_human | failed | cancelled`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub planner_max_attempts: u32,
    /// Bounds mid-run re-invocations of the planner triggered by a node's
    /// post-conditions/runtime policies failing to clear, or by the
    /// goal-condition check in `compose_final_output` rejecting the
    /// completed plan's output, per spec.md §4.7.
    pub max_replans: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { planner_max_attempts: 3, max_replans: 2 }
    }
}

/// Thin state machine composing §4.1-§4.9: resolve run, plan, execute,
/// persist, translate the engine's outcome into a terminal `complete`
/// frame. Mirrors the teacher's top-level session loop, one run at a
/// time instead of one turn at a time.
pub struct RunCoordinator {
    store: Arc<dyn PersistenceStore>,
    planner: Arc<dyn PlannerService>,
    validator: Arc<PlannerValidationService>,
    registry: Arc<CapabilityRegistry>,
    facet_catalog: Arc<FacetCatalog>,
    engine: Arc<ExecutionEngine>,
    event_bus: Arc<EventBus>,
    config: CoordinatorConfig,
}

impl RunCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        planner: Arc<dyn PlannerService>,
        validator: Arc<PlannerValidationService>,
        registry: Arc<CapabilityRegistry>,
        facet_catalog: Arc<FacetCatalog>,
        engine: Arc<ExecutionEngine>,
        event_bus: Arc<EventBus>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            planner,
            validator,
            registry,
            facet_catalog,
            engine,
            event_bus,
            config,
        }
    }

    fn emit(&self, event: FlexEvent) {
        self.event_bus.publish(event);
    }

    /// Passthrough to the backing store's human-task listing, per
    /// spec.md §4.9 — the HTTP gateway has no other handle on
    /// persistence.
    pub async fn list_pending_human_tasks(
        &self,
        filters: PendingHumanTaskFilters,
    ) -> Result<Vec<HumanTask>, PersistenceError> {
        self.store.list_pending_human_tasks(filters).await
    }

    pub async fn run(
        &self,
        envelope: TaskEnvelope,
        correlation_id: Option<String>,
        resume_submission: Option<ResumeSubmission>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        envelope.validate().map_err(EngineError::Failed)?;

        let (run_id, mut plan, run_context) = self.resolve_run(&envelope).await?;

        self.emit(
            FlexEvent::new(FlexEventType::Start, run_id.clone(), FlexEvent::empty_payload())
                .with_correlation(correlation_id.clone()),
        );

        match self
            .run_inner(&run_id, &envelope, &mut plan, &run_context, resume_submission, correlation_id.clone(), cancel)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let _ = self.store.update_status(&run_id, RunStatus::Failed).await;
                self.emit(
                    FlexEvent::new(
                        FlexEventType::Complete,
                        run_id.clone(),
                        serde_json::json!({"status": "failed", "error": flex_telemetry::redact_text(&err.to_string())}),
                    )
                    .with_correlation(correlation_id),
                );
                Ok(RunOutcome {
                    run_id,
                    status: "failed".to_string(),
                    output: None,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        plan: &mut FlexPlan,
        run_context: &RunContext,
        resume_submission: Option<ResumeSubmission>,
        correlation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        if let Some(submission) = resume_submission {
            if let Some(outcome) = self.apply_resume(run_id, plan, run_context, submission, correlation_id.clone()).await? {
                return Ok(outcome);
            }
        } else if plan.nodes.is_empty() {
            self.request_plan(run_id, envelope, plan, correlation_id.clone()).await?;
        }

        let mut replans = 0;
        loop {
            let outcome = self
                .engine
                .execute(run_id, plan, run_context, correlation_id.clone(), &envelope.policies.runtime, cancel)
                .await?;

            let signal = match outcome {
                ExecutionOutcome::NeedsReplan(signal) => Some(signal.reason),
                _ => match self.finish(run_id, envelope, plan, run_context, outcome, correlation_id.clone()).await {
                    Ok(result) => return Ok(result),
                    Err(EngineError::Validation(validation_err)) if replans < self.config.max_replans => {
                        Some(format!("goal condition failed: {validation_err}"))
                    }
                    Err(err) => return Err(err),
                },
            };

            let Some(reason) = signal else {
                unreachable!("replan signal always set when not returning early");
            };

            if replans >= self.config.max_replans {
                return Err(EngineError::Failed(format!("replan budget exhausted: {reason}")));
            }
            replans += 1;

            let event_type = if reason.starts_with("goal condition failed") {
                FlexEventType::GoalConditionFailed
            } else {
                FlexEventType::PolicyTriggered
            };
            self.emit(
                FlexEvent::new(event_type, run_id, serde_json::json!({"reason": reason, "attempt": replans}))
                    .with_correlation(correlation_id.clone())
                    .with_plan_version(Some(plan.version)),
            );

            self.replan(run_id, envelope, plan, correlation_id.clone(), reason).await?;
        }
    }

    /// Mid-run re-invocation of the planner, per spec.md §4.7's replan
    /// trigger mechanism. Grounded on `request_plan`'s draft/validate
    /// loop, extended to preserve every already-`Completed`/`Skipped`
    /// node verbatim and append only the planner's new nodes.
    async fn replan(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        plan: &mut FlexPlan,
        correlation_id: Option<String>,
        reason: String,
    ) -> Result<(), EngineError> {
        let existing_snapshot = self.store.load_plan_snapshot(run_id, None).await?;
        let mut prior_diagnostics = vec![crate::errors::Diagnostic::new("replan_trigger", reason)];

        for _attempt in 0..self.config.planner_max_attempts {
            let draft = self
                .planner
                .propose_plan(PlanRequest {
                    envelope,
                    existing_snapshot: existing_snapshot.as_ref(),
                    prior_diagnostics: prior_diagnostics.clone(),
                })
                .await?;

            let outcome = self.validator.validate(&draft, &envelope.output_contract).await;
            if !outcome.ok {
                prior_diagnostics = outcome.diagnostics;
                continue;
            }

            let fresh_nodes = self.materialize_nodes(&draft).await?;
            let preserved: Vec<FlexNode> = plan
                .nodes
                .iter()
                .filter(|n| matches!(n.status, NodeStatus::Completed | NodeStatus::Skipped))
                .cloned()
                .collect();
            let preserved_ids: std::collections::HashSet<&str> = preserved.iter().map(|n| n.id.as_str()).collect();
            let mut nodes = preserved;
            nodes.extend(fresh_nodes.into_iter().filter(|n| !preserved_ids.contains(n.id.as_str())));
            let edges = chain_edges(&nodes);
            let new_version = plan.version + 1;

            self.store
                .save_plan_snapshot(
                    run_id,
                    new_version,
                    nodes.clone(),
                    SavePlanSnapshotOptions {
                        edges: Some(edges.clone()),
                        plan_metadata: Some(draft.metadata.clone()),
                        ..Default::default()
                    },
                )
                .await?;

            plan.version = new_version;
            plan.nodes = nodes;
            plan.edges = edges;
            plan.metadata = draft.metadata;

            self.emit(
                FlexEvent::new(FlexEventType::PlanUpdated, run_id, serde_json::json!({"nodeCount": plan.nodes.len()}))
                    .with_correlation(correlation_id)
                    .with_plan_version(Some(plan.version)),
            );
            return Ok(());
        }

        Err(EngineError::DraftRejected(PlannerDraftRejected {
            diagnostics: prior_diagnostics,
        }))
    }

    /// Resolves `runId` per spec.md §4.8 step 1: `resumeRunId` (or
    /// `metadata.runId`) loads an existing run and its latest plan
    /// snapshot; otherwise a new run is allocated in `pending`.
    async fn resolve_run(&self, envelope: &TaskEnvelope) -> Result<(String, FlexPlan, RunContext), EngineError> {
        if let Some(existing_id) = envelope.resume_run_id() {
            let loaded = self
                .store
                .load_flex_run(existing_id)
                .await?
                .ok_or_else(|| PersistenceError::RunNotFound(existing_id.to_string()))?;

            let run_context = match loaded.run.context_snapshot {
                Some(snapshot) => RunContext::from_snapshot(snapshot),
                None => RunContext::new(),
            };

            let plan = match self.store.load_plan_snapshot(existing_id, None).await? {
                Some(snapshot) => FlexPlan {
                    run_id: existing_id.to_string(),
                    version: snapshot.plan_version,
                    created_at: snapshot.created_at,
                    nodes: snapshot.snapshot.nodes,
                    edges: snapshot.snapshot.edges,
                    metadata: snapshot.snapshot.metadata,
                },
                None => empty_plan(existing_id),
            };

            self.store.update_status(existing_id, RunStatus::Running).await?;
            Ok((existing_id.to_string(), plan, run_context))
        } else {
            let run_id = Uuid::new_v4().to_string();
            self.store
                .create_or_update_run(&run_id, envelope, RunStatus::Pending, Default::default())
                .await?;
            self.store.update_status(&run_id, RunStatus::Running).await?;
            Ok((run_id.clone(), empty_plan(&run_id), RunContext::new()))
        }
    }

    /// Requests a draft, validates it, and persists the first valid one
    /// as a new plan version, per spec.md §4.4/§4.5. Bounded by
    /// `plannerMaxAttempts`; a draft's diagnostics are fed back into the
    /// next attempt's prompt.
    async fn request_plan(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        plan: &mut FlexPlan,
        correlation_id: Option<String>,
    ) -> Result<(), EngineError> {
        self.emit(
            FlexEvent::new(FlexEventType::PlanRequested, run_id, FlexEvent::empty_payload())
                .with_correlation(correlation_id.clone()),
        );

        let existing_snapshot = self.store.load_plan_snapshot(run_id, None).await?;
        let mut prior_diagnostics = Vec::new();

        for _attempt in 0..self.config.planner_max_attempts {
            let draft = self
                .planner
                .propose_plan(PlanRequest {
                    envelope,
                    existing_snapshot: existing_snapshot.as_ref(),
                    prior_diagnostics: prior_diagnostics.clone(),
                })
                .await?;

            let outcome = self.validator.validate(&draft, &envelope.output_contract).await;
            if outcome.ok {
                let nodes = self.materialize_nodes(&draft).await?;
                let edges = chain_edges(&nodes);
                let new_version = plan.version.max(existing_snapshot.as_ref().map(|s| s.plan_version).unwrap_or(0)) + 1;

                self.store
                    .save_plan_snapshot(
                        run_id,
                        new_version,
                        nodes.clone(),
                        SavePlanSnapshotOptions {
                            edges: Some(edges.clone()),
                            plan_metadata: Some(draft.metadata.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;

                plan.version = new_version;
                plan.nodes = nodes;
                plan.edges = edges;
                plan.metadata = draft.metadata;

                self.emit(
                    FlexEvent::new(
                        FlexEventType::PlanGenerated,
                        run_id,
                        serde_json::json!({"nodeCount": plan.nodes.len()}),
                    )
                    .with_correlation(correlation_id)
                    .with_plan_version(Some(plan.version)),
                );
                return Ok(());
            }

            self.emit(
                FlexEvent::new(
                    FlexEventType::PlanRejected,
                    run_id,
                    serde_json::json!({"diagnostics": outcome.diagnostics}),
                )
                .with_correlation(correlation_id.clone()),
            );
            prior_diagnostics = outcome.diagnostics;
        }

        Err(EngineError::DraftRejected(PlannerDraftRejected {
            diagnostics: prior_diagnostics,
        }))
    }

    /// The draft carries no edges of its own (spec.md §4.4's
    /// `PlannerDraft` shape has none); the coordinator chains nodes in
    /// the order the planner emitted them, matching every linear example
    /// in spec.md §8 ("strategist -> copywriter -> director").
    async fn materialize_nodes(&self, draft: &PlannerDraft) -> Result<Vec<FlexNode>, EngineError> {
        let mut nodes = Vec::with_capacity(draft.nodes.len());
        for draft_node in &draft.nodes {
            let capability = match &draft_node.capability_id {
                Some(id) => self.registry.get_by_id(id).await,
                None => None,
            };
            let kind = node_kind_for(draft_node, capability.as_ref())?;
            let compiled = self
                .facet_catalog
                .compile_contracts(&draft_node.input_facets, &draft_node.output_facets)
                .ok();

            nodes.push(FlexNode {
                id: draft_node.stage.clone(),
                kind,
                capability_id: draft_node.capability_id.clone(),
                label: draft_node.label.clone().unwrap_or_else(|| draft_node.stage.clone()),
                contracts: NodeContracts {
                    input: compiled.as_ref().map(|c| c.input_schema.clone()),
                    output: compiled.as_ref().map(|c| c.output_schema.clone()),
                },
                facets: NodeFacets {
                    input: draft_node.input_facets.clone(),
                    output: draft_node.output_facets.clone(),
                },
                provenance: NodeProvenance::default(),
                routing: draft_node.routing.clone(),
                rationale: draft_node.rationale.clone(),
                status: NodeStatus::Pending,
                started_at: None,
                completed_at: None,
                output: None,
                error: None,
                post_condition_results: None,
            });
        }
        Ok(nodes)
    }

    /// Applies a `resumeSubmission` against a suspended node, per
    /// spec.md §4.8 step 2. Returns `Some(outcome)` when the submission
    /// itself determines the terminal result (decline+fail_run, or a
    /// validation failure that must keep the node `awaiting_human`);
    /// `None` means resume succeeded and execution should continue.
    async fn apply_resume(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        run_context: &RunContext,
        submission: ResumeSubmission,
        correlation_id: Option<String>,
    ) -> Result<Option<RunOutcome>, EngineError> {
        let node_id = submission.node_id.clone();
        let node = plan
            .node(&node_id)
            .cloned()
            .ok_or_else(|| EngineError::Failed(format!("resume submission references unknown node {node_id}")))?;

        if !matches!(node.status, NodeStatus::AwaitingHitl | NodeStatus::AwaitingHuman) {
            return Err(EngineError::Failed(format!("node {node_id} is not awaiting input")));
        }

        if let Some(decline) = submission.decline {
            return self.apply_decline(run_id, plan, &node, decline, correlation_id).await;
        }

        let output = submission.output.unwrap_or(Value::Null);
        if let Err(message) = self.validate_submission_output(&node, &output) {
            let error = NodeError {
                name: "FlexValidationError".to_string(),
                message: message.clone(),
                diagnostics: vec![],
            };
            self.store
                .mark_node(run_id, &node_id, NodeUpdate { error: Some(error), ..Default::default() })
                .await?;
            self.emit(
                FlexEvent::new(FlexEventType::ValidationError, run_id, serde_json::json!({"message": message}))
                    .with_node(node_id.clone())
                    .with_correlation(correlation_id.clone()),
            );
            self.emit(
                FlexEvent::new(FlexEventType::NodeError, run_id, serde_json::json!({"message": message}))
                    .with_node(node_id)
                    .with_correlation(correlation_id),
            );
            // node.status is left untouched: awaiting_human resumes revert
            // to awaiting_human, never error, so the operator can resubmit.
            return Ok(Some(RunOutcome {
                run_id: run_id.to_string(),
                status: run_status_label(&node.status),
                output: None,
            }));
        }

        if node.status == NodeStatus::AwaitingHitl {
            self.resolve_hitl_ledger(run_id, &node_id, &output, submission.submitted_at).await?;
        }

        let now = Utc::now();
        self.store
            .mark_node(
                run_id,
                &node_id,
                NodeUpdate {
                    status: Some(NodeStatus::Completed),
                    output: Some(output.clone()),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node_id) {
            plan_node.status = NodeStatus::Completed;
            plan_node.output = Some(output.clone());
            plan_node.completed_at = Some(now);
        }
        run_context.update_from_node(&node, &output).await;

        self.emit(
            FlexEvent::new(
                FlexEventType::NodeComplete,
                run_id,
                serde_json::json!({"capabilityId": node.capability_id, "output": output}),
            )
            .with_node(node_id)
            .with_correlation(correlation_id)
            .with_plan_version(Some(plan.version)),
        );

        Ok(None)
    }

    async fn resolve_hitl_ledger(
        &self,
        run_id: &str,
        node_id: &str,
        output: &Value,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let (requests, _) = self.store.load_hitl_ledger(run_id).await?;
        let Some(request) = requests
            .iter()
            .find(|r| r.pending_node_id.as_deref() == Some(node_id) && r.status == flex_types::hitl::HitlStatus::Pending)
        else {
            return Ok(());
        };
        let response = HitlResponse {
            id: Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            response_type: HitlResponseType::Freeform,
            selected_option_id: None,
            freeform_text: Some(output.to_string()),
            approved: None,
            responder_id: None,
            responder_display_name: None,
            created_at: submitted_at,
            metadata: None,
        };
        self.store.save_hitl_response(response).await?;
        Ok(())
    }

    async fn apply_decline(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        node: &FlexNode,
        decline: DeclineInfo,
        correlation_id: Option<String>,
    ) -> Result<Option<RunOutcome>, EngineError> {
        let node_id = node.id.clone();
        let now = Utc::now();
        let error = NodeError {
            name: "Declined".to_string(),
            message: decline.reason.clone(),
            diagnostics: vec![],
        };
        self.store
            .mark_node(
                run_id,
                &node_id,
                NodeUpdate {
                    status: Some(NodeStatus::Error),
                    error: Some(error.clone()),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node_id) {
            plan_node.status = NodeStatus::Error;
            plan_node.error = Some(error);
            plan_node.completed_at = Some(now);
        }
        self.emit(
            FlexEvent::new(
                FlexEventType::NodeComplete,
                run_id,
                serde_json::json!({"outcome": "declined", "decline": {"reason": decline.reason, "note": decline.note}}),
            )
            .with_node(node_id.clone())
            .with_correlation(correlation_id.clone()),
        );

        let on_decline = match &node.capability_id {
            Some(id) => self
                .registry
                .get_by_id(id)
                .await
                .and_then(|c| c.assignment_defaults)
                .map(|d| d.on_decline)
                .unwrap_or(OnDecline::FailRun),
            None => OnDecline::FailRun,
        };

        if on_decline == OnDecline::FailRun {
            self.store.update_status(run_id, RunStatus::Failed).await?;
            self.emit(
                FlexEvent::new(
                    FlexEventType::Complete,
                    run_id,
                    serde_json::json!({"status": "failed", "error": "declined"}),
                )
                .with_correlation(correlation_id),
            );
            return Ok(Some(RunOutcome {
                run_id: run_id.to_string(),
                status: "failed".to_string(),
                output: None,
            }));
        }

        // requeue: the node goes back to pending for another assignment pass.
        self.store
            .mark_node(run_id, &node_id, NodeUpdate { status: Some(NodeStatus::Pending), ..Default::default() })
            .await?;
        if let Some(plan_node) = plan.node_mut(&node_id) {
            plan_node.status = NodeStatus::Pending;
            plan_node.error = None;
            plan_node.completed_at = None;
        }
        Ok(None)
    }

    fn validate_submission_output(&self, node: &FlexNode, output: &Value) -> Result<(), String> {
        for facet_name in &node.facets.output {
            if self.facet_catalog.get(facet_name).is_none() {
                return Err(format!("node declares unknown output facet {facet_name}"));
            }
            if output.get(facet_name).is_none() {
                return Err(format!("missing required output facet {facet_name}"));
            }
        }
        Ok(())
    }

    /// Translates the engine's `ExecutionOutcome` into the terminal
    /// `complete` frame and `RunOutcome`, per spec.md §4.8 step 5.
    async fn finish(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        plan: &mut FlexPlan,
        run_context: &RunContext,
        outcome: ExecutionOutcome,
        correlation_id: Option<String>,
    ) -> Result<RunOutcome, EngineError> {
        self.store.save_run_context(run_id, run_context.snapshot().await).await?;

        match outcome {
            ExecutionOutcome::Completed => {
                let output = run_context.compose_final_output(&envelope.output_contract, plan).await?;
                self.store.record_result(run_id, output.clone(), RunStatus::Completed).await?;
                self.emit(
                    FlexEvent::new(
                        FlexEventType::Complete,
                        run_id,
                        serde_json::json!({"status": "completed", "output": output}),
                    )
                    .with_correlation(correlation_id)
                    .with_plan_version(Some(plan.version)),
                );
                Ok(RunOutcome {
                    run_id: run_id.to_string(),
                    status: "completed".to_string(),
                    output: Some(output),
                })
            }
            ExecutionOutcome::AwaitingHuman(assignment) => {
                self.store.update_status(run_id, RunStatus::AwaitingHuman).await?;
                self.emit(
                    FlexEvent::new(
                        FlexEventType::Complete,
                        run_id,
                        serde_json::json!({"status": "awaiting_human", "assignment": assignment.assignment}),
                    )
                    .with_correlation(correlation_id)
                    .with_plan_version(Some(plan.version)),
                );
                Ok(RunOutcome {
                    run_id: run_id.to_string(),
                    status: "awaiting_human".to_string(),
                    output: None,
                })
            }
            ExecutionOutcome::AwaitingHitl(awaiting) => {
                self.store.update_status(run_id, RunStatus::AwaitingHitl).await?;
                self.emit(
                    FlexEvent::new(
                        FlexEventType::Complete,
                        run_id,
                        serde_json::json!({
                            "status": "pending_hitl",
                            "pendingRequestId": awaiting.pending_request_id,
                            "question": awaiting.question,
                        }),
                    )
                    .with_correlation(correlation_id)
                    .with_plan_version(Some(plan.version)),
                );
                Ok(RunOutcome {
                    run_id: run_id.to_string(),
                    status: "awaiting_hitl".to_string(),
                    output: None,
                })
            }
            ExecutionOutcome::Cancelled => {
                self.emit(
                    FlexEvent::new(FlexEventType::Complete, run_id, serde_json::json!({"status": "cancelled"}))
                        .with_correlation(correlation_id)
                        .with_plan_version(Some(plan.version)),
                );
                Ok(RunOutcome {
                    run_id: run_id.to_string(),
                    status: "cancelled".to_string(),
                    output: None,
                })
            }
        }
    }
}

fn empty_plan(run_id: &str) -> FlexPlan {
    FlexPlan {
        run_id: run_id.to_string(),
        version: 0,
        created_at: Utc::now(),
        nodes: vec![],
        edges: vec![],
        metadata: Default::default(),
    }
}

fn chain_edges(nodes: &[FlexNode]) -> Vec<Edge> {
    nodes
        .windows(2)
        .map(|pair| Edge {
            from: pair[0].id.clone(),
            to: pair[1].id.clone(),
        })
        .collect()
}

fn run_status_label(status: &NodeStatus) -> String {
    match status {
        NodeStatus::AwaitingHitl => "awaiting_hitl".to_string(),
        _ => "awaiting_human".to_string(),
    }
}

fn node_kind_for(draft: &DraftNodeSpec, capability: Option<&CapabilityRecord>) -> Result<NodeKind, EngineError> {
    match draft.kind.as_deref() {
        Some("routing") => return Ok(NodeKind::Routing),
        Some("fallback") => return Ok(NodeKind::Fallback),
        _ => {}
    }
    match capability {
        Some(capability) => match Option::<NodeKind>::from(capability.kind) {
            Some(kind) => Ok(kind),
            None => Ok(match capability.agent_type {
                AgentType::Ai => NodeKind::Ai,
                AgentType::Human => NodeKind::Human,
            }),
        },
        None => Err(EngineError::Failed(format!("cannot determine node kind for stage {}", draft.stage))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::HitlService;
    use flex_model::ScriptedModelRuntime;
    use flex_types::capability::{AssignmentDefaults, CapabilityKind, CapabilityStatus, ContractSpec};
    use flex_types::envelope::{EnvelopeConstraints, OutputContract, Policies};
    use flex_types::facet::{Facet, FacetDirection};
    use flex_telemetry::TelemetryService;
    use serde_json::json;

    fn catalog() -> Arc<FacetCatalog> {
        Arc::new(FacetCatalog::new(vec![
            Facet {
                name: "clarification_response".to_string(),
                direction: FacetDirection::Output,
                schema: json!({"type": "object"}),
                summary: String::new(),
                version: 1,
            },
            Facet {
                name: "final_output".to_string(),
                direction: FacetDirection::Output,
                schema: json!({"type": "string"}),
                summary: String::new(),
                version: 1,
            },
        ]))
    }

    async fn registry_with_clarify_and_finalize(catalog: Arc<FacetCatalog>) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(catalog));
        registry
            .register(CapabilityRecord {
                capability_id: "human.clarify@1".to_string(),
                version: 1,
                agent_type: AgentType::Human,
                kind: CapabilityKind::Execution,
                display_name: "Clarify".to_string(),
                summary: String::new(),
                input_contract: ContractSpec::Facets(vec![]),
                output_contract: ContractSpec::Facets(vec!["clarification_response".to_string()]),
                input_facets: vec![],
                output_facets: vec!["clarification_response".to_string()],
                post_conditions: vec![],
                cost: Default::default(),
                heartbeat: None,
                instruction_templates: Default::default(),
                assignment_defaults: Some(AssignmentDefaults {
                    role: "operator".to_string(),
                    timeout_seconds: 900,
                    on_decline: OnDecline::FailRun,
                    max_notifications: 1,
                }),
                metadata: Default::default(),
                status: CapabilityStatus::Active,
                registered_at: chrono::Utc::now(),
                last_seen_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        registry
            .register(CapabilityRecord {
                capability_id: "finalizer@1".to_string(),
                version: 1,
                agent_type: AgentType::Ai,
                kind: CapabilityKind::Execution,
                display_name: "Finalizer".to_string(),
                summary: String::new(),
                input_contract: ContractSpec::Facets(vec!["clarification_response".to_string()]),
                output_contract: ContractSpec::Facets(vec!["final_output".to_string()]),
                input_facets: vec!["clarification_response".to_string()],
                output_facets: vec!["final_output".to_string()],
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

    fn envelope() -> TaskEnvelope {
        TaskEnvelope {
            objective: "Clarify then finalize".to_string(),
            inputs: Default::default(),
            constraints: EnvelopeConstraints::default(),
            policies: Policies::default(),
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: OutputContract::Facets {
                facets: vec!["final_output".to_string()],
                partial_allowed: false,
            },
        }
    }

    fn resumed_envelope(run_id: &str) -> TaskEnvelope {
        TaskEnvelope {
            constraints: EnvelopeConstraints {
                resume_run_id: Some(run_id.to_string()),
                extra: Default::default(),
            },
            ..envelope()
        }
    }

    #[allow(clippy::type_complexity)]
    fn build_coordinator(
        catalog: Arc<FacetCatalog>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn PersistenceStore>,
        planner_runtime: Arc<ScriptedModelRuntime>,
        engine_runtime: Arc<ScriptedModelRuntime>,
    ) -> RunCoordinator {
        let telemetry = Arc::new(TelemetryService::new());
        let planner = Arc::new(crate::planner::DefaultPlannerService::new(
            catalog.clone(),
            registry.clone(),
            planner_runtime,
            telemetry.clone(),
            std::time::Duration::from_secs(5),
            None,
        ));
        let validator = Arc::new(PlannerValidationService::new(catalog.clone(), registry.clone()));
        let hitl = Arc::new(HitlService::new(store.clone(), 3));
        let event_bus = Arc::new(EventBus::new());
        let engine = Arc::new(ExecutionEngine::new(
            catalog.clone(),
            registry.clone(),
            store.clone(),
            engine_runtime,
            hitl,
            telemetry,
            event_bus.clone(),
        ));
        RunCoordinator::new(store, planner, validator, registry, catalog, engine, event_bus, CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn human_node_suspends_then_resumes_to_completion() {
        let catalog = catalog();
        let registry = registry_with_clarify_and_finalize(catalog.clone()).await;
        let store: Arc<dyn PersistenceStore> = Arc::new(crate::persistence::JsonFilePersistenceStore::in_memory().await);
        let planner_runtime = Arc::new(ScriptedModelRuntime::new());
        planner_runtime
            .push_default(json!({
                "nodes": [
                    {"stage": "clarify", "capabilityId": "human.clarify@1", "outputFacets": ["clarification_response"], "status": "pending"},
                    {"stage": "finalize", "capabilityId": "finalizer@1", "inputFacets": ["clarification_response"], "outputFacets": ["final_output"], "status": "pending"}
                ],
                "metadata": {}
            }))
            .await;
        let engine_runtime = Arc::new(ScriptedModelRuntime::new());
        engine_runtime
            .push_for("finalizer@1", json!({"final_output": "Generated launch copy"}))
            .await;

        let coordinator = build_coordinator(catalog, registry, store, planner_runtime, engine_runtime);
        let cancel = CancellationToken::new();

        let first = coordinator.run(envelope(), None, None, &cancel).await.unwrap();
        assert_eq!(first.status, "awaiting_human");

        let resume = ResumeSubmission {
            node_id: "clarify".to_string(),
            output: Some(json!({"clarification_response": {"budget": "$10k", "timeline": "Q4"}})),
            decline: None,
            submitted_at: chrono::Utc::now(),
        };
        let second = coordinator
            .run(resumed_envelope(&first.run_id), None, Some(resume), &cancel)
            .await
            .unwrap();

        assert_eq!(second.status, "completed");
        assert_eq!(second.output.unwrap()["final_output"], json!("Generated launch copy"));
    }

    #[tokio::test]
    async fn decline_with_fail_run_fails_the_run() {
        let catalog = catalog();
        let registry = registry_with_clarify_and_finalize(catalog.clone()).await;
        let store: Arc<dyn PersistenceStore> = Arc::new(crate::persistence::JsonFilePersistenceStore::in_memory().await);
        let planner_runtime = Arc::new(ScriptedModelRuntime::new());
        planner_runtime
            .push_default(json!({
                "nodes": [
                    {"stage": "clarify", "capabilityId": "human.clarify@1", "outputFacets": ["clarification_response"], "status": "pending"}
                ],
                "metadata": {}
            }))
            .await;
        let engine_runtime = Arc::new(ScriptedModelRuntime::new());

        let coordinator = build_coordinator(catalog, registry, store, planner_runtime, engine_runtime);
        let cancel = CancellationToken::new();

        let first = coordinator
            .run(
                TaskEnvelope {
                    output_contract: OutputContract::Freeform,
                    ..envelope()
                },
                None,
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(first.status, "awaiting_human");

        let resume = ResumeSubmission {
            node_id: "clarify".to_string(),
            output: None,
            decline: Some(DeclineInfo {
                reason: "Insufficient details".to_string(),
                note: None,
            }),
            submitted_at: chrono::Utc::now(),
        };
        let second = coordinator
            .run(
                TaskEnvelope {
                    output_contract: OutputContract::Freeform,
                    ..resumed_envelope(&first.run_id)
                },
                None,
                Some(resume),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(second.status, "failed");
    }

    #[tokio::test]
    async fn invalid_resume_submission_keeps_node_awaiting_human() {
        let catalog = catalog();
        let registry = registry_with_clarify_and_finalize(catalog.clone()).await;
        let store: Arc<dyn PersistenceStore> = Arc::new(crate::persistence::JsonFilePersistenceStore::in_memory().await);
        let planner_runtime = Arc::new(ScriptedModelRuntime::new());
        planner_runtime
            .push_default(json!({
                "nodes": [
                    {"stage": "clarify", "capabilityId": "human.clarify@1", "outputFacets": ["clarification_response"], "status": "pending"},
                    {"stage": "finalize", "capabilityId": "finalizer@1", "inputFacets": ["clarification_response"], "outputFacets": ["final_output"], "status": "pending"}
                ],
                "metadata": {}
            }))
            .await;
        let engine_runtime = Arc::new(ScriptedModelRuntime::new());

        let coordinator = build_coordinator(catalog, registry, store, planner_runtime, engine_runtime);
        let cancel = CancellationToken::new();

        let first = coordinator.run(envelope(), None, None, &cancel).await.unwrap();
        assert_eq!(first.status, "awaiting_human");

        let resume = ResumeSubmission {
            node_id: "clarify".to_string(),
            output: Some(json!({})),
            decline: None,
            submitted_at: chrono::Utc::now(),
        };
        let second = coordinator
            .run(resumed_envelope(&first.run_id), None, Some(resume), &cancel)
            .await
            .unwrap();

        assert_eq!(second.status, "awaiting_human");
        let tasks = coordinator
            .list_pending_human_tasks(PendingHumanTaskFilters { run_id: Some(first.run_id.clone()), assigned_to: None })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, flex_types::hitl::HumanTaskStatus::AwaitingSubmission);
    }
}
