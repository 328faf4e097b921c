use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flex_model::{ChatMessage, ModelError, ModelRuntime, StructuredRequest};
use flex_types::capability::{AssignmentDefaults, CapabilityKind, CapabilityRecord, OnDecline};
use flex_types::envelope::{PolicyAction, PolicyRule};
use flex_types::event::{FlexEvent, FlexEventType};
use flex_types::hitl::{HitlKind, HitlPayload};
use flex_types::plan::{FlexNode, FlexPlan, NodeError, NodeKind, NodeStatus, PendingState, PostConditionResult};

use crate::capability_registry::CapabilityRegistry;
use crate::errors::{AwaitingHitl, AwaitingHuman, EngineError};
use crate::hitl::{with_hitl_context, HitlContext, HitlService, RaiseOutcome};
use crate::persistence::{NodeUpdate, PersistenceStore, SavePlanSnapshotOptions};
use crate::run_context::RunContext;
use flex_telemetry::{EventBus, TelemetryService};

/// Per-node timeout/retry budget, per spec.md §5: 30 s execution/
/// validation nodes, 90 s structuring nodes, 1 retry (0 for
/// structuring). Exposed as a struct rather than bare consts so tests
/// can exercise the timeout/retry path without real 30 s waits.
#[derive(Debug, Clone, Copy)]
pub struct NodeTimeouts {
    pub execution: Duration,
    pub structuring: Duration,
    pub max_retries_execution: u32,
    pub max_retries_structuring: u32,
    /// Times a node may be re-run after a post-condition or runtime
    /// policy failure before the engine gives up on retrying in place
    /// and signals `NeedsReplan`, per spec.md §4.7's replan trigger.
    pub max_policy_attempts: u32,
}

impl Default for NodeTimeouts {
    fn default() -> Self {
        Self {
            execution: Duration::from_secs(30),
            structuring: Duration::from_secs(90),
            max_retries_execution: 1,
            max_retries_structuring: 0,
            max_policy_attempts: 2,
        }
    }
}

/// A node's post-conditions or a runtime policy rule didn't clear after
/// retrying in place; the run needs a fresh planner draft before it can
/// proceed, per spec.md §4.7.
#[derive(Debug, Clone)]
pub struct ReplanSignal {
    pub node_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed,
    AwaitingHitl(AwaitingHitl),
    AwaitingHuman(AwaitingHuman),
    Cancelled,
    NeedsReplan(ReplanSignal),
}

/// Drives a `FlexPlan` to terminal state one node at a time, per
/// spec.md §4.7. Single-threaded cooperative scheduling within a run;
/// concurrency across runs is the SSE gateway's job, not this struct's.
pub struct ExecutionEngine {
    facet_catalog: Arc<crate::facet_catalog::FacetCatalog>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn PersistenceStore>,
    runtime: Arc<dyn ModelRuntime>,
    hitl: Arc<HitlService>,
    telemetry: Arc<TelemetryService>,
    event_bus: Arc<EventBus>,
    timeouts: NodeTimeouts,
}

impl ExecutionEngine {
    pub fn new(
        facet_catalog: Arc<crate::facet_catalog::FacetCatalog>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn PersistenceStore>,
        runtime: Arc<dyn ModelRuntime>,
        hitl: Arc<HitlService>,
        telemetry: Arc<TelemetryService>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::with_timeouts(facet_catalog, registry, store, runtime, hitl, telemetry, event_bus, NodeTimeouts::default())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_timeouts(
        facet_catalog: Arc<crate::facet_catalog::FacetCatalog>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn PersistenceStore>,
        runtime: Arc<dyn ModelRuntime>,
        hitl: Arc<HitlService>,
        telemetry: Arc<TelemetryService>,
        event_bus: Arc<EventBus>,
        timeouts: NodeTimeouts,
    ) -> Self {
        Self {
            facet_catalog,
            registry,
            store,
            runtime,
            hitl,
            telemetry,
            event_bus,
            timeouts,
        }
    }

    fn emit(&self, event: FlexEvent) {
        self.event_bus.publish(event);
    }

    pub async fn execute(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        run_context: &RunContext,
        correlation_id: Option<String>,
        policy_rules: &[PolicyRule],
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        loop {
            if cancel.is_cancelled() {
                self.store.update_status(run_id, flex_types::run::RunStatus::Cancelled).await?;
                self.persist_snapshot(run_id, plan, None).await?;
                return Ok(ExecutionOutcome::Cancelled);
            }

            let Some(node) = plan.next_runnable().cloned() else {
                break;
            };

            match node.kind {
                NodeKind::Routing | NodeKind::Fallback => {
                    self.complete_trivial_node(run_id, plan, &node, run_context).await?;
                }
                NodeKind::Human => {
                    let assignment = self.assign_human_node(run_id, plan, &node, correlation_id.clone()).await?;
                    return Ok(ExecutionOutcome::AwaitingHuman(assignment));
                }
                NodeKind::Ai => {
                    match self
                        .run_ai_node(run_id, plan, &node, run_context, correlation_id.clone(), policy_rules, cancel)
                        .await?
                    {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            }
        }

        Ok(ExecutionOutcome::Completed)
    }

    async fn persist_snapshot(
        &self,
        run_id: &str,
        plan: &FlexPlan,
        pending_state: Option<PendingState>,
    ) -> Result<(), EngineError> {
        self.store
            .save_plan_snapshot(
                run_id,
                plan.version,
                plan.nodes.clone(),
                SavePlanSnapshotOptions {
                    edges: Some(plan.edges.clone()),
                    pending_state,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn complete_trivial_node(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        node: &FlexNode,
        run_context: &RunContext,
    ) -> Result<(), EngineError> {
        let now = chrono::Utc::now();
        self.store
            .mark_node(
                run_id,
                &node.id,
                NodeUpdate {
                    status: Some(NodeStatus::Completed),
                    started_at: Some(now),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node.id) {
            plan_node.status = NodeStatus::Completed;
            plan_node.started_at = Some(now);
            plan_node.completed_at = Some(now);
        }
        run_context.update_from_node(node, &Value::Null).await;
        self.emit(
            FlexEvent::new(FlexEventType::NodeComplete, run_id, serde_json::json!({"capabilityId": node.capability_id}))
                .with_node(node.id.clone())
                .with_plan_version(Some(plan.version)),
        );
        Ok(())
    }

    async fn assign_human_node(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        node: &FlexNode,
        correlation_id: Option<String>,
    ) -> Result<AwaitingHuman, EngineError> {
        let capability = self
            .registry
            .get_by_id(node.capability_id.as_deref().unwrap_or_default())
            .await
            .ok_or_else(|| crate::errors::RegistryError::CapabilityNotRegistered(node.capability_id.clone().unwrap_or_default()))?;

        let defaults = capability.assignment_defaults.clone().unwrap_or(AssignmentDefaults {
            role: "operator".to_string(),
            timeout_seconds: flex_types::capability::default_human_timeout_seconds(),
            on_decline: OnDecline::FailRun,
            max_notifications: 1,
        });

        let assignment = serde_json::json!({
            "role": defaults.role,
            "timeoutSeconds": defaults.timeout_seconds,
            "onDecline": defaults.on_decline,
            "instructions": node.rationale,
        });

        let now = chrono::Utc::now();
        self.store
            .mark_node(
                run_id,
                &node.id,
                NodeUpdate {
                    status: Some(NodeStatus::AwaitingHuman),
                    started_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node.id) {
            plan_node.status = NodeStatus::AwaitingHuman;
            plan_node.started_at = Some(now);
        }

        let completed_node_ids: Vec<String> = plan
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.id.clone())
            .collect();
        self.persist_snapshot(
            run_id,
            plan,
            Some(PendingState {
                completed_node_ids,
                node_outputs: HashMap::new(),
                policy_actions: None,
                policy_attempts: None,
                mode: Some("human".to_string()),
            }),
        )
        .await?;

        self.emit(
            FlexEvent::new(
                FlexEventType::NodeStart,
                run_id,
                serde_json::json!({"executorType": "human", "assignment": assignment}),
            )
            .with_node(node.id.clone())
            .with_correlation(correlation_id)
            .with_plan_version(Some(plan.version)),
        );

        Ok(AwaitingHuman {
            node_id: node.id.clone(),
            assignment,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_ai_node(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        node: &FlexNode,
        run_context: &RunContext,
        correlation_id: Option<String>,
        policy_rules: &[PolicyRule],
        cancel: &CancellationToken,
    ) -> Result<Option<ExecutionOutcome>, EngineError> {
        let capability = self
            .registry
            .get_by_id(node.capability_id.as_deref().unwrap_or_default())
            .await
            .ok_or_else(|| crate::errors::RegistryError::CapabilityNotRegistered(node.capability_id.clone().unwrap_or_default()))?;

        let now = chrono::Utc::now();
        self.store
            .mark_node(
                run_id,
                &node.id,
                NodeUpdate {
                    status: Some(NodeStatus::Running),
                    started_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node.id) {
            plan_node.status = NodeStatus::Running;
            plan_node.started_at = Some(now);
        }
        self.emit(
            FlexEvent::new(
                FlexEventType::NodeStart,
                run_id,
                serde_json::json!({"capabilityId": node.capability_id, "label": node.label, "executorType": "ai"}),
            )
            .with_node(node.id.clone())
            .with_correlation(correlation_id.clone())
            .with_plan_version(Some(plan.version)),
        );

        let is_structuring = capability.kind == CapabilityKind::Structuring;
        let timeout = if is_structuring {
            self.timeouts.structuring
        } else {
            self.timeouts.execution
        };
        let max_retries = if is_structuring {
            self.timeouts.max_retries_structuring
        } else {
            self.timeouts.max_retries_execution
        };

        let output_schema = node.contracts.output.clone().unwrap_or_else(|| serde_json::json!({}));

        let context = HitlContext {
            run_id: run_id.to_string(),
            thread_id: None,
            step_id: Some(node.id.clone()),
            capability_id: node.capability_id.clone(),
            pending_node_id: Some(node.id.clone()),
            limit: self.hitl.get_max_requests_per_run(),
        };

        let mut retry_feedback: Option<String> = None;
        let mut policy_attempt: u32 = 0;

        let (structured, post_condition_results) = loop {
            let messages = self.build_messages(&capability, node, run_context, retry_feedback.as_deref()).await;

            let mut attempt = 0;
            let result = loop {
                let call = self.runtime.run_structured(StructuredRequest {
                    model: node.capability_id.clone(),
                    messages: messages.clone(),
                    output_schema: output_schema.clone(),
                    tools: vec![],
                    timeout,
                });

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.store.update_status(run_id, flex_types::run::RunStatus::Cancelled).await?;
                        self.persist_snapshot(run_id, plan, None).await?;
                        return Ok(Some(ExecutionOutcome::Cancelled));
                    }
                    res = tokio::time::timeout(timeout, call) => res,
                };

                match outcome {
                    Ok(Ok(structured)) => break Ok(structured),
                    Ok(Err(err)) => {
                        if attempt < max_retries {
                            attempt += 1;
                            self.emit(FlexEvent::new(
                                FlexEventType::Warning,
                                run_id,
                                serde_json::json!({"reason": "ai_node_retry", "error": err.to_string()}),
                            ).with_node(node.id.clone()));
                            continue;
                        }
                        break Err(err);
                    }
                    Err(_elapsed) => {
                        if attempt < max_retries {
                            attempt += 1;
                            self.emit(FlexEvent::new(
                                FlexEventType::Warning,
                                run_id,
                                serde_json::json!({"reason": "ai_node_timeout"}),
                            ).with_node(node.id.clone()));
                            continue;
                        }
                        break Err(ModelError::Timeout(timeout));
                    }
                }
            };

            let structured = match result {
                Ok(structured) => structured,
                Err(err) => return self.fail_node(run_id, plan, node, err).await,
            };

            if let Some(hitl_value) = structured.parsed.get("hitlRequest").cloned() {
                if let Some(outcome) = self
                    .handle_hitl_request(run_id, plan, node, context, hitl_value, correlation_id.clone())
                    .await?
                {
                    return Ok(Some(outcome));
                }
            }

            if let Err(message) = self.validate_node_output(node, &structured.parsed) {
                let now = chrono::Utc::now();
                let error = NodeError {
                    name: "FlexValidationError".to_string(),
                    message: message.clone(),
                    diagnostics: vec![],
                };
                self.store
                    .mark_node(
                        run_id,
                        &node.id,
                        NodeUpdate {
                            status: Some(NodeStatus::Error),
                            error: Some(error.clone()),
                            completed_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                if let Some(plan_node) = plan.node_mut(&node.id) {
                    plan_node.status = NodeStatus::Error;
                    plan_node.error = Some(error);
                    plan_node.completed_at = Some(now);
                }
                self.emit(
                    FlexEvent::new(FlexEventType::ValidationError, run_id, serde_json::json!({"message": message}))
                        .with_node(node.id.clone()),
                );
                return Ok(None);
            }

            let post_condition_results = self.evaluate_post_conditions(&capability, &structured.parsed, run_context).await;
            let policy_verdict = runtime_policy_verdict(policy_rules, &capability.capability_id, &structured.parsed);
            let blocked = !post_condition_results.iter().all(|r| r.satisfied)
                || matches!(policy_verdict, Some((PolicyAction::Deny, _)) | Some((PolicyAction::RequireApproval, _)));

            if !blocked {
                break (structured, post_condition_results);
            }

            let reason = describe_replan_trigger(&post_condition_results, &policy_verdict);
            self.emit(
                FlexEvent::new(
                    FlexEventType::Warning,
                    run_id,
                    serde_json::json!({"reason": "post_condition_retry", "detail": reason}),
                )
                .with_node(node.id.clone()),
            );

            policy_attempt += 1;
            if policy_attempt > self.timeouts.max_policy_attempts {
                let completed_node_ids: Vec<String> =
                    plan.nodes.iter().filter(|n| n.status == NodeStatus::Completed).map(|n| n.id.clone()).collect();
                let mut attempts = HashMap::new();
                attempts.insert(node.id.clone(), policy_attempt);
                self.persist_snapshot(
                    run_id,
                    plan,
                    Some(PendingState {
                        completed_node_ids,
                        node_outputs: HashMap::new(),
                        policy_actions: None,
                        policy_attempts: Some(attempts),
                        mode: Some("replan".to_string()),
                    }),
                )
                .await?;
                self.emit(
                    FlexEvent::new(FlexEventType::PolicyTriggered, run_id, serde_json::json!({"reason": reason}))
                        .with_node(node.id.clone())
                        .with_correlation(correlation_id.clone())
                        .with_plan_version(Some(plan.version)),
                );
                return Ok(Some(ExecutionOutcome::NeedsReplan(ReplanSignal {
                    node_id: node.id.clone(),
                    reason,
                })));
            }

            retry_feedback = Some(reason);
        };

        run_context.update_from_node(node, &structured.parsed).await;
        let now = chrono::Utc::now();
        let stamped_post_conditions = if post_condition_results.is_empty() { None } else { Some(post_condition_results.clone()) };
        self.store
            .mark_node(
                run_id,
                &node.id,
                NodeUpdate {
                    status: Some(NodeStatus::Completed),
                    output: Some(structured.parsed.clone()),
                    completed_at: Some(now),
                    post_condition_results: stamped_post_conditions.clone(),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node.id) {
            plan_node.status = NodeStatus::Completed;
            plan_node.output = Some(structured.parsed.clone());
            plan_node.completed_at = Some(now);
            plan_node.post_condition_results = stamped_post_conditions;
        }

        self.telemetry
            .record_duration_ms(
                "flex.node.duration_ms",
                &[("capability_id", node.capability_id.as_deref().unwrap_or(""))],
                (now - node.started_at.unwrap_or(now)).num_milliseconds() as f64,
            )
            .await;

        self.emit(
            FlexEvent::new(
                FlexEventType::NodeComplete,
                run_id,
                serde_json::json!({"capabilityId": node.capability_id, "output": structured.parsed}),
            )
            .with_node(node.id.clone())
            .with_plan_version(Some(plan.version))
            .with_facet_provenance(serde_json::json!(node.facets.output)),
        );

        Ok(None)
    }

    async fn fail_node(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        node: &FlexNode,
        err: ModelError,
    ) -> Result<Option<ExecutionOutcome>, EngineError> {
        let now = chrono::Utc::now();
        let error = NodeError {
            name: "ModelError".to_string(),
            message: err.to_string(),
            diagnostics: vec![],
        };
        self.store
            .mark_node(
                run_id,
                &node.id,
                NodeUpdate {
                    status: Some(NodeStatus::Error),
                    error: Some(error.clone()),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if let Some(plan_node) = plan.node_mut(&node.id) {
            plan_node.status = NodeStatus::Error;
            plan_node.error = Some(error);
            plan_node.completed_at = Some(now);
        }
        self.emit(
            FlexEvent::new(FlexEventType::NodeError, run_id, serde_json::json!({"message": err.to_string()}))
                .with_node(node.id.clone()),
        );
        Ok(None)
    }

    async fn handle_hitl_request(
        &self,
        run_id: &str,
        plan: &mut FlexPlan,
        node: &FlexNode,
        context: HitlContext,
        hitl_value: Value,
        correlation_id: Option<String>,
    ) -> Result<Option<ExecutionOutcome>, EngineError> {
        let payload = HitlPayload {
            question: hitl_value
                .get("question")
                .and_then(|v| v.as_str())
                .unwrap_or("Clarification needed")
                .to_string(),
            kind: HitlKind::Clarify,
            options: None,
            allow_free_form: true,
            urgency: "normal".to_string(),
        };

        let contract_summary = node.contracts.output.clone().unwrap_or_default();
        let raised = with_hitl_context(context, self.hitl.raise_request(payload, None, Some(contract_summary))).await;
        let outcome = match raised {
            Ok(outcome) => outcome,
            Err(crate::hitl::RaiseRequestError::Persistence(err)) => return Err(err.into()),
            Err(crate::hitl::RaiseRequestError::ContextMissing(_)) => {
                return Err(EngineError::Failed("raiseRequest called outside withHitlContext".to_string()));
            }
        };

        match outcome {
            RaiseOutcome::Pending(record) => {
                let now = chrono::Utc::now();
                self.store
                    .mark_node(
                        run_id,
                        &node.id,
                        NodeUpdate {
                            status: Some(NodeStatus::AwaitingHitl),
                            started_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                if let Some(plan_node) = plan.node_mut(&node.id) {
                    plan_node.status = NodeStatus::AwaitingHitl;
                }
                self.persist_snapshot(run_id, plan, None).await?;
                self.emit(
                    FlexEvent::new(FlexEventType::HitlRequest, run_id, serde_json::json!({"question": record.payload.question}))
                        .with_node(node.id.clone())
                        .with_correlation(correlation_id),
                );
                Ok(Some(ExecutionOutcome::AwaitingHitl(AwaitingHitl {
                    pending_request_id: record.id,
                    question: record.payload.question,
                })))
            }
            RaiseOutcome::Denied(record) => {
                self.emit(
                    FlexEvent::new(FlexEventType::HitlResolved, run_id, serde_json::json!({"denied": true}))
                        .with_node(node.id.clone()),
                );
                let _ = record;
                Ok(None)
            }
        }
    }

    /// Validates `output` has a value for every declared output facet of
    /// `node`, per spec.md §4.7 step 5 ("validate the output against
    /// `node.contracts.output`"). The facet catalog's schema per field is
    /// not deep-checked here; presence is what the prompt contract can
    /// actually guarantee from a `ModelRuntime` call.
    fn validate_node_output(&self, node: &FlexNode, output: &Value) -> Result<(), String> {
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

    /// Evaluates `capability.post_conditions` as JSON-Logic expressions
    /// over the run's facet ledger merged with this node's own output,
    /// per spec.md §4.7's replan-trigger mechanism.
    async fn evaluate_post_conditions(
        &self,
        capability: &CapabilityRecord,
        output: &Value,
        run_context: &RunContext,
    ) -> Vec<PostConditionResult> {
        if capability.post_conditions.is_empty() {
            return Vec::new();
        }
        let snapshot = run_context.snapshot().await;
        let mut data = serde_json::Map::new();
        for (name, fv) in snapshot.facets.iter() {
            data.insert(name.clone(), fv.value.clone());
        }
        if let Value::Object(fields) = output {
            for (name, value) in fields {
                data.insert(name.clone(), value.clone());
            }
        }
        let data = Value::Object(data);

        capability
            .post_conditions
            .iter()
            .map(|spec| PostConditionResult {
                expression: spec.expression.to_string(),
                satisfied: crate::policy::evaluate_expression(&spec.expression, &data),
                detail: spec.description.clone(),
            })
            .collect()
    }

    async fn build_messages(
        &self,
        capability: &CapabilityRecord,
        node: &FlexNode,
        run_context: &RunContext,
        retry_feedback: Option<&str>,
    ) -> Vec<ChatMessage> {
        let mut system = capability
            .instruction_templates
            .app
            .clone()
            .unwrap_or_else(|| format!("You are the {} capability.", capability.display_name));
        if let Some(extra) = &capability.instruction_templates.system {
            system.push('\n');
            system.push_str(extra);
        }

        let mut facet_bundle = serde_json::Map::new();
        for facet_name in &node.facets.input {
            if let Some(value) = run_context.get(facet_name).await {
                facet_bundle.insert(facet_name.clone(), value.value);
            }
        }

        let user = serde_json::json!({
            "inputFacets": Value::Object(facet_bundle),
            "rationale": node.rationale,
            "previousAttemptFeedback": retry_feedback,
        })
        .to_string();

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

/// Combines capability post-condition and runtime-policy checks into one
/// worst-action verdict for the node's produced facets, subject strings
/// of the form `{capabilityId}.{factName}` per `policy::evaluate_runtime_policies`.
fn runtime_policy_verdict(policy_rules: &[PolicyRule], capability_id: &str, output: &Value) -> Option<(PolicyAction, String)> {
    let Value::Object(fields) = output else {
        return None;
    };
    let mut worst: Option<(PolicyAction, String)> = None;
    for fact_name in fields.keys() {
        let subject = format!("{capability_id}.{fact_name}");
        let action = crate::policy::evaluate_runtime_policies(policy_rules, &subject);
        if action == PolicyAction::Allow {
            continue;
        }
        let severity = |a: PolicyAction| match a {
            PolicyAction::Allow => 0,
            PolicyAction::RequireApproval => 1,
            PolicyAction::Deny => 2,
        };
        let is_worse = worst.as_ref().map(|(current, _)| severity(action) > severity(*current)).unwrap_or(true);
        if is_worse {
            worst = Some((action, subject));
        }
    }
    worst
}

fn describe_replan_trigger(post_conditions: &[PostConditionResult], policy_verdict: &Option<(PolicyAction, String)>) -> String {
    let mut parts: Vec<String> = post_conditions
        .iter()
        .filter(|r| !r.satisfied)
        .map(|r| format!("post-condition failed: {}", r.detail.clone().unwrap_or_else(|| r.expression.clone())))
        .collect();
    if let Some((action, subject)) = policy_verdict {
        parts.push(format!("runtime policy {action:?} on {subject}"));
    }
    if parts.is_empty() {
        "replan triggered".to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facet_catalog::FacetCatalog;
    use crate::persistence::JsonFilePersistenceStore;
    use flex_model::{HangingModelRuntime, ScriptedModelRuntime};
    use flex_types::capability::{AgentType, CapabilityStatus, ContractSpec};
    use flex_types::facet::{Facet, FacetDirection};
    use flex_types::plan::{NodeContracts, NodeFacets, NodeProvenance};
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

    async fn registry_with(catalog: Arc<FacetCatalog>, kind: CapabilityKind) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(catalog));
        registry
            .register(CapabilityRecord {
                capability_id: "strategist@1".to_string(),
                version: 1,
                agent_type: AgentType::Ai,
                kind,
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

    async fn registry_with_post_condition(catalog: Arc<FacetCatalog>) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(catalog));
        registry
            .register(CapabilityRecord {
                capability_id: "strategist@1".to_string(),
                version: 1,
                agent_type: AgentType::Ai,
                kind: CapabilityKind::Execution,
                display_name: "Strategist".to_string(),
                summary: String::new(),
                input_contract: ContractSpec::Facets(vec![]),
                output_contract: ContractSpec::Facets(vec!["creative_brief".to_string()]),
                input_facets: vec![],
                output_facets: vec!["creative_brief".to_string()],
                post_conditions: vec![flex_types::capability::PostConditionSpec {
                    expression: json!({"!=": [{"var": "creative_brief"}, ""]}),
                    description: Some("creative_brief must not be empty".to_string()),
                }],
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

    fn single_ai_node_plan(run_id: &str) -> FlexPlan {
        FlexPlan {
            run_id: run_id.to_string(),
            version: 1,
            created_at: chrono::Utc::now(),
            nodes: vec![FlexNode {
                id: "n1".to_string(),
                kind: NodeKind::Ai,
                capability_id: Some("strategist@1".to_string()),
                label: "Strategist".to_string(),
                contracts: NodeContracts::default(),
                facets: NodeFacets {
                    input: vec![],
                    output: vec!["creative_brief".to_string()],
                },
                provenance: NodeProvenance::default(),
                routing: None,
                rationale: None,
                status: NodeStatus::Pending,
                started_at: None,
                completed_at: None,
                output: None,
                error: None,
                post_condition_results: None,
            }],
            edges: vec![],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn ai_node_completes_and_updates_run_context() {
        let catalog = catalog();
        let registry = registry_with(catalog.clone(), CapabilityKind::Execution).await;
        let store: Arc<dyn PersistenceStore> = Arc::new(JsonFilePersistenceStore::in_memory().await);
        let runtime = Arc::new(ScriptedModelRuntime::new());
        runtime.push_for("strategist@1", json!({"creative_brief": "draft"})).await;
        let hitl = Arc::new(HitlService::new(store.clone(), 3));
        let telemetry = Arc::new(TelemetryService::new());
        let event_bus = Arc::new(EventBus::new());

        let engine = ExecutionEngine::new(catalog, registry, store.clone(), runtime, hitl, telemetry, event_bus);

        let envelope = flex_types::envelope::TaskEnvelope {
            objective: "x".to_string(),
            inputs: Default::default(),
            constraints: Default::default(),
            policies: Default::default(),
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: flex_types::envelope::OutputContract::Freeform,
        };
        store
            .create_or_update_run("run-1", &envelope, flex_types::run::RunStatus::Running, Default::default())
            .await
            .unwrap();

        let mut plan = single_ai_node_plan("run-1");
        let run_context = RunContext::new();
        let cancel = CancellationToken::new();

        let outcome = engine
            .execute("run-1", &mut plan, &run_context, None, &[], &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Completed));
        assert_eq!(plan.nodes[0].status, NodeStatus::Completed);
        assert_eq!(run_context.get("creative_brief").await.unwrap().value, json!("draft"));
    }

    #[tokio::test]
    async fn ai_node_exhausts_retries_then_errors() {
        let catalog = catalog();
        let registry = registry_with(catalog.clone(), CapabilityKind::Execution).await;
        let store: Arc<dyn PersistenceStore> = Arc::new(JsonFilePersistenceStore::in_memory().await);
        let runtime = Arc::new(HangingModelRuntime);
        let hitl = Arc::new(HitlService::new(store.clone(), 3));
        let telemetry = Arc::new(TelemetryService::new());
        let event_bus = Arc::new(EventBus::new());

        let fast_timeouts = NodeTimeouts {
            execution: Duration::from_millis(20),
            structuring: Duration::from_millis(20),
            max_retries_execution: 1,
            max_retries_structuring: 0,
            max_policy_attempts: 2,
        };
        let engine = ExecutionEngine::with_timeouts(catalog, registry, store.clone(), runtime, hitl, telemetry, event_bus, fast_timeouts);

        let envelope = flex_types::envelope::TaskEnvelope {
            objective: "x".to_string(),
            inputs: Default::default(),
            constraints: Default::default(),
            policies: Default::default(),
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: flex_types::envelope::OutputContract::Freeform,
        };
        store
            .create_or_update_run("run-1", &envelope, flex_types::run::RunStatus::Running, Default::default())
            .await
            .unwrap();

        let mut plan = single_ai_node_plan("run-1");
        let run_context = RunContext::new();
        let cancel = CancellationToken::new();

        let outcome = engine
            .execute("run-1", &mut plan, &run_context, None, &[], &cancel)
            .await
            .unwrap();

        // the plan has no other runnable nodes once the only node errors out
        assert!(matches!(outcome, ExecutionOutcome::Completed));
        assert_eq!(plan.nodes[0].status, NodeStatus::Error);
        assert!(plan.nodes[0].error.is_some());
    }

    #[tokio::test]
    async fn ai_node_signals_replan_after_exhausting_policy_attempts() {
        let catalog = catalog();
        let registry = registry_with_post_condition(catalog.clone()).await;
        let store: Arc<dyn PersistenceStore> = Arc::new(JsonFilePersistenceStore::in_memory().await);
        let runtime = Arc::new(ScriptedModelRuntime::new());
        for _ in 0..4 {
            runtime.push_for("strategist@1", json!({"creative_brief": ""})).await;
        }
        let hitl = Arc::new(HitlService::new(store.clone(), 3));
        let telemetry = Arc::new(TelemetryService::new());
        let event_bus = Arc::new(EventBus::new());

        let timeouts = NodeTimeouts {
            max_policy_attempts: 1,
            ..NodeTimeouts::default()
        };
        let engine = ExecutionEngine::with_timeouts(catalog, registry, store.clone(), runtime, hitl, telemetry, event_bus, timeouts);

        let envelope = flex_types::envelope::TaskEnvelope {
            objective: "x".to_string(),
            inputs: Default::default(),
            constraints: Default::default(),
            policies: Default::default(),
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: flex_types::envelope::OutputContract::Freeform,
        };
        store
            .create_or_update_run("run-1", &envelope, flex_types::run::RunStatus::Running, Default::default())
            .await
            .unwrap();

        let mut plan = single_ai_node_plan("run-1");
        let run_context = RunContext::new();
        let cancel = CancellationToken::new();

        let outcome = engine
            .execute("run-1", &mut plan, &run_context, None, &[], &cancel)
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::NeedsReplan(signal) => {
                assert_eq!(signal.node_id, "n1");
                assert!(signal.reason.contains("post-condition failed"));
            }
            other => panic!("expected NeedsReplan, got {other:?}"),
        }
        assert_eq!(plan.nodes[0].status, NodeStatus::Running);
    }
}

