use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use flex_types::envelope::TaskEnvelope;
use flex_types::hitl::{
    HitlMetrics, HitlPayload, HitlRequestRecord, HitlResponse, HitlStatus,
};

use crate::errors::PersistenceError;
use crate::persistence::PersistenceStore;

/// The scope `raiseRequest` must run inside, per spec.md §4.9 /
/// §9 ("per-operation context, not a thread-global"). Carried via
/// `tokio::task_local!` so concurrent runs on the same worker thread
/// never observe each other's context.
#[derive(Clone)]
pub struct HitlContext {
    pub run_id: String,
    pub thread_id: Option<String>,
    pub step_id: Option<String>,
    pub capability_id: Option<String>,
    pub pending_node_id: Option<String>,
    pub limit: u32,
}

tokio::task_local! {
    static HITL_CONTEXT: HitlContext;
}

/// Runs `f` with `context` bound as the active HITL context for the
/// duration of the future, per the task-local scoping the design notes
/// require.
pub async fn with_hitl_context<F, T>(context: HitlContext, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    HITL_CONTEXT.scope(context, f).await
}

#[derive(Debug, thiserror::Error)]
#[error("raiseRequest called outside withHitlContext")]
pub struct HitlContextMissing;

#[derive(Debug, Clone, Serialize)]
pub struct RunHitlState {
    pub requests: Vec<HitlRequestRecord>,
    pub responses: Vec<HitlResponse>,
    pub pending_request_id: Option<String>,
    pub denied_count: u32,
}

#[derive(Debug, Clone)]
pub enum RaiseOutcome {
    Pending(HitlRequestRecord),
    Denied(HitlRequestRecord),
}

/// Per-run HITL ledger with a configurable max-requests-per-run cap.
pub struct HitlService {
    store: Arc<dyn PersistenceStore>,
    max_requests_per_run: u32,
}

impl HitlService {
    pub fn new(store: Arc<dyn PersistenceStore>, max_requests_per_run: u32) -> Self {
        Self {
            store,
            max_requests_per_run,
        }
    }

    pub fn get_max_requests_per_run(&self) -> u32 {
        self.max_requests_per_run
    }

    pub async fn load_run_state(&self, run_id: &str) -> Result<RunHitlState, PersistenceError> {
        let (requests, responses) = self.store.load_hitl_ledger(run_id).await?;
        let pending_request_id = requests
            .iter()
            .find(|r| r.status == HitlStatus::Pending)
            .map(|r| r.id.clone());
        let denied_count = requests.iter().filter(|r| r.status == HitlStatus::Denied).count() as u32;
        Ok(RunHitlState {
            requests,
            responses,
            pending_request_id,
            denied_count,
        })
    }

    /// Must be called inside [`with_hitl_context`]. If the run already
    /// has `max` accepted (pending+resolved) requests, the new request
    /// is recorded denied instead of pending.
    pub async fn raise_request(
        &self,
        payload: HitlPayload,
        operator_prompt: Option<String>,
        contract_summary: Option<Value>,
    ) -> Result<RaiseOutcome, RaiseRequestError> {
        let context = HITL_CONTEXT
            .try_with(|ctx| ctx.clone())
            .map_err(|_| RaiseRequestError::ContextMissing(HitlContextMissing))?;

        let state = self.load_run_state(&context.run_id).await?;
        let accepted_count = state
            .requests
            .iter()
            .filter(|r| matches!(r.status, HitlStatus::Pending | HitlStatus::Resolved))
            .count() as u32;

        let now = Utc::now();
        let mut record = HitlRequestRecord {
            id: Uuid::new_v4().to_string(),
            run_id: context.run_id.clone(),
            thread_id: context.thread_id.clone(),
            step_id: context.step_id.clone(),
            pending_node_id: context.pending_node_id.clone(),
            origin_agent: context.capability_id.clone().unwrap_or_default(),
            payload,
            contract_summary,
            operator_prompt,
            status: HitlStatus::Pending,
            denial_reason: None,
            created_at: now,
            updated_at: now,
            metrics: HitlMetrics { attempt: 1 },
        };

        if accepted_count >= context.limit.max(self.max_requests_per_run) {
            record.status = HitlStatus::Denied;
            record.denial_reason = Some("Too many HITL requests".to_string());
            self.store.save_hitl_request(record.clone()).await?;
            return Ok(RaiseOutcome::Denied(record));
        }

        self.store.save_hitl_request(record.clone()).await?;
        Ok(RaiseOutcome::Pending(record))
    }

    /// Appends responses, transitions matching requests to `resolved`.
    pub async fn apply_responses(
        &self,
        run_id: &str,
        responses: Vec<HitlResponse>,
    ) -> Result<RunHitlState, PersistenceError> {
        for response in responses {
            let (mut requests, _) = self.store.load_hitl_ledger(run_id).await?;
            if let Some(request) = requests.iter_mut().find(|r| r.id == response.request_id) {
                request.status = HitlStatus::Resolved;
                request.updated_at = Utc::now();
                self.store.save_hitl_request(request.clone()).await?;
            }
            self.store.save_hitl_response(response).await?;
        }
        self.load_run_state(run_id).await
    }

    /// Defensive parsing of `envelope.metadata.state.hitl.responses`.
    pub fn parse_envelope(envelope: &TaskEnvelope) -> Option<Vec<HitlResponse>> {
        let state = envelope.metadata.get("state")?;
        let hitl = state.get("hitl")?;
        let responses = hitl.get("responses")?.as_array()?;
        let parsed: Vec<HitlResponse> = responses
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        Some(parsed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaiseRequestError {
    #[error(transparent)]
    ContextMissing(#[from] HitlContextMissing),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::JsonFilePersistenceStore;
    use flex_types::hitl::HitlKind;

    fn payload() -> HitlPayload {
        HitlPayload {
            question: "Approve this?".to_string(),
            kind: HitlKind::Approval,
            options: None,
            allow_free_form: false,
            urgency: "normal".to_string(),
        }
    }

    #[tokio::test]
    async fn raise_request_outside_context_fails() {
        let store: Arc<dyn PersistenceStore> = Arc::new(JsonFilePersistenceStore::in_memory().await);
        let service = HitlService::new(store, 3);
        let err = service.raise_request(payload(), None, None).await.unwrap_err();
        assert!(matches!(err, RaiseRequestError::ContextMissing(_)));
    }

    #[tokio::test]
    async fn fourth_request_is_denied_once_cap_reached() {
        let store: Arc<dyn PersistenceStore> = Arc::new(JsonFilePersistenceStore::in_memory().await);
        let service = HitlService::new(store, 3);

        let context = HitlContext {
            run_id: "run-1".to_string(),
            thread_id: None,
            step_id: None,
            capability_id: Some("strategist@1".to_string()),
            pending_node_id: Some("n1".to_string()),
            limit: 3,
        };

        for _ in 0..3 {
            let outcome = with_hitl_context(context.clone(), service.raise_request(payload(), None, None))
                .await
                .unwrap();
            assert!(matches!(outcome, RaiseOutcome::Pending(_)));
            if let RaiseOutcome::Pending(record) = outcome {
                service
                    .apply_responses(
                        "run-1",
                        vec![HitlResponse {
                            id: Uuid::new_v4().to_string(),
                            request_id: record.id,
                            response_type: flex_types::hitl::HitlResponseType::Approval,
                            selected_option_id: None,
                            freeform_text: None,
                            approved: Some(true),
                            responder_id: None,
                            responder_display_name: None,
                            created_at: Utc::now(),
                            metadata: None,
                        }],
                    )
                    .await
                    .unwrap();
            }
        }

        let outcome = with_hitl_context(context.clone(), service.raise_request(payload(), None, None))
            .await
            .unwrap();
        assert!(matches!(outcome, RaiseOutcome::Denied(_)));

        let state = service.load_run_state("run-1").await.unwrap();
        assert_eq!(state.denied_count, 1);
    }
}
