use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flex_core::persistence::PendingHumanTaskFilters;
use flex_core::{DeclineInfo, ResumeSubmission, RunCoordinator};
use flex_types::capability::CapabilityRecord;
use flex_types::envelope::TaskEnvelope;

use crate::sse::run_event_stream;
use crate::{AdmissionPermit, AppState};

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/runs", post(submit_run))
        .route("/v1/runs/{run_id}/events", get(stream_run_events))
        .route("/v1/runs/{run_id}/resume", post(resume_run))
        .route("/v1/runs/{run_id}/cancel", post(cancel_run))
        .route("/v1/human-tasks", get(list_human_tasks))
        .route("/v1/capabilities", get(list_capabilities).post(register_capability))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

fn error_response(status: axum::http::StatusCode, error: impl Into<String>, detail: Option<Value>) -> Response {
    (status, Json(ErrorBody { error: error.into(), detail })).into_response()
}

async fn acquire_or_reject(state: &AppState) -> Result<AdmissionPermit, Response> {
    state.admission.acquire().await.map_err(|pending| {
        let backlog_full = flex_core::SseBacklogFull { pending: pending as usize, max: state.config.sse_max_pending };
        error_response(
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            backlog_full.to_string(),
            Some(json!({ "pending": pending, "maxPending": state.config.sse_max_pending })),
        )
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sseConcurrency": state.config.sse_concurrency,
        "sseMaxPending": state.config.sse_max_pending,
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRunRequest {
    envelope: TaskEnvelope,
    #[serde(default)]
    correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    event_stream_path: String,
}

/// Accepts a `TaskEnvelope`, admits it through the `SSE_CONCURRENCY` /
/// `SSE_MAX_PENDING` gate (spec.md §5, §6.5), and drives the run in a
/// background task. Callers subscribe to `GET /v1/runs/{id}/events` for
/// the `FlexEvent` stream, the same decoupled submit-then-subscribe
/// shape as the teacher's `prompt_async` + `/event` split.
async fn submit_run(State(state): State<AppState>, Json(req): Json<SubmitRunRequest>) -> Response {
    if let Err(message) = req.envelope.validate() {
        return error_response(axum::http::StatusCode::BAD_REQUEST, message, None);
    }

    let run_id = req
        .envelope
        .resume_run_id()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let permit = match acquire_or_reject(&state).await {
        Ok(permit) => permit,
        Err(response) => return response,
    };

    let token = CancellationToken::new();
    state.runs.register(run_id.clone(), token.clone()).await;
    spawn_run(state.clone(), run_id.clone(), req.envelope, req.correlation_id.clone(), None, token, permit);

    (
        axum::http::StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: run_id.clone(),
            correlation_id: req.correlation_id,
            event_stream_path: format!("/v1/runs/{run_id}/events"),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ResumeRunRequest {
    envelope: TaskEnvelope,
    #[serde(default)]
    correlation_id: Option<String>,
    node_id: String,
    output: Option<Value>,
    #[serde(default)]
    decline: Option<ResumeDeclineInput>,
}

#[derive(Debug, Deserialize)]
struct ResumeDeclineInput {
    reason: String,
    #[serde(default)]
    note: Option<String>,
}

async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(req): Json<ResumeRunRequest>,
) -> Response {
    let mut envelope = req.envelope;
    envelope.constraints.resume_run_id = Some(run_id.clone());
    if let Err(message) = envelope.validate() {
        return error_response(axum::http::StatusCode::BAD_REQUEST, message, None);
    }

    let permit = match acquire_or_reject(&state).await {
        Ok(permit) => permit,
        Err(response) => return response,
    };

    let submission = ResumeSubmission {
        node_id: req.node_id,
        output: req.output,
        decline: req.decline.map(|d| DeclineInfo { reason: d.reason, note: d.note }),
        submitted_at: Utc::now(),
    };

    let token = CancellationToken::new();
    state.runs.register(run_id.clone(), token.clone()).await;
    spawn_run(state.clone(), run_id.clone(), envelope, req.correlation_id.clone(), Some(submission), token, permit);

    (
        axum::http::StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: run_id.clone(),
            correlation_id: req.correlation_id,
            event_stream_path: format!("/v1/runs/{run_id}/events"),
        }),
    )
        .into_response()
}

fn spawn_run(
    state: AppState,
    run_id: String,
    envelope: TaskEnvelope,
    correlation_id: Option<String>,
    resume_submission: Option<ResumeSubmission>,
    token: CancellationToken,
    permit: AdmissionPermit,
) {
    tokio::spawn(async move {
        let _permit = permit;
        let coordinator: Arc<RunCoordinator> = state.coordinator.clone();
        match coordinator.run(envelope, correlation_id, resume_submission, &token).await {
            Ok(outcome) => {
                tracing::info!(target: "flex.obs", run_id = %outcome.run_id, status = %outcome.status, "run finished");
            }
            Err(err) => {
                tracing::warn!(target: "flex.obs", run_id = %run_id, error = %err, "run ended with an unhandled engine error");
            }
        }
        state.runs.forget(&run_id).await;
    });
}

async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    if state.runs.cancel(&run_id).await {
        (axum::http::StatusCode::ACCEPTED, Json(json!({ "runId": run_id, "cancelling": true }))).into_response()
    } else {
        error_response(axum::http::StatusCode::NOT_FOUND, "no in-flight run with that id", None)
    }
}

/// Builds the SSE frame stream and stamps the headers spec.md §6.2
/// requires verbatim: axum's `Sse` only sets `Content-Type` (no
/// charset) and a bare `Cache-Control: no-cache`, so `no-transform`,
/// `Connection`, `X-Accel-Buffering`, and `Content-Encoding` are added
/// here. The stream itself yields a leading comment frame to flush
/// these headers before the first real event.
async fn stream_run_events(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    let sse = Sse::new(run_event_stream(state, run_id)).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)));
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(axum::http::header::CONNECTION, axum::http::HeaderValue::from_static("keep-alive"));
    headers.insert(axum::http::header::CONTENT_ENCODING, axum::http::HeaderValue::from_static("identity"));
    headers.insert("x-accel-buffering", axum::http::HeaderValue::from_static("no"));
    response
}

#[derive(Debug, Deserialize)]
struct HumanTaskQuery {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    assigned_to: Option<String>,
}

async fn list_human_tasks(State(state): State<AppState>, Query(query): Query<HumanTaskQuery>) -> Response {
    let filters = PendingHumanTaskFilters { run_id: query.run_id, assigned_to: query.assigned_to };
    match state.coordinator.list_pending_human_tasks(filters).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => error_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
    }
}

async fn list_capabilities(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.get_snapshot().await;
    Json(json!({ "active": snapshot.active, "all": snapshot.all }))
}

/// Lets a capability process register (or refresh) itself at runtime,
/// the same self-registration shape `FLEX_CAPABILITY_REGISTER_URL` /
/// `FLEX_CAPABILITY_SELF_REGISTER_RETRIES` (spec.md §6.5) describe from
/// the caller's side.
async fn register_capability(State(state): State<AppState>, Json(record): Json<CapabilityRecord>) -> Response {
    match state.registry.register(record).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(axum::http::StatusCode::UNPROCESSABLE_ENTITY, err.to_string(), None),
    }
}
