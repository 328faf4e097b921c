use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::Event;
use chrono::Utc;
use tokio_stream::Stream;

use flex_types::event::{FlexEvent, FlexEventType};

use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

fn event_type_label(event_type: FlexEventType) -> &'static str {
    match event_type {
        FlexEventType::Start => "start",
        FlexEventType::PlanRequested => "plan_requested",
        FlexEventType::PlanRejected => "plan_rejected",
        FlexEventType::PlanGenerated => "plan_generated",
        FlexEventType::PlanUpdated => "plan_updated",
        FlexEventType::NodeStart => "node_start",
        FlexEventType::NodeComplete => "node_complete",
        FlexEventType::NodeError => "node_error",
        FlexEventType::ValidationError => "validation_error",
        FlexEventType::PolicyTriggered => "policy_triggered",
        FlexEventType::GoalConditionFailed => "goal_condition_failed",
        FlexEventType::FeedbackResolution => "feedback_resolution",
        FlexEventType::HitlRequest => "hitl_request",
        FlexEventType::HitlResolved => "hitl_resolved",
        FlexEventType::Warning => "warning",
        FlexEventType::Metrics => "metrics",
        FlexEventType::Log => "log",
        FlexEventType::Complete => "complete",
    }
}

fn frame(id: u64, event_type: &str, data: &FlexEvent) -> Event {
    Event::default()
        .id(id.to_string())
        .event(event_type)
        .data(serde_json::to_string(data).unwrap_or_default())
}

fn heartbeat_frame(id: u64) -> Event {
    Event::default()
        .id(id.to_string())
        .event("heartbeat")
        .data(serde_json::json!({ "ts": Utc::now().timestamp_millis() }).to_string())
}

/// Builds the per-run frame stream: one `FlexEvent` per broadcast match
/// plus a steady heartbeat, both stamped from the same monotonic `id`
/// counter so the stream-wide ordering invariant (spec.md §8) holds
/// across event and heartbeat frames alike. Ends right after the run's
/// terminal `complete` frame for `run_id` passes through, mirroring the
/// teacher's `sse_stream` + `event_matches_filter` split in
/// `tandem-server::http` but scoped to one run instead of a global feed.
pub fn run_event_stream(state: AppState, run_id: String) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        // Flushes response headers to the client immediately instead of
        // waiting for the first real frame or the first heartbeat tick.
        yield Ok(Event::default().comment(""));

        let mut id: u64 = 1;
        let mut rx = state.event_bus.subscribe();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    yield Ok(heartbeat_frame(id));
                    id += 1;
                }
                received = rx.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    if event.run_id != run_id {
                        continue;
                    }
                    let is_terminal = matches!(event.event_type, FlexEventType::Complete);
                    yield Ok(frame(id, event_type_label(event.event_type), &event));
                    id += 1;
                    if is_terminal {
                        break;
                    }
                }
            }
        }
    }
}

