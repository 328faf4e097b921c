//! Abstraction over the model/LLM client the core consumes. The concrete
//! OpenAI Responses/Chat client is out of scope (spec.md §1); this crate
//! defines the `ModelRuntime` trait plus a deterministic, scriptable
//! implementation used by the planner/engine's own tests and by the
//! `flex-engine` CLI when no real provider is configured — the same role
//! `LocalEchoProvider` plays in the teacher's provider registry.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("model call failed: {0}")]
    Failed(String),
    #[error("model returned output that failed schema validation: {0}")]
    SchemaInvalid(String),
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A free-text prompt call, used by the planner to request a
/// `PlannerDraft` as raw text it then JSON-parses itself.
#[derive(Debug, Clone)]
pub struct ResponsesRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: Option<String>,
    pub timeout: Duration,
}

/// A schema-constrained call used by AI execution nodes; the runtime is
/// responsible for returning output that already conforms to
/// `output_schema` (spec.md §9 "streaming text vs. structured output").
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub output_schema: Value,
    pub tools: Vec<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StructuredResult {
    pub text: String,
    pub parsed: Value,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn responses(&self, request: ResponsesRequest) -> Result<String, ModelError>;

    async fn run_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResult, ModelError>;
}

/// A scriptable runtime for tests and for `flex-engine run`/`serve` when
/// no external provider is configured. Responses are consumed in FIFO
/// order per queue key; an empty queue falls back to echoing the schema's
/// defaults (or an empty object), mirroring `LocalEchoProvider`'s
/// always-succeeds behavior.
pub struct ScriptedModelRuntime {
    queues: Mutex<std::collections::HashMap<String, VecDeque<Value>>>,
    default_queue: Mutex<VecDeque<Value>>,
}

impl Default for ScriptedModelRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModelRuntime {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(std::collections::HashMap::new()),
            default_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a canned structured response keyed by the request's model
    /// name (tests key this on capability id by passing it as `model`).
    pub async fn push_for(&self, key: impl Into<String>, value: Value) {
        self.queues
            .lock()
            .await
            .entry(key.into())
            .or_default()
            .push_back(value);
    }

    pub async fn push_default(&self, value: Value) {
        self.default_queue.lock().await.push_back(value);
    }

    async fn next_for(&self, key: Option<&str>) -> Option<Value> {
        if let Some(key) = key {
            if let Some(queue) = self.queues.lock().await.get_mut(key) {
                if let Some(value) = queue.pop_front() {
                    return Some(value);
                }
            }
        }
        self.default_queue.lock().await.pop_front()
    }
}

#[async_trait]
impl ModelRuntime for ScriptedModelRuntime {
    async fn responses(&self, request: ResponsesRequest) -> Result<String, ModelError> {
        match self.next_for(request.model.as_deref()).await {
            Some(value) => Ok(value.to_string()),
            None => Ok("[]".to_string()),
        }
    }

    async fn run_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResult, ModelError> {
        let parsed = match self.next_for(request.model.as_deref()).await {
            Some(value) => value,
            None => default_for_schema(&request.output_schema),
        };
        Ok(StructuredResult {
            text: parsed.to_string(),
            parsed,
            usage: Some(TokenUsage::default()),
        })
    }
}

fn default_for_schema(schema: &Value) -> Value {
    if let Some(obj) = schema.get("properties").and_then(|p| p.as_object()) {
        let mut out = serde_json::Map::new();
        for key in obj.keys() {
            out.insert(key.clone(), Value::String(String::new()));
        }
        Value::Object(out)
    } else {
        Value::Object(serde_json::Map::new())
    }
}

/// A runtime that never resolves until cancelled — used to exercise
/// spec.md §8 scenario 6 (AI node timeout → retry → best-effort failure).
pub struct HangingModelRuntime;

#[async_trait]
impl ModelRuntime for HangingModelRuntime {
    async fn responses(&self, _request: ResponsesRequest) -> Result<String, ModelError> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn run_structured(
        &self,
        _request: StructuredRequest,
    ) -> Result<StructuredResult, ModelError> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_runtime_returns_queued_structured_response() {
        let runtime = ScriptedModelRuntime::new();
        runtime
            .push_for("strategist@1", serde_json::json!({"creative_brief": "go"}))
            .await;
        let result = runtime
            .run_structured(StructuredRequest {
                model: Some("strategist@1".to_string()),
                messages: vec![ChatMessage::user("hi")],
                output_schema: serde_json::json!({}),
                tools: vec![],
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        assert_eq!(result.parsed["creative_brief"], "go");
    }

    #[tokio::test]
    async fn scripted_runtime_falls_back_to_schema_defaults() {
        let runtime = ScriptedModelRuntime::new();
        let result = runtime
            .run_structured(StructuredRequest {
                model: None,
                messages: vec![],
                output_schema: serde_json::json!({"properties": {"foo": {"type": "string"}}}),
                tools: vec![],
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        assert_eq!(result.parsed["foo"], "");
    }
}
