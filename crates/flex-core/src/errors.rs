use serde::Serialize;
use serde_json::Value;

/// Structured diagnostic emitted by the validator or the engine. Carries
/// a stable `code` so callers (and replanner prompts) can pattern-match
/// on failure kind instead of parsing messages.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet: Option<String>,
}

impl Diagnostic {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            node_id: None,
            capability_id: None,
            facet: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_capability(mut self, capability_id: impl Into<String>) -> Self {
        self.capability_id = Some(capability_id.into());
        self
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = Some(facet.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FacetCatalogError {
    #[error("unknown facet: {0}")]
    UnknownFacet(String),
    #[error("facet {facet} direction mismatch: expected {expected}, got {actual}")]
    FacetDirectionMismatch {
        facet: String,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Facet(#[from] FacetCatalogError),
    #[error("capability {0} is not registered")]
    CapabilityNotRegistered(String),
    #[error("capability {0} already registered and is being written concurrently")]
    ConcurrentRegistration(String),
    #[error("capability {0} declares the legacy fallback kind, which is rejected on ingest")]
    FallbackKindRejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("planner draft failed to parse as JSON: {0}")]
    ParseFailed(String),
    #[error("planner draft failed schema validation: {0}")]
    SchemaInvalid(String),
}

#[derive(Debug, thiserror::Error)]
#[error("planner draft rejected")]
pub struct PlannerDraftRejected {
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Facet(#[from] FacetCatalogError),
    #[error("node {node_id} output failed contract validation: {message}")]
    FlexValidationError { node_id: String, message: String },
}

#[derive(Debug, thiserror::Error)]
#[error("node {node_id} timed out after {elapsed:?}")]
pub struct StepTimeout {
    pub node_id: String,
    pub elapsed: std::time::Duration,
}

/// HITL raised mid-execution. Not a failure — the coordinator converts
/// this into `RunOutcome::AwaitingHitl`.
#[derive(Debug, Clone)]
pub struct AwaitingHitl {
    pub pending_request_id: String,
    pub question: String,
}

/// Node is assigned to a human operator. Not a failure — the
/// coordinator converts this into `RunOutcome::AwaitingHuman`.
#[derive(Debug, Clone)]
pub struct AwaitingHuman {
    pub node_id: String,
    pub assignment: Value,
}

#[derive(Debug, thiserror::Error)]
#[error("HITL request denied: too many requests for run {run_id}")]
pub struct HitlDenied {
    pub run_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("run {0} not found")]
    RunNotFound(String),
}

#[derive(Debug, thiserror::Error)]
#[error("SSE admission backlog full ({pending}/{max})")]
pub struct SseBacklogFull {
    pub pending: usize,
    pub max: usize,
}

/// Top-level error the engine surfaces for a run that cannot proceed.
/// Control-flow signals (`AwaitingHitl`/`AwaitingHuman`) are carried by
/// `RunOutcome`, not by this enum, per the "no exceptional unwinding
/// across module boundaries" design note.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    DraftRejected(#[from] PlannerDraftRejected),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    StepTimeout(#[from] StepTimeout),
    #[error(transparent)]
    HitlDenied(#[from] HitlDenied),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("run failed: {0}")]
    Failed(String),
}
