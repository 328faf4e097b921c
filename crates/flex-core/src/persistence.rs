use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;

use flex_types::context::RunContextSnapshot;
use flex_types::envelope::TaskEnvelope;
use flex_types::hitl::{HitlRequestRecord, HitlResponse, HumanTask};
use flex_types::plan::{Edge, FlexNode, PendingState, PlanSnapshot, PlanSnapshotBody};
use flex_types::run::{RunRow, RunStatus};

use crate::errors::PersistenceError;

#[derive(Debug, Clone, Default)]
pub struct SavePlanSnapshotOptions {
    pub facets: Option<RunContextSnapshot>,
    pub schema_hash: Option<String>,
    pub edges: Option<Vec<Edge>>,
    pub plan_metadata: Option<HashMap<String, Value>>,
    pub pending_state: Option<PendingState>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub status: Option<flex_types::plan::NodeStatus>,
    pub output: Option<Value>,
    pub error: Option<flex_types::plan::NodeError>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub post_condition_results: Option<Vec<flex_types::plan::PostConditionResult>>,
}

#[derive(Debug, Clone, Default)]
pub struct PendingHumanTaskFilters {
    pub run_id: Option<String>,
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedRun {
    pub run: RunRow,
    pub nodes: Vec<FlexNode>,
}

/// The durable interface the core consumes. Spec.md §4.3 leaves the
/// backing store opaque (RDBMS or in-memory map); this trait is the
/// seam, mirroring how the teacher's own `Storage` is the single
/// concrete implementation the rest of the crate depends on through its
/// public methods rather than its fields.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn create_or_update_run(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        status: RunStatus,
        metadata: HashMap<String, Value>,
    ) -> Result<(), PersistenceError>;

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<(), PersistenceError>;

    /// Atomic replace of the per-version snapshot and upsert of node
    /// rows for that version; node rows not present in `nodes` for
    /// `run_id` are removed.
    async fn save_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: u32,
        nodes: Vec<FlexNode>,
        options: SavePlanSnapshotOptions,
    ) -> Result<(), PersistenceError>;

    async fn mark_node(
        &self,
        run_id: &str,
        node_id: &str,
        updates: NodeUpdate,
    ) -> Result<(), PersistenceError>;

    async fn record_result(
        &self,
        run_id: &str,
        result: Value,
        status: RunStatus,
    ) -> Result<(), PersistenceError>;

    async fn record_pending_result(&self, run_id: &str, result: Value) -> Result<(), PersistenceError>;

    async fn save_run_context(
        &self,
        run_id: &str,
        snapshot: RunContextSnapshot,
    ) -> Result<(), PersistenceError>;

    async fn load_flex_run(&self, run_id: &str) -> Result<Option<LoadedRun>, PersistenceError>;

    async fn find_flex_run_by_thread_id(&self, thread_id: &str) -> Result<Option<LoadedRun>, PersistenceError>;

    async fn load_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: Option<u32>,
    ) -> Result<Option<PlanSnapshot>, PersistenceError>;

    async fn list_pending_human_tasks(
        &self,
        filters: PendingHumanTaskFilters,
    ) -> Result<Vec<HumanTask>, PersistenceError>;

    async fn save_hitl_request(&self, request: HitlRequestRecord) -> Result<(), PersistenceError>;

    async fn save_hitl_response(&self, response: HitlResponse) -> Result<(), PersistenceError>;

    async fn load_hitl_ledger(
        &self,
        run_id: &str,
    ) -> Result<(Vec<HitlRequestRecord>, Vec<HitlResponse>), PersistenceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct JsonFileState {
    #[serde(default)]
    runs: HashMap<String, RunRow>,
    #[serde(default)]
    nodes: HashMap<String, Vec<FlexNode>>,
    #[serde(default)]
    snapshots: HashMap<String, HashMap<u32, PlanSnapshot>>,
    #[serde(default)]
    hitl_requests: HashMap<String, Vec<HitlRequestRecord>>,
    #[serde(default)]
    hitl_responses: HashMap<String, Vec<HitlResponse>>,
    #[serde(default)]
    thread_index: HashMap<String, String>,
}

/// A file-backed `PersistenceStore`: state lives in an `RwLock`-guarded
/// in-memory map, flushed to a single JSON file after every mutation,
/// the same durability-via-flush-on-write idiom the teacher's
/// `Storage` uses for its session table.
pub struct JsonFilePersistenceStore {
    path: PathBuf,
    state: RwLock<JsonFileState>,
}

impl JsonFilePersistenceStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .await
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            JsonFileState::default()
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub async fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: RwLock::new(JsonFileState::default()),
        }
    }

    async fn flush(&self, state: &JsonFileState) -> Result<(), PersistenceError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        fs::write(&self.path, raw)
            .await
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for JsonFilePersistenceStore {
    async fn create_or_update_run(
        &self,
        run_id: &str,
        envelope: &TaskEnvelope,
        status: RunStatus,
        metadata: HashMap<String, Value>,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let thread_id = envelope.metadata.get("threadId").and_then(|v| v.as_str()).map(String::from);
        if let Some(thread_id) = thread_id.clone() {
            state.thread_index.insert(thread_id, run_id.to_string());
        }
        let row = state.runs.entry(run_id.to_string()).or_insert_with(|| RunRow {
            run_id: run_id.to_string(),
            thread_id: thread_id.clone(),
            status,
            objective: Some(envelope.objective.clone()),
            envelope: envelope.clone(),
            schema_hash: None,
            metadata: metadata.clone(),
            result: None,
            context_snapshot: None,
            plan_version: 0,
        });
        row.status = status;
        row.envelope = envelope.clone();
        row.metadata.extend(metadata);
        if row.thread_id.is_none() {
            row.thread_id = thread_id;
        }
        self.flush(&state).await
    }

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let row = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PersistenceError::RunNotFound(run_id.to_string()))?;
        row.status = status;
        self.flush(&state).await
    }

    async fn save_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: u32,
        nodes: Vec<FlexNode>,
        options: SavePlanSnapshotOptions,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let edges = options.edges.unwrap_or_default();
        let pending_node_ids: Vec<String> = nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.status,
                    flex_types::plan::NodeStatus::AwaitingHitl | flex_types::plan::NodeStatus::AwaitingHuman
                )
            })
            .map(|n| n.id.clone())
            .collect();

        let snapshot = PlanSnapshot {
            run_id: run_id.to_string(),
            plan_version,
            snapshot: PlanSnapshotBody {
                nodes: nodes.clone(),
                edges,
                metadata: options.plan_metadata.unwrap_or_default(),
                pending_state: options.pending_state,
            },
            facet_snapshot: options.facets,
            schema_hash: options.schema_hash,
            pending_node_ids,
            created_at: now,
            updated_at: now,
        };

        state
            .snapshots
            .entry(run_id.to_string())
            .or_default()
            .insert(plan_version, snapshot);
        state.nodes.insert(run_id.to_string(), nodes);
        if let Some(row) = state.runs.get_mut(run_id) {
            row.plan_version = plan_version;
        }
        self.flush(&state).await
    }

    async fn mark_node(
        &self,
        run_id: &str,
        node_id: &str,
        updates: NodeUpdate,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let nodes = state
            .nodes
            .get_mut(run_id)
            .ok_or_else(|| PersistenceError::RunNotFound(run_id.to_string()))?;
        let node = nodes
            .iter_mut()
            .find(|n| n.id == node_id)
            .ok_or_else(|| PersistenceError::Backend(format!("node {node_id} not found")))?;
        if let Some(status) = updates.status {
            node.status = status;
        }
        if updates.output.is_some() {
            node.output = updates.output;
        }
        if updates.error.is_some() {
            node.error = updates.error;
        }
        if updates.started_at.is_some() {
            node.started_at = updates.started_at;
        }
        if updates.completed_at.is_some() {
            node.completed_at = updates.completed_at;
        }
        if updates.post_condition_results.is_some() {
            node.post_condition_results = updates.post_condition_results;
        }
        self.flush(&state).await
    }

    async fn record_result(
        &self,
        run_id: &str,
        result: Value,
        status: RunStatus,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let row = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PersistenceError::RunNotFound(run_id.to_string()))?;
        row.result = Some(result);
        row.status = status;
        self.flush(&state).await
    }

    async fn record_pending_result(&self, run_id: &str, result: Value) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let row = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PersistenceError::RunNotFound(run_id.to_string()))?;
        row.result = Some(result);
        self.flush(&state).await
    }

    async fn save_run_context(
        &self,
        run_id: &str,
        snapshot: RunContextSnapshot,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let row = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PersistenceError::RunNotFound(run_id.to_string()))?;
        row.context_snapshot = Some(snapshot);
        self.flush(&state).await
    }

    async fn load_flex_run(&self, run_id: &str) -> Result<Option<LoadedRun>, PersistenceError> {
        let state = self.state.read().await;
        let Some(run) = state.runs.get(run_id).cloned() else {
            return Ok(None);
        };
        let nodes = state.nodes.get(run_id).cloned().unwrap_or_default();
        Ok(Some(LoadedRun { run, nodes }))
    }

    async fn find_flex_run_by_thread_id(&self, thread_id: &str) -> Result<Option<LoadedRun>, PersistenceError> {
        let run_id = {
            let state = self.state.read().await;
            state.thread_index.get(thread_id).cloned()
        };
        match run_id {
            Some(run_id) => self.load_flex_run(&run_id).await,
            None => Ok(None),
        }
    }

    async fn load_plan_snapshot(
        &self,
        run_id: &str,
        plan_version: Option<u32>,
    ) -> Result<Option<PlanSnapshot>, PersistenceError> {
        let state = self.state.read().await;
        let Some(versions) = state.snapshots.get(run_id) else {
            return Ok(None);
        };
        let version = match plan_version {
            Some(v) => v,
            None => match versions.keys().max() {
                Some(v) => *v,
                None => return Ok(None),
            },
        };
        Ok(versions.get(&version).cloned())
    }

    async fn list_pending_human_tasks(
        &self,
        filters: PendingHumanTaskFilters,
    ) -> Result<Vec<HumanTask>, PersistenceError> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for (run_id, nodes) in state.nodes.iter() {
            if let Some(wanted) = &filters.run_id {
                if wanted != run_id {
                    continue;
                }
            }
            for node in nodes {
                if node.status != flex_types::plan::NodeStatus::AwaitingHuman {
                    continue;
                }
                out.push(HumanTask {
                    task_id: format!("{run_id}:{}", node.id),
                    run_id: run_id.clone(),
                    node_id: node.id.clone(),
                    capability_id: node.capability_id.clone().unwrap_or_default(),
                    status: flex_types::hitl::HumanTaskStatus::AwaitingSubmission,
                    assigned_to: filters.assigned_to.clone(),
                    role: None,
                    due_at: None,
                    priority: None,
                    instructions: node.rationale.clone(),
                    defaults: None,
                    metadata: None,
                    contracts: node.contracts.clone(),
                    facets: node.facets.clone(),
                    facet_provenance: None,
                });
            }
        }
        Ok(out)
    }

    async fn save_hitl_request(&self, request: HitlRequestRecord) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let requests = state.hitl_requests.entry(request.run_id.clone()).or_default();
        if let Some(existing) = requests.iter_mut().find(|r| r.id == request.id) {
            *existing = request;
        } else {
            requests.push(request);
        }
        self.flush(&state).await
    }

    async fn save_hitl_response(&self, response: HitlResponse) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let run_id = state
            .hitl_requests
            .iter()
            .find(|(_, reqs)| reqs.iter().any(|r| r.id == response.request_id))
            .map(|(run_id, _)| run_id.clone())
            .ok_or_else(|| PersistenceError::Backend(format!("no request {} to respond to", response.request_id)))?;
        state.hitl_responses.entry(run_id).or_default().push(response);
        self.flush(&state).await
    }

    async fn load_hitl_ledger(
        &self,
        run_id: &str,
    ) -> Result<(Vec<HitlRequestRecord>, Vec<HitlResponse>), PersistenceError> {
        let state = self.state.read().await;
        Ok((
            state.hitl_requests.get(run_id).cloned().unwrap_or_default(),
            state.hitl_responses.get(run_id).cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flex_types::envelope::{EnvelopeConstraints, OutputContract, Policies};

    fn envelope() -> TaskEnvelope {
        TaskEnvelope {
            objective: "test".to_string(),
            inputs: Default::default(),
            constraints: EnvelopeConstraints::default(),
            policies: Policies::default(),
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: OutputContract::Freeform,
        }
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let store = JsonFilePersistenceStore::in_memory().await;
        store
            .create_or_update_run("run-1", &envelope(), RunStatus::Pending, Default::default())
            .await
            .unwrap();
        let loaded = store.load_flex_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.run.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn save_plan_snapshot_replaces_node_rows_atomically() {
        let store = JsonFilePersistenceStore::in_memory().await;
        store
            .create_or_update_run("run-1", &envelope(), RunStatus::Running, Default::default())
            .await
            .unwrap();

        let node = FlexNode {
            id: "n1".to_string(),
            kind: flex_types::plan::NodeKind::Ai,
            capability_id: Some("strategist@1".to_string()),
            label: "Strategist".to_string(),
            contracts: Default::default(),
            facets: Default::default(),
            provenance: Default::default(),
            routing: None,
            rationale: None,
            status: flex_types::plan::NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            post_condition_results: None,
        };

        store
            .save_plan_snapshot("run-1", 1, vec![node], SavePlanSnapshotOptions::default())
            .await
            .unwrap();

        let loaded = store.load_flex_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), 1);

        store
            .save_plan_snapshot("run-1", 2, vec![], SavePlanSnapshotOptions::default())
            .await
            .unwrap();
        let loaded = store.load_flex_run("run-1").await.unwrap().unwrap();
        assert!(loaded.nodes.is_empty());
    }

    #[tokio::test]
    async fn mark_node_updates_status() {
        let store = JsonFilePersistenceStore::in_memory().await;
        store
            .create_or_update_run("run-1", &envelope(), RunStatus::Running, Default::default())
            .await
            .unwrap();
        let node = FlexNode {
            id: "n1".to_string(),
            kind: flex_types::plan::NodeKind::Ai,
            capability_id: None,
            label: "Node".to_string(),
            contracts: Default::default(),
            facets: Default::default(),
            provenance: Default::default(),
            routing: None,
            rationale: None,
            status: flex_types::plan::NodeStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            post_condition_results: None,
        };
        store
            .save_plan_snapshot("run-1", 1, vec![node], SavePlanSnapshotOptions::default())
            .await
            .unwrap();
        store
            .mark_node(
                "run-1",
                "n1",
                NodeUpdate {
                    status: Some(flex_types::plan::NodeStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let loaded = store.load_flex_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.nodes[0].status, flex_types::plan::NodeStatus::Completed);
    }
}
