use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use flex_types::capability::{CapabilityKind, CapabilityRecord, CapabilityStatus};
use flex_types::envelope::TaskEnvelope;

use crate::errors::{FacetCatalogError, RegistryError};
use crate::facet_catalog::FacetCatalog;

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active: Vec<CapabilityRecord>,
    pub all: Vec<CapabilityRecord>,
}

/// A single CRCS row: a candidate capability plus the reason it was
/// selected for the planner prompt.
#[derive(Debug, Clone, Serialize)]
pub struct CrcsRow {
    pub capability_id: String,
    pub reason: CrcsReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcsReason {
    PathReference,
    PolicyReference,
    Pinned,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrcsSnapshot {
    pub rows: Vec<CrcsRow>,
    pub total_rows: usize,
    pub mrcs_size: usize,
    pub row_cap: usize,
    pub truncated: bool,
    pub missing_pinned_capabilities: Vec<String>,
}

const DEFAULT_CRCS_ROW_CAP: usize = 40;

/// Durable table of capabilities with an in-memory cache. The teacher's
/// `Storage` keeps session state the same way: a `RwLock<HashMap<...>>`
/// guarding the live table, with registration serialized per key.
pub struct CapabilityRegistry {
    facet_catalog: Arc<FacetCatalog>,
    capabilities: RwLock<HashMap<String, CapabilityRecord>>,
    registration_locks: RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CapabilityRegistry {
    pub fn new(facet_catalog: Arc<FacetCatalog>) -> Self {
        Self {
            facet_catalog,
            capabilities: RwLock::new(HashMap::new()),
            registration_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, capability_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.registration_locks.write().await;
        locks
            .entry(capability_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Validates the payload against the FacetCatalog, compiles its
    /// contracts, stamps `lastSeenAt`, and writes through. Concurrent
    /// registrations of the same id are serialized by a per-id lock so
    /// the last writer's `lastSeenAt` always reflects the latest call.
    pub async fn register(&self, mut record: CapabilityRecord) -> Result<CapabilityRecord, RegistryError> {
        if record.kind == CapabilityKind::Fallback {
            return Err(RegistryError::FallbackKindRejected(record.capability_id));
        }

        let lock = self.lock_for(&record.capability_id).await;
        let _guard = lock.lock().await;

        self.facet_catalog
            .compile_contracts(&record.input_facets, &record.output_facets)
            .map_err(RegistryError::Facet)?;

        let now = Utc::now();
        record.last_seen_at = now;
        if self.capabilities.read().await.get(&record.capability_id).is_none() {
            record.registered_at = now;
        }

        self.capabilities
            .write()
            .await
            .insert(record.capability_id.clone(), record.clone());
        Ok(record)
    }

    pub async fn list_active(&self) -> Vec<CapabilityRecord> {
        self.capabilities
            .read()
            .await
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<CapabilityRecord> {
        self.capabilities.read().await.get(id).cloned()
    }

    pub async fn get_snapshot(&self) -> RegistrySnapshot {
        let all: Vec<CapabilityRecord> = self.capabilities.read().await.values().cloned().collect();
        let active = all.iter().filter(|c| c.is_active()).cloned().collect();
        RegistrySnapshot { active, all }
    }

    /// Marks capabilities inactive whose `lastSeenAt` (or registration
    /// time, if never heartbeated) falls outside `window` of `now`.
    pub async fn mark_inactive(&self, ids: &[String], now: DateTime<Utc>) {
        let mut capabilities = self.capabilities.write().await;
        for id in ids {
            if let Some(record) = capabilities.get_mut(id) {
                record.status = CapabilityStatus::Inactive;
                record.last_seen_at = now;
            }
        }
    }

    pub async fn mark_stale_inactive(&self, window: chrono::Duration, now: DateTime<Utc>) {
        let stale_ids: Vec<String> = self
            .capabilities
            .read()
            .await
            .values()
            .filter(|c| c.is_active() && now - c.last_seen_at > window)
            .map(|c| c.capability_id.clone())
            .collect();
        self.mark_inactive(&stale_ids, now).await;
    }

    /// Returns the Capability-Ranking Context Set for a planner prompt:
    /// the top `row_cap` candidates with reason codes. Pinned capability
    /// ids (from `envelope.policies.planner.pinned_capabilities`, if
    /// present) are always included and ranked first; capabilities
    /// referenced by a runtime policy pattern rank next; the remainder
    /// fill by `capability_id` order. `hints` lets callers extend the
    /// pinned set programmatically (e.g. a replan pinning already-used
    /// capabilities).
    pub async fn compute_crcs_snapshot(
        &self,
        envelope: &TaskEnvelope,
        hints: &[String],
    ) -> CrcsSnapshot {
        let active = self.list_active().await;

        let pinned: Vec<String> = pinned_capability_ids(envelope)
            .into_iter()
            .chain(hints.iter().cloned())
            .collect();

        let policy_referenced: Vec<String> = envelope
            .policies
            .runtime
            .iter()
            .map(|rule| rule.pattern.clone())
            .collect();

        let mut rows: Vec<CrcsRow> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for id in &pinned {
            if active.iter().any(|c| &c.capability_id == id) && seen.insert(id.clone()) {
                rows.push(CrcsRow {
                    capability_id: id.clone(),
                    reason: CrcsReason::Pinned,
                });
            }
        }

        for capability in &active {
            if seen.contains(&capability.capability_id) {
                continue;
            }
            if policy_referenced
                .iter()
                .any(|pattern| crate::policy::wildcard_matches(pattern, &capability.capability_id))
            {
                seen.insert(capability.capability_id.clone());
                rows.push(CrcsRow {
                    capability_id: capability.capability_id.clone(),
                    reason: CrcsReason::PolicyReference,
                });
            }
        }

        let mut remaining: Vec<&CapabilityRecord> = active
            .iter()
            .filter(|c| !seen.contains(&c.capability_id))
            .collect();
        remaining.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        for capability in remaining {
            seen.insert(capability.capability_id.clone());
            rows.push(CrcsRow {
                capability_id: capability.capability_id.clone(),
                reason: CrcsReason::PathReference,
            });
        }

        let total_rows = rows.len();
        let missing_pinned_capabilities: Vec<String> = pinned
            .iter()
            .filter(|id| !active.iter().any(|c| &c.capability_id == *id))
            .cloned()
            .collect();

        let truncated = total_rows > DEFAULT_CRCS_ROW_CAP;
        rows.truncate(DEFAULT_CRCS_ROW_CAP);
        if truncated {
            tracing::warn!(
                target: "flex.obs",
                total_rows,
                row_cap = DEFAULT_CRCS_ROW_CAP,
                "CRCS snapshot truncated; some active capabilities were dropped from the planner prompt"
            );
        }

        let structuring_count = active
            .iter()
            .filter(|c| c.kind == CapabilityKind::Structuring && rows.iter().any(|r| r.capability_id == c.capability_id))
            .count();

        CrcsSnapshot {
            rows,
            total_rows,
            mrcs_size: structuring_count.max(1),
            row_cap: DEFAULT_CRCS_ROW_CAP,
            truncated,
            missing_pinned_capabilities,
        }
    }
}

fn pinned_capability_ids(envelope: &TaskEnvelope) -> Vec<String> {
    envelope
        .policies
        .planner
        .as_ref()
        .and_then(|v: &Value| v.get("pinned_capabilities"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flex_types::capability::{AgentType, ContractSpec};
    use flex_types::envelope::Policies;
    use serde_json::json;

    fn sample_record(id: &str) -> CapabilityRecord {
        CapabilityRecord {
            capability_id: id.to_string(),
            version: 1,
            agent_type: AgentType::Ai,
            kind: CapabilityKind::Execution,
            display_name: id.to_string(),
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
            registered_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    fn catalog() -> Arc<FacetCatalog> {
        use flex_types::facet::{Facet, FacetDirection};
        Arc::new(FacetCatalog::new(vec![Facet {
            name: "creative_brief".to_string(),
            direction: FacetDirection::Output,
            schema: json!({"type": "string"}),
            summary: String::new(),
            version: 1,
        }]))
    }

    #[tokio::test]
    async fn register_rejects_unknown_facet() {
        let registry = CapabilityRegistry::new(catalog());
        let mut record = sample_record("strategist@1");
        record.output_facets = vec!["nonexistent".to_string()];
        let err = registry.register(record).await.unwrap_err();
        assert!(matches!(err, RegistryError::Facet(FacetCatalogError::UnknownFacet(_))));
    }

    #[tokio::test]
    async fn register_then_list_active_round_trips() {
        let registry = CapabilityRegistry::new(catalog());
        registry.register(sample_record("strategist@1")).await.unwrap();
        let active = registry.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].capability_id, "strategist@1");
    }

    #[tokio::test]
    async fn crcs_snapshot_ranks_pinned_first() {
        let registry = CapabilityRegistry::new(catalog());
        registry.register(sample_record("zeta@1")).await.unwrap();
        registry.register(sample_record("alpha@1")).await.unwrap();

        let envelope = TaskEnvelope {
            objective: "x".to_string(),
            inputs: Default::default(),
            constraints: Default::default(),
            policies: Policies {
                planner: Some(json!({"pinned_capabilities": ["zeta@1"]})),
                runtime: vec![],
            },
            special_instructions: vec![],
            metadata: Default::default(),
            output_contract: flex_types::envelope::OutputContract::Freeform,
        };

        let snapshot = registry.compute_crcs_snapshot(&envelope, &[]).await;
        assert_eq!(snapshot.rows[0].capability_id, "zeta@1");
        assert_eq!(snapshot.rows[0].reason, CrcsReason::Pinned);
    }
}
