use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

/// Engine-wide runtime config, merged from the layers below per
/// spec.md §6.5. Fields are grouped by the service that consumes them
/// rather than by layer — callers ask `ConfigStore` for `EngineConfig`,
/// never for a single layer directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_sse_concurrency")]
    pub sse_concurrency: usize,
    #[serde(default = "default_sse_max_pending")]
    pub sse_max_pending: usize,
    #[serde(default = "default_planner_timeout_ms")]
    pub planner_timeout_ms: u64,
    #[serde(default)]
    pub planner_model: Option<String>,
    #[serde(default = "default_hitl_max_requests")]
    pub hitl_max_requests: u32,
    #[serde(default = "default_human_assignment_timeout_seconds")]
    pub human_assignment_timeout_seconds: u64,
    #[serde(default)]
    pub capability_register_url: Option<String>,
    #[serde(default = "default_capability_self_register_retries")]
    pub capability_self_register_retries: u32,
    #[serde(default)]
    pub disable_capability_self_register: bool,
}

fn default_sse_concurrency() -> usize {
    4
}
fn default_sse_max_pending() -> usize {
    32
}
fn default_planner_timeout_ms() -> u64 {
    240_000
}
fn default_hitl_max_requests() -> u32 {
    3
}
fn default_human_assignment_timeout_seconds() -> u64 {
    900
}
fn default_capability_self_register_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sse_concurrency: default_sse_concurrency(),
            sse_max_pending: default_sse_max_pending(),
            planner_timeout_ms: default_planner_timeout_ms(),
            planner_model: None,
            hitl_max_requests: default_hitl_max_requests(),
            human_assignment_timeout_seconds: default_human_assignment_timeout_seconds(),
            capability_register_url: None,
            capability_self_register_retries: default_capability_self_register_retries(),
            disable_capability_self_register: false,
        }
    }
}

impl EngineConfig {
    pub fn planner_timeout(&self) -> Duration {
        Duration::from_millis(self.planner_timeout_ms)
    }

    pub fn human_assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.human_assignment_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON config store: global (`~/.config/flex/config.json` or
/// `FLEX_GLOBAL_CONFIG`) < project (the path given to `new`) < env
/// (`FLEX_*` / `SSE_*` / `HITL_*` variables) < runtime (patched at
/// process lifetime, not persisted) < cli (one-shot overrides). Later
/// layers win on conflicting keys.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let global_path = resolve_global_config_path().await?;

        let global = read_json_file(&global_path).await.unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path).await.unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        let store = Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_project().await?;
        Ok(store)
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    #[allow(dead_code)]
    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FLEX_GLOBAL_CONFIG") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("flex").join("config.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    Ok(PathBuf::from(".flex/global_config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(v) = std::env::var("SSE_CONCURRENCY") {
        if let Ok(n) = v.parse::<usize>() {
            deep_merge(&mut root, &json!({ "sse_concurrency": n }));
        }
    }
    if let Ok(v) = std::env::var("SSE_MAX_PENDING") {
        if let Ok(n) = v.parse::<usize>() {
            deep_merge(&mut root, &json!({ "sse_max_pending": n }));
        }
    }
    if let Ok(v) = std::env::var("FLEX_PLANNER_TIMEOUT_MS") {
        if let Ok(n) = v.parse::<u64>() {
            deep_merge(&mut root, &json!({ "planner_timeout_ms": n }));
        }
    }
    if let Ok(v) = std::env::var("FLEX_PLANNER_MODEL") {
        if !v.trim().is_empty() {
            deep_merge(&mut root, &json!({ "planner_model": v }));
        }
    }
    if let Ok(v) = std::env::var("HITL_MAX_REQUESTS") {
        if let Ok(n) = v.parse::<u32>() {
            deep_merge(&mut root, &json!({ "hitl_max_requests": n }));
        }
    }
    if let Ok(v) = std::env::var("FLEX_HUMAN_ASSIGNMENT_TIMEOUT_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            deep_merge(&mut root, &json!({ "human_assignment_timeout_seconds": n }));
        }
    }
    if let Ok(v) = std::env::var("FLEX_CAPABILITY_REGISTER_URL") {
        if !v.trim().is_empty() {
            deep_merge(&mut root, &json!({ "capability_register_url": v }));
        }
    }
    if let Ok(v) = std::env::var("FLEX_CAPABILITY_SELF_REGISTER_RETRIES") {
        if let Ok(n) = v.parse::<u32>() {
            deep_merge(&mut root, &json!({ "capability_self_register_retries": n }));
        }
    }
    if let Ok(v) = std::env::var("FLEX_DISABLE_CAPABILITY_SELF_REGISTER") {
        if let Some(b) = parse_bool_like(&v) {
            deep_merge(&mut root, &json!({ "disable_capability_self_register": b }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        path.push(format!("flex-core-config-{name}-{ts}.json"));
        path
    }

    #[tokio::test]
    async fn env_layer_overrides_project_defaults() {
        std::env::set_var("HITL_MAX_REQUESTS", "5");
        let path = unique_temp_file("env-override");
        let store = ConfigStore::new(&path, None).await.unwrap();
        let config = store.get().await;
        assert_eq!(config.hitl_max_requests, 5);
        std::env::remove_var("HITL_MAX_REQUESTS");
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unset_keys_fall_back_to_spec_defaults() {
        let path = unique_temp_file("defaults");
        let store = ConfigStore::new(&path, None).await.unwrap();
        let config = store.get().await;
        assert_eq!(config.hitl_max_requests, 3);
        assert_eq!(config.human_assignment_timeout_seconds, 900);
        assert_eq!(config.planner_timeout_ms, 240_000);
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn runtime_patch_wins_over_project_layer() {
        let path = unique_temp_file("runtime-patch");
        let store = ConfigStore::new(&path, None).await.unwrap();
        store
            .patch_project(json!({ "hitl_max_requests": 10 }))
            .await
            .unwrap();
        store
            .patch_runtime(json!({ "hitl_max_requests": 20 }))
            .await
            .unwrap();
        let config = store.get().await;
        assert_eq!(config.hitl_max_requests, 20);
        let _ = fs::remove_file(&path).await;
    }
}
